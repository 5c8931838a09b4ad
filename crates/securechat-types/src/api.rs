use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::moderation::Analysis;

// -- JWT Claims --

/// JWT claims shared between the REST middleware and the WebSocket gateway.
/// Canonical definition lives here to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub to: Uuid,
    pub content: String,
    /// Ephemeral TTL; the message is treated as deleted once it elapses.
    pub expires_in_minutes: Option<i64>,
    /// Link this message as a reply to an existing one in the same conversation.
    pub reply_to: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Set when the classifier scored the message in the warn band. The
    /// message was persisted and delivered, but the client should surface
    /// the analysis to the sender.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub warning: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_tips: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendGroupMessageRequest {
    pub content: String,
    pub reply_to: Option<Uuid>,
}

/// A file attachment reference carried by FILE_ATTACHMENT messages.
/// Only a path reference plus declared metadata, never raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    pub url: String,
    pub name: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyPreview {
    pub id: Uuid,
    pub content: String,
    pub sender_username: String,
}

/// A message as returned by the listing endpoints: decrypted at read time,
/// annotated relative to the requester.
#[derive(Debug, Serialize)]
pub struct MessageView {
    pub id: Uuid,
    pub from_self: bool,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRef>,
    pub is_edited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
    pub reactions: Vec<ReactionGroup>,
}

// -- Search --

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    /// Restrict the search to the conversation with one contact.
    pub contact_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SearchHit {
    pub id: Uuid,
    pub content: String,
    pub from_self: bool,
    pub is_edited: bool,
    pub created_at: DateTime<Utc>,
    /// The other participant of the conversation this hit belongs to.
    pub conversation_with: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub messages: Vec<SearchHit>,
    pub count: usize,
}

// -- Reactions --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Serialize)]
pub struct ToggleReactionResponse {
    /// "added" or "removed".
    pub action: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReactionUser {
    pub id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub users: Vec<ReactionUser>,
}

// -- Moderation --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalyzeRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub analysis: Analysis,
    pub security_tips: Vec<String>,
}

// -- Groups --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupRole {
    Admin,
    Moderator,
    Member,
}

impl GroupRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupRole::Admin => "ADMIN",
            GroupRole::Moderator => "MODERATOR",
            GroupRole::Member => "MEMBER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ADMIN" => Some(GroupRole::Admin),
            "MODERATOR" => Some(GroupRole::Moderator),
            "MEMBER" => Some(GroupRole::Member),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub member_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddMembersRequest {
    pub member_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct GroupMemberView {
    pub user_id: Uuid,
    pub username: String,
    pub role: GroupRole,
}

#[derive(Debug, Serialize)]
pub struct GroupView {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub members: Vec<GroupMemberView>,
}

// -- Files --

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message_id: Uuid,
    pub file: FileRef,
}
