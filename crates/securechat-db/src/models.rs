/// Database row types mapping directly to SQLite rows.
/// Distinct from securechat-types API models to keep the DB layer
/// independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: Option<String>,
    pub group_id: Option<String>,
    pub ciphertext: String,
    pub iv: String,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub expires_at: Option<String>,
    pub reply_to_id: Option<String>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_mime: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A message joined with its sender and resolved reply target, as the
/// listing queries return it.
pub struct MessageListRow {
    pub message: MessageRow,
    pub sender_username: String,
    pub reply_ciphertext: Option<String>,
    pub reply_iv: Option<String>,
    pub reply_sender_username: Option<String>,
}

#[derive(Clone)]
pub struct ReactionRow {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub username: String,
    pub emoji: String,
    pub created_at: String,
}

pub struct GroupRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_by: String,
    pub created_at: String,
}

pub struct GroupMemberRow {
    pub group_id: String,
    pub user_id: String,
    pub username: String,
    pub role: String,
    pub joined_at: String,
}

pub struct ModerationLogRow {
    pub id: String,
    pub message_id: Option<String>,
    pub sender_id: String,
    pub risk_score: i64,
    pub analysis: String,
    pub action: String,
    pub blocked: bool,
    pub warned: bool,
    pub created_at: String,
}

/// Insert parameters for a new message row.
pub struct NewMessage<'a> {
    pub id: &'a str,
    pub sender_id: &'a str,
    pub recipient_id: Option<&'a str>,
    pub group_id: Option<&'a str>,
    pub ciphertext: &'a str,
    pub iv: &'a str,
    pub reply_to_id: Option<&'a str>,
    pub expires_at: Option<&'a str>,
    pub file: Option<FileInfo<'a>>,
}

pub struct FileInfo<'a> {
    pub url: &'a str,
    pub name: &'a str,
    pub mime: &'a str,
}
