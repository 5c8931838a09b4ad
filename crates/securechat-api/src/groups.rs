use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{info, warn};
use uuid::Uuid;

use securechat_db::now_ts;
use securechat_moderation::security_tips;
use securechat_types::api::{
    AddMembersRequest, Claims, CreateGroupRequest, GroupMemberView, GroupRole, GroupView,
    MessageView, SendGroupMessageRequest, SendMessageResponse,
};
use securechat_types::events::GatewayEvent;
use securechat_types::moderation::ModerationAction;

use crate::error::ApiError;
use crate::messages::{
    MAX_MESSAGE_LEN, log_moderation, run_moderation_gate, verify_reply_target,
};
use crate::state::AppState;
use crate::views;

pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim();
    if name.is_empty() || name.len() > 64 {
        return Err(ApiError::validation("group name must be 1-64 characters"));
    }

    let group_id = Uuid::new_v4();
    let db = state.db.clone();
    let creator = claims.sub.to_string();
    let name_owned = name.to_string();
    let description = req.description.trim().to_string();
    tokio::task::spawn_blocking(move || {
        db.create_group(&group_id.to_string(), &name_owned, &description, &creator)
    })
    .await
    .map_err(anyhow::Error::from)??;

    // Seed the initial member list; unknown ids are skipped, not fatal.
    for member_id in req.member_ids.iter().filter(|id| **id != claims.sub) {
        if let Err(e) = add_member_row(&state, group_id, *member_id).await {
            warn!(
                "Skipping initial member {} of group {}: {:#}",
                member_id, group_id, e
            );
        }
    }

    info!("{} created group {} ({})", claims.username, name, group_id);
    post_system_message(
        &state,
        group_id,
        claims.sub,
        &format!("{} created the group \"{}\"", claims.username, name),
    )
    .await?;

    let view = load_group_view(&state, group_id).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn list_my_groups(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<GroupView>>, ApiError> {
    let db = state.db.clone();
    let me = claims.sub.to_string();
    let groups = tokio::task::spawn_blocking(move || db.list_user_groups(&me))
        .await
        .map_err(anyhow::Error::from)??;

    let mut views = Vec::with_capacity(groups.len());
    for group in groups {
        let Ok(id) = group.id.parse::<Uuid>() else {
            continue;
        };
        views.push(load_group_view(&state, id).await?);
    }
    Ok(Json(views))
}

pub async fn list_group_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<Vec<MessageView>>, ApiError> {
    require_membership(&state, group_id, claims.sub).await?;

    let db = state.db.clone();
    let gid = group_id.to_string();
    let (rows, reactions) = tokio::task::spawn_blocking(move || {
        let rows = db.list_group_messages(&gid, &now_ts())?;
        let ids: Vec<String> = rows.iter().map(|r| r.message.id.clone()).collect();
        let reactions = db.get_reactions_for_messages(&ids)?;
        anyhow::Ok((rows, reactions))
    })
    .await
    .map_err(anyhow::Error::from)??;

    Ok(Json(views::build_message_views(
        &state.cipher,
        &rows,
        &reactions,
        claims.sub,
    )))
}

pub async fn send_group_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<Uuid>,
    Json(req): Json<SendGroupMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_membership(&state, group_id, claims.sub).await?;

    let content = req.content.trim();
    if content.is_empty() {
        return Err(ApiError::validation("message content must not be empty"));
    }
    if content.len() > MAX_MESSAGE_LEN {
        return Err(ApiError::validation("message content is too long"));
    }

    if let Some(reply_to) = req.reply_to {
        verify_reply_target(&state, reply_to, claims.sub, None, Some(group_id)).await?;
    }

    let gate = run_moderation_gate(&state, claims.sub, content).await?;

    let message_id =
        persist_group_message(&state, group_id, claims.sub, content, req.reply_to).await?;

    let action = if gate.warned {
        ModerationAction::Warned
    } else {
        ModerationAction::Allowed
    };
    log_moderation(&state, Some(message_id), claims.sub, &gate.analysis, action);

    state
        .dispatcher
        .send_to_group(
            group_id,
            GatewayEvent::GroupMessageReceive {
                group_id,
                from: claims.sub,
            },
        )
        .await;

    let tips = if gate.warned {
        security_tips(&gate.analysis)
    } else {
        Vec::new()
    };
    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            message_id,
            expires_at: None,
            warning: gate.warned,
            analysis: gate.warned.then_some(gate.analysis),
            security_tips: tips,
        }),
    ))
}

pub async fn add_members(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<Uuid>,
    Json(req): Json<AddMembersRequest>,
) -> Result<Json<GroupView>, ApiError> {
    let role = require_membership(&state, group_id, claims.sub).await?;
    if role != GroupRole::Admin {
        return Err(ApiError::forbidden("only admins can add members"));
    }
    if req.member_ids.is_empty() {
        return Err(ApiError::validation("member_ids must not be empty"));
    }

    let mut added_names = Vec::new();
    for member_id in &req.member_ids {
        match add_member_row(&state, group_id, *member_id).await {
            Ok(Some(username)) => added_names.push(username),
            Ok(None) => {} // already a member
            Err(e) => warn!(
                "Skipping member {} for group {}: {:#}",
                member_id, group_id, e
            ),
        }
    }

    if !added_names.is_empty() {
        post_system_message(
            &state,
            group_id,
            claims.sub,
            &format!(
                "{} added {} to the group",
                claims.username,
                added_names.join(", ")
            ),
        )
        .await?;
    }

    let view = load_group_view(&state, group_id).await?;
    Ok(Json(view))
}

pub async fn leave_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_membership(&state, group_id, claims.sub).await?;

    let db = state.db.clone();
    let gid = group_id.to_string();
    let me = claims.sub.to_string();
    tokio::task::spawn_blocking(move || db.remove_group_member(&gid, &me))
        .await
        .map_err(anyhow::Error::from)??;

    // A group must not end up admin-less while it still has members: the
    // longest-standing remaining member inherits the role.
    let db = state.db.clone();
    let gid = group_id.to_string();
    let members = tokio::task::spawn_blocking(move || db.list_group_members(&gid))
        .await
        .map_err(anyhow::Error::from)??;

    if !members.is_empty() && !members.iter().any(|m| m.role == GroupRole::Admin.as_str()) {
        let heir = &members[0];
        info!(
            "Promoting {} to admin of group {} after the last admin left",
            heir.username, group_id
        );
        let db = state.db.clone();
        let gid = group_id.to_string();
        let heir_id = heir.user_id.clone();
        tokio::task::spawn_blocking(move || db.set_member_role(&gid, &heir_id, GroupRole::Admin))
            .await
            .map_err(anyhow::Error::from)??;
    }

    if !members.is_empty() {
        post_system_message(
            &state,
            group_id,
            claims.sub,
            &format!("{} left the group", claims.username),
        )
        .await?;
    }

    Ok(Json(serde_json::json!({ "left": true })))
}

async fn require_membership(
    state: &AppState,
    group_id: Uuid,
    user: Uuid,
) -> Result<GroupRole, ApiError> {
    let db = state.db.clone();
    let gid = group_id.to_string();
    let uid = user.to_string();
    tokio::task::spawn_blocking(move || db.get_membership(&gid, &uid))
        .await
        .map_err(anyhow::Error::from)??
        .ok_or_else(|| ApiError::forbidden("you are not a member of this group"))
}

/// Add one user to a group. Returns the username when a row was inserted,
/// None when they were already a member, an error for unknown users.
async fn add_member_row(
    state: &AppState,
    group_id: Uuid,
    member_id: Uuid,
) -> anyhow::Result<Option<String>> {
    let db = state.db.clone();
    let gid = group_id.to_string();
    let uid = member_id.to_string();
    tokio::task::spawn_blocking(move || {
        let user = db
            .get_user_by_id(&uid)?
            .ok_or_else(|| anyhow::anyhow!("user does not exist"))?;
        let added = db.add_group_member(&gid, &uid, GroupRole::Member)?;
        Ok(added.then_some(user.username))
    })
    .await?
}

async fn load_group_view(state: &AppState, group_id: Uuid) -> Result<GroupView, ApiError> {
    let db = state.db.clone();
    let gid = group_id.to_string();
    let (group, members) = tokio::task::spawn_blocking(move || {
        let group = db.get_group(&gid)?;
        let members = db.list_group_members(&gid)?;
        anyhow::Ok((group, members))
    })
    .await
    .map_err(anyhow::Error::from)??;

    let group = group.ok_or_else(|| ApiError::not_found("group not found"))?;

    let members = members
        .into_iter()
        .filter_map(|m| {
            Some(GroupMemberView {
                user_id: m.user_id.parse().ok()?,
                username: m.username,
                role: GroupRole::parse(&m.role)?,
            })
        })
        .collect();

    Ok(GroupView {
        id: group_id,
        name: group.name,
        description: group.description,
        created_by: group
            .created_by
            .parse()
            .map_err(|e| anyhow::anyhow!("stored creator id is not a uuid: {}", e))?,
        created_at: views::parse_ts(&group.created_at),
        members,
    })
}

/// Server-authored announcements ("X joined") go through the same encrypt
/// and persist path as ordinary messages but skip the moderation gate.
async fn post_system_message(
    state: &AppState,
    group_id: Uuid,
    actor: Uuid,
    text: &str,
) -> Result<(), ApiError> {
    persist_group_message(state, group_id, actor, text, None).await?;
    state
        .dispatcher
        .send_to_group(
            group_id,
            GatewayEvent::GroupMessageReceive {
                group_id,
                from: actor,
            },
        )
        .await;
    Ok(())
}

async fn persist_group_message(
    state: &AppState,
    group_id: Uuid,
    sender: Uuid,
    content: &str,
    reply_to: Option<Uuid>,
) -> Result<Uuid, ApiError> {
    let (ciphertext, iv) = state.cipher.encrypt(content)?;
    let message_id = Uuid::new_v4();

    let db = state.db.clone();
    let gid = group_id.to_string();
    let sender_id = sender.to_string();
    let reply_to_id = reply_to.map(|id| id.to_string());
    tokio::task::spawn_blocking(move || {
        db.insert_message(&securechat_db::models::NewMessage {
            id: &message_id.to_string(),
            sender_id: &sender_id,
            recipient_id: None,
            group_id: Some(&gid),
            ciphertext: &ciphertext,
            iv: &iv,
            reply_to_id: reply_to_id.as_deref(),
            expires_at: None,
            file: None,
        })
    })
    .await
    .map_err(anyhow::Error::from)??;

    Ok(message_id)
}
