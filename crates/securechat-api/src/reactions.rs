use axum::{
    Extension, Json,
    extract::{Path, State},
};
use uuid::Uuid;

use securechat_db::models::MessageRow;
use securechat_types::api::{Claims, ReactionGroup, ToggleReactionRequest, ToggleReactionResponse};
use securechat_types::events::GatewayEvent;

use crate::error::ApiError;
use crate::messages::fetch_live_message;
use crate::state::AppState;
use crate::views;

/// Only people who can see a message may react to it: either participant of
/// a direct conversation, or any member of the group.
async fn authorize_reader(
    state: &AppState,
    row: &MessageRow,
    user: Uuid,
) -> Result<(), ApiError> {
    let uid = user.to_string();
    if row.sender_id == uid || row.recipient_id.as_deref() == Some(uid.as_str()) {
        return Ok(());
    }

    if let Some(group_id) = row.group_id.clone() {
        let db = state.db.clone();
        let membership = tokio::task::spawn_blocking(move || db.get_membership(&group_id, &uid))
            .await
            .map_err(anyhow::Error::from)??;
        if membership.is_some() {
            return Ok(());
        }
    }

    Err(ApiError::forbidden("you cannot react to this message"))
}

pub async fn toggle_reaction(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
    Json(req): Json<ToggleReactionRequest>,
) -> Result<Json<ToggleReactionResponse>, ApiError> {
    let emoji = req.emoji.trim();
    if emoji.is_empty() || emoji.chars().count() > 8 {
        return Err(ApiError::validation("emoji must be a short non-empty string"));
    }

    let row = fetch_live_message(&state, message_id).await?;
    authorize_reader(&state, &row, claims.sub).await?;

    let db = state.db.clone();
    let user = claims.sub.to_string();
    let id = message_id.to_string();
    let emoji_owned = emoji.to_string();
    let added = tokio::task::spawn_blocking(move || {
        db.toggle_reaction(&Uuid::new_v4().to_string(), &id, &user, &emoji_owned)
    })
    .await
    .map_err(anyhow::Error::from)??;

    notify(&state, &row, message_id).await;

    Ok(Json(ToggleReactionResponse {
        action: if added { "added" } else { "removed" },
    }))
}

pub async fn list_reactions(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
) -> Result<Json<Vec<ReactionGroup>>, ApiError> {
    let row = fetch_live_message(&state, message_id).await?;
    authorize_reader(&state, &row, claims.sub).await?;

    let db = state.db.clone();
    let id = message_id.to_string();
    let rows = tokio::task::spawn_blocking(move || db.get_reactions_for_message(&id))
        .await
        .map_err(anyhow::Error::from)??;

    Ok(Json(views::group_reactions(&rows)))
}

/// Reaction changes are notification-only; clients re-fetch the summary.
async fn notify(state: &AppState, row: &MessageRow, message_id: Uuid) {
    let event = GatewayEvent::ReactionUpdate { message_id };

    if let Some(group_id) = row.group_id.as_deref().and_then(|g| g.parse::<Uuid>().ok()) {
        state.dispatcher.send_to_group(group_id, event).await;
        return;
    }
    if let Ok(sender) = row.sender_id.parse::<Uuid>() {
        state.dispatcher.send_to_user(sender, event.clone()).await;
    }
    if let Some(recipient) = row
        .recipient_id
        .as_deref()
        .and_then(|r| r.parse::<Uuid>().ok())
    {
        state.dispatcher.send_to_user(recipient, event).await;
    }
}
