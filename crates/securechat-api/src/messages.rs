use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use securechat_db::{Database, now_ts, to_ts};
use securechat_moderation::{BLOCK_THRESHOLD, WARN_THRESHOLD, security_tips};
use securechat_types::api::{
    Claims, EditMessageRequest, MessageView, SearchHit, SearchQuery, SearchResponse,
    SendMessageRequest, SendMessageResponse,
};
use securechat_types::events::GatewayEvent;
use securechat_types::moderation::{Analysis, ModerationAction};

use crate::error::ApiError;
use crate::state::AppState;
use crate::views;

pub const MAX_MESSAGE_LEN: usize = 4096;

/// Edits are only allowed this long after the original send.
pub const EDIT_WINDOW: chrono::Duration = chrono::Duration::minutes(5);

const SEARCH_CANDIDATE_LIMIT: u32 = 100;

/// The classifier verdict for one outbound message, after thresholding.
pub struct GateOutcome {
    pub analysis: Analysis,
    pub warned: bool,
}

/// Run the moderation gate over outbound content. A score at or above the
/// block threshold rejects the send (and logs the attempt without a message
/// id); the warn band lets the message through flagged.
pub async fn run_moderation_gate(
    state: &AppState,
    sender: Uuid,
    content: &str,
) -> Result<GateOutcome, ApiError> {
    let analysis = state.classifier.classify(content).await;

    if analysis.risk_score >= BLOCK_THRESHOLD {
        info!(
            "Blocked message from {} (risk score {})",
            sender, analysis.risk_score
        );
        log_moderation(state, None, sender, &analysis, ModerationAction::Blocked);
        let tips = security_tips(&analysis);
        return Err(ApiError::RiskBlocked {
            analysis: Box::new(analysis),
            security_tips: tips,
        });
    }

    Ok(GateOutcome {
        warned: analysis.risk_score >= WARN_THRESHOLD,
        analysis,
    })
}

/// Append the audit row off the request path. Logging failures are reported
/// but never fail the send itself.
pub fn log_moderation(
    state: &AppState,
    message_id: Option<Uuid>,
    sender: Uuid,
    analysis: &Analysis,
    action: ModerationAction,
) {
    let db = state.db.clone();
    let analysis_json = serde_json::to_string(analysis).unwrap_or_else(|_| "{}".to_string());
    let score = analysis.risk_score;
    tokio::task::spawn_blocking(move || {
        if let Err(e) = db.insert_moderation_log(
            &Uuid::new_v4().to_string(),
            message_id.map(|id| id.to_string()).as_deref(),
            &sender.to_string(),
            score,
            &analysis_json,
            action,
        ) {
            warn!("Failed to write moderation log entry: {:#}", e);
        }
    });
}

/// Arm a per-message expiry timer. Best effort: the timer is lost on
/// restart, the periodic sweep remains authoritative.
pub fn arm_expiry_timer(db: Arc<Database>, message_id: Uuid, expires_at: DateTime<Utc>) {
    let delay = (expires_at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let id = message_id.to_string();
        let result = tokio::task::spawn_blocking(move || db.expire_message(&id)).await;
        match result {
            Ok(Ok(true)) => debug!("Ephemeral message {} expired on schedule", message_id),
            Ok(Ok(false)) => {} // already gone
            Ok(Err(e)) => warn!("Expiry of message {} failed: {:#}", message_id, e),
            Err(e) => warn!("Expiry task for message {} panicked: {}", message_id, e),
        }
    });
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = req.content.trim();
    if content.is_empty() {
        return Err(ApiError::validation("message content must not be empty"));
    }
    if content.len() > MAX_MESSAGE_LEN {
        return Err(ApiError::validation("message content is too long"));
    }
    if req.to == claims.sub {
        return Err(ApiError::validation("cannot send a message to yourself"));
    }
    // TTL arithmetic is checked: a huge minute count must come back as a
    // validation error, not overflow.
    let expires_at = match req.expires_in_minutes {
        Some(minutes) => {
            if minutes <= 0 {
                return Err(ApiError::validation("expires_in_minutes must be positive"));
            }
            let ttl = chrono::Duration::try_minutes(minutes)
                .ok_or_else(|| ApiError::validation("expires_in_minutes is out of range"))?;
            let deadline = Utc::now()
                .checked_add_signed(ttl)
                .ok_or_else(|| ApiError::validation("expires_in_minutes is out of range"))?;
            Some(deadline)
        }
        None => None,
    };

    let db = state.db.clone();
    let recipient_id = req.to.to_string();
    let recipient = tokio::task::spawn_blocking(move || db.get_user_by_id(&recipient_id))
        .await
        .map_err(anyhow::Error::from)??;
    if recipient.is_none() {
        return Err(ApiError::not_found("recipient does not exist"));
    }

    // A reply target must be a live message of this same conversation.
    if let Some(reply_to) = req.reply_to {
        verify_reply_target(&state, reply_to, claims.sub, Some(req.to), None).await?;
    }

    let gate = run_moderation_gate(&state, claims.sub, content).await?;

    let (ciphertext, iv) = state.cipher.encrypt(content)?;
    let message_id = Uuid::new_v4();

    let db = state.db.clone();
    let sender_id = claims.sub.to_string();
    let recipient_id = req.to.to_string();
    let reply_to_id = req.reply_to.map(|id| id.to_string());
    let expires_ts = expires_at.map(to_ts);
    tokio::task::spawn_blocking(move || {
        db.insert_message(&securechat_db::models::NewMessage {
            id: &message_id.to_string(),
            sender_id: &sender_id,
            recipient_id: Some(&recipient_id),
            group_id: None,
            ciphertext: &ciphertext,
            iv: &iv,
            reply_to_id: reply_to_id.as_deref(),
            expires_at: expires_ts.as_deref(),
            file: None,
        })
    })
    .await
    .map_err(anyhow::Error::from)??;

    let action = if gate.warned {
        ModerationAction::Warned
    } else {
        ModerationAction::Allowed
    };
    log_moderation(&state, Some(message_id), claims.sub, &gate.analysis, action);

    if let Some(expires_at) = expires_at {
        arm_expiry_timer(state.db.clone(), message_id, expires_at);
    }

    // Notify both ends; the sender's other devices refresh too.
    let event = GatewayEvent::MessageReceive { from: claims.sub };
    state.dispatcher.send_to_user(req.to, event.clone()).await;
    state.dispatcher.send_to_user(claims.sub, event).await;

    let tips = if gate.warned {
        security_tips(&gate.analysis)
    } else {
        Vec::new()
    };
    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            message_id,
            expires_at,
            warning: gate.warned,
            analysis: gate.warned.then_some(gate.analysis),
            security_tips: tips,
        }),
    ))
}

pub async fn list_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(peer_id): Path<Uuid>,
) -> Result<Json<Vec<MessageView>>, ApiError> {
    let db = state.db.clone();
    let me = claims.sub.to_string();
    let peer = peer_id.to_string();
    let (rows, reactions) = tokio::task::spawn_blocking(move || {
        let rows = db.list_conversation(&me, &peer, &now_ts())?;
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

pub async fn edit_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let content = req.content.trim();
    if content.is_empty() {
        return Err(ApiError::validation("message content must not be empty"));
    }
    if content.len() > MAX_MESSAGE_LEN {
        return Err(ApiError::validation("message content is too long"));
    }

    let row = fetch_live_message(&state, message_id).await?;
    if row.sender_id != claims.sub.to_string() {
        return Err(ApiError::forbidden("only the sender can edit a message"));
    }

    let sent_at = views::parse_ts(&row.created_at);
    if Utc::now() - sent_at > EDIT_WINDOW {
        return Err(ApiError::validation(
            "messages can only be edited within 5 minutes of sending",
        ));
    }

    let (ciphertext, iv) = state.cipher.encrypt(content)?;
    let db = state.db.clone();
    let sender = claims.sub.to_string();
    let id = message_id.to_string();
    let changed =
        tokio::task::spawn_blocking(move || db.edit_message(&id, &sender, &ciphertext, &iv))
            .await
            .map_err(anyhow::Error::from)??;
    if !changed {
        // Deleted (or expired) between the read and the update.
        return Err(ApiError::not_found("message not found"));
    }

    notify_conversation(
        &state,
        &row,
        GatewayEvent::MessageEdit {
            message_id,
            from: claims.sub,
        },
    )
    .await;

    Ok(Json(serde_json::json!({ "edited": true })))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let row = fetch_live_message(&state, message_id).await?;
    if row.sender_id != claims.sub.to_string() {
        return Err(ApiError::forbidden("only the sender can delete a message"));
    }

    let db = state.db.clone();
    let sender = claims.sub.to_string();
    let id = message_id.to_string();
    let changed = tokio::task::spawn_blocking(move || db.soft_delete_message(&id, &sender))
        .await
        .map_err(anyhow::Error::from)??;
    if !changed {
        return Err(ApiError::not_found("message not found"));
    }

    notify_conversation(
        &state,
        &row,
        GatewayEvent::MessageDelete {
            message_id,
            from: claims.sub,
        },
    )
    .await;

    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// Substring search over the requester's direct messages. Content is
/// encrypted at rest, so candidates are decrypted and matched here rather
/// than in SQL.
pub async fn search_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, ApiError> {
    let needle = query.q.trim().to_lowercase();
    if needle.chars().count() < 2 {
        return Ok(Json(SearchResponse {
            messages: vec![],
            count: 0,
        }));
    }

    let db = state.db.clone();
    let me = claims.sub.to_string();
    let contact = query.contact_id.map(|id| id.to_string());
    let rows = tokio::task::spawn_blocking(move || {
        db.search_candidates(&me, contact.as_deref(), SEARCH_CANDIDATE_LIMIT)
    })
    .await
    .map_err(anyhow::Error::from)??;

    let me = claims.sub.to_string();
    let mut hits = Vec::new();
    for row in &rows {
        let content = state
            .cipher
            .decrypt_or_placeholder(&row.message.ciphertext, &row.message.iv);
        if !content.to_lowercase().contains(&needle) {
            continue;
        }

        let from_self = row.message.sender_id == me;
        let other = if from_self {
            row.message.recipient_id.as_deref()
        } else {
            Some(row.message.sender_id.as_str())
        };
        let (Ok(id), Some(Ok(conversation_with))) = (
            row.message.id.parse::<Uuid>(),
            other.map(|o| o.parse::<Uuid>()),
        ) else {
            continue;
        };

        let views = views::build_message_views(
            &state.cipher,
            std::slice::from_ref(row),
            &[],
            claims.sub,
        );
        let reply_to = views.into_iter().next().and_then(|v| v.reply_to);

        hits.push(SearchHit {
            id,
            content,
            from_self,
            is_edited: row.message.is_edited,
            created_at: views::parse_ts(&row.message.created_at),
            conversation_with,
            reply_to,
        });
    }

    let count = hits.len();
    Ok(Json(SearchResponse {
        messages: hits,
        count,
    }))
}

/// Load a message that is still visible: exists, not soft-deleted, not past
/// its expiry deadline.
pub async fn fetch_live_message(
    state: &AppState,
    message_id: Uuid,
) -> Result<securechat_db::models::MessageRow, ApiError> {
    let db = state.db.clone();
    let id = message_id.to_string();
    let row = tokio::task::spawn_blocking(move || db.get_message(&id))
        .await
        .map_err(anyhow::Error::from)??
        .ok_or_else(|| ApiError::not_found("message not found"))?;

    if row.is_deleted {
        return Err(ApiError::not_found("message not found"));
    }
    if let Some(expires_at) = &row.expires_at {
        if *expires_at <= now_ts() {
            return Err(ApiError::not_found("message not found"));
        }
    }
    Ok(row)
}

/// A reply target must be live and belong to the same conversation (direct
/// peer or group) as the message being sent.
pub async fn verify_reply_target(
    state: &AppState,
    reply_to: Uuid,
    sender: Uuid,
    peer: Option<Uuid>,
    group: Option<Uuid>,
) -> Result<(), ApiError> {
    let target = fetch_live_message(state, reply_to).await.map_err(|_| {
        ApiError::validation("reply target does not exist or is no longer available")
    })?;

    let ok = match (peer, group) {
        (Some(peer), None) => {
            let pair = [sender.to_string(), peer.to_string()];
            target.group_id.is_none()
                && pair.contains(&target.sender_id)
                && target
                    .recipient_id
                    .as_ref()
                    .is_some_and(|r| pair.contains(r))
        }
        (None, Some(group)) => target.group_id.as_deref() == Some(&group.to_string()),
        _ => false,
    };

    if !ok {
        return Err(ApiError::validation(
            "reply target belongs to a different conversation",
        ));
    }
    Ok(())
}

/// Notify everyone who can see a direct or group message.
async fn notify_conversation(
    state: &AppState,
    row: &securechat_db::models::MessageRow,
    event: GatewayEvent,
) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppStateInner;
    use securechat_crypto::MessageCipher;
    use securechat_crypto::keys::generate_message_key;
    use securechat_db::models::NewMessage;
    use securechat_gateway::Dispatcher;
    use securechat_moderation::RiskClassifier;

    fn test_state() -> AppState {
        Arc::new(AppStateInner {
            db: Arc::new(Database::open_in_memory().unwrap()),
            cipher: MessageCipher::new(generate_message_key()),
            classifier: RiskClassifier::heuristic_only(),
            dispatcher: Dispatcher::new(),
            jwt_secret: "test-secret".to_string(),
            uploads_dir: std::env::temp_dir(),
        })
    }

    fn user(state: &AppState, name: &str) -> Claims {
        let id = Uuid::new_v4();
        state.db.create_user(&id.to_string(), name, "hash").unwrap();
        Claims {
            sub: id,
            username: name.to_string(),
            exp: 0,
        }
    }

    fn insert_direct(state: &AppState, from: &Claims, to: &Claims, content: &str) -> Uuid {
        let (ciphertext, iv) = state.cipher.encrypt(content).unwrap();
        let id = Uuid::new_v4();
        state
            .db
            .insert_message(&NewMessage {
                id: &id.to_string(),
                sender_id: &from.sub.to_string(),
                recipient_id: Some(&to.sub.to_string()),
                group_id: None,
                ciphertext: &ciphertext,
                iv: &iv,
                reply_to_id: None,
                expires_at: None,
                file: None,
            })
            .unwrap();
        id
    }

    fn backdate(state: &AppState, message_id: Uuid, minutes: i64) {
        let ts = to_ts(Utc::now() - chrono::Duration::minutes(minutes));
        let id = message_id.to_string();
        state
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE messages SET created_at = ?1, updated_at = ?1 WHERE id = ?2",
                    (ts.as_str(), id.as_str()),
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn blocked_message_is_never_persisted() {
        let state = test_state();
        let alice = user(&state, "alice");
        let bob = user(&state, "bob");

        let result = send_message(
            State(state.clone()),
            Extension(alice.clone()),
            Json(SendMessageRequest {
                to: bob.sub,
                content: "Free money! Click here now!".to_string(),
                expires_in_minutes: None,
                reply_to: None,
            }),
        )
        .await;

        assert!(matches!(result, Err(ApiError::RiskBlocked { .. })));
        let rows = state
            .db
            .list_conversation(&alice.sub.to_string(), &bob.sub.to_string(), &now_ts())
            .unwrap();
        assert!(rows.is_empty());

        // The attempt is still on the audit trail, without a message id.
        // The log write is detached from the request path, so poll for it.
        let log = await_moderation_log(&state, &alice.sub.to_string()).await;
        assert_eq!(log.len(), 1);
        assert!(log[0].blocked);
        assert_eq!(log[0].message_id, None);
    }

    async fn await_moderation_log(
        state: &AppState,
        sender: &str,
    ) -> Vec<securechat_db::models::ModerationLogRow> {
        for _ in 0..100 {
            let log = state.db.list_moderation_log(sender).unwrap();
            if !log.is_empty() {
                return log;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("moderation log entry never appeared");
    }

    #[tokio::test]
    async fn out_of_range_ttl_is_rejected_with_a_validation_error() {
        let state = test_state();
        let alice = user(&state, "alice");
        let bob = user(&state, "bob");

        for minutes in [i64::MAX, i64::MAX / 2] {
            let result = send_message(
                State(state.clone()),
                Extension(alice.clone()),
                Json(SendMessageRequest {
                    to: bob.sub,
                    content: "see you in a while".to_string(),
                    expires_in_minutes: Some(minutes),
                    reply_to: None,
                }),
            )
            .await;

            assert!(matches!(result, Err(ApiError::Validation(_))));
        }

        let rows = state
            .db
            .list_conversation(&alice.sub.to_string(), &bob.sub.to_string(), &now_ts())
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn edit_past_the_window_is_rejected() {
        let state = test_state();
        let alice = user(&state, "alice");
        let bob = user(&state, "bob");

        let message_id = insert_direct(&state, &alice, &bob, "original");
        backdate(&state, message_id, 6);

        let result = edit_message(
            State(state.clone()),
            Extension(alice),
            Path(message_id),
            Json(EditMessageRequest {
                content: "revised".to_string(),
            }),
        )
        .await;

        assert!(matches!(result, Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn only_the_sender_can_edit_or_delete() {
        let state = test_state();
        let alice = user(&state, "alice");
        let bob = user(&state, "bob");

        let message_id = insert_direct(&state, &alice, &bob, "mine");

        let edit = edit_message(
            State(state.clone()),
            Extension(bob.clone()),
            Path(message_id),
            Json(EditMessageRequest {
                content: "hijacked".to_string(),
            }),
        )
        .await;
        assert!(matches!(edit, Err(ApiError::Forbidden(_))));

        let delete = delete_message(State(state.clone()), Extension(bob), Path(message_id)).await;
        assert!(matches!(delete, Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn edit_inside_the_window_updates_the_content() {
        let state = test_state();
        let alice = user(&state, "alice");
        let bob = user(&state, "bob");

        let message_id = insert_direct(&state, &alice, &bob, "original");

        edit_message(
            State(state.clone()),
            Extension(alice.clone()),
            Path(message_id),
            Json(EditMessageRequest {
                content: "revised".to_string(),
            }),
        )
        .await
        .unwrap();

        let row = state.db.get_message(&message_id.to_string()).unwrap().unwrap();
        assert!(row.is_edited);
        assert_eq!(
            state.cipher.decrypt(&row.ciphertext, &row.iv).unwrap(),
            "revised"
        );
    }

    #[tokio::test]
    async fn search_matches_post_decryption() {
        let state = test_state();
        let alice = user(&state, "alice");
        let bob = user(&state, "bob");

        insert_direct(&state, &alice, &bob, "let's grab coffee tomorrow");
        insert_direct(&state, &bob, &alice, "sounds good");

        let result = search_messages(
            State(state.clone()),
            Extension(alice.clone()),
            Query(SearchQuery {
                q: "COFFEE".to_string(),
                contact_id: None,
            }),
        )
        .await
        .unwrap();

        assert_eq!(result.0.count, 1);
        assert_eq!(result.0.messages[0].content, "let's grab coffee tomorrow");
        assert!(result.0.messages[0].from_self);
        assert_eq!(result.0.messages[0].conversation_with, bob.sub);
    }

    #[tokio::test]
    async fn search_minimum_length_counts_characters_not_bytes() {
        let state = test_state();
        let alice = user(&state, "alice");
        let bob = user(&state, "bob");

        insert_direct(&state, &alice, &bob, "café around the corner?");

        // One character, two bytes: still below the two-character minimum.
        let result = search_messages(
            State(state.clone()),
            Extension(alice.clone()),
            Query(SearchQuery {
                q: "é".to_string(),
                contact_id: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(result.0.count, 0);

        let result = search_messages(
            State(state.clone()),
            Extension(alice),
            Query(SearchQuery {
                q: "fé".to_string(),
                contact_id: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(result.0.count, 1);
    }
}
