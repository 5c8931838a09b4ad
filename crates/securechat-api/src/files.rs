use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use bytes::Bytes;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use securechat_crypto::FILE_ATTACHMENT_MARKER;
use securechat_types::api::{Claims, FileRef, UploadResponse};
use securechat_types::events::GatewayEvent;

use crate::error::ApiError;
use crate::state::AppState;

/// Upload cap, matches the client-side limit.
const MAX_FILE_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub filename: String,
    pub mime: Option<String>,
}

/// Store the uploaded bytes and record an attachment message to `peer_id`.
/// The message row carries the attachment marker instead of ciphertext;
/// file bytes themselves are stored as-is on disk.
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(peer_id): Path<Uuid>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if body.is_empty() {
        return Err(ApiError::validation("file must not be empty"));
    }
    if body.len() > MAX_FILE_SIZE {
        return Err(ApiError::validation("file exceeds the 5 MB limit"));
    }
    if peer_id == claims.sub {
        return Err(ApiError::validation("cannot send a file to yourself"));
    }

    let db = state.db.clone();
    let recipient_id = peer_id.to_string();
    let recipient = tokio::task::spawn_blocking(move || db.get_user_by_id(&recipient_id))
        .await
        .map_err(anyhow::Error::from)??;
    if recipient.is_none() {
        return Err(ApiError::not_found("recipient does not exist"));
    }

    let original_name = sanitize_filename(&query.filename);
    if original_name.is_empty() {
        return Err(ApiError::validation("filename must not be empty"));
    }
    let stored_name = format!("{}_{}", Uuid::new_v4(), original_name);
    let mime = query
        .mime
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let path = state.uploads_dir.join(&stored_name);
    tokio::fs::write(&path, &body)
        .await
        .map_err(|e| anyhow::anyhow!("failed to store upload: {}", e))?;

    let file = FileRef {
        url: format!("/uploads/{}", stored_name),
        name: original_name,
        mime_type: mime,
    };

    let message_id = Uuid::new_v4();
    let db = state.db.clone();
    let sender_id = claims.sub.to_string();
    let recipient_id = peer_id.to_string();
    let file_for_row = file.clone();
    tokio::task::spawn_blocking(move || {
        db.insert_message(&securechat_db::models::NewMessage {
            id: &message_id.to_string(),
            sender_id: &sender_id,
            recipient_id: Some(&recipient_id),
            group_id: None,
            ciphertext: FILE_ATTACHMENT_MARKER,
            iv: "",
            reply_to_id: None,
            expires_at: None,
            file: Some(securechat_db::models::FileInfo {
                url: &file_for_row.url,
                name: &file_for_row.name,
                mime: &file_for_row.mime_type,
            }),
        })
    })
    .await
    .map_err(anyhow::Error::from)??;

    info!(
        "{} uploaded {} ({} bytes) for {}",
        claims.username,
        file.name,
        body.len(),
        peer_id
    );

    let event = GatewayEvent::FileReceived { from: claims.sub };
    state.dispatcher.send_to_user(peer_id, event.clone()).await;
    state.dispatcher.send_to_user(claims.sub, event).await;

    Ok((StatusCode::CREATED, Json(UploadResponse { message_id, file })))
}

/// Serve a stored upload. The name is a server-generated `{uuid}_{name}`,
/// but the traversal guard holds regardless of what the client sends.
pub async fn download_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(ApiError::validation("invalid file name"));
    }

    let path = state.uploads_dir.join(&name);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found("file not found"));
        }
        Err(e) => return Err(anyhow::anyhow!("failed to read upload: {}", e).into()),
    };

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

/// Keep only a conservative character set; everything else becomes '_'.
/// The result never contains a path separator or a ".." sequence, so the
/// download guard will accept what the upload path produced.
fn sanitize_filename(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .replace("..", "__")
        .trim_matches('.')
        .to_string()
}
