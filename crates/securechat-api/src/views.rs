//! Row-to-response assembly for the message listing endpoints: decrypt at
//! read time, resolve reply previews, group reactions.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use securechat_crypto::{FILE_ATTACHMENT_MARKER, MessageCipher};
use securechat_db::models::{MessageListRow, ReactionRow};
use securechat_types::api::{FileRef, MessageView, ReactionGroup, ReactionUser, ReplyPreview};

/// Parse a stored timestamp. Rows written by this server are RFC 3339; the
/// naive fallback covers rows imported from older dumps.
pub fn parse_ts(raw: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return naive.and_utc();
    }
    warn!("Unparseable timestamp in storage: {}", raw);
    Utc::now()
}

/// Group raw reaction rows into per-emoji summaries for one message.
pub fn group_reactions(rows: &[ReactionRow]) -> Vec<ReactionGroup> {
    let mut by_emoji: Vec<(String, Vec<ReactionUser>)> = Vec::new();

    for row in rows {
        let user_id = match row.user_id.parse::<Uuid>() {
            Ok(id) => id,
            Err(_) => continue,
        };
        let user = ReactionUser {
            id: user_id,
            username: row.username.clone(),
        };
        match by_emoji.iter_mut().find(|(emoji, _)| *emoji == row.emoji) {
            Some((_, users)) => users.push(user),
            None => by_emoji.push((row.emoji.clone(), vec![user])),
        }
    }

    by_emoji
        .into_iter()
        .map(|(emoji, users)| ReactionGroup {
            emoji,
            count: users.len(),
            users,
        })
        .collect()
}

/// Render the reply preview for a listing row. A reply target that was a
/// file attachment keeps its marker; a deleted target has empty ciphertext
/// and renders as an empty preview rather than a decryption error.
fn reply_preview(cipher: &MessageCipher, row: &MessageListRow) -> Option<ReplyPreview> {
    let reply_id = row.message.reply_to_id.as_deref()?.parse::<Uuid>().ok()?;
    let ciphertext = row.reply_ciphertext.as_deref()?;
    let iv = row.reply_iv.as_deref().unwrap_or("");

    let content = if ciphertext == FILE_ATTACHMENT_MARKER {
        FILE_ATTACHMENT_MARKER.to_string()
    } else if ciphertext.is_empty() {
        String::new()
    } else {
        cipher.decrypt_or_placeholder(ciphertext, iv)
    };

    Some(ReplyPreview {
        id: reply_id,
        content,
        sender_username: row
            .reply_sender_username
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
    })
}

/// Decrypted content plus the attachment reference, if the row carries one.
pub fn render_content(cipher: &MessageCipher, row: &MessageListRow) -> (String, Option<FileRef>) {
    if let Some(url) = &row.message.file_url {
        let file = FileRef {
            url: url.clone(),
            name: row.message.file_name.clone().unwrap_or_default(),
            mime_type: row.message.file_mime.clone().unwrap_or_default(),
        };
        return (FILE_ATTACHMENT_MARKER.to_string(), Some(file));
    }
    let content = cipher.decrypt_or_placeholder(&row.message.ciphertext, &row.message.iv);
    (content, None)
}

/// Assemble listing rows into client-facing views relative to `requester`.
/// Rows with unparseable ids are skipped with a warning, never fail the
/// whole listing.
pub fn build_message_views(
    cipher: &MessageCipher,
    rows: &[MessageListRow],
    reactions: &[ReactionRow],
    requester: Uuid,
) -> Vec<MessageView> {
    let mut reactions_by_message: HashMap<&str, Vec<ReactionRow>> = HashMap::new();
    for reaction in reactions {
        reactions_by_message
            .entry(reaction.message_id.as_str())
            .or_default()
            .push(reaction.clone());
    }

    let mut views = Vec::with_capacity(rows.len());
    for row in rows {
        let (id, sender_id) = match (
            row.message.id.parse::<Uuid>(),
            row.message.sender_id.parse::<Uuid>(),
        ) {
            (Ok(id), Ok(sender)) => (id, sender),
            _ => {
                warn!("Skipping message row with malformed id: {}", row.message.id);
                continue;
            }
        };

        let (content, file) = render_content(cipher, row);
        let message_reactions = reactions_by_message
            .get(row.message.id.as_str())
            .map(|rows| group_reactions(rows))
            .unwrap_or_default();

        views.push(MessageView {
            id,
            from_self: sender_id == requester,
            sender_id,
            sender_username: row.sender_username.clone(),
            content,
            file,
            is_edited: row.message.is_edited,
            created_at: parse_ts(&row.message.created_at),
            updated_at: parse_ts(&row.message.updated_at),
            expires_at: row.message.expires_at.as_deref().map(parse_ts),
            reply_to: reply_preview(cipher, row),
            reactions: message_reactions,
        });
    }
    views
}

#[cfg(test)]
mod tests {
    use super::*;
    use securechat_crypto::keys::generate_message_key;
    use securechat_db::models::MessageRow;

    fn cipher() -> MessageCipher {
        MessageCipher::new(generate_message_key())
    }

    fn row(cipher: &MessageCipher, id: &str, sender: Uuid, content: &str) -> MessageListRow {
        let (ciphertext, iv) = cipher.encrypt(content).unwrap();
        MessageListRow {
            message: MessageRow {
                id: id.to_string(),
                sender_id: sender.to_string(),
                recipient_id: Some(Uuid::new_v4().to_string()),
                group_id: None,
                ciphertext,
                iv,
                is_edited: false,
                is_deleted: false,
                expires_at: None,
                reply_to_id: None,
                file_url: None,
                file_name: None,
                file_mime: None,
                created_at: "2026-08-01T10:00:00.000000Z".to_string(),
                updated_at: "2026-08-01T10:00:00.000000Z".to_string(),
            },
            sender_username: "alice".to_string(),
            reply_ciphertext: None,
            reply_iv: None,
            reply_sender_username: None,
        }
    }

    #[test]
    fn views_decrypt_and_mark_ownership() {
        let cipher = cipher();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let id = Uuid::new_v4().to_string();

        let rows = vec![row(&cipher, &id, alice, "hello bob")];
        let views = build_message_views(&cipher, &rows, &[], alice);

        assert_eq!(views.len(), 1);
        assert_eq!(views[0].content, "hello bob");
        assert!(views[0].from_self);

        let views = build_message_views(&cipher, &rows, &[], bob);
        assert!(!views[0].from_self);
    }

    #[test]
    fn file_rows_render_the_marker_and_reference() {
        let cipher = cipher();
        let alice = Uuid::new_v4();
        let id = Uuid::new_v4().to_string();

        let mut file_row = row(&cipher, &id, alice, FILE_ATTACHMENT_MARKER);
        file_row.message.file_url = Some("/uploads/abc_photo.png".to_string());
        file_row.message.file_name = Some("photo.png".to_string());
        file_row.message.file_mime = Some("image/png".to_string());

        let views = build_message_views(&cipher, &[file_row], &[], alice);
        assert_eq!(views[0].content, FILE_ATTACHMENT_MARKER);
        let file = views[0].file.as_ref().unwrap();
        assert_eq!(file.url, "/uploads/abc_photo.png");
        assert_eq!(file.mime_type, "image/png");
    }

    #[test]
    fn reactions_group_by_emoji() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let rows = vec![
            ReactionRow {
                id: "r1".into(),
                message_id: "m1".into(),
                user_id: alice.to_string(),
                username: "alice".into(),
                emoji: "👍".into(),
                created_at: String::new(),
            },
            ReactionRow {
                id: "r2".into(),
                message_id: "m1".into(),
                user_id: bob.to_string(),
                username: "bob".into(),
                emoji: "👍".into(),
                created_at: String::new(),
            },
            ReactionRow {
                id: "r3".into(),
                message_id: "m1".into(),
                user_id: bob.to_string(),
                username: "bob".into(),
                emoji: "🎉".into(),
                created_at: String::new(),
            },
        ];

        let groups = group_reactions(&rows);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].emoji, "👍");
        assert_eq!(groups[0].count, 2);
        assert_eq!(groups[1].count, 1);
    }

    #[test]
    fn deleted_reply_target_renders_empty_preview() {
        let cipher = cipher();
        let alice = Uuid::new_v4();
        let id = Uuid::new_v4().to_string();

        let mut reply_row = row(&cipher, &id, alice, "replying");
        reply_row.message.reply_to_id = Some(Uuid::new_v4().to_string());
        reply_row.reply_ciphertext = Some(String::new());
        reply_row.reply_iv = Some(String::new());
        reply_row.reply_sender_username = Some("bob".to_string());

        let views = build_message_views(&cipher, &[reply_row], &[], alice);
        let preview = views[0].reply_to.as_ref().unwrap();
        assert_eq!(preview.content, "");
        assert_eq!(preview.sender_username, "bob");
    }

    #[test]
    fn parse_ts_accepts_both_stored_formats() {
        let rfc = parse_ts("2026-08-01T10:00:00.000000Z");
        assert_eq!(rfc.timestamp(), 1_785_578_400);

        let naive = parse_ts("2026-08-01 10:00:00");
        assert_eq!(naive, rfc);
    }
}
