use crate::models::{MessageListRow, MessageRow, NewMessage};
use crate::{Database, now_ts};
use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};

const LIST_COLUMNS: &str = "m.id, m.sender_id, m.recipient_id, m.group_id, m.ciphertext, m.iv,
       m.is_edited, m.is_deleted, m.expires_at, m.reply_to_id,
       m.file_url, m.file_name, m.file_mime, m.created_at, m.updated_at,
       u.username, r.ciphertext, r.iv, ru.username";

const LIST_JOINS: &str = "LEFT JOIN users u ON m.sender_id = u.id
       LEFT JOIN messages r ON m.reply_to_id = r.id
       LEFT JOIN users ru ON r.sender_id = ru.id";

impl Database {
    pub fn insert_message(&self, msg: &NewMessage) -> Result<()> {
        let now = now_ts();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, sender_id, recipient_id, group_id, ciphertext, iv,
                                       reply_to_id, expires_at, file_url, file_name, file_mime,
                                       created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
                params![
                    msg.id,
                    msg.sender_id,
                    msg.recipient_id,
                    msg.group_id,
                    msg.ciphertext,
                    msg.iv,
                    msg.reply_to_id,
                    msg.expires_at,
                    msg.file.as_ref().map(|f| f.url),
                    msg.file.as_ref().map(|f| f.name),
                    msg.file.as_ref().map(|f| f.mime),
                    now,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, recipient_id, group_id, ciphertext, iv,
                        is_edited, is_deleted, expires_at, reply_to_id,
                        file_url, file_name, file_mime, created_at, updated_at
                 FROM messages WHERE id = ?1",
            )?;
            let row = stmt.query_row([id], map_message).optional()?;
            Ok(row)
        })
    }

    /// Re-encrypted content replaces the old; the `is_deleted = 0` guard
    /// means a concurrent delete always wins over an in-flight edit.
    /// Returns false when no live row owned by `sender_id` matched.
    pub fn edit_message(&self, id: &str, sender_id: &str, ciphertext: &str, iv: &str) -> Result<bool> {
        let now = now_ts();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages
                 SET ciphertext = ?3, iv = ?4, is_edited = 1, updated_at = ?5
                 WHERE id = ?1 AND sender_id = ?2 AND is_deleted = 0",
                params![id, sender_id, ciphertext, iv, now],
            )?;
            Ok(changed > 0)
        })
    }

    /// Soft delete: the row stays for referential integrity (replies, audit)
    /// but its content is irreversibly cleared.
    pub fn soft_delete_message(&self, id: &str, sender_id: &str) -> Result<bool> {
        let now = now_ts();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages
                 SET is_deleted = 1, deleted_at = ?3, ciphertext = '', iv = '', updated_at = ?3
                 WHERE id = ?1 AND sender_id = ?2 AND is_deleted = 0",
                params![id, sender_id, now],
            )?;
            Ok(changed > 0)
        })
    }

    /// System-initiated soft delete for ephemeral expiry. Idempotent: a
    /// message already deleted (swept, reactively expired, or removed by
    /// its sender) is left untouched.
    pub fn expire_message(&self, id: &str) -> Result<bool> {
        let now = now_ts();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages
                 SET is_deleted = 1, deleted_at = ?2, ciphertext = '', iv = '', updated_at = ?2
                 WHERE id = ?1 AND is_deleted = 0",
                params![id, now],
            )?;
            Ok(changed > 0)
        })
    }

    /// Bulk sweep: soft-delete every ephemeral message past its deadline.
    /// This is the authoritative expiry mechanism; per-message timers only
    /// improve latency and are lost on restart.
    pub fn expire_due_messages(&self, now: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages
                 SET is_deleted = 1, deleted_at = ?1, ciphertext = '', iv = '', updated_at = ?1
                 WHERE expires_at IS NOT NULL AND expires_at <= ?1 AND is_deleted = 0",
                params![now],
            )?;
            Ok(changed)
        })
    }

    /// All live messages between two users, oldest first. Expired rows are
    /// excluded by comparison against `now` even if the clearing side
    /// effect has not run yet.
    pub fn list_conversation(&self, a: &str, b: &str, now: &str) -> Result<Vec<MessageListRow>> {
        let sql = format!(
            "SELECT {LIST_COLUMNS} FROM messages m {LIST_JOINS}
             WHERE ((m.sender_id = ?1 AND m.recipient_id = ?2)
                 OR (m.sender_id = ?2 AND m.recipient_id = ?1))
               AND m.is_deleted = 0
               AND (m.expires_at IS NULL OR m.expires_at > ?3)
             ORDER BY m.created_at ASC"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![a, b, now], map_list_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_group_messages(&self, group_id: &str, now: &str) -> Result<Vec<MessageListRow>> {
        let sql = format!(
            "SELECT {LIST_COLUMNS} FROM messages m {LIST_JOINS}
             WHERE m.group_id = ?1
               AND m.is_deleted = 0
               AND (m.expires_at IS NULL OR m.expires_at > ?2)
             ORDER BY m.created_at ASC"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![group_id, now], map_list_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Candidate rows for search: the user's live direct messages, newest
    /// first, text rows only. The substring match happens post-decryption
    /// at the caller.
    pub fn search_candidates(
        &self,
        user_id: &str,
        contact_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<MessageListRow>> {
        let base = format!(
            "SELECT {LIST_COLUMNS} FROM messages m {LIST_JOINS}
             WHERE (m.sender_id = ?1 OR m.recipient_id = ?1)
               AND m.group_id IS NULL
               AND m.is_deleted = 0
               AND m.file_url IS NULL"
        );
        self.with_conn(|conn| {
            let rows = if let Some(contact) = contact_id {
                let sql = format!(
                    "{base} AND (m.sender_id = ?2 OR m.recipient_id = ?2)
                     ORDER BY m.created_at DESC LIMIT ?3"
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![user_id, contact, limit], map_list_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            } else {
                let sql = format!("{base} ORDER BY m.created_at DESC LIMIT ?2");
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![user_id, limit], map_list_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            Ok(rows)
        })
    }
}

fn map_message(row: &Row) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        recipient_id: row.get(2)?,
        group_id: row.get(3)?,
        ciphertext: row.get(4)?,
        iv: row.get(5)?,
        is_edited: row.get(6)?,
        is_deleted: row.get(7)?,
        expires_at: row.get(8)?,
        reply_to_id: row.get(9)?,
        file_url: row.get(10)?,
        file_name: row.get(11)?,
        file_mime: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn map_list_row(row: &Row) -> rusqlite::Result<MessageListRow> {
    Ok(MessageListRow {
        message: map_message(row)?,
        sender_username: row
            .get::<_, Option<String>>(15)?
            .unwrap_or_else(|| "unknown".to_string()),
        reply_ciphertext: row.get(16)?,
        reply_iv: row.get(17)?,
        reply_sender_username: row.get(18)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::models::{FileInfo, NewMessage};
    use crate::{Database, now_ts, to_ts};
    use chrono::{Duration, Utc};

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u-alice", "alice", "hash").unwrap();
        db.create_user("u-bob", "bob", "hash").unwrap();
        db
    }

    fn plain_message<'a>(id: &'a str, from: &'a str, to: &'a str) -> NewMessage<'a> {
        NewMessage {
            id,
            sender_id: from,
            recipient_id: Some(to),
            group_id: None,
            ciphertext: "aabb",
            iv: "ccdd",
            reply_to_id: None,
            expires_at: None,
            file: None,
        }
    }

    #[test]
    fn conversation_lists_both_directions_in_order() {
        let db = setup();
        db.insert_message(&plain_message("m1", "u-alice", "u-bob")).unwrap();
        db.insert_message(&plain_message("m2", "u-bob", "u-alice")).unwrap();

        let rows = db.list_conversation("u-alice", "u-bob", &now_ts()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].message.id, "m1");
        assert_eq!(rows[1].message.id, "m2");
        assert_eq!(rows[0].sender_username, "alice");
    }

    #[test]
    fn soft_delete_clears_content_and_hides_row() {
        let db = setup();
        db.insert_message(&plain_message("m1", "u-alice", "u-bob")).unwrap();

        assert!(db.soft_delete_message("m1", "u-alice").unwrap());

        let row = db.get_message("m1").unwrap().unwrap();
        assert!(row.is_deleted);
        assert_eq!(row.ciphertext, "");
        assert_eq!(row.iv, "");

        let rows = db.list_conversation("u-alice", "u-bob", &now_ts()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn delete_by_non_owner_is_a_no_op() {
        let db = setup();
        db.insert_message(&plain_message("m1", "u-alice", "u-bob")).unwrap();

        assert!(!db.soft_delete_message("m1", "u-bob").unwrap());
        assert!(!db.get_message("m1").unwrap().unwrap().is_deleted);
    }

    #[test]
    fn edit_after_delete_does_not_resurrect_content() {
        let db = setup();
        db.insert_message(&plain_message("m1", "u-alice", "u-bob")).unwrap();
        db.soft_delete_message("m1", "u-alice").unwrap();

        assert!(!db.edit_message("m1", "u-alice", "eeff", "0011").unwrap());
        let row = db.get_message("m1").unwrap().unwrap();
        assert_eq!(row.ciphertext, "");
    }

    #[test]
    fn expired_rows_are_hidden_before_the_sweep_runs() {
        let db = setup();
        let past = to_ts(Utc::now() - Duration::seconds(61));
        let mut msg = plain_message("m1", "u-alice", "u-bob");
        msg.expires_at = Some(&past);
        db.insert_message(&msg).unwrap();

        // Not yet swept: row still live in storage, but excluded from reads.
        assert!(!db.get_message("m1").unwrap().unwrap().is_deleted);
        assert!(db.list_conversation("u-alice", "u-bob", &now_ts()).unwrap().is_empty());
    }

    #[test]
    fn sweep_soft_deletes_due_messages_idempotently() {
        let db = setup();
        let past = to_ts(Utc::now() - Duration::minutes(2));
        let future = to_ts(Utc::now() + Duration::minutes(5));

        let mut due = plain_message("m1", "u-alice", "u-bob");
        due.expires_at = Some(&past);
        db.insert_message(&due).unwrap();

        let mut pending = plain_message("m2", "u-alice", "u-bob");
        pending.expires_at = Some(&future);
        db.insert_message(&pending).unwrap();

        assert_eq!(db.expire_due_messages(&now_ts()).unwrap(), 1);
        assert!(db.get_message("m1").unwrap().unwrap().is_deleted);
        assert!(!db.get_message("m2").unwrap().unwrap().is_deleted);

        // Second sweep and a racing reactive timer both find nothing to do.
        assert_eq!(db.expire_due_messages(&now_ts()).unwrap(), 0);
        assert!(!db.expire_message("m1").unwrap());
    }

    #[test]
    fn reply_preview_is_joined_into_the_listing() {
        let db = setup();
        db.insert_message(&plain_message("m1", "u-alice", "u-bob")).unwrap();
        let mut reply = plain_message("m2", "u-bob", "u-alice");
        reply.reply_to_id = Some("m1");
        db.insert_message(&reply).unwrap();

        let rows = db.list_conversation("u-alice", "u-bob", &now_ts()).unwrap();
        let reply_row = rows.iter().find(|r| r.message.id == "m2").unwrap();
        assert_eq!(reply_row.reply_ciphertext.as_deref(), Some("aabb"));
        assert_eq!(reply_row.reply_sender_username.as_deref(), Some("alice"));
    }

    #[test]
    fn search_candidates_skip_file_attachments() {
        let db = setup();
        db.insert_message(&plain_message("m1", "u-alice", "u-bob")).unwrap();
        let mut file_msg = plain_message("m2", "u-alice", "u-bob");
        file_msg.ciphertext = "FILE_ATTACHMENT";
        file_msg.iv = "";
        file_msg.file = Some(FileInfo {
            url: "/uploads/x",
            name: "x.png",
            mime: "image/png",
        });
        db.insert_message(&file_msg).unwrap();

        let rows = db.search_candidates("u-alice", None, 100).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message.id, "m1");
    }
}
