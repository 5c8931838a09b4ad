use crate::models::ReactionRow;
use crate::{Database, now_ts};
use anyhow::Result;
use rusqlite::{ErrorCode, OptionalExtension, params};

impl Database {
    /// Toggle a reaction: removes the (message, user, emoji) row if it
    /// exists, inserts it otherwise. Returns true when the reaction was
    /// added.
    ///
    /// The unique constraint on the triple is the synchronization point: a
    /// duplicate insert racing in from a rapid double-click resolves as
    /// "already added" rather than an error.
    pub fn toggle_reaction(
        &self,
        id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                    params![message_id, user_id, emoji],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing_id) = existing {
                conn.execute("DELETE FROM reactions WHERE id = ?1", [&existing_id])?;
                return Ok(false);
            }

            let inserted = conn.execute(
                "INSERT INTO reactions (id, message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, message_id, user_id, emoji, now_ts()],
            );

            match inserted {
                Ok(_) => Ok(true),
                // Lost a race against an identical insert: the reaction is
                // active either way.
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Ok(true)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_reactions_for_message(&self, message_id: &str) -> Result<Vec<ReactionRow>> {
        self.get_reactions_for_messages(&[message_id.to_string()])
    }

    /// Batch-fetch reactions (with usernames) for a set of message IDs.
    pub fn get_reactions_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT r.id, r.message_id, r.user_id, u.username, r.emoji, r.created_at
                 FROM reactions r
                 LEFT JOIN users u ON r.user_id = u.id
                 WHERE r.message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let bind: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(bind.as_slice(), |row| {
                    Ok(ReactionRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        user_id: row.get(2)?,
                        username: row
                            .get::<_, Option<String>>(3)?
                            .unwrap_or_else(|| "unknown".to_string()),
                        emoji: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}
