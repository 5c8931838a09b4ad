use crate::models::ModerationLogRow;
use crate::{Database, now_ts};
use anyhow::Result;
use rusqlite::params;
use securechat_types::moderation::ModerationAction;

impl Database {
    /// Append one audit row per classified send. `message_id` is None for
    /// sends blocked before persistence.
    pub fn insert_moderation_log(
        &self,
        id: &str,
        message_id: Option<&str>,
        sender_id: &str,
        risk_score: u8,
        analysis_json: &str,
        action: ModerationAction,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO moderation_log
                     (id, message_id, sender_id, risk_score, analysis, action, blocked, warned, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    message_id,
                    sender_id,
                    risk_score as i64,
                    analysis_json,
                    action.as_str(),
                    action == ModerationAction::Blocked,
                    action == ModerationAction::Warned,
                    now_ts(),
                ],
            )?;
            Ok(())
        })
    }

    /// Audit trail for one sender, newest first. Consumed by the (external)
    /// admin aggregation views.
    pub fn list_moderation_log(&self, sender_id: &str) -> Result<Vec<ModerationLogRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, message_id, sender_id, risk_score, analysis, action,
                        blocked, warned, created_at
                 FROM moderation_log
                 WHERE sender_id = ?1
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map([sender_id], |row| {
                    Ok(ModerationLogRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        sender_id: row.get(2)?,
                        risk_score: row.get(3)?,
                        analysis: row.get(4)?,
                        action: row.get(5)?,
                        blocked: row.get(6)?,
                        warned: row.get(7)?,
                        created_at: row.get(8)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_sends_log_without_a_message_id() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u-mallory", "mallory", "hash").unwrap();

        db.insert_moderation_log("l1", None, "u-mallory", 90, "{}", ModerationAction::Blocked)
            .unwrap();

        let rows = db.list_moderation_log("u-mallory").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].blocked);
        assert!(!rows[0].warned);
        assert_eq!(rows[0].message_id, None);
        assert_eq!(rows[0].risk_score, 90);
    }
}
