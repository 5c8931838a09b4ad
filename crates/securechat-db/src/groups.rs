use crate::models::{GroupMemberRow, GroupRow};
use crate::{Database, now_ts};
use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};
use securechat_types::api::GroupRole;

impl Database {
    /// Create a group with its creator seeded as ADMIN.
    pub fn create_group(
        &self,
        id: &str,
        name: &str,
        description: &str,
        created_by: &str,
    ) -> Result<()> {
        let now = now_ts();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO groups (id, name, description, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, name, description, created_by, now],
            )?;
            conn.execute(
                "INSERT INTO group_members (group_id, user_id, role, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, created_by, GroupRole::Admin.as_str(), now],
            )?;
            Ok(())
        })
    }

    pub fn get_group(&self, id: &str) -> Result<Option<GroupRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, created_by, created_at FROM groups WHERE id = ?1",
            )?;
            let row = stmt.query_row([id], map_group).optional()?;
            Ok(row)
        })
    }

    /// The membership row for (group, user), if any. Absence is a hard
    /// authorization failure at the call sites, never a silent filter.
    pub fn get_membership(&self, group_id: &str, user_id: &str) -> Result<Option<GroupRole>> {
        self.with_conn(|conn| {
            let role: Option<String> = conn
                .query_row(
                    "SELECT role FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                    params![group_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(role.and_then(|r| GroupRole::parse(&r)))
        })
    }

    /// Returns false when the user was already a member.
    pub fn add_group_member(&self, group_id: &str, user_id: &str, role: GroupRole) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id, role, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![group_id, user_id, role.as_str(), now_ts()],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn remove_group_member(&self, group_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, user_id],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn set_member_role(&self, group_id: &str, user_id: &str, role: GroupRole) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE group_members SET role = ?3 WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, user_id, role.as_str()],
            )?;
            Ok(())
        })
    }

    /// Members of a group, longest-standing first.
    pub fn list_group_members(&self, group_id: &str) -> Result<Vec<GroupMemberRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT gm.group_id, gm.user_id, u.username, gm.role, gm.joined_at
                 FROM group_members gm
                 LEFT JOIN users u ON gm.user_id = u.id
                 WHERE gm.group_id = ?1
                 ORDER BY gm.joined_at ASC",
            )?;
            let rows = stmt
                .query_map([group_id], map_member)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_user_groups(&self, user_id: &str) -> Result<Vec<GroupRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT g.id, g.name, g.description, g.created_by, g.created_at
                 FROM groups g
                 JOIN group_members gm ON gm.group_id = g.id
                 WHERE gm.user_id = ?1
                 ORDER BY g.created_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], map_group)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn map_group(row: &Row) -> rusqlite::Result<GroupRow> {
    Ok(GroupRow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_by: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn map_member(row: &Row) -> rusqlite::Result<GroupMemberRow> {
    Ok(GroupMemberRow {
        group_id: row.get(0)?,
        user_id: row.get(1)?,
        username: row
            .get::<_, Option<String>>(2)?
            .unwrap_or_else(|| "unknown".to_string()),
        role: row.get(3)?,
        joined_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u-alice", "alice", "hash").unwrap();
        db.create_user("u-bob", "bob", "hash").unwrap();
        db.create_user("u-carol", "carol", "hash").unwrap();
        db
    }

    #[test]
    fn creator_is_seeded_as_admin() {
        let db = setup();
        db.create_group("g1", "team", "", "u-alice").unwrap();

        assert_eq!(
            db.get_membership("g1", "u-alice").unwrap(),
            Some(GroupRole::Admin)
        );
        assert_eq!(db.get_membership("g1", "u-bob").unwrap(), None);
    }

    #[test]
    fn adding_an_existing_member_is_ignored() {
        let db = setup();
        db.create_group("g1", "team", "", "u-alice").unwrap();

        assert!(db.add_group_member("g1", "u-bob", GroupRole::Member).unwrap());
        assert!(!db.add_group_member("g1", "u-bob", GroupRole::Member).unwrap());
        assert_eq!(db.list_group_members("g1").unwrap().len(), 2);
    }

    #[test]
    fn members_are_listed_longest_standing_first() {
        let db = setup();
        db.create_group("g1", "team", "", "u-alice").unwrap();
        db.add_group_member("g1", "u-bob", GroupRole::Member).unwrap();
        db.add_group_member("g1", "u-carol", GroupRole::Member).unwrap();

        let members = db.list_group_members("g1").unwrap();
        assert_eq!(members[0].user_id, "u-alice");
        assert_eq!(members[1].user_id, "u-bob");
        assert_eq!(members[2].user_id, "u-carol");
    }

    #[test]
    fn user_groups_reflect_membership() {
        let db = setup();
        db.create_group("g1", "team", "", "u-alice").unwrap();
        db.create_group("g2", "other", "", "u-bob").unwrap();
        db.add_group_member("g2", "u-alice", GroupRole::Member).unwrap();

        let groups = db.list_user_groups("u-alice").unwrap();
        assert_eq!(groups.len(), 2);

        let groups = db.list_user_groups("u-carol").unwrap();
        assert!(groups.is_empty());
    }
}
