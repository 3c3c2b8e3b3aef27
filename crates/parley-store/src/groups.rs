use async_trait::async_trait;
use tracing::instrument;

use parley_core::groups::{Group, Membership};
use parley_core::ids::{GroupId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::traits::GroupStore;

/// SQLite-backed groups and membership relation.
pub struct GroupRepo {
    db: Database,
}

impl GroupRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, group, members), fields(group_id = %group.id, members = members.len()))]
    pub fn create(&self, group: &Group, members: &[Membership]) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO groups (id, name, description, owner_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    group.id.as_str(),
                    group.name,
                    group.description,
                    group.owner_id.as_str(),
                    group.created_at,
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("group {} already exists", group.id)));
            }
            for m in members {
                tx.execute(
                    "INSERT OR IGNORE INTO group_members (group_id, user_id, role, joined_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![m.group_id.as_str(), m.user_id.as_str(), m.role.as_str(), m.joined_at],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(group_id = %id))]
    pub fn get(&self, id: &GroupId) -> Result<Group, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, owner_id, created_at FROM groups WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Group {
                    id: GroupId::from_raw(row_helpers::get::<String>(row, 0, "groups", "id")?),
                    name: row_helpers::get(row, 1, "groups", "name")?,
                    description: row_helpers::get(row, 2, "groups", "description")?,
                    owner_id: UserId::from_raw(row_helpers::get::<String>(row, 3, "groups", "owner_id")?),
                    created_at: row_helpers::get(row, 4, "groups", "created_at")?,
                }),
                None => Err(StoreError::NotFound(format!("group {id}"))),
            }
        })
    }

    #[instrument(skip(self, membership), fields(group_id = %membership.group_id, user_id = %membership.user_id))]
    pub fn add(&self, membership: &Membership) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id, role, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    membership.group_id.as_str(),
                    membership.user_id.as_str(),
                    membership.role.as_str(),
                    membership.joined_at,
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    #[instrument(skip(self), fields(group_id = %group, user_id = %user))]
    pub fn remove(&self, group: &GroupId, user: &UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                [group.as_str(), user.as_str()],
            )?;
            Ok(removed > 0)
        })
    }

    pub fn contains(&self, group: &GroupId, user: &UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                [group.as_str(), user.as_str()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    #[instrument(skip(self), fields(group_id = %group))]
    pub fn members(&self, group: &GroupId) -> Result<Vec<Membership>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT group_id, user_id, role, joined_at FROM group_members
                 WHERE group_id = ?1 ORDER BY joined_at ASC, user_id ASC",
            )?;
            let mut rows = stmt.query([group.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let role: String = row_helpers::get(row, 2, "group_members", "role")?;
                results.push(Membership {
                    group_id: GroupId::from_raw(row_helpers::get::<String>(row, 0, "group_members", "group_id")?),
                    user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "group_members", "user_id")?),
                    role: row_helpers::parse_enum(&role, "group_members", "role")?,
                    joined_at: row_helpers::get(row, 3, "group_members", "joined_at")?,
                });
            }
            Ok(results)
        })
    }
}

#[async_trait]
impl GroupStore for GroupRepo {
    async fn create_group(&self, group: &Group, members: &[Membership]) -> Result<(), StoreError> {
        self.create(group, members)
    }

    async fn get_group(&self, id: &GroupId) -> Result<Group, StoreError> {
        self.get(id)
    }

    async fn add_member(&self, membership: &Membership) -> Result<bool, StoreError> {
        self.add(membership)
    }

    async fn remove_member(&self, group: &GroupId, user: &UserId) -> Result<bool, StoreError> {
        self.remove(group, user)
    }

    async fn is_member(&self, group: &GroupId, user: &UserId) -> Result<bool, StoreError> {
        self.contains(group, user)
    }

    async fn list_members(&self, group: &GroupId) -> Result<Vec<Membership>, StoreError> {
        self.members(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::groups::Role;

    fn group(id: &str) -> Group {
        Group {
            id: GroupId::from_raw(id),
            name: "team".into(),
            description: String::new(),
            owner_id: UserId::from_raw("alice"),
            created_at: 1,
        }
    }

    fn member(group: &str, user: &str, role: Role, joined_at: i64) -> Membership {
        Membership {
            group_id: GroupId::from_raw(group),
            user_id: UserId::from_raw(user),
            role,
            joined_at,
        }
    }

    #[test]
    fn create_with_members() {
        let repo = GroupRepo::new(Database::in_memory().unwrap());
        repo.create(
            &group("grp_1"),
            &[member("grp_1", "alice", Role::Owner, 1), member("grp_1", "bob", Role::Member, 2)],
        )
        .unwrap();

        assert_eq!(repo.get(&GroupId::from_raw("grp_1")).unwrap().name, "team");
        let members = repo.members(&GroupId::from_raw("grp_1")).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].role, Role::Owner);
    }

    #[test]
    fn create_twice_conflicts() {
        let repo = GroupRepo::new(Database::in_memory().unwrap());
        repo.create(&group("grp_1"), &[]).unwrap();
        assert!(matches!(repo.create(&group("grp_1"), &[]), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn membership_is_unique_per_pair() {
        let repo = GroupRepo::new(Database::in_memory().unwrap());
        repo.create(&group("grp_1"), &[]).unwrap();
        let m = member("grp_1", "bob", Role::Member, 5);
        assert!(repo.add(&m).unwrap());
        assert!(!repo.add(&m).unwrap());
        assert!(repo.contains(&m.group_id, &m.user_id).unwrap());

        assert!(repo.remove(&m.group_id, &m.user_id).unwrap());
        assert!(!repo.remove(&m.group_id, &m.user_id).unwrap());
        assert!(!repo.contains(&m.group_id, &m.user_id).unwrap());
    }

    #[test]
    fn member_of_missing_group_rejected() {
        let repo = GroupRepo::new(Database::in_memory().unwrap());
        let res = repo.add(&member("ghost", "bob", Role::Member, 1));
        assert!(matches!(res, Err(StoreError::Database(_))));
    }

    #[test]
    fn get_missing_group() {
        let repo = GroupRepo::new(Database::in_memory().unwrap());
        assert!(matches!(repo.get(&GroupId::from_raw("nope")), Err(StoreError::NotFound(_))));
    }
}
