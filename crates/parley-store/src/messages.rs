use async_trait::async_trait;
use rusqlite::OptionalExtension;
use tracing::instrument;

use parley_core::ids::{GroupId, MessageId, UserId};
use parley_core::messages::{Message, MessageStatus, Recipient};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::traits::MessageStore;

const COLUMNS: &str = "id, sender_id, receiver_id, group_id, type, content, status, timestamp";

/// SQLite-backed message table.
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, message), fields(message_id = %message.id))]
    pub fn insert(&self, message: &Message) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO messages (id, sender_id, receiver_id, group_id, type, content, status, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    message.id.as_str(),
                    message.sender_id.as_str(),
                    message.receiver_id().map(UserId::as_str),
                    message.group_id().map(GroupId::as_str),
                    message.kind.as_str(),
                    message.content,
                    message.status.as_str(),
                    message.timestamp,
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("message {} already exists", message.id)));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(message_id = %id))]
    pub fn get(&self, id: &MessageId) -> Result<Message, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_message(row),
                None => Err(StoreError::NotFound(format!("message {id}"))),
            }
        })
    }

    #[instrument(skip(self), fields(user_id = %user))]
    pub fn list_for_receiver(
        &self,
        user: &UserId,
        after: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM messages
                 WHERE receiver_id = ?1 AND (?2 IS NULL OR id > ?2)
                 ORDER BY timestamp ASC, id ASC LIMIT ?3"
            ))?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let mut rows = stmt.query(rusqlite::params![
                user.as_str(),
                after.map(MessageId::as_str),
                limit,
            ])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    /// Read-check-write under the connection lock, so concurrent updates
    /// cannot move a status backwards.
    #[instrument(skip(self), fields(message_id = %id, status = %status))]
    pub fn advance_status(&self, id: &MessageId, status: MessageStatus) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let current: Option<String> = conn
                .query_row("SELECT status FROM messages WHERE id = ?1", [id.as_str()], |row| {
                    row.get(0)
                })
                .optional()?;
            let Some(current) = current else {
                return Err(StoreError::NotFound(format!("message {id}")));
            };
            let current: MessageStatus = row_helpers::parse_enum(&current, "messages", "status")?;
            if !current.can_advance_to(status) {
                return Ok(false);
            }
            conn.execute(
                "UPDATE messages SET status = ?1 WHERE id = ?2",
                rusqlite::params![status.as_str(), id.as_str()],
            )?;
            Ok(true)
        })
    }
}

#[async_trait]
impl MessageStore for MessageRepo {
    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        self.insert(message)
    }

    async fn get_message(&self, id: &MessageId) -> Result<Message, StoreError> {
        self.get(id)
    }

    async fn list_undelivered(
        &self,
        user: &UserId,
        after: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        self.list_for_receiver(user, after, limit)
    }

    async fn update_status(&self, id: &MessageId, status: MessageStatus) -> Result<bool, StoreError> {
        self.advance_status(id, status)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let receiver_id: Option<String> = row_helpers::get(row, 2, "messages", "receiver_id")?;
    let group_id: Option<String> = row_helpers::get(row, 3, "messages", "group_id")?;
    let recipient = match (receiver_id, group_id) {
        (Some(user), None) => Recipient::User(UserId::from_raw(user)),
        (None, Some(group)) => Recipient::Group(GroupId::from_raw(group)),
        _ => {
            return Err(StoreError::CorruptRow {
                table: "messages",
                column: "receiver_id",
                detail: "expected exactly one of receiver_id and group_id".into(),
            })
        }
    };
    let kind: String = row_helpers::get(row, 4, "messages", "type")?;
    let status: String = row_helpers::get(row, 6, "messages", "status")?;

    Ok(Message {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        sender_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "messages", "sender_id")?),
        recipient,
        kind: row_helpers::parse_enum(&kind, "messages", "type")?,
        content: row_helpers::get(row, 5, "messages", "content")?,
        status: row_helpers::parse_enum(&status, "messages", "status")?,
        timestamp: row_helpers::get(row, 7, "messages", "timestamp")?,
    })
}
