use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use shared::domain::{
    GroupId, GroupSummary, MessageId, MessageStatus, RoomId, UserId, UserSummary,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub room: RoomId,
    pub content: String,
    pub is_file: bool,
    pub status: MessageStatus,
    pub client_offset: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

/// A message as handed to the store, before an id has been assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub room: RoomId,
    pub content: String,
    pub is_file: bool,
    pub status: MessageStatus,
    pub client_offset: Option<String>,
    pub created_at: DateTime<Utc>,
}

const MESSAGE_COLUMNS: &str =
    "id, from_user, room, content, is_file, msg_status, client_offset, created_at, edited_at";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to `sqlite::memory:` opens its own database, so the
        // pool must hold exactly one connection that never gets recycled.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Inserts the user or returns the existing id for `username`. A non-empty
    /// `name` replaces the stored display name.
    pub async fn create_user(&self, username: &str, name: &str) -> Result<UserId> {
        let username = username.trim();
        if username.is_empty() {
            return Err(anyhow!("username cannot be empty"));
        }
        let display_name = Some(name.trim()).filter(|n| !n.is_empty());
        let rec = sqlx::query(
            "INSERT INTO users (username, name) VALUES (?, COALESCE(?, ?))
             ON CONFLICT(username) DO UPDATE SET name = COALESCE(?, users.name)
             RETURNING id",
        )
        .bind(username)
        .bind(display_name)
        .bind(username)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user(&self, user_id: UserId) -> Result<Option<UserSummary>> {
        let row = sqlx::query("SELECT id, username, name FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserSummary {
            id: UserId(r.get::<i64, _>(0)),
            username: r.get::<String, _>(1),
            name: r.get::<String, _>(2),
        }))
    }

    pub async fn list_users_except(&self, user_id: UserId) -> Result<Vec<UserSummary>> {
        let rows = sqlx::query(
            "SELECT id, username, name FROM users WHERE id != ? ORDER BY lower(username) ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| UserSummary {
                id: UserId(r.get::<i64, _>(0)),
                username: r.get::<String, _>(1),
                name: r.get::<String, _>(2),
            })
            .collect())
    }

    /// Creates a group with `admin_id` as admin and member, plus `member_ids`,
    /// in a single transaction.
    pub async fn create_group(
        &self,
        name: &str,
        admin_id: UserId,
        member_ids: &[UserId],
    ) -> Result<GroupId> {
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query("INSERT INTO chat_groups (name, admin_id) VALUES (?, ?) RETURNING id")
            .bind(name)
            .bind(admin_id.0)
            .fetch_one(&mut *tx)
            .await
            .context("failed to insert group")?;
        let group_id = GroupId(rec.get::<i64, _>(0));

        for user_id in member_ids.iter().chain(std::iter::once(&admin_id)) {
            sqlx::query(
                "INSERT INTO group_members (group_id, user_id) VALUES (?, ?)
                 ON CONFLICT(group_id, user_id) DO NOTHING",
            )
            .bind(group_id.0)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to add user {user_id} to group {group_id}"))?;
        }

        tx.commit().await?;
        Ok(group_id)
    }

    pub async fn add_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_members (group_id, user_id) VALUES (?, ?)
             ON CONFLICT(group_id, user_id) DO NOTHING",
        )
        .bind(group_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(group_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_groups_for_user(&self, user_id: UserId) -> Result<Vec<GroupSummary>> {
        let rows = sqlx::query(
            "SELECT g.id, g.name, g.admin_id
             FROM chat_groups g
             INNER JOIN group_members gm ON gm.group_id = g.id
             WHERE gm.user_id = ?
             ORDER BY g.id ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| GroupSummary {
                group_id: GroupId(r.get::<i64, _>(0)),
                group_name: r.get::<String, _>(1),
                admin_id: UserId(r.get::<i64, _>(2)),
            })
            .collect())
    }

    pub async fn group_ids_for_user(&self, user_id: UserId) -> Result<HashSet<GroupId>> {
        let rows = sqlx::query("SELECT group_id FROM group_members WHERE user_id = ?")
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| GroupId(r.get::<i64, _>(0)))
            .collect())
    }

    pub async fn group_admin(&self, group_id: GroupId) -> Result<Option<UserId>> {
        let row = sqlx::query("SELECT admin_id FROM chat_groups WHERE id = ?")
            .bind(group_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserId(r.get::<i64, _>(0))))
    }

    pub async fn insert_message(&self, message: &NewMessage) -> Result<MessageId> {
        let rec = sqlx::query(
            "INSERT INTO messages (from_user, room, content, is_file, msg_status, client_offset, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(message.sender_id.0)
        .bind(message.room.to_string())
        .bind(&message.content)
        .bind(message.is_file)
        .bind(message.status.as_str())
        .bind(message.client_offset.as_deref())
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(MessageId(rec.get::<i64, _>(0)))
    }

    /// All messages of `room` in ascending id order, optionally only those
    /// newer than `after`.
    pub async fn list_room_messages(
        &self,
        room: RoomId,
        after: Option<MessageId>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE room = ? AND id > ?
             ORDER BY id ASC"
        ))
        .bind(room.to_string())
        .bind(after.map(|id| id.0).unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(stored_message_from_row).collect()
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(stored_message_from_row).transpose()
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Moves the message to `status` only if that is a forward transition.
    /// Returns whether the row changed.
    pub async fn advance_message_status(
        &self,
        message_id: MessageId,
        status: MessageStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages
             SET msg_status = ?
             WHERE id = ?
               AND (CASE msg_status WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 ELSE 2 END) < ?",
        )
        .bind(status.as_str())
        .bind(message_id.0)
        .bind(status.rank())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn edit_message(
        &self,
        message_id: MessageId,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "UPDATE messages SET content = ?, edited_at = ? WHERE id = ? RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(content)
        .bind(edited_at)
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(stored_message_from_row).transpose()
    }
}

fn stored_message_from_row(r: &SqliteRow) -> Result<StoredMessage> {
    let room_raw = r.get::<String, _>(2);
    let room = room_raw
        .parse::<RoomId>()
        .with_context(|| format!("stored message has invalid room '{room_raw}'"))?;
    let status = r
        .get::<String, _>(5)
        .parse::<MessageStatus>()
        .map_err(|e| anyhow!(e))?;
    Ok(StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        sender_id: UserId(r.get::<i64, _>(1)),
        room,
        content: r.get::<String, _>(3),
        is_file: r.get::<bool, _>(4),
        status,
        client_offset: r.get::<Option<String>, _>(6),
        created_at: r.get::<DateTime<Utc>, _>(7),
        edited_at: r.get::<Option<DateTime<Utc>>, _>(8),
    })
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
