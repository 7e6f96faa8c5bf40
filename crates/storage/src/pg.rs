use crate::{
    CallRecord, CallTransition, ConversationRecord, Datastore, MessageRecord, ReadReceiptRecord,
    StorageError, UserRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use palaver_proto::{CallStatus, MessageStatus};
use std::str::FromStr;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, Row};

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");

/// Datastore backed by PostgreSQL.
pub struct PgDatastore {
    client: Client,
    _pg_task: JoinHandle<()>,
}

/// Establishes the connection and spawns its driver task.
pub async fn connect(postgres_dsn: &str) -> Result<PgDatastore, StorageError> {
    let (client, connection) = tokio_postgres::connect(postgres_dsn, NoTls)
        .await
        .map_err(|_| StorageError::Postgres)?;
    let task = tokio::spawn(async move {
        if let Err(err) = connection.await {
            eprintln!("postgres connection error: {}", err);
        }
    });
    Ok(PgDatastore {
        client,
        _pg_task: task,
    })
}

impl PgDatastore {
    /// Applies embedded migrations.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        self.client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    pub async fn readiness(&self) -> Result<(), StorageError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }
}

fn user_from_row(row: &Row) -> UserRecord {
    UserRecord {
        id: row.get(0),
        email: row.get(1),
        name: row.get(2),
        avatar: row.get(3),
        status: row.get(4),
        is_online: row.get(5),
        last_seen: row.get(6),
    }
}

fn message_from_row(row: &Row) -> Result<MessageRecord, StorageError> {
    let kind: String = row.get(4);
    let status: String = row.get(5);
    Ok(MessageRecord {
        id: row.get(0),
        conversation_id: row.get(1),
        sender_id: row.get(2),
        content: row.get(3),
        kind: FromStr::from_str(&kind).map_err(|_| StorageError::Serialization)?,
        status: FromStr::from_str(&status).map_err(|_| StorageError::Serialization)?,
        created_at: row.get(6),
        edited_at: row.get(7),
        deleted_at: row.get(8),
    })
}

fn call_from_row(row: &Row) -> Result<CallRecord, StorageError> {
    let kind: String = row.get(3);
    let status: String = row.get(4);
    Ok(CallRecord {
        id: row.get(0),
        caller_id: row.get(1),
        receiver_id: row.get(2),
        kind: FromStr::from_str(&kind).map_err(|_| StorageError::Serialization)?,
        status: FromStr::from_str(&status).map_err(|_| StorageError::Serialization)?,
        started_at: row.get(5),
        ended_at: row.get(6),
        duration_secs: row.get(7),
    })
}

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, content, kind, status, created_at, edited_at, deleted_at";
const CALL_COLUMNS: &str =
    "id, caller_id, receiver_id, kind, status, started_at, ended_at, duration_secs";

#[async_trait]
impl Datastore for PgDatastore {
    async fn create_user(&self, user: &UserRecord) -> Result<(), StorageError> {
        self.client
            .execute(
                "INSERT INTO app_user (id, email, name, avatar, status, is_online, last_seen)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO UPDATE SET email = $2, name = $3, avatar = $4",
                &[
                    &user.id,
                    &user.email,
                    &user.name,
                    &user.avatar,
                    &user.status,
                    &user.is_online,
                    &user.last_seen,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    async fn load_user(&self, user_id: &str) -> Result<UserRecord, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT id, email, name, avatar, status, is_online, last_seen
                FROM app_user WHERE id = $1",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(user_from_row(&row))
    }

    async fn set_user_presence(
        &self,
        user_id: &str,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let affected = self
            .client
            .execute(
                "UPDATE app_user SET is_online = $2, last_seen = $3 WHERE id = $1",
                &[&user_id, &is_online, &last_seen],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        if affected == 0 {
            return Err(StorageError::Missing);
        }
        Ok(())
    }

    async fn set_user_status(&self, user_id: &str, status: &str) -> Result<(), StorageError> {
        let affected = self
            .client
            .execute(
                "UPDATE app_user SET status = $2 WHERE id = $1",
                &[&user_id, &status],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        if affected == 0 {
            return Err(StorageError::Missing);
        }
        Ok(())
    }

    async fn create_conversation(
        &self,
        conversation: &ConversationRecord,
    ) -> Result<(), StorageError> {
        self.client
            .execute(
                "INSERT INTO conversation (id, kind, created_at) VALUES ($1, $2, now())
                ON CONFLICT (id) DO NOTHING",
                &[&conversation.id, &conversation.kind.as_str()],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        for participant in &conversation.participant_ids {
            self.client
                .execute(
                    "INSERT INTO conversation_participant (conversation_id, user_id)
                    VALUES ($1, $2) ON CONFLICT DO NOTHING",
                    &[&conversation.id, participant],
                )
                .await
                .map_err(|_| StorageError::Postgres)?;
        }
        Ok(())
    }

    async fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationRecord, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT id, kind FROM conversation WHERE id = $1",
                &[&conversation_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        let kind: String = row.get(1);
        let participants = self
            .client
            .query(
                "SELECT user_id FROM conversation_participant
                WHERE conversation_id = $1 ORDER BY user_id",
                &[&conversation_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(ConversationRecord {
            id: row.get(0),
            kind: FromStr::from_str(&kind).map_err(|_| StorageError::Serialization)?,
            participant_ids: participants.iter().map(|r| r.get(0)).collect(),
        })
    }

    async fn contact_ids(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT DISTINCT other.user_id
                FROM conversation_participant own
                JOIN conversation_participant other
                    ON own.conversation_id = other.conversation_id
                WHERE own.user_id = $1 AND other.user_id <> $1",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn insert_message(&self, message: &MessageRecord) -> Result<(), StorageError> {
        self.client
            .execute(
                "INSERT INTO message
                (id, conversation_id, sender_id, content, kind, status, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &message.id,
                    &message.conversation_id,
                    &message.sender_id,
                    &message.content,
                    &message.kind.as_str(),
                    &message.status.as_str(),
                    &message.created_at,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    async fn load_message(&self, message_id: &str) -> Result<MessageRecord, StorageError> {
        let query = format!("SELECT {} FROM message WHERE id = $1", MESSAGE_COLUMNS);
        let row = self
            .client
            .query_opt(query.as_str(), &[&message_id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        message_from_row(&row)
    }

    async fn advance_message_status(
        &self,
        message_id: &str,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<bool, StorageError> {
        let affected = self
            .client
            .execute(
                "UPDATE message SET status = $3 WHERE id = $1 AND status = $2",
                &[&message_id, &from.as_str(), &to.as_str()],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        if affected > 0 {
            return Ok(true);
        }
        // Distinguish an absent row from a lost race.
        self.load_message(message_id).await?;
        Ok(false)
    }

    async fn mark_message_read(&self, message_id: &str) -> Result<MessageRecord, StorageError> {
        let query = format!(
            "UPDATE message SET status = 'read' WHERE id = $1 RETURNING {}",
            MESSAGE_COLUMNS
        );
        let row = self
            .client
            .query_opt(query.as_str(), &[&message_id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        message_from_row(&row)
    }

    async fn edit_message(
        &self,
        message_id: &str,
        new_content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<MessageRecord, StorageError> {
        let query = format!(
            "UPDATE message SET content = $2, edited_at = $3
            WHERE id = $1 RETURNING {}",
            MESSAGE_COLUMNS
        );
        let row = self
            .client
            .query_opt(query.as_str(), &[&message_id, &new_content, &edited_at])
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        message_from_row(&row)
    }

    async fn tombstone_message(
        &self,
        message_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let affected = self
            .client
            .execute(
                "UPDATE message SET deleted_at = $2 WHERE id = $1",
                &[&message_id, &deleted_at],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        if affected == 0 {
            return Err(StorageError::Missing);
        }
        Ok(())
    }

    async fn insert_read_receipt(
        &self,
        receipt: &ReadReceiptRecord,
    ) -> Result<bool, StorageError> {
        let affected = self
            .client
            .execute(
                "INSERT INTO read_receipt (message_id, user_id, read_at)
                VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
                &[&receipt.message_id, &receipt.user_id, &receipt.read_at],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(affected > 0)
    }

    async fn insert_call(&self, call: &CallRecord) -> Result<(), StorageError> {
        self.client
            .execute(
                "INSERT INTO call
                (id, caller_id, receiver_id, kind, status, started_at, ended_at, duration_secs)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &call.id,
                    &call.caller_id,
                    &call.receiver_id,
                    &call.kind.as_str(),
                    &call.status.as_str(),
                    &call.started_at,
                    &call.ended_at,
                    &call.duration_secs,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    async fn load_call(&self, call_id: &str) -> Result<CallRecord, StorageError> {
        let query = format!("SELECT {} FROM call WHERE id = $1", CALL_COLUMNS);
        let row = self
            .client
            .query_opt(query.as_str(), &[&call_id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        call_from_row(&row)
    }

    async fn transition_call(
        &self,
        call_id: &str,
        from: &[CallStatus],
        transition: CallTransition,
    ) -> Result<CallRecord, StorageError> {
        let from_states: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let query = format!(
            "UPDATE call SET status = $2,
                ended_at = COALESCE($3, ended_at),
                duration_secs = COALESCE($4, duration_secs)
            WHERE id = $1 AND status = ANY($5) RETURNING {}",
            CALL_COLUMNS
        );
        let row = self
            .client
            .query_opt(
                query.as_str(),
                &[
                    &call_id,
                    &transition.to.as_str(),
                    &transition.ended_at,
                    &transition.duration_secs,
                    &from_states,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        match row {
            Some(row) => call_from_row(&row),
            None => {
                self.load_call(call_id).await?;
                Err(StorageError::Conflict)
            }
        }
    }

    async fn live_calls_for(&self, user_id: &str) -> Result<Vec<CallRecord>, StorageError> {
        let query = format!(
            "SELECT {} FROM call
            WHERE (caller_id = $1 OR receiver_id = $1)
                AND status IN ('ringing', 'active')",
            CALL_COLUMNS
        );
        let rows = self
            .client
            .query(query.as_str(), &[&user_id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        rows.iter().map(call_from_row).collect()
    }

    async fn expire_ringing_calls(
        &self,
        cutoff: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Result<Vec<CallRecord>, StorageError> {
        let query = format!(
            "UPDATE call SET status = 'missed', ended_at = $2
            WHERE status = 'ringing' AND started_at < $1 RETURNING {}",
            CALL_COLUMNS
        );
        let rows = self
            .client
            .query(query.as_str(), &[&cutoff, &ended_at])
            .await
            .map_err(|_| StorageError::Postgres)?;
        rows.iter().map(call_from_row).collect()
    }
}
