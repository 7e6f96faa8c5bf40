mod memory;
mod pg;

pub use memory::MemoryDatastore;
pub use pg::{connect, PgDatastore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use palaver_proto::{CallKind, CallStatus, ConversationKind, MessageKind, MessageStatus};
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum StorageError {
    Postgres,
    Serialization,
    Missing,
    Conflict,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Serialization => write!(f, "serialization failure"),
            Self::Missing => write!(f, "missing record"),
            Self::Conflict => write!(f, "conflicting state"),
        }
    }
}

impl Error for StorageError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub name: String,
    pub avatar: Option<String>,
    pub status: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: String,
    pub kind: ConversationKind,
    pub participant_ids: Vec<String>,
}

impl ConversationRecord {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_ids.iter().any(|id| id == user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceiptRecord {
    pub message_id: String,
    pub user_id: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub id: String,
    pub caller_id: String,
    pub receiver_id: String,
    pub kind: CallKind,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
}

impl CallRecord {
    pub fn involves(&self, user_id: &str) -> bool {
        self.caller_id == user_id || self.receiver_id == user_id
    }

    /// The participant opposite to the given one.
    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.caller_id == user_id {
            &self.receiver_id
        } else {
            &self.caller_id
        }
    }
}

/// Field updates applied together with a call status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTransition {
    pub to: CallStatus,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
}

/// Persistence collaborator consumed by the realtime core.
///
/// Status mutations are compare-and-set: callers name the states they expect
/// and the store rejects the write if another handler got there first.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn create_user(&self, user: &UserRecord) -> Result<(), StorageError>;

    async fn load_user(&self, user_id: &str) -> Result<UserRecord, StorageError>;

    async fn set_user_presence(
        &self,
        user_id: &str,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn set_user_status(&self, user_id: &str, status: &str) -> Result<(), StorageError>;

    async fn create_conversation(
        &self,
        conversation: &ConversationRecord,
    ) -> Result<(), StorageError>;

    async fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationRecord, StorageError>;

    /// Distinct users sharing at least one conversation with the given user.
    async fn contact_ids(&self, user_id: &str) -> Result<Vec<String>, StorageError>;

    async fn insert_message(&self, message: &MessageRecord) -> Result<(), StorageError>;

    async fn load_message(&self, message_id: &str) -> Result<MessageRecord, StorageError>;

    /// Conditionally advances a message status; returns false when the
    /// message was not in `from` (already further along).
    async fn advance_message_status(
        &self,
        message_id: &str,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<bool, StorageError>;

    /// Forces a message status to read, the terminal state.
    async fn mark_message_read(&self, message_id: &str) -> Result<MessageRecord, StorageError>;

    async fn edit_message(
        &self,
        message_id: &str,
        new_content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<MessageRecord, StorageError>;

    /// Soft delete: stamps deleted_at, content stays for audit.
    async fn tombstone_message(
        &self,
        message_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Inserts at most one receipt per (message, user); returns false on the
    /// duplicate path.
    async fn insert_read_receipt(&self, receipt: &ReadReceiptRecord)
        -> Result<bool, StorageError>;

    async fn insert_call(&self, call: &CallRecord) -> Result<(), StorageError>;

    async fn load_call(&self, call_id: &str) -> Result<CallRecord, StorageError>;

    /// Compare-and-set status transition. `Missing` when the call does not
    /// exist, `Conflict` when its status is outside `from`.
    async fn transition_call(
        &self,
        call_id: &str,
        from: &[CallStatus],
        transition: CallTransition,
    ) -> Result<CallRecord, StorageError>;

    /// Calls involving the user that are still ringing or active.
    async fn live_calls_for(&self, user_id: &str) -> Result<Vec<CallRecord>, StorageError>;

    /// Moves calls ringing since before `cutoff` to missed, returning them.
    async fn expire_ringing_calls(
        &self,
        cutoff: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Result<Vec<CallRecord>, StorageError>;
}
