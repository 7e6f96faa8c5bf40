use crate::{
    CallRecord, CallTransition, ConversationRecord, Datastore, MessageRecord, ReadReceiptRecord,
    StorageError, UserRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use palaver_proto::{CallStatus, MessageStatus};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct MemoryInner {
    users: HashMap<String, UserRecord>,
    conversations: HashMap<String, ConversationRecord>,
    messages: HashMap<String, MessageRecord>,
    receipts: HashSet<(String, String)>,
    calls: HashMap<String, CallRecord>,
}

/// Datastore held entirely in process memory.
///
/// Backs the test suite and storageless deployments; state does not survive
/// a restart.
#[derive(Default)]
pub struct MemoryDatastore {
    inner: RwLock<MemoryInner>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn create_user(&self, user: &UserRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn load_user(&self, user_id: &str) -> Result<UserRecord, StorageError> {
        let inner = self.inner.read().await;
        inner.users.get(user_id).cloned().ok_or(StorageError::Missing)
    }

    async fn set_user_presence(
        &self,
        user_id: &str,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let user = inner.users.get_mut(user_id).ok_or(StorageError::Missing)?;
        user.is_online = is_online;
        user.last_seen = last_seen;
        Ok(())
    }

    async fn set_user_status(&self, user_id: &str, status: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let user = inner.users.get_mut(user_id).ok_or(StorageError::Missing)?;
        user.status = status.to_string();
        Ok(())
    }

    async fn create_conversation(
        &self,
        conversation: &ConversationRecord,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationRecord, StorageError> {
        let inner = self.inner.read().await;
        inner
            .conversations
            .get(conversation_id)
            .cloned()
            .ok_or(StorageError::Missing)
    }

    async fn contact_ids(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.read().await;
        let mut contacts = HashSet::new();
        for conversation in inner.conversations.values() {
            if conversation.has_participant(user_id) {
                for participant in &conversation.participant_ids {
                    if participant != user_id {
                        contacts.insert(participant.clone());
                    }
                }
            }
        }
        let mut contacts: Vec<String> = contacts.into_iter().collect();
        contacts.sort();
        Ok(contacts)
    }

    async fn insert_message(&self, message: &MessageRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn load_message(&self, message_id: &str) -> Result<MessageRecord, StorageError> {
        let inner = self.inner.read().await;
        inner
            .messages
            .get(message_id)
            .cloned()
            .ok_or(StorageError::Missing)
    }

    async fn advance_message_status(
        &self,
        message_id: &str,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().await;
        let message = inner
            .messages
            .get_mut(message_id)
            .ok_or(StorageError::Missing)?;
        if message.status != from {
            return Ok(false);
        }
        message.status = to;
        Ok(true)
    }

    async fn mark_message_read(&self, message_id: &str) -> Result<MessageRecord, StorageError> {
        let mut inner = self.inner.write().await;
        let message = inner
            .messages
            .get_mut(message_id)
            .ok_or(StorageError::Missing)?;
        message.status = MessageStatus::Read;
        Ok(message.clone())
    }

    async fn edit_message(
        &self,
        message_id: &str,
        new_content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<MessageRecord, StorageError> {
        let mut inner = self.inner.write().await;
        let message = inner
            .messages
            .get_mut(message_id)
            .ok_or(StorageError::Missing)?;
        message.content = new_content.to_string();
        message.edited_at = Some(edited_at);
        Ok(message.clone())
    }

    async fn tombstone_message(
        &self,
        message_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let message = inner
            .messages
            .get_mut(message_id)
            .ok_or(StorageError::Missing)?;
        message.deleted_at = Some(deleted_at);
        Ok(())
    }

    async fn insert_read_receipt(
        &self,
        receipt: &ReadReceiptRecord,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .receipts
            .insert((receipt.message_id.clone(), receipt.user_id.clone())))
    }

    async fn insert_call(&self, call: &CallRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.calls.insert(call.id.clone(), call.clone());
        Ok(())
    }

    async fn load_call(&self, call_id: &str) -> Result<CallRecord, StorageError> {
        let inner = self.inner.read().await;
        inner.calls.get(call_id).cloned().ok_or(StorageError::Missing)
    }

    async fn transition_call(
        &self,
        call_id: &str,
        from: &[CallStatus],
        transition: CallTransition,
    ) -> Result<CallRecord, StorageError> {
        let mut inner = self.inner.write().await;
        let call = inner.calls.get_mut(call_id).ok_or(StorageError::Missing)?;
        if !from.contains(&call.status) {
            return Err(StorageError::Conflict);
        }
        call.status = transition.to;
        if transition.ended_at.is_some() {
            call.ended_at = transition.ended_at;
        }
        if transition.duration_secs.is_some() {
            call.duration_secs = transition.duration_secs;
        }
        Ok(call.clone())
    }

    async fn live_calls_for(&self, user_id: &str) -> Result<Vec<CallRecord>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .calls
            .values()
            .filter(|call| {
                call.involves(user_id)
                    && matches!(call.status, CallStatus::Ringing | CallStatus::Active)
            })
            .cloned()
            .collect())
    }

    async fn expire_ringing_calls(
        &self,
        cutoff: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Result<Vec<CallRecord>, StorageError> {
        let mut inner = self.inner.write().await;
        let mut expired = Vec::new();
        for call in inner.calls.values_mut() {
            if call.status == CallStatus::Ringing && call.started_at < cutoff {
                call.status = CallStatus::Missed;
                call.ended_at = Some(ended_at);
                expired.push(call.clone());
            }
        }
        Ok(expired)
    }
}
