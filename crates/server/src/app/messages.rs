use super::{message_wire, AppState, ServerError};
use crate::registry::SessionHandle;
use crate::util::generate_id;
use chrono::Utc;
use palaver_proto::{MessageKind, MessageStatus, ServerEvent};
use palaver_storage::{MessageRecord, ReadReceiptRecord};
use tracing::debug;

/// Persists a message and fans it out to the conversation's reachable
/// participants. The sender gets `message:sent` as the durability ack even
/// when nobody else is reachable; offline participants catch up over the
/// history API.
pub(crate) async fn handle_send(
    state: &AppState,
    session: &SessionHandle,
    conversation_id: String,
    content: String,
    kind: MessageKind,
) -> Result<(), ServerError> {
    let conversation = state.datastore.load_conversation(&conversation_id).await?;
    if !conversation.has_participant(&session.user_id) {
        return Err(ServerError::Authorization);
    }
    let sender = state.datastore.load_user(&session.user_id).await?;
    let record = MessageRecord {
        id: generate_id("message"),
        conversation_id,
        sender_id: session.user_id.clone(),
        content,
        kind,
        status: MessageStatus::Sent,
        created_at: Utc::now(),
        edited_at: None,
        deleted_at: None,
    };
    state.datastore.insert_message(&record).await?;
    let wire = message_wire(&record, &sender);
    for participant in &conversation.participant_ids {
        if participant == &session.user_id {
            continue;
        }
        if let Some(peer) = state.registry.lookup(participant).await {
            if peer.push(ServerEvent::MessageNew(wire.clone())).await {
                state.metrics.mark_message_relayed();
            }
        }
    }
    debug!(message = %record.id, conversation = %record.conversation_id, "message stored");
    session.push(ServerEvent::MessageSent(wire)).await;
    Ok(())
}

/// Advances sent -> delivered and tells the original sender. A message
/// already past sent is left untouched and nothing is emitted.
pub(crate) async fn handle_delivered(
    state: &AppState,
    message_id: String,
) -> Result<(), ServerError> {
    let message = state.datastore.load_message(&message_id).await?;
    let advanced = state
        .datastore
        .advance_message_status(&message_id, MessageStatus::Sent, MessageStatus::Delivered)
        .await?;
    if !advanced {
        return Ok(());
    }
    if let Some(sender) = state.registry.lookup(&message.sender_id).await {
        sender
            .push(ServerEvent::MessageDelivered {
                message_id,
                status: MessageStatus::Delivered,
            })
            .await;
    }
    Ok(())
}

/// Forces the message to read, records the reader's receipt at most once,
/// and notifies only the sender. Duplicate reads keep a single receipt but
/// still re-notify.
pub(crate) async fn handle_read(
    state: &AppState,
    session: &SessionHandle,
    message_id: String,
) -> Result<(), ServerError> {
    let message = state.datastore.load_message(&message_id).await?;
    let conversation = state
        .datastore
        .load_conversation(&message.conversation_id)
        .await?;
    if !conversation.has_participant(&session.user_id) {
        return Err(ServerError::Authorization);
    }
    let message = state.datastore.mark_message_read(&message_id).await?;
    let receipt = ReadReceiptRecord {
        message_id: message_id.clone(),
        user_id: session.user_id.clone(),
        read_at: Utc::now(),
    };
    state.datastore.insert_read_receipt(&receipt).await?;
    if let Some(sender) = state.registry.lookup(&message.sender_id).await {
        sender
            .push(ServerEvent::MessageRead {
                message_id,
                status: MessageStatus::Read,
                read_by: session.user_id.clone(),
            })
            .await;
    }
    Ok(())
}

/// Rewrites the content, stamps edited_at, and relays the updated message to
/// every participant's live session. Sender-only.
pub(crate) async fn handle_edit(
    state: &AppState,
    session: &SessionHandle,
    message_id: String,
    new_content: String,
) -> Result<(), ServerError> {
    let message = state.datastore.load_message(&message_id).await?;
    if message.sender_id != session.user_id {
        return Err(ServerError::Authorization);
    }
    let updated = state
        .datastore
        .edit_message(&message_id, &new_content, Utc::now())
        .await?;
    let sender = state.datastore.load_user(&updated.sender_id).await?;
    let wire = message_wire(&updated, &sender);
    let conversation = state
        .datastore
        .load_conversation(&updated.conversation_id)
        .await?;
    for participant in &conversation.participant_ids {
        if let Some(peer) = state.registry.lookup(participant).await {
            peer.push(ServerEvent::MessageEdited(wire.clone())).await;
        }
    }
    Ok(())
}

/// Soft delete: the row keeps its content under a tombstone and every
/// participant's live session learns the id is gone. Sender-only.
pub(crate) async fn handle_delete(
    state: &AppState,
    session: &SessionHandle,
    message_id: String,
) -> Result<(), ServerError> {
    let message = state.datastore.load_message(&message_id).await?;
    if message.sender_id != session.user_id {
        return Err(ServerError::Authorization);
    }
    state
        .datastore
        .tombstone_message(&message_id, Utc::now())
        .await?;
    let conversation = state
        .datastore
        .load_conversation(&message.conversation_id)
        .await?;
    for participant in &conversation.participant_ids {
        if let Some(peer) = state.registry.lookup(participant).await {
            peer.push(ServerEvent::MessageDeleted {
                message_id: message_id.clone(),
            })
            .await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{assert_no_event, connect, next_event, seeded_state};
    use super::*;

    async fn send(
        state: &AppState,
        session: &SessionHandle,
        conversation_id: &str,
        content: &str,
    ) -> Result<(), ServerError> {
        handle_send(
            state,
            session,
            conversation_id.to_string(),
            content.to_string(),
            MessageKind::Text,
        )
        .await
    }

    fn sent_message_id(event: ServerEvent) -> String {
        match event {
            ServerEvent::MessageSent(message) => message.id,
            other => panic!("expected message:sent, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_to_offline_participant_still_acks_sender() {
        // Scenario: bob has no live session.
        let state = seeded_state().await;
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        send(&state, &alice, "conv-1", "hello").await.unwrap();
        let message_id = sent_message_id(next_event(&mut alice_rx));
        let stored = state.datastore.load_message(&message_id).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_no_event(&mut alice_rx);
    }

    #[tokio::test]
    async fn fan_out_reaches_connected_participants_once() {
        let state = seeded_state().await;
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (_bob, mut bob_rx) = connect(&state, "bob").await;
        let (_carol, mut carol_rx) = connect(&state, "carol").await;
        send(&state, &alice, "conv-1", "hello").await.unwrap();
        match next_event(&mut bob_rx) {
            ServerEvent::MessageNew(message) => {
                assert_eq!(message.content, "hello");
                assert_eq!(message.sender.id, "alice");
            }
            other => panic!("unexpected event {:?}", other),
        }
        // carol is not in conv-1.
        assert_no_event(&mut carol_rx);
        sent_message_id(next_event(&mut alice_rx));
        assert_no_event(&mut alice_rx);
    }

    #[tokio::test]
    async fn send_requires_participation() {
        let state = seeded_state().await;
        let (dave, mut dave_rx) = connect(&state, "dave").await;
        let result = send(&state, &dave, "conv-1", "intrusion").await;
        assert!(matches!(result, Err(ServerError::Authorization)));
        assert_no_event(&mut dave_rx);
    }

    #[tokio::test]
    async fn delivered_notifies_sender_once_and_never_regresses() {
        let state = seeded_state().await;
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        send(&state, &alice, "conv-1", "hello").await.unwrap();
        let message_id = sent_message_id(next_event(&mut alice_rx));

        handle_delivered(&state, message_id.clone()).await.unwrap();
        match next_event(&mut alice_rx) {
            ServerEvent::MessageDelivered { status, .. } => {
                assert_eq!(status, MessageStatus::Delivered);
            }
            other => panic!("unexpected event {:?}", other),
        }
        // The duplicate is a silent no-op.
        handle_delivered(&state, message_id.clone()).await.unwrap();
        assert_no_event(&mut alice_rx);

        let (bob, _bob_rx) = connect(&state, "bob").await;
        handle_read(&state, &bob, message_id.clone()).await.unwrap();
        next_event(&mut alice_rx);
        handle_delivered(&state, message_id.clone()).await.unwrap();
        assert_no_event(&mut alice_rx);
        let stored = state.datastore.load_message(&message_id).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn read_notifies_sender_with_reader_identity() {
        let state = seeded_state().await;
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (bob, _bob_rx) = connect(&state, "bob").await;
        send(&state, &alice, "conv-1", "hello").await.unwrap();
        let message_id = sent_message_id(next_event(&mut alice_rx));

        handle_read(&state, &bob, message_id.clone()).await.unwrap();
        match next_event(&mut alice_rx) {
            ServerEvent::MessageRead {
                status, read_by, ..
            } => {
                assert_eq!(status, MessageStatus::Read);
                assert_eq!(read_by, "bob");
            }
            other => panic!("unexpected event {:?}", other),
        }
        // A second read keeps one receipt but re-notifies.
        handle_read(&state, &bob, message_id.clone()).await.unwrap();
        match next_event(&mut alice_rx) {
            ServerEvent::MessageRead { read_by, .. } => assert_eq!(read_by, "bob"),
            other => panic!("unexpected event {:?}", other),
        }
        let duplicate = state
            .datastore
            .insert_read_receipt(&ReadReceiptRecord {
                message_id: message_id.clone(),
                user_id: "bob".to_string(),
                read_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(!duplicate, "exactly one receipt row expected");
    }

    #[tokio::test]
    async fn only_the_sender_may_edit_or_delete() {
        let state = seeded_state().await;
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (bob, mut bob_rx) = connect(&state, "bob").await;
        send(&state, &alice, "conv-1", "hello").await.unwrap();
        let message_id = sent_message_id(next_event(&mut alice_rx));

        let edit = handle_edit(&state, &bob, message_id.clone(), "hijack".to_string()).await;
        assert!(matches!(edit, Err(ServerError::Authorization)));
        let delete = handle_delete(&state, &bob, message_id.clone()).await;
        assert!(matches!(delete, Err(ServerError::Authorization)));
        assert_no_event(&mut bob_rx);

        handle_edit(&state, &alice, message_id.clone(), "hello!".to_string())
            .await
            .unwrap();
        match next_event(&mut bob_rx) {
            ServerEvent::MessageEdited(message) => {
                assert_eq!(message.content, "hello!");
                assert!(message.edited_at.is_some());
            }
            other => panic!("unexpected event {:?}", other),
        }
        match next_event(&mut alice_rx) {
            ServerEvent::MessageEdited(message) => assert_eq!(message.id, message_id),
            other => panic!("unexpected event {:?}", other),
        }

        handle_delete(&state, &alice, message_id.clone()).await.unwrap();
        match next_event(&mut bob_rx) {
            ServerEvent::MessageDeleted { message_id: id } => assert_eq!(id, message_id),
            other => panic!("unexpected event {:?}", other),
        }
        let stored = state.datastore.load_message(&message_id).await.unwrap();
        assert!(stored.deleted_at.is_some());
        assert_eq!(stored.content, "hello!", "content retained for audit");
    }

    #[tokio::test]
    async fn read_requires_participation() {
        let state = seeded_state().await;
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (dave, _dave_rx) = connect(&state, "dave").await;
        send(&state, &alice, "conv-1", "hello").await.unwrap();
        let message_id = sent_message_id(next_event(&mut alice_rx));
        let result = handle_read(&state, &dave, message_id.clone()).await;
        assert!(matches!(result, Err(ServerError::Authorization)));
        let stored = state.datastore.load_message(&message_id).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn missing_message_is_reported() {
        let state = seeded_state().await;
        let (alice, _alice_rx) = connect(&state, "alice").await;
        let result = handle_read(&state, &alice, "missing".to_string()).await;
        assert!(matches!(result, Err(ServerError::NotFound)));
        let result = handle_delivered(&state, "missing".to_string()).await;
        assert!(matches!(result, Err(ServerError::NotFound)));
    }
}
