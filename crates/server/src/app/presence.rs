use super::{AppState, ServerError};
use crate::registry::SessionHandle;
use chrono::Utc;
use palaver_proto::{OnlineStatus, ServerEvent};
use tracing::warn;

/// Durable online flag plus an online notice to conversation partners that
/// are currently connected. A presence write failure is logged and does not
/// take the connection down.
pub(crate) async fn mark_online(state: &AppState, session: &SessionHandle) {
    if let Err(err) = state
        .datastore
        .set_user_presence(&session.user_id, true, Utc::now())
        .await
    {
        warn!(user = %session.user_id, error = %err, "presence update failed");
    }
    broadcast_to_contacts(
        state,
        &session.user_id,
        ServerEvent::UserOnline {
            user_id: session.user_id.clone(),
        },
    )
    .await;
}

pub(crate) async fn mark_offline(state: &AppState, user_id: &str) {
    if let Err(err) = state
        .datastore
        .set_user_presence(user_id, false, Utc::now())
        .await
    {
        warn!(user = %user_id, error = %err, "presence update failed");
    }
    broadcast_to_contacts(
        state,
        user_id,
        ServerEvent::UserOffline {
            user_id: user_id.to_string(),
        },
    )
    .await;
}

/// Presence fan-out is scoped to users sharing a conversation, not the whole
/// connection table.
async fn broadcast_to_contacts(state: &AppState, user_id: &str, event: ServerEvent) {
    let contacts = match state.datastore.contact_ids(user_id).await {
        Ok(contacts) => contacts,
        Err(err) => {
            warn!(user = %user_id, error = %err, "contact resolution failed");
            return;
        }
    };
    for contact in contacts {
        if let Some(peer) = state.registry.lookup(&contact).await {
            peer.push(event.clone()).await;
        }
    }
}

pub(crate) async fn handle_join(
    state: &AppState,
    session: &SessionHandle,
    conversation_id: String,
) -> Result<(), ServerError> {
    let conversation = state.datastore.load_conversation(&conversation_id).await?;
    if !conversation.has_participant(&session.user_id) {
        return Err(ServerError::Authorization);
    }
    state.rooms.join(&conversation_id, &session.user_id).await;
    Ok(())
}

pub(crate) async fn handle_leave(
    state: &AppState,
    session: &SessionHandle,
    conversation_id: String,
) -> Result<(), ServerError> {
    state.rooms.leave(&conversation_id, &session.user_id).await;
    Ok(())
}

/// Relays a typing notice to the other sessions viewing the conversation.
/// At-most-once: a full or closed queue drops the notice, and a sender that
/// never joined the room is ignored without an error.
pub(crate) async fn handle_typing(
    state: &AppState,
    session: &SessionHandle,
    conversation_id: String,
    started: bool,
) -> Result<(), ServerError> {
    if !state.rooms.contains(&conversation_id, &session.user_id).await {
        return Ok(());
    }
    for member in state.rooms.members(&conversation_id).await {
        if member == session.user_id {
            continue;
        }
        if let Some(peer) = state.registry.lookup(&member).await {
            let event = if started {
                ServerEvent::TypingStart {
                    conversation_id: conversation_id.clone(),
                    user_id: session.user_id.clone(),
                }
            } else {
                ServerEvent::TypingStop {
                    conversation_id: conversation_id.clone(),
                    user_id: session.user_id.clone(),
                }
            };
            peer.push_now(event);
        }
    }
    Ok(())
}

pub(crate) async fn handle_status_update(
    state: &AppState,
    session: &SessionHandle,
    status: String,
) -> Result<(), ServerError> {
    state
        .datastore
        .set_user_status(&session.user_id, &status)
        .await?;
    broadcast_to_contacts(
        state,
        &session.user_id,
        ServerEvent::StatusChanged {
            user_id: session.user_id.clone(),
            status,
        },
    )
    .await;
    Ok(())
}

/// Answers an online probe from registry state only; nothing durable is
/// consulted.
pub(crate) async fn handle_check_online(
    state: &AppState,
    session: &SessionHandle,
    user_ids: Vec<String>,
) -> Result<(), ServerError> {
    let mut report = Vec::with_capacity(user_ids.len());
    for user_id in user_ids {
        let is_online = state.registry.is_online(&user_id).await;
        report.push(OnlineStatus { user_id, is_online });
    }
    session.push(ServerEvent::OnlineStatusReport(report)).await;
    Ok(())
}
