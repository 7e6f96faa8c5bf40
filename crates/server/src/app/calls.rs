use super::{call_wire, user_summary, AppState, ServerError};
use crate::registry::SessionHandle;
use crate::util::generate_id;
use chrono::{DateTime, Duration, Utc};
use palaver_proto::{CallKind, CallStatus, ServerEvent};
use palaver_storage::{CallRecord, CallTransition, StorageError};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{info, warn};

/// Creates the call in ringing state. A reachable receiver gets
/// `call:incoming`; an absent one flips the call straight to missed and only
/// the caller hears about it.
pub(crate) async fn handle_initiate(
    state: &AppState,
    session: &SessionHandle,
    receiver_id: String,
    kind: CallKind,
) -> Result<(), ServerError> {
    let caller = state.datastore.load_user(&session.user_id).await?;
    let record = CallRecord {
        id: generate_id("call"),
        caller_id: session.user_id.clone(),
        receiver_id: receiver_id.clone(),
        kind,
        status: CallStatus::Ringing,
        started_at: Utc::now(),
        ended_at: None,
        duration_secs: None,
    };
    state.datastore.insert_call(&record).await?;
    match state.registry.lookup(&receiver_id).await {
        Some(peer) => {
            let wire = call_wire(&record, Some(user_summary(&caller)));
            peer.push(ServerEvent::CallIncoming(wire.clone())).await;
            session.push(ServerEvent::CallInitiated(wire)).await;
            state.metrics.mark_call_started();
            info!(call = %record.id, caller = %record.caller_id, receiver = %receiver_id, "call ringing");
        }
        None => {
            let now = Utc::now();
            state
                .datastore
                .transition_call(
                    &record.id,
                    &[CallStatus::Ringing],
                    CallTransition {
                        to: CallStatus::Missed,
                        ended_at: Some(now),
                        duration_secs: None,
                    },
                )
                .await?;
            info!(call = %record.id, receiver = %receiver_id, "receiver unreachable, call missed");
            session
                .push(ServerEvent::CallUnavailable {
                    call_id: record.id.clone(),
                    message: "user is offline".to_string(),
                })
                .await;
        }
    }
    Ok(())
}

/// ringing -> active; the caller's live session is told. Any other starting
/// state is rejected and left unchanged.
pub(crate) async fn handle_accept(
    state: &AppState,
    session: &SessionHandle,
    call_id: String,
) -> Result<(), ServerError> {
    let call = state.datastore.load_call(&call_id).await?;
    if !call.involves(&session.user_id) {
        return Err(ServerError::Authorization);
    }
    let updated = state
        .datastore
        .transition_call(
            &call_id,
            &[CallStatus::Ringing],
            CallTransition {
                to: CallStatus::Active,
                ended_at: None,
                duration_secs: None,
            },
        )
        .await?;
    info!(call = %call_id, "call accepted");
    if let Some(caller) = state.registry.lookup(&updated.caller_id).await {
        caller.push(ServerEvent::CallAccepted { call_id }).await;
    }
    Ok(())
}

/// ringing -> rejected, stamping the end time.
pub(crate) async fn handle_reject(
    state: &AppState,
    session: &SessionHandle,
    call_id: String,
) -> Result<(), ServerError> {
    let call = state.datastore.load_call(&call_id).await?;
    if !call.involves(&session.user_id) {
        return Err(ServerError::Authorization);
    }
    let updated = state
        .datastore
        .transition_call(
            &call_id,
            &[CallStatus::Ringing],
            CallTransition {
                to: CallStatus::Rejected,
                ended_at: Some(Utc::now()),
                duration_secs: None,
            },
        )
        .await?;
    info!(call = %call_id, "call rejected");
    if let Some(caller) = state.registry.lookup(&updated.caller_id).await {
        caller.push(ServerEvent::CallRejected { call_id }).await;
    }
    Ok(())
}

/// {ringing, active} -> ended with the elapsed duration; both parties are
/// notified independently, best-effort.
pub(crate) async fn handle_end(
    state: &AppState,
    session: &SessionHandle,
    call_id: String,
) -> Result<(), ServerError> {
    let call = state.datastore.load_call(&call_id).await?;
    if !call.involves(&session.user_id) {
        return Err(ServerError::Authorization);
    }
    let now = Utc::now();
    let duration = (now - call.started_at).num_seconds().max(0);
    let updated = state
        .datastore
        .transition_call(
            &call_id,
            &[CallStatus::Ringing, CallStatus::Active],
            CallTransition {
                to: CallStatus::Ended,
                ended_at: Some(now),
                duration_secs: Some(duration),
            },
        )
        .await?;
    state.metrics.mark_call_ended();
    info!(call = %call_id, duration, "call ended");
    for party in [&updated.caller_id, &updated.receiver_id] {
        if let Some(peer) = state.registry.lookup(party).await {
            peer.push(ServerEvent::CallEnded {
                call_id: call_id.clone(),
                duration,
            })
            .await;
        }
    }
    Ok(())
}

/// Ends the user's live calls when their session goes away; the other party
/// gets `call:ended`. A transition lost to a concurrent accept/reject/end is
/// simply skipped.
pub(crate) async fn end_calls_for_disconnect(state: &AppState, user_id: &str) {
    let live = match state.datastore.live_calls_for(user_id).await {
        Ok(live) => live,
        Err(err) => {
            warn!(user = %user_id, error = %err, "live call lookup failed");
            return;
        }
    };
    let now = Utc::now();
    for call in live {
        let duration = (now - call.started_at).num_seconds().max(0);
        let transition = state
            .datastore
            .transition_call(
                &call.id,
                &[CallStatus::Ringing, CallStatus::Active],
                CallTransition {
                    to: CallStatus::Ended,
                    ended_at: Some(now),
                    duration_secs: Some(duration),
                },
            )
            .await;
        match transition {
            Ok(_) => {
                state.metrics.mark_call_ended();
                info!(call = %call.id, user = %user_id, "call ended by disconnect");
                let peer_id = call.peer_of(user_id).to_string();
                if let Some(peer) = state.registry.lookup(&peer_id).await {
                    peer.push(ServerEvent::CallEnded {
                        call_id: call.id.clone(),
                        duration,
                    })
                    .await;
                }
            }
            Err(StorageError::Conflict) => {}
            Err(err) => {
                warn!(call = %call.id, error = %err, "disconnect call cleanup failed");
            }
        }
    }
}

/// Single-hop relay of an SDP offer; dropped when the target is offline.
pub(crate) async fn relay_offer(
    state: &AppState,
    session: &SessionHandle,
    receiver_id: String,
    sdp: Value,
) -> Result<(), ServerError> {
    if let Some(peer) = state.registry.lookup(&receiver_id).await {
        peer.push(ServerEvent::CallOffer {
            sender_id: session.user_id.clone(),
            sdp,
        })
        .await;
    }
    Ok(())
}

pub(crate) async fn relay_answer(
    state: &AppState,
    session: &SessionHandle,
    caller_id: String,
    sdp: Value,
) -> Result<(), ServerError> {
    if let Some(peer) = state.registry.lookup(&caller_id).await {
        peer.push(ServerEvent::CallAnswer {
            sender_id: session.user_id.clone(),
            sdp,
        })
        .await;
    }
    Ok(())
}

pub(crate) async fn relay_candidate(
    state: &AppState,
    session: &SessionHandle,
    receiver_id: String,
    candidate: Value,
) -> Result<(), ServerError> {
    if let Some(peer) = state.registry.lookup(&receiver_id).await {
        peer.push(ServerEvent::CallIceCandidate {
            sender_id: session.user_id.clone(),
            candidate,
        })
        .await;
    }
    Ok(())
}

/// Moves calls ringing past the configured bound to missed and tells both
/// parties. Returns how many calls expired.
pub(crate) async fn sweep_ring_timeouts(
    state: &AppState,
    now: DateTime<Utc>,
) -> Result<usize, StorageError> {
    let cutoff = now - Duration::seconds(state.config.ring_timeout_secs);
    let expired = state.datastore.expire_ringing_calls(cutoff, now).await?;
    let count = expired.len();
    for call in expired {
        state.metrics.mark_call_ended();
        info!(call = %call.id, "ring timeout, call missed");
        for party in [&call.caller_id, &call.receiver_id] {
            if let Some(peer) = state.registry.lookup(party).await {
                peer.push(ServerEvent::CallMissed {
                    call_id: call.id.clone(),
                })
                .await;
            }
        }
    }
    Ok(count)
}

pub(crate) async fn ring_timeout_worker(state: Arc<AppState>) {
    let mut ticker = interval(TokioDuration::from_secs(state.config.ring_sweep_secs.max(1)));
    loop {
        ticker.tick().await;
        if let Err(err) = sweep_ring_timeouts(&state, Utc::now()).await {
            warn!(error = %err, "ring timeout sweep failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{assert_no_event, connect, next_event, seeded_state};
    use super::*;
    use serde_json::json;

    fn incoming_call_id(event: ServerEvent) -> String {
        match event {
            ServerEvent::CallIncoming(call) => call.id,
            other => panic!("expected call:incoming, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn accept_flow_connects_both_parties() {
        // Scenario: alice rings bob, bob accepts.
        let state = seeded_state().await;
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (bob, mut bob_rx) = connect(&state, "bob").await;
        handle_initiate(&state, &alice, "bob".to_string(), CallKind::Video)
            .await
            .unwrap();
        let incoming = next_event(&mut bob_rx);
        let call_id = match &incoming {
            ServerEvent::CallIncoming(call) => {
                assert_eq!(call.status, CallStatus::Ringing);
                assert_eq!(call.caller.as_ref().unwrap().id, "alice");
                call.id.clone()
            }
            other => panic!("unexpected event {:?}", other),
        };
        match next_event(&mut alice_rx) {
            ServerEvent::CallInitiated(call) => assert_eq!(call.id, call_id),
            other => panic!("unexpected event {:?}", other),
        }

        handle_accept(&state, &bob, call_id.clone()).await.unwrap();
        match next_event(&mut alice_rx) {
            ServerEvent::CallAccepted { call_id: id } => assert_eq!(id, call_id),
            other => panic!("unexpected event {:?}", other),
        }
        let stored = state.datastore.load_call(&call_id).await.unwrap();
        assert_eq!(stored.status, CallStatus::Active);
    }

    #[tokio::test]
    async fn offline_receiver_means_missed() {
        // Scenario: bob has no live session.
        let state = seeded_state().await;
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        handle_initiate(&state, &alice, "bob".to_string(), CallKind::Voice)
            .await
            .unwrap();
        let call_id = match next_event(&mut alice_rx) {
            ServerEvent::CallUnavailable { call_id, .. } => call_id,
            other => panic!("unexpected event {:?}", other),
        };
        assert_no_event(&mut alice_rx);
        let stored = state.datastore.load_call(&call_id).await.unwrap();
        assert_eq!(stored.status, CallStatus::Missed);
    }

    #[tokio::test]
    async fn out_of_order_transitions_are_rejected() {
        let state = seeded_state().await;
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (bob, mut bob_rx) = connect(&state, "bob").await;
        handle_initiate(&state, &alice, "bob".to_string(), CallKind::Voice)
            .await
            .unwrap();
        let call_id = incoming_call_id(next_event(&mut bob_rx));
        next_event(&mut alice_rx);

        handle_reject(&state, &bob, call_id.clone()).await.unwrap();
        match next_event(&mut alice_rx) {
            ServerEvent::CallRejected { call_id: id } => assert_eq!(id, call_id),
            other => panic!("unexpected event {:?}", other),
        }
        // rejected is terminal: accept and end must fail without mutation.
        let accept = handle_accept(&state, &bob, call_id.clone()).await;
        assert!(matches!(accept, Err(ServerError::InvalidState)));
        let end = handle_end(&state, &bob, call_id.clone()).await;
        assert!(matches!(end, Err(ServerError::InvalidState)));
        let stored = state.datastore.load_call(&call_id).await.unwrap();
        assert_eq!(stored.status, CallStatus::Rejected);
        assert!(stored.ended_at.is_some());
    }

    #[tokio::test]
    async fn end_notifies_both_parties_with_duration() {
        let state = seeded_state().await;
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (bob, mut bob_rx) = connect(&state, "bob").await;
        handle_initiate(&state, &alice, "bob".to_string(), CallKind::Voice)
            .await
            .unwrap();
        let call_id = incoming_call_id(next_event(&mut bob_rx));
        next_event(&mut alice_rx);
        handle_accept(&state, &bob, call_id.clone()).await.unwrap();
        next_event(&mut alice_rx);

        handle_end(&state, &alice, call_id.clone()).await.unwrap();
        for rx in [&mut alice_rx, &mut bob_rx] {
            match next_event(rx) {
                ServerEvent::CallEnded {
                    call_id: id,
                    duration,
                } => {
                    assert_eq!(id, call_id);
                    assert!(duration >= 0);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        let stored = state.datastore.load_call(&call_id).await.unwrap();
        assert_eq!(stored.status, CallStatus::Ended);
        assert!(stored.duration_secs.is_some());
    }

    #[tokio::test]
    async fn unknown_call_is_reported() {
        let state = seeded_state().await;
        let (alice, _alice_rx) = connect(&state, "alice").await;
        for result in [
            handle_accept(&state, &alice, "missing".to_string()).await,
            handle_reject(&state, &alice, "missing".to_string()).await,
            handle_end(&state, &alice, "missing".to_string()).await,
        ] {
            assert!(matches!(result, Err(ServerError::NotFound)));
        }
    }

    #[tokio::test]
    async fn outsiders_cannot_touch_a_call() {
        let state = seeded_state().await;
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (_bob, mut bob_rx) = connect(&state, "bob").await;
        let (carol, _carol_rx) = connect(&state, "carol").await;
        handle_initiate(&state, &alice, "bob".to_string(), CallKind::Voice)
            .await
            .unwrap();
        let call_id = incoming_call_id(next_event(&mut bob_rx));
        next_event(&mut alice_rx);
        let result = handle_accept(&state, &carol, call_id.clone()).await;
        assert!(matches!(result, Err(ServerError::Authorization)));
        let stored = state.datastore.load_call(&call_id).await.unwrap();
        assert_eq!(stored.status, CallStatus::Ringing);
    }

    #[tokio::test]
    async fn signaling_relays_tagged_payloads_or_drops() {
        let state = seeded_state().await;
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (bob, mut bob_rx) = connect(&state, "bob").await;

        relay_offer(&state, &alice, "bob".to_string(), json!({"type": "offer"}))
            .await
            .unwrap();
        match next_event(&mut bob_rx) {
            ServerEvent::CallOffer { sender_id, sdp } => {
                assert_eq!(sender_id, "alice");
                assert_eq!(sdp["type"], json!("offer"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        relay_answer(&state, &bob, "alice".to_string(), json!({"type": "answer"}))
            .await
            .unwrap();
        match next_event(&mut alice_rx) {
            ServerEvent::CallAnswer { sender_id, .. } => assert_eq!(sender_id, "bob"),
            other => panic!("unexpected event {:?}", other),
        }
        relay_candidate(&state, &alice, "bob".to_string(), json!({"candidate": "c"}))
            .await
            .unwrap();
        match next_event(&mut bob_rx) {
            ServerEvent::CallIceCandidate { sender_id, .. } => assert_eq!(sender_id, "alice"),
            other => panic!("unexpected event {:?}", other),
        }

        // Target offline: dropped without an error to the sender.
        relay_offer(&state, &alice, "carol".to_string(), json!({}))
            .await
            .unwrap();
        assert_no_event(&mut alice_rx);
    }

    #[tokio::test]
    async fn stale_ringing_calls_time_out_to_missed() {
        let state = seeded_state().await;
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (_bob, mut bob_rx) = connect(&state, "bob").await;
        handle_initiate(&state, &alice, "bob".to_string(), CallKind::Voice)
            .await
            .unwrap();
        let call_id = incoming_call_id(next_event(&mut bob_rx));
        next_event(&mut alice_rx);

        // Not yet past the bound.
        let swept = sweep_ring_timeouts(&state, Utc::now()).await.unwrap();
        assert_eq!(swept, 0);
        let later = Utc::now() + Duration::seconds(state.config.ring_timeout_secs + 1);
        let swept = sweep_ring_timeouts(&state, later).await.unwrap();
        assert_eq!(swept, 1);
        for rx in [&mut alice_rx, &mut bob_rx] {
            match next_event(rx) {
                ServerEvent::CallMissed { call_id: id } => assert_eq!(id, call_id),
                other => panic!("unexpected event {:?}", other),
            }
        }
        let stored = state.datastore.load_call(&call_id).await.unwrap();
        assert_eq!(stored.status, CallStatus::Missed);
    }

    #[tokio::test]
    async fn disconnect_ends_live_calls() {
        let state = seeded_state().await;
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (bob, mut bob_rx) = connect(&state, "bob").await;
        handle_initiate(&state, &alice, "bob".to_string(), CallKind::Video)
            .await
            .unwrap();
        let call_id = incoming_call_id(next_event(&mut bob_rx));
        next_event(&mut alice_rx);
        handle_accept(&state, &bob, call_id.clone()).await.unwrap();
        next_event(&mut alice_rx);

        end_calls_for_disconnect(&state, "bob").await;
        match next_event(&mut alice_rx) {
            ServerEvent::CallEnded { call_id: id, .. } => assert_eq!(id, call_id),
            other => panic!("unexpected event {:?}", other),
        }
        let stored = state.datastore.load_call(&call_id).await.unwrap();
        assert_eq!(stored.status, CallStatus::Ended);
    }
}
