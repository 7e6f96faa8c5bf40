mod calls;
mod messages;
mod presence;

use crate::auth::{AuthContext, AuthError, AuthVerifier};
use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::registry::{ConnectionRegistry, RoomIndex, SessionHandle};
use crate::util::generate_id;
use futures_util::{SinkExt, StreamExt};
use palaver_proto::{CallWire, ClientEvent, MessageWire, ServerEvent, UserSummary};
use palaver_storage::{CallRecord, Datastore, MessageRecord, StorageError, UserRecord};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration as TokioDuration};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum ServerError {
    Authorization,
    NotFound,
    Persistence,
    InvalidState,
    Codec,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authorization => write!(f, "unauthorized"),
            Self::NotFound => write!(f, "not found"),
            Self::Persistence => write!(f, "operation failed"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::Codec => write!(f, "malformed event"),
        }
    }
}

impl Error for ServerError {}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Missing => Self::NotFound,
            StorageError::Conflict => Self::InvalidState,
            StorageError::Postgres | StorageError::Serialization => Self::Persistence,
        }
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub datastore: Arc<dyn Datastore>,
    pub registry: ConnectionRegistry,
    pub rooms: RoomIndex,
    pub metrics: Arc<Metrics>,
    pub auth: Arc<dyn AuthVerifier>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        datastore: Arc<dyn Datastore>,
        auth: Arc<dyn AuthVerifier>,
    ) -> Arc<Self> {
        Arc::new(AppState {
            config,
            datastore,
            registry: ConnectionRegistry::new(),
            rooms: RoomIndex::new(),
            metrics: Arc::new(Metrics::new()),
            auth,
        })
    }
}

pub struct App {
    pub state: Arc<AppState>,
}

impl App {
    pub fn new(state: Arc<AppState>) -> Self {
        App { state }
    }

    /// Accept loop: one task per incoming connection.
    pub async fn run(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(state, stream, peer).await {
                    debug!(%peer, error = %err, "connection terminated");
                }
            });
        }
    }
}

/// Spawns the ring-timeout sweeper and the metrics snapshot worker.
pub fn spawn_workers(state: &Arc<AppState>) {
    tokio::spawn(calls::ring_timeout_worker(Arc::clone(state)));
    tokio::spawn(metrics_worker(Arc::clone(state)));
}

async fn metrics_worker(state: Arc<AppState>) {
    let mut ticker = interval(TokioDuration::from_secs(
        state.config.metrics_interval_secs.max(1),
    ));
    loop {
        ticker.tick().await;
        let snapshot = state.metrics.snapshot();
        info!(
            target: "palaver::metrics",
            connections = snapshot.connections_active,
            ingress = snapshot.events_ingress,
            egress = snapshot.events_egress,
            messages = snapshot.messages_relayed,
            calls_started = snapshot.calls_started,
            calls_ended = snapshot.calls_ended,
            errors = snapshot.errors_emitted,
            "metrics snapshot"
        );
    }
}

async fn handle_connection(
    state: Arc<AppState>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), ServerError> {
    let mut auth_ctx: Option<AuthContext> = None;
    let verifier = Arc::clone(&state.auth);
    let websocket = accept_hdr_async(stream, |request: &Request, response: Response| {
        let uri = request.uri().to_string();
        let authorization = request
            .headers()
            .get("authorization")
            .and_then(|value| value.to_str().ok());
        let outcome = crate::auth::token_from_request(&uri, authorization)
            .ok_or(AuthError::MissingToken)
            .and_then(|token| verifier.verify(&token));
        match outcome {
            Ok(ctx) => {
                auth_ctx = Some(ctx);
                Ok(response)
            }
            Err(err) => {
                warn!(%peer, error = %err, "connection refused");
                let mut refusal = ErrorResponse::new(Some(err.to_string()));
                *refusal.status_mut() = StatusCode::UNAUTHORIZED;
                Err(refusal)
            }
        }
    })
    .await
    .map_err(|_| ServerError::Codec)?;
    let Some(ctx) = auth_ctx else {
        return Err(ServerError::Codec);
    };

    let transport_id = generate_id("transport");
    info!(user = %ctx.user_id, transport = %transport_id, %peer, "connection established");
    let (tx_out, mut rx_out) = mpsc::channel(state.config.send_queue);
    let handle = Arc::new(SessionHandle::new(
        ctx.user_id.clone(),
        transport_id,
        tx_out,
    ));
    if let Some(superseded) = state.registry.register(Arc::clone(&handle)).await {
        info!(
            user = %ctx.user_id,
            superseded = %superseded.transport_id,
            "prior session superseded"
        );
    }
    state.metrics.incr_connections();
    presence::mark_online(&state, &handle).await;

    let (mut sink, mut source) = websocket.split();
    let writer_state = Arc::clone(&state);
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx_out.recv().await {
            match frame.encode() {
                Ok(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                    writer_state.metrics.mark_egress();
                }
                Err(err) => {
                    warn!(error = %err, "outbound frame dropped");
                }
            }
        }
        let _ = sink.close().await;
    });

    while let Some(incoming) = source.next().await {
        let message = match incoming {
            Ok(message) => message,
            Err(_) => break,
        };
        match message {
            Message::Text(text) => {
                state.metrics.mark_ingress();
                match ClientEvent::decode(text.as_str()) {
                    Ok(event) => dispatch_event(&state, &handle, event).await,
                    Err(err) => {
                        state.metrics.mark_error();
                        handle
                            .push(ServerEvent::Error {
                                message: err.to_string(),
                            })
                            .await;
                    }
                }
            }
            Message::Binary(_) => {
                handle
                    .push(ServerEvent::Error {
                        message: "binary frames are not supported".to_string(),
                    })
                    .await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    cleanup_connection(&state, &handle).await;
    state.metrics.decr_connections();
    drop(handle);
    let _ = writer.await;
    Ok(())
}

/// Routes one decoded event to its handler and converts a rejection into a
/// single error event for the initiator.
pub(crate) async fn dispatch_event(
    state: &Arc<AppState>,
    session: &Arc<SessionHandle>,
    event: ClientEvent,
) {
    let result = match event {
        ClientEvent::MessageSend {
            conversation_id,
            content,
            kind,
        } => messages::handle_send(state, session, conversation_id, content, kind).await,
        ClientEvent::MessageDelivered { message_id } => {
            messages::handle_delivered(state, message_id).await
        }
        ClientEvent::MessageRead { message_id } => {
            messages::handle_read(state, session, message_id).await
        }
        ClientEvent::MessageEdit {
            message_id,
            new_content,
        } => messages::handle_edit(state, session, message_id, new_content).await,
        ClientEvent::MessageDelete { message_id } => {
            messages::handle_delete(state, session, message_id).await
        }
        ClientEvent::TypingStart { conversation_id } => {
            presence::handle_typing(state, session, conversation_id, true).await
        }
        ClientEvent::TypingStop { conversation_id } => {
            presence::handle_typing(state, session, conversation_id, false).await
        }
        ClientEvent::ConversationJoin { conversation_id } => {
            presence::handle_join(state, session, conversation_id).await
        }
        ClientEvent::ConversationLeave { conversation_id } => {
            presence::handle_leave(state, session, conversation_id).await
        }
        ClientEvent::CallInitiate { receiver_id, kind } => {
            calls::handle_initiate(state, session, receiver_id, kind).await
        }
        ClientEvent::CallAccept { call_id } => calls::handle_accept(state, session, call_id).await,
        ClientEvent::CallReject { call_id } => calls::handle_reject(state, session, call_id).await,
        ClientEvent::CallEnd { call_id } => calls::handle_end(state, session, call_id).await,
        ClientEvent::CallOffer { receiver_id, sdp } => {
            calls::relay_offer(state, session, receiver_id, sdp).await
        }
        ClientEvent::CallAnswer { caller_id, sdp } => {
            calls::relay_answer(state, session, caller_id, sdp).await
        }
        ClientEvent::CallIceCandidate {
            receiver_id,
            candidate,
        } => calls::relay_candidate(state, session, receiver_id, candidate).await,
        ClientEvent::StatusUpdate { status } => {
            presence::handle_status_update(state, session, status).await
        }
        ClientEvent::CheckOnline { user_ids } => {
            presence::handle_check_online(state, session, user_ids).await
        }
    };
    if let Err(err) = result {
        state.metrics.mark_error();
        warn!(user = %session.user_id, error = %err, "event rejected");
        session
            .push(ServerEvent::Error {
                message: err.to_string(),
            })
            .await;
    }
}

/// Guarded teardown: only the session still owning the mapping publishes
/// offline state and tears down rooms and live calls.
async fn cleanup_connection(state: &Arc<AppState>, handle: &Arc<SessionHandle>) {
    let removed = state
        .registry
        .unregister(&handle.user_id, &handle.transport_id)
        .await;
    if !removed {
        debug!(user = %handle.user_id, "superseded connection closed");
        return;
    }
    info!(user = %handle.user_id, transport = %handle.transport_id, "connection closed");
    state.rooms.leave_all(&handle.user_id).await;
    calls::end_calls_for_disconnect(state, &handle.user_id).await;
    presence::mark_offline(state, &handle.user_id).await;
}

pub(crate) fn user_summary(user: &UserRecord) -> UserSummary {
    UserSummary {
        id: user.id.clone(),
        name: user.name.clone(),
        avatar: user.avatar.clone(),
    }
}

pub(crate) fn message_wire(record: &MessageRecord, sender: &UserRecord) -> MessageWire {
    MessageWire {
        id: record.id.clone(),
        conversation_id: record.conversation_id.clone(),
        sender_id: record.sender_id.clone(),
        content: record.content.clone(),
        kind: record.kind,
        status: record.status,
        created_at: record.created_at,
        edited_at: record.edited_at,
        deleted_at: record.deleted_at,
        sender: user_summary(sender),
    }
}

pub(crate) fn call_wire(record: &CallRecord, caller: Option<UserSummary>) -> CallWire {
    CallWire {
        id: record.id.clone(),
        caller_id: record.caller_id.clone(),
        receiver_id: record.receiver_id.clone(),
        kind: record.kind,
        status: record.status,
        started_at: record.started_at,
        ended_at: record.ended_at,
        duration: record.duration_secs,
        caller,
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::auth::JwtVerifier;
    use crate::config::{ServerConfig, StorageBackend};
    use chrono::Utc;
    use palaver_proto::{ConversationKind, OutboundFrame};
    use palaver_storage::{ConversationRecord, MemoryDatastore};

    pub(crate) fn test_config() -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            storage_backend: StorageBackend::Memory,
            postgres_dsn: None,
            jwt_secret: "test-secret".to_string(),
            ring_timeout_secs: 45,
            ring_sweep_secs: 5,
            metrics_interval_secs: 60,
            send_queue: 16,
        }
    }

    fn user(id: &str) -> UserRecord {
        UserRecord {
            id: id.to_string(),
            email: format!("{}@example.com", id),
            name: id.to_string(),
            avatar: None,
            status: String::new(),
            is_online: false,
            last_seen: Utc::now(),
        }
    }

    /// Memory-backed state with users alice/bob/carol/dave; alice and bob
    /// share the direct conversation `conv-1`, carol joins them in the group
    /// `conv-2`, dave shares nothing.
    pub(crate) async fn seeded_state() -> Arc<AppState> {
        let datastore = Arc::new(MemoryDatastore::new());
        for id in ["alice", "bob", "carol", "dave"] {
            datastore.create_user(&user(id)).await.unwrap();
        }
        datastore
            .create_conversation(&ConversationRecord {
                id: "conv-1".to_string(),
                kind: ConversationKind::Direct,
                participant_ids: vec!["alice".to_string(), "bob".to_string()],
            })
            .await
            .unwrap();
        datastore
            .create_conversation(&ConversationRecord {
                id: "conv-2".to_string(),
                kind: ConversationKind::Group,
                participant_ids: vec![
                    "alice".to_string(),
                    "bob".to_string(),
                    "carol".to_string(),
                ],
            })
            .await
            .unwrap();
        AppState::new(
            test_config(),
            datastore,
            Arc::new(JwtVerifier::new("test-secret")),
        )
    }

    /// Registers a live session for the user and hands back its outbound
    /// queue, standing in for a connected socket.
    pub(crate) async fn connect(
        state: &Arc<AppState>,
        user_id: &str,
    ) -> (Arc<SessionHandle>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = Arc::new(SessionHandle::new(
            user_id.to_string(),
            generate_id("transport"),
            tx,
        ));
        state.registry.register(Arc::clone(&handle)).await;
        (handle, rx)
    }

    pub(crate) fn next_event(rx: &mut mpsc::Receiver<OutboundFrame>) -> ServerEvent {
        rx.try_recv().expect("expected a queued event").event
    }

    pub(crate) fn assert_no_event(rx: &mut mpsc::Receiver<OutboundFrame>) {
        assert!(rx.try_recv().is_err(), "unexpected queued event");
    }
}
