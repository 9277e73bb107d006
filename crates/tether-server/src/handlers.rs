//! Connection handlers for the Tether server.
//!
//! One event-dispatch loop per connection: inbound frames are decoded and
//! dispatched to the component owning the event's namespace; outbound
//! events queue into the connection's channel and drain here. A dropped
//! connection runs disconnect reconciliation on the way out.

use crate::auth::{OpenVerifier, StaticTokenVerifier, Verifier};
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::{
    CallManager, ChannelMap, ConnectionHandle, ConnectionRegistry, DirectRelay,
    DisconnectReconciler, GroupChannelManager, MeetingManager, MemoryStore, SessionStore,
};
use tether_protocol::{codec, ClientEvent, PresenceStatus, ServerEvent};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub channels: Arc<ChannelMap>,
    pub relay: DirectRelay,
    pub calls: Arc<CallManager>,
    pub groups: GroupChannelManager,
    pub meetings: Arc<MeetingManager>,
    pub reconciler: DisconnectReconciler,
    pub verifier: Box<dyn Verifier>,
    pub config: Config,
    active_connections: AtomicUsize,
}

impl AppState {
    /// Create new app state over the given store.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn SessionStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let channels = Arc::new(ChannelMap::new());
        let calls = Arc::new(CallManager::new(registry.clone()));
        let meetings = Arc::new(MeetingManager::new(channels.clone(), store.clone()));

        let verifier: Box<dyn Verifier> = match &config.auth.static_token {
            Some(token) => Box::new(StaticTokenVerifier::new(token.clone())),
            None => Box::new(OpenVerifier),
        };

        Self {
            relay: DirectRelay::new(registry.clone()),
            groups: GroupChannelManager::new(channels.clone(), store),
            reconciler: DisconnectReconciler::new(
                registry.clone(),
                channels.clone(),
                calls.clone(),
                meetings.clone(),
            ),
            registry,
            channels,
            calls,
            meetings,
            verifier,
            config,
            active_connections: AtomicUsize::new(0),
        }
    }

    /// Claim a connection slot, refusing past `limits.max_connections`.
    fn try_acquire_slot(&self) -> bool {
        let mut current = self.active_connections.load(Ordering::Relaxed);
        loop {
            if current >= self.config.limits.max_connections {
                return false;
            }
            match self.active_connections.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release_slot(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let state = Arc::new(AppState::new(config.clone(), store));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = Router::new()
        .route(&config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Tether server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Query parameters accepted at upgrade time.
#[derive(Debug, Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

/// WebSocket upgrade handler with the identity-verification boundary.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let verified = match state.verifier.verify(params.token.as_deref()) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(error = %e, "Connection refused at auth boundary");
            metrics::record_error("auth");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    if !state.try_acquire_slot() {
        warn!(
            max = state.config.limits.max_connections,
            "Connection refused at capacity"
        );
        metrics::record_error("capacity");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| handle_websocket(socket, state, verified))
        .into_response()
}

/// Handle a WebSocket connection for its whole lifetime.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, verified: Option<String>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = format!(
        "conn_{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    );

    debug!(connection = %connection_id, verified = ?verified, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Outbound queue drained by this loop; every component reaches this
    // connection only through the handle.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let handle = ConnectionHandle::new(connection_id.clone(), outbound_tx);

    // Server-initiated heartbeat: ping on the interval, drop connections
    // idle past the timeout.
    let mut heartbeat =
        tokio::time::interval(Duration::from_millis(state.config.heartbeat.interval_ms));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let idle_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            biased;

            // Drain queued outbound events to the transport
            Some(event) = outbound_rx.recv() => {
                match codec::encode(&event) {
                    Ok(text) => {
                        metrics::record_message(text.len(), "outbound");
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(connection = %connection_id, error = %e, "Failed to encode event");
                        metrics::record_error("encode");
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    warn!(connection = %connection_id, "Connection idle past timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            // Receive from the transport
            msg = receiver.next() => {
                if let Some(Ok(_)) = &msg {
                    last_activity = Instant::now();
                }
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        metrics::record_message(text.len(), "inbound");

                        match codec::decode_with_limit(&text, state.config.limits.max_frame_size) {
                            Ok(event) => {
                                dispatch_event(event, &connection_id, &handle, &state, verified.as_deref()).await;
                            }
                            Err(e) => {
                                // Malformed events never kill the connection
                                warn!(connection = %connection_id, error = %e, "Dropped malformed event");
                                metrics::record_error("protocol");
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(connection = %connection_id, "Dropped unexpected binary frame");
                        metrics::record_error("protocol");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Implicit transport-level disconnect: reconcile everything this
    // connection touched.
    state.reconciler.handle_disconnect(&connection_id).await;
    state.release_slot();
    metrics::set_online_users(state.registry.online_count());
    metrics::set_active_channels(state.channels.channel_count());
    metrics::set_active_calls(state.calls.session_count());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Dispatch a decoded event to the component owning its namespace.
async fn dispatch_event(
    event: ClientEvent,
    connection_id: &str,
    handle: &ConnectionHandle,
    state: &Arc<AppState>,
    verified: Option<&str>,
) {
    debug!(connection = %connection_id, event = %event.name(), "Dispatch");

    match event {
        // Presence
        ClientEvent::UserOnline { user_id } => {
            if let Some(identity) = verified {
                if identity != user_id {
                    warn!(
                        connection = %connection_id,
                        claimed = %user_id,
                        verified = %identity,
                        "Identity mismatch, event dropped"
                    );
                    metrics::record_error("auth");
                    return;
                }
            }

            state.registry.set_online(&user_id, handle.clone());
            // The presence fan-out is owned here, not by the registry
            state.registry.broadcast_except(
                connection_id,
                &ServerEvent::user_status(&user_id, PresenceStatus::Online),
            );
            metrics::set_online_users(state.registry.online_count());
        }

        // Direct relay
        ClientEvent::SendMessage {
            sender_id,
            receiver_id,
            message,
            timestamp,
        } => {
            state
                .relay
                .deliver_message(&sender_id, &receiver_id, message, timestamp);
        }
        ClientEvent::UserTyping {
            sender_id,
            receiver_id,
        } => {
            state.relay.deliver_typing(&sender_id, &receiver_id);
        }
        ClientEvent::UserStopTyping {
            sender_id,
            receiver_id,
        } => {
            state.relay.deliver_stop_typing(&sender_id, &receiver_id);
        }

        // Call signaling
        ClientEvent::InitiateCall {
            caller_id,
            receiver_id,
            call_type,
            caller_name,
            caller_photo,
        } => {
            state
                .calls
                .initiate(&caller_id, &receiver_id, call_type, caller_name, caller_photo);
            metrics::set_active_calls(state.calls.session_count());
        }
        ClientEvent::AcceptCall {
            room_id,
            receiver_id,
            caller_id,
        } => {
            state.calls.accept(&room_id, &receiver_id, &caller_id);
        }
        ClientEvent::SendOffer {
            receiver_id,
            offer,
            room_id,
        } => {
            state.calls.forward_offer(&receiver_id, offer, &room_id);
        }
        ClientEvent::SendAnswer {
            caller_id,
            answer,
            room_id,
        } => {
            state.calls.forward_answer(&caller_id, answer, &room_id);
        }
        ClientEvent::SendIceCandidate {
            to_user_id,
            candidate,
            room_id,
        } => {
            state.calls.forward_candidate(&to_user_id, candidate, &room_id);
        }
        ClientEvent::RejectCall { room_id, caller_id } => {
            state.calls.reject(&room_id, &caller_id);
            metrics::set_active_calls(state.calls.session_count());
        }
        ClientEvent::EndCall {
            room_id,
            other_user_id,
        } => {
            state.calls.end(&room_id, &other_user_id);
            metrics::set_active_calls(state.calls.session_count());
        }

        // Group channels
        ClientEvent::JoinGroup { group_id, user_id } => {
            state.groups.join(&group_id, &user_id, handle.clone()).await;
            metrics::set_active_channels(state.channels.channel_count());
        }
        ClientEvent::LeaveGroup { group_id, user_id } => {
            state.groups.leave(&group_id, &user_id, connection_id);
            metrics::set_active_channels(state.channels.channel_count());
        }
        ClientEvent::GroupMessage {
            group_id,
            sender_id,
            text,
            image,
            video,
            sender_name,
            sender_photo,
        } => {
            state
                .groups
                .broadcast_message(
                    &group_id,
                    &sender_id,
                    text,
                    image,
                    video,
                    sender_name,
                    sender_photo,
                )
                .await;
        }

        // Meetings
        ClientEvent::StartGroupMeeting {
            group_id,
            user_id,
            room_id,
            user_name,
        } => {
            state
                .meetings
                .start(&group_id, &user_id, user_name, &room_id, handle.clone())
                .await;
            metrics::set_active_meetings(state.meetings.live_count());
        }
        ClientEvent::JoinGroupMeeting {
            room_id,
            user_id,
            user_name,
        } => {
            state
                .meetings
                .join(&room_id, &user_id, user_name, handle.clone())
                .await;
        }
        ClientEvent::LeaveGroupMeeting { room_id, user_id } => {
            state.meetings.leave(&room_id, &user_id, connection_id).await;
        }
        ClientEvent::EndGroupMeeting { room_id } => {
            state.meetings.end(&room_id).await;
            metrics::set_active_meetings(state.meetings.live_count());
            metrics::set_active_channels(state.channels.channel_count());
        }
    }
}
