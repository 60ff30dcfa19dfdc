//! Server socket transport
//!
//! Listens on `{host}:{port}` and accepts websocket peers on any path. Only
//! one peer is addressable at a time: a new peer replaces the current one
//! (last-connect-wins) and the replaced peer's connection is closed, so its
//! outstanding sends fail.
//!
//! While listening without a peer the state is `Connecting`; it becomes
//! `Connected` when a peer attaches and drops back when the peer leaves.

use super::{CloseReason, ConnectionState, NoticeSender, StateCell, Transport, TransportEvent};
use crate::codec::Envelope;
use crate::config::{BridgeConfig, TransportMode};
use crate::error::{ConnectError, SendFailure};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Interval between keepalive pings sent to the peer
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

// The currently addressable peer
struct PeerSlot {
    id: Uuid,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Clone)]
struct ServerShared {
    state: StateCell,
    notices: NoticeSender,
    peer: Arc<Mutex<Option<PeerSlot>>>,
    closing: Arc<AtomicBool>,
}

/// Listening websocket transport
pub struct ServerSocketTransport {
    config: BridgeConfig,
    shared: ServerShared,
    serve_task: Option<JoinHandle<()>>,
}

impl ServerSocketTransport {
    /// Create a transport that is not yet listening
    pub fn new(config: BridgeConfig, notices: NoticeSender) -> Self {
        Self {
            config,
            shared: ServerShared {
                state: StateCell::new(),
                notices,
                peer: Arc::new(Mutex::new(None)),
                closing: Arc::new(AtomicBool::new(false)),
            },
            serve_task: None,
        }
    }

    /// ID of the attached peer, if any
    pub async fn peer_id(&self) -> Option<Uuid> {
        self.shared.peer.lock().await.as_ref().map(|p| p.id)
    }
}

#[async_trait]
impl Transport for ServerSocketTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::ServerSocket
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        let endpoint = self.config.endpoint();
        self.shared.state.set(ConnectionState::Connecting);

        let listener =
            match tokio::net::TcpListener::bind((self.config.host.as_str(), self.config.port))
                .await
            {
                Ok(listener) => listener,
                Err(e) => {
                    self.shared.state.set(ConnectionState::Disconnected);
                    return Err(ConnectError::Unreachable {
                        endpoint,
                        reason: e.to_string(),
                    });
                }
            };

        let app = Router::new()
            .route("/", get(peer_handler))
            .route("/*path", get(peer_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.shared.clone());

        let shared = self.shared.clone();
        let serve_task = tokio::spawn(async move {
            let reason = match axum::serve(listener, app).await {
                Ok(()) => CloseReason::Error("listener stopped".to_string()),
                Err(e) => CloseReason::Error(e.to_string()),
            };
            if shared.closing.load(Ordering::SeqCst) {
                return;
            }
            error!(reason = %reason, "Websocket listener stopped unexpectedly");
            shared.peer.lock().await.take();
            shared.state.transition(
                ConnectionState::Disconnected,
                &shared.notices,
                TransportEvent::Closed(reason),
            );
        });

        self.serve_task = Some(serve_task);
        info!(endpoint = %endpoint, "Listening for websocket peers");
        Ok(())
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), SendFailure> {
        if self.shared.state.get() != ConnectionState::Connected {
            return Err(SendFailure::NotConnected);
        }
        let peer = self.shared.peer.lock().await;
        let slot = peer.as_ref().ok_or(SendFailure::NotConnected)?;
        slot.tx
            .send(Message::Text(envelope.encode()))
            .map_err(|_| SendFailure::Transport(format!("peer {} is gone", slot.id)))
    }

    async fn close(&mut self) {
        let Some(serve_task) = self.serve_task.take() else {
            self.shared.state.set(ConnectionState::Disconnected);
            return;
        };

        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.state.set(ConnectionState::Closing);

        if let Some(peer) = self.shared.peer.lock().await.take() {
            let _ = peer.tx.send(Message::Close(None));
        }
        // The listener lives in the serve task; wait for it to drop so the
        // port is free once close() returns
        serve_task.abort();
        let _ = serve_task.await;

        self.shared.state.transition(
            ConnectionState::Disconnected,
            &self.shared.notices,
            TransportEvent::Closed(CloseReason::Local),
        );
        info!(endpoint = %self.config.endpoint(), "Websocket listener closed");
    }
}

impl Drop for ServerSocketTransport {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        if let Some(serve_task) = self.serve_task.take() {
            serve_task.abort();
        }
        if let Ok(mut peer) = self.shared.peer.try_lock() {
            if let Some(peer) = peer.take() {
                let _ = peer.tx.send(Message::Close(None));
            }
        }
    }
}

async fn peer_handler(ws: WebSocketUpgrade, State(shared): State<ServerShared>) -> Response {
    ws.on_upgrade(move |socket| handle_peer(socket, shared))
}

async fn handle_peer(socket: WebSocket, shared: ServerShared) {
    if shared.closing.load(Ordering::SeqCst) {
        return;
    }

    let id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let previous = shared.peer.lock().await.replace(PeerSlot { id, tx: tx.clone() });
    if let Some(previous) = previous {
        warn!(old_peer = %previous.id, new_peer = %id, "Replacing connected peer");
        let _ = previous.tx.send(Message::Close(None));
    }
    shared
        .state
        .transition(ConnectionState::Connected, &shared.notices, TransportEvent::Opened);
    info!(peer = %id, "Websocket peer connected");

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if let Err(e) = sender.send(msg).await {
                error!(error = %e, "Failed to send frame to peer");
                break;
            }
            if is_close {
                break;
            }
        }
    });

    // Keepalive
    let ping_tx = tx.downgrade();
    drop(tx);
    let mut ping_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(PING_INTERVAL).await;
            let Some(tx) = ping_tx.upgrade() else {
                break;
            };
            if tx.send(Message::Ping(vec![])).is_err() {
                break;
            }
        }
    });

    let notices = shared.notices.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    notices.notify(TransportEvent::Received(text));
                }
                Ok(Message::Close(_)) => {
                    debug!("Peer sent close frame");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Websocket peer error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            ping_task.abort();
            recv_task.abort();
        }
        _ = &mut ping_task => {
            send_task.abort();
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
            ping_task.abort();
        }
    }

    // Only the peer still in the slot moves the state back to listening
    let mut peer = shared.peer.lock().await;
    if peer.as_ref().map(|p| p.id) == Some(id) {
        peer.take();
        drop(peer);
        if !shared.closing.load(Ordering::SeqCst) {
            shared.state.transition(
                ConnectionState::Connecting,
                &shared.notices,
                TransportEvent::PeerLeft,
            );
        }
    }
    info!(peer = %id, "Websocket peer disconnected");
}
