//! Transports
//!
//! A transport owns one underlying connection to the external process and
//! reports lifecycle events to the controller as [`TransportNotice`]s.
//!
//! Every notice carries the generation of the connect attempt that built the
//! transport, so the controller can discard notices from a transport it has
//! already replaced. The queryable [`ConnectionState`] is always updated before
//! the matching notice is sent.

pub mod client;
pub mod http;
pub mod server;

pub use client::ClientSocketTransport;
pub use http::HttpPostTransport;
pub use server::ServerSocketTransport;

use crate::codec::Envelope;
use crate::config::{BridgeConfig, TransportMode};
use crate::error::{ConnectError, SendFailure};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Lifecycle state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection
    Disconnected,
    /// Handshake in progress, or listening without a peer
    Connecting,
    /// Frames can be sent
    Connected,
    /// Teardown in progress
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Why a transport closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote endpoint closed the connection
    Remote,
    /// `close()` was called
    Local,
    /// The connection or listener failed
    Error(String),
}

impl CloseReason {
    /// Whether this closure was not requested by the bridge
    pub fn is_unsolicited(&self) -> bool {
        !matches!(self, CloseReason::Local)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Remote => f.write_str("remote"),
            CloseReason::Local => f.write_str("local"),
            CloseReason::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Lifecycle events emitted by a transport after `connect` succeeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer is reachable and frames can be sent
    Opened,
    /// The connection is gone
    Closed(CloseReason),
    /// A raw text frame arrived
    Received(String),
    /// The connection failed; always followed by `Closed`
    Failed(String),
    /// Server mode only: the peer left, the listener is still up
    PeerLeft,
    /// A fire-and-forget send failed after `send` returned
    SendFailed(String),
}

/// A transport event tagged with the connect generation that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportNotice {
    /// Connect generation of the emitting transport
    pub generation: u64,
    /// The event
    pub event: TransportEvent,
}

/// Sending half of the transport → controller notification channel
#[derive(Debug, Clone)]
pub struct NoticeSender {
    generation: u64,
    tx: mpsc::UnboundedSender<TransportNotice>,
}

impl NoticeSender {
    /// Bind a channel to one connect generation
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TransportNotice>) -> Self {
        Self { generation, tx }
    }

    /// Generation this sender tags notices with
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Send an event; returns false once the controller is gone
    pub fn notify(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TransportNotice {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Shared, observable connection state
///
/// Cloned into a transport's background tasks so they can publish transitions.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<watch::Sender<ConnectionState>>);

impl StateCell {
    /// New cell in `Disconnected`
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self(Arc::new(tx))
    }

    /// Current state
    pub fn get(&self) -> ConnectionState {
        *self.0.borrow()
    }

    /// Replace the state, returning the previous one
    pub fn set(&self, state: ConnectionState) -> ConnectionState {
        self.0.send_replace(state)
    }

    /// Update the state, then notify
    pub fn transition(&self, state: ConnectionState, notices: &NoticeSender, event: TransportEvent) {
        self.set(state);
        notices.notify(event);
    }

    /// Watch for state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.0.subscribe()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// One connection to the external process
///
/// `connect` reports failure through its return value only; notices start
/// flowing once it has succeeded.
#[async_trait]
pub trait Transport: Send {
    /// Which mode this transport implements
    fn mode(&self) -> TransportMode;

    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Establish the connection
    async fn connect(&mut self) -> Result<(), ConnectError>;

    /// Send one envelope to the peer
    async fn send(&mut self, envelope: &Envelope) -> Result<(), SendFailure>;

    /// Tear the connection down; emits `Closed(Local)` if anything was open
    async fn close(&mut self);
}

/// Builds transports for the controller
///
/// The controller builds a fresh transport for every connect attempt.
pub trait TransportFactory: Send + Sync {
    /// Build an unconnected transport for `config`
    fn build(&self, config: &BridgeConfig, notices: NoticeSender) -> Box<dyn Transport>;
}

/// Factory building the real socket and HTTP transports
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn build(&self, config: &BridgeConfig, notices: NoticeSender) -> Box<dyn Transport> {
        match config.transport_mode {
            TransportMode::ClientSocket => {
                Box::new(ClientSocketTransport::new(config.clone(), notices))
            }
            TransportMode::ServerSocket => {
                Box::new(ServerSocketTransport::new(config.clone(), notices))
            }
            TransportMode::HttpPost => Box::new(HttpPostTransport::new(config.clone(), notices)),
        }
    }
}
