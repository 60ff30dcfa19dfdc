//! Bridge controller
//!
//! Composition root of the bridge. One controller is spawned per host
//! session; it runs as a single task that exclusively owns the enable flag,
//! the configuration snapshot, the reconnection supervisor and the one active
//! transport. Everything else talks to it through a [`BridgeHandle`].

mod actor;
pub mod host;

pub use host::{ChatHost, HostDispatcher, HostFailure, MessageData};

use crate::activity::LogEntry;
use crate::config::{BridgeConfig, DEFAULT_LOG_CAPACITY};
use crate::error::{BridgeError, BridgeResult};
use crate::supervisor::SupervisorState;
use crate::transport::{ConnectionState, DefaultTransportFactory, TransportFactory};
use actor::BridgeController;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Status indicator shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    /// Disabled, or enabled but not supervising
    Disconnected,
    /// Connect in flight, or listening for a peer
    Connecting,
    /// Frames flow to the external process
    Connected,
    /// Last attempt failed; a retry is scheduled
    Error,
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeStatus::Disconnected => "disconnected",
            BridgeStatus::Connecting => "connecting",
            BridgeStatus::Connected => "connected",
            BridgeStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeSnapshot {
    /// Administrative enable flag
    pub enabled: bool,
    /// Configuration the next connect will use
    pub config: BridgeConfig,
    /// State of the active transport, if any
    pub connection: Option<ConnectionState>,
    /// Supervisor state
    pub supervisor: SupervisorState,
    /// Status indicator
    pub status: BridgeStatus,
    /// Current connect generation
    pub generation: u64,
    /// Retries scheduled since the controller started
    pub retries_scheduled: u64,
}

pub(crate) enum Command {
    Enable,
    Disable,
    Reconfigure(BridgeConfig),
    Connect,
    Disconnect,
    MessageReceived(MessageData),
    Snapshot(oneshot::Sender<BridgeSnapshot>),
    RecentActivity(usize, oneshot::Sender<Vec<LogEntry>>),
    Shutdown(oneshot::Sender<()>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Enable => f.write_str("Enable"),
            Command::Disable => f.write_str("Disable"),
            Command::Reconfigure(config) => f.debug_tuple("Reconfigure").field(config).finish(),
            Command::Connect => f.write_str("Connect"),
            Command::Disconnect => f.write_str("Disconnect"),
            Command::MessageReceived(data) => {
                f.debug_tuple("MessageReceived").field(data).finish()
            }
            Command::Snapshot(_) => f.write_str("Snapshot"),
            Command::RecentActivity(limit, _) => {
                f.debug_tuple("RecentActivity").field(limit).finish()
            }
            Command::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

/// Cloneable handle to a running controller
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<BridgeStatus>,
}

/// Spawn a controller using the real transports
pub fn spawn(config: BridgeConfig, host: Arc<dyn ChatHost>) -> BridgeHandle {
    spawn_with_factory(
        config,
        host,
        Arc::new(DefaultTransportFactory),
        DEFAULT_LOG_CAPACITY,
    )
}

/// Spawn a controller with a custom transport factory and log capacity
///
/// If `config.enabled` is set the controller starts connecting immediately.
pub fn spawn_with_factory(
    config: BridgeConfig,
    host: Arc<dyn ChatHost>,
    factory: Arc<dyn TransportFactory>,
    log_capacity: usize,
) -> BridgeHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(BridgeStatus::Disconnected);

    let controller =
        BridgeController::new(config, host, factory, log_capacity, commands_rx, status_tx);
    tokio::spawn(controller.run());

    BridgeHandle {
        commands: commands_tx,
        status: status_rx,
    }
}

impl BridgeHandle {
    fn send(&self, command: Command) -> BridgeResult<()> {
        self.commands
            .send(command)
            .map_err(|_| BridgeError::ControllerStopped)
    }

    /// Enable the bridge and start supervising (idempotent)
    pub fn enable(&self) -> BridgeResult<()> {
        self.send(Command::Enable)
    }

    /// Disable the bridge, tear down the transport and cancel retries (idempotent)
    pub fn disable(&self) -> BridgeResult<()> {
        self.send(Command::Disable)
    }

    /// Apply a new configuration; endpoint changes while enabled force a reconnect
    pub fn reconfigure(&self, config: BridgeConfig) -> BridgeResult<()> {
        config.validate()?;
        self.send(Command::Reconfigure(config))
    }

    /// Drop the current connection and connect again now (enabled bridges only)
    pub fn connect(&self) -> BridgeResult<()> {
        self.send(Command::Connect)
    }

    /// Close the connection without scheduling a retry
    pub fn disconnect(&self) -> BridgeResult<()> {
        self.send(Command::Disconnect)
    }

    /// Deliver the host's `message_received` event
    pub fn message_received(&self, data: MessageData) -> BridgeResult<()> {
        self.send(Command::MessageReceived(data))
    }

    /// Current status indicator
    pub fn status(&self) -> BridgeStatus {
        *self.status.borrow()
    }

    /// Watch the status indicator
    pub fn subscribe_status(&self) -> watch::Receiver<BridgeStatus> {
        self.status.clone()
    }

    /// Wait until the status indicator equals `status`
    pub async fn wait_for_status(&self, status: BridgeStatus) -> BridgeResult<()> {
        let mut rx = self.status.clone();
        rx.wait_for(|s| *s == status)
            .await
            .map(|_| ())
            .map_err(|_| BridgeError::ControllerStopped)
    }

    /// Query the controller's state
    pub async fn snapshot(&self) -> BridgeResult<BridgeSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| BridgeError::ControllerStopped)
    }

    /// Up to `limit` activity log entries, newest first
    pub async fn recent_activity(&self, limit: usize) -> BridgeResult<Vec<LogEntry>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::RecentActivity(limit, tx))?;
        rx.await.map_err(|_| BridgeError::ControllerStopped)
    }

    /// Tear everything down and stop the controller task
    pub async fn shutdown(&self) -> BridgeResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await.map_err(|_| BridgeError::ControllerStopped)
    }
}
