//! Controller task
//!
//! Every field here is touched only from `run`, one message at a time, so no
//! state is shared or locked. The only suspension points are transport sends
//! and closes; connects run in their own task and report back.

use super::host::{ChatHost, HostDispatcher, HostFailure, MessageData};
use super::{BridgeSnapshot, BridgeStatus, Command};
use crate::activity::{ActivityLog, LogCategory};
use crate::codec::{self, Envelope, EnvelopeKind};
use crate::config::BridgeConfig;
use crate::error::ConnectError;
use crate::supervisor::{RetryDue, Supervisor, SupervisorState};
use crate::transport::{
    ConnectionState, NoticeSender, Transport, TransportEvent, TransportFactory, TransportNotice,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

// Result of a connect attempt, with the transport handed back to the controller
struct ConnectOutcome {
    generation: u64,
    transport: Box<dyn Transport>,
    result: Result<(), ConnectError>,
}

// The one connect task allowed to run at a time
struct InFlightConnect {
    generation: u64,
    cancel: Option<oneshot::Sender<()>>,
}

struct ActiveTransport {
    generation: u64,
    transport: Box<dyn Transport>,
}

pub(super) struct BridgeController {
    config: BridgeConfig,
    factory: Arc<dyn TransportFactory>,
    supervisor: Supervisor,
    active: Option<ActiveTransport>,
    // Notices from the in-flight connect that arrived before its outcome
    early_notices: Vec<TransportNotice>,
    in_flight: Option<InFlightConnect>,
    // Generation waiting for the in-flight attempt to release its endpoint
    deferred_connect: Option<u64>,
    dispatcher: HostDispatcher,
    activity: ActivityLog,
    status: watch::Sender<BridgeStatus>,

    commands: mpsc::UnboundedReceiver<Command>,
    notice_tx: mpsc::UnboundedSender<TransportNotice>,
    notices: mpsc::UnboundedReceiver<TransportNotice>,
    connect_tx: mpsc::UnboundedSender<ConnectOutcome>,
    connects: mpsc::UnboundedReceiver<ConnectOutcome>,
    retries: mpsc::UnboundedReceiver<RetryDue>,
    host_failures: mpsc::UnboundedReceiver<HostFailure>,
}

impl BridgeController {
    pub(super) fn new(
        config: BridgeConfig,
        host: Arc<dyn ChatHost>,
        factory: Arc<dyn TransportFactory>,
        log_capacity: usize,
        commands: mpsc::UnboundedReceiver<Command>,
        status: watch::Sender<BridgeStatus>,
    ) -> Self {
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let (connect_tx, connects) = mpsc::unbounded_channel();
        let (retry_tx, retries) = mpsc::unbounded_channel();
        let (failures_tx, host_failures) = mpsc::unbounded_channel();

        Self {
            supervisor: Supervisor::new(config.retry_delay, retry_tx),
            config,
            factory,
            active: None,
            early_notices: Vec::new(),
            in_flight: None,
            deferred_connect: None,
            dispatcher: HostDispatcher::spawn(host, failures_tx),
            activity: ActivityLog::new(log_capacity),
            status,
            commands,
            notice_tx,
            notices,
            connect_tx,
            connects,
            retries,
            host_failures,
        }
    }

    pub(super) async fn run(mut self) {
        info!(
            enabled = self.config.enabled,
            mode = %self.config.transport_mode,
            port = self.config.port,
            "Bridge controller started"
        );
        if self.config.enabled {
            self.activity.info("Bridge is enabled, attempting connection");
            self.start_supervising();
        } else {
            self.activity.info("Bridge is disabled");
        }
        self.refresh_status();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(outcome) = self.connects.recv() => self.handle_connect_outcome(outcome).await,
                Some(notice) = self.notices.recv() => self.handle_notice(notice).await,
                Some(due) = self.retries.recv() => self.handle_retry(due),
                Some(failure) = self.host_failures.recv() => {
                    self.activity.error(format!(
                        "Host rejected injected message ({} chars): {}",
                        failure.content.chars().count(),
                        failure.reason
                    ));
                }
            }
            self.refresh_status();
        }

        info!("Bridge controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        debug!(command = ?command, "Handling command");
        match command {
            Command::Enable => self.enable(),
            Command::Disable => self.disable().await,
            Command::Reconfigure(config) => self.reconfigure(config).await,
            Command::Connect => self.force_connect().await,
            Command::Disconnect => self.disconnect().await,
            Command::MessageReceived(data) => self.forward(data).await,
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::RecentActivity(limit, reply) => {
                let _ = reply.send(self.activity.recent(limit));
            }
            // Handled in run()
            Command::Shutdown(_) => {}
        }
    }

    fn enable(&mut self) {
        if self.config.enabled && self.supervisor.state() != SupervisorState::Idle {
            debug!("Bridge already enabled");
            return;
        }
        self.config.enabled = true;
        self.activity.info("Bridge enabled, connecting");
        self.start_supervising();
    }

    async fn disable(&mut self) {
        let was_enabled = self.config.enabled;
        self.config.enabled = false;
        self.supervisor.stop();
        self.abandon_attempt();
        self.teardown().await;
        if was_enabled {
            self.activity.info("Bridge disabled");
        }
    }

    async fn reconfigure(&mut self, config: BridgeConfig) {
        if let Err(e) = config.validate() {
            self.activity.error(format!("Rejected configuration: {}", e));
            return;
        }

        let endpoint_changed = self.config.endpoint_changed(&config);
        let was_enabled = self.config.enabled;
        let wants_enabled = config.enabled;

        self.supervisor.set_retry_delay(config.retry_delay);
        self.config = BridgeConfig {
            enabled: was_enabled,
            ..config
        };

        match (was_enabled, wants_enabled) {
            (false, true) => self.enable(),
            (true, false) => self.disable().await,
            (true, true) if endpoint_changed => {
                self.activity.info(format!(
                    "Configuration changed, reconnecting to {}",
                    self.config.endpoint()
                ));
                self.reconnect_now().await;
            }
            _ => debug!("Configuration updated without reconnect"),
        }
    }

    async fn force_connect(&mut self) {
        if !self.config.enabled {
            self.activity.info("Bridge is disabled; enable it before connecting");
            return;
        }
        self.activity
            .info(format!("Connecting to {}", self.config.endpoint()));
        self.reconnect_now().await;
    }

    async fn disconnect(&mut self) {
        self.supervisor.stop();
        self.abandon_attempt();
        if self.active.is_some() {
            self.teardown().await;
            self.activity.info("Disconnected");
        }
    }

    // Forward an assistant message; dropped unless connected (no queueing)
    async fn forward(&mut self, data: MessageData) {
        let Some(active) = self.active.as_mut() else {
            debug!("Not connected, dropping message_received event");
            return;
        };
        if active.transport.state() != ConnectionState::Connected {
            debug!(state = %active.transport.state(), "Not connected, dropping message_received event");
            return;
        }

        let envelope = Envelope::bot_response(data.message);
        match active.transport.send(&envelope).await {
            Ok(()) => self.activity.record(
                LogCategory::Sent,
                format!("Sent bot_response ({} chars)", envelope.content.chars().count()),
            ),
            Err(e) => self
                .activity
                .error(format!("Failed to send bot_response: {}", e)),
        }
    }

    fn start_supervising(&mut self) {
        if let Some(generation) = self.supervisor.start() {
            self.start_connect(generation);
        }
    }

    async fn reconnect_now(&mut self) {
        self.teardown().await;
        let generation = self.supervisor.restart();
        self.early_notices.clear();
        self.start_connect(generation);
    }

    // Cancel the in-flight connect and forget anything queued behind it
    fn abandon_attempt(&mut self) {
        if let Some(cancel) = self.in_flight.as_mut().and_then(|f| f.cancel.take()) {
            let _ = cancel.send(());
        }
        self.deferred_connect = None;
        self.early_notices.clear();
    }

    fn start_connect(&mut self, generation: u64) {
        // One attempt at a time: a listener from the previous attempt would
        // still hold the port
        if let Some(in_flight) = self.in_flight.as_mut() {
            debug!(
                generation = generation,
                in_flight = in_flight.generation,
                "Deferring connect until the previous attempt finishes"
            );
            if let Some(cancel) = in_flight.cancel.take() {
                let _ = cancel.send(());
            }
            self.deferred_connect = Some(generation);
            return;
        }

        let notices = NoticeSender::new(generation, self.notice_tx.clone());
        let mut transport = self.factory.build(&self.config, notices);
        let connect_tx = self.connect_tx.clone();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.in_flight = Some(InFlightConnect {
            generation,
            cancel: Some(cancel_tx),
        });

        debug!(
            generation = generation,
            endpoint = %self.config.endpoint(),
            "Starting connect attempt"
        );
        tokio::spawn(async move {
            let finished = tokio::select! {
                result = transport.connect() => Some(result),
                _ = cancel_rx => None,
            };
            let result = match finished {
                Some(result) => result,
                None => {
                    transport.close().await;
                    Err(ConnectError::Cancelled)
                }
            };
            let _ = connect_tx.send(ConnectOutcome {
                generation,
                transport,
                result,
            });
        });
    }

    async fn handle_connect_outcome(&mut self, outcome: ConnectOutcome) {
        if self.in_flight.as_ref().map(|f| f.generation) == Some(outcome.generation) {
            self.in_flight = None;
        }
        self.apply_connect_outcome(outcome).await;

        if self.in_flight.is_none() {
            if let Some(generation) = self.deferred_connect.take() {
                if self.supervisor.is_current(generation)
                    && self.supervisor.state() == SupervisorState::Connecting
                {
                    self.start_connect(generation);
                }
            }
        }
    }

    async fn apply_connect_outcome(&mut self, outcome: ConnectOutcome) {
        let ConnectOutcome {
            generation,
            mut transport,
            result,
        } = outcome;

        let (early, rest): (Vec<TransportNotice>, Vec<TransportNotice>) =
            std::mem::take(&mut self.early_notices)
                .into_iter()
                .partition(|n| n.generation == generation);
        let current = self.supervisor.generation();
        self.early_notices = rest
            .into_iter()
            .filter(|n| n.generation == current)
            .collect();

        match result {
            Ok(()) => {
                if !self.supervisor.connect_succeeded(generation) {
                    // Disabled or superseded while connecting
                    info!(generation = generation, "Closing connection that completed too late");
                    transport.close().await;
                    return;
                }
                self.teardown().await;
                self.activity
                    .info(format!("Connected via {} to {}", transport.mode(), self.config.endpoint()));
                self.active = Some(ActiveTransport {
                    generation,
                    transport,
                });
                for notice in early {
                    self.handle_notice(notice).await;
                }
            }
            Err(e) => {
                if !self.supervisor.is_current(generation) {
                    debug!(generation = generation, error = %e, "Ignoring stale connect failure");
                    return;
                }
                self.activity.error(format!("Failed to connect: {}", e));
                if self.supervisor.connection_lost(generation) {
                    self.activity.info(format!(
                        "Retrying in {} seconds",
                        self.config.retry_delay.as_secs()
                    ));
                }
            }
        }
    }

    async fn handle_notice(&mut self, notice: TransportNotice) {
        let current = self.active.as_ref().map(|a| a.generation);
        if current != Some(notice.generation) {
            if current.is_none()
                && self.supervisor.state() == SupervisorState::Connecting
                && self.supervisor.is_current(notice.generation)
            {
                self.early_notices.push(notice);
                return;
            }
            debug!(generation = notice.generation, event = ?notice.event, "Ignoring stale transport notice");
            return;
        }

        match notice.event {
            TransportEvent::Opened => self.activity.info("Peer connected"),
            TransportEvent::PeerLeft => self.activity.info("Peer disconnected, waiting for a new one"),
            TransportEvent::Received(raw) => self.handle_inbound(raw),
            TransportEvent::Failed(reason) => {
                self.activity.error(format!("Transport error: {}", reason))
            }
            TransportEvent::SendFailed(reason) => {
                self.activity.error(format!("Send failed: {}", reason))
            }
            TransportEvent::Closed(reason) => {
                if !reason.is_unsolicited() {
                    return;
                }
                self.active = None;
                self.activity
                    .info(format!("Disconnected from external process ({})", reason));
                if self.config.enabled && self.supervisor.connection_lost(notice.generation) {
                    self.activity.info(format!(
                        "Retrying in {} seconds",
                        self.config.retry_delay.as_secs()
                    ));
                }
            }
        }
    }

    // Untrusted input: nothing here may fail the receive path
    fn handle_inbound(&mut self, raw: String) {
        let envelope = match codec::decode(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.activity.error(format!("Dropped inbound frame: {}", e));
                return;
            }
        };

        match envelope.kind() {
            EnvelopeKind::SendMessage => {
                self.activity.record(
                    LogCategory::Received,
                    format!(
                        "Received send_message ({} chars)",
                        envelope.content.chars().count()
                    ),
                );
                if !self.dispatcher.dispatch(envelope.content) {
                    warn!("Host dispatcher has stopped");
                }
            }
            EnvelopeKind::BotResponse | EnvelopeKind::Unknown(_) => {
                self.activity
                    .info(format!("Ignored inbound envelope of type '{}'", envelope.kind));
            }
        }
    }

    fn handle_retry(&mut self, due: RetryDue) {
        if let Some(generation) = self.supervisor.retry_due(due) {
            self.activity
                .info(format!("Reconnecting to {}", self.config.endpoint()));
            self.start_connect(generation);
        }
    }

    async fn teardown(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.transport.close().await;
        }
    }

    async fn shutdown(&mut self) {
        self.supervisor.stop();
        self.abandon_attempt();
        self.teardown().await;
        self.refresh_status();
    }

    fn current_status(&self) -> BridgeStatus {
        match self.supervisor.state() {
            SupervisorState::Idle => BridgeStatus::Disconnected,
            SupervisorState::WaitingRetry => BridgeStatus::Error,
            SupervisorState::Connecting => BridgeStatus::Connecting,
            SupervisorState::Connected => match self.active.as_ref().map(|a| a.transport.state()) {
                Some(ConnectionState::Connected) => BridgeStatus::Connected,
                Some(_) => BridgeStatus::Connecting,
                None => BridgeStatus::Disconnected,
            },
        }
    }

    fn refresh_status(&mut self) {
        let status = self.current_status();
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn snapshot(&self) -> BridgeSnapshot {
        BridgeSnapshot {
            enabled: self.config.enabled,
            config: self.config.clone(),
            connection: self.active.as_ref().map(|a| a.transport.state()),
            supervisor: self.supervisor.state(),
            status: self.current_status(),
            generation: self.supervisor.generation(),
            retries_scheduled: self.supervisor.retries_scheduled(),
        }
    }
}
