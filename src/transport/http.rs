//! HTTP POST transport
//!
//! No persistent connection: each outbound envelope is a single
//! fire-and-forget POST to `http://{host}:{port}{path}`. Inbound relay is not
//! supported in this mode.

use super::{CloseReason, ConnectionState, NoticeSender, StateCell, Transport, TransportEvent};
use crate::codec::Envelope;
use crate::config::{BridgeConfig, TransportMode};
use crate::error::{ConnectError, SendFailure};
use async_trait::async_trait;
use tracing::{debug, error, info};

/// One-shot HTTP transport
pub struct HttpPostTransport {
    config: BridgeConfig,
    state: StateCell,
    notices: NoticeSender,
    client: Option<reqwest::Client>,
}

impl HttpPostTransport {
    /// Create a transport without an HTTP client
    pub fn new(config: BridgeConfig, notices: NoticeSender) -> Self {
        Self {
            config,
            state: StateCell::new(),
            notices,
            client: None,
        }
    }
}

#[async_trait]
impl Transport for HttpPostTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::HttpPost
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        self.state.set(ConnectionState::Connecting);
        let client = reqwest::Client::builder()
            .timeout(self.config.connect_timeout)
            .build()
            .map_err(|e| {
                self.state.set(ConnectionState::Disconnected);
                ConnectError::InvalidConfig(format!("Failed to build HTTP client: {}", e))
            })?;

        self.client = Some(client);
        self.state
            .transition(ConnectionState::Connected, &self.notices, TransportEvent::Opened);
        info!(url = %self.config.http_url(), "HTTP transport ready");
        Ok(())
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), SendFailure> {
        if self.state.get() != ConnectionState::Connected {
            return Err(SendFailure::NotConnected);
        }
        let client = self.client.clone().ok_or(SendFailure::NotConnected)?;
        let url = self.config.http_url();
        let envelope = envelope.clone();
        let notices = self.notices.clone();

        tokio::spawn(async move {
            debug!(url = %url, kind = %envelope.kind, "Posting envelope");
            let failure = match client.post(&url).json(&envelope).send().await {
                Ok(response) if response.status().is_success() => None,
                Ok(response) => Some(format!(
                    "POST {} returned status {}",
                    url,
                    response.status().as_u16()
                )),
                Err(e) => Some(format!("POST {} failed: {}", url, e)),
            };
            if let Some(failure) = failure {
                error!(error = %failure, "HTTP send failed");
                notices.notify(TransportEvent::SendFailed(failure));
            }
        });
        Ok(())
    }

    async fn close(&mut self) {
        if self.client.take().is_none() {
            self.state.set(ConnectionState::Disconnected);
            return;
        }
        self.state.set(ConnectionState::Closing);
        self.state.transition(
            ConnectionState::Disconnected,
            &self.notices,
            TransportEvent::Closed(CloseReason::Local),
        );
        info!("HTTP transport closed");
    }
}
