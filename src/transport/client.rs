//! Client socket transport
//!
//! Outbound websocket to `ws://{host}:{port}`. Frames are written by a
//! dedicated writer task fed from a channel; a reader task forwards text
//! frames and reports remote closure.

use super::{CloseReason, ConnectionState, NoticeSender, StateCell, Transport, TransportEvent};
use crate::codec::Envelope;
use crate::config::{BridgeConfig, TransportMode};
use crate::error::{ConnectError, SendFailure};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

// How long close() waits for the writer to flush the close frame
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Outbound websocket transport
pub struct ClientSocketTransport {
    config: BridgeConfig,
    state: StateCell,
    notices: NoticeSender,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    closing: Arc<AtomicBool>,
}

impl ClientSocketTransport {
    /// Create an unconnected transport
    pub fn new(config: BridgeConfig, notices: NoticeSender) -> Self {
        Self {
            config,
            state: StateCell::new(),
            notices,
            outbound: None,
            writer: None,
            reader: None,
            closing: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Transport for ClientSocketTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::ClientSocket
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        let url = self.config.ws_url();
        self.state.set(ConnectionState::Connecting);
        info!(url = %url, generation = self.notices.generation(), "Connecting to websocket server");

        let timeout = self.config.connect_timeout;
        let ws_stream = match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                self.state.set(ConnectionState::Disconnected);
                return Err(ConnectError::Unreachable {
                    endpoint: url,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.state.set(ConnectionState::Disconnected);
                return Err(ConnectError::Timeout(url, timeout.as_secs()));
            }
        };

        let (mut sink, mut stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let is_close = matches!(msg, WsMessage::Close(_));
                if let Err(e) = sink.send(msg).await {
                    error!(error = %e, "Failed to write websocket frame");
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let state = self.state.clone();
        let notices = self.notices.clone();
        let closing = self.closing.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        debug!(len = text.len(), "Received text frame");
                        notices.notify(TransportEvent::Received(text));
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            notices.notify(TransportEvent::Received(text));
                        }
                        Err(_) => warn!("Dropping non UTF-8 binary frame"),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!(frame = ?frame, "Server sent close frame");
                        break CloseReason::Remote;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break CloseReason::Error(e.to_string()),
                    None => break CloseReason::Remote,
                }
            };

            if closing.load(Ordering::SeqCst) {
                return;
            }
            if let CloseReason::Error(e) = &reason {
                error!(error = %e, "Websocket connection failed");
                state.transition(
                    ConnectionState::Disconnected,
                    &notices,
                    TransportEvent::Failed(e.clone()),
                );
            } else {
                info!("Websocket server closed the connection");
            }
            state.transition(
                ConnectionState::Disconnected,
                &notices,
                TransportEvent::Closed(reason),
            );
        });

        self.outbound = Some(tx);
        self.writer = Some(writer);
        self.reader = Some(reader);
        self.state
            .transition(ConnectionState::Connected, &self.notices, TransportEvent::Opened);
        info!(url = %self.config.ws_url(), "Connected to websocket server");
        Ok(())
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), SendFailure> {
        if self.state.get() != ConnectionState::Connected {
            return Err(SendFailure::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(SendFailure::NotConnected)?;
        outbound
            .send(WsMessage::Text(envelope.encode()))
            .map_err(|_| SendFailure::Transport("writer task has stopped".to_string()))
    }

    async fn close(&mut self) {
        if self.outbound.is_none() && self.reader.is_none() {
            self.state.set(ConnectionState::Disconnected);
            return;
        }

        self.closing.store(true, Ordering::SeqCst);
        self.state.set(ConnectionState::Closing);

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(WsMessage::Close(None));
        }
        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer)
                .await
                .is_err()
            {
                writer.abort();
            }
        }

        self.state.transition(
            ConnectionState::Disconnected,
            &self.notices,
            TransportEvent::Closed(CloseReason::Local),
        );
        info!(url = %self.config.ws_url(), "Websocket connection closed locally");
    }
}

impl Drop for ClientSocketTransport {
    fn drop(&mut self) {
        // Can't await here; abort whatever is still running
        self.closing.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}
