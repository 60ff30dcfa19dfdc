//! Host collaborator interface
//!
//! The host chat application is foreign code. The bridge consumes its
//! `message_received` events and calls its message-injection action; a
//! failure in that action is caught here and never reaches the transport's
//! receive path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Payload of the host's `message_received` event
///
/// Only `message` is read; any other fields the host attaches are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageData {
    /// Text of the assistant-authored message
    pub message: String,
}

impl MessageData {
    /// Wrap a message text
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Actions the bridge invokes on the host
#[async_trait]
pub trait ChatHost: Send + Sync + 'static {
    /// Inject `content` into the conversation as if the user had sent it
    async fn send_message(&self, content: String) -> anyhow::Result<()>;
}

/// A rejected or panicked injection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFailure {
    /// Content that could not be injected
    pub content: String,
    /// Why
    pub reason: String,
}

/// Runs host injections one at a time, in arrival order, off the receive path
#[derive(Debug, Clone)]
pub struct HostDispatcher {
    queue: mpsc::UnboundedSender<String>,
}

impl HostDispatcher {
    /// Spawn the worker; failures are reported on `failures`
    pub fn spawn(host: Arc<dyn ChatHost>, failures: mpsc::UnboundedSender<HostFailure>) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(content) = rx.recv().await {
                let host = host.clone();
                let injected = content.clone();
                // Own task so a panicking host action is contained too
                let outcome = tokio::spawn(async move { host.send_message(injected).await }).await;

                let reason = match outcome {
                    Ok(Ok(())) => {
                        debug!(len = content.len(), "Host accepted injected message");
                        continue;
                    }
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => format!("host action panicked: {}", e),
                };
                error!(error = %reason, "Host message injection failed");
                if failures.send(HostFailure { content, reason }).is_err() {
                    break;
                }
            }
        });

        Self { queue }
    }

    /// Queue `content` for injection; returns false if the worker is gone
    pub fn dispatch(&self, content: String) -> bool {
        self.queue.send(content).is_ok()
    }
}
