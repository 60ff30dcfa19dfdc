//! Reconnection supervisor
//!
//! State machine governing when the controller (re)connects:
//!
//! ```text
//! Idle → Connecting → Connected → (closed | failed) → WaitingRetry → Connecting → …
//!   ↑__________________________ stop() from any state ___________________________|
//! ```
//!
//! Every connect attempt gets a fresh generation number. Retry timers and
//! connect completions carry the generation they were issued for and are
//! ignored once it is stale, so a timer scheduled before `stop()` can never
//! re-open a disabled bridge. Retries run at a fixed delay, forever, while
//! the bridge is enabled.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Supervisor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// Not supervising; the bridge is disabled or disconnected
    Idle,
    /// A connect attempt is in flight
    Connecting,
    /// The transport is established
    Connected,
    /// A retry is scheduled
    WaitingRetry,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Connecting => "connecting",
            SupervisorState::Connected => "connected",
            SupervisorState::WaitingRetry => "waiting_retry",
        };
        f.write_str(name)
    }
}

/// Timer expiry delivered to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDue {
    /// Generation the retry was scheduled for
    pub generation: u64,
}

/// Handle to a scheduled retry; cancelling or dropping it stops the timer
#[derive(Debug)]
pub struct RetryHandle {
    generation: u64,
    task: JoinHandle<()>,
}

impl RetryHandle {
    /// Deliver `RetryDue { generation }` on `tx` after `delay`
    pub fn schedule(delay: Duration, generation: u64, tx: mpsc::UnboundedSender<RetryDue>) -> Self {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(RetryDue { generation });
        });
        Self { generation, task }
    }

    /// Generation this retry belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stop the timer
    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for RetryHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Reconnection supervisor
#[derive(Debug)]
pub struct Supervisor {
    state: SupervisorState,
    generation: u64,
    retry_delay: Duration,
    pending_retry: Option<RetryHandle>,
    retry_tx: mpsc::UnboundedSender<RetryDue>,
    retries_scheduled: u64,
}

impl Supervisor {
    /// Create an idle supervisor delivering retry timers on `retry_tx`
    pub fn new(retry_delay: Duration, retry_tx: mpsc::UnboundedSender<RetryDue>) -> Self {
        Self {
            state: SupervisorState::Idle,
            generation: 0,
            retry_delay,
            pending_retry: None,
            retry_tx,
            retries_scheduled: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `generation` is the live one
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Whether a retry timer is pending
    pub fn retry_pending(&self) -> bool {
        self.pending_retry.is_some()
    }

    /// Total retries scheduled since creation
    pub fn retries_scheduled(&self) -> u64 {
        self.retries_scheduled
    }

    /// Change the retry delay used for the next scheduled retry
    pub fn set_retry_delay(&mut self, delay: Duration) {
        self.retry_delay = delay;
    }

    /// Begin supervising. Returns the generation to connect with, or `None`
    /// if already running.
    pub fn start(&mut self) -> Option<u64> {
        if self.state != SupervisorState::Idle {
            debug!(state = %self.state, "Supervisor already running");
            return None;
        }
        Some(self.begin_attempt())
    }

    /// Abandon the current attempt and connect again immediately
    pub fn restart(&mut self) -> u64 {
        self.cancel_retry();
        self.begin_attempt()
    }

    /// Stop supervising. Cancels any pending retry and invalidates any
    /// in-flight connect. Returns whether it was running.
    pub fn stop(&mut self) -> bool {
        self.cancel_retry();
        let was_running = self.state != SupervisorState::Idle;
        self.generation += 1;
        self.state = SupervisorState::Idle;
        if was_running {
            info!(generation = self.generation, "Supervisor stopped");
        }
        was_running
    }

    /// A connect attempt succeeded. Returns false if the attempt is stale
    /// and the caller must close the transport it produced.
    pub fn connect_succeeded(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != SupervisorState::Connecting {
            return false;
        }
        self.state = SupervisorState::Connected;
        true
    }

    /// A connect attempt failed or an established connection closed
    /// unsolicited. Schedules exactly one retry; returns false if stale.
    pub fn connection_lost(&mut self, generation: u64) -> bool {
        if generation != self.generation
            || !matches!(
                self.state,
                SupervisorState::Connecting | SupervisorState::Connected
            )
        {
            return false;
        }

        self.cancel_retry();
        self.state = SupervisorState::WaitingRetry;
        self.retries_scheduled += 1;
        self.pending_retry = Some(RetryHandle::schedule(
            self.retry_delay,
            generation,
            self.retry_tx.clone(),
        ));
        info!(
            generation = generation,
            delay_secs = self.retry_delay.as_secs_f64(),
            "Reconnect scheduled"
        );
        true
    }

    /// A retry timer fired. Returns the generation to connect with, or
    /// `None` if the timer is stale.
    pub fn retry_due(&mut self, due: RetryDue) -> Option<u64> {
        if due.generation != self.generation || self.state != SupervisorState::WaitingRetry {
            debug!(generation = due.generation, "Ignoring stale retry timer");
            return None;
        }
        self.pending_retry = None;
        Some(self.begin_attempt())
    }

    fn begin_attempt(&mut self) -> u64 {
        self.generation += 1;
        self.state = SupervisorState::Connecting;
        self.generation
    }

    fn cancel_retry(&mut self) {
        if let Some(handle) = self.pending_retry.take() {
            debug!(generation = handle.generation(), "Cancelling pending retry");
            handle.cancel();
        }
    }
}
