//! Controller behavior against a scripted transport
//!
//! Time is paused so the fixed retry delay can be stepped through exactly.

use async_trait::async_trait;
use chat_bridge::activity::LogCategory;
use chat_bridge::config::{BridgeConfig, TransportMode};
use chat_bridge::controller::{self, BridgeHandle, BridgeStatus, ChatHost, MessageData};
use chat_bridge::error::{ConnectError, SendFailure};
use chat_bridge::supervisor::SupervisorState;
use chat_bridge::transport::{
    CloseReason, ConnectionState, NoticeSender, StateCell, Transport, TransportEvent,
    TransportFactory,
};
use chat_bridge::Envelope;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Behavior of one connect attempt
#[derive(Debug, Clone, Copy, Default)]
struct Script {
    delay_ms: u64,
    fail: bool,
    /// Peer opens and hangs up before the connect call returns
    hang_up_early: bool,
}

/// Shared record of everything the scripted transports did
#[derive(Default)]
struct MockNet {
    scripts: Mutex<VecDeque<Script>>,
    sent: Mutex<Vec<String>>,
    built_ports: Mutex<Vec<u16>>,
    links: Mutex<Vec<(NoticeSender, StateCell)>>,
    open: AtomicUsize,
    fail_connects: AtomicBool,
    connect_delay_ms: AtomicUsize,
}

impl MockNet {
    /// Queue the behavior of the next built transport
    fn script(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    fn builds(&self) -> usize {
        self.built_ports.lock().unwrap().len()
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    fn latest_link(&self) -> (NoticeSender, StateCell) {
        self.links.lock().unwrap().last().cloned().unwrap()
    }

    /// Deliver a raw frame from the external process
    fn inbound(&self, raw: &str) {
        let (notices, _) = self.latest_link();
        notices.notify(TransportEvent::Received(raw.to_string()));
    }

    /// The external process hangs up
    fn remote_close(&self) {
        let (notices, state) = self.latest_link();
        state.transition(
            ConnectionState::Disconnected,
            &notices,
            TransportEvent::Closed(CloseReason::Remote),
        );
    }
}

struct MockTransport {
    net: Arc<MockNet>,
    script: Option<Script>,
    state: StateCell,
    notices: NoticeSender,
    counted: bool,
}

impl MockTransport {
    async fn run_script(&mut self, script: Script) -> Result<(), ConnectError> {
        if script.hang_up_early {
            self.state
                .transition(ConnectionState::Connected, &self.notices, TransportEvent::Opened);
            self.state.transition(
                ConnectionState::Disconnected,
                &self.notices,
                TransportEvent::Closed(CloseReason::Remote),
            );
        }
        tokio::time::sleep(Duration::from_millis(script.delay_ms)).await;
        if script.fail {
            self.state.set(ConnectionState::Disconnected);
            return Err(ConnectError::Unreachable {
                endpoint: "mock".to_string(),
                reason: "Connection refused".to_string(),
            });
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.counted {
            self.counted = false;
            self.net.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::ClientSocket
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        self.state.set(ConnectionState::Connecting);
        if let Some(script) = self.script {
            return self.run_script(script).await;
        }
        let delay = self.net.connect_delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.net.fail_connects.load(Ordering::SeqCst) {
            self.state.set(ConnectionState::Disconnected);
            return Err(ConnectError::Unreachable {
                endpoint: "mock".to_string(),
                reason: "Connection refused".to_string(),
            });
        }
        self.counted = true;
        self.net.open.fetch_add(1, Ordering::SeqCst);
        self.state
            .transition(ConnectionState::Connected, &self.notices, TransportEvent::Opened);
        Ok(())
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), SendFailure> {
        if self.state.get() != ConnectionState::Connected {
            return Err(SendFailure::NotConnected);
        }
        self.net.sent.lock().unwrap().push(envelope.encode());
        Ok(())
    }

    async fn close(&mut self) {
        self.release();
        self.state.transition(
            ConnectionState::Disconnected,
            &self.notices,
            TransportEvent::Closed(CloseReason::Local),
        );
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.release();
    }
}

struct MockFactory(Arc<MockNet>);

impl TransportFactory for MockFactory {
    fn build(&self, config: &BridgeConfig, notices: NoticeSender) -> Box<dyn Transport> {
        let state = StateCell::new();
        self.0.built_ports.lock().unwrap().push(config.port);
        self.0
            .links
            .lock()
            .unwrap()
            .push((notices.clone(), state.clone()));
        let script = self.0.scripts.lock().unwrap().pop_front();
        Box::new(MockTransport {
            net: self.0.clone(),
            script,
            state,
            notices,
            counted: false,
        })
    }
}

#[derive(Default)]
struct RecordingHost {
    injected: Mutex<Vec<String>>,
    reject: AtomicBool,
}

#[async_trait]
impl ChatHost for RecordingHost {
    async fn send_message(&self, content: String) -> anyhow::Result<()> {
        self.injected.lock().unwrap().push(content);
        if self.reject.load(Ordering::SeqCst) {
            anyhow::bail!("generation in progress");
        }
        Ok(())
    }
}

struct Harness {
    net: Arc<MockNet>,
    host: Arc<RecordingHost>,
    handle: BridgeHandle,
}

fn harness(enabled: bool) -> Harness {
    let net = Arc::new(MockNet::default());
    let host = Arc::new(RecordingHost::default());
    let config = BridgeConfig {
        enabled,
        ..Default::default()
    };
    let handle =
        controller::spawn_with_factory(config, host.clone(), Arc::new(MockFactory(net.clone())), 50);
    Harness { net, host, handle }
}

/// Let spawned tasks run until the controller has drained its inbox
async fn settle(handle: &BridgeHandle) {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    handle.snapshot().await.unwrap();
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
}

/// Poll until `check` holds; panics after a few simulated seconds
async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_message_dropped_while_disconnected() {
    let h = harness(false);
    h.handle.message_received(MessageData::new("hi")).unwrap();
    settle(&h.handle).await;
    assert!(h.net.sent().is_empty());

    // Nothing was queued for later either
    h.handle.enable().unwrap();
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();
    settle(&h.handle).await;
    assert!(h.net.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_connected_message_sends_exactly_one_frame() {
    let h = harness(true);
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();

    h.handle.message_received(MessageData::new("hi")).unwrap();
    settle(&h.handle).await;

    let sent = h.net.sent();
    assert_eq!(sent.len(), 1);
    let frame: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(
        frame,
        serde_json::json!({"type": "bot_response", "content": "hi"})
    );

    let activity = h.handle.recent_activity(10).await.unwrap();
    assert!(activity.iter().any(|e| e.category == LogCategory::Sent));
}

#[tokio::test(start_paused = true)]
async fn test_inbound_send_message_invokes_host_once() {
    let h = harness(true);
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();

    h.net.inbound(r#"{"type":"send_message","content":"hello"}"#);
    h.net.inbound(r#"{"type":"unknown","content":"x"}"#);
    eventually(|| !h.host.injected.lock().unwrap().is_empty()).await;
    settle(&h.handle).await;

    assert_eq!(*h.host.injected.lock().unwrap(), vec!["hello".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_order_is_preserved() {
    let h = harness(true);
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();

    for i in 0..5 {
        h.net
            .inbound(&format!(r#"{{"type":"send_message","content":"m{}"}}"#, i));
    }
    eventually(|| h.host.injected.lock().unwrap().len() == 5).await;

    assert_eq!(
        *h.host.injected.lock().unwrap(),
        vec!["m0", "m1", "m2", "m3", "m4"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_malformed_inbound_keeps_connection() {
    let h = harness(true);
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();

    h.net.inbound("{not json");
    h.net.inbound(r#"{"type":"send_message"}"#);
    settle(&h.handle).await;

    assert!(h.host.injected.lock().unwrap().is_empty());
    assert_eq!(h.handle.status(), BridgeStatus::Connected);
    assert_eq!(h.net.builds(), 1);
    let errors = h
        .handle
        .recent_activity(10)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.category == LogCategory::Error)
        .count();
    assert_eq!(errors, 2);
}

#[tokio::test(start_paused = true)]
async fn test_host_failure_is_isolated() {
    let h = harness(true);
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();
    h.host.reject.store(true, Ordering::SeqCst);

    h.net.inbound(r#"{"type":"send_message","content":"first"}"#);
    eventually(|| h.host.injected.lock().unwrap().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.host.reject.store(false, Ordering::SeqCst);
    h.net.inbound(r#"{"type":"send_message","content":"second"}"#);
    eventually(|| h.host.injected.lock().unwrap().len() == 2).await;
    settle(&h.handle).await;

    assert_eq!(*h.host.injected.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(h.handle.status(), BridgeStatus::Connected);
    let activity = h.handle.recent_activity(10).await.unwrap();
    assert!(activity
        .iter()
        .any(|e| e.category == LogCategory::Error && e.message.contains("generation in progress")));
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_close_schedules_one_retry_after_delay() {
    let h = harness(true);
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();

    h.net.remote_close();
    settle(&h.handle).await;
    assert_eq!(h.handle.status(), BridgeStatus::Error);
    assert_eq!(h.net.open(), 0);

    tokio::time::sleep(Duration::from_millis(4900)).await;
    settle(&h.handle).await;
    assert_eq!(h.net.builds(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();
    assert_eq!(h.net.builds(), 2);

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.retries_scheduled, 1);
    assert_eq!(snapshot.supervisor, SupervisorState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_disable_cancels_pending_retry() {
    let h = harness(false);
    h.net.fail_connects.store(true, Ordering::SeqCst);

    h.handle.enable().unwrap();
    h.handle.wait_for_status(BridgeStatus::Error).await.unwrap();
    assert_eq!(h.net.builds(), 1);

    h.handle.disable().unwrap();
    settle(&h.handle).await;
    h.net.fail_connects.store(false, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_secs(30)).await;
    settle(&h.handle).await;
    assert_eq!(h.net.builds(), 1);
    assert_eq!(h.handle.status(), BridgeStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failures_retry_forever_at_fixed_interval() {
    let h = harness(false);
    h.net.fail_connects.store(true, Ordering::SeqCst);
    h.handle.enable().unwrap();
    settle(&h.handle).await;

    // Attempts at t = 0, 5, 10, 15, 20
    tokio::time::sleep(Duration::from_millis(20_500)).await;
    settle(&h.handle).await;
    assert_eq!(h.net.builds(), 5);

    h.net.fail_connects.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(5)).await;
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();
    assert_eq!(h.net.builds(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_rapid_disable_enable_leaves_one_live_transport() {
    let h = harness(false);
    h.net.connect_delay_ms.store(100, Ordering::SeqCst);

    h.handle.enable().unwrap();
    h.handle.disable().unwrap();
    h.handle.enable().unwrap();
    h.handle.disable().unwrap();
    h.handle.enable().unwrap();

    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    settle(&h.handle).await;

    // Superseded attempts are cancelled before they are ever built
    assert_eq!(h.net.builds(), 2);
    assert_eq!(h.net.open(), 1);

    h.handle.message_received(MessageData::new("once")).unwrap();
    settle(&h.handle).await;
    assert_eq!(h.net.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_connect_after_disable_closes_itself() {
    let h = harness(false);
    h.net.connect_delay_ms.store(1000, Ordering::SeqCst);

    h.handle.enable().unwrap();
    settle(&h.handle).await;
    h.handle.disable().unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle(&h.handle).await;

    assert_eq!(h.net.open(), 0);
    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(!snapshot.enabled);
    assert!(snapshot.connection.is_none());
    assert_eq!(snapshot.status, BridgeStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_hang_up_before_connect_outcome_schedules_retry() {
    let h = harness(false);
    h.net.script(Script {
        delay_ms: 100,
        fail: true,
        ..Default::default()
    });
    h.net.script(Script {
        delay_ms: 200,
        hang_up_early: true,
        ..Default::default()
    });

    h.handle.enable().unwrap();
    settle(&h.handle).await;
    h.handle.connect().unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    settle(&h.handle).await;
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.supervisor, SupervisorState::WaitingRetry);
    assert_eq!(snapshot.status, BridgeStatus::Error);
    assert_eq!(snapshot.retries_scheduled, 1);
    assert!(snapshot.connection.is_none());

    tokio::time::sleep(Duration::from_secs(5)).await;
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();
    assert_eq!(h.net.builds(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_status_subscription_follows_lifecycle() {
    let h = harness(false);
    let mut status = h.handle.subscribe_status();
    assert_eq!(*status.borrow(), BridgeStatus::Disconnected);

    h.handle.enable().unwrap();
    status
        .wait_for(|s| *s == BridgeStatus::Connected)
        .await
        .unwrap();

    h.net.remote_close();
    status.wait_for(|s| *s == BridgeStatus::Error).await.unwrap();

    h.handle.disable().unwrap();
    status
        .wait_for(|s| *s == BridgeStatus::Disconnected)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_enable_and_disable_are_idempotent() {
    let h = harness(false);
    h.handle.enable().unwrap();
    h.handle.enable().unwrap();
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();
    h.handle.enable().unwrap();
    settle(&h.handle).await;
    assert_eq!(h.net.builds(), 1);

    h.handle.disable().unwrap();
    h.handle.disable().unwrap();
    settle(&h.handle).await;
    assert_eq!(h.net.open(), 0);
    assert_eq!(h.handle.status(), BridgeStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_port_change_forces_reconnect() {
    let h = harness(true);
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();

    let mut config = h.handle.snapshot().await.unwrap().config;
    config.port = 6002;
    h.handle.reconfigure(config.clone()).unwrap();
    settle(&h.handle).await;
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();

    assert_eq!(*h.net.built_ports.lock().unwrap(), vec![5001, 6002]);
    assert_eq!(h.net.open(), 1);

    // Same endpoint again: no reconnect
    h.handle.reconfigure(config).unwrap();
    settle(&h.handle).await;
    assert_eq!(h.net.builds(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconfigure_while_disabled_applies_on_enable() {
    let h = harness(false);
    let config = BridgeConfig {
        port: 7001,
        ..Default::default()
    };
    h.handle.reconfigure(config).unwrap();
    settle(&h.handle).await;
    assert_eq!(h.net.builds(), 0);

    h.handle.enable().unwrap();
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();
    assert_eq!(*h.net.built_ports.lock().unwrap(), vec![7001]);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_does_not_retry() {
    let h = harness(true);
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();

    h.handle.disconnect().unwrap();
    settle(&h.handle).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    settle(&h.handle).await;

    assert_eq!(h.net.builds(), 1);
    assert_eq!(h.net.open(), 0);
    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(snapshot.enabled);
    assert_eq!(snapshot.supervisor, SupervisorState::Idle);

    // An explicit connect brings it back
    h.handle.connect().unwrap();
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();
    assert_eq!(h.net.builds(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stale_notices_from_replaced_transport_are_ignored() {
    let h = harness(true);
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();
    let (old_notices, _) = h.net.latest_link();

    h.handle.connect().unwrap();
    settle(&h.handle).await;
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();

    old_notices.notify(TransportEvent::Received(
        r#"{"type":"send_message","content":"ghost"}"#.to_string(),
    ));
    old_notices.notify(TransportEvent::Closed(CloseReason::Remote));
    settle(&h.handle).await;

    assert!(h.host.injected.lock().unwrap().is_empty());
    assert_eq!(h.handle.status(), BridgeStatus::Connected);
    assert_eq!(h.handle.snapshot().await.unwrap().retries_scheduled, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_transport() {
    let h = harness(true);
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();

    h.handle.shutdown().await.unwrap();
    assert_eq!(h.net.open(), 0);
    tokio::task::yield_now().await;
    assert!(h.handle.enable().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_admin_commands_drive_controller() {
    use chat_bridge::command::{self, AdminCommand};

    let h = harness(false);

    let reply = command::execute(&h.handle, command::parse("/bridge").unwrap())
        .await
        .unwrap();
    assert_eq!(reply, "Bridge enabled - Connecting...");
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();

    command::execute(&h.handle, AdminCommand::Port(6100))
        .await
        .unwrap();
    h.handle.wait_for_status(BridgeStatus::Connected).await.unwrap();
    settle(&h.handle).await;
    assert_eq!(*h.net.built_ports.lock().unwrap(), vec![5001, 6100]);

    let status = command::execute(&h.handle, AdminCommand::Status).await.unwrap();
    assert!(status.starts_with("Bridge enabled"));
    assert!(status.contains("ws://localhost:6100"));

    let reply = command::execute(&h.handle, AdminCommand::Toggle).await.unwrap();
    assert_eq!(reply, "Bridge disabled");
    settle(&h.handle).await;
    assert_eq!(h.handle.status(), BridgeStatus::Disconnected);

    let log = command::execute(&h.handle, AdminCommand::Log(3)).await.unwrap();
    assert_eq!(log.lines().count(), 3);
}
