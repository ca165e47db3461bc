use async_trait::async_trait;
use phoebus::config::OutletConfig;
use phoebus::error::{PhoebusError, Result};
use phoebus::outlet::{OutletCommand, OutletDevice, OutletConnector, OutletLink};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Default)]
struct MockState {
    connects: AtomicU32,
    fail_connect: AtomicBool,
    on: AtomicBool,
    refresh_error: Mutex<Option<&'static str>>,
    switch_error: AtomicBool,
    switches: AtomicU32,
}

struct MockConnector(Arc<MockState>);

#[async_trait]
impl OutletConnector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn OutletDevice>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_connect.load(Ordering::SeqCst) {
            return Err(PhoebusError::outlet("connect refused"));
        }
        Ok(Box::new(MockDevice(self.0.clone())))
    }
}

struct MockDevice(Arc<MockState>);

#[async_trait]
impl OutletDevice for MockDevice {
    async fn refresh(&mut self) -> Result<bool> {
        if let Some(kind) = self.0.refresh_error.lock().unwrap().take() {
            return Err(match kind {
                "session" => PhoebusError::session("token expired"),
                _ => PhoebusError::outlet("connection reset"),
            });
        }
        Ok(self.0.on.load(Ordering::SeqCst))
    }

    async fn switch(&mut self, on: bool) -> Result<()> {
        self.0.switches.fetch_add(1, Ordering::SeqCst);
        if self.0.switch_error.load(Ordering::SeqCst) {
            return Err(PhoebusError::outlet("connection reset"));
        }
        self.0.on.store(on, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    state: Arc<MockState>,
    state_rx: watch::Receiver<phoebus::outlet::OutletState>,
    cmd_tx: tokio::sync::mpsc::UnboundedSender<OutletCommand>,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn spawn() -> Self {
        let state = Arc::new(MockState::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (link, state_rx, cmd_tx) = OutletLink::new(
            OutletConfig::default(),
            Box::new(MockConnector(state.clone())),
            Duration::from_millis(10),
            shutdown_rx,
        );
        let task = tokio::spawn(link.run());
        Self {
            state,
            state_rx,
            cmd_tx,
            shutdown_tx,
            task,
        }
    }

    async fn stop(self) {
        self.shutdown_tx.send(true).ok();
        self.task.await.ok();
    }
}

#[tokio::test]
async fn connects_and_applies_pending_target_once() {
    let h = Harness::spawn();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let snap = h.state_rx.borrow().clone();
    assert!(snap.is_connected);
    assert!(!snap.current_state);

    h.cmd_tx.send(OutletCommand::TurnOn).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snap = h.state_rx.borrow().clone();
    assert!(snap.current_state, "device switched on");
    assert_eq!(snap.target_state, None, "target cleared after apply");
    assert_eq!(h.state.switches.load(Ordering::SeqCst), 1);
    assert!(h.state.on.load(Ordering::SeqCst));

    h.stop().await;
}

#[tokio::test]
async fn matching_target_issues_no_command() {
    let h = Harness::spawn();
    h.state.on.store(true, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.cmd_tx.send(OutletCommand::TurnOn).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snap = h.state_rx.borrow().clone();
    assert!(snap.current_state);
    assert_eq!(snap.target_state, None);
    assert_eq!(h.state.switches.load(Ordering::SeqCst), 0);

    h.stop().await;
}

#[tokio::test]
async fn failed_connect_backs_off_with_retry_count() {
    let h = Harness::spawn();
    h.state.fail_connect.store(true, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let snap = h.state_rx.borrow().clone();
    assert!(!snap.is_connected);
    assert!(!snap.permanent_failure);
    assert_eq!(snap.retries, 1, "second attempt held back by backoff");
    assert_eq!(h.state.connects.load(Ordering::SeqCst), 1);

    h.stop().await;
}

#[tokio::test]
async fn toggle_clears_backoff_and_switches() {
    let h = Harness::spawn();
    h.state.fail_connect.store(true, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!h.state_rx.borrow().is_connected);

    h.state.fail_connect.store(false, Ordering::SeqCst);
    h.cmd_tx.send(OutletCommand::Toggle).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let snap = h.state_rx.borrow().clone();
    assert!(snap.is_connected);
    assert!(snap.current_state, "toggle from off requested on");
    assert_eq!(snap.retries, 0);

    h.stop().await;
}

#[tokio::test]
async fn session_expiry_reconnects_without_counting_a_retry() {
    let h = Harness::spawn();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.state_rx.borrow().is_connected);

    *h.state.refresh_error.lock().unwrap() = Some("session");
    tokio::time::sleep(Duration::from_millis(150)).await;

    let snap = h.state_rx.borrow().clone();
    assert!(snap.is_connected, "reconnected immediately");
    assert_eq!(snap.retries, 0, "session expiry is not an availability failure");
    assert!(h.state.connects.load(Ordering::SeqCst) >= 2);

    h.stop().await;
}

#[tokio::test]
async fn communication_error_drops_connection_and_counts() {
    let h = Harness::spawn();

    tokio::time::sleep(Duration::from_millis(50)).await;
    *h.state.refresh_error.lock().unwrap() = Some("comm");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snap = h.state_rx.borrow().clone();
    assert!(!snap.is_connected);
    assert_eq!(snap.retries, 1);

    h.stop().await;
}

#[tokio::test]
async fn failed_switch_does_not_retry_the_command() {
    let h = Harness::spawn();
    h.state.switch_error.store(true, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.cmd_tx.send(OutletCommand::TurnOn).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let snap = h.state_rx.borrow().clone();
    assert_eq!(snap.target_state, None, "target cleared despite failure");
    assert!(!snap.is_connected, "switch failure drops the handle");
    assert_eq!(h.state.switches.load(Ordering::SeqCst), 1, "one attempt only");
    assert!(!h.state.on.load(Ordering::SeqCst));

    h.stop().await;
}
