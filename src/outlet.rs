//! Outlet link lifecycle for switched power outlets
//!
//! Each configured outlet gets its own link task running an independent
//! poll/reconnect cycle: exponential backoff on connection failures, a
//! permanent quarantine after too many failed attempts, and an
//! at-most-one-command-apply-per-cycle policy for pending on/off requests.
//! The task publishes a complete immutable state snapshot every cycle so
//! readers never observe a half-updated record.

use crate::config::OutletConfig;
use crate::error::{PhoebusError, Result};
use crate::logging::{LogContext, get_logger_with_context};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;

/// Connection lifecycle phase of an outlet link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// No connection; eligible for a reconnect attempt
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// Connected and syncing state each cycle
    Connected,
    /// Too many failures; polling stops until a manual toggle
    Quarantined,
}

/// Explicit connection state machine, kept free of I/O so the transitions
/// are testable on their own.
#[derive(Debug)]
pub struct ConnectionFsm {
    phase: LinkPhase,
    retries: u32,
    last_attempt: Option<Instant>,
}

impl ConnectionFsm {
    /// Failed attempts after which the outlet is quarantined
    pub const MAX_RETRIES: u32 = 10;

    /// Backoff ceiling in seconds
    const BACKOFF_CAP_SECS: u64 = 60;

    pub fn new() -> Self {
        Self {
            phase: LinkPhase::Disconnected,
            retries: 0,
            last_attempt: None,
        }
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_quarantined(&self) -> bool {
        self.phase == LinkPhase::Quarantined
    }

    /// Current backoff window: min(2^retries, 60) seconds
    pub fn backoff(&self) -> Duration {
        let secs = 2u64
            .saturating_pow(self.retries)
            .min(Self::BACKOFF_CAP_SECS);
        Duration::from_secs(secs)
    }

    /// Whether this cycle should attempt a connection
    pub fn should_attempt(&self, now: Instant) -> bool {
        if self.phase != LinkPhase::Disconnected {
            return false;
        }
        match self.last_attempt {
            None => true,
            Some(at) => now.duration_since(at) >= self.backoff(),
        }
    }

    /// Record the start of a connection attempt
    pub fn begin_attempt(&mut self, now: Instant) {
        self.phase = LinkPhase::Connecting;
        self.last_attempt = Some(now);
    }

    /// Connection established; clears the retry counter and any quarantine
    pub fn connect_succeeded(&mut self) {
        self.phase = LinkPhase::Connected;
        self.retries = 0;
    }

    /// A connect attempt or an established connection failed
    pub fn failure(&mut self, now: Instant) {
        self.retries += 1;
        self.last_attempt = Some(now);
        self.phase = if self.retries >= Self::MAX_RETRIES {
            LinkPhase::Quarantined
        } else {
            LinkPhase::Disconnected
        };
    }

    /// Session expired or forbidden: reconnect immediately, not a
    /// capacity/availability failure so the retry counter is untouched
    pub fn session_expired(&mut self) {
        self.phase = LinkPhase::Disconnected;
        self.last_attempt = None;
    }

    /// Manual toggle: clear quarantine and start fresh
    pub fn manual_reset(&mut self) {
        self.retries = 0;
        self.last_attempt = None;
        if self.phase == LinkPhase::Quarantined {
            self.phase = LinkPhase::Disconnected;
        }
    }
}

impl Default for ConnectionFsm {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable per-cycle snapshot of an outlet's runtime state
#[derive(Debug, Clone, Default)]
pub struct OutletState {
    /// Last known on/off state
    pub current_state: bool,

    /// Pending request not yet confirmed applied
    pub target_state: Option<bool>,

    /// Whether the link currently holds a working connection
    pub is_connected: bool,

    /// Consecutive failure count
    pub retries: u32,

    /// Quarantined; only a manual toggle recovers
    pub permanent_failure: bool,
}

/// Requests accepted by an outlet link task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutletCommand {
    TurnOn,
    TurnOff,
    Toggle,
}

/// A connected outlet device
#[async_trait]
pub trait OutletDevice: Send {
    /// Re-read the actual on/off state
    async fn refresh(&mut self) -> Result<bool>;

    /// Switch the outlet on or off
    async fn switch(&mut self, on: bool) -> Result<()>;
}

/// Connection factory for one outlet
#[async_trait]
pub trait OutletConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn OutletDevice>>;
}

/// Owns one outlet's connection and runs its poll/reconnect cycle
pub struct OutletLink {
    config: OutletConfig,
    connector: Box<dyn OutletConnector>,
    device: Option<Box<dyn OutletDevice>>,
    fsm: ConnectionFsm,
    target: Option<bool>,
    current: bool,
    state_tx: watch::Sender<OutletState>,
    cmd_rx: mpsc::UnboundedReceiver<OutletCommand>,
    shutdown_rx: watch::Receiver<bool>,
    poll_interval: Duration,
    logger: crate::logging::StructuredLogger,
}

impl OutletLink {
    /// Create a new link plus the handles the registry keeps: a state
    /// receiver and a command sender.
    pub fn new(
        config: OutletConfig,
        connector: Box<dyn OutletConnector>,
        poll_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (
        Self,
        watch::Receiver<OutletState>,
        mpsc::UnboundedSender<OutletCommand>,
    ) {
        let (state_tx, state_rx) = watch::channel(OutletState::default());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let logger = get_logger_with_context(
            LogContext::new("outlet").with_outlet_id(config.outlet_id),
        );

        let link = Self {
            config,
            connector,
            device: None,
            fsm: ConnectionFsm::new(),
            target: None,
            current: false,
            state_tx,
            cmd_rx,
            shutdown_rx,
            poll_interval,
            logger,
        };
        (link, state_rx, cmd_tx)
    }

    /// Run the link cycle until shutdown is signalled
    pub async fn run(mut self) {
        self.logger
            .info(&format!("Outlet link '{}' starting", self.config.name));
        let mut ticker = interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle().await;
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    self.handle_command(cmd);
                }
                _ = self.shutdown_rx.changed() => {
                    break;
                }
            }
        }

        // Close the device connection before the task exits
        self.device = None;
        self.logger
            .info(&format!("Outlet link '{}' stopped", self.config.name));
    }

    async fn cycle(&mut self) {
        let now = Instant::now();

        match self.fsm.phase() {
            LinkPhase::Quarantined => {}
            LinkPhase::Disconnected | LinkPhase::Connecting => {
                if self.fsm.should_attempt(now) {
                    self.try_connect(now).await;
                    if self.fsm.phase() == LinkPhase::Connected {
                        self.sync().await;
                    }
                }
            }
            LinkPhase::Connected => {
                self.sync().await;
            }
        }

        self.publish();
    }

    async fn try_connect(&mut self, now: Instant) {
        self.fsm.begin_attempt(now);

        match self.connector.connect().await {
            Ok(device) => {
                self.device = Some(device);
                self.fsm.connect_succeeded();
                self.logger.info("Outlet connected");
            }
            Err(e) => {
                self.fsm.failure(now);
                if self.fsm.is_quarantined() {
                    self.logger.error(&format!(
                        "Outlet quarantined after {} failed attempts: {}",
                        ConnectionFsm::MAX_RETRIES,
                        e
                    ));
                } else {
                    self.logger.warn(&format!(
                        "Connect attempt {} failed: {}",
                        self.fsm.retries(),
                        e
                    ));
                }
            }
        }
    }

    async fn sync(&mut self) {
        if let Err(e) = self.refresh_and_apply().await {
            self.handle_error(e);
        }
    }

    /// Re-read actual state, then apply at most one pending command.
    /// The pending target is cleared whether or not the command lands so a
    /// single stuck command cannot retry forever.
    async fn refresh_and_apply(&mut self) -> Result<()> {
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| PhoebusError::outlet("No device handle"))?;

        let actual = device.refresh().await?;
        self.current = actual;

        if let Some(target) = self.target.take() {
            if target != actual {
                device.switch(target).await?;
                self.current = target;
                self.logger.info(&format!(
                    "Outlet switched {}",
                    if target { "on" } else { "off" }
                ));
            }
        }
        Ok(())
    }

    fn handle_error(&mut self, e: PhoebusError) {
        self.device = None;
        if e.is_session_error() {
            self.logger
                .warn(&format!("Session expired, reconnecting: {}", e));
            self.fsm.session_expired();
        } else {
            self.logger.warn(&format!("Communication failed: {}", e));
            self.fsm.failure(Instant::now());
            if self.fsm.is_quarantined() {
                self.logger.error(&format!(
                    "Outlet quarantined after {} failures",
                    ConnectionFsm::MAX_RETRIES
                ));
            }
        }
    }

    fn handle_command(&mut self, cmd: OutletCommand) {
        match cmd {
            OutletCommand::TurnOn => {
                self.target = Some(true);
            }
            OutletCommand::TurnOff => {
                self.target = Some(false);
            }
            OutletCommand::Toggle => {
                if self.fsm.is_quarantined() {
                    self.logger.info("Manual toggle clears quarantine");
                }
                self.fsm.manual_reset();
                self.target = Some(!self.current);
            }
        }
        self.publish();
    }

    fn publish(&self) {
        let state = OutletState {
            current_state: self.current,
            target_state: self.target,
            is_connected: self.fsm.phase() == LinkPhase::Connected,
            retries: self.fsm.retries(),
            permanent_failure: self.fsm.is_quarantined(),
        };
        self.state_tx.send(state).ok();
    }
}
