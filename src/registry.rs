//! Registry of outlet links
//!
//! Owns the per-outlet link tasks, exposes read-only snapshots of their
//! runtime state, and forwards on/off/toggle requests. No method blocks:
//! all device I/O happens on each link's own cycle, so a stuck outlet can
//! never stall aggregate queries or sibling outlets.

use crate::config::OutletConfig;
use crate::engine::OutletCommands;
use crate::logging::get_logger;
use crate::outlet::{OutletCommand, OutletConnector, OutletLink, OutletState};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Read-only snapshot of one outlet: static config plus the latest
/// published runtime state
#[derive(Debug, Clone)]
pub struct OutletView {
    pub config: OutletConfig,
    pub state: OutletState,
}

struct OutletHandle {
    config: OutletConfig,
    state_rx: watch::Receiver<OutletState>,
    cmd_tx: mpsc::UnboundedSender<OutletCommand>,
    task: JoinHandle<()>,
}

/// Owns the set of outlet links
pub struct OutletRegistry {
    outlets: Vec<OutletHandle>,
    shutdown_tx: watch::Sender<bool>,
    logger: crate::logging::StructuredLogger,
}

impl OutletRegistry {
    /// Spawn one link task per configured outlet. Outlets are kept in
    /// priority order (lower number first) for aggregate queries.
    pub fn spawn<F>(mut configs: Vec<OutletConfig>, connect: F, poll_interval: Duration) -> Self
    where
        F: Fn(&OutletConfig) -> Box<dyn OutletConnector>,
    {
        let logger = get_logger("registry");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        configs.sort_by_key(|c| (c.priority, c.outlet_id));

        let mut outlets = Vec::with_capacity(configs.len());
        for config in configs {
            let connector = connect(&config);
            let (link, state_rx, cmd_tx) = OutletLink::new(
                config.clone(),
                connector,
                poll_interval,
                shutdown_rx.clone(),
            );
            let task = tokio::spawn(link.run());
            outlets.push(OutletHandle {
                config,
                state_rx,
                cmd_tx,
                task,
            });
        }

        logger.info(&format!("Registry started with {} outlets", outlets.len()));
        Self {
            outlets,
            shutdown_tx,
            logger,
        }
    }

    /// Request an outlet on
    pub fn turn_on(&self, outlet_id: u16) {
        self.send(outlet_id, OutletCommand::TurnOn);
    }

    /// Request an outlet off
    pub fn turn_off(&self, outlet_id: u16) {
        self.send(outlet_id, OutletCommand::TurnOff);
    }

    /// Toggle an outlet; also clears quarantine so a user can force a retry
    pub fn toggle(&self, outlet_id: u16) {
        self.send(outlet_id, OutletCommand::Toggle);
    }

    fn send(&self, outlet_id: u16, cmd: OutletCommand) {
        match self.outlets.iter().find(|h| h.config.outlet_id == outlet_id) {
            Some(handle) => {
                handle.cmd_tx.send(cmd).ok();
            }
            None => {
                self.logger
                    .warn(&format!("Command for unknown outlet {}", outlet_id));
            }
        }
    }

    /// Snapshot of one outlet
    pub fn get_outlet(&self, outlet_id: u16) -> Option<OutletView> {
        self.outlets
            .iter()
            .find(|h| h.config.outlet_id == outlet_id)
            .map(Self::view)
    }

    /// Snapshots of all outlets in priority order
    pub fn all_outlets(&self) -> Vec<OutletView> {
        self.outlets.iter().map(Self::view).collect()
    }

    fn view(handle: &OutletHandle) -> OutletView {
        OutletView {
            config: handle.config.clone(),
            state: handle.state_rx.borrow().clone(),
        }
    }

    /// Stop all link tasks and wait for them to close their connections
    pub async fn shutdown(&mut self) {
        self.logger.info("Stopping outlet links");
        self.shutdown_tx.send(true).ok();
        for handle in self.outlets.drain(..) {
            handle.task.await.ok();
        }
    }
}

impl OutletCommands for OutletRegistry {
    fn request_on(&self, outlet_id: u16) {
        self.turn_on(outlet_id);
    }

    fn request_off(&self, outlet_id: u16) {
        self.turn_off(outlet_id);
    }
}
