//! Monitor worker and channel bridge
//!
//! The monitor owns the driver and the presence tracker on a
//! dedicated OS thread. Async callers talk to it through
//! [`MonitorHandle`]: commands go in over a bounded channel with
//! oneshot responses, presence events come out over another bounded
//! channel.
//!
//! The driving mode is decided exactly once, before the worker thread
//! starts: event-driven when the driver supports bus events, a
//! fixed-interval enumeration poll otherwise. Startup failures
//! (driver context, hotplug registration, initial enumeration) surface
//! to the caller of [`spawn_monitor`] and nothing is spawned.

use crate::driver::{BusEvent, HostDriver};
use crate::error::{Error, Result};
use crate::tracker::{PresenceEvent, PresenceTracker};
use crate::types::DeviceIdentity;
use async_channel::{Receiver, Sender, bounded};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cadence of full-bus enumeration in polling mode.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long one event pump may block in event-driven mode. Also the
/// command-latency ceiling of the worker loop.
const EVENT_PUMP_TIMEOUT: Duration = Duration::from_millis(100);

/// Scheduler sleep between command checks in polling mode.
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Monitor startup configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Enumeration cadence when the driver has no event support.
    pub poll_interval: Duration,
    /// Identities to watch from the start.
    pub watch: Vec<DeviceIdentity>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            watch: Vec::new(),
        }
    }
}

/// Commands from async callers to the monitor worker.
#[derive(Debug)]
enum MonitorCommand {
    ListDevices {
        response: tokio::sync::oneshot::Sender<Vec<DeviceIdentity>>,
    },
    IsPresent {
        identity: DeviceIdentity,
        response: tokio::sync::oneshot::Sender<bool>,
    },
    AbsentWatched {
        response: tokio::sync::oneshot::Sender<Vec<DeviceIdentity>>,
    },
    AddWatch {
        identity: DeviceIdentity,
        response: tokio::sync::oneshot::Sender<bool>,
    },
    RemoveWatch {
        identity: DeviceIdentity,
        response: tokio::sync::oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Async handle to a running monitor worker.
#[derive(Clone)]
pub struct MonitorHandle {
    cmd_tx: Sender<MonitorCommand>,
    events: Receiver<PresenceEvent>,
}

impl MonitorHandle {
    /// The tracker's current snapshot of the bus.
    pub async fn list_devices(&self) -> Result<Vec<DeviceIdentity>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(MonitorCommand::ListDevices { response: tx }).await?;
        rx.await.map_err(|e| Error::Channel(e.to_string()))
    }

    pub async fn is_present(&self, identity: DeviceIdentity) -> Result<bool> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(MonitorCommand::IsPresent {
            identity,
            response: tx,
        })
        .await?;
        rx.await.map_err(|e| Error::Channel(e.to_string()))
    }

    pub async fn absent_watched(&self) -> Result<Vec<DeviceIdentity>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(MonitorCommand::AbsentWatched { response: tx }).await?;
        rx.await.map_err(|e| Error::Channel(e.to_string()))
    }

    /// Returns false when the identity was already watched.
    pub async fn add_watch(&self, identity: DeviceIdentity) -> Result<bool> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(MonitorCommand::AddWatch {
            identity,
            response: tx,
        })
        .await?;
        rx.await.map_err(|e| Error::Channel(e.to_string()))
    }

    pub async fn remove_watch(&self, identity: DeviceIdentity) -> Result<bool> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(MonitorCommand::RemoveWatch {
            identity,
            response: tx,
        })
        .await?;
        rx.await.map_err(|e| Error::Channel(e.to_string()))
    }

    /// Receive the next presence notification.
    pub async fn recv_event(&self) -> Result<PresenceEvent> {
        self.events
            .recv()
            .await
            .map_err(|e| Error::Channel(e.to_string()))
    }

    /// Take a pending presence notification without waiting.
    pub fn try_recv_event(&self) -> Option<PresenceEvent> {
        self.events.try_recv().ok()
    }

    /// Ask the worker to stop ticking and release its resources.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(MonitorCommand::Shutdown).await
    }

    async fn send(&self, cmd: MonitorCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| Error::Channel(e.to_string()))
    }
}

/// Start the monitor.
///
/// Initialization happens on the calling thread so that fatal startup
/// failures are returned here; only a fully initialized worker is
/// moved onto its thread. Teardown order inside the worker is always
/// "stop ticking, then release": the loop breaks on `Shutdown` and
/// the driver plus any raw device handles drop after the last tick.
pub fn spawn_monitor<D: HostDriver>(
    driver: D,
    config: MonitorConfig,
) -> Result<(MonitorHandle, std::thread::JoinHandle<()>)> {
    let (cmd_tx, cmd_rx) = bounded(64);
    let (worker, events) = MonitorWorker::new(driver, config, cmd_rx)?;

    let join = std::thread::Builder::new()
        .name("usb-monitor".to_string())
        .spawn(move || worker.run())
        .map_err(|e| Error::Init(format!("failed to spawn monitor thread: {}", e)))?;

    Ok((MonitorHandle { cmd_tx, events }, join))
}

struct MonitorWorker<D: HostDriver> {
    driver: D,
    tracker: PresenceTracker,
    cmd_rx: Receiver<MonitorCommand>,
    /// Raw handles opened from arrival events, keyed by identity so
    /// several event-tracked devices can coexist. Dropping an entry
    /// closes the handle.
    handles: HashMap<DeviceIdentity, D::Device>,
    event_driven: bool,
    poll_interval: Duration,
    last_poll: Instant,
}

impl<D: HostDriver> MonitorWorker<D> {
    fn new(
        mut driver: D,
        config: MonitorConfig,
        cmd_rx: Receiver<MonitorCommand>,
    ) -> Result<(Self, Receiver<PresenceEvent>)> {
        let (mut tracker, events) = PresenceTracker::new();
        for identity in config.watch {
            tracker.add_watch(identity);
        }

        let event_driven = driver.supports_events();
        if event_driven {
            driver.subscribe()?;
        }

        // Devices already attached at startup are not insertions
        let initial = driver.list_devices()?;
        debug!("initial enumeration found {} devices", initial.len());
        tracker.reset_snapshot(initial);

        Ok((
            Self {
                driver,
                tracker,
                cmd_rx,
                handles: HashMap::new(),
                event_driven,
                poll_interval: config.poll_interval,
                // First polled reconciliation runs a full interval
                // after the seeding enumeration
                last_poll: Instant::now(),
            },
            events,
        ))
    }

    fn run(mut self) {
        info!(
            "USB monitor started ({} mode)",
            if self.event_driven { "event-driven" } else { "polling" }
        );

        loop {
            match self.cmd_rx.try_recv() {
                Ok(MonitorCommand::Shutdown) => {
                    info!("USB monitor shutting down");
                    break;
                }
                Ok(cmd) => {
                    self.handle_command(cmd);
                    continue;
                }
                Err(async_channel::TryRecvError::Empty) => {}
                Err(async_channel::TryRecvError::Closed) => {
                    debug!("all monitor handles dropped, stopping");
                    break;
                }
            }

            self.tick();
        }

        // Loop has stopped ticking; handles and driver drop here
        info!("USB monitor stopped");
    }

    fn tick(&mut self) {
        if self.event_driven {
            match self.driver.pump_events(EVENT_PUMP_TIMEOUT) {
                Ok(events) => {
                    for event in events {
                        self.apply_bus_event(event);
                    }
                }
                Err(e) => {
                    // Transient pump errors never take the monitor down
                    warn!("event pump failed: {}", e);
                    std::thread::sleep(IDLE_SLEEP);
                }
            }
        } else {
            if self.last_poll.elapsed() >= self.poll_interval {
                self.last_poll = Instant::now();
                match self.driver.list_devices() {
                    Ok(list) => self.tracker.reconcile(list),
                    // Snapshot keeps its last consistent value
                    Err(e) => warn!("enumeration failed: {}", e),
                }
            }
            std::thread::sleep(IDLE_SLEEP);
        }
    }

    /// Funnel a single-device bus event through the same batched
    /// reconciliation path a full scan uses, as a one-element diff.
    fn apply_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Arrived(identity) => {
                match self.driver.open_device(identity) {
                    Ok(handle) => {
                        self.handles.insert(identity, handle);
                        let mut list = self.tracker.snapshot().to_vec();
                        if !list.contains(&identity) {
                            list.push(identity);
                        }
                        self.tracker.reconcile(list);
                    }
                    Err(e) => {
                        // Treated as a failed enumeration for this one
                        // device: no notification fires
                        warn!("could not open arrived device {}: {}", identity, e);
                    }
                }
            }
            BusEvent::Departed(identity) => {
                if self.handles.remove(&identity).is_some() {
                    debug!("released handle for departed device {}", identity);
                }
                let list: Vec<DeviceIdentity> = self
                    .tracker
                    .snapshot()
                    .iter()
                    .filter(|d| **d != identity)
                    .copied()
                    .collect();
                self.tracker.reconcile(list);
            }
        }
    }

    fn handle_command(&mut self, cmd: MonitorCommand) {
        match cmd {
            MonitorCommand::ListDevices { response } => {
                let _ = response.send(self.tracker.snapshot().to_vec());
            }
            MonitorCommand::IsPresent { identity, response } => {
                let _ = response.send(self.tracker.is_present(identity));
            }
            MonitorCommand::AbsentWatched { response } => {
                let _ = response.send(self.tracker.absent_watched());
            }
            MonitorCommand::AddWatch { identity, response } => {
                let _ = response.send(self.tracker.add_watch(identity));
            }
            MonitorCommand::RemoveWatch { identity, response } => {
                let _ = response.send(self.tracker.remove_watch(identity));
            }
            MonitorCommand::Shutdown => unreachable!("handled in run loop"),
        }
    }
}
