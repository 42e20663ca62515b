use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    domain::{decode_report, encode_command, DeviceCommand, TelemetryReport},
    link::{Connector, DeviceLink, WsConnector},
    registry::{ReportStream, SubscriberRegistry, Subscription},
    simulator::{self, SimulationConfig},
};

pub const DEFAULT_DEVICE_URL: &str = "ws://192.168.1.100:81";
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    pub simulation: SimulationConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_DEVICE_URL.to_string(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            simulation: SimulationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Simulated,
}

/// Where reports come from. Once `Simulated`, always `Simulated` for this
/// client instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Live,
    Simulated,
}

struct ClientState {
    mode: Mode,
    attempts: u32,
    outbound: Option<mpsc::UnboundedSender<String>>,
    live_task: Option<JoinHandle<()>>,
    generator_task: Option<JoinHandle<()>>,
}

struct Shared {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    registry: SubscriberRegistry,
    state: Mutex<ClientState>,
    /// Bumped by `disconnect` while `state` is held; a task whose epoch is
    /// stale must not touch the state or publish again.
    epoch: AtomicU64,
    /// Held shared for the duration of every fan-out. `disconnect` takes it
    /// exclusively to wait out a fan-out already in progress.
    delivery: RwLock<()>,
    phase: watch::Sender<ConnectionPhase>,
}

thread_local! {
    // address of the `Shared` whose fan-out is running on this thread
    static DELIVERING: Cell<usize> = const { Cell::new(0) };
}

struct DeliveryMark {
    previous: usize,
}

impl DeliveryMark {
    fn enter(shared: &Shared) -> Self {
        let previous = DELIVERING.with(|d| d.replace(shared as *const Shared as usize));
        Self { previous }
    }
}

impl Drop for DeliveryMark {
    fn drop(&mut self) {
        DELIVERING.with(|d| d.set(self.previous));
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.current_epoch() == epoch
    }

    /// Fans `report` out unless the client was disconnected after `epoch`
    /// was taken. `None` means the publisher is stale and should stop.
    fn publish(&self, epoch: u64, report: &TelemetryReport) -> Option<usize> {
        let _gate = self.delivery.read().unwrap_or_else(PoisonError::into_inner);
        if !self.is_current(epoch) {
            return None;
        }
        let _mark = DeliveryMark::enter(self);
        Some(self.registry.notify(report))
    }

    /// Blocks until no fan-out of this client is in progress. A subscriber
    /// that disconnects from inside its own callback lets the current report
    /// finish.
    fn drain_deliveries(&self) {
        let inside_callback = DELIVERING.with(|d| d.get() == self as *const Shared as usize);
        if !inside_callback {
            drop(self.delivery.write().unwrap_or_else(PoisonError::into_inner));
        }
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(from = ?previous, to = ?phase, "telemetry client phase changed");
        }
    }

    fn start_simulation(self: &Arc<Self>, state: &mut ClientState) {
        state.mode = Mode::Simulated;
        if state.generator_task.is_none() {
            let shared = self.clone();
            let epoch = self.current_epoch();
            let task = simulator::run(self.config.simulation.clone(), move |report| {
                shared.publish(epoch, report)
            });
            state.generator_task = Some(tokio::spawn(task));
        }
        self.set_phase(ConnectionPhase::Simulated);
    }

    fn send_command(&self, command: &str) {
        let state = self.state();
        let Some(outbound) = state.outbound.as_ref() else {
            let phase = *self.phase.borrow();
            debug!(command, ?phase, "device not connected; command not sent");
            return;
        };

        match encode_command(command) {
            Ok(frame) => {
                if outbound.send(frame).is_err() {
                    warn!(command, "device link already closed; command not sent");
                } else {
                    info!(command, "command sent to device");
                }
            }
            Err(err) => warn!(?err, command, "failed to encode command frame"),
        }
    }
}

/// Client for one tracking device.
///
/// Holds a live connection while it can, retries a bounded number of times
/// with a fixed delay, and then switches for good to synthetic reports.
/// Every report, live or synthetic, goes through the same subscriber
/// registry. Cloning yields another handle to the same client.
///
/// `connect` spawns onto the ambient Tokio runtime and must be called from
/// within one.
#[derive(Clone)]
pub struct TelemetryClient {
    shared: Arc<Shared>,
}

fn decode_frame(raw: &str) -> Option<TelemetryReport> {
    match decode_report(raw) {
        Ok(report) => Some(report),
        Err(err) => {
            warn!(%err, len = raw.len(), "dropping malformed device frame");
            None
        }
    }
}

impl TelemetryClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector::default()))
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (phase, _) = watch::channel(ConnectionPhase::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                registry: SubscriberRegistry::new(),
                state: Mutex::new(ClientState {
                    mode: Mode::Live,
                    attempts: 0,
                    outbound: None,
                    live_task: None,
                    generator_task: None,
                }),
                epoch: AtomicU64::new(0),
                delivery: RwLock::new(()),
                phase,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Starts (or resumes) report delivery. A no-op while a connection is
    /// open or being established.
    pub fn connect(&self) {
        let mut state = self.shared.state();

        if state.mode == Mode::Simulated {
            if state.generator_task.is_some() {
                debug!("connect ignored; synthetic telemetry already running");
            } else {
                info!("resuming synthetic telemetry; live device was given up on");
                self.shared.start_simulation(&mut state);
            }
            return;
        }

        if state.live_task.is_some() {
            debug!("connect ignored; device connection already active");
            return;
        }

        self.shared.set_phase(ConnectionPhase::Connecting);
        let epoch = self.shared.current_epoch();
        state.live_task = Some(tokio::spawn(supervise(self.shared.clone(), epoch)));
    }

    /// Closes the device connection and stops every background task.
    /// Subscribers stay registered. Once this returns no further report is
    /// delivered until the next `connect`.
    pub fn disconnect(&self) {
        let had_link = {
            let mut state = self.shared.state();
            self.shared.epoch.fetch_add(1, Ordering::AcqRel);

            let had_link = state.outbound.take().is_some();
            if let Some(task) = state.live_task.take() {
                task.abort();
            }
            if let Some(task) = state.generator_task.take() {
                task.abort();
                info!("synthetic telemetry stopped");
            }
            self.shared.set_phase(ConnectionPhase::Disconnected);
            had_link
        };
        // abort only takes effect at the task's next await
        self.shared.drain_deliveries();

        if had_link {
            info!(endpoint = %self.shared.config.endpoint, "disconnected from tracking device");
        }
    }

    /// Decodes one raw device frame and fans it out. Malformed frames are
    /// logged and dropped. Returns whether a report was published.
    pub fn on_message(&self, raw: &str) -> bool {
        match decode_frame(raw) {
            Some(report) => {
                self.shared.registry.notify(&report);
                true
            }
            None => false,
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TelemetryReport) + Send + Sync + 'static,
    {
        self.shared.registry.subscribe(callback)
    }

    pub fn subscribe_channel(&self, capacity: usize) -> ReportStream {
        self.shared.registry.subscribe_channel(capacity)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Reports channel subscribers missed because they fell behind.
    pub fn dropped_reports(&self) -> u64 {
        self.shared.registry.dropped_reports()
    }

    /// Best-effort write of `{"command": ...}` to the device. Does nothing
    /// (beyond a log line) unless a live connection is open.
    pub fn send_command(&self, command: &str) {
        self.shared.send_command(command);
    }

    pub fn emergency_alert(&self) {
        self.send_command(DeviceCommand::Emergency.as_str());
    }

    pub fn reset_bus_data(&self) {
        self.send_command(DeviceCommand::Reset.as_str());
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.shared.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.shared.phase.subscribe()
    }

    pub fn mode(&self) -> Mode {
        self.shared.state().mode
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.state().attempts
    }
}

enum AfterFailure {
    Retry(Duration),
    Stop,
}

async fn supervise(shared: Arc<Shared>, epoch: u64) {
    let endpoint = shared.config.endpoint.clone();
    let max_attempts = shared.config.max_reconnect_attempts.max(1);

    loop {
        info!(%endpoint, "connecting to tracking device");
        match shared.connector.open(&endpoint).await {
            Ok(link) => {
                if !run_link(&shared, epoch, link).await {
                    return;
                }
                warn!(%endpoint, "device connection closed");
            }
            Err(err) => warn!(%endpoint, "failed to connect to tracking device: {err:#}"),
        }

        let next = {
            let mut state = shared.state();
            if !shared.is_current(epoch) {
                return;
            }
            state.outbound = None;
            state.attempts += 1;

            if state.attempts >= max_attempts {
                warn!(
                    attempts = state.attempts,
                    "tracking device unreachable; switching to synthetic telemetry"
                );
                state.live_task = None;
                shared.start_simulation(&mut state);
                AfterFailure::Stop
            } else {
                info!(
                    attempt = state.attempts,
                    max_attempts,
                    delay_ms = shared.config.reconnect_interval.as_millis() as u64,
                    "scheduling device reconnect"
                );
                shared.set_phase(ConnectionPhase::Reconnecting);
                AfterFailure::Retry(shared.config.reconnect_interval)
            }
        };

        match next {
            AfterFailure::Retry(delay) => {
                sleep(delay).await;
                if !shared.is_current(epoch) {
                    return;
                }
                shared.set_phase(ConnectionPhase::Connecting);
            }
            AfterFailure::Stop => return,
        }
    }
}

/// Pumps one open link until the device side goes away. Returns `false` when
/// the client was disconnected underneath it.
async fn run_link(shared: &Arc<Shared>, epoch: u64, mut link: DeviceLink) -> bool {
    {
        let mut state = shared.state();
        if !shared.is_current(epoch) {
            return false;
        }
        state.attempts = 0;
        state.outbound = Some(link.commands.clone());
        shared.set_phase(ConnectionPhase::Connected);
    }
    info!(endpoint = %shared.config.endpoint, "connected to tracking device");
    shared.send_command(DeviceCommand::GetData.as_str());

    while let Some(raw) = link.frames.recv().await {
        if !shared.is_current(epoch) {
            return false;
        }
        if let Some(report) = decode_frame(&raw) {
            if shared.publish(epoch, &report).is_none() {
                return false;
            }
        }
    }
    shared.is_current(epoch)
}
