// Wearable sensor telemetry
//
// One decoder per sensor. Each decoder owns a thread running a
// current-thread tokio runtime that drives the BLE link: connect,
// subscribe, put the sensor into measurement mode, then demultiplex
// notifications into the store until shut down or the link drops.
// A sensor failing is never fatal to the session.

pub mod protocol;
pub mod store;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::config::{Config, SensorConfig};
use crate::session::RecordingSession;
use crate::Reporter;

pub use protocol::{ControlResponse, DataFrame, PpiRecord, StreamKind};
pub use store::{Reading, TelemetryReport, TelemetrySample, TelemetryStore};

/// Error type for telemetry operations
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("could not connect ({0})")]
    Connect(String),

    #[error("BLE error: {0}")]
    Ble(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Invoked by the BLE stack for every notification on a subscribed
/// characteristic. May be called from any thread.
pub type NotificationCallback = Arc<dyn Fn(Uuid, &[u8]) + Send + Sync>;

/// The BLE central operations a decoder needs from the radio stack.
///
/// Futures are polled on the decoder's own current-thread runtime and do
/// not need to be `Send`.
#[allow(async_fn_in_trait)]
pub trait BleClient: Send + 'static {
    async fn connect(&mut self, address: &str) -> Result<()>;
    async fn subscribe(&mut self, characteristic: Uuid, callback: NotificationCallback) -> Result<()>;
    async fn unsubscribe(&mut self, characteristic: Uuid) -> Result<()>;
    async fn write(&mut self, characteristic: Uuid, value: &[u8]) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderStatus {
    Connecting,
    Streaming,
    /// Connect or stream setup failed; the decoder has exited
    Failed,
    /// The link dropped while streaming; not retried
    Lost,
    Closed,
}

#[derive(Debug, Clone)]
pub struct DecoderSettings {
    /// Quiet period the sensor needs after entering SDK mode
    pub sdk_settle: Duration,
    /// How often the link is checked for a silent drop
    pub link_check: Duration,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            sdk_settle: Duration::from_secs(5),
            link_check: Duration::from_secs(1),
        }
    }
}

impl From<&Config> for DecoderSettings {
    fn from(config: &Config) -> Self {
        Self {
            sdk_settle: Duration::from_secs(config.sdk_settle_secs),
            ..Self::default()
        }
    }
}

/// Fires at most once; wakes the decoder even if it is not waiting yet
#[derive(Debug, Default)]
struct ShutdownSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    fn request(&self) -> bool {
        let first = !self.requested.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_one();
        }
        first
    }
}

/// Shared between the decoder thread and its handle
struct DecoderContext {
    address: String,
    description: String,
    streams: Vec<StreamKind>,
    settings: DecoderSettings,
    store: Arc<Mutex<TelemetryStore>>,
    status: Arc<Mutex<DecoderStatus>>,
    shutdown: Arc<ShutdownSignal>,
    reporter: Reporter,
}

impl DecoderContext {
    fn set_status(&self, status: DecoderStatus) {
        *self.status.lock() = status;
    }

    fn report(&self, message: String) {
        (self.reporter)(&message);
    }
}

/// What has been opened on the link and must be closed again
#[derive(Debug, Default)]
struct LinkState {
    connected: bool,
    subscriptions: Vec<Uuid>,
    sdk_mode: bool,
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to one running sensor decoder
pub struct TelemetryDecoder {
    description: String,
    streams: Vec<StreamKind>,
    store: Arc<Mutex<TelemetryStore>>,
    status: Arc<Mutex<DecoderStatus>>,
    shutdown: Arc<ShutdownSignal>,
    worker: Option<JoinHandle<()>>,
}

impl TelemetryDecoder {
    /// Start connecting to `sensor` in the background
    pub fn spawn<C: BleClient>(
        sensor: &SensorConfig,
        client: C,
        settings: DecoderSettings,
        reporter: Reporter,
    ) -> Result<Self> {
        let store = Arc::new(Mutex::new(TelemetryStore::new(
            &sensor.address,
            &sensor.description,
            &sensor.streams,
        )));
        let status = Arc::new(Mutex::new(DecoderStatus::Connecting));
        let shutdown = Arc::new(ShutdownSignal::default());

        let context = DecoderContext {
            address: sensor.address.clone(),
            description: sensor.description.clone(),
            streams: sensor.streams.clone(),
            settings,
            store: store.clone(),
            status: status.clone(),
            shutdown: shutdown.clone(),
            reporter,
        };

        let worker = std::thread::Builder::new()
            .name(format!("lockstep-telemetry-{}", store::device_id(&sensor.address)))
            .spawn(move || run(client, context))?;

        Ok(Self {
            description: sensor.description.clone(),
            streams: sensor.streams.clone(),
            store,
            status,
            shutdown,
            worker: Some(worker),
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> DecoderStatus {
        *self.status.lock()
    }

    /// Open the recording gate for a new take
    pub fn start(&self) {
        self.store.lock().start();
        log::info!("[Telemetry {}] recording", self.description);
    }

    /// Close the gate and persist the take. Never fails: a sensor that
    /// could not be saved reports no data.
    pub fn stop(&self, session: &RecordingSession, output_dir: &Path) -> TelemetryReport {
        let result = self.store.lock().finish(output_dir, &session.file_prefix());
        match result {
            Ok(report) => {
                if self.status() == DecoderStatus::Lost {
                    log::warn!("[Telemetry {}] link was lost during the take", self.description);
                }
                report
            }
            Err(e) => {
                log::error!("[Telemetry {}] could not save: {}", self.description, e);
                TelemetryReport::no_data(&self.description, &self.streams)
            }
        }
    }

    /// Close the link and join the decoder thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.request();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("[Telemetry {}] decoder thread panicked", self.description);
            }
        }
    }
}

impl Drop for TelemetryDecoder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

type Launch = Box<dyn FnOnce(DecoderSettings, Reporter) -> Result<TelemetryDecoder> + Send>;

/// A configured sensor paired with the client that reaches it, ready to be
/// launched by the session
pub struct SensorLink {
    config: SensorConfig,
    launch: Launch,
}

impl SensorLink {
    pub fn new<C: BleClient>(config: SensorConfig, client: C) -> Self {
        let sensor = config.clone();
        Self {
            config,
            launch: Box::new(move |settings, reporter| {
                TelemetryDecoder::spawn(&sensor, client, settings, reporter)
            }),
        }
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    pub fn launch(self, settings: DecoderSettings, reporter: Reporter) -> Result<TelemetryDecoder> {
        (self.launch)(settings, reporter)
    }
}

// ============================================================================
// Decoder thread
// ============================================================================

fn run<C: BleClient>(mut client: C, context: DecoderContext) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            context.set_status(DecoderStatus::Failed);
            context.report(format!("{}: decoder not started ({})", context.description, e));
            return;
        }
    };
    runtime.block_on(drive(&mut client, &context));
}

async fn drive<C: BleClient>(client: &mut C, context: &DecoderContext) {
    let label = context.description.as_str();
    let (tx, mut rx) = mpsc::unbounded_channel::<(Uuid, Vec<u8>, DateTime<Local>)>();
    let callback: NotificationCallback = Arc::new(move |characteristic, bytes| {
        let _ = tx.send((characteristic, bytes.to_vec(), Local::now()));
    });

    let mut link = LinkState::default();
    let outcome = tokio::select! {
        result = setup(client, context, callback, &mut link) => Some(result),
        _ = context.shutdown.notify.notified() => None,
    };

    match outcome {
        None => {
            log::info!("[Telemetry {}] shut down during setup", label);
            close(client, &link, label).await;
            context.set_status(DecoderStatus::Closed);
            return;
        }
        Some(Err(e)) => {
            context.set_status(DecoderStatus::Failed);
            match e {
                TelemetryError::Connect(_) => context.report(format!("{}: {}", label, e)),
                _ => context.report(format!("{}: stream setup failed ({})", label, e)),
            }
            close(client, &link, label).await;
            return;
        }
        Some(Ok(())) => {
            context.set_status(DecoderStatus::Streaming);
            log::info!("[Telemetry {}] streaming {:?}", label, context.streams);
        }
    }

    let mut link_check = tokio::time::interval(context.settings.link_check);
    loop {
        tokio::select! {
            Some((characteristic, bytes, received_at)) = rx.recv() => {
                handle_notification(context, characteristic, &bytes, received_at);
            }
            _ = context.shutdown.notify.notified() => break,
            _ = link_check.tick() => {
                if !client.is_connected() {
                    link.connected = false;
                    context.set_status(DecoderStatus::Lost);
                    context.report(format!("{}: connection lost", label));
                    return;
                }
            }
        }
    }

    close(client, &link, label).await;
    context.set_status(DecoderStatus::Closed);
}

/// Connect and activate the requested streams, recording in `link` what
/// has been opened so a cancelled setup can still be closed.
async fn setup<C: BleClient>(
    client: &mut C,
    context: &DecoderContext,
    callback: NotificationCallback,
    link: &mut LinkState,
) -> Result<()> {
    client
        .connect(&context.address)
        .await
        .map_err(|e| match e {
            TelemetryError::Connect(reason) => TelemetryError::Connect(reason),
            other => TelemetryError::Connect(other.to_string()),
        })?;
    link.connected = true;
    log::info!("[Telemetry {}] connected to {}", context.description, context.address);

    client.subscribe(protocol::PMD_CONTROL, callback.clone()).await?;
    link.subscriptions.push(protocol::PMD_CONTROL);

    if context.streams.contains(&StreamKind::Hr) {
        client
            .subscribe(protocol::HEART_RATE_MEASUREMENT, callback.clone())
            .await?;
        link.subscriptions.push(protocol::HEART_RATE_MEASUREMENT);
    }

    // SDK-mode streams start first, after the settle period
    let mut measurements: Vec<StreamKind> = context
        .streams
        .iter()
        .copied()
        .filter(|kind| kind.measurement_type().is_some())
        .collect();
    measurements.sort_by_key(|kind| (!kind.needs_sdk_mode(), *kind));
    measurements.dedup();

    if measurements.iter().any(|kind| kind.needs_sdk_mode()) {
        client.write(protocol::PMD_CONTROL, protocol::SDK_MODE).await?;
        link.sdk_mode = true;
        log::debug!(
            "[Telemetry {}] SDK mode requested, settling {:?}",
            context.description,
            context.settings.sdk_settle
        );
        tokio::time::sleep(context.settings.sdk_settle).await;
    }

    for kind in &measurements {
        if let Some(command) = kind.start_command() {
            client.write(protocol::PMD_CONTROL, command).await?;
        }
    }

    if !measurements.is_empty() {
        client.subscribe(protocol::PMD_DATA, callback).await?;
        link.subscriptions.push(protocol::PMD_DATA);
    }
    Ok(())
}

fn handle_notification(
    context: &DecoderContext,
    characteristic: Uuid,
    bytes: &[u8],
    received_at: DateTime<Local>,
) {
    let label = context.description.as_str();
    if characteristic == protocol::PMD_CONTROL {
        match protocol::classify_response(bytes) {
            Some(ControlResponse::SdkModeEnabled) => {
                log::info!("[Telemetry {}] SDK mode enabled", label)
            }
            Some(ControlResponse::StreamReady(kind)) => {
                log::info!("[Telemetry {}] {} connected", label, kind.label())
            }
            Some(ControlResponse::StreamStopped(kind)) => {
                log::debug!("[Telemetry {}] stream stopped: {:?}", label, kind)
            }
            Some(ControlResponse::Rejected { op, measurement, status }) => log::warn!(
                "[Telemetry {}] request {:02x}/{:02x} rejected with status {}",
                label,
                op,
                measurement,
                status
            ),
            None => log::trace!("[Telemetry {}] ignored control frame {:02x?}", label, bytes),
        }
        return;
    }

    let first = context.store.lock().ingest(characteristic, bytes, received_at);
    for kind in first {
        context.report(format!("{}: {} received", label, kind.label()));
    }
}

/// Undo everything `setup` opened, in reverse. Runs once per decoder.
async fn close<C: BleClient>(client: &mut C, link: &LinkState, label: &str) {
    if !link.connected {
        return;
    }

    for characteristic in link.subscriptions.iter().rev() {
        if *characteristic == protocol::PMD_CONTROL {
            continue;
        }
        if let Err(e) = client.unsubscribe(*characteristic).await {
            log::warn!("[Telemetry {}] unsubscribe {} failed: {}", label, characteristic, e);
        }
    }
    if link.sdk_mode {
        if let Err(e) = client.write(protocol::PMD_CONTROL, protocol::STOP_SDK).await {
            log::warn!("[Telemetry {}] stop SDK mode failed: {}", label, e);
        }
    }
    if link.subscriptions.contains(&protocol::PMD_CONTROL) {
        if let Err(e) = client.unsubscribe(protocol::PMD_CONTROL).await {
            log::warn!("[Telemetry {}] unsubscribe control failed: {}", label, e);
        }
    }
    if let Err(e) = client.disconnect().await {
        log::warn!("[Telemetry {}] disconnect failed: {}", label, e);
    }
    log::info!("[Telemetry {}] disconnected", label);
}
