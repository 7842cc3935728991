//! Synthetic collaborators.
//!
//! Stand-ins for cameras, windows, the encoder, the DAW and the wearable
//! sensor. The binary runs whole sessions on them with `--simulate`, and
//! the tests use them to drive real workers without hardware.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::audio::{AudioEngine, AudioError};
use crate::capture::{self, BasicEffects, CaptureError, CaptureSource, DisplaySink, Frame};
use crate::config::Config;
use crate::recorder::{self, EncoderJob, EncoderLauncher, EncoderProcess, FfmpegLauncher, RecorderError};
use crate::session::{CameraRig, Collaborators};
use crate::telemetry::{self, protocol, BleClient, NotificationCallback, SensorLink, StreamKind, TelemetryError};

// ============================================================================
// Camera and display
// ============================================================================

/// Paced gradient generator standing in for a webcam
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    interval: Duration,
    fail_open: bool,
    opened: bool,
    tick: u64,
    next_due: Option<Instant>,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            interval: Duration::from_secs(1) / fps.max(1),
            fail_open: false,
            opened: false,
            tick: 0,
            next_due: None,
        }
    }

    /// A camera whose device is missing
    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::new(16, 16, 30)
        }
    }
}

impl CaptureSource for SyntheticCamera {
    fn open(&mut self, id: &str) -> capture::Result<()> {
        if self.fail_open {
            return Err(CaptureError::Open {
                id: id.to_string(),
                reason: "no such device".into(),
            });
        }
        self.opened = true;
        log::debug!("[Sim] camera {} opened ({}x{})", id, self.width, self.height);
        Ok(())
    }

    fn read(&mut self) -> capture::Result<Frame> {
        if !self.opened {
            return Err(CaptureError::Read("camera is not open".into()));
        }

        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + self.interval);

        let shift = self.tick as usize;
        self.tick += 1;
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height as usize {
            for x in 0..self.width as usize {
                data.push((x + shift) as u8);
                data.push((y + shift) as u8);
                data.push(shift as u8);
            }
        }
        Frame::new(self.width, self.height, 3, data)
    }

    fn close(&mut self) {
        self.opened = false;
    }
}

/// Window sink that only counts what it is asked to show
#[derive(Debug, Default, Clone)]
pub struct HeadlessDisplay {
    shown: Arc<AtomicU64>,
}

impl HeadlessDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_shown(&self) -> u64 {
        self.shown.load(Ordering::Relaxed)
    }
}

impl DisplaySink for HeadlessDisplay {
    fn show(&mut self, _window: &str, _frame: &Frame) -> capture::Result<()> {
        self.shown.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn poll_input(&mut self) -> Option<char> {
        None
    }

    fn destroy(&mut self, window: &str) {
        log::debug!("[Sim] {} closed after {} frames", window, self.frames_shown());
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Encoder that writes a marker file instead of capturing the screen
#[derive(Debug, Default, Clone)]
pub struct DryRunEncoder {
    jobs: Arc<Mutex<Vec<EncoderJob>>>,
}

impl DryRunEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<EncoderJob> {
        self.jobs.lock().clone()
    }
}

impl EncoderLauncher for DryRunEncoder {
    fn launch(&self, job: &EncoderJob) -> recorder::Result<Box<dyn EncoderProcess>> {
        if let Some(parent) = job.output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(
            &job.output_path,
            format!("dry run capture of '{}' at {} fps\n", job.window_title, job.framerate),
        )?;
        self.jobs.lock().push(job.clone());
        Ok(Box::new(DryRunProcess { quit: false }))
    }
}

struct DryRunProcess {
    quit: bool,
}

impl EncoderProcess for DryRunProcess {
    fn send_quit(&mut self) -> recorder::Result<()> {
        if self.quit {
            return Err(RecorderError::Process("quit already sent".into()));
        }
        self.quit = true;
        Ok(())
    }

    fn try_wait(&mut self) -> recorder::Result<bool> {
        Ok(self.quit)
    }

    fn terminate(&mut self) -> recorder::Result<()> {
        self.quit = true;
        Ok(())
    }
}

// ============================================================================
// DAW
// ============================================================================

/// Everything a [`LoggingDaw`] was told to do
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DawLog {
    pub effects: Vec<bool>,
    pub params: Vec<f64>,
    pub muted: bool,
    /// Tempo of the take in progress
    pub recording: Option<f64>,
    pub takes_started: usize,
    pub takes_stopped: usize,
}

/// DAW stand-in that logs every request and keeps the resulting state
#[derive(Debug, Clone)]
pub struct LoggingDaw {
    state: Arc<Mutex<DawLog>>,
}

impl LoggingDaw {
    pub fn new(tracks: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(DawLog {
                effects: vec![false; tracks],
                params: vec![0.0; tracks],
                ..DawLog::default()
            })),
        }
    }

    pub fn log(&self) -> DawLog {
        self.state.lock().clone()
    }

    fn track(&self, track: usize) -> crate::audio::Result<()> {
        if track < self.state.lock().effects.len() {
            Ok(())
        } else {
            Err(AudioError::Daw(format!("no track {}", track)))
        }
    }
}

impl AudioEngine for LoggingDaw {
    fn track_count(&self) -> usize {
        self.state.lock().effects.len()
    }

    fn enable_effect(&mut self, track: usize) -> crate::audio::Result<()> {
        self.track(track)?;
        log::debug!("[Sim DAW] track {} delay on", track);
        self.state.lock().effects[track] = true;
        Ok(())
    }

    fn disable_effect(&mut self, track: usize) -> crate::audio::Result<()> {
        self.track(track)?;
        self.state.lock().effects[track] = false;
        Ok(())
    }

    fn set_param(&mut self, track: usize, value: f64) -> crate::audio::Result<()> {
        self.track(track)?;
        log::debug!("[Sim DAW] track {} delay {} ms", track, value);
        self.state.lock().params[track] = value;
        Ok(())
    }

    fn start_recording(&mut self, tempo: f64) -> crate::audio::Result<()> {
        log::info!("[Sim DAW] recording at {} BPM", tempo);
        let mut state = self.state.lock();
        state.recording = Some(tempo);
        state.takes_started += 1;
        Ok(())
    }

    fn stop_recording(&mut self) -> crate::audio::Result<()> {
        log::info!("[Sim DAW] recording stopped");
        let mut state = self.state.lock();
        state.recording = None;
        state.takes_stopped += 1;
        Ok(())
    }

    fn mute_all(&mut self) -> crate::audio::Result<()> {
        self.state.lock().muted = true;
        Ok(())
    }

    fn unmute_all(&mut self) -> crate::audio::Result<()> {
        self.state.lock().muted = false;
        Ok(())
    }
}

// ============================================================================
// Sensor
// ============================================================================

const EMIT_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Default)]
struct SensorInner {
    reachable: bool,
    connected: bool,
    connect_attempts: usize,
    written: Vec<Vec<u8>>,
    subscriptions: HashMap<Uuid, NotificationCallback>,
    started: BTreeSet<StreamKind>,
    emitting: bool,
}

impl SensorInner {
    fn callback(&self, characteristic: Uuid) -> Option<NotificationCallback> {
        self.subscriptions.get(&characteristic).cloned()
    }
}

type SharedSensor = Arc<Mutex<SensorInner>>;

/// BLE client answering like a PMD sensor.
///
/// Acknowledges control writes and, while connected, emits heart rate and
/// any started PMD streams every 20 ms.
pub struct ScriptedSensor {
    inner: SharedSensor,
}

/// Observer side of a [`ScriptedSensor`], usable after the sensor moved
/// into its decoder
#[derive(Clone)]
pub struct SensorProbe {
    inner: SharedSensor,
}

impl ScriptedSensor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SensorInner {
                reachable: true,
                ..SensorInner::default()
            })),
        }
    }

    /// A sensor that is out of range
    pub fn unreachable() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SensorInner::default())),
        }
    }

    pub fn probe(&self) -> SensorProbe {
        SensorProbe { inner: self.inner.clone() }
    }

    fn acknowledge(&self, command: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        let ack = match command {
            c if c == protocol::SDK_MODE => protocol::SDK_MODE_ACK.to_vec(),
            c if c == protocol::STOP_SDK => {
                inner.started.retain(|kind| !kind.needs_sdk_mode());
                vec![0xF0, 0x03, 0x09, 0x00, 0x00]
            }
            _ => {
                let kind = StreamKind::ALL
                    .into_iter()
                    .find(|kind| kind.start_command() == Some(command))?;
                inner.started.insert(kind);
                match kind {
                    StreamKind::Ppg => protocol::PPG_READY_ACK.to_vec(),
                    _ => vec![0xF0, 0x02, kind.measurement_type()?, 0x00, 0x00],
                }
            }
        };
        Some(ack)
    }

    fn start_emitter(&self) -> telemetry::Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.emitting {
                return Ok(());
            }
            inner.emitting = true;
        }
        let inner = self.inner.clone();
        std::thread::Builder::new()
            .name("lockstep-sim-sensor".into())
            .spawn(move || emit(inner))
            .map(|_| ())
            .map_err(|e| TelemetryError::Ble(format!("emitter not started: {}", e)))
    }
}

impl Default for ScriptedSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScriptedSensor {
    fn drop(&mut self) {
        self.inner.lock().connected = false;
    }
}

/// Emitter loop; ends once the link is down
fn emit(inner: SharedSensor) {
    let mut tick: u64 = 0;
    loop {
        let (hr, data, started) = {
            let mut state = inner.lock();
            if !state.connected {
                state.emitting = false;
                return;
            }
            (
                state.callback(protocol::HEART_RATE_MEASUREMENT),
                state.callback(protocol::PMD_DATA),
                state.started.clone(),
            )
        };

        if let Some(hr) = hr {
            hr(protocol::HEART_RATE_MEASUREMENT, &[0x00, 60 + (tick % 20) as u8]);
        }
        if let Some(data) = data {
            let device_nanos = tick * EMIT_INTERVAL.as_nanos() as u64;
            for kind in &started {
                if let Some(frame) = synthetic_frame(*kind, device_nanos, tick) {
                    data(protocol::PMD_DATA, &frame);
                }
            }
        }

        tick += 1;
        std::thread::sleep(EMIT_INTERVAL);
    }
}

fn synthetic_frame(kind: StreamKind, device_nanos: u64, tick: u64) -> Option<Vec<u8>> {
    let mut frame = vec![kind.measurement_type()?];
    frame.extend_from_slice(&device_nanos.to_le_bytes());
    frame.push(0x00);
    match kind {
        StreamKind::Ppg => {
            for i in 0..2u64 {
                for channel in 0..4u64 {
                    let value = ((tick * 2 + i) * 16 + channel) as u32;
                    frame.extend_from_slice(&value.to_le_bytes()[..3]);
                }
            }
        }
        StreamKind::Ppi => {
            let ppi_ms = 800u16 + (tick % 50) as u16;
            frame.push(75);
            frame.extend_from_slice(&ppi_ms.to_le_bytes());
            frame.extend_from_slice(&5u16.to_le_bytes());
            frame.push(0x00);
        }
        StreamKind::Acc => frame.extend_from_slice(&[0x01, 0x00, 0x02, 0x00, 0x03, 0x00]),
        StreamKind::Hr => return None,
    }
    Some(frame)
}

impl BleClient for ScriptedSensor {
    async fn connect(&mut self, address: &str) -> telemetry::Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.connect_attempts += 1;
            if !inner.reachable {
                return Err(TelemetryError::Connect(format!("{} not found", address)));
            }
            inner.connected = true;
        }
        self.start_emitter()
    }

    async fn subscribe(
        &mut self,
        characteristic: Uuid,
        callback: NotificationCallback,
    ) -> telemetry::Result<()> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(TelemetryError::Ble("not connected".into()));
        }
        inner.subscriptions.insert(characteristic, callback);
        Ok(())
    }

    async fn unsubscribe(&mut self, characteristic: Uuid) -> telemetry::Result<()> {
        self.inner.lock().subscriptions.remove(&characteristic);
        Ok(())
    }

    async fn write(&mut self, characteristic: Uuid, value: &[u8]) -> telemetry::Result<()> {
        {
            let mut inner = self.inner.lock();
            if !inner.connected {
                return Err(TelemetryError::Ble("not connected".into()));
            }
            if characteristic == protocol::PMD_CONTROL {
                inner.written.push(value.to_vec());
            }
        }
        if characteristic != protocol::PMD_CONTROL {
            return Ok(());
        }
        if let Some(ack) = self.acknowledge(value) {
            let control = self.inner.lock().callback(protocol::PMD_CONTROL);
            if let Some(control) = control {
                control(protocol::PMD_CONTROL, &ack);
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> telemetry::Result<()> {
        let mut inner = self.inner.lock();
        inner.connected = false;
        inner.subscriptions.clear();
        inner.started.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }
}

impl SensorProbe {
    /// Control commands in the order they were written
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.inner.lock().written.clone()
    }

    pub fn subscriptions(&self) -> Vec<Uuid> {
        self.inner.lock().subscriptions.keys().copied().collect()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.lock().connect_attempts
    }

    /// Drop the radio link without a disconnect
    pub fn drop_link(&self) {
        let mut inner = self.inner.lock();
        inner.connected = false;
        inner.subscriptions.clear();
    }
}

// ============================================================================
// Whole rigs
// ============================================================================

/// Collaborators for a session without hardware: synthetic cameras,
/// headless windows, the logging DAW and scripted sensors. With
/// `dry_run` the encoder only writes marker files, otherwise FFmpeg
/// captures the (headless) windows.
pub fn collaborators(config: &Config, dry_run: bool) -> Collaborators {
    let cameras = config
        .cameras
        .iter()
        .map(|camera| CameraRig {
            source_id: camera.source.clone(),
            source: Box::new(SyntheticCamera::new(320, 240, config.fps)),
            operator_display: Box::new(HeadlessDisplay::new()),
            performer_display: Box::new(HeadlessDisplay::new()),
        })
        .collect();

    let encoder: Arc<dyn EncoderLauncher> = if dry_run {
        Arc::new(DryRunEncoder::new())
    } else {
        Arc::new(FfmpegLauncher::from_settings(&config.encoder))
    };

    Collaborators {
        cameras,
        audio: Box::new(LoggingDaw::new(config.cameras.len().max(1))),
        encoder,
        effects: Arc::new(BasicEffects::new(config.blank_region)),
        sensors: config
            .sensors
            .iter()
            .map(|sensor| SensorLink::new(sensor.clone(), ScriptedSensor::new()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_camera_fails_to_open() {
        let mut camera = SyntheticCamera::failing();
        assert!(matches!(camera.open("7"), Err(CaptureError::Open { .. })));
        assert!(camera.read().is_err());
    }

    #[test]
    fn camera_frames_change_every_tick() {
        let mut camera = SyntheticCamera::new(4, 2, 1000);
        camera.open("0").unwrap();
        let first = camera.read().unwrap();
        let second = camera.read().unwrap();
        assert_eq!(first.pixels().len(), 4 * 2 * 3);
        assert_ne!(first.pixels(), second.pixels());
    }

    #[test]
    fn dry_run_encoder_leaves_a_file_and_quits() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = DryRunEncoder::new();
        let job = EncoderJob {
            window_title: "Cam 1 Rec".into(),
            framerate: 30,
            output_path: dir.path().join("take_cam1_operator.avi"),
        };
        let mut process = encoder.launch(&job).unwrap();
        assert!(job.output_path.exists());
        assert!(!process.try_wait().unwrap());

        let outcome = recorder::stop_process(process.as_mut(), Duration::from_millis(100), "test");
        assert_eq!(outcome, recorder::StopOutcome::Quit);
        assert_eq!(encoder.jobs(), vec![job]);
    }

    #[test]
    fn synthetic_ppg_frames_decode() {
        let frame = synthetic_frame(StreamKind::Ppg, 0, 3).unwrap();
        match protocol::decode_data(&frame) {
            Some(protocol::DataFrame::Ppg { samples, .. }) => {
                assert_eq!(samples.len(), 2);
                assert_eq!(samples[0], [96, 97, 98, 99]);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }
}
