// Session orchestration
//
// Launch wires one capture pipeline, two display consumers and the
// recorders of every camera, the audio controller and the telemetry
// decoders, then meets all workers at the rendezvous. Takes are started
// and stopped from here with one shared record-start timestamp.

pub mod backup;

pub use backup::{copy_take, BackupReport};

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;

use crate::audio::{self, AudioController, AudioEngine, SharedAudioEngine};
use crate::capture::{
    CapturePipeline, CaptureSource, DisplayConsumer, DisplaySink, DisplayTiming, Frame,
    FrameEffect, ViewKind,
};
use crate::config::Config;
use crate::control::{ControlError, ControlState, DelayDriver, DelaySchedule, Manipulation};
use crate::recorder::{
    EncoderLauncher, RecorderError, RecorderHandle, RecorderLifecycle, RecorderSettings,
};
use crate::sync::{frame_queue, Rendezvous, StopSignal};
use crate::telemetry::{DecoderSettings, DecoderStatus, SensorLink, TelemetryDecoder, TelemetryReport};
use crate::Reporter;

/// Error type for session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No cameras configured")]
    NoCameras,

    #[error("Session setup failed: {0}")]
    Setup(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Cannot {action} while {status:?}")]
    InvalidState {
        action: &'static str,
        status: SessionStatus,
    },

    #[error("Session is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Control(#[from] ControlError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

// ============================================================================
// Takes
// ============================================================================

/// One take, identified by the moment it started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSession {
    record_start: DateTime<Local>,
}

impl RecordingSession {
    pub fn now() -> Self {
        Self::at(Local::now())
    }

    pub fn at(record_start: DateTime<Local>) -> Self {
        Self { record_start }
    }

    pub fn record_start(&self) -> DateTime<Local> {
        self.record_start
    }

    /// Prefix shared by every file of the take
    pub fn file_prefix(&self) -> String {
        self.record_start.format("%Y-%m-%d_%H-%M-%S").to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Armed,
    Recording,
    Stopping,
}

/// What one take produced
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session: RecordingSession,
    pub video_files: Vec<PathBuf>,
    /// Whether the DAW started and stopped the take cleanly
    pub audio_recorded: bool,
    pub telemetry: Vec<TelemetryReport>,
    pub backup: Option<BackupReport>,
}

impl SessionSummary {
    pub fn telemetry_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.telemetry.iter().flat_map(|report| report.files.iter())
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Devices of one participant
pub struct CameraRig {
    pub source_id: String,
    pub source: Box<dyn CaptureSource>,
    pub operator_display: Box<dyn DisplaySink>,
    pub performer_display: Box<dyn DisplaySink>,
}

/// Everything outside the process a session talks to
pub struct Collaborators {
    pub cameras: Vec<CameraRig>,
    pub audio: Box<dyn AudioEngine>,
    pub encoder: Arc<dyn EncoderLauncher>,
    pub effects: Arc<dyn FrameEffect>,
    pub sensors: Vec<SensorLink>,
}

// ============================================================================
// Controller
// ============================================================================

pub struct SessionController {
    config: Config,
    control: Arc<ControlState>,
    audio: SharedAudioEngine,
    recorders: Vec<RecorderHandle>,
    decoders: Vec<TelemetryDecoder>,
    workers: Vec<JoinHandle<()>>,
    stop: StopSignal,
    reporter: Reporter,
    status: SessionStatus,
    current: Option<RecordingSession>,
    delay_driver: Option<DelayDriver>,
    audio_started: bool,
    shut_down: bool,
}

impl SessionController {
    /// Start every worker and wait for all of them to be ready.
    ///
    /// Fails without leaving threads behind if any camera or output folder
    /// cannot be set up.
    pub fn launch(config: Config, collaborators: Collaborators, reporter: Reporter) -> Result<Self> {
        let Collaborators {
            cameras,
            audio,
            encoder,
            effects,
            sensors,
        } = collaborators;
        if cameras.is_empty() {
            return Err(SessionError::NoCameras);
        }

        let views = config.recorded_views();
        let parties = cameras.len() * config.workers_per_camera() + 2;
        let barrier = Arc::new(Rendezvous::new(parties));
        let stop = StopSignal::new();
        let control = Arc::new(ControlState::from_config(&config));
        let audio: SharedAudioEngine = Arc::new(Mutex::new(audio));
        log::info!(
            "[Session] launching {} cameras, {} sensors, {} parties",
            cameras.len(),
            sensors.len(),
            parties
        );

        let decoders = launch_sensors(sensors, DecoderSettings::from(&config), &reporter);

        let mut controller = Self {
            control: control.clone(),
            audio: audio.clone(),
            recorders: Vec::new(),
            decoders,
            workers: Vec::new(),
            stop: stop.clone(),
            reporter,
            status: SessionStatus::Idle,
            current: None,
            delay_driver: None,
            audio_started: false,
            shut_down: false,
            config,
        };

        let timing = DisplayTiming {
            fps: controller.config.fps,
            loop_max_secs: controller.config.loop_max_secs,
            grace: Duration::from_millis(controller.config.shutdown_grace_ms),
        };
        let recorder_settings = RecorderSettings {
            output_dir: controller.config.output_dir.clone(),
            extension: controller.config.encoder.extension.clone(),
            framerate: controller.config.encoder.framerate,
            quit_grace: Duration::from_millis(controller.config.encoder.quit_grace_ms),
        };

        let spawned = (|| -> std::io::Result<()> {
            for (camera, rig) in cameras.into_iter().enumerate() {
                let (operator_tx, operator_rx) = frame_queue::<Frame>(controller.config.queue_capacity);
                let (performer_tx, performer_rx) = frame_queue::<Frame>(controller.config.queue_capacity);

                controller.workers.push(
                    CapturePipeline::new(
                        camera,
                        rig.source_id,
                        rig.source,
                        vec![operator_tx, performer_tx],
                        barrier.clone(),
                        stop.clone(),
                    )
                    .spawn()?,
                );

                for (view, queue, sink) in [
                    (ViewKind::Operator, operator_rx, rig.operator_display),
                    (ViewKind::Performer, performer_rx, rig.performer_display),
                ] {
                    let consumer = DisplayConsumer::new(
                        camera,
                        view,
                        queue,
                        sink,
                        effects.clone(),
                        control.clone(),
                        barrier.clone(),
                        stop.clone(),
                        timing,
                    );
                    controller.workers.push(consumer.spawn()?);
                }

                for view in &views {
                    let (worker, handle) = RecorderLifecycle::new(
                        camera,
                        *view,
                        recorder_settings.clone(),
                        encoder.clone(),
                        barrier.clone(),
                        stop.clone(),
                    );
                    controller.workers.push(worker.spawn()?);
                    controller.recorders.push(handle);
                }
            }

            let audio_worker = AudioController::new(
                audio.clone(),
                control.clone(),
                barrier.clone(),
                stop.clone(),
                Duration::from_millis(controller.config.audio_poll_ms),
            );
            controller.workers.push(audio_worker.spawn()?);
            Ok(())
        })();

        if let Err(e) = spawned {
            log::error!("[Session] could not start workers: {}", e);
            barrier.abort();
            controller.shutdown();
            return Err(SessionError::Spawn(e));
        }

        if barrier.wait().is_err() {
            log::error!("[Session] setup failed, aborting");
            controller.shutdown();
            return Err(SessionError::Setup(
                "a camera or output folder could not be opened".into(),
            ));
        }

        log::info!("[Session] all workers running");
        Ok(controller)
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn control(&self) -> &Arc<ControlState> {
        &self.control
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The take in progress
    pub fn current(&self) -> Option<&RecordingSession> {
        self.current.as_ref()
    }

    /// True once a display window asked to quit
    pub fn stop_requested(&self) -> bool {
        self.stop.is_raised()
    }

    pub fn sensor_statuses(&self) -> Vec<(String, DecoderStatus)> {
        self.decoders
            .iter()
            .map(|decoder| (decoder.description().to_string(), decoder.status()))
            .collect()
    }

    fn report(&self, message: &str) {
        (self.reporter)(message);
    }

    /// Begin a take at `tempo` (the configured default when `None`)
    pub fn start_session(&mut self, tempo: Option<f64>) -> Result<RecordingSession> {
        if self.stop.is_raised() {
            return Err(SessionError::ShuttingDown);
        }
        if self.status != SessionStatus::Idle {
            return Err(SessionError::InvalidState {
                action: "start",
                status: self.status,
            });
        }

        self.status = SessionStatus::Armed;
        self.control.reset();
        let session = RecordingSession::now();
        let tempo = tempo.unwrap_or(self.config.default_tempo);
        self.control.set_recording(true);

        self.audio_started = match audio::begin_take(self.audio.lock().as_mut(), tempo) {
            Ok(()) => true,
            Err(e) => {
                log::error!("[Session] audio did not start: {}", e);
                self.report(&format!("Audio recording failed to start: {}", e));
                false
            }
        };

        for recorder in &self.recorders {
            if let Err(e) = recorder.start(&session) {
                log::error!("[Session] recorder {}: {}", recorder.label(), e);
            }
        }
        for decoder in &self.decoders {
            decoder.start();
        }

        self.status = SessionStatus::Recording;
        self.current = Some(session.clone());
        log::info!("[Session] recording {} at {} BPM", session.file_prefix(), tempo);
        Ok(session)
    }

    /// Finish the take: stop audio, encoders and sensors, then back up
    pub fn stop_session(&mut self) -> Result<SessionSummary> {
        let session = match (&self.status, &self.current) {
            (SessionStatus::Recording, Some(session)) => session.clone(),
            _ => {
                return Err(SessionError::InvalidState {
                    action: "stop",
                    status: self.status,
                })
            }
        };

        self.status = SessionStatus::Stopping;
        self.control.reset();
        self.control.set_recording(false);

        let audio_stopped = match audio::end_take(self.audio.lock().as_mut()) {
            Ok(()) => true,
            Err(e) => {
                log::error!("[Session] audio did not stop: {}", e);
                false
            }
        };

        let timeout = Duration::from_millis(self.config.encoder.quit_grace_ms) + Duration::from_secs(2);
        let mut video_files = Vec::new();
        for recorder in &self.recorders {
            match recorder.stop(timeout) {
                Ok(Some(path)) => video_files.push(path),
                Ok(None) => log::warn!("[Session] recorder {} had nothing to stop", recorder.label()),
                Err(RecorderError::Disconnected) => {
                    log::warn!("[Session] recorder {} already shut down", recorder.label())
                }
                Err(e) => log::error!("[Session] recorder {}: {}", recorder.label(), e),
            }
        }

        let output_dir = self.config.output_dir.clone();
        let telemetry: Vec<TelemetryReport> = self
            .decoders
            .iter()
            .map(|decoder| decoder.stop(&session, &output_dir))
            .collect();
        for report in &telemetry {
            self.report(&report.summary());
        }

        let backup = if self.config.backup_destinations.is_empty() {
            None
        } else {
            let report = copy_take(&output_dir, &session.file_prefix(), &self.config.backup_destinations);
            self.report(&report.summary());
            Some(report)
        };

        self.status = SessionStatus::Idle;
        self.current = None;
        log::info!(
            "[Session] take {} saved: {} videos, {} telemetry files",
            session.file_prefix(),
            video_files.len(),
            telemetry.iter().map(TelemetryReport::csv_count).sum::<usize>()
        );

        Ok(SessionSummary {
            session,
            video_files,
            audio_recorded: self.audio_started && audio_stopped,
            telemetry,
            backup,
        })
    }

    pub fn enable(&self, manipulation: Manipulation) {
        self.control.enable(manipulation);
    }

    /// Enable a manipulation by name, e.g. `delay` or `pause audio`
    pub fn enable_named(&self, name: &str) -> Result<Manipulation> {
        let manipulation: Manipulation = name.parse()?;
        self.enable(manipulation);
        Ok(manipulation)
    }

    /// Set the delay time from milliseconds or a preset name. Returns the
    /// stored delay.
    pub fn set_delay(&self, value: &str) -> Result<u32> {
        let stored = match value.trim().parse::<u32>() {
            Ok(ms) => self.control.set_delay_ms(ms),
            Err(_) => self.control.apply_delay_preset(value)?,
        };
        Ok(stored)
    }

    pub fn reset(&self) {
        self.control.reset();
    }

    /// Enable the delay and step it through `schedule`, replacing any
    /// schedule still running. A reset or another manipulation ends it.
    pub fn run_delay_schedule(&mut self, schedule: DelaySchedule) -> Result<()> {
        if self.stop.is_raised() {
            return Err(SessionError::ShuttingDown);
        }
        if let Some(previous) = self.delay_driver.take() {
            previous.cancel();
        }
        log::info!(
            "[Session] delay schedule of {} steps every {} ms{}",
            schedule.steps.len(),
            schedule.resample.as_millis(),
            if schedule.repeat { ", repeating" } else { "" }
        );
        let driver = DelayDriver::spawn(self.control.clone(), schedule, self.stop.clone())
            .map_err(SessionError::Spawn)?;
        self.delay_driver = Some(driver);
        Ok(())
    }

    /// True while a delay schedule is stepping the delay
    pub fn delay_schedule_running(&self) -> bool {
        self.delay_driver.as_ref().is_some_and(|driver| !driver.is_finished())
    }

    /// Stop any take in progress, cancel every worker and wait for them.
    /// Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if self.status == SessionStatus::Recording {
            if let Err(e) = self.stop_session() {
                log::error!("[Session] could not stop the take: {}", e);
            }
        }

        self.stop.raise();
        if let Some(driver) = self.delay_driver.take() {
            driver.cancel();
        }
        for decoder in &mut self.decoders {
            decoder.shutdown();
        }
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                log::error!("[Session] {} panicked", name);
            }
        }
        log::info!("[Session] shut down");
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn launch_sensors(
    sensors: Vec<SensorLink>,
    settings: DecoderSettings,
    reporter: &Reporter,
) -> Vec<TelemetryDecoder> {
    sensors
        .into_iter()
        .filter_map(|sensor| {
            let description = sensor.config().description.clone();
            match sensor.launch(settings.clone(), reporter.clone()) {
                Ok(decoder) => Some(decoder),
                Err(e) => {
                    log::error!("[Session] sensor {} not started: {}", description, e);
                    reporter(&format!("{}: not started ({})", description, e));
                    None
                }
            }
        })
        .collect()
}
