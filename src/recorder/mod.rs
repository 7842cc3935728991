// Recorder lifecycle: one worker per recorded display window
//
// The worker owns at most one external encoder process at a time. It is
// driven by commands from the session controller and never touches the
// frame queues; the encoder captures the window itself.

pub mod ffmpeg;

pub use ffmpeg::FfmpegLauncher;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::capture::ViewKind;
use crate::session::RecordingSession;
use crate::sync::{Rendezvous, StopSignal};

/// Error type for recorder operations
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("Failed to launch encoder: {0}")]
    Launch(String),

    #[error("Encoder process error: {0}")]
    Process(String),

    #[error("Recorder worker is gone")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RecorderError>;

/// Everything an encoder needs to capture one window into one file
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderJob {
    pub window_title: String,
    pub framerate: u32,
    pub output_path: PathBuf,
}

/// Starts encoder processes
pub trait EncoderLauncher: Send + Sync {
    fn launch(&self, job: &EncoderJob) -> Result<Box<dyn EncoderProcess>>;
}

/// A running encoder process
pub trait EncoderProcess: Send {
    /// Ask the encoder to finish the file and exit
    fn send_quit(&mut self) -> Result<()>;
    /// `Ok(true)` once the process has exited
    fn try_wait(&mut self) -> Result<bool>;
    /// Kill the process and reap it
    fn terminate(&mut self) -> Result<()>;
}

/// How an encoder process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited on its own after the quit byte
    Quit,
    /// Still running after the grace window and was killed
    Terminated,
}

/// Send the quit byte, wait up to `grace`, then terminate
pub fn stop_process(process: &mut dyn EncoderProcess, grace: Duration, label: &str) -> StopOutcome {
    if let Err(e) = process.send_quit() {
        log::warn!("[Recorder {}] quit byte not delivered: {}", label, e);
    }

    let deadline = Instant::now() + grace;
    loop {
        match process.try_wait() {
            Ok(true) => return StopOutcome::Quit,
            Ok(false) => {}
            Err(e) => {
                log::warn!("[Recorder {}] {}", label, e);
                break;
            }
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    log::warn!("[Recorder {}] encoder did not quit in time, terminating", label);
    if let Err(e) = process.terminate() {
        log::error!("[Recorder {}] {}", label, e);
    }
    StopOutcome::Terminated
}

/// Output file for one window of one take
pub fn output_path(
    output_dir: &Path,
    session: &RecordingSession,
    camera: usize,
    view: ViewKind,
    extension: &str,
) -> PathBuf {
    output_dir.join(format!(
        "{}_cam{}_{}.{}",
        session.file_prefix(),
        camera + 1,
        view.as_str(),
        extension
    ))
}

// ============================================================================
// Worker
// ============================================================================

enum RecorderCommand {
    Start(RecordingSession),
    Stop(Sender<Option<PathBuf>>),
}

/// Controller-side handle of a [`RecorderLifecycle`] worker
#[derive(Clone)]
pub struct RecorderHandle {
    label: String,
    commands: Sender<RecorderCommand>,
}

impl RecorderHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Launch an encoder for this take. Returns immediately.
    pub fn start(&self, session: &RecordingSession) -> Result<()> {
        self.commands
            .send(RecorderCommand::Start(session.clone()))
            .map_err(|_| RecorderError::Disconnected)
    }

    /// Stop the running encoder and wait for the worker to report the
    /// finished file (if any)
    pub fn stop(&self, timeout: Duration) -> Result<Option<PathBuf>> {
        let (done_tx, done_rx) = bounded(1);
        self.commands
            .send(RecorderCommand::Stop(done_tx))
            .map_err(|_| RecorderError::Disconnected)?;
        done_rx
            .recv_timeout(timeout)
            .map_err(|_| RecorderError::Process(format!("{} did not confirm stop", self.label)))
    }
}

/// Settings shared by every recorder of a session
#[derive(Clone)]
pub struct RecorderSettings {
    pub output_dir: PathBuf,
    pub extension: String,
    pub framerate: u32,
    pub quit_grace: Duration,
}

struct ActiveRecording {
    process: Box<dyn EncoderProcess>,
    path: PathBuf,
}

/// Starts and stops the encoder of one display window
pub struct RecorderLifecycle {
    camera: usize,
    view: ViewKind,
    label: String,
    settings: RecorderSettings,
    launcher: Arc<dyn EncoderLauncher>,
    commands: Receiver<RecorderCommand>,
    barrier: Arc<Rendezvous>,
    stop: StopSignal,
    current: Option<ActiveRecording>,
}

impl RecorderLifecycle {
    pub fn new(
        camera: usize,
        view: ViewKind,
        settings: RecorderSettings,
        launcher: Arc<dyn EncoderLauncher>,
        barrier: Arc<Rendezvous>,
        stop: StopSignal,
    ) -> (Self, RecorderHandle) {
        let label = format!("cam{}_{}", camera + 1, view.as_str());
        let (commands_tx, commands_rx) = bounded(8);
        let worker = Self {
            camera,
            view,
            label: label.clone(),
            settings,
            launcher,
            commands: commands_rx,
            barrier,
            stop,
            current: None,
        };
        let handle = RecorderHandle {
            label,
            commands: commands_tx,
        };
        (worker, handle)
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("lockstep-recorder-{}", self.label))
            .spawn(move || self.run())
    }

    fn run(mut self) {
        if let Err(e) = std::fs::create_dir_all(&self.settings.output_dir) {
            log::error!(
                "[Recorder {}] output folder {} unavailable: {}",
                self.label,
                self.settings.output_dir.display(),
                e
            );
            self.barrier.abort();
            return;
        }

        if self.barrier.wait().is_err() {
            return;
        }
        log::debug!("[Recorder {}] ready", self.label);

        while !self.stop.is_raised() {
            match self.commands.recv_timeout(Duration::from_millis(100)) {
                Ok(RecorderCommand::Start(session)) => self.start(&session),
                Ok(RecorderCommand::Stop(done)) => {
                    let finished = self.finish();
                    let _ = done.send(finished);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if self.current.is_some() {
            log::info!("[Recorder {}] stopping encoder on shutdown", self.label);
            self.finish();
        }
    }

    fn start(&mut self, session: &RecordingSession) {
        if self.current.is_some() {
            log::warn!("[Recorder {}] already recording, restarting", self.label);
            self.finish();
        }

        let job = EncoderJob {
            window_title: self.view.window_title(self.camera),
            framerate: self.settings.framerate,
            output_path: output_path(
                &self.settings.output_dir,
                session,
                self.camera,
                self.view,
                &self.settings.extension,
            ),
        };

        match self.launcher.launch(&job) {
            Ok(process) => {
                log::info!(
                    "[Recorder {}] recording '{}' to {}",
                    self.label,
                    job.window_title,
                    job.output_path.display()
                );
                self.current = Some(ActiveRecording {
                    process,
                    path: job.output_path,
                });
            }
            Err(e) => log::error!("[Recorder {}] {}", self.label, e),
        }
    }

    fn finish(&mut self) -> Option<PathBuf> {
        let mut active = self.current.take()?;
        let outcome = stop_process(active.process.as_mut(), self.settings.quit_grace, &self.label);
        log::info!(
            "[Recorder {}] {} ({:?})",
            self.label,
            active.path.display(),
            outcome
        );
        Some(active.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct ProcessLog {
        launched: Vec<EncoderJob>,
        quits: usize,
        terminated: usize,
    }

    struct FakeProcess {
        log: Arc<Mutex<ProcessLog>>,
        honours_quit: bool,
        quit_sent: bool,
    }

    impl EncoderProcess for FakeProcess {
        fn send_quit(&mut self) -> Result<()> {
            self.quit_sent = true;
            self.log.lock().quits += 1;
            Ok(())
        }

        fn try_wait(&mut self) -> Result<bool> {
            Ok(self.quit_sent && self.honours_quit)
        }

        fn terminate(&mut self) -> Result<()> {
            self.log.lock().terminated += 1;
            Ok(())
        }
    }

    struct FakeLauncher {
        log: Arc<Mutex<ProcessLog>>,
        honours_quit: bool,
    }

    impl EncoderLauncher for FakeLauncher {
        fn launch(&self, job: &EncoderJob) -> Result<Box<dyn EncoderProcess>> {
            self.log.lock().launched.push(job.clone());
            Ok(Box::new(FakeProcess {
                log: self.log.clone(),
                honours_quit: self.honours_quit,
                quit_sent: false,
            }))
        }
    }

    fn session() -> RecordingSession {
        RecordingSession::at(chrono::Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap())
    }

    fn settings(dir: &Path) -> RecorderSettings {
        RecorderSettings {
            output_dir: dir.to_path_buf(),
            extension: "avi".into(),
            framerate: 30,
            quit_grace: Duration::from_millis(50),
        }
    }

    #[test]
    fn names_files_from_record_start() {
        let path = output_path(Path::new("/takes"), &session(), 1, ViewKind::Performer, "avi");
        assert_eq!(path, Path::new("/takes/2024-03-09_14-05-07_cam2_performer.avi"));
    }

    #[test]
    fn stubborn_encoder_is_terminated_after_grace() {
        let log = Arc::new(Mutex::new(ProcessLog::default()));
        let mut process = FakeProcess { log: log.clone(), honours_quit: false, quit_sent: false };
        let outcome = stop_process(&mut process, Duration::from_millis(30), "test");
        assert_eq!(outcome, StopOutcome::Terminated);
        assert_eq!(log.lock().quits, 1);
        assert_eq!(log.lock().terminated, 1);
    }

    #[test]
    fn worker_launches_and_stops_encoder_on_command() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(ProcessLog::default()));
        let launcher = Arc::new(FakeLauncher { log: log.clone(), honours_quit: true });
        let barrier = Arc::new(Rendezvous::new(2));
        let stop = StopSignal::new();

        let (worker, handle) = RecorderLifecycle::new(
            0,
            ViewKind::Operator,
            settings(dir.path()),
            launcher,
            barrier.clone(),
            stop.clone(),
        );
        let thread = worker.spawn().unwrap();
        barrier.wait().unwrap();

        handle.start(&session()).unwrap();
        let finished = handle.stop(Duration::from_secs(2)).unwrap();
        assert_eq!(
            finished,
            Some(dir.path().join("2024-03-09_14-05-07_cam1_operator.avi"))
        );

        // a second stop has nothing to finish
        assert_eq!(handle.stop(Duration::from_secs(2)).unwrap(), None);

        stop.raise();
        thread.join().unwrap();

        let log = log.lock();
        assert_eq!(log.launched.len(), 1);
        assert_eq!(log.launched[0].window_title, "Cam 1 Rec");
        assert_eq!(log.quits, 1);
        assert_eq!(log.terminated, 0);
    }

    #[test]
    fn shutdown_stops_running_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(ProcessLog::default()));
        let launcher = Arc::new(FakeLauncher { log: log.clone(), honours_quit: false });
        let barrier = Arc::new(Rendezvous::new(2));
        let stop = StopSignal::new();

        let (worker, handle) = RecorderLifecycle::new(
            1,
            ViewKind::Operator,
            settings(dir.path()),
            launcher,
            barrier.clone(),
            stop.clone(),
        );
        let thread = worker.spawn().unwrap();
        barrier.wait().unwrap();
        handle.start(&session()).unwrap();

        while log.lock().launched.is_empty() {
            std::thread::sleep(Duration::from_millis(5));
        }
        stop.raise();
        thread.join().unwrap();

        assert_eq!(log.lock().quits, 1);
        assert_eq!(log.lock().terminated, 1);
    }
}
