// Whole sessions on synthetic collaborators

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lockstep_lib::config::{Config, SensorConfig};
use lockstep_lib::session::{SessionController, SessionError};
use lockstep_lib::sim::{self, DryRunEncoder, LoggingDaw, ScriptedSensor, SyntheticCamera};
use lockstep_lib::telemetry::{DecoderStatus, SensorLink, StreamKind};
use lockstep_lib::Reporter;
use parking_lot::Mutex;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.output_dir = dir.to_path_buf();
    config.fps = 60;
    config.reset_settle_ms = 5;
    config.shutdown_grace_ms = 0;
    config.audio_poll_ms = 5;
    config.sdk_settle_secs = 0;
    config.encoder.quit_grace_ms = 100;
    config
}

fn sensor() -> SensorConfig {
    SensorConfig {
        address: "A0:9E:1A:00:00:01".into(),
        description: "Polar H10".into(),
        streams: vec![StreamKind::Hr],
    }
}

fn recording_reporter() -> (Reporter, Arc<Mutex<Vec<String>>>) {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    (Arc::new(move |m: &str| sink.lock().push(m.to_string())), messages)
}

fn wait_for_sensor(controller: &SessionController, status: DecoderStatus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while controller.sensor_statuses()[0].1 != status {
        assert!(Instant::now() < deadline, "sensor never reached {:?}", status);
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn two_cameras_audio_and_a_sensor_share_one_take() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.sensors = vec![sensor()];

    let daw = LoggingDaw::new(2);
    let encoder = DryRunEncoder::new();
    let mut collaborators = sim::collaborators(&config, true);
    collaborators.audio = Box::new(daw.clone());
    collaborators.encoder = Arc::new(encoder.clone());
    let (reporter, messages) = recording_reporter();

    let mut controller = SessionController::launch(config, collaborators, reporter).unwrap();
    wait_for_sensor(&controller, DecoderStatus::Streaming);

    let session = controller.start_session(Some(120.0)).unwrap();
    assert_eq!(daw.log().recording, Some(120.0));
    std::thread::sleep(Duration::from_millis(300));
    let summary = controller.stop_session().unwrap();

    let prefix = session.file_prefix();
    assert_eq!(summary.session, session);
    assert_eq!(summary.video_files.len(), 2);
    assert!(summary.audio_recorded);
    assert_eq!(summary.telemetry.len(), 1);
    assert_eq!(summary.telemetry[0].csv_count(), 1);
    assert_eq!(encoder.jobs().len(), 2);

    let csv = format!("{}_A0-9E-1A-00-00-01_hr.csv", prefix);
    let names = file_names(dir.path());
    assert!(names.contains(&format!("{}_cam1_operator.avi", prefix)));
    assert!(names.contains(&format!("{}_cam2_operator.avi", prefix)));
    assert!(names.contains(&csv));
    assert!(names.iter().all(|name| name.starts_with(&prefix)));

    let rows = std::fs::read_to_string(dir.path().join(&csv)).unwrap();
    assert!(rows.lines().count() > 1);

    controller.shutdown();
    let log = daw.log();
    assert_eq!((log.takes_started, log.takes_stopped), (1, 1));
    assert!(messages.lock().iter().any(|m| m == "Polar H10: HR received"));
    assert!(messages.lock().iter().any(|m| m == "Polar H10: HR saved."));
}

#[test]
fn unreachable_sensor_does_not_hold_up_the_take() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let mut collaborators = sim::collaborators(&config, true);
    collaborators.sensors = vec![SensorLink::new(sensor(), ScriptedSensor::unreachable())];
    let (reporter, messages) = recording_reporter();

    let mut controller = SessionController::launch(config, collaborators, reporter).unwrap();
    wait_for_sensor(&controller, DecoderStatus::Failed);

    controller.start_session(None).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    let summary = controller.stop_session().unwrap();

    assert_eq!(summary.video_files.len(), 2);
    assert_eq!(summary.telemetry_files().count(), 0);
    assert_eq!(summary.telemetry[0].summary(), "Polar H10: no data");
    assert!(messages
        .lock()
        .iter()
        .any(|m| m.starts_with("Polar H10: could not connect")));
}

#[test]
fn missing_camera_aborts_launch_instead_of_hanging() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let daw = LoggingDaw::new(2);
    let mut collaborators = sim::collaborators(&config, true);
    collaborators.cameras[1].source = Box::new(SyntheticCamera::failing());
    collaborators.audio = Box::new(daw.clone());

    let began = Instant::now();
    let result = SessionController::launch(config, collaborators, lockstep_lib::log_reporter());
    assert!(matches!(result, Err(SessionError::Setup(_))));
    assert!(began.elapsed() < Duration::from_secs(10));
    assert_eq!(daw.log().takes_started, 0);
    assert!(file_names(dir.path()).is_empty());
}

#[test]
fn backups_receive_a_copy_of_the_take() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let backup = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.cameras.truncate(1);
    config.backup_destinations = vec![backup.path().to_path_buf()];

    let collaborators = sim::collaborators(&config, true);
    let mut controller =
        SessionController::launch(config, collaborators, lockstep_lib::log_reporter()).unwrap();
    let session = controller.start_session(None).unwrap();
    let summary = controller.stop_session().unwrap();

    let report = summary.backup.unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(
        file_names(backup.path()),
        vec![format!("{}_cam1_operator.avi", session.file_prefix())]
    );
}
