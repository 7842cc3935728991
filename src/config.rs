// Configuration management for Lockstep

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::capture::ViewKind;
use crate::telemetry::StreamKind;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Folder receiving video, telemetry and raw dumps
    pub output_dir: PathBuf,

    /// Capture rate shared by cameras, history buffers and the encoder
    pub fps: u32,

    /// Frames each display queue holds before the capture loop blocks
    pub queue_capacity: usize,

    /// How long a reset blocks so consumer loops can observe it
    pub reset_settle_ms: u64,

    /// Wait between cancellation and window/resource teardown
    pub shutdown_grace_ms: u64,

    /// Tempo used when a session is started without one
    pub default_tempo: f64,

    /// Polling period of the audio controller
    pub audio_poll_ms: u64,

    /// Longest loop the performer view can record
    pub loop_max_secs: u32,

    /// Quiet period the sensor needs after switching to SDK mode
    pub sdk_settle_secs: u64,

    /// Display windows that get a screen recorder
    pub record_views: Vec<ViewKind>,

    /// Extra folders that receive a copy of every take
    pub backup_destinations: Vec<PathBuf>,

    /// Delay effect source kept in sync with `delay.max_ms`
    pub effect_file: Option<PathBuf>,

    /// One entry per participant
    pub cameras: Vec<CameraConfig>,

    pub delay: DelayConfig,

    /// Area blanked by the blank-face manipulation, in relative units
    pub blank_region: Region,

    pub encoder: EncoderSettings,

    pub sensors: Vec<SensorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    /// Device identifier passed to the capture source
    pub source: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayConfig {
    pub default_ms: u32,
    pub max_ms: u32,
    pub presets: BTreeMap<String, u32>,
}

impl Default for DelayConfig {
    fn default() -> Self {
        let presets = [("Short", 50), ("Medium", 200), ("Long", 1000), ("Longer", 5000)]
            .into_iter()
            .map(|(name, ms)| (name.to_string(), ms))
            .collect();
        Self {
            default_ms: 1000,
            max_ms: 10_000,
            presets,
        }
    }
}

/// Rectangle in relative frame coordinates (0.0 - 1.0)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Region {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Default for Region {
    fn default() -> Self {
        Self {
            x: 0.3,
            y: 0.1,
            width: 0.4,
            height: 0.5,
        }
    }
}

/// Screen-capture encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// Explicit ffmpeg binary; resolved next to the executable or on PATH otherwise
    pub ffmpeg_path: Option<PathBuf>,
    pub framerate: u32,
    pub video_size: Option<String>,
    /// ffmpeg input format override (`gdigrab`, `x11grab`, ...)
    pub input_format: Option<String>,
    /// ffmpeg input override; `{window}` is replaced with the window title
    pub input_target: Option<String>,
    /// Container extension of the recorded files
    pub extension: String,
    /// How long the encoder gets to exit after the quit byte
    pub quit_grace_ms: u64,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            framerate: 30,
            video_size: Some("1920x1080".to_string()),
            input_format: None,
            input_target: None,
            extension: "avi".to_string(),
            quit_grace_ms: 3000,
        }
    }
}

/// A wearable sensor to stream from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorConfig {
    /// Bluetooth address, e.g. `A0:9E:1A:12:34:56`
    pub address: String,
    /// Human readable name used in reports
    pub description: String,
    #[serde(default = "default_streams")]
    pub streams: Vec<StreamKind>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: get_default_output_dir(),
            fps: 30,
            queue_capacity: 5,
            reset_settle_ms: 300,
            shutdown_grace_ms: 1000,
            default_tempo: 120.0,
            audio_poll_ms: 100,
            cameras: vec![
                CameraConfig { source: "0".to_string(), label: None },
                CameraConfig { source: "1".to_string(), label: None },
            ],
            record_views: vec![ViewKind::Operator],
            delay: DelayConfig::default(),
            loop_max_secs: 30,
            blank_region: Region::default(),
            encoder: EncoderSettings::default(),
            sensors: Vec::new(),
            sdk_settle_secs: 5,
            backup_destinations: Vec::new(),
            effect_file: None,
        }
    }
}

impl Config {
    /// Load config from disk or return default
    pub fn load_or_default(config_path: &Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => {
                        log::warn!("Failed to parse config: {}", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read config file: {}", e);
                }
            }
        }

        Self::default()
    }

    /// Save config to disk
    pub fn save(&self, config_path: &Path) -> anyhow::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(config_path, contents)?;

        Ok(())
    }

    /// Views that get a recorder, without duplicates
    pub fn recorded_views(&self) -> Vec<ViewKind> {
        [ViewKind::Operator, ViewKind::Performer]
            .into_iter()
            .filter(|view| self.record_views.contains(view))
            .collect()
    }

    /// Number of independently scheduled workers per camera
    pub fn workers_per_camera(&self) -> usize {
        // capture + operator display + performer display + recorders
        3 + self.recorded_views().len()
    }
}

/// Get the default output folder for recordings
fn get_default_output_dir() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Lockstep")
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lockstep")
        .join("config.toml")
}

/// Default sensor streams (for serde)
fn default_streams() -> Vec<StreamKind> {
    vec![StreamKind::Hr, StreamKind::Ppg]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            fps = 25
            record_views = ["operator", "performer"]

            [[sensors]]
            address = "A0:9E:1A:00:00:01"
            description = "Polar H10"
            "#,
        )
        .unwrap();

        assert_eq!(config.fps, 25);
        assert_eq!(config.queue_capacity, 5);
        assert_eq!(config.delay.max_ms, 10_000);
        assert_eq!(config.delay.presets.get("Longer"), Some(&5000));
        assert_eq!(config.sensors[0].streams, vec![StreamKind::Hr, StreamKind::Ppg]);
        assert_eq!(config.workers_per_camera(), 5);
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.output_dir = dir.path().join("takes");
        config.delay.default_ms = 250;
        config.sensors.push(SensorConfig {
            address: "A0:9E:1A:00:00:02".to_string(),
            description: "Polar Verity".to_string(),
            streams: vec![StreamKind::Ppi],
        });
        config.save(&path).unwrap();

        let loaded = Config::load_or_default(&path);
        assert_eq!(loaded.output_dir, config.output_dir);
        assert_eq!(loaded.delay.default_ms, 250);
        assert_eq!(loaded.sensors, config.sensors);
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "fps = \"fast\"").unwrap();

        let config = Config::load_or_default(&path);
        assert_eq!(config.fps, 30);
    }
}
