//! Screen-capture encoder backed by FFmpeg via ffmpeg-sidecar.
//!
//! Each recording is one FFmpeg process grabbing a display window by title.
//! FFmpeg finishes the container cleanly when it reads `q` on stdin.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Stdio};

use ffmpeg_sidecar::command::FfmpegCommand;

use super::{EncoderJob, EncoderLauncher, EncoderProcess, RecorderError, Result};
use crate::config::EncoderSettings;

/// Resolve the FFmpeg binary: explicit path, then the copy next to our
/// executable, then PATH.
fn resolve_ffmpeg_path(configured: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = configured {
        return path.clone();
    }
    let sidecar = ffmpeg_sidecar::paths::ffmpeg_path();
    if sidecar.exists() {
        sidecar
    } else {
        PathBuf::from("ffmpeg")
    }
}

/// Platform screen-grab input for a window title
fn default_input(window: &str) -> (&'static str, String) {
    #[cfg(target_os = "windows")]
    {
        ("gdigrab", format!("title={}", window))
    }
    #[cfg(target_os = "macos")]
    {
        let _ = window;
        ("avfoundation", "1:none".to_string())
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let _ = window;
        let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0.0".to_string());
        ("x11grab", display)
    }
}

/// Launches one FFmpeg screen capture per [`EncoderJob`]
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    ffmpeg_path: PathBuf,
    video_size: Option<String>,
    input_format: Option<String>,
    input_target: Option<String>,
}

impl FfmpegLauncher {
    pub fn from_settings(settings: &EncoderSettings) -> Self {
        Self {
            ffmpeg_path: resolve_ffmpeg_path(settings.ffmpeg_path.as_ref()),
            video_size: settings.video_size.clone(),
            input_format: settings.input_format.clone(),
            input_target: settings.input_target.clone(),
        }
    }

    /// Input format and input argument for `job`
    fn input_for(&self, job: &EncoderJob) -> (String, String) {
        let (default_format, default_target) = default_input(&job.window_title);
        let format = self
            .input_format
            .clone()
            .unwrap_or_else(|| default_format.to_string());
        let target = match &self.input_target {
            Some(template) => template.replace("{window}", &job.window_title),
            None => default_target,
        };
        (format, target)
    }

    /// Full FFmpeg argument list for `job`
    pub fn arguments(&self, job: &EncoderJob) -> Vec<String> {
        let (format, target) = self.input_for(job);
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-f".into(),
            format,
            "-framerate".into(),
            job.framerate.to_string(),
            "-probesize".into(),
            "500M".into(),
            "-i".into(),
            target,
        ];
        if let Some(size) = &self.video_size {
            args.push("-video_size".into());
            args.push(size.clone());
        }
        args.extend(["-pix_fmt".to_string(), "yuv420p".to_string(), "-y".to_string()]);
        args.push(job.output_path.to_string_lossy().to_string());
        args
    }
}

impl EncoderLauncher for FfmpegLauncher {
    fn launch(&self, job: &EncoderJob) -> Result<Box<dyn EncoderProcess>> {
        let mut command = FfmpegCommand::new_with_path(&self.ffmpeg_path);
        command.args(self.arguments(job));

        // Get the inner command and configure stdio
        let inner_command = command.as_inner_mut();
        inner_command.stdin(Stdio::piped());
        inner_command.stdout(Stdio::null());
        inner_command.stderr(Stdio::piped());

        let mut child = inner_command
            .spawn()
            .map_err(|e| RecorderError::Launch(format!("{}: {}", self.ffmpeg_path.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecorderError::Launch("FFmpeg stdin unavailable".into()))?;

        // Forward FFmpeg diagnostics to our log
        if let Some(stderr) = child.stderr.take() {
            let window = job.window_title.clone();
            let spawned = std::thread::Builder::new()
                .name("lockstep-ffmpeg-stderr".into())
                .spawn(move || {
                    use std::io::{BufRead, BufReader};
                    let reader = BufReader::new(stderr);
                    for line in reader.lines().map_while(std::result::Result::ok) {
                        log::debug!("[FFmpeg {}] {}", window, line);
                    }
                });
            if let Err(e) = spawned {
                log::warn!("[FFmpeg] stderr reader not started: {}", e);
            }
        }

        Ok(Box::new(FfmpegProcess {
            child,
            stdin: Some(stdin),
        }))
    }
}

/// A running FFmpeg capture
pub struct FfmpegProcess {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl EncoderProcess for FfmpegProcess {
    fn send_quit(&mut self) -> Result<()> {
        let mut stdin = self
            .stdin
            .take()
            .ok_or_else(|| RecorderError::Process("quit already sent".into()))?;
        stdin.write_all(b"q")?;
        stdin.flush()?;
        // Dropping stdin closes the pipe, which FFmpeg also treats as end of input
        Ok(())
    }

    fn try_wait(&mut self) -> Result<bool> {
        Ok(self.child.try_wait()?.is_some())
    }

    fn terminate(&mut self) -> Result<()> {
        if self.child.try_wait()?.is_none() {
            self.child.kill()?;
        }
        self.child.wait()?;
        Ok(())
    }
}

impl Drop for FfmpegProcess {
    fn drop(&mut self) {
        // Never leave an orphaned capture running
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn job() -> EncoderJob {
        EncoderJob {
            window_title: "Cam 1 Rec".into(),
            framerate: 30,
            output_path: Path::new("out").join("take_cam1_operator.avi"),
        }
    }

    #[test]
    fn template_targets_the_window() {
        let launcher = FfmpegLauncher::from_settings(&EncoderSettings {
            ffmpeg_path: Some(PathBuf::from("/opt/ffmpeg")),
            input_format: Some("gdigrab".into()),
            input_target: Some("title={window}".into()),
            ..EncoderSettings::default()
        });
        let args = launcher.arguments(&job());

        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "title=Cam 1 Rec");
        let format = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(args[format + 1], "gdigrab");
        assert!(args.windows(2).any(|w| w[0] == "-framerate" && w[1] == "30"));
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "yuv420p"));
        assert_eq!(args.last().map(String::as_str), Some(job().output_path.to_str().unwrap()));
    }

    #[test]
    fn video_size_is_optional() {
        let launcher = FfmpegLauncher::from_settings(&EncoderSettings {
            ffmpeg_path: Some(PathBuf::from("ffmpeg")),
            video_size: None,
            ..EncoderSettings::default()
        });
        assert!(!launcher.arguments(&job()).iter().any(|a| a == "-video_size"));
    }
}
