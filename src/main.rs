//! Lockstep console front end
//!
//! Launches a session from the configuration file and reads operator
//! commands from stdin until `quit` or a display window asks to quit.

use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{unbounded, RecvTimeoutError};

use lockstep_lib::audio::jsfx;
use lockstep_lib::config::{default_config_path, CameraConfig, Config};
use lockstep_lib::control::DelaySchedule;
use lockstep_lib::session::{Collaborators, SessionController, SessionStatus};
use lockstep_lib::{init_logging, log_reporter, sim};

/// Synchronized capture, display and telemetry for delay-perception sessions
#[derive(Parser, Debug)]
#[command(name = "lockstep")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (created with defaults if missing)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use synthetic cameras, windows, DAW and sensors
    #[arg(long)]
    simulate: bool,

    /// Write marker files instead of running the encoder
    #[arg(long)]
    dry_run: bool,

    /// Override the number of participants
    #[arg(long, value_name = "N")]
    cameras: Option<usize>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

const HELP: &str = "commands: start [tempo] | stop | enable <manipulation> | delay <ms|preset> \
                    | moving <resample ms> <ms>... | variable <resample ms> <ms>... | reset | status | quit";

fn main() {
    let args = Args::parse();
    init_logging(if args.verbose { "debug" } else { "info" });

    if let Err(e) = run(args) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load_or_default(&path);
    if !path.exists() {
        config
            .save(&path)
            .with_context(|| format!("writing default configuration to {}", path.display()))?;
        log::info!("Wrote default configuration to {}", path.display());
    }

    if let Some(count) = args.cameras {
        config.cameras = (0..count)
            .map(|index| CameraConfig {
                source: index.to_string(),
                label: None,
            })
            .collect();
    }

    if let Some(effect) = &config.effect_file {
        if let Err(e) = jsfx::sync_delay_range(effect, config.delay.max_ms) {
            log::warn!("Delay effect not updated: {}", e);
        }
    }
    Ok(config)
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;

    let mut collaborators = sim::collaborators(&config, args.dry_run);
    if !args.simulate {
        attach_cameras(&config, &mut collaborators)?;
    }

    let mut controller = SessionController::launch(config, collaborators, log_reporter())
        .context("session could not start")?;
    println!("{}", HELP);

    // stdin is read on its own thread so display-initiated quits are noticed
    let (lines_tx, lines_rx) = unbounded::<String>();
    std::thread::Builder::new()
        .name("lockstep-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines().map_while(Result::ok) {
                if lines_tx.send(line).is_err() {
                    break;
                }
            }
        })?;

    // key presses on the display windows change the control state too
    let mut watcher = controller.control().watch();
    loop {
        if let Some(snapshot) = watcher.changed() {
            log::debug!("[Control] {:?}", snapshot);
        }
        if controller.stop_requested() {
            log::info!("Quit requested from a display window");
            break;
        }
        let line = match lines_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if !handle_command(&mut controller, line.trim()) {
            break;
        }
    }

    controller.shutdown();
    Ok(())
}

/// Replace the synthetic cameras with live ones
#[cfg(feature = "gstreamer")]
fn attach_cameras(config: &Config, collaborators: &mut Collaborators) -> anyhow::Result<()> {
    use lockstep_lib::capture::gst::{self, GstCaptureSource};

    gst::init().context("GStreamer is not available")?;
    for rig in &mut collaborators.cameras {
        rig.source = Box::new(GstCaptureSource::new(1280, 720, config.fps));
    }
    Ok(())
}

#[cfg(not(feature = "gstreamer"))]
fn attach_cameras(_config: &Config, _collaborators: &mut Collaborators) -> anyhow::Result<()> {
    anyhow::bail!("built without the `gstreamer` feature; run with --simulate")
}

/// Execute one operator command. Returns false on quit.
fn handle_command(controller: &mut SessionController, line: &str) -> bool {
    let (command, argument) = match line.split_once(char::is_whitespace) {
        Some((command, argument)) => (command, argument.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "start" => {
            let tempo = if argument.is_empty() {
                None
            } else {
                match argument.parse::<f64>() {
                    Ok(tempo) if tempo > 0.0 => Some(tempo),
                    _ => {
                        println!("tempo must be a positive number");
                        return true;
                    }
                }
            };
            match controller.start_session(tempo) {
                Ok(session) => println!("recording {}", session.file_prefix()),
                Err(e) => println!("{}", e),
            }
        }
        "stop" => match controller.stop_session() {
            Ok(summary) => {
                for file in summary.video_files.iter().chain(summary.telemetry_files()) {
                    println!("  {}", file.display());
                }
                println!("audio recorded: {}", summary.audio_recorded);
            }
            Err(e) => println!("{}", e),
        },
        "enable" => match controller.enable_named(argument) {
            Ok(manipulation) => println!("{} enabled", manipulation),
            Err(e) => println!("{}", e),
        },
        "delay" => match controller.set_delay(argument) {
            Ok(ms) => println!("delay {} ms", ms),
            Err(e) => println!("{}", e),
        },
        "moving" | "variable" => match parse_schedule(command == "variable", argument) {
            Some(schedule) => {
                if let Err(e) = controller.run_delay_schedule(schedule) {
                    println!("{}", e);
                }
            }
            None => println!("usage: {} <resample ms> <ms> [<ms>...]", command),
        },
        "reset" => controller.reset(),
        "status" => {
            let snapshot = controller.control().snapshot();
            println!("{:?}, {:?}", controller.status(), snapshot);
            for (sensor, status) in controller.sensor_statuses() {
                println!("  {}: {:?}", sensor, status);
            }
        }
        "quit" | "exit" => {
            if controller.status() == SessionStatus::Recording {
                println!("stopping the take in progress");
            }
            return false;
        }
        _ => println!("{}", HELP),
    }
    true
}

/// `<resample ms> <ms> [<ms>...]` into a delay schedule
fn parse_schedule(repeat: bool, argument: &str) -> Option<DelaySchedule> {
    let mut values = argument.split_whitespace().map(|v| v.parse::<u32>().ok());
    let resample = Duration::from_millis(values.next()?? as u64);
    let steps: Vec<u32> = values.collect::<Option<_>>()?;
    if steps.is_empty() {
        return None;
    }
    Some(if repeat {
        DelaySchedule::variable(steps, resample)
    } else {
        DelaySchedule::moving(steps, resample)
    })
}
