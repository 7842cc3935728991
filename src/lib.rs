// Lockstep - synchronized multi-participant capture for delay-perception
// experiments
// Main library entry point

pub mod audio;
pub mod capture;
pub mod config;
pub mod control;
pub mod recorder;
pub mod session;
pub mod sim;
pub mod sync;
pub mod telemetry;

use std::sync::Arc;

/// Operator-facing feedback sink (soft failures, telemetry summaries)
pub type Reporter = Arc<dyn Fn(&str) + Send + Sync>;

/// Reporter that forwards to the log
pub fn log_reporter() -> Reporter {
    Arc::new(|message: &str| log::info!("[Report] {}", message))
}

/// Initialize logging with `RUST_LOG` or the given default filter
pub fn init_logging(default_filter: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .init();
}
