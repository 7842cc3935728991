// Shared control state read by every consumer loop

pub mod manipulation;
pub mod schedule;
pub mod state;

pub use manipulation::{action_for_key, Action, Manipulation, PauseTarget};
pub use schedule::{DelayDriver, DelaySchedule, ScheduleEnd};
pub use state::{ControlSettings, ControlSnapshot, ControlState, ControlWatcher, ResetListener, ResetRequest};

/// Error type for control operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("Unknown manipulation: {0}")]
    UnknownManipulation(String),

    #[error("Unknown delay preset: {0}")]
    UnknownPreset(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;
