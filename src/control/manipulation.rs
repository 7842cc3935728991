// Manipulations the operator toggles on the performer's view and audio

use std::fmt;
use std::str::FromStr;

use super::ControlError;

/// Which outputs a pause freezes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PauseTarget {
    Video,
    Audio,
    Both,
}

impl PauseTarget {
    pub fn affects_video(self) -> bool {
        matches!(self, PauseTarget::Video | PauseTarget::Both)
    }

    pub fn affects_audio(self) -> bool {
        matches!(self, PauseTarget::Audio | PauseTarget::Both)
    }
}

/// An exclusive manipulation. At most one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Manipulation {
    /// Mirror the performer view
    Flip,
    /// Show (and play) the performance `delay_ms` late
    Delay,
    /// Keep recording live frames into the loop buffer while showing live
    LoopRecord,
    /// Replay the loop buffer
    LoopPlay,
    /// Black out the configured face region
    BlankFace,
    /// Black out the eye band of the face region
    BlankEyes,
    Pause(PauseTarget),
}

impl Manipulation {
    pub const ALL: [Manipulation; 9] = [
        Manipulation::Flip,
        Manipulation::Delay,
        Manipulation::LoopRecord,
        Manipulation::LoopPlay,
        Manipulation::BlankFace,
        Manipulation::BlankEyes,
        Manipulation::Pause(PauseTarget::Video),
        Manipulation::Pause(PauseTarget::Audio),
        Manipulation::Pause(PauseTarget::Both),
    ];

    pub fn name(self) -> &'static str {
        match self {
            Manipulation::Flip => "flip",
            Manipulation::Delay => "delay",
            Manipulation::LoopRecord => "loop_record",
            Manipulation::LoopPlay => "loop_play",
            Manipulation::BlankFace => "blank_face",
            Manipulation::BlankEyes => "blank_eyes",
            Manipulation::Pause(PauseTarget::Video) => "pause_video",
            Manipulation::Pause(PauseTarget::Audio) => "pause_audio",
            Manipulation::Pause(PauseTarget::Both) => "pause_both",
        }
    }

    pub fn affects_video(self) -> bool {
        match self {
            Manipulation::Pause(target) => target.affects_video(),
            _ => true,
        }
    }

    pub fn affects_audio(self) -> bool {
        match self {
            Manipulation::Delay => true,
            Manipulation::Pause(target) => target.affects_audio(),
            _ => false,
        }
    }

    /// Compact encoding used for lock-free storage; 0 means "none"
    pub(crate) fn to_code(manipulation: Option<Manipulation>) -> u8 {
        match manipulation {
            None => 0,
            Some(m) => Self::ALL
                .iter()
                .position(|candidate| *candidate == m)
                .map(|index| index as u8 + 1)
                .unwrap_or(0),
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Manipulation> {
        match code {
            0 => None,
            code => Self::ALL.get(code as usize - 1).copied(),
        }
    }
}

impl fmt::Display for Manipulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Manipulation {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        let manipulation = match normalized.as_str() {
            "flip" | "flipped" => Manipulation::Flip,
            "delay" | "delayed" => Manipulation::Delay,
            "loop_record" | "loop_rec" => Manipulation::LoopRecord,
            "loop_play" => Manipulation::LoopPlay,
            "blank_face" => Manipulation::BlankFace,
            "blank_eyes" => Manipulation::BlankEyes,
            "pause_video" => Manipulation::Pause(PauseTarget::Video),
            "pause_audio" => Manipulation::Pause(PauseTarget::Audio),
            "pause_both" | "pause" => Manipulation::Pause(PauseTarget::Both),
            _ => return Err(ControlError::UnknownManipulation(s.to_string())),
        };
        Ok(manipulation)
    }
}

/// Operator action triggered from a display window's keyboard focus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Enable(Manipulation),
    Reset,
    Quit,
}

/// Fixed key map used by every display window
pub fn action_for_key(key: char) -> Option<Action> {
    match key {
        '1' => Some(Action::Enable(Manipulation::Flip)),
        '2' => Some(Action::Enable(Manipulation::Delay)),
        'r' => Some(Action::Reset),
        'q' => Some(Action::Quit),
        _ => None,
    }
}
