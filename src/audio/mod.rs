// Audio side of a session: the DAW contract and the worker that mirrors
// the control state into the DAW's delay effect

pub mod jsfx;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::control::{ControlState, Manipulation, ResetListener};
use crate::sync::{Rendezvous, StopSignal};

/// Error type for audio operations
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("DAW request failed: {0}")]
    Daw(String),

    #[error("Effect file error: {0}")]
    Effect(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// RPC surface of the DAW hosting the delay effect.
///
/// Tracks are addressed by index; each carries one delay effect whose
/// single parameter is the delay time in milliseconds.
pub trait AudioEngine: Send {
    fn track_count(&self) -> usize;
    fn enable_effect(&mut self, track: usize) -> Result<()>;
    fn disable_effect(&mut self, track: usize) -> Result<()>;
    fn set_param(&mut self, track: usize, value: f64) -> Result<()>;
    fn start_recording(&mut self, tempo: f64) -> Result<()>;
    fn stop_recording(&mut self) -> Result<()>;
    fn mute_all(&mut self) -> Result<()>;
    fn unmute_all(&mut self) -> Result<()>;
}

pub type SharedAudioEngine = Arc<Mutex<Box<dyn AudioEngine>>>;

/// Undo every audio manipulation: unmute and bypass the delay on all tracks
pub fn reset_manipulations(engine: &mut dyn AudioEngine) -> Result<()> {
    engine.unmute_all()?;
    for track in 0..engine.track_count() {
        engine.disable_effect(track)?;
    }
    Ok(())
}

/// Begin a take at `tempo`
pub fn begin_take(engine: &mut dyn AudioEngine, tempo: f64) -> Result<()> {
    reset_manipulations(engine)?;
    engine.start_recording(tempo)
}

pub fn end_take(engine: &mut dyn AudioEngine) -> Result<()> {
    reset_manipulations(engine)?;
    engine.stop_recording()
}

/// What the controller last pushed to the DAW
#[derive(Debug, Default, Clone, PartialEq)]
struct Applied {
    delay_enabled: bool,
    delay_ms: Option<u32>,
    muted: bool,
}

/// Polls the control state and drives the DAW accordingly.
///
/// A rendezvous party like the video workers, so audio manipulation is live
/// exactly when the pipelines are.
pub struct AudioController {
    engine: SharedAudioEngine,
    control: Arc<ControlState>,
    reset: ResetListener,
    barrier: Arc<Rendezvous>,
    stop: StopSignal,
    poll: Duration,
    applied: Applied,
    /// Set when a reset request is seen, cleared once the DAW has been reset
    reset_due: bool,
}

impl AudioController {
    pub fn new(
        engine: SharedAudioEngine,
        control: Arc<ControlState>,
        barrier: Arc<Rendezvous>,
        stop: StopSignal,
        poll: Duration,
    ) -> Self {
        let reset = control.audio_reset().listen();
        Self {
            engine,
            control,
            reset,
            barrier,
            stop,
            poll,
            applied: Applied::default(),
            reset_due: false,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("lockstep-audio".into())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        if let Err(e) = reset_manipulations(self.engine.lock().as_mut()) {
            log::warn!("[Audio] initial reset failed: {}", e);
        }

        if self.barrier.wait().is_err() {
            return;
        }
        log::info!("[Audio] running");

        while !self.stop.is_raised() {
            if let Err(e) = self.tick() {
                log::warn!("[Audio] {}", e);
            }
            std::thread::sleep(self.poll);
        }

        if let Err(e) = reset_manipulations(self.engine.lock().as_mut()) {
            log::warn!("[Audio] final reset failed: {}", e);
        }
        log::info!("[Audio] stopped");
    }

    /// One poll of the control state
    fn tick(&mut self) -> Result<()> {
        let mut engine = self.engine.lock();

        if self.reset.poll() {
            self.reset_due = true;
        }
        if self.reset_due {
            // retried every tick until the DAW accepts it
            reset_manipulations(engine.as_mut())?;
            self.applied = Applied::default();
            self.reset_due = false;
            self.reset.acknowledge();
        }

        match self.control.active() {
            Some(Manipulation::Delay) => {
                if !self.applied.delay_enabled {
                    for track in 0..engine.track_count() {
                        engine.enable_effect(track)?;
                    }
                    self.applied.delay_enabled = true;
                }
                let delay_ms = self.control.delay_ms();
                if self.applied.delay_ms != Some(delay_ms) {
                    for track in 0..engine.track_count() {
                        engine.set_param(track, delay_ms as f64)?;
                    }
                    self.applied.delay_ms = Some(delay_ms);
                    log::debug!("[Audio] delay {} ms", delay_ms);
                }
            }
            Some(Manipulation::Pause(target)) if target.affects_audio() => {
                if !self.applied.muted {
                    engine.mute_all()?;
                    self.applied.muted = true;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlSettings, PauseTarget};

    #[derive(Debug, Default, Clone, PartialEq)]
    struct DawState {
        effects: Vec<bool>,
        params: Vec<f64>,
        muted: bool,
        recording: Option<f64>,
        calls: usize,
        unmute_failures: usize,
    }

    struct FakeDaw(Arc<Mutex<DawState>>);

    impl AudioEngine for FakeDaw {
        fn track_count(&self) -> usize {
            2
        }
        fn enable_effect(&mut self, track: usize) -> Result<()> {
            let mut s = self.0.lock();
            s.calls += 1;
            s.effects[track] = true;
            Ok(())
        }
        fn disable_effect(&mut self, track: usize) -> Result<()> {
            let mut s = self.0.lock();
            s.calls += 1;
            s.effects[track] = false;
            Ok(())
        }
        fn set_param(&mut self, track: usize, value: f64) -> Result<()> {
            let mut s = self.0.lock();
            s.calls += 1;
            s.params[track] = value;
            Ok(())
        }
        fn start_recording(&mut self, tempo: f64) -> Result<()> {
            self.0.lock().recording = Some(tempo);
            Ok(())
        }
        fn stop_recording(&mut self) -> Result<()> {
            self.0.lock().recording = None;
            Ok(())
        }
        fn mute_all(&mut self) -> Result<()> {
            self.0.lock().muted = true;
            Ok(())
        }
        fn unmute_all(&mut self) -> Result<()> {
            let mut s = self.0.lock();
            if s.unmute_failures > 0 {
                s.unmute_failures -= 1;
                return Err(AudioError::Daw("unmute timed out".into()));
            }
            s.muted = false;
            Ok(())
        }
    }

    fn fixture() -> (Arc<Mutex<DawState>>, SharedAudioEngine, Arc<ControlState>) {
        let state = Arc::new(Mutex::new(DawState {
            effects: vec![false; 2],
            params: vec![0.0; 2],
            ..DawState::default()
        }));
        let engine: SharedAudioEngine = Arc::new(Mutex::new(Box::new(FakeDaw(state.clone()))));
        let control = Arc::new(ControlState::new(ControlSettings {
            reset_settle: Duration::ZERO,
            ..ControlSettings::default()
        }));
        (state, engine, control)
    }

    fn controller(engine: &SharedAudioEngine, control: &Arc<ControlState>) -> AudioController {
        AudioController::new(
            engine.clone(),
            control.clone(),
            Arc::new(Rendezvous::new(1)),
            StopSignal::new(),
            Duration::from_millis(1),
        )
    }

    #[test]
    fn delay_enables_effect_on_every_track_once() {
        let (daw, engine, control) = fixture();
        let mut audio = controller(&engine, &control);

        control.set_delay_ms(350);
        control.enable(Manipulation::Delay);
        audio.tick().unwrap();
        let after_first = daw.lock().clone();
        assert_eq!(after_first.effects, vec![true, true]);
        assert_eq!(after_first.params, vec![350.0, 350.0]);

        // nothing changed: no further DAW traffic
        audio.tick().unwrap();
        assert_eq!(daw.lock().calls, after_first.calls);

        control.set_delay_ms(400);
        audio.tick().unwrap();
        assert_eq!(daw.lock().params, vec![400.0, 400.0]);
    }

    #[test]
    fn reset_request_restores_dry_unmuted_audio() {
        let (daw, engine, control) = fixture();
        let mut audio = controller(&engine, &control);

        control.enable(Manipulation::Pause(PauseTarget::Both));
        audio.tick().unwrap();
        assert!(daw.lock().muted);
        assert!(!control.audio_reset().is_pending());

        control.reset();
        assert!(control.audio_reset().is_pending());
        audio.tick().unwrap();
        assert!(!daw.lock().muted);
        assert_eq!(daw.lock().effects, vec![false, false]);
        assert!(!control.audio_reset().is_pending());
    }

    #[test]
    fn failed_reset_is_retried_until_the_daw_accepts_it() {
        let (daw, engine, control) = fixture();
        let mut audio = controller(&engine, &control);

        control.enable(Manipulation::Pause(PauseTarget::Audio));
        audio.tick().unwrap();
        assert!(daw.lock().muted);

        daw.lock().unmute_failures = 1;
        control.reset();
        assert!(audio.tick().is_err());
        assert!(control.audio_reset().is_pending());
        assert!(daw.lock().muted);

        audio.tick().unwrap();
        assert!(!control.audio_reset().is_pending());
        assert!(!daw.lock().muted);
        assert_eq!(daw.lock().effects, vec![false, false]);
    }

    #[test]
    fn video_only_pause_keeps_audio_running() {
        let (daw, engine, control) = fixture();
        let mut audio = controller(&engine, &control);
        control.enable(Manipulation::Pause(PauseTarget::Video));
        audio.tick().unwrap();
        assert!(!daw.lock().muted);
    }

    #[test]
    fn takes_reset_before_recording() {
        let (daw, engine, _control) = fixture();
        {
            let mut engine = engine.lock();
            engine.mute_all().unwrap();
            begin_take(engine.as_mut(), 96.0).unwrap();
        }
        assert_eq!(daw.lock().recording, Some(96.0));
        assert!(!daw.lock().muted);

        end_take(engine.lock().as_mut()).unwrap();
        assert_eq!(daw.lock().recording, None);
    }
}
