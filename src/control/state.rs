// Typed control store with the cooperative reset protocol
//
// Plain fields are single atomics so each read or write is self-contained.
// Reset bookkeeping spans several fields and lives behind one lock.
// Writers are the controller and display key handlers; readers are every
// consumer loop, which poll once per iteration.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{ControlError, Manipulation, Result};
use crate::config::Config;

/// Static parameters of a control store
#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub default_delay_ms: u32,
    pub max_delay_ms: u32,
    pub delay_presets: BTreeMap<String, u32>,
    /// How long `reset` blocks so in-flight iterations can observe it
    pub reset_settle: Duration,
}

impl Default for ControlSettings {
    fn default() -> Self {
        let config = Config::default();
        Self::from(&config)
    }
}

impl From<&Config> for ControlSettings {
    fn from(config: &Config) -> Self {
        Self {
            default_delay_ms: config.delay.default_ms,
            max_delay_ms: config.delay.max_ms,
            delay_presets: config.delay.presets.clone(),
            reset_settle: Duration::from_millis(config.reset_settle_ms),
        }
    }
}

// ============================================================================
// Reset requests
// ============================================================================

/// A "discard your private state" request for one subsystem (video or audio).
///
/// Every subsystem that owns per-manipulation state registers a
/// [`ResetListener`]. The request stays pending until every registered
/// listener has acknowledged the latest epoch.
#[derive(Debug, Default)]
pub struct ResetRequest {
    inner: Mutex<ResetInner>,
    /// Copy of `inner.epoch` for lock-free polling
    epoch: AtomicU64,
}

#[derive(Debug, Default)]
struct ResetInner {
    epoch: u64,
    pending: bool,
    listeners: usize,
    acknowledged: usize,
}

impl ResetInner {
    fn settle_if_complete(&mut self) {
        if self.acknowledged >= self.listeners {
            self.pending = false;
        }
    }
}

impl ResetRequest {
    fn request(&self) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        inner.acknowledged = 0;
        inner.pending = inner.listeners > 0;
        self.epoch.store(inner.epoch, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.inner.lock().pending
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Count an acknowledgement, unless a newer request superseded `epoch`
    fn acknowledge(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.epoch == epoch {
            inner.acknowledged += 1;
            inner.settle_if_complete();
        }
    }

    /// Register a new owner of private state
    pub fn listen(self: &Arc<Self>) -> ResetListener {
        let epoch = {
            let mut inner = self.inner.lock();
            inner.listeners += 1;
            inner.epoch
        };
        ResetListener {
            request: self.clone(),
            seen_epoch: epoch,
            acknowledged_epoch: epoch,
        }
    }
}

/// Per-subsystem view of a [`ResetRequest`]
#[derive(Debug)]
pub struct ResetListener {
    request: Arc<ResetRequest>,
    seen_epoch: u64,
    acknowledged_epoch: u64,
}

impl ResetListener {
    /// True once for every reset requested since the last poll.
    ///
    /// The caller discards its private state and then calls
    /// [`acknowledge`](Self::acknowledge).
    pub fn poll(&mut self) -> bool {
        let current = self.request.epoch();
        if current != self.seen_epoch {
            self.seen_epoch = current;
            true
        } else {
            false
        }
    }

    pub fn acknowledge(&mut self) {
        if self.acknowledged_epoch == self.seen_epoch {
            return;
        }
        self.acknowledged_epoch = self.seen_epoch;
        self.request.acknowledge(self.seen_epoch);
    }
}

impl Drop for ResetListener {
    fn drop(&mut self) {
        let mut inner = self.request.inner.lock();
        inner.listeners = inner.listeners.saturating_sub(1);
        inner.settle_if_complete();
    }
}

// ============================================================================
// Control state
// ============================================================================

/// Point-in-time copy of every control field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSnapshot {
    pub active: Option<Manipulation>,
    pub delay_ms: u32,
    pub max_delay_ms: u32,
    pub recording: bool,
    pub reset_video_pending: bool,
    pub reset_audio_pending: bool,
}

/// Process-wide control store.
///
/// Holds the single active manipulation, the delay parameters, the
/// session recording flag and the two reset requests.
#[derive(Debug)]
pub struct ControlState {
    active: AtomicU8,
    delay_ms: AtomicU32,
    max_delay_ms: u32,
    recording: AtomicBool,
    reset_video: Arc<ResetRequest>,
    reset_audio: Arc<ResetRequest>,
    generation: AtomicU64,
    presets: BTreeMap<String, u32>,
    settle: Duration,
}

impl ControlState {
    pub fn new(settings: ControlSettings) -> Self {
        let state = Self {
            active: AtomicU8::new(0),
            delay_ms: AtomicU32::new(0),
            max_delay_ms: settings.max_delay_ms,
            recording: AtomicBool::new(false),
            reset_video: Arc::new(ResetRequest::default()),
            reset_audio: Arc::new(ResetRequest::default()),
            generation: AtomicU64::new(0),
            presets: settings.delay_presets,
            settle: settings.reset_settle,
        };
        state.set_delay_ms(settings.default_delay_ms);
        state
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(ControlSettings::from(config))
    }

    fn touch(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn active(&self) -> Option<Manipulation> {
        Manipulation::from_code(self.active.load(Ordering::SeqCst))
    }

    pub fn is_active(&self, manipulation: Manipulation) -> bool {
        self.active() == Some(manipulation)
    }

    /// Make `manipulation` the only active one.
    ///
    /// Performs a full [`reset`](Self::reset) first, except when switching
    /// from loop recording to loop playback so the recorded loop survives.
    pub fn enable(&self, manipulation: Manipulation) {
        let hand_off = manipulation == Manipulation::LoopPlay
            && self.is_active(Manipulation::LoopRecord);
        if !hand_off {
            self.reset();
        }
        self.active.store(Manipulation::to_code(Some(manipulation)), Ordering::SeqCst);
        self.touch();
        log::info!("[Control] {} enabled", manipulation);
    }

    /// Clear the active manipulation and ask video and audio to discard
    /// their private state, then block for the settle period.
    pub fn reset(&self) {
        self.reset_video.request();
        self.reset_audio.request();
        self.active.store(0, Ordering::SeqCst);
        self.touch();
        log::debug!("[Control] reset requested");
        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }
    }

    pub fn delay_ms(&self) -> u32 {
        self.delay_ms.load(Ordering::SeqCst)
    }

    /// Store a new delay time. Values at or above the maximum fall back
    /// to 0. Returns the stored value.
    pub fn set_delay_ms(&self, delay_ms: u32) -> u32 {
        let max = self.max_delay_ms();
        let stored = if delay_ms < max { delay_ms } else { 0 };
        self.delay_ms.store(stored, Ordering::SeqCst);
        self.touch();
        stored
    }

    /// Apply a named delay preset (case-insensitive)
    pub fn apply_delay_preset(&self, name: &str) -> Result<u32> {
        let delay = self
            .presets
            .iter()
            .find(|(preset, _)| preset.eq_ignore_ascii_case(name.trim()))
            .map(|(_, delay)| *delay)
            .ok_or_else(|| ControlError::UnknownPreset(name.to_string()))?;
        Ok(self.set_delay_ms(delay))
    }

    pub fn delay_presets(&self) -> &BTreeMap<String, u32> {
        &self.presets
    }

    pub fn max_delay_ms(&self) -> u32 {
        self.max_delay_ms
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::SeqCst);
        self.touch();
    }

    pub fn video_reset(&self) -> &Arc<ResetRequest> {
        &self.reset_video
    }

    pub fn audio_reset(&self) -> &Arc<ResetRequest> {
        &self.reset_audio
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            active: self.active(),
            delay_ms: self.delay_ms(),
            max_delay_ms: self.max_delay_ms(),
            recording: self.is_recording(),
            reset_video_pending: self.reset_video.is_pending(),
            reset_audio_pending: self.reset_audio.is_pending(),
        }
    }

    /// Polled subscription: the watcher reports a snapshot whenever any
    /// field changed since its previous poll.
    pub fn watch(self: &Arc<Self>) -> ControlWatcher {
        ControlWatcher {
            state: self.clone(),
            seen: self.generation.load(Ordering::SeqCst),
        }
    }
}

/// Change detector over a shared [`ControlState`]
pub struct ControlWatcher {
    state: Arc<ControlState>,
    seen: u64,
}

impl ControlWatcher {
    pub fn changed(&mut self) -> Option<ControlSnapshot> {
        let current = self.state.generation.load(Ordering::SeqCst);
        if current == self.seen {
            return None;
        }
        self.seen = current;
        Some(self.state.snapshot())
    }
}
