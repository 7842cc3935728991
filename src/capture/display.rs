// Display consumers: operator (live) and performer (manipulated) views

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{DisplaySink, Frame, FrameEffect, ViewKind};
use crate::control::{action_for_key, Action, ControlState, Manipulation, ResetListener};
use crate::sync::{FrameConsumer, QueueError, Rendezvous, StopSignal};

/// How long a `get` may block before the stop flag is re-checked
const GET_SLICE: Duration = Duration::from_millis(100);

// ============================================================================
// Retained-frame buffers
// ============================================================================

/// Rolling history of the most recent live frames
pub struct DelayLine {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl DelayLine {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, frame: Frame) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Frame captured `frames_ago` pushes before the newest one.
    /// Falls back to the oldest retained frame while history is short.
    pub fn delayed(&self, frames_ago: usize) -> Option<&Frame> {
        let newest = self.frames.len().checked_sub(1)?;
        self.frames.get(newest - frames_ago.min(newest))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Frames recorded for loop playback, replayed cyclically
pub struct LoopBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
    cursor: usize,
}

impl LoopBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity: capacity.max(1),
            cursor: 0,
        }
    }

    /// Keep the most recent `capacity` frames
    pub fn record(&mut self, frame: Frame) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.frames.is_empty() {
            return None;
        }
        let index = self.cursor % self.frames.len();
        self.cursor = index + 1;
        self.frames.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.cursor = 0;
    }
}

/// Private per-view state deciding which frame the performer sees
pub struct FrameSelector {
    fps: u32,
    history: DelayLine,
    loop_buffer: LoopBuffer,
    paused: Option<Frame>,
}

impl FrameSelector {
    pub fn new(fps: u32, max_delay_ms: u32, loop_max_secs: u32) -> Self {
        let fps = fps.max(1);
        Self {
            fps,
            history: DelayLine::new(frames_for(max_delay_ms, fps) + 1),
            loop_buffer: LoopBuffer::new(loop_frames(loop_max_secs, fps)),
            paused: None,
        }
    }

    /// Drop per-manipulation state (loop recording, paused frame).
    /// Idempotent. The delay history is not manipulation state and stays.
    pub fn discard(&mut self) {
        self.loop_buffer.clear();
        self.paused = None;
    }

    pub fn select(&mut self, live: Frame, active: Option<Manipulation>, delay_ms: u32) -> Frame {
        self.history.push(live.clone());
        match active {
            Some(Manipulation::Delay) => self
                .history
                .delayed(frames_for(delay_ms, self.fps))
                .cloned()
                .unwrap_or(live),
            Some(Manipulation::LoopRecord) => {
                self.loop_buffer.record(live.clone());
                live
            }
            Some(Manipulation::LoopPlay) => self.loop_buffer.next_frame().unwrap_or(live),
            Some(Manipulation::Pause(target)) if target.affects_video() => {
                self.paused.get_or_insert(live).clone()
            }
            _ => live,
        }
    }

    pub fn has_private_state(&self) -> bool {
        !self.loop_buffer.is_empty() || self.paused.is_some()
    }
}

/// Number of frames spanning `ms` milliseconds
fn frames_for(ms: u32, fps: u32) -> usize {
    (ms as u64 * fps as u64 / 1000) as usize
}

fn loop_frames(secs: u32, fps: u32) -> usize {
    usize::try_from(secs as u64 * fps as u64).unwrap_or(usize::MAX)
}

// ============================================================================
// Display consumer
// ============================================================================

/// Drains one frame queue and renders it into one window.
///
/// The performer view applies the active manipulation and owns a
/// [`FrameSelector`]; it registers for video resets and discards its
/// private state whenever one is requested. Both views handle the
/// operator's key bindings.
pub struct DisplayConsumer {
    camera: usize,
    view: ViewKind,
    window: String,
    queue: FrameConsumer<Frame>,
    sink: Box<dyn DisplaySink>,
    effects: Arc<dyn FrameEffect>,
    control: Arc<ControlState>,
    barrier: Arc<Rendezvous>,
    stop: StopSignal,
    grace: Duration,
    selector: Option<FrameSelector>,
    reset: Option<ResetListener>,
}

/// Timing parameters of a display consumer
#[derive(Debug, Clone, Copy)]
pub struct DisplayTiming {
    pub fps: u32,
    pub loop_max_secs: u32,
    pub grace: Duration,
}

impl DisplayConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera: usize,
        view: ViewKind,
        queue: FrameConsumer<Frame>,
        sink: Box<dyn DisplaySink>,
        effects: Arc<dyn FrameEffect>,
        control: Arc<ControlState>,
        barrier: Arc<Rendezvous>,
        stop: StopSignal,
        timing: DisplayTiming,
    ) -> Self {
        let (selector, reset) = match view {
            ViewKind::Operator => (None, None),
            ViewKind::Performer => (
                Some(FrameSelector::new(
                    timing.fps,
                    control.max_delay_ms(),
                    timing.loop_max_secs,
                )),
                Some(control.video_reset().listen()),
            ),
        };
        Self {
            camera,
            view,
            window: view.window_title(camera),
            queue,
            sink,
            effects,
            control,
            barrier,
            stop,
            grace: timing.grace,
            selector,
            reset,
        }
    }

    pub fn window(&self) -> &str {
        &self.window
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("lockstep-display-{}-{}", self.camera, self.view.as_str()))
            .spawn(move || self.run())
    }

    fn run(mut self) {
        // The capture pipeline primes the queue before the rendezvous; if it
        // failed the queue is closed instead and the rendezvous aborted.
        match self.queue.get() {
            Ok(primer) => self.render(&primer),
            Err(QueueError::Disconnected) => {
                log::debug!("[{}] no primer frame", self.window);
            }
        }

        if self.barrier.wait().is_err() {
            self.sink.destroy(&self.window);
            return;
        }
        log::info!("[{}] running", self.window);

        while !self.stop.is_raised() {
            let frame = match self.queue.get_timeout(GET_SLICE) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(QueueError::Disconnected) => {
                    log::warn!("[{}] capture stopped delivering frames", self.window);
                    break;
                }
            };

            self.observe_reset();

            let shown = match self.selector.as_mut() {
                Some(selector) => {
                    let active = self.control.active();
                    let chosen = selector.select(frame, active, self.control.delay_ms());
                    match active {
                        Some(m) => self.effects.apply(m, &chosen).unwrap_or(chosen),
                        None => chosen,
                    }
                }
                None => frame,
            };
            self.render(&shown);

            if let Some(key) = self.sink.poll_input() {
                self.handle_key(key);
            }
        }

        // Let an encoder capturing this window quiesce first
        std::thread::sleep(self.grace);
        self.sink.destroy(&self.window);
        log::info!("[{}] closed", self.window);
    }

    fn observe_reset(&mut self) {
        if let (Some(listener), Some(selector)) = (self.reset.as_mut(), self.selector.as_mut()) {
            if listener.poll() {
                if selector.has_private_state() {
                    log::debug!("[{}] discarding manipulation state", self.window);
                }
                selector.discard();
                listener.acknowledge();
            }
        }
    }

    fn render(&mut self, frame: &Frame) {
        if let Err(e) = self.sink.show(&self.window, frame) {
            log::warn!("[{}] {}", self.window, e);
        }
    }

    fn handle_key(&mut self, key: char) {
        match action_for_key(key) {
            Some(Action::Enable(manipulation)) => self.control.enable(manipulation),
            Some(Action::Reset) => self.control.reset(),
            Some(Action::Quit) => {
                log::info!("[{}] quit requested", self.window);
                self.stop.raise();
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{BasicEffects, Result};
    use crate::config::Region;
    use crate::control::{ControlSettings, PauseTarget};
    use crate::sync::frame_queue;
    use parking_lot::Mutex;

    fn frame(value: u8) -> Frame {
        Frame::new(1, 1, 1, vec![value]).unwrap()
    }

    fn value(frame: &Frame) -> u8 {
        frame.pixels()[0]
    }

    #[test]
    fn delay_line_reaches_back_in_time() {
        let mut line = DelayLine::new(4);
        assert!(line.delayed(0).is_none());
        for v in 0..6 {
            line.push(frame(v));
        }
        assert_eq!(line.len(), 4);
        assert_eq!(value(line.delayed(0).unwrap()), 5);
        assert_eq!(value(line.delayed(2).unwrap()), 3);
        // clamps to the oldest retained frame
        assert_eq!(value(line.delayed(10).unwrap()), 2);
    }

    #[test]
    fn loop_buffer_cycles() {
        let mut buffer = LoopBuffer::new(3);
        assert!(buffer.next_frame().is_none());
        for v in 0..4 {
            buffer.record(frame(v));
        }
        let played: Vec<u8> = (0..4).map(|_| value(&buffer.next_frame().unwrap())).collect();
        assert_eq!(played, vec![1, 2, 3, 1]);
    }

    #[test]
    fn selector_delays_by_frame_count() {
        // 10 fps, 300 ms => 3 frames back
        let mut selector = FrameSelector::new(10, 1000, 2);
        let mut shown = Vec::new();
        for v in 0..6 {
            shown.push(value(&selector.select(frame(v), Some(Manipulation::Delay), 300)));
        }
        assert_eq!(shown, vec![0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn selector_pause_holds_first_frame_until_discard() {
        let mut selector = FrameSelector::new(30, 1000, 1);
        let pause = Some(Manipulation::Pause(PauseTarget::Video));
        assert_eq!(value(&selector.select(frame(7), pause, 0)), 7);
        assert_eq!(value(&selector.select(frame(8), pause, 0)), 7);

        selector.discard();
        selector.discard();
        assert_eq!(value(&selector.select(frame(9), pause, 0)), 9);

        // audio-only pause shows live video
        let audio = Some(Manipulation::Pause(PauseTarget::Audio));
        assert_eq!(value(&selector.select(frame(10), audio, 0)), 10);
    }

    #[test]
    fn selector_replays_recorded_loop() {
        let mut selector = FrameSelector::new(30, 1000, 1);
        for v in 1..=3 {
            selector.select(frame(v), Some(Manipulation::LoopRecord), 0);
        }
        assert!(selector.has_private_state());
        let played: Vec<u8> = (0..4)
            .map(|i| value(&selector.select(frame(100 + i), Some(Manipulation::LoopPlay), 0)))
            .collect();
        assert_eq!(played, vec![1, 2, 3, 1]);

        selector.discard();
        assert!(!selector.has_private_state());
        assert_eq!(value(&selector.select(frame(50), Some(Manipulation::LoopPlay), 0)), 50);
    }

    #[test]
    fn long_loop_limit_does_not_overflow() {
        let selector = FrameSelector::new(240, 1000, u32::MAX);
        assert_eq!(selector.loop_buffer.capacity, u32::MAX as usize * 240);
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        shown: Arc<Mutex<Vec<(String, u8)>>>,
        keys: Arc<Mutex<Vec<char>>>,
        destroyed: Arc<Mutex<Vec<String>>>,
    }

    impl DisplaySink for RecordingSink {
        fn show(&mut self, window: &str, frame: &Frame) -> Result<()> {
            self.shown.lock().push((window.to_string(), frame.pixels()[0]));
            Ok(())
        }

        fn poll_input(&mut self) -> Option<char> {
            self.keys.lock().pop()
        }

        fn destroy(&mut self, window: &str) {
            self.destroyed.lock().push(window.to_string());
        }
    }

    #[test]
    fn performer_view_follows_control_and_quit_key() {
        let control = Arc::new(ControlState::new(ControlSettings {
            reset_settle: Duration::ZERO,
            ..ControlSettings::default()
        }));
        let barrier = Arc::new(Rendezvous::new(2));
        let stop = StopSignal::new();
        let (tx, rx) = frame_queue(8);
        let sink = RecordingSink::default();

        let consumer = DisplayConsumer::new(
            0,
            ViewKind::Performer,
            rx,
            Box::new(sink.clone()),
            Arc::new(BasicEffects::new(Region::default())),
            control.clone(),
            barrier.clone(),
            stop.clone(),
            DisplayTiming { fps: 30, loop_max_secs: 1, grace: Duration::ZERO },
        );
        assert_eq!(consumer.window(), "Cam 1 View");
        let handle = consumer.spawn().unwrap();

        tx.put(frame(1)).unwrap();
        barrier.wait().unwrap();

        control.enable(Manipulation::Pause(PauseTarget::Video));
        tx.put(frame(2)).unwrap();
        tx.put(frame(3)).unwrap();
        while sink.shown.lock().len() < 3 {
            std::thread::sleep(Duration::from_millis(5));
        }

        control.reset();
        tx.put(frame(4)).unwrap();
        while sink.shown.lock().len() < 4 {
            std::thread::sleep(Duration::from_millis(5));
        }
        sink.keys.lock().push('q');
        tx.put(frame(5)).unwrap();
        handle.join().unwrap();

        assert!(stop.is_raised());
        let shown: Vec<u8> = sink.shown.lock().iter().map(|(_, v)| *v).collect();
        assert_eq!(&shown[..4], &[1, 2, 2, 4]);
        assert_eq!(*sink.destroyed.lock(), vec!["Cam 1 View".to_string()]);
        assert!(!control.video_reset().is_pending());
    }
}
