// Delay schedules: a worker stepping the delay time through a sequence
//
// Moving delays play the sequence once; variable delays cycle through
// pre-sampled values until the delay is switched off. Either ends as soon
// as a reset (or another manipulation) supersedes it.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{ControlState, Manipulation};
use crate::sync::StopSignal;

/// Granularity of cancellation checks while waiting out a step
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Delay times applied one after another, `resample` apart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelaySchedule {
    pub steps: Vec<u32>,
    pub resample: Duration,
    /// Start over after the last step instead of finishing
    pub repeat: bool,
}

impl DelaySchedule {
    /// Play `steps` once
    pub fn moving(steps: Vec<u32>, resample: Duration) -> Self {
        Self { steps, resample, repeat: false }
    }

    /// Cycle through `steps` until stopped
    pub fn variable(steps: Vec<u32>, resample: Duration) -> Self {
        Self { steps, resample, repeat: true }
    }
}

/// Why a schedule stopped driving the delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleEnd {
    /// Every step was applied
    Finished,
    /// A reset or another manipulation took over
    Superseded,
    /// Cancelled or the session is shutting down
    Stopped,
}

/// Handle to a running schedule
pub struct DelayDriver {
    cancel: StopSignal,
    handle: Option<JoinHandle<ScheduleEnd>>,
}

impl DelayDriver {
    /// Enable the delay and start stepping through `schedule`
    pub fn spawn(
        control: Arc<ControlState>,
        schedule: DelaySchedule,
        session_stop: StopSignal,
    ) -> std::io::Result<Self> {
        control.enable(Manipulation::Delay);
        let epoch = control.video_reset().epoch();
        let cancel = StopSignal::new();
        let worker = ScheduleWorker {
            control,
            schedule,
            epoch,
            cancel: cancel.clone(),
            session_stop,
        };
        let handle = std::thread::Builder::new()
            .name("lockstep-delay-schedule".into())
            .spawn(move || worker.run())?;
        Ok(Self { cancel, handle: Some(handle) })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the schedule to end on its own
    pub fn join(mut self) -> ScheduleEnd {
        self.wait()
    }

    /// Stop stepping and wait for the worker. The delay stays enabled at
    /// its current value.
    pub fn cancel(mut self) -> ScheduleEnd {
        self.cancel.raise();
        self.wait()
    }

    fn wait(&mut self) -> ScheduleEnd {
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(end)) => end,
            Some(Err(_)) => {
                log::error!("[Control] delay schedule panicked");
                ScheduleEnd::Stopped
            }
            None => ScheduleEnd::Stopped,
        }
    }
}

impl Drop for DelayDriver {
    fn drop(&mut self) {
        self.cancel.raise();
        self.wait();
    }
}

struct ScheduleWorker {
    control: Arc<ControlState>,
    schedule: DelaySchedule,
    epoch: u64,
    cancel: StopSignal,
    session_stop: StopSignal,
}

impl ScheduleWorker {
    fn run(self) -> ScheduleEnd {
        let started = Instant::now();
        let mut applied = 0usize;
        if self.schedule.steps.is_empty() {
            return self.finish(ScheduleEnd::Finished, applied, started);
        }

        loop {
            for &step in &self.schedule.steps {
                if let Some(end) = self.interrupted() {
                    return self.finish(end, applied, started);
                }
                self.control.set_delay_ms(step);
                applied += 1;
                if let Some(end) = self.wait_step() {
                    return self.finish(end, applied, started);
                }
            }
            if !self.schedule.repeat {
                return self.finish(ScheduleEnd::Finished, applied, started);
            }
        }
    }

    fn finish(&self, end: ScheduleEnd, applied: usize, started: Instant) -> ScheduleEnd {
        log::info!(
            "[Control] delay schedule {:?} after {} steps in {:.2}s",
            end,
            applied,
            started.elapsed().as_secs_f64()
        );
        // A sweep that ran down to no delay switches the delay off
        if end == ScheduleEnd::Finished && self.control.delay_ms() <= 1 {
            self.control.reset();
        }
        end
    }

    fn interrupted(&self) -> Option<ScheduleEnd> {
        if self.cancel.is_raised() || self.session_stop.is_raised() {
            return Some(ScheduleEnd::Stopped);
        }
        if self.control.video_reset().epoch() != self.epoch
            || !self.control.is_active(Manipulation::Delay)
        {
            return Some(ScheduleEnd::Superseded);
        }
        None
    }

    fn wait_step(&self) -> Option<ScheduleEnd> {
        let deadline = Instant::now() + self.schedule.resample;
        loop {
            if let Some(end) = self.interrupted() {
                return Some(end);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(WAIT_SLICE.min(deadline - now));
        }
    }
}
