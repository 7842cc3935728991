// Synchronization primitives shared by every worker loop

pub mod barrier;
pub mod frame_queue;

pub use barrier::{BarrierAborted, Rendezvous, RendezvousResult};
pub use frame_queue::{frame_queue, FrameConsumer, FrameProducer, PutOutcome, QueueError};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag checked at the top of every run-loop iteration.
///
/// Cloning is cheap; all clones observe the same flag. Once raised the
/// flag stays raised for the lifetime of the session.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every loop holding a clone of this signal to wind down
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let signal = StopSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_raised());
        signal.raise();
        assert!(observer.is_raised());
    }
}
