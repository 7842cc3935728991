// Reusable rendezvous barrier gating workers from setup into their run loops

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Returned to every waiting party when the rendezvous is aborted
/// instead of completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rendezvous aborted before all parties arrived")]
pub struct BarrierAborted;

pub type Result<T> = std::result::Result<T, BarrierAborted>;

/// Result of a completed rendezvous
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousResult {
    leader: bool,
}

impl RendezvousResult {
    /// True for exactly one party per generation: the one whose arrival
    /// released the others
    pub fn is_leader(&self) -> bool {
        self.leader
    }
}

struct BarrierState {
    arrived: usize,
    generation: u64,
    /// Generation that was released by `abort` rather than by the last arrival
    aborted_generation: Option<u64>,
    /// Sticky until `reset`: later arrivals fail immediately
    poisoned: bool,
}

/// Counts N expected arrivals and releases all of them at once.
///
/// Each release starts a new generation so the barrier can be reused for
/// multi-stage synchronization. A party whose setup failed calls
/// [`Rendezvous::abort`] so the other parties are released with
/// [`BarrierAborted`] instead of waiting forever for an arrival that will
/// never come.
pub struct Rendezvous {
    parties: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl Rendezvous {
    pub fn new(parties: usize) -> Self {
        Self {
            parties: parties.max(1),
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                aborted_generation: None,
                poisoned: false,
            }),
            released: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Number of parties currently blocked in the active generation
    pub fn waiting(&self) -> usize {
        self.state.lock().arrived
    }

    /// Block until all parties have arrived
    pub fn wait(&self) -> Result<RendezvousResult> {
        self.wait_inner(None).map(|outcome| {
            outcome.unwrap_or(RendezvousResult { leader: false })
        })
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// Returns `Ok(None)` on timeout; the caller's arrival is withdrawn so
    /// the count stays consistent for the remaining parties.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<RendezvousResult>> {
        self.wait_inner(Some(Instant::now() + timeout))
    }

    fn wait_inner(&self, deadline: Option<Instant>) -> Result<Option<RendezvousResult>> {
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(BarrierAborted);
        }

        let generation = state.generation;
        state.arrived += 1;

        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            log::debug!("[Rendezvous] all {} parties arrived", self.parties);
            return Ok(Some(RendezvousResult { leader: true }));
        }

        while state.generation == generation {
            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut state, deadline).timed_out()
                        && state.generation == generation
                    {
                        state.arrived -= 1;
                        return Ok(None);
                    }
                }
                None => self.released.wait(&mut state),
            }
        }

        if state.aborted_generation == Some(generation) {
            Err(BarrierAborted)
        } else {
            Ok(Some(RendezvousResult { leader: false }))
        }
    }

    /// Release every waiting party with [`BarrierAborted`] and fail all
    /// later arrivals until [`reset`](Self::reset) is called.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        if state.poisoned {
            return;
        }
        log::warn!(
            "[Rendezvous] aborted with {}/{} parties arrived",
            state.arrived,
            self.parties
        );
        state.poisoned = true;
        state.aborted_generation = Some(state.generation);
        state.arrived = 0;
        state.generation = state.generation.wrapping_add(1);
        self.released.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().poisoned
    }

    /// Re-arm the barrier. Parties still waiting in the current generation
    /// are released with [`BarrierAborted`].
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.arrived > 0 {
            state.aborted_generation = Some(state.generation);
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
        }
        state.poisoned = false;
    }
}
