// Capture worker: one per camera, fans frames out to the display queues

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{CaptureSource, Frame};
use crate::sync::{FrameProducer, PutOutcome, Rendezvous, StopSignal};

/// How long a single `put` may block before the stop flag is re-checked
const PUT_SLICE: Duration = Duration::from_millis(50);

/// Pause between retries after a failed read
const READ_RETRY: Duration = Duration::from_millis(10);

/// Owns a capture source and pushes every frame into each output queue.
///
/// Setup opens the device and primes each queue with the first frame, so
/// consumers can show something before the rendezvous. If setup fails the
/// rendezvous is aborted and the worker exits without entering its loop.
pub struct CapturePipeline {
    camera: usize,
    source_id: String,
    source: Box<dyn CaptureSource>,
    outputs: Vec<FrameProducer<Frame>>,
    barrier: Arc<Rendezvous>,
    stop: StopSignal,
}

impl CapturePipeline {
    pub fn new(
        camera: usize,
        source_id: impl Into<String>,
        source: Box<dyn CaptureSource>,
        outputs: Vec<FrameProducer<Frame>>,
        barrier: Arc<Rendezvous>,
        stop: StopSignal,
    ) -> Self {
        Self {
            camera,
            source_id: source_id.into(),
            source,
            outputs,
            barrier,
            stop,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("lockstep-capture-{}", self.camera))
            .spawn(move || self.run())
    }

    fn run(mut self) {
        let first = match self.setup() {
            Some(frame) => frame,
            None => {
                self.barrier.abort();
                return;
            }
        };

        // Fresh queues have room for the primer
        let camera = self.camera;
        self.outputs.retain(|output| match output.put(first.clone()) {
            Ok(()) => true,
            Err(_) => {
                log::debug!("[Capture {}] consumer gone before start", camera);
                false
            }
        });

        if self.barrier.wait().is_err() {
            log::info!("[Capture {}] session aborted before start", self.camera);
            self.source.close();
            return;
        }
        log::info!("[Capture {}] running", self.camera);

        let mut frames: u64 = 0;
        let mut failures: u64 = 0;
        while !self.stop.is_raised() {
            match self.source.read() {
                Ok(frame) => {
                    failures = 0;
                    frames += 1;
                    self.fan_out(frame);
                    if self.outputs.is_empty() {
                        log::warn!("[Capture {}] every consumer is gone", self.camera);
                        break;
                    }
                }
                Err(e) => {
                    if failures % 100 == 0 {
                        log::warn!("[Capture {}] read failed: {}", self.camera, e);
                    }
                    failures += 1;
                    std::thread::sleep(READ_RETRY);
                }
            }
        }

        self.source.close();
        log::info!("[Capture {}] stopped after {} frames", self.camera, frames);
    }

    /// Open the device and grab the frame used to prime the queues
    fn setup(&mut self) -> Option<Frame> {
        if let Err(e) = self.source.open(&self.source_id) {
            log::error!("[Capture {}] {}", self.camera, e);
            return None;
        }
        match self.source.read() {
            Ok(frame) => {
                log::debug!(
                    "[Capture {}] opened {} ({}x{})",
                    self.camera,
                    self.source_id,
                    frame.width(),
                    frame.height()
                );
                Some(frame)
            }
            Err(e) => {
                log::error!(
                    "[Capture {}] no frame from {}: {}",
                    self.camera,
                    self.source_id,
                    e
                );
                self.source.close();
                None
            }
        }
    }

    /// Push `frame` into every live queue, blocking while a queue is full.
    /// Queues whose consumer has exited are dropped.
    fn fan_out(&mut self, frame: Frame) {
        let stop = &self.stop;
        self.outputs.retain(|output| {
            let mut pending = frame.clone();
            loop {
                match output.put_timeout(pending, PUT_SLICE) {
                    Ok(PutOutcome::Delivered) => return true,
                    Ok(PutOutcome::TimedOut(item)) => {
                        if stop.is_raised() {
                            return true;
                        }
                        pending = item;
                    }
                    Err(_) => return false,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureError, Result};
    use crate::sync::frame_queue;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct CountingSource {
        next: u8,
        fail_open: bool,
        closed: Arc<AtomicBool>,
    }

    impl CaptureSource for CountingSource {
        fn open(&mut self, id: &str) -> Result<()> {
            if self.fail_open {
                return Err(CaptureError::Open {
                    id: id.to_string(),
                    reason: "unplugged".into(),
                });
            }
            Ok(())
        }

        fn read(&mut self) -> Result<Frame> {
            let value = self.next;
            self.next = self.next.wrapping_add(1);
            std::thread::sleep(Duration::from_millis(2));
            Frame::new(1, 1, 1, vec![value])
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn primes_queues_then_streams_in_order() {
        let barrier = Arc::new(Rendezvous::new(2));
        let stop = StopSignal::new();
        let closed = Arc::new(AtomicBool::new(false));
        let (op_tx, op_rx) = frame_queue(4);
        let (pf_tx, pf_rx) = frame_queue(4);

        let source = CountingSource { next: 0, fail_open: false, closed: closed.clone() };
        let handle = CapturePipeline::new(0, "cam0", Box::new(source), vec![op_tx, pf_tx], barrier.clone(), stop.clone())
            .spawn()
            .unwrap();

        // Primer is available before the rendezvous completes
        let primer = op_rx.get().unwrap();
        assert_eq!(primer.pixels(), &[0]);
        assert_eq!(pf_rx.get().unwrap().pixels(), &[0]);

        barrier.wait().unwrap();
        let values: Vec<u8> = (0..5).map(|_| op_rx.get().unwrap().pixels()[0]).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);

        stop.raise();
        drop(op_rx);
        drop(pf_rx);
        handle.join().unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn consumer_gone_before_start_is_dropped_from_fan_out() {
        let barrier = Arc::new(Rendezvous::new(2));
        let stop = StopSignal::new();
        let (op_tx, op_rx) = frame_queue(4);
        let (pf_tx, pf_rx) = frame_queue(4);
        drop(pf_rx);

        let source = CountingSource {
            next: 0,
            fail_open: false,
            closed: Arc::new(AtomicBool::new(false)),
        };
        let handle = CapturePipeline::new(2, "cam2", Box::new(source), vec![op_tx, pf_tx], barrier.clone(), stop.clone())
            .spawn()
            .unwrap();

        assert_eq!(op_rx.get().unwrap().pixels(), &[0]);
        barrier.wait().unwrap();
        let values: Vec<u8> = (0..3).map(|_| op_rx.get().unwrap().pixels()[0]).collect();
        assert_eq!(values, vec![1, 2, 3]);

        stop.raise();
        drop(op_rx);
        handle.join().unwrap();
    }

    #[test]
    fn open_failure_aborts_rendezvous() {
        let barrier = Arc::new(Rendezvous::new(2));
        let (tx, rx) = frame_queue(2);
        let source = CountingSource {
            next: 0,
            fail_open: true,
            closed: Arc::new(AtomicBool::new(false)),
        };
        let handle = CapturePipeline::new(1, "cam1", Box::new(source), vec![tx], barrier.clone(), StopSignal::new())
            .spawn()
            .unwrap();

        assert!(barrier.wait().is_err());
        handle.join().unwrap();
        assert!(rx.get().is_err());
    }
}
