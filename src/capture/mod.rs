// Capture, display and frame-effect contracts plus the workers built on them

pub mod display;
#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod pipeline;

pub use display::{DelayLine, DisplayConsumer, DisplayTiming, FrameSelector, LoopBuffer};
pub use pipeline::CapturePipeline;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Region;
use crate::control::Manipulation;

/// Error type for capture and display operations
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Failed to open capture source {id}: {reason}")]
    Open { id: String, reason: String },

    #[error("Capture read failed: {0}")]
    Read(String),

    #[error("Frame buffer holds {actual} bytes, {expected} expected")]
    FrameSize { expected: usize, actual: usize },

    #[error("Display error: {0}")]
    Display(String),

    #[cfg(feature = "gstreamer")]
    #[error("GStreamer error: {0}")]
    Gst(String),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

// ============================================================================
// Frames
// ============================================================================

/// An immutable packed pixel buffer.
///
/// Cloning shares the pixels, so the same frame can be pushed into several
/// queues. Consumers that transform a frame build a new one from a private
/// copy of the pixels.
#[derive(Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    channels: u8,
    data: Arc<[u8]>,
    /// Wall clock time when the frame was captured
    captured_at: Instant,
}

impl Frame {
    pub fn new(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(CaptureError::FrameSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data: data.into(),
            captured_at: Instant::now(),
        })
    }

    /// All-black frame
    pub fn blank(width: u32, height: u32, channels: u8) -> Self {
        let len = width as usize * height as usize * channels as usize;
        Self {
            width,
            height,
            channels,
            data: vec![0u8; len].into(),
            captured_at: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    fn row_bytes(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    /// Build a sibling frame from transformed pixels, keeping the capture time
    fn derive(&self, data: Vec<u8>) -> Self {
        Self {
            width: self.width,
            height: self.height,
            channels: self.channels,
            data: data.into(),
            captured_at: self.captured_at,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Which of a camera's two display windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewKind {
    /// Unmodified live view watched by the operator
    Operator,
    /// View shown to the performer, subject to manipulations
    Performer,
}

impl ViewKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ViewKind::Operator => "operator",
            ViewKind::Performer => "performer",
        }
    }

    /// Window title for camera index `camera` (0-based)
    pub fn window_title(self, camera: usize) -> String {
        match self {
            ViewKind::Operator => format!("Cam {} Rec", camera + 1),
            ViewKind::Performer => format!("Cam {} View", camera + 1),
        }
    }
}

// ============================================================================
// Collaborator contracts
// ============================================================================

/// A camera or other frame source.
///
/// The source value is the device handle: `open` binds it to a device,
/// `read` produces the next frame and `close` releases the device.
pub trait CaptureSource: Send {
    fn open(&mut self, id: &str) -> Result<()>;
    fn read(&mut self) -> Result<Frame>;
    fn close(&mut self);
}

/// A window system able to show frames and report key presses
pub trait DisplaySink: Send {
    fn show(&mut self, window: &str, frame: &Frame) -> Result<()>;
    fn poll_input(&mut self) -> Option<char>;
    fn destroy(&mut self, window: &str);
}

/// Per-frame pixel transform for the active manipulation.
///
/// Returns `None` when the manipulation does not change pixels.
pub trait FrameEffect: Send + Sync {
    fn apply(&self, manipulation: Manipulation, frame: &Frame) -> Option<Frame>;
}

/// Mirror and region blanking on packed pixel buffers
#[derive(Debug, Clone)]
pub struct BasicEffects {
    face: Region,
}

impl BasicEffects {
    pub fn new(face: Region) -> Self {
        Self { face }
    }

    fn mirror(frame: &Frame) -> Frame {
        let channels = frame.channels as usize;
        let row_bytes = frame.row_bytes();
        if row_bytes == 0 {
            return frame.clone();
        }
        let mut out = Vec::with_capacity(frame.data.len());
        for row in frame.data.chunks_exact(row_bytes) {
            for pixel in row.chunks_exact(channels).rev() {
                out.extend_from_slice(pixel);
            }
        }
        frame.derive(out)
    }

    fn blank(frame: &Frame, region: Region) -> Frame {
        let (x0, x1) = span(region.x, region.width, frame.width);
        let (y0, y1) = span(region.y, region.height, frame.height);
        let channels = frame.channels as usize;
        let row_bytes = frame.row_bytes();

        let mut out = frame.data.to_vec();
        for y in y0..y1 {
            let start = y * row_bytes + x0 * channels;
            let end = y * row_bytes + x1 * channels;
            out[start..end].fill(0);
        }
        frame.derive(out)
    }

    /// Upper band of the face region
    fn eye_band(&self) -> Region {
        Region {
            x: self.face.x,
            y: self.face.y + self.face.height * 0.25,
            width: self.face.width,
            height: self.face.height * 0.25,
        }
    }
}

/// Clamp a relative (offset, length) pair to pixel bounds
fn span(offset: f32, length: f32, size: u32) -> (usize, usize) {
    let size_f = size as f32;
    let start = (offset.clamp(0.0, 1.0) * size_f).round() as usize;
    let end = ((offset + length).clamp(0.0, 1.0) * size_f).round() as usize;
    (start.min(size as usize), end.min(size as usize).max(start.min(size as usize)))
}

impl FrameEffect for BasicEffects {
    fn apply(&self, manipulation: Manipulation, frame: &Frame) -> Option<Frame> {
        match manipulation {
            Manipulation::Flip => Some(Self::mirror(frame)),
            Manipulation::BlankFace => Some(Self::blank(frame, self.face)),
            Manipulation::BlankEyes => Some(Self::blank(frame, self.eye_band())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(width: u32, height: u32) -> Frame {
        let data = (0..width * height).map(|i| i as u8).collect();
        Frame::new(width, height, 1, data).unwrap()
    }

    #[test]
    fn rejects_mismatched_buffer() {
        let err = Frame::new(4, 4, 3, vec![0; 10]).unwrap_err();
        assert!(matches!(err, CaptureError::FrameSize { expected: 48, actual: 10 }));
    }

    #[test]
    fn mirror_reverses_each_row() {
        let frame = ramp(3, 2);
        let flipped = BasicEffects::new(Region::default())
            .apply(Manipulation::Flip, &frame)
            .unwrap();
        assert_eq!(flipped.pixels(), &[2, 1, 0, 5, 4, 3]);
        // original untouched
        assert_eq!(frame.pixels(), &[0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn blank_face_zeroes_only_the_region() {
        let frame = Frame::new(4, 4, 1, vec![9; 16]).unwrap();
        let effects = BasicEffects::new(Region { x: 0.5, y: 0.5, width: 0.5, height: 0.5 });
        let blanked = effects.apply(Manipulation::BlankFace, &frame).unwrap();
        let zeros = blanked.pixels().iter().filter(|p| **p == 0).count();
        assert_eq!(zeros, 4);
        assert_eq!(blanked.pixels()[15], 0);
        assert_eq!(blanked.pixels()[0], 9);
    }

    #[test]
    fn timing_manipulations_leave_pixels_alone() {
        let effects = BasicEffects::new(Region::default());
        assert!(effects.apply(Manipulation::Delay, &ramp(2, 2)).is_none());
        assert!(effects.apply(Manipulation::LoopPlay, &ramp(2, 2)).is_none());
    }

    #[test]
    fn window_titles_are_one_based() {
        assert_eq!(ViewKind::Operator.window_title(0), "Cam 1 Rec");
        assert_eq!(ViewKind::Performer.window_title(1), "Cam 2 View");
    }
}
