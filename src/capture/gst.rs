// GStreamer webcam source
//
// Pipeline: <platform camera src> → videoconvert → capsfilter(RGB) → appsink
//
// The appsink keeps only the newest two buffers so a slow consumer sees
// fresh frames instead of a growing backlog.

use std::sync::Once;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use super::{CaptureError, CaptureSource, Frame, Result};

static GSTREAMER_INIT: Once = Once::new();

/// Initialize GStreamer once per process
pub fn init() -> Result<()> {
    GSTREAMER_INIT.call_once(|| match gst::init() {
        Ok(()) => {
            let (major, minor, micro, _) = gst::version();
            log::info!("GStreamer {}.{}.{} initialized", major, minor, micro);
        }
        Err(e) => log::error!("Failed to initialize GStreamer: {}", e),
    });
    gst::init().map_err(|e| CaptureError::Gst(e.to_string()))
}

/// Platform camera element for a device id (index or device path)
fn camera_element(id: &str) -> Result<gst::Element> {
    let index: Option<i32> = id.parse().ok();

    #[cfg(target_os = "windows")]
    let builder = gst::ElementFactory::make("mfvideosrc").property("device-index", index.unwrap_or(0));

    #[cfg(target_os = "macos")]
    let builder = gst::ElementFactory::make("avfvideosrc").property("device-index", index.unwrap_or(0));

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    let builder = {
        let device = match index {
            Some(index) => format!("/dev/video{}", index),
            None => id.to_string(),
        };
        gst::ElementFactory::make("v4l2src").property("device", device)
    };

    builder
        .build()
        .map_err(|e| CaptureError::Gst(format!("Failed to create camera source: {}", e)))
}

/// Live camera capture through GStreamer
pub struct GstCaptureSource {
    width: u32,
    height: u32,
    fps: u32,
    timeout: gst::ClockTime,
    pipeline: Option<gst::Pipeline>,
    appsink: Option<gst_app::AppSink>,
}

impl GstCaptureSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            timeout: gst::ClockTime::from_seconds(2),
            pipeline: None,
            appsink: None,
        }
    }

    fn build(&self, id: &str) -> Result<(gst::Pipeline, gst_app::AppSink)> {
        init()?;
        let pipeline = gst::Pipeline::new();

        let source = camera_element(id)?;
        let videoconvert = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(|e| CaptureError::Gst(format!("Failed to create videoconvert: {}", e)))?;

        let caps = gst_video::VideoCapsBuilder::new()
            .format(gst_video::VideoFormat::Rgb)
            .width(self.width as i32)
            .height(self.height as i32)
            .framerate(gst::Fraction::new(self.fps as i32, 1))
            .build();
        let appsink = gst_app::AppSink::builder()
            .name("frames")
            .caps(&caps)
            .max_buffers(2)
            .drop(true)
            .sync(false)
            .build();

        pipeline
            .add_many([&source, &videoconvert, appsink.upcast_ref()])
            .map_err(|e| CaptureError::Gst(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many([&source, &videoconvert, appsink.upcast_ref()]).map_err(|e| {
            CaptureError::Gst(format!("Failed to link camera → videoconvert → appsink: {}", e))
        })?;

        Ok((pipeline, appsink))
    }
}

impl CaptureSource for GstCaptureSource {
    fn open(&mut self, id: &str) -> Result<()> {
        let (pipeline, appsink) = self.build(id).map_err(|e| CaptureError::Open {
            id: id.to_string(),
            reason: e.to_string(),
        })?;

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            pipeline.set_state(gst::State::Null).ok();
            return Err(CaptureError::Open {
                id: id.to_string(),
                reason: format!("Failed to start pipeline: {:?}", e),
            });
        }

        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        Ok(())
    }

    fn read(&mut self) -> Result<Frame> {
        let appsink = self
            .appsink
            .as_ref()
            .ok_or_else(|| CaptureError::Read("camera is not open".into()))?;

        let sample = appsink
            .try_pull_sample(self.timeout)
            .ok_or_else(|| CaptureError::Read("no frame from camera".into()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| CaptureError::Read("sample without caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| CaptureError::Gst(format!("Unexpected caps: {}", e)))?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureError::Read("sample without buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| CaptureError::Gst(format!("Failed to map buffer: {}", e)))?;

        // Rows may be padded; copy them into a packed buffer
        let width = info.width();
        let height = info.height();
        let row = width as usize * 3;
        let stride = info.stride()[0] as usize;
        let mut data = Vec::with_capacity(row * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            let line = map
                .get(start..start + row)
                .ok_or_else(|| CaptureError::Read("short frame buffer".into()))?;
            data.extend_from_slice(line);
        }

        Frame::new(width, height, 3, data)
    }

    fn close(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.set_state(gst::State::Null).ok();
        }
        self.appsink = None;
    }
}

impl Drop for GstCaptureSource {
    fn drop(&mut self) {
        self.close();
    }
}
