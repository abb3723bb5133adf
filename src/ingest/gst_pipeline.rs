//! GStreamer-backed transport for network cameras.
//!
//! The pipeline comes from `TransportOptions::gst_launch_line`:
//! - RTSP (H264 hint): `rtspsrc ! decodebin ! queue ! videorate ! videoconvert ! videoscale ! appsink`
//! - HTTP MJPEG: `souphttpsrc ! multipartdemux ! jpegdec ! queue ! ... ! appsink`
//! - anything else: `uridecodebin ! queue ! ... ! appsink`
//!
//! The appsink keeps at most `buffer_size` buffers and drops stale ones, so a
//! slow consumer always sees recent decoded frames.

use std::time::Duration;

use gstreamer::prelude::*;

use super::transport::{OpenError, ReadError, Transport, TransportOptions};
use crate::frame::Frame;

pub struct GstreamerTransport {
    url: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    target_fps: u32,
    open: bool,
}

impl GstreamerTransport {
    pub fn open(options: &TransportOptions) -> Result<Self, OpenError> {
        let unavailable = |reason: String| OpenError::DeviceUnavailable {
            url: options.url.clone(),
            reason,
        };
        gstreamer::init().map_err(|e| unavailable(format!("initialize gstreamer: {}", e)))?;

        let description = options.gst_launch_line();
        log::debug!("GstreamerTransport: launching {}", description);
        let pipeline = gstreamer::parse::launch(&description)
            .map_err(|e| unavailable(format!("build pipeline: {}", e)))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| unavailable("pipeline is not a Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| unavailable("appsink element missing from pipeline".to_string()))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| unavailable("appsink element has unexpected type".to_string()))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(options.buffer_size.max(1));
        appsink.set_drop(true);
        appsink.set_sync(false);

        if let Err(e) = pipeline.set_state(gstreamer::State::Playing) {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(unavailable(format!("set pipeline to Playing: {}", e)));
        }
        log::info!(
            "GstreamerTransport: connected to {} (codec hint {})",
            options.url,
            options.codec.fourcc()
        );

        Ok(Self {
            url: options.url.clone(),
            pipeline,
            appsink,
            target_fps: options.target_fps,
            open: true,
        })
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.target_fps == 0 {
            500
        } else {
            (1000 / self.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn poll_bus(&self) -> Result<(), ReadError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(ReadError::Decode(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    )));
                }
                MessageView::Eos(..) => return Err(ReadError::EndOfStream),
                _ => {}
            }
        }
        Ok(())
    }
}

impl Transport for GstreamerTransport {
    fn read(&mut self) -> Result<Frame, ReadError> {
        if !self.open {
            return Err(ReadError::Closed);
        }
        self.poll_bus()?;

        let timeout = gstreamer::ClockTime::from_mseconds(self.frame_timeout().as_millis() as u64);
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .ok_or(ReadError::Timeout)?;
        let (pixels, width, height) = sample_to_pixels(&sample)?;
        Ok(Frame::new(pixels, width, height, 3))
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("GstreamerTransport: failed to stop {}: {}", self.url, e);
        }
    }
}

impl Drop for GstreamerTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32), ReadError> {
    let decode = |msg: &str| ReadError::Decode(msg.to_string());
    let buffer = sample.buffer().ok_or_else(|| decode("sample missing buffer"))?;
    let caps = sample.caps().ok_or_else(|| decode("sample missing caps"))?;
    let info = gstreamer_video::VideoInfo::from_caps(caps)
        .map_err(|_| decode("caps are not raw video"))?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer
        .map_readable()
        .map_err(|_| decode("buffer is not readable"))?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .ok_or_else(|| decode("buffer row is out of bounds"))?,
        );
    }

    Ok((pixels, width, height))
}
