//! Capture device handles.
//!
//! A `Transport` is an open connection to a video source. It is owned by exactly one
//! `StreamSource` and is only ever opened or closed by the thread running setup or
//! reconnection. A `TransportOpener` knows how to (re)create one from the stream
//! settings, so reconnection reuses the configuration from initial setup.
//!
//! Backends:
//! - `stub://` URLs: synthetic test pattern (always available)
//! - everything else: GStreamer (feature: rtsp-gstreamer)

use rand::Rng;
use thiserror::Error;
use url::Url;

use crate::config::StreamSettings;
use crate::frame::Frame;

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("capture device unavailable for {url}: {reason}")]
    DeviceUnavailable { url: String, reason: String },
    #[error("no initial frame from {url}: {reason}")]
    NoInitialFrame { url: String, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("transport is closed")]
    Closed,
    #[error("timed out waiting for a frame")]
    Timeout,
    #[error("stream ended")]
    EndOfStream,
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub trait Transport: Send {
    /// Read the next decoded frame.
    fn read(&mut self) -> Result<Frame, ReadError>;

    fn is_open(&self) -> bool;

    /// Release the underlying device. Idempotent.
    fn close(&mut self);
}

pub trait TransportOpener: Send + Sync {
    fn open(&self, settings: &StreamSettings) -> Result<Box<dyn Transport>, OpenError>;
}

// ----------------------------------------------------------------------------
// Options
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecHint {
    H264,
    Mjpeg,
}

impl CodecHint {
    pub fn fourcc(self) -> &'static str {
        match self {
            CodecHint::H264 => "H264",
            CodecHint::Mjpeg => "MJPG",
        }
    }
}

/// Transport tuning derived from the stream settings and URL scheme.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportOptions {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub buffer_size: u32,
    pub codec: CodecHint,
    pub rtsp: Option<RtspTuning>,
}

/// Low-latency RTSP options: TCP interleaving, no jitter buffering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtspTuning {
    pub protocol: &'static str,
    pub latency_ms: u32,
    pub max_delay_us: u32,
    pub socket_timeout_us: u64,
}

impl Default for RtspTuning {
    fn default() -> Self {
        Self {
            protocol: "tcp",
            latency_ms: 0,
            max_delay_us: 500_000,
            socket_timeout_us: 5_000_000,
        }
    }
}

impl TransportOptions {
    pub fn for_settings(settings: &StreamSettings) -> Self {
        let is_rtsp = settings.url.starts_with("rtsp://") || settings.url.starts_with("rtsps://");
        Self {
            url: settings.url.clone(),
            width: settings.width,
            height: settings.height,
            target_fps: settings.target_fps,
            buffer_size: settings.transport_buffer_size,
            codec: if is_rtsp {
                CodecHint::H264
            } else {
                CodecHint::Mjpeg
            },
            rtsp: is_rtsp.then(RtspTuning::default),
        }
    }

    /// GStreamer launch line carrying these options.
    ///
    /// Decoded frames pass a leaky queue of `buffer_size` frames (bounded by
    /// `max_delay_us` for RTSP), are rate-limited to `target_fps` and scaled to
    /// the target resolution before reaching the appsink.
    pub fn gst_launch_line(&self) -> String {
        let buffers = self.buffer_size.max(1);
        let rate = if self.target_fps > 0 {
            format!(
                "videorate drop-only=true ! video/x-raw,framerate={}/1 ! ",
                self.target_fps
            )
        } else {
            String::new()
        };
        let sink = format!(
            "{}videoconvert ! videoscale ! video/x-raw,format=RGB,width={},height={} ! \
             appsink name=appsink sync=false max-buffers={} drop=true",
            rate, self.width, self.height, buffers
        );
        match (&self.rtsp, self.codec) {
            (Some(tuning), _) => format!(
                "rtspsrc location={} protocols={} latency={} timeout={} drop-on-latency=true ! \
                 decodebin ! queue max-size-buffers={} max-size-time={} leaky=downstream ! {}",
                self.url,
                tuning.protocol,
                tuning.latency_ms,
                tuning.socket_timeout_us,
                buffers,
                u64::from(tuning.max_delay_us) * 1_000,
                sink
            ),
            (None, CodecHint::Mjpeg) if self.url.starts_with("http") => format!(
                "souphttpsrc location={} is-live=true ! multipartdemux ! jpegdec ! \
                 queue max-size-buffers={} leaky=downstream ! {}",
                self.url, buffers, sink
            ),
            (None, _) => format!(
                "uridecodebin uri={} ! queue max-size-buffers={} leaky=downstream ! {}",
                self.url, buffers, sink
            ),
        }
    }
}

// ----------------------------------------------------------------------------
// Default opener
// ----------------------------------------------------------------------------

/// Opens `stub://` URLs synthetically and everything else through GStreamer.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultOpener;

impl TransportOpener for DefaultOpener {
    fn open(&self, settings: &StreamSettings) -> Result<Box<dyn Transport>, OpenError> {
        let options = TransportOptions::for_settings(settings);
        if options.url.starts_with("stub://") {
            let transport = SyntheticTransport::open(&options)?;
            return Ok(Box::new(transport));
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            let transport = super::gst_pipeline::GstreamerTransport::open(&options)?;
            Ok(Box::new(transport))
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Err(OpenError::DeviceUnavailable {
                url: options.url,
                reason: "network streams require the rtsp-gstreamer feature".to_string(),
            })
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

/// Synthetic transport for `stub://<name>[?drop=<p>&stall_after=<n>]`.
///
/// - `drop`: probability that a read fails, simulating packet loss
/// - `stall_after`: reads time out after this many frames, simulating a frozen stream
/// - host `offline`: open fails
pub struct SyntheticTransport {
    url: String,
    width: u32,
    height: u32,
    drop_rate: f64,
    stall_after: Option<u64>,
    frame_count: u64,
    /// Simulated "scene" state so consecutive frames differ.
    scene_state: u8,
    open: bool,
}

impl SyntheticTransport {
    pub fn open(options: &TransportOptions) -> Result<Self, OpenError> {
        let unavailable = |reason: String| OpenError::DeviceUnavailable {
            url: options.url.clone(),
            reason,
        };
        let url = Url::parse(&options.url).map_err(|e| unavailable(e.to_string()))?;
        if url.host_str() == Some("offline") {
            return Err(unavailable("synthetic source is offline".to_string()));
        }

        let mut drop_rate = 0.0;
        let mut stall_after = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "drop" => {
                    drop_rate = value
                        .parse::<f64>()
                        .map_err(|_| unavailable(format!("invalid drop rate '{}'", value)))?
                        .clamp(0.0, 1.0);
                }
                "stall_after" => {
                    stall_after = Some(value.parse::<u64>().map_err(|_| {
                        unavailable(format!("invalid stall_after '{}'", value))
                    })?);
                }
                other => log::debug!("SyntheticTransport: ignoring option {}", other),
            }
        }

        log::info!(
            "SyntheticTransport: connected to {} ({}x{}, codec {})",
            options.url,
            options.width,
            options.height,
            options.codec.fourcc()
        );
        Ok(Self {
            url: options.url.clone(),
            width: options.width.max(1),
            height: options.height.max(1),
            drop_rate,
            stall_after,
            frame_count: 0,
            scene_state: 0,
            open: true,
        })
    }

    /// Moving ramp with an occasional scene change.
    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = self.width as usize * self.height as usize * 3;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl Transport for SyntheticTransport {
    fn read(&mut self) -> Result<Frame, ReadError> {
        if !self.open {
            return Err(ReadError::Closed);
        }
        if self.stall_after.is_some_and(|n| self.frame_count >= n) {
            return Err(ReadError::Timeout);
        }
        if self.drop_rate > 0.0 && rand::thread_rng().gen_bool(self.drop_rate) {
            return Err(ReadError::Decode("synthetic packet loss".to_string()));
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Ok(Frame::new(pixels, self.width, self.height, 3))
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            log::debug!("SyntheticTransport: closed {}", self.url);
        }
        self.open = false;
    }
}
