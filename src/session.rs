//! Consumer loop and stream fail-over.
//!
//! The runner tries each stream variant in turn (main, then fallback). Each
//! variant gets `max_attempts` sessions, with a retry delay growing by half
//! each time up to the configured cap. Within a session frames are pulled with
//! `read_latest`, run through the pipeline and handed to a `FrameSink`.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use serde::Serialize;

use crate::config::SentinelConfig;
use crate::diag::Diagnostics;
use crate::frame::Frame;
use crate::ingest::{StreamSource, StreamState, TransportOpener};
use crate::pipeline::{DetectionPipeline, FpsTracker, Processed};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Receives every processed frame (display, forwarding).
pub trait FrameSink {
    fn deliver(&mut self, processed: &Processed) -> Result<()>;
}

impl<F> FrameSink for F
where
    F: FnMut(&Processed) -> Result<()>,
{
    fn deliver(&mut self, processed: &Processed) -> Result<()> {
        self(processed)
    }
}

/// Logs the per-frame person count at debug level.
pub struct LogFrameSink;

impl FrameSink for LogFrameSink {
    fn deliver(&mut self, processed: &Processed) -> Result<()> {
        log::debug!("Detected {} people", processed.person_count);
        Ok(())
    }
}

/// Longest side of a forwarded frame.
pub const FORWARD_MAX_DIMENSION: u32 = 800;
const FORWARD_JPEG_QUALITY: u8 = 80;

#[derive(Serialize)]
struct FrameLine<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a str,
}

/// Forwards annotated frames as `{"type": "frame", "data": <base64 JPEG>}` lines,
/// the same framing the JSON diagnostics use.
pub struct JsonLineFrameSink<W: Write> {
    out: W,
    scratch: Vec<u8>,
}

impl<W: Write> JsonLineFrameSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            scratch: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> FrameSink for JsonLineFrameSink<W> {
    fn deliver(&mut self, processed: &Processed) -> Result<()> {
        let Some(annotated) = processed.frame.as_ref() else {
            return Ok(());
        };
        encode_forwarded(&annotated.frame, &mut self.scratch)?;
        let data = general_purpose::STANDARD.encode(&self.scratch);
        let line = serde_json::to_string(&FrameLine {
            kind: "frame",
            data: &data,
        })?;
        writeln!(self.out, "{}", line).context("write frame line")?;
        self.out.flush().context("flush frame line")?;
        Ok(())
    }
}

/// Downscale so the longest side is at most `FORWARD_MAX_DIMENSION` and
/// JPEG-encode into `out`.
fn encode_forwarded(frame: &Frame, out: &mut Vec<u8>) -> Result<()> {
    frame.validate()?;
    let (width, height) = forwarded_size(frame.width, frame.height);
    out.clear();
    let mut encoder = JpegEncoder::new_with_quality(&mut *out, FORWARD_JPEG_QUALITY);
    match frame.channels {
        3 => {
            let image = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
                .ok_or_else(|| anyhow!("frame does not fit an RGB image"))?;
            if (width, height) == (frame.width, frame.height) {
                encoder.encode_image(&image)?;
            } else {
                encoder.encode_image(&imageops::resize(&image, width, height, FilterType::Triangle))?;
            }
        }
        1 => {
            let image = GrayImage::from_raw(frame.width, frame.height, frame.data.clone())
                .ok_or_else(|| anyhow!("frame does not fit a grayscale image"))?;
            if (width, height) == (frame.width, frame.height) {
                encoder.encode_image(&image)?;
            } else {
                encoder.encode_image(&imageops::resize(&image, width, height, FilterType::Triangle))?;
            }
        }
        other => bail!("cannot forward {}-channel frame", other),
    }
    Ok(())
}

fn forwarded_size(width: u32, height: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= FORWARD_MAX_DIMENSION {
        return (width, height);
    }
    let scale = f64::from(FORWARD_MAX_DIMENSION) / f64::from(longest);
    let scaled = |side: u32| ((f64::from(side) * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamVariant {
    pub name: &'static str,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The stop flag was raised.
    Stopped,
    /// `max_frames` frames were processed.
    FrameLimit,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub variant: &'static str,
    pub end: SessionEnd,
    pub frames: u64,
}

pub struct SessionRunner {
    config: SentinelConfig,
    opener: Arc<dyn TransportOpener>,
    diag: Diagnostics,
    stop: Arc<AtomicBool>,
    max_frames: Option<u64>,
}

impl SessionRunner {
    pub fn new(config: SentinelConfig, opener: Arc<dyn TransportOpener>, diag: Diagnostics) -> Self {
        Self {
            config,
            opener,
            diag: diag.scoped("stream_sentinel::session"),
            stop: Arc::new(AtomicBool::new(false)),
            max_frames: None,
        }
    }

    pub fn with_max_frames(mut self, max_frames: Option<u64>) -> Self {
        self.max_frames = max_frames;
        self
    }

    /// Raising this flag ends the current session cleanly.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn variants(&self) -> Vec<StreamVariant> {
        let mut variants = vec![StreamVariant {
            name: "main",
            url: self.config.stream.url.clone(),
        }];
        if let Some(url) = &self.config.session.fallback_url {
            variants.push(StreamVariant {
                name: "fallback",
                url: url.clone(),
            });
        }
        variants
    }

    pub fn run(
        &self,
        pipeline: &mut DetectionPipeline,
        sink: &mut dyn FrameSink,
    ) -> Result<SessionReport> {
        let session = &self.config.session;
        for variant in self.variants() {
            self.diag.info(format!("Trying {} stream...", variant.name));
            let mut retry_delay = session.retry_delay;
            for attempt in 1..=session.max_attempts {
                if self.stopped() {
                    return Ok(SessionReport {
                        variant: variant.name,
                        end: SessionEnd::Stopped,
                        frames: 0,
                    });
                }
                self.diag.info(format!(
                    "Attempt {}/{} for {} stream...",
                    attempt, session.max_attempts, variant.name
                ));
                match self.run_stream(&variant, pipeline, sink) {
                    Ok(report) => {
                        self.diag
                            .info(format!("Successfully ran {} stream", variant.name));
                        return Ok(report);
                    }
                    Err(e) => {
                        self.diag
                            .error(format!("Error on attempt {}: {:#}", attempt, e));
                        if attempt < session.max_attempts {
                            self.sleep_unless_stopped(retry_delay);
                            retry_delay = retry_delay.mul_f64(1.5).min(session.retry_delay_cap);
                        }
                    }
                }
            }
            self.diag.error(format!(
                "Failed to establish stable connection on {} stream after {} attempts",
                variant.name, session.max_attempts
            ));
        }
        Err(anyhow!("Failed to establish stable connection on any stream"))
    }

    fn run_stream(
        &self,
        variant: &StreamVariant,
        pipeline: &mut DetectionPipeline,
        sink: &mut dyn FrameSink,
    ) -> Result<SessionReport> {
        let session = &self.config.session;
        let mut settings = self.config.stream.clone();
        settings.url = variant.url.clone();
        let frame_interval = settings.frame_interval();

        let source = StreamSource::new(settings, self.opener.clone(), self.diag.clone());
        source.setup()?;

        let mut fps = FpsTracker::new();
        let mut frames = 0u64;
        let mut read_failures = 0u32;
        loop {
            if self.stopped() {
                self.diag.info("Stream stopped by user");
                source.release();
                return Ok(SessionReport {
                    variant: variant.name,
                    end: SessionEnd::Stopped,
                    frames,
                });
            }
            if source.state() == StreamState::Failed {
                source.release();
                bail!(
                    "{} stream failed after exhausting reconnection attempts",
                    variant.name
                );
            }

            let started = Instant::now();
            let Some(frame) = source.read_latest() else {
                read_failures += 1;
                self.diag.warning(format!(
                    "Failed to read frame (attempt {}/{})",
                    read_failures, session.max_read_failures
                ));
                if read_failures >= session.max_read_failures {
                    self.diag
                        .warning("Too many consecutive frame failures, resetting stream");
                    source.release();
                    self.sleep_unless_stopped(session.retry_delay);
                    source.setup()?;
                    read_failures = 0;
                }
                self.sleep_unless_stopped(session.read_retry_delay);
                continue;
            };
            read_failures = 0;

            let mut processed = pipeline.process(&frame);
            let current_fps = fps.update(Instant::now());
            if let Some(annotated) = processed.frame.as_mut() {
                annotated.overlay.push(format!("FPS: {:.1}", current_fps));
            }
            if let Err(e) = sink.deliver(&processed) {
                self.diag.error(format!("Frame sink failed: {:#}", e));
            }

            frames += 1;
            if self.max_frames.is_some_and(|max| frames >= max) {
                source.release();
                return Ok(SessionReport {
                    variant: variant.name,
                    end: SessionEnd::FrameLimit,
                    frames,
                });
            }
            self.sleep_unless_stopped(frame_interval.saturating_sub(started.elapsed()));
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn sleep_unless_stopped(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}
