//! Frame ingestion.
//!
//! - `transport`: capture device handles (synthetic `stub://`, GStreamer behind
//!   the `rtsp-gstreamer` feature)
//! - `source`: `StreamSource`, the producer/health tasks and the consumer surface
//! - `health`: per-tick liveness checks
//! - `reconnect`: backoff policy and read-failure counters
//!
//! Frames flow transport -> producer -> `FrameBuffer` -> `read_latest()`.
//! The producer never blocks on the buffer and the consumer never waits for it.

#[cfg(feature = "rtsp-gstreamer")]
mod gst_pipeline;
pub mod health;
pub mod reconnect;
pub mod source;
pub mod transport;

pub use health::{HealthMonitor, MonitoredStream, TickReport};
pub use reconnect::{
    ErrorCounters, ReconnectOutcome, ReconnectTrigger, ReconnectionStrategy, Refused,
};
pub use source::{StreamSource, StreamState, StreamStats};
pub use transport::{
    CodecHint, DefaultOpener, OpenError, ReadError, RtspTuning, SyntheticTransport, Transport,
    TransportOpener, TransportOptions,
};
