//! Stream Sentinel
//!
//! Resilient ingestion of an unreliable video stream, feeding a per-frame
//! person-detection pipeline with rate-limited captures.
//!
//! # Architecture
//!
//! - A producer thread reads frames from the transport into a bounded
//!   drop-oldest `FrameBuffer`.
//! - A health thread watches for frozen streams, low throughput and memory
//!   pressure, and forces reconnection when the stream stalls.
//! - The consumer pulls frames without blocking, runs detection, draws boxes and
//!   hands qualifying crops to a `CaptureStore`.
//!
//! # Module Structure
//!
//! - `frame`: `Frame` and `FrameBuffer`
//! - `ingest`: transports, `StreamSource`, `HealthMonitor`, reconnection policy
//! - `detect`: detector backend trait and detections
//! - `pipeline`: `DetectionPipeline`, annotation, `CaptureThrottler`
//! - `storage`: capture persistence (local directory or HTTP upload)
//! - `session`: consumer loop with main/fallback stream fail-over
//! - `config`: configuration loading
//! - `diag`: `{type, message}` diagnostic events

pub mod config;
pub mod detect;
pub mod diag;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod session;
pub mod storage;

pub use config::{
    CaptureSettings, DetectionSettings, SentinelConfig, SessionSettings, StorageMode,
    StorageSettings, StreamSettings,
};
pub use detect::{BoundingBox, Detection, DetectorBackend, PixelBox, StubBackend, PERSON_CLASS_ID};
pub use diag::{Diagnostic, DiagnosticKind, DiagnosticSink, Diagnostics, LogSink, RecordingSink};
pub use frame::{Frame, FrameBuffer, FrameError, DEFAULT_BUFFER_FRAMES};
pub use ingest::{
    DefaultOpener, HealthMonitor, OpenError, ReadError, ReconnectOutcome, ReconnectionStrategy,
    StreamSource, StreamState, StreamStats, Transport, TransportOpener,
};
pub use pipeline::{
    AnnotatedFrame, Annotation, CaptureThrottler, DetectionPipeline, FpsTracker, Processed,
};
pub use session::{
    FrameSink, JsonLineFrameSink, LogFrameSink, SessionEnd, SessionReport, SessionRunner,
};
pub use storage::{
    build_capture_store, CaptureMetadata, CaptureStore, InMemoryCaptureStore, LocalCaptureStore,
    StoreError,
};
#[cfg(feature = "upload-http")]
pub use storage::HttpUploadStore;
