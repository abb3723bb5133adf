//! sentineld - stream sentinel daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by SENTINEL_CONFIG or --config, then env overrides)
//! 2. Opens the main stream, falling back to the secondary stream when configured
//! 3. Runs every frame through the detection pipeline
//! 4. Stores captures locally (dev) or uploads them (prod)
//! 5. With `--log-format json`, writes log records and annotated frames to stdout
//!    as `{"type": ..., "data": ...}` lines for a supervising shell
//! 6. Stops cleanly on Ctrl-C

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use stream_sentinel::{
    build_capture_store, DefaultOpener, DetectionPipeline, DetectorBackend, Diagnostic,
    DiagnosticKind, Diagnostics, FrameSink, JsonLineFrameSink, LogFrameSink, SentinelConfig,
    SessionRunner, StubBackend,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    /// One `{"type": ..., "data": ...}` object per line on stdout, frames included.
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "SENTINEL_CONFIG")]
    config: Option<PathBuf>,
    /// Stream URL; overrides the configured main stream.
    #[arg(long)]
    url: Option<String>,
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    /// Stop after this many processed frames.
    #[arg(long)]
    max_frames: Option<u64>,
}

fn init_logging(format: LogFormat) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if format == LogFormat::Json {
        builder.target(env_logger::Target::Stdout);
        builder.format(|buf, record| {
            let diagnostic = Diagnostic::new(
                DiagnosticKind::from_level(record.level()),
                record.args().to_string(),
            );
            writeln!(buf, "{}", diagnostic.to_json_line())
        });
    }
    builder.init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let mut config =
        SentinelConfig::load_from(args.config.as_deref()).context("load configuration")?;
    if let Some(url) = args.url {
        config.stream.url = url;
    }

    log::info!(
        "sentineld {} starting: stream={}, storage={:?}",
        env!("CARGO_PKG_VERSION"),
        config.stream.url,
        config.storage.mode
    );

    let diagnostics = Diagnostics::log();
    let store = build_capture_store(&config.storage)?;
    let mut detector = StubBackend::new();
    detector.warm_up()?;
    let mut pipeline = DetectionPipeline::new(
        Box::new(detector),
        store,
        config.detection.clone(),
        &config.capture,
        diagnostics.clone(),
    );
    log::info!("detector backend: {}", pipeline.detector_name());

    let runner = SessionRunner::new(config, Arc::new(DefaultOpener), diagnostics)
        .with_max_frames(args.max_frames);
    let stop = runner.stop_handle();
    ctrlc::set_handler(move || {
        stop.store(true, Ordering::SeqCst);
    })
    .context("set Ctrl-C handler")?;

    let mut sink: Box<dyn FrameSink> = match args.log_format {
        LogFormat::Text => Box::new(LogFrameSink),
        LogFormat::Json => Box::new(JsonLineFrameSink::new(std::io::stdout())),
    };
    let report = runner.run(&mut pipeline, sink.as_mut())?;
    log::info!(
        "session on {} stream ended ({:?}) after {} frames; {} captures stored",
        report.variant,
        report.end,
        report.frames,
        pipeline.captures_stored()
    );
    Ok(())
}
