//! Liveness checks run once per tick alongside the producer.
//!
//! - Freeze: no frame for longer than `freeze_timeout` forces a reconnection.
//! - Throughput: frames per window, warning below `min_fps`.
//! - Memory pressure: above `high_water` buffered frames, evict to `low_water`.
//! - Deferred reclamation: periodically release spare buffer allocation.
//!
//! Every check is best-effort; a failing check is logged and the tick moves on.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use super::reconnect::{ReconnectOutcome, ReconnectTrigger};
use crate::config::StreamSettings;
use crate::diag::Diagnostics;
use crate::frame::FrameBuffer;

/// What the monitor needs to see of a running stream.
pub trait MonitoredStream {
    fn last_frame_at(&self) -> Option<Instant>;
    fn frames_read(&self) -> u64;
    fn buffer(&self) -> &FrameBuffer;
    fn request_reconnect(&self, trigger: ReconnectTrigger) -> ReconnectOutcome;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    pub frozen_for: Option<Duration>,
    pub reconnect: Option<ReconnectOutcome>,
    pub fps: Option<f64>,
    pub evicted: usize,
    pub reclaimed: bool,
    pub failed_checks: usize,
}

pub struct HealthMonitor {
    freeze_timeout: Duration,
    throughput_window: Duration,
    min_fps: f64,
    memory_check_interval: Duration,
    reclaim_interval: Duration,
    high_water: usize,
    low_water: usize,
    diag: Diagnostics,
    window: Option<(Instant, u64)>,
    last_memory_check: Option<Instant>,
    last_reclaim: Option<Instant>,
}

impl HealthMonitor {
    pub fn new(settings: &StreamSettings, diag: Diagnostics) -> Self {
        let health = &settings.health;
        Self {
            freeze_timeout: health.freeze_timeout,
            throughput_window: health.throughput_window,
            min_fps: health.min_fps,
            memory_check_interval: health.memory_check_interval,
            reclaim_interval: health.reclaim_interval,
            high_water: settings.high_water,
            low_water: settings.low_water,
            diag,
            window: None,
            last_memory_check: None,
            last_reclaim: None,
        }
    }

    pub fn tick(&mut self, now: Instant, stream: &dyn MonitoredStream) -> TickReport {
        let mut report = TickReport::default();

        match self.check_freeze(now, stream) {
            Ok(Some((frozen_for, outcome))) => {
                report.frozen_for = Some(frozen_for);
                report.reconnect = Some(outcome);
            }
            Ok(None) => {}
            Err(e) => self.check_failed("freeze", e, &mut report),
        }
        match self.check_throughput(now, stream) {
            Ok(fps) => report.fps = fps,
            Err(e) => self.check_failed("throughput", e, &mut report),
        }
        match self.check_memory(now, stream) {
            Ok(evicted) => report.evicted = evicted,
            Err(e) => self.check_failed("memory", e, &mut report),
        }
        report.reclaimed = self.reclaim(now, stream);

        report
    }

    fn check_failed(&self, check: &str, error: anyhow::Error, report: &mut TickReport) {
        report.failed_checks += 1;
        self.diag
            .error(format!("Health check '{}' failed: {}", check, error));
    }

    fn check_freeze(
        &self,
        now: Instant,
        stream: &dyn MonitoredStream,
    ) -> Result<Option<(Duration, ReconnectOutcome)>> {
        let last = stream
            .last_frame_at()
            .ok_or_else(|| anyhow!("stream has not delivered a frame yet"))?;
        let frozen_for = now.saturating_duration_since(last);
        if frozen_for <= self.freeze_timeout {
            return Ok(None);
        }
        self.diag.warning(format!(
            "Stream frozen for {:.1}s, forcing reconnection",
            frozen_for.as_secs_f64()
        ));
        let outcome = stream.request_reconnect(ReconnectTrigger::Freeze);
        Ok(Some((frozen_for, outcome)))
    }

    fn check_throughput(&mut self, now: Instant, stream: &dyn MonitoredStream) -> Result<Option<f64>> {
        let frames = stream.frames_read();
        let Some((start, baseline)) = self.window else {
            self.window = Some((now, frames));
            return Ok(None);
        };
        let elapsed = now.saturating_duration_since(start);
        if elapsed < self.throughput_window {
            return Ok(None);
        }
        self.window = Some((now, frames));

        let delivered = frames
            .checked_sub(baseline)
            .ok_or_else(|| anyhow!("frame counter went backwards ({} < {})", frames, baseline))?;
        let fps = delivered as f64 / elapsed.as_secs_f64();
        self.diag.info(format!("Current FPS: {:.1}", fps));
        if fps < self.min_fps {
            self.diag.warning(format!("Low FPS detected: {:.1}", fps));
        }
        Ok(Some(fps))
    }

    fn check_memory(&mut self, now: Instant, stream: &dyn MonitoredStream) -> Result<usize> {
        if !due(&mut self.last_memory_check, now, self.memory_check_interval) {
            return Ok(0);
        }
        let buffer = stream.buffer();
        let buffered = buffer.len();
        if buffered <= self.high_water {
            return Ok(0);
        }
        let bytes = buffer.memory_bytes();
        let evicted = buffer.trim_to(self.low_water);
        self.diag.warning(format!(
            "High memory usage detected: {} frames buffered ({:.1} MiB), evicted {}",
            buffered,
            bytes as f64 / (1024.0 * 1024.0),
            evicted
        ));
        Ok(evicted)
    }

    fn reclaim(&mut self, now: Instant, stream: &dyn MonitoredStream) -> bool {
        if !due(&mut self.last_reclaim, now, self.reclaim_interval) {
            return false;
        }
        stream.buffer().shrink();
        log::debug!("HealthMonitor: released spare buffer allocation");
        true
    }
}

/// Interval gate. The first call only arms the timer.
fn due(last: &mut Option<Instant>, now: Instant, interval: Duration) -> bool {
    match *last {
        None => {
            *last = Some(now);
            false
        }
        Some(prev) if now.saturating_duration_since(prev) >= interval => {
            *last = Some(now);
            true
        }
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::{DiagnosticKind, RecordingSink};
    use crate::frame::Frame;
    use std::cell::Cell;
    use std::sync::Arc;

    struct FakeStream {
        last_frame_at: Option<Instant>,
        frames: Cell<u64>,
        buffer: FrameBuffer,
        reconnects: Cell<u32>,
    }

    impl FakeStream {
        fn new(last_frame_at: Instant) -> Self {
            Self {
                last_frame_at: Some(last_frame_at),
                frames: Cell::new(0),
                buffer: FrameBuffer::with_capacity(240),
                reconnects: Cell::new(0),
            }
        }
    }

    impl MonitoredStream for FakeStream {
        fn last_frame_at(&self) -> Option<Instant> {
            self.last_frame_at
        }
        fn frames_read(&self) -> u64 {
            self.frames.get()
        }
        fn buffer(&self) -> &FrameBuffer {
            &self.buffer
        }
        fn request_reconnect(&self, _trigger: ReconnectTrigger) -> ReconnectOutcome {
            self.reconnects.set(self.reconnects.get() + 1);
            ReconnectOutcome::Failed
        }
    }

    fn monitor() -> (HealthMonitor, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let monitor = HealthMonitor::new(&StreamSettings::default(), Diagnostics::new(sink.clone()));
        (monitor, sink)
    }

    #[test]
    fn frozen_stream_triggers_reconnect_every_tick() {
        let (mut monitor, _) = monitor();
        let base = Instant::now();
        let stream = FakeStream::new(base);

        let report = monitor.tick(base + Duration::from_secs(61), &stream);
        assert_eq!(report.reconnect, Some(ReconnectOutcome::Failed));
        assert_eq!(stream.reconnects.get(), 1);

        monitor.tick(base + Duration::from_secs(62), &stream);
        assert_eq!(stream.reconnects.get(), 2);
    }

    #[test]
    fn stream_at_exactly_the_timeout_is_not_frozen() {
        let (mut monitor, _) = monitor();
        let base = Instant::now();
        let stream = FakeStream::new(base);

        let report = monitor.tick(base + Duration::from_secs(60), &stream);
        assert!(report.frozen_for.is_none());
        assert_eq!(stream.reconnects.get(), 0);
    }

    #[test]
    fn low_throughput_is_a_warning_only() {
        let (mut monitor, sink) = monitor();
        let base = Instant::now();
        let stream = FakeStream::new(base);

        monitor.tick(base, &stream);
        stream.frames.set(10);
        let report = monitor.tick(base + Duration::from_secs(5), &stream);

        assert_eq!(report.fps, Some(2.0));
        assert_eq!(sink.count_matching(DiagnosticKind::Info, "Current FPS"), 1);
        assert_eq!(sink.count_matching(DiagnosticKind::Warning, "Low FPS"), 1);
        assert_eq!(stream.reconnects.get(), 0);
    }

    #[test]
    fn memory_pressure_evicts_to_low_water() {
        let (mut monitor, sink) = monitor();
        let base = Instant::now();
        let stream = FakeStream::new(base);
        for _ in 0..100 {
            stream.buffer.push(Arc::new(Frame::filled(128, 128, [1, 2, 3])));
        }

        assert_eq!(monitor.tick(base, &stream).evicted, 0);
        let report = monitor.tick(base + Duration::from_secs(60), &stream);
        assert_eq!(report.evicted, 70);
        assert_eq!(stream.buffer.len(), 30);
        assert_eq!(
            sink.count_matching(
                DiagnosticKind::Warning,
                "High memory usage detected: 100 frames buffered (4.7 MiB), evicted 70"
            ),
            1
        );
    }

    #[test]
    fn failing_check_does_not_stop_the_tick() {
        let (mut monitor, sink) = monitor();
        let base = Instant::now();
        let mut stream = FakeStream::new(base);
        stream.last_frame_at = None;

        monitor.tick(base, &stream);
        stream.frames.set(200);
        let report = monitor.tick(base + Duration::from_secs(5), &stream);

        assert_eq!(report.failed_checks, 1);
        assert_eq!(report.fps, Some(40.0));
        assert_eq!(sink.count_matching(DiagnosticKind::Error, "Health check 'freeze'"), 2);
    }

    #[test]
    fn reclamation_runs_on_its_own_interval() {
        let (mut monitor, _) = monitor();
        let base = Instant::now();
        let stream = FakeStream::new(base);

        assert!(!monitor.tick(base, &stream).reclaimed);
        assert!(!monitor.tick(base + Duration::from_secs(30), &stream).reclaimed);
        // Keep the freeze check quiet while jumping ahead.
        let stream = FakeStream::new(base + Duration::from_secs(300));
        assert!(monitor.tick(base + Duration::from_secs(300), &stream).reclaimed);
    }
}
