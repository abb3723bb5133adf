//! StreamSource: owns the transport and the producer/health tasks.
//!
//! Consumer surface: `setup()`, `read_latest()`, `release()`.
//!
//! Threads:
//! - `stream-producer`: reads frames at the target rate into the `FrameBuffer`.
//! - `stream-health`: runs `HealthMonitor::tick` once per health tick.
//!
//! Only the thread performing setup or reconnection opens or closes the
//! transport. Reconnection raises `paused` and then takes the transport mutex,
//! so an in-flight read always completes before the handle is closed.
//!
//! `release()` bumps a generation counter. A reconnection that outlives the
//! release (its thread was abandoned after `join_timeout`) sees the new
//! generation when it comes back with a handle, closes it and changes nothing.
//!
//! Exhausting the reconnect budget raises `stop`; the state moves to `Failed`
//! only when the last task of the run has exited.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::health::{HealthMonitor, MonitoredStream};
use super::reconnect::{ErrorCounters, ReconnectOutcome, ReconnectTrigger, ReconnectionStrategy};
use super::transport::{OpenError, ReadError, Transport, TransportOpener};
use crate::config::StreamSettings;
use crate::diag::Diagnostics;
use crate::frame::{Frame, FrameBuffer};

/// Granularity of cancellable sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Degraded = 3,
    Reconnecting = 4,
    Failed = 5,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StreamState::Connecting,
            2 => StreamState::Connected,
            3 => StreamState::Degraded,
            4 => StreamState::Reconnecting,
            5 => StreamState::Failed,
            _ => StreamState::Disconnected,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            StreamState::Connected | StreamState::Degraded | StreamState::Reconnecting
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamStats {
    pub frames_read: u64,
    pub reconnects: u64,
    pub buffered: usize,
    pub state: StreamState,
    /// Background tasks of the current run that have not exited yet.
    pub active_tasks: usize,
}

pub struct StreamSource {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    settings: StreamSettings,
    opener: Arc<dyn TransportOpener>,
    diag: Diagnostics,
    transport: Mutex<Option<Box<dyn Transport>>>,
    buffer: FrameBuffer,
    last_frame: Mutex<Option<Arc<Frame>>>,
    last_frame_at: Mutex<Option<Instant>>,
    strategy: Mutex<ReconnectionStrategy>,
    frames_read: AtomicU64,
    reconnects: AtomicU64,
    state: AtomicU8,
    stop: AtomicBool,
    paused: AtomicBool,
    reconnecting: AtomicBool,
    /// Reconnect budget exhausted in the current run.
    exhausted: AtomicBool,
    generation: AtomicU64,
    /// Live-task count of the current run; each run gets a fresh counter.
    running: Mutex<Arc<AtomicUsize>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl StreamSource {
    pub fn new(
        settings: StreamSettings,
        opener: Arc<dyn TransportOpener>,
        diagnostics: Diagnostics,
    ) -> Self {
        let inner = Inner {
            buffer: FrameBuffer::with_capacity(settings.buffer_capacity),
            strategy: Mutex::new(ReconnectionStrategy::from_settings(&settings.reconnect)),
            settings,
            opener,
            diag: diagnostics.scoped("stream_sentinel::stream"),
            transport: Mutex::new(None),
            last_frame: Mutex::new(None),
            last_frame_at: Mutex::new(None),
            frames_read: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            state: AtomicU8::new(StreamState::Disconnected as u8),
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            running: Mutex::new(Arc::new(AtomicUsize::new(0))),
        };
        Self {
            inner: Arc::new(inner),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.settings.url
    }

    pub fn state(&self) -> StreamState {
        self.inner.state()
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            frames_read: self.inner.frames_read.load(Ordering::SeqCst),
            reconnects: self.inner.reconnects.load(Ordering::SeqCst),
            buffered: self.inner.buffer.len(),
            state: self.state(),
            active_tasks: lock(&self.inner.running).load(Ordering::SeqCst),
        }
    }

    /// Open the transport, perform a test read and start the background tasks.
    pub fn setup(&self) -> Result<(), OpenError> {
        if self.state().is_active() {
            return Ok(());
        }
        // Tasks from a previous failed run must be gone before new ones start.
        self.join_tasks();

        let inner = &self.inner;
        inner.set_state(StreamState::Connecting);
        inner.diag.info(format!("Connecting to {}", inner.settings.url));

        let (transport, frame) = match inner.open_and_probe() {
            Ok(opened) => opened,
            Err(e) => {
                inner.set_state(StreamState::Disconnected);
                inner.diag.error(format!("Failed to open stream: {}", e));
                return Err(e);
            }
        };
        *lock(&inner.transport) = Some(transport);
        inner.accept_frame(frame);
        lock(&inner.strategy).reset();
        inner.exhausted.store(false, Ordering::SeqCst);
        inner.stop.store(false, Ordering::SeqCst);
        inner.paused.store(false, Ordering::SeqCst);
        inner.set_state(StreamState::Connected);

        let mut tasks = lock(&self.tasks);
        match self.spawn_tasks() {
            Ok(handles) => tasks.extend(handles),
            Err(e) => {
                drop(tasks);
                inner.diag.error(format!("Failed to start stream tasks: {}", e));
                self.release();
                return Err(OpenError::DeviceUnavailable {
                    url: inner.settings.url.clone(),
                    reason: format!("failed to spawn stream tasks: {}", e),
                });
            }
        }
        inner.diag.info(format!(
            "Stream connected: {} ({}x{} @ {} fps target)",
            inner.settings.url,
            inner.settings.width,
            inner.settings.height,
            inner.settings.target_fps
        ));
        Ok(())
    }

    fn spawn_tasks(&self) -> std::io::Result<Vec<JoinHandle<()>>> {
        let running = Arc::new(AtomicUsize::new(0));
        *lock(&self.inner.running) = running.clone();

        let producer = self.spawn_task("stream-producer", &running, Inner::run_producer)?;
        let health = match self.spawn_task("stream-health", &running, Inner::run_health) {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.stop.store(true, Ordering::SeqCst);
                let _ = producer.join();
                return Err(e);
            }
        };
        Ok(vec![producer, health])
    }

    fn spawn_task(
        &self,
        name: &str,
        running: &Arc<AtomicUsize>,
        body: fn(&Inner),
    ) -> std::io::Result<JoinHandle<()>> {
        let inner = self.inner.clone();
        let group = running.clone();
        running.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new().name(name.into()).spawn(move || {
            body(&inner);
            inner.task_exited(&group);
        });
        if spawned.is_err() {
            running.fetch_sub(1, Ordering::SeqCst);
        }
        spawned
    }

    /// Oldest retained frame, or the last frame read when the buffer is empty.
    pub fn read_latest(&self) -> Option<Frame> {
        self.inner.read_latest()
    }

    /// Ask for a reconnection sequence now, subject to the usual rate limit.
    pub fn request_reconnect(&self) -> ReconnectOutcome {
        self.inner.reconnect(ReconnectTrigger::Manual)
    }

    /// Stop the tasks, close the transport and drain the buffer. Idempotent.
    pub fn release(&self) {
        let inner = &self.inner;
        inner.stop.store(true, Ordering::SeqCst);
        inner.generation.fetch_add(1, Ordering::SeqCst);
        self.join_tasks();

        // Taken under the transport lock, after which no reconnection of the
        // old generation can install a handle or touch the state.
        let taken = lock(&inner.transport).take();
        if let Some(mut transport) = taken {
            transport.close();
        }
        let dropped = inner.buffer.clear();
        *lock(&inner.last_frame) = None;
        if inner.exhausted.load(Ordering::SeqCst) {
            inner.set_state(StreamState::Failed);
        } else {
            inner.set_state(StreamState::Disconnected);
        }
        if dropped > 0 {
            log::debug!("StreamSource: dropped {} buffered frames on release", dropped);
        }
    }

    fn join_tasks(&self) {
        let handles: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        if handles.is_empty() {
            return;
        }
        let deadline = Instant::now() + self.inner.settings.join_timeout;
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            let name = handle.thread().name().unwrap_or("stream-task").to_string();
            if handle.is_finished() {
                if handle.join().is_err() {
                    log::warn!("StreamSource: {} exited with a panic", name);
                }
            } else {
                log::warn!(
                    "StreamSource: {} did not stop within {:?}; abandoning it",
                    name,
                    self.inner.settings.join_timeout
                );
            }
        }
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.release();
    }
}

impl Inner {
    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: StreamState, to: StreamState) {
        let _ = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// The run this reconnection belongs to has been stopped or released.
    fn superseded(&self, generation: u64) -> bool {
        self.stopped() || self.generation.load(Ordering::SeqCst) != generation
    }

    fn task_exited(&self, group: &Arc<AtomicUsize>) {
        let last = group.fetch_sub(1, Ordering::SeqCst) == 1;
        let current = Arc::ptr_eq(group, &lock(&self.running));
        if last && current && self.exhausted.load(Ordering::SeqCst) {
            self.set_state(StreamState::Failed);
            self.diag.error(format!(
                "Stream {} failed; background tasks stopped",
                self.settings.url
            ));
        }
    }

    fn open_and_probe(&self) -> Result<(Box<dyn Transport>, Frame), OpenError> {
        let mut transport = self.opener.open(&self.settings)?;
        match transport.read() {
            Ok(frame) => Ok((transport, frame)),
            Err(e) => {
                transport.close();
                Err(OpenError::NoInitialFrame {
                    url: self.settings.url.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn accept_frame(&self, frame: Frame) {
        let frame = Arc::new(frame);
        *lock(&self.last_frame_at) = Some(frame.captured_at);
        self.buffer.push(frame.clone());
        *lock(&self.last_frame) = Some(frame);
        self.frames_read.fetch_add(1, Ordering::SeqCst);
    }

    fn read_latest(&self) -> Option<Frame> {
        let frame = self.buffer.pop().or_else(|| lock(&self.last_frame).clone());
        frame.map(Frame::from_shared)
    }

    /// Sleep in slices, returning false if `stop` was raised meanwhile.
    fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        match *lock(&self.last_frame_at) {
            Some(last) => now.saturating_duration_since(last) <= self.settings.health.freeze_timeout,
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Producer
    // ------------------------------------------------------------------------

    fn run_producer(&self) {
        let mut counters = ErrorCounters::new(
            self.settings.max_consecutive_errors,
            self.settings.max_network_errors,
        );
        while !self.stopped() {
            let pause = match catch_unwind(AssertUnwindSafe(|| self.produce_once(&mut counters))) {
                Ok(pause) => pause,
                Err(_) => {
                    self.diag.error("Producer step panicked; continuing");
                    self.settings.idle_backoff
                }
            };
            if !pause.is_zero() && !self.sleep_unless_stopped(pause) {
                break;
            }
        }
        log::debug!("StreamSource: producer stopped");
    }

    /// One producer iteration. Returns how long to sleep before the next one.
    fn produce_once(&self, counters: &mut ErrorCounters) -> Duration {
        let idle = self.settings.idle_backoff;
        if self.paused.load(Ordering::SeqCst) || !self.is_fresh(Instant::now()) {
            return idle;
        }

        let started = Instant::now();
        let result = {
            let mut transport = lock(&self.transport);
            if self.paused.load(Ordering::SeqCst) {
                return idle;
            }
            match transport.as_mut() {
                Some(t) if t.is_open() => t.read(),
                _ => Err(ReadError::Closed),
            }
        };

        match result {
            Ok(frame) => {
                counters.record_success();
                self.transition(StreamState::Degraded, StreamState::Connected);
                self.accept_frame(frame);
                self.settings.frame_interval().saturating_sub(started.elapsed())
            }
            Err(e) => {
                log::debug!("StreamSource: read failed: {}", e);
                self.transition(StreamState::Connected, StreamState::Degraded);
                if counters.record_failure() {
                    self.diag.warning(format!(
                        "Too many read errors ({}), attempting reconnection",
                        e
                    ));
                    self.reconnect(ReconnectTrigger::ReadFailures);
                }
                idle
            }
        }
    }

    // ------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------

    fn run_health(&self) {
        let mut monitor = HealthMonitor::new(&self.settings, self.diag.scoped("stream_sentinel::health"));
        let tick = self.settings.health.tick;
        while !self.stopped() {
            let result = catch_unwind(AssertUnwindSafe(|| monitor.tick(Instant::now(), self)));
            if result.is_err() {
                self.diag.error("Health monitor tick panicked; continuing");
            }
            if !self.sleep_unless_stopped(tick) {
                break;
            }
        }
        log::debug!("StreamSource: health monitor stopped");
    }

    // ------------------------------------------------------------------------
    // Reconnection
    // ------------------------------------------------------------------------

    fn reconnect(&self, trigger: ReconnectTrigger) -> ReconnectOutcome {
        if self.stopped() {
            return ReconnectOutcome::Cancelled;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return ReconnectOutcome::InFlight;
        }
        let outcome = self.reconnect_sequence(trigger);
        self.paused.store(false, Ordering::SeqCst);
        self.reconnecting.store(false, Ordering::SeqCst);
        outcome
    }

    fn reconnect_sequence(&self, trigger: ReconnectTrigger) -> ReconnectOutcome {
        let generation = self.generation.load(Ordering::SeqCst);
        let (delay, attempt) = {
            let mut strategy = lock(&self.strategy);
            match strategy.begin(Instant::now()) {
                Ok(delay) => (delay, strategy.attempt_count() + 1),
                Err(refused) => {
                    log::debug!("StreamSource: {}", refused);
                    return ReconnectOutcome::RateLimited;
                }
            }
        };

        // Never resurrect a released source.
        self.transition(StreamState::Connected, StreamState::Reconnecting);
        self.transition(StreamState::Degraded, StreamState::Reconnecting);
        self.diag.warning(format!(
            "Reconnecting after {} (attempt {}), waiting {:.1}s",
            trigger,
            attempt,
            delay.as_secs_f64()
        ));
        if !self.sleep_unless_stopped(delay) || self.superseded(generation) {
            return ReconnectOutcome::Cancelled;
        }

        self.paused.store(true, Ordering::SeqCst);
        let taken = {
            let mut slot = lock(&self.transport);
            if self.superseded(generation) {
                return ReconnectOutcome::Cancelled;
            }
            slot.take()
        };
        if let Some(mut transport) = taken {
            transport.close();
        }
        self.buffer.clear();

        let opened = self.open_and_probe();
        let now = Instant::now();

        // Install under the transport lock so a concurrent release either runs
        // entirely after this block or makes it a no-op.
        let mut slot = lock(&self.transport);
        if self.superseded(generation) {
            if let Ok((mut transport, _)) = opened {
                transport.close();
            }
            log::debug!("StreamSource: reconnection outlived its run; discarded");
            return ReconnectOutcome::Cancelled;
        }
        match opened {
            Ok((transport, frame)) => {
                *slot = Some(transport);
                self.accept_frame(frame);
                lock(&self.strategy).succeeded(now);
                self.reconnects.fetch_add(1, Ordering::SeqCst);
                self.set_state(StreamState::Connected);
                self.diag.info("Successfully reconnected to stream");
                ReconnectOutcome::Reconnected
            }
            Err(e) => {
                let failures = lock(&self.strategy).failed(now);
                self.diag
                    .error(format!("Reconnection attempt {} failed: {}", failures, e));
                self.set_state(StreamState::Degraded);
                if failures >= self.settings.reconnect.max_attempts {
                    self.diag.error(format!(
                        "Giving up on {} after {} failed reconnection attempts",
                        self.settings.url, failures
                    ));
                    self.exhausted.store(true, Ordering::SeqCst);
                    self.stop.store(true, Ordering::SeqCst);
                    if lock(&self.running).load(Ordering::SeqCst) == 0 {
                        self.set_state(StreamState::Failed);
                    }
                }
                ReconnectOutcome::Failed
            }
        }
    }
}

impl MonitoredStream for Inner {
    fn last_frame_at(&self) -> Option<Instant> {
        *lock(&self.last_frame_at)
    }

    fn frames_read(&self) -> u64 {
        self.frames_read.load(Ordering::SeqCst)
    }

    fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    fn request_reconnect(&self, trigger: ReconnectTrigger) -> ReconnectOutcome {
        self.reconnect(trigger)
    }
}
