use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use stream_sentinel::config::StreamSettings;
use stream_sentinel::ingest::{
    OpenError, ReadError, ReconnectOutcome, StreamSource, StreamState, Transport,
    TransportOpener,
};
use stream_sentinel::{Diagnostics, Frame};

/// What the next `open()` call produces.
#[derive(Clone, Debug)]
enum Plan {
    Unavailable,
    /// `good_reads` frames (including the test read), then `failure` forever.
    Reads {
        good_reads: usize,
        failure: ReadError,
        read_delay: Duration,
    },
}

impl Plan {
    fn healthy() -> Self {
        Plan::Reads {
            good_reads: usize::MAX,
            failure: ReadError::EndOfStream,
            read_delay: Duration::ZERO,
        }
    }

    fn fails_after(good_reads: usize, failure: ReadError) -> Self {
        Plan::Reads {
            good_reads,
            failure,
            read_delay: Duration::ZERO,
        }
    }
}

struct ScriptedTransport {
    remaining: usize,
    failure: ReadError,
    read_delay: Duration,
    open: bool,
    closes: Arc<AtomicUsize>,
    tag: u8,
}

impl Transport for ScriptedTransport {
    fn read(&mut self) -> Result<Frame, ReadError> {
        if !self.open {
            return Err(ReadError::Closed);
        }
        if !self.read_delay.is_zero() {
            thread::sleep(self.read_delay);
        }
        if self.remaining == 0 {
            return Err(self.failure.clone());
        }
        self.remaining -= 1;
        Ok(Frame::filled(8, 6, [self.tag, 0, 0]))
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        self.open = false;
    }
}

struct ScriptedOpener {
    plans: Mutex<VecDeque<Plan>>,
    fallback: Plan,
    opens: AtomicUsize,
    opened_at: Mutex<Vec<Instant>>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedOpener {
    fn new(plans: Vec<Plan>, fallback: Plan) -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(plans.into()),
            fallback,
            opens: AtomicUsize::new(0),
            opened_at: Mutex::new(Vec::new()),
            closes: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn opened_at(&self) -> Vec<Instant> {
        self.opened_at.lock().unwrap().clone()
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl TransportOpener for ScriptedOpener {
    fn open(&self, settings: &StreamSettings) -> Result<Box<dyn Transport>, OpenError> {
        let index = self.opens.fetch_add(1, Ordering::SeqCst);
        self.opened_at.lock().unwrap().push(Instant::now());
        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match plan {
            Plan::Unavailable => Err(OpenError::DeviceUnavailable {
                url: settings.url.clone(),
                reason: "scripted outage".to_string(),
            }),
            Plan::Reads {
                good_reads,
                failure,
                read_delay,
            } => Ok(Box::new(ScriptedTransport {
                remaining: good_reads,
                failure,
                read_delay,
                open: true,
                closes: self.closes.clone(),
                tag: index as u8,
            })),
        }
    }
}

fn fast_settings() -> StreamSettings {
    let mut settings = StreamSettings {
        url: "scripted://camera".to_string(),
        target_fps: 200,
        idle_backoff: Duration::from_millis(2),
        join_timeout: Duration::from_secs(2),
        ..StreamSettings::default()
    };
    settings.reconnect.base_delay = Duration::from_millis(20);
    settings.reconnect.max_delay = Duration::from_millis(80);
    settings.health.tick = Duration::from_millis(10);
    settings
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn setup_read_and_release() {
    let opener = ScriptedOpener::new(vec![], Plan::healthy());
    let source = StreamSource::new(fast_settings(), opener.clone(), Diagnostics::log());

    source.setup().expect("setup");
    assert_eq!(source.state(), StreamState::Connected);
    assert!(source.read_latest().is_some());
    assert!(wait_until(Duration::from_secs(2), || source.stats().frames_read > 10));

    source.release();
    assert_eq!(source.state(), StreamState::Disconnected);
    assert_eq!(source.stats().buffered, 0);
    assert_eq!(opener.closes(), 1);

    source.release();
    assert_eq!(opener.closes(), 1);
}

#[test]
fn unavailable_device_fails_setup() {
    let opener = ScriptedOpener::new(vec![Plan::Unavailable], Plan::healthy());
    let source = StreamSource::new(fast_settings(), opener, Diagnostics::log());

    let err = source.setup().unwrap_err();
    assert!(matches!(err, OpenError::DeviceUnavailable { .. }));
    assert_eq!(source.state(), StreamState::Disconnected);
    assert!(source.read_latest().is_none());
}

#[test]
fn failed_test_read_releases_the_handle() {
    let opener = ScriptedOpener::new(
        vec![Plan::fails_after(0, ReadError::Timeout)],
        Plan::healthy(),
    );
    let source = StreamSource::new(fast_settings(), opener.clone(), Diagnostics::log());

    let err = source.setup().unwrap_err();
    assert!(matches!(err, OpenError::NoInitialFrame { .. }));
    assert_eq!(opener.closes(), 1);
    assert_eq!(source.state(), StreamState::Disconnected);
}

#[test]
fn repeated_read_failures_trigger_one_reconnect() {
    let opener = ScriptedOpener::new(
        vec![Plan::fails_after(1, ReadError::Decode("corrupt packet".into()))],
        Plan::healthy(),
    );
    let source = StreamSource::new(fast_settings(), opener.clone(), Diagnostics::log());
    source.setup().expect("setup");

    assert!(wait_until(Duration::from_secs(3), || source.stats().reconnects == 1));
    assert!(wait_until(Duration::from_secs(1), || source.state()
        == StreamState::Connected));
    assert_eq!(opener.opens(), 2);
    assert!(source.stats().frames_read > 1);

    source.release();
}

#[test]
fn read_latest_never_returns_none_after_first_frame() {
    let opener = ScriptedOpener::new(
        vec![Plan::Reads {
            good_reads: usize::MAX,
            failure: ReadError::EndOfStream,
            read_delay: Duration::from_millis(20),
        }],
        Plan::healthy(),
    );
    let source = StreamSource::new(fast_settings(), opener, Diagnostics::log());
    source.setup().expect("setup");

    // The consumer outpaces the producer, so the buffer is usually empty.
    for _ in 0..500 {
        assert!(source.read_latest().is_some());
    }
    source.release();
}

#[test]
fn exhausted_reconnect_budget_fails_the_stream() {
    let mut settings = fast_settings();
    settings.reconnect.max_attempts = 3;
    let opener = ScriptedOpener::new(
        vec![Plan::fails_after(1, ReadError::Timeout)],
        Plan::Unavailable,
    );
    let source = StreamSource::new(settings, opener.clone(), Diagnostics::log());
    source.setup().expect("setup");

    assert!(wait_until(Duration::from_secs(5), || source.state()
        == StreamState::Failed));
    assert_eq!(opener.opens(), 4);
    // Failed is only reported once both background tasks have exited.
    assert_eq!(source.stats().active_tasks, 0);

    source.release();
    assert_eq!(source.state(), StreamState::Failed);
}

#[test]
fn frozen_stream_is_recovered_by_the_health_monitor() {
    let mut settings = fast_settings();
    // Only the freeze check can trigger a reconnection here.
    settings.max_consecutive_errors = u32::MAX;
    settings.max_network_errors = u32::MAX;
    settings.health.freeze_timeout = Duration::from_millis(150);
    let opener = ScriptedOpener::new(
        vec![Plan::Reads {
            good_reads: 1,
            failure: ReadError::Timeout,
            read_delay: Duration::from_millis(5),
        }],
        Plan::healthy(),
    );
    let source = StreamSource::new(settings, opener.clone(), Diagnostics::log());
    source.setup().expect("setup");

    assert!(wait_until(Duration::from_secs(3), || source.stats().reconnects >= 1));
    assert!(wait_until(Duration::from_secs(1), || source.stats().frames_read > 5));
    assert_eq!(opener.opens(), 2);

    source.release();
}

#[test]
fn concurrent_reconnect_requests_are_serialised() {
    let mut settings = fast_settings();
    settings.reconnect.base_delay = Duration::from_millis(200);
    settings.reconnect.max_delay = Duration::from_millis(200);
    let opener = ScriptedOpener::new(vec![], Plan::healthy());
    let source = Arc::new(StreamSource::new(settings, opener.clone(), Diagnostics::log()));
    source.setup().expect("setup");

    let background = {
        let source = source.clone();
        thread::spawn(move || source.request_reconnect())
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(source.request_reconnect(), ReconnectOutcome::InFlight);

    assert_eq!(background.join().unwrap(), ReconnectOutcome::Reconnected);
    assert_eq!(opener.opens(), 2);
    source.release();
}

#[test]
fn release_during_slow_reopen_stays_released() {
    let mut settings = fast_settings();
    settings.join_timeout = Duration::from_millis(100);
    let slow_reopen = Plan::Reads {
        good_reads: usize::MAX,
        failure: ReadError::EndOfStream,
        read_delay: Duration::from_millis(600),
    };
    let opener = ScriptedOpener::new(
        vec![
            Plan::fails_after(1, ReadError::Decode("corrupt packet".into())),
            slow_reopen,
        ],
        Plan::healthy(),
    );
    let source = StreamSource::new(settings, opener.clone(), Diagnostics::log());
    source.setup().expect("setup");

    // The producer is now blocked in the test read of the second handle.
    assert!(wait_until(Duration::from_secs(3), || opener.opens() == 2));
    thread::sleep(Duration::from_millis(50));
    source.release();
    assert_eq!(source.state(), StreamState::Disconnected);

    // The abandoned reopen finishes, but must not revive the source.
    thread::sleep(Duration::from_millis(900));
    assert_eq!(source.state(), StreamState::Disconnected);
    assert_eq!(source.stats().reconnects, 0);
    assert_eq!(opener.closes(), 2, "late handle must be closed, not leaked");

    source.setup().expect("setup after release");
    assert_eq!(opener.opens(), 3);
    assert_eq!(source.state(), StreamState::Connected);
    let before = source.stats().frames_read;
    assert!(wait_until(Duration::from_secs(2), || source.stats().frames_read
        > before + 5));
    source.release();
}

#[test]
fn reconnect_flood_admits_one_attempt_per_window() {
    let base_delay = Duration::from_millis(100);
    let mut settings = fast_settings();
    settings.reconnect.base_delay = base_delay;
    settings.reconnect.max_delay = base_delay;
    let opener = ScriptedOpener::new(vec![], Plan::healthy());
    let source = Arc::new(StreamSource::new(settings, opener.clone(), Diagnostics::log()));
    source.setup().expect("setup");

    let flood_for = Duration::from_millis(700);
    let started = Instant::now();
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let source = source.clone();
            thread::spawn(move || {
                let mut outcomes = Vec::new();
                while started.elapsed() < flood_for {
                    outcomes.push(source.request_reconnect());
                    thread::sleep(Duration::from_millis(5));
                }
                outcomes
            })
        })
        .collect();
    let outcomes: Vec<ReconnectOutcome> = workers
        .into_iter()
        .flat_map(|worker| worker.join().unwrap())
        .collect();

    let count = |wanted: ReconnectOutcome| outcomes.iter().filter(|o| **o == wanted).count();
    assert!(count(ReconnectOutcome::RateLimited) > 0);
    assert!(count(ReconnectOutcome::InFlight) > 0);
    assert_eq!(count(ReconnectOutcome::Failed), 0);

    // Every admitted attempt reopened exactly once.
    let reopens = count(ReconnectOutcome::Reconnected);
    assert!(reopens >= 1);
    assert_eq!(opener.opens(), reopens + 1);
    assert_eq!(source.stats().reconnects, reopens as u64);

    // Reopens are spaced by at least one window, so the flood cannot exceed
    // one attempt per window.
    let opened_at = opener.opened_at();
    for pair in opened_at[1..].windows(2) {
        assert!(pair[1] - pair[0] >= base_delay);
    }
    assert!(reopens as u128 <= flood_for.as_millis() / base_delay.as_millis());

    source.release();
}
