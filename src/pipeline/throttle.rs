use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::CaptureSettings;

/// Rate limits and deduplicates captures by track identity.
///
/// A capture is allowed when the confidence reaches the capture threshold, the
/// track has not been captured yet, and the cooldown since the last successful
/// capture of any subject has passed. Only `record` marks a capture as done, so
/// a failed store leaves the track eligible.
pub struct CaptureThrottler {
    min_confidence: f32,
    cooldown: Duration,
    retention: Option<Duration>,
    captured: HashMap<u32, Instant>,
    last_capture: Option<Instant>,
}

impl CaptureThrottler {
    pub fn new(settings: &CaptureSettings) -> Self {
        Self {
            min_confidence: settings.min_confidence,
            cooldown: settings.cooldown,
            retention: settings.dedup_retention,
            captured: HashMap::new(),
            last_capture: None,
        }
    }

    pub fn should_capture(&self, track_id: u32, confidence: f32, now: Instant) -> bool {
        if confidence < self.min_confidence || self.captured.contains_key(&track_id) {
            return false;
        }
        match self.last_capture {
            Some(last) => now.saturating_duration_since(last) >= self.cooldown,
            None => true,
        }
    }

    pub fn record(&mut self, track_id: u32, now: Instant) {
        self.captured.insert(track_id, now);
        self.last_capture = Some(now);
    }

    /// Forget tracks captured longer ago than the retention window. Returns how many were dropped.
    pub fn prune(&mut self, now: Instant) -> usize {
        let Some(retention) = self.retention else {
            return 0;
        };
        let before = self.captured.len();
        self.captured
            .retain(|_, at| now.saturating_duration_since(*at) < retention);
        self.captured.shrink_to_fit();
        before - self.captured.len()
    }

    pub fn captured_count(&self) -> usize {
        self.captured.len()
    }

    pub fn is_captured(&self, track_id: u32) -> bool {
        self.captured.contains_key(&track_id)
    }
}
