use std::time::Instant;

/// Instantaneous frames-per-second from the gap between consecutive updates.
#[derive(Debug, Default)]
pub struct FpsTracker {
    previous: Option<Instant>,
    fps: f64,
}

impl FpsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame at `now`. The first call reports 0.
    pub fn update(&mut self, now: Instant) -> f64 {
        if let Some(previous) = self.previous {
            let gap = now.saturating_duration_since(previous).as_secs_f64();
            if gap > 0.0 {
                self.fps = 1.0 / gap;
            }
        }
        self.previous = Some(now);
        self.fps
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }
}
