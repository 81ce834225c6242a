use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Samples kept for the moving average.
pub const SPEED_SAMPLES: usize = 10;

/// Moving average of transfer speed over the last [`SPEED_SAMPLES`] progress samples.
#[derive(Debug, Clone, Default)]
pub struct SpeedStats {
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the download's partial size at `now`. A size below the previous sample
    /// (rollback, restart) starts a new window.
    pub fn sample(&mut self, now: Instant, partial_size: u64) {
        if let Some(&(_, last)) = self.samples.back() {
            if partial_size < last {
                self.samples.clear();
            }
        }
        self.samples.push_back((now, partial_size));
        while self.samples.len() > SPEED_SAMPLES {
            self.samples.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Bytes per second over the window, 0 with fewer than two samples.
    pub fn bytes_per_sec(&self) -> u64 {
        let (Some(&(t0, b0)), Some(&(t1, b1))) = (self.samples.front(), self.samples.back()) else {
            return 0;
        };
        let secs = t1.saturating_duration_since(t0).as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        ((b1 - b0) as f64 / secs) as u64
    }

    /// Estimated time for `remaining` bytes at the current speed.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        match self.bytes_per_sec() {
            0 => None,
            bps => Some(Duration::from_secs(remaining.div_ceil(bps))),
        }
    }
}
