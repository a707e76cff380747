use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// Monotonic run clock with cancellable waits.
///
/// Timestamps are offsets from the clock's epoch, so clones share one
/// time base and can exchange timestamps freely.
pub trait Timer: Clone + Send + Sync {
    fn now(&self) -> Duration;

    fn elapsed(&self, ts: Duration) -> Duration {
        self.now().saturating_sub(ts)
    }

    fn now_secs(&self) -> f64 {
        self.now().as_secs_f64()
    }

    /// Resolves once the clock reaches `deadline`. Dropping the future
    /// cancels the wait.
    fn sleep_until(&self, deadline: Duration) -> Sleep;

    fn sleep(&self, d: Duration) -> Sleep {
        self.sleep_until(self.now() + d)
    }

    /// Records how late a wait woke up relative to its deadline.
    fn record_wait(&mut self, requested: Duration, actual: Duration);
    fn timing_stats(&self) -> TimingStats;
    fn reset_stats(&mut self);
}

/// Wake-up lateness across recorded waits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimingStats {
    pub waits: usize,
    pub mean_overshoot_ns: f64,
    pub jitter_ns: f64,
    pub max_overshoot_ns: f64,
}

#[derive(Debug, Clone)]
pub struct TokioTimer {
    pub start: Instant,
    pub overshoots: VecDeque<Duration>,
    pub max_samples: usize,
}

impl Timer for TokioTimer {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep_until(&self, deadline: Duration) -> Sleep {
        tokio::time::sleep_until(self.start + deadline)
    }

    fn record_wait(&mut self, requested: Duration, actual: Duration) {
        if self.overshoots.len() >= self.max_samples {
            self.overshoots.pop_front();
        }
        self.overshoots.push_back(actual.saturating_sub(requested));
    }

    fn timing_stats(&self) -> TimingStats {
        if self.overshoots.is_empty() {
            return TimingStats::default();
        }
        let times: Vec<f64> = self
            .overshoots
            .iter()
            .map(|d| d.as_nanos() as f64)
            .collect();
        let n = times.len() as f64;
        let avg = times.iter().sum::<f64>() / n;
        let var = times.iter().map(|x| (x - avg).powi(2)).sum::<f64>() / n;
        let max = times.iter().copied().fold(0.0, f64::max);
        TimingStats {
            waits: times.len(),
            mean_overshoot_ns: avg,
            jitter_ns: var.sqrt(),
            max_overshoot_ns: max,
        }
    }

    fn reset_stats(&mut self) {
        self.overshoots.clear();
    }
}

impl TokioTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            overshoots: VecDeque::with_capacity(1000),
            max_samples: 1000,
        }
    }
}

impl Default for TokioTimer {
    fn default() -> Self {
        Self::new()
    }
}
