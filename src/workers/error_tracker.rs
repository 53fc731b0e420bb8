use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

/// Sliding-window failure counter for one language pool. Once the number of
/// failures inside the window reaches the threshold the pool stops
/// restarting workers until the pool is rebuilt.
#[derive(Debug)]
pub struct WorkerErrorTracker {
    window: Duration,
    threshold: usize,
    failures: VecDeque<Instant>,
}

impl WorkerErrorTracker {
    pub fn new(window: Duration, process_count: usize) -> Self {
        Self {
            window,
            threshold: 3 * process_count.max(1),
            failures: VecDeque::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Records a failure at `now`; returns true when the breaker trips.
    pub fn record(&mut self, now: Instant) -> bool {
        self.evict(now);
        self.failures.push_back(now);
        self.failures.len() >= self.threshold
    }

    fn evict(&mut self, now: Instant) {
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}
