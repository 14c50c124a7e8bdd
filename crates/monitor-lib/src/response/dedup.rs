//! Suppression of repeated threats within a time window

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Entries kept before stale ones are swept
const SWEEP_THRESHOLD: usize = 100;

/// Remembers when each threat key was last alerted
#[derive(Debug)]
pub struct DedupCache {
    window: Duration,
    last_alerted: HashMap<String, Instant>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_alerted: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// True when `key` was alerted less than one window before `now`.
    /// Otherwise the key is recorded as alerted at `now`.
    pub fn check_and_record(&mut self, key: &str, now: Instant) -> bool {
        if let Some(last) = self.last_alerted.get(key) {
            if now.saturating_duration_since(*last) < self.window {
                return true;
            }
        }
        self.last_alerted.insert(key.to_string(), now);

        if self.last_alerted.len() > SWEEP_THRESHOLD {
            self.sweep(now);
        }
        false
    }

    /// Drop entries older than twice the window
    fn sweep(&mut self, now: Instant) {
        let horizon = self.window * 2;
        self.last_alerted
            .retain(|_, last| now.saturating_duration_since(*last) <= horizon);
    }

    pub fn len(&self) -> usize {
        self.last_alerted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_alerted.is_empty()
    }
}
