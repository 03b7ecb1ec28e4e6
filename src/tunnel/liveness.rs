//! Peer liveness tracking from heartbeat arrivals

use std::time::{Duration, Instant};

/// Observes heartbeat arrivals and flags silence past a threshold
#[derive(Debug)]
pub struct LivenessMonitor {
    threshold: Duration,
    last_heartbeat: Instant,
    flagged: bool,
}

impl LivenessMonitor {
    /// Start monitoring as if a heartbeat arrived at `now`
    pub fn new(now: Instant, threshold: Duration) -> Self {
        Self {
            threshold,
            last_heartbeat: now,
            flagged: false,
        }
    }

    /// Record a heartbeat. Returns true if the peer was flagged unreachable.
    pub fn record(&mut self, now: Instant) -> bool {
        self.last_heartbeat = now;
        std::mem::replace(&mut self.flagged, false)
    }

    /// Check for silence; yields the silence duration once per crossing
    pub fn check(&mut self, now: Instant) -> Option<Duration> {
        let silent_for = now.saturating_duration_since(self.last_heartbeat);
        if self.flagged || silent_for <= self.threshold {
            return None;
        }
        self.flagged = true;
        Some(silent_for)
    }

    pub fn is_flagged(&self) -> bool {
        self.flagged
    }
}
