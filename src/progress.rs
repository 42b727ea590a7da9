//! Throughput and ETA from cumulative byte counters

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rate derived from the last two observations of one job or item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSample {
    pub speed: f64, // bytes per second
    /// `None` while the speed is unknown or zero.
    pub eta_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    bytes: u64,
    at: Instant,
}

/// Last observation per id. Entries are seeded on first sight and dropped
/// with [`ProgressTracker::forget`] when the job or item goes terminal.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_at(
        &self,
        id: &str,
        transferred: u64,
        total: Option<u64>,
        now: Instant,
    ) -> ProgressSample {
        let mut checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        let Some(last) = checkpoints.get_mut(id) else {
            checkpoints.insert(
                id.to_string(),
                Checkpoint {
                    bytes: transferred,
                    at: now,
                },
            );
            return ProgressSample::default();
        };

        let elapsed = now.saturating_duration_since(last.at);
        if elapsed.is_zero() {
            return ProgressSample::default();
        }
        let delta = transferred.saturating_sub(last.bytes);
        *last = Checkpoint {
            bytes: transferred.max(last.bytes),
            at: now,
        };

        let speed = delta as f64 / elapsed.as_secs_f64();
        ProgressSample {
            speed,
            eta_seconds: eta(speed, transferred, total),
        }
    }

    /// Throttled observation: `None` when the previous one for `id` is
    /// younger than `interval`, unless `force` is set.
    pub fn sample_if_due(
        &self,
        id: &str,
        transferred: u64,
        total: Option<u64>,
        interval: Duration,
        force: bool,
    ) -> Option<ProgressSample> {
        self.sample_if_due_at(id, transferred, total, interval, force, Instant::now())
    }

    pub(crate) fn sample_if_due_at(
        &self,
        id: &str,
        transferred: u64,
        total: Option<u64>,
        interval: Duration,
        force: bool,
        now: Instant,
    ) -> Option<ProgressSample> {
        if !force {
            let checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(last) = checkpoints.get(id) {
                if now.saturating_duration_since(last.at) < interval {
                    return None;
                }
            }
        }
        Some(self.observe_at(id, transferred, total, now))
    }

    pub fn forget(&self, id: &str) {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

fn eta(speed: f64, transferred: u64, total: Option<u64>) -> Option<u64> {
    let total = total?;
    if !speed.is_finite() || speed <= 0.0 {
        return None;
    }
    let remaining = total.saturating_sub(transferred);
    Some((remaining as f64 / speed).ceil() as u64)
}
