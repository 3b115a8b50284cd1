//! Per-session variable-difficulty controller.
//!
//! Targets one accepted share every ~20 seconds, measured against a ring of
//! the last 16 submission timestamps. These constants (`K`, `TARGET_RATE_HZ`)
//! are an implementation choice within the allowed `[5, 60]` second range;
//! logged once at session start so operators can see what cadence a deployed
//! pool is tuned for.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Ring buffer size: number of recent share timestamps the controller keeps.
pub const K: usize = 16;
/// Target share rate: one accepted share every 20 seconds.
pub const TARGET_RATE_HZ: f64 = 1.0 / 20.0;
/// Upper clamp on suggested difficulty.
pub const MAX_DIFFICULTY: f64 = 4_294_967_296.0; // 2^32

pub struct Vardiff {
    timestamps: Mutex<VecDeque<u32>>,
}

impl Vardiff {
    pub fn new() -> Self {
        Self { timestamps: Mutex::new(VecDeque::with_capacity(K)) }
    }

    /// Records an accepted share's timestamp.
    pub fn record_share(&self, timestamp: u32) {
        let mut ts = self.timestamps.lock().unwrap();
        if ts.len() == K {
            ts.pop_front();
        }
        ts.push_back(timestamp);
    }

    /// Suggests a new difficulty given the session's `current` difficulty
    /// and a `floor` (the miner-suggested difficulty, if any, else a pool
    /// minimum). Returns `None` while fewer than `K` samples have been
    /// recorded. Idempotent: calling again without a new `record_share`
    /// returns the same value, since it only reads the ring.
    pub fn suggest(&self, current: f64, floor: f64) -> Option<f64> {
        let ts = self.timestamps.lock().unwrap();
        if ts.len() < K {
            return None;
        }
        let window_seconds = (*ts.back().unwrap() as f64 - *ts.front().unwrap() as f64).max(1.0);
        let observed_rate = (K as f64) / window_seconds;
        let raw = current * observed_rate / TARGET_RATE_HZ;
        let snapped = snap_to_power_of_two(raw);
        Some(snapped.clamp(floor, MAX_DIFFICULTY))
    }
}

impl Default for Vardiff {
    fn default() -> Self {
        Self::new()
    }
}

fn snap_to_power_of_two(x: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    2f64.powf(x.log2().round())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_none_before_k_samples() {
        let v = Vardiff::new();
        for t in 0..K as u32 - 1 {
            v.record_share(t * 5);
        }
        assert_eq!(v.suggest(16384.0, 1.0), None);
    }

    #[test]
    fn sixteen_samples_at_five_seconds_quadruples_difficulty() {
        // Scenario 7: 16 timestamps 5s apart ⇒ observed rate is 4x the
        // 20s target, snapping the suggestion to `current * 4`.
        let v = Vardiff::new();
        for i in 0..K as u32 {
            v.record_share(i * 5);
        }
        let suggestion = v.suggest(1024.0, 1.0).unwrap();
        assert_eq!(suggestion, 4096.0);
    }

    #[test]
    fn idempotent_without_new_samples() {
        let v = Vardiff::new();
        for i in 0..K as u32 {
            v.record_share(i * 5);
        }
        let first = v.suggest(1024.0, 1.0);
        let second = v.suggest(1024.0, 1.0);
        assert_eq!(first, second);
    }

    #[test]
    fn clamps_to_floor_and_ceiling() {
        let v = Vardiff::new();
        for i in 0..K as u32 {
            // Very slow cadence ⇒ suggestion would drop below the floor.
            v.record_share(i * 1000);
        }
        let suggestion = v.suggest(1024.0, 512.0).unwrap();
        assert!(suggestion >= 512.0);
    }
}
