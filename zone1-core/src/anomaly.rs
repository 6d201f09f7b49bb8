//! Per-action sliding-window anomaly detector.
//!
//! Distinct from the policy engine's hourly rate cap: this window is a
//! fixed 60 s and its thresholds are hard-coded, tuned to catch burst
//! patterns rather than budget exhaustion.

use crate::kill_switch::{KillReason, KillSwitch};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

fn threshold_for(action: &str) -> u32 {
    match action {
        "send_email" => 20,
        "send_sms" => 30,
        "make_call" => 10,
        "send_telegram" => 50,
        "send_slack" => 50,
        _ => 100,
    }
}

#[derive(Default)]
struct Windows {
    by_action: HashMap<String, Vec<Instant>>,
}

/// Tracks a 60 s sliding window of execute timestamps per action and trips
/// the kill switch on burst overload.
pub struct AnomalyDetector {
    windows: Mutex<Windows>,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(Windows::default()),
        }
    }

    /// Record an execute attempt for `action`. Purges stale entries,
    /// appends the current timestamp, and compares the window length
    /// against the action's threshold. Returns `false` (and triggers the
    /// kill switch) if the threshold is exceeded; the caller must refuse
    /// the action in that case.
    pub fn check(&self, action: &str, kill_switch: &KillSwitch) -> bool {
        let threshold = threshold_for(action);
        let now = Instant::now();

        let exceeded = {
            let mut windows = self.windows.lock().expect("anomaly detector mutex poisoned");
            let bucket = windows.by_action.entry(action.to_string()).or_default();
            bucket.retain(|t| now.duration_since(*t) < WINDOW);
            bucket.push(now);
            bucket.len() as u32 > threshold
        };

        if exceeded {
            kill_switch.trigger(
                KillReason::RateLimitExceeded,
                format!("anomaly: '{action}' exceeded {threshold} calls in 60s"),
                "anomaly_detector",
            );
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn stays_within_threshold_for_low_volume_action() {
        let dir = tempfile::tempdir().unwrap();
        let kill_switch = Arc::new(KillSwitch::new(dir.path().join("kill-marker")));
        let detector = AnomalyDetector::new();
        for _ in 0..5 {
            assert!(detector.check("make_call", &kill_switch));
        }
        assert!(!kill_switch.is_killed());
    }

    #[test]
    fn exceeding_threshold_triggers_kill_switch() {
        let dir = tempfile::tempdir().unwrap();
        let kill_switch = Arc::new(KillSwitch::new(dir.path().join("kill-marker")));
        let detector = AnomalyDetector::new();

        let mut tripped = false;
        for _ in 0..15 {
            if !detector.check("make_call", &kill_switch) {
                tripped = true;
                break;
            }
        }
        assert!(tripped);
        assert!(kill_switch.is_killed());
    }

    #[test]
    fn unknown_action_uses_default_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let kill_switch = Arc::new(KillSwitch::new(dir.path().join("kill-marker")));
        let detector = AnomalyDetector::new();
        for _ in 0..50 {
            assert!(detector.check("read_slack", &kill_switch));
        }
        assert!(!kill_switch.is_killed());
    }
}
