//! Global, idempotent kill switch plus the sentinel-file watcher that can
//! trigger it out of band.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

const KILL_WORDS: &[&str] = &["KILLSWITCH", "EMERGENCY_STOP", "HALT_ALL"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillReason {
    Manual,
    AnomalyDetected,
    RateLimitExceeded,
    SecurityBreach,
    RemoteCommand,
    FileTrigger,
}

impl KillReason {
    pub fn from_str_default(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "anomaly_detected" => Self::AnomalyDetected,
            "rate_limit_exceeded" => Self::RateLimitExceeded,
            "security_breach" => Self::SecurityBreach,
            "remote_command" => Self::RemoteCommand,
            "file_trigger" => Self::FileTrigger,
            _ => Self::Manual,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillEvent {
    pub timestamp: DateTime<Utc>,
    pub reason: KillReason,
    pub details: String,
    pub triggered_by: String,
}

/// Normalizes a candidate string the same way the kill-word scan does:
/// upper-cased, whitespace folded to underscores.
fn normalize(s: &str) -> String {
    s.to_ascii_uppercase().split_whitespace().collect::<Vec<_>>().join("_")
}

/// Returns true if `text` contains any kill-word literal once normalized.
pub fn contains_kill_word(text: &str) -> bool {
    let normalized = normalize(text);
    KILL_WORDS.iter().any(|w| normalized.contains(w))
}

struct State {
    killed: bool,
    event: Option<KillEvent>,
}

/// Global single-shot kill state. Trigger is idempotent: repeated triggers
/// return the first event, never overwriting it.
pub struct KillSwitch {
    state: Mutex<State>,
    marker_path: PathBuf,
    armed: AtomicBool,
    on_kill: Mutex<Vec<Box<dyn Fn(&KillEvent) + Send + Sync>>>,
}

impl KillSwitch {
    pub fn new(marker_path: impl Into<PathBuf>) -> Self {
        Self {
            state: Mutex::new(State {
                killed: false,
                event: None,
            }),
            marker_path: marker_path.into(),
            armed: AtomicBool::new(true),
            on_kill: Mutex::new(Vec::new()),
        }
    }

    pub fn is_killed(&self) -> bool {
        self.state.lock().expect("kill switch mutex poisoned").killed
    }

    pub fn status(&self) -> (bool, Option<KillEvent>) {
        let state = self.state.lock().expect("kill switch mutex poisoned");
        (state.killed, state.event.clone())
    }

    /// Register a callback invoked exactly once, outside the state mutex,
    /// on the trigger that actually flips the switch.
    pub fn on_shutdown(&self, callback: Box<dyn Fn(&KillEvent) + Send + Sync>) {
        self.on_kill.lock().expect("kill switch callback mutex poisoned").push(callback);
    }

    /// Trigger the switch. Idempotent - if already killed, returns the
    /// existing event without re-running callbacks or rewriting the marker.
    pub fn trigger(&self, reason: KillReason, details: impl Into<String>, triggered_by: impl Into<String>) -> KillEvent {
        let details = details.into();
        let triggered_by = triggered_by.into();

        let event = {
            let mut state = self.state.lock().expect("kill switch mutex poisoned");
            if let Some(existing) = &state.event {
                return existing.clone();
            }
            let event = KillEvent {
                timestamp: Utc::now(),
                reason,
                details,
                triggered_by,
            };
            state.killed = true;
            state.event = Some(event.clone());
            event
        };

        warn!(reason = ?event.reason, "kill switch triggered");

        if let Err(e) = self.write_marker(&event) {
            warn!(error = %e, "failed to write kill marker file");
        }

        let callbacks = self.on_kill.lock().expect("kill switch callback mutex poisoned");
        for callback in callbacks.iter() {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&event))).is_err() {
                warn!("kill switch shutdown callback panicked");
            }
        }

        event
    }

    fn write_marker(&self, event: &KillEvent) -> std::io::Result<()> {
        let content = format!(
            "KILLED: true\nTIME: {}\nBY: {}\nDETAILS: {}\nREASON: {:?}\n",
            event.timestamp.to_rfc3339(),
            event.triggered_by,
            event.details,
            event.reason,
        );
        fs::write(&self.marker_path, content)
    }

    /// Clears state and removes the marker file. Requires an explicit,
    /// authorized call - never invoked automatically.
    pub fn reset(&self) -> std::io::Result<()> {
        let mut state = self.state.lock().expect("kill switch mutex poisoned");
        state.killed = false;
        state.event = None;
        if self.marker_path.exists() {
            fs::remove_file(&self.marker_path)?;
        }
        info!("kill switch reset");
        Ok(())
    }

    /// Screens an inbound message body for kill words, triggering if found.
    pub fn check_message_for_kill(&self, message: &str) -> bool {
        if contains_kill_word(message) {
            self.trigger(KillReason::RemoteCommand, message.to_string(), "message_screen");
            true
        } else {
            false
        }
    }

    fn marker_contains_kill_word(path: &Path) -> bool {
        fs::read_to_string(path).map(|c| contains_kill_word(&c)).unwrap_or(false)
    }

    /// Poll the marker path at `interval`, triggering on first sighting of a
    /// kill word. Intended to run as a background task for the lifetime of
    /// the process; stops polling once `armed` is cleared (e.g. on shutdown).
    pub async fn watch_kill_file(self: std::sync::Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        while self.armed.load(Ordering::Relaxed) {
            ticker.tick().await;
            if self.is_killed() {
                continue;
            }
            if self.marker_path.exists() && Self::marker_contains_kill_word(&self.marker_path) {
                self.trigger(KillReason::FileTrigger, "sentinel file detected", "file_watcher");
            }
        }
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_trigger_sets_killed_and_writes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("kill-marker");
        let switch = KillSwitch::new(&marker);

        assert!(!switch.is_killed());
        let event = switch.trigger(KillReason::Manual, "test", "operator");
        assert!(switch.is_killed());
        assert_eq!(event.reason, KillReason::Manual);
        assert!(marker.exists());
    }

    #[test]
    fn repeated_trigger_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(dir.path().join("kill-marker"));

        let first = switch.trigger(KillReason::Manual, "first", "a");
        let second = switch.trigger(KillReason::AnomalyDetected, "second", "b");
        assert_eq!(first.timestamp, second.timestamp);
        assert_eq!(second.reason, KillReason::Manual);
    }

    #[test]
    fn reset_clears_state_and_removes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("kill-marker");
        let switch = KillSwitch::new(&marker);

        switch.trigger(KillReason::Manual, "test", "operator");
        assert!(marker.exists());
        switch.reset().unwrap();
        assert!(!switch.is_killed());
        assert!(!marker.exists());
    }

    #[test]
    fn shutdown_callbacks_fire_once_on_first_trigger() {
        use std::sync::atomic::{AtomicUsize, Ordering as O};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(dir.path().join("kill-marker"));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        switch.on_shutdown(Box::new(move |_| {
            calls2.fetch_add(1, O::SeqCst);
        }));

        switch.trigger(KillReason::Manual, "a", "x");
        switch.trigger(KillReason::Manual, "b", "y");
        assert_eq!(calls.load(O::SeqCst), 1);
    }

    #[test]
    fn message_screening_detects_kill_words_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(dir.path().join("kill-marker"));
        assert!(switch.check_message_for_kill("please halt all operations now"));
        assert!(switch.is_killed());
    }

    #[test]
    fn benign_message_does_not_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(dir.path().join("kill-marker"));
        assert!(!switch.check_message_for_kill("send the weekly report"));
        assert!(!switch.is_killed());
    }
}
