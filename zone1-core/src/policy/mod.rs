//! Static action descriptor table and the rate-limiting policy engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApprovalLevel {
    None,
    Notify,
    Approve,
}

/// Static per-action descriptor. The table itself is data, not a match
/// statement, so overrides could in principle be loaded from configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ActionPolicy {
    pub action: &'static str,
    pub approval_level: ApprovalLevel,
    /// `"<count>/<window>"`, e.g. `"10/hour"`.
    pub rate_cap: &'static str,
    pub description: &'static str,
}

impl ActionPolicy {
    fn rate_cap_parts(&self) -> (u32, Duration) {
        let (count, window) = self
            .rate_cap
            .split_once('/')
            .expect("rate_cap is always of the form <count>/<window>");
        let count: u32 = count.parse().expect("rate_cap count is always numeric");
        let window = match window {
            "hour" => Duration::from_secs(3600),
            "minute" => Duration::from_secs(60),
            "second" => Duration::from_secs(1),
            "day" => Duration::from_secs(86400),
            other => panic!("unrecognized rate_cap window: {other}"),
        };
        (count, window)
    }
}

/// Compiled-in default descriptor table.
pub const ALLOWED_ACTIONS: &[ActionPolicy] = &[
    ActionPolicy {
        action: "send_email",
        approval_level: ApprovalLevel::Approve,
        rate_cap: "10/hour",
        description: "Send email via Gmail API",
    },
    ActionPolicy {
        action: "send_telegram",
        approval_level: ApprovalLevel::Approve,
        rate_cap: "50/hour",
        description: "Send Telegram message",
    },
    ActionPolicy {
        action: "send_slack",
        approval_level: ApprovalLevel::Approve,
        rate_cap: "50/hour",
        description: "Send Slack message",
    },
    ActionPolicy {
        action: "make_call",
        approval_level: ApprovalLevel::Approve,
        rate_cap: "5/hour",
        description: "Make phone call via Twilio",
    },
    ActionPolicy {
        action: "send_sms",
        approval_level: ApprovalLevel::Approve,
        rate_cap: "20/hour",
        description: "Send SMS via Twilio",
    },
    ActionPolicy {
        action: "read_email",
        approval_level: ApprovalLevel::None,
        rate_cap: "100/hour",
        description: "Read emails (no approval needed)",
    },
    ActionPolicy {
        action: "read_telegram",
        approval_level: ApprovalLevel::None,
        rate_cap: "100/hour",
        description: "Read Telegram messages",
    },
    ActionPolicy {
        action: "read_slack",
        approval_level: ApprovalLevel::None,
        rate_cap: "100/hour",
        description: "Read Slack messages",
    },
];

pub fn find_action(action: &str) -> Option<&'static ActionPolicy> {
    ALLOWED_ACTIONS.iter().find(|p| p.action == action)
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub requires_approval: bool,
    pub approval_level: Option<ApprovalLevel>,
    pub description: Option<&'static str>,
    pub error: Option<&'static str>,
    pub message: Option<String>,
}

impl PolicyDecision {
    fn denied(error: &'static str, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            requires_approval: false,
            approval_level: None,
            description: None,
            error: Some(error),
            message: Some(message.into()),
        }
    }
}

/// Sliding-window rate counter per action, distinct from the anomaly
/// detector's 60 s window: this one spans the descriptor's own rate-cap
/// window (e.g. an hour), and backs the policy engine's hourly budget
/// rather than burst detection.
#[derive(Default)]
struct RateCounters {
    windows: HashMap<&'static str, Vec<Instant>>,
}

/// Evaluates `(action, params)` against the static descriptor table plus an
/// internal sliding-window rate counter.
pub struct PolicyEngine {
    counters: Mutex<RateCounters>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(RateCounters::default()),
        }
    }

    /// Decision order: (1) action must exist in the descriptor table, (2)
    /// the rate cap must not be exceeded, (3) return allowed with the
    /// descriptor's approval level.
    pub fn check_action(&self, action: &str) -> PolicyDecision {
        let Some(policy) = find_action(action) else {
            return PolicyDecision::denied(
                "action_not_allowed",
                format!("Action '{action}' is not in the allowed actions list"),
            );
        };

        let (cap, window) = policy.rate_cap_parts();
        let mut counters = self.counters.lock().expect("policy engine mutex poisoned");
        let bucket = counters.windows.entry(policy.action).or_default();

        let now = Instant::now();
        bucket.retain(|t| now.duration_since(*t) < window);

        if bucket.len() as u32 >= cap {
            return PolicyDecision::denied(
                "rate_limited",
                format!("Rate limit exceeded for '{action}': {cap} per {}", policy.rate_cap),
            );
        }

        bucket.push(now);

        PolicyDecision {
            allowed: true,
            requires_approval: matches!(policy.approval_level, ApprovalLevel::Approve),
            approval_level: Some(policy.approval_level),
            description: Some(policy.description),
            error: None,
            message: None,
        }
    }

    /// Validates only that `action` exists in the descriptor table,
    /// without touching the rate counter. Used at execute time: the
    /// hourly rate cap was already spent against at request time, and
    /// re-applying it here would deny bursty-but-within-hourly-budget
    /// executes before the anomaly detector - whose job this is (§4.3) -
    /// ever gets a chance to see them.
    pub fn validate_action_exists(&self, action: &str) -> PolicyDecision {
        let Some(policy) = find_action(action) else {
            return PolicyDecision::denied(
                "action_not_allowed",
                format!("Action '{action}' is not in the allowed actions list"),
            );
        };

        PolicyDecision {
            allowed: true,
            requires_approval: matches!(policy.approval_level, ApprovalLevel::Approve),
            approval_level: Some(policy.approval_level),
            description: Some(policy.description),
            error: None,
            message: None,
        }
    }

    /// Clears every action's rate counter. Used by operational tooling and
    /// tests; not exposed over the wire protocol.
    pub fn reset_rate_limits(&self) {
        let mut counters = self.counters.lock().expect("policy engine mutex poisoned");
        counters.windows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_action_is_denied() {
        let engine = PolicyEngine::new();
        let decision = engine.check_action("delete_all_data");
        assert!(!decision.allowed);
        assert_eq!(decision.error, Some("action_not_allowed"));
    }

    #[test]
    fn none_level_action_does_not_require_approval() {
        let engine = PolicyEngine::new();
        let decision = engine.check_action("read_email");
        assert!(decision.allowed);
        assert!(!decision.requires_approval);
    }

    #[test]
    fn approve_level_action_requires_approval() {
        let engine = PolicyEngine::new();
        let decision = engine.check_action("send_email");
        assert!(decision.allowed);
        assert!(decision.requires_approval);
    }

    #[test]
    fn rate_cap_is_enforced_within_window() {
        let engine = PolicyEngine::new();
        for _ in 0..5 {
            let decision = engine.check_action("make_call");
            assert!(decision.allowed);
        }
        let decision = engine.check_action("make_call");
        assert!(!decision.allowed);
        assert_eq!(decision.error, Some("rate_limited"));
    }

    #[test]
    fn reset_rate_limits_clears_counters() {
        let engine = PolicyEngine::new();
        for _ in 0..5 {
            engine.check_action("make_call");
        }
        assert!(!engine.check_action("make_call").allowed);
        engine.reset_rate_limits();
        assert!(engine.check_action("make_call").allowed);
    }
}
