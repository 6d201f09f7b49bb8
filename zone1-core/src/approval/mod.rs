//! Ephemeral, TTL-based human approval lifecycle.
//!
//! Pending approvals live only in memory; a background poller expires
//! stale entries. Nothing here is persisted across restarts - a crash
//! simply drops in-flight approvals, which is the accepted tradeoff for a
//! 300 s-lived workflow.

pub mod types;

use crate::error::{ExecutorError, ExecutorResult};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub use types::{ApprovalChannel, ApprovalRequest, ApprovalStatus};

type DecisionCallback = dyn Fn(&ApprovalRequest, bool) + Send + Sync;

struct State {
    pending: HashMap<String, ApprovalRequest>,
}

pub struct ApprovalManager {
    channel: Arc<dyn ApprovalChannel>,
    state: Mutex<State>,
    expiry: ChronoDuration,
    sequence: AtomicU64,
    on_decision: Mutex<Option<Box<DecisionCallback>>>,
}

impl ApprovalManager {
    pub fn new(channel: Arc<dyn ApprovalChannel>, expiry_secs: i64) -> Self {
        Self {
            channel,
            state: Mutex::new(State {
                pending: HashMap::new(),
            }),
            expiry: ChronoDuration::seconds(expiry_secs),
            sequence: AtomicU64::new(0),
            on_decision: Mutex::new(None),
        }
    }

    /// Invoked when a pending approval reaches a terminal state, with the
    /// approve/reject outcome. Routes back into the execute path for
    /// approvals, or emits `ACTION_REJECTED` for the rest.
    pub fn set_on_decision(&self, callback: Box<DecisionCallback>) {
        *self.on_decision.lock().expect("approval manager mutex poisoned") = Some(callback);
    }

    fn allocate_id(&self, action: &str) -> String {
        let now = Utc::now();
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        if seq == 0 {
            format!("approval_{}_{}", now.format("%Y%m%d%H%M%S"), action)
        } else {
            format!("approval_{}_{}_{}", now.format("%Y%m%d%H%M%S"), action, seq)
        }
    }

    /// Creates a pending approval, sends the out-of-band confirmation
    /// message, and stores the resulting chat/message correlation.
    pub async fn create(&self, action: &str, params: Value, requester: &str) -> ExecutorResult<ApprovalRequest> {
        let now = Utc::now();
        let approval_id = self.allocate_id(action);

        let mut request = ApprovalRequest {
            approval_id: approval_id.clone(),
            action: action.to_string(),
            params,
            requester: requester.to_string(),
            created_at: now,
            expires_at: now + self.expiry,
            status: ApprovalStatus::Pending,
            chat_id: None,
            message_id: None,
            decider: None,
            decided_at: None,
        };

        let (chat_id, message_id) = self.channel.send_request(&request).await?;
        request.chat_id = Some(chat_id);
        request.message_id = Some(message_id);

        let mut state = self.state.lock().expect("approval manager mutex poisoned");
        state.pending.insert(approval_id, request.clone());
        Ok(request)
    }

    pub fn get(&self, approval_id: &str) -> Option<ApprovalRequest> {
        self.state.lock().expect("approval manager mutex poisoned").pending.get(approval_id).cloned()
    }

    /// Number of approvals currently awaiting a decision. Reported in the
    /// `status` snapshot.
    pub fn pending_count(&self) -> usize {
        self.state.lock().expect("approval manager mutex poisoned").pending.len()
    }

    /// Terminal response to a pending approval from the out-of-band
    /// channel. Removes the entry and invokes the on-decision callback.
    pub async fn respond(&self, approval_id: &str, approved: bool, decider: &str) -> ExecutorResult<ApprovalRequest> {
        let mut request = {
            let mut state = self.state.lock().expect("approval manager mutex poisoned");
            state
                .pending
                .remove(approval_id)
                .ok_or_else(|| ExecutorError::NotFound(format!("approval '{approval_id}' not pending")))?
        };

        request.status = if approved { ApprovalStatus::Approved } else { ApprovalStatus::Rejected };
        request.decider = Some(decider.to_string());
        request.decided_at = Some(Utc::now());

        if let (Some(chat_id), Some(message_id)) = (&request.chat_id, &request.message_id) {
            if let Err(e) = self.channel.edit_status(chat_id, message_id, &request).await {
                warn!(error = %e, "failed to edit approval message");
            }
        }

        self.invoke_on_decision(&request, approved);
        Ok(request)
    }

    /// Removes a still-pending approval without invoking the on-decision
    /// callback - a distinct terminal path from rejection, for operator
    /// tooling.
    pub async fn cancel(&self, approval_id: &str) -> ExecutorResult<ApprovalRequest> {
        let mut request = {
            let mut state = self.state.lock().expect("approval manager mutex poisoned");
            state
                .pending
                .remove(approval_id)
                .ok_or_else(|| ExecutorError::NotFound(format!("approval '{approval_id}' not pending")))?
        };

        request.status = ApprovalStatus::Cancelled;
        request.decided_at = Some(Utc::now());

        if let (Some(chat_id), Some(message_id)) = (&request.chat_id, &request.message_id) {
            if let Err(e) = self.channel.edit_status(chat_id, message_id, &request).await {
                warn!(error = %e, "failed to edit cancelled approval message");
            }
        }

        Ok(request)
    }

    /// Removes a pending approval without editing the out-of-band message
    /// or invoking the on-decision callback. Used when a client executes
    /// directly against an `approval_id` it already holds, bypassing the
    /// `approval_response` flow entirely.
    pub fn consume(&self, approval_id: &str) -> Option<ApprovalRequest> {
        self.state.lock().expect("approval manager mutex poisoned").pending.remove(approval_id)
    }

    fn invoke_on_decision(&self, request: &ApprovalRequest, approved: bool) {
        let callback = self.on_decision.lock().expect("approval manager mutex poisoned");
        if let Some(callback) = callback.as_ref() {
            callback(request, approved);
        }
    }

    /// Scans pending entries for those past expiry, transitioning each to
    /// `EXPIRED`, editing its out-of-band message, and invoking the
    /// on-decision callback with `approved=false`. Intended to run
    /// periodically from a background task for the process lifetime.
    pub async fn sweep_expired(&self) -> Vec<ApprovalRequest> {
        let now = Utc::now();
        let expired_ids: Vec<String> = {
            let state = self.state.lock().expect("approval manager mutex poisoned");
            state
                .pending
                .iter()
                .filter(|(_, r)| r.expires_at <= now)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut expired = Vec::new();
        for id in expired_ids {
            let mut request = {
                let mut state = self.state.lock().expect("approval manager mutex poisoned");
                match state.pending.remove(&id) {
                    Some(r) => r,
                    None => continue,
                }
            };
            request.status = ApprovalStatus::Expired;
            request.decided_at = Some(now);

            if let (Some(chat_id), Some(message_id)) = (&request.chat_id, &request.message_id) {
                if let Err(e) = self.channel.edit_status(chat_id, message_id, &request).await {
                    warn!(error = %e, "failed to edit expired approval message");
                }
            }

            info!(approval_id = %request.approval_id, "approval expired");
            self.invoke_on_decision(&request, false);
            expired.push(request);
        }

        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeChannel {
        sent: AsyncMutex<Vec<String>>,
    }

    impl FakeChannel {
        fn new() -> Self {
            Self {
                sent: AsyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ApprovalChannel for FakeChannel {
        async fn send_request(&self, request: &ApprovalRequest) -> ExecutorResult<(String, String)> {
            self.sent.lock().await.push(request.approval_id.clone());
            Ok(("chat-1".to_string(), format!("msg-{}", request.approval_id)))
        }

        async fn edit_status(&self, _chat_id: &str, _message_id: &str, _request: &ApprovalRequest) -> ExecutorResult<()> {
            Ok(())
        }

        async fn answer_callback(&self, _callback_id: &str) -> ExecutorResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn create_stores_pending_request_with_correlation() {
        let manager = ApprovalManager::new(Arc::new(FakeChannel::new()), 300);
        let request = manager.create("send_email", serde_json::json!({}), "agent").await.unwrap();
        assert_eq!(request.status, ApprovalStatus::Pending);
        assert!(request.chat_id.is_some());
        assert!(manager.get(&request.approval_id).is_some());
    }

    #[tokio::test]
    async fn respond_approved_removes_entry_and_invokes_callback() {
        let manager = ApprovalManager::new(Arc::new(FakeChannel::new()), 300);
        let invoked = Arc::new(AtomicBool::new(false));
        let invoked2 = invoked.clone();
        manager.set_on_decision(Box::new(move |_req, approved| {
            invoked2.store(approved, Ordering::SeqCst);
        }));

        let request = manager.create("send_email", serde_json::json!({}), "agent").await.unwrap();
        let result = manager.respond(&request.approval_id, true, "admin").await.unwrap();

        assert_eq!(result.status, ApprovalStatus::Approved);
        assert!(manager.get(&request.approval_id).is_none());
        assert!(invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn respond_to_unknown_id_errors() {
        let manager = ApprovalManager::new(Arc::new(FakeChannel::new()), 300);
        let result = manager.respond("nonexistent", true, "admin").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancel_does_not_invoke_on_decision() {
        let manager = ApprovalManager::new(Arc::new(FakeChannel::new()), 300);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        manager.set_on_decision(Box::new(move |_req, _approved| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));

        let request = manager.create("send_email", serde_json::json!({}), "agent").await.unwrap();
        let result = manager.cancel(&request.approval_id).await.unwrap();
        assert_eq!(result.status, ApprovalStatus::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sweep_expired_transitions_and_invokes_callback_with_false() {
        let manager = ApprovalManager::new(Arc::new(FakeChannel::new()), -1);
        let invoked = Arc::new(AtomicBool::new(true));
        let invoked2 = invoked.clone();
        manager.set_on_decision(Box::new(move |_req, approved| {
            invoked2.store(approved, Ordering::SeqCst);
        }));

        let request = manager.create("send_email", serde_json::json!({}), "agent").await.unwrap();
        let expired = manager.sweep_expired().await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].approval_id, request.approval_id);
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn distinct_approvals_get_distinct_ids() {
        let manager = ApprovalManager::new(Arc::new(FakeChannel::new()), 300);
        let a = manager.create("send_email", serde_json::json!({}), "agent").await.unwrap();
        let b = manager.create("send_email", serde_json::json!({}), "agent").await.unwrap();
        assert_ne!(a.approval_id, b.approval_id);
    }
}
