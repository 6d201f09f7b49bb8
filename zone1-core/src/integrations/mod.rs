//! Trait boundary between the executor and the outside world. The executor
//! never talks to Gmail/Telegram/Slack/Twilio directly - it calls one
//! method per supported action on this trait, and a concrete adapter (out
//! of scope here) fulfills it.

use crate::approval::types::{ApprovalChannel, ApprovalRequest};
use crate::error::ExecutorResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

pub type Params = HashMap<String, Value>;
pub type Credentials = HashMap<String, String>;

/// One method per supported action. Each takes the resolved parameter map
/// and the decrypted credential map for that action, returning a JSON
/// result value or an integration failure.
#[async_trait]
pub trait MessagingIntegration: Send + Sync {
    async fn read_email(&self, params: &Params, creds: &Credentials) -> ExecutorResult<Value>;
    async fn send_email(&self, params: &Params, creds: &Credentials) -> ExecutorResult<Value>;
    async fn read_telegram(&self, params: &Params, creds: &Credentials) -> ExecutorResult<Value>;
    async fn send_telegram(&self, params: &Params, creds: &Credentials) -> ExecutorResult<Value>;
    async fn read_slack(&self, params: &Params, creds: &Credentials) -> ExecutorResult<Value>;
    async fn send_slack(&self, params: &Params, creds: &Credentials) -> ExecutorResult<Value>;
    async fn make_call(&self, params: &Params, creds: &Credentials) -> ExecutorResult<Value>;
    async fn send_sms(&self, params: &Params, creds: &Credentials) -> ExecutorResult<Value>;

    /// Dispatches by action name. Handler code should call this rather than
    /// matching on the action string itself.
    async fn dispatch(&self, action: &str, params: &Params, creds: &Credentials) -> ExecutorResult<Value> {
        match action {
            "read_email" => self.read_email(params, creds).await,
            "send_email" => self.send_email(params, creds).await,
            "read_telegram" => self.read_telegram(params, creds).await,
            "send_telegram" => self.send_telegram(params, creds).await,
            "read_slack" => self.read_slack(params, creds).await,
            "send_slack" => self.send_slack(params, creds).await,
            "make_call" => self.make_call(params, creds).await,
            "send_sms" => self.send_sms(params, creds).await,
            other => Err(crate::error::ExecutorError::Integration(format!(
                "no integration registered for action '{other}'"
            ))),
        }
    }
}

/// Stub integration returning a canned acknowledgement for every action.
/// Useful for local development and as the default when no real adapter is
/// configured; tests can substitute a mock that records calls.
pub struct NoopIntegration;

#[async_trait]
impl MessagingIntegration for NoopIntegration {
    async fn read_email(&self, _params: &Params, _creds: &Credentials) -> ExecutorResult<Value> {
        Ok(serde_json::json!({"status": "noop", "action": "read_email"}))
    }
    async fn send_email(&self, _params: &Params, _creds: &Credentials) -> ExecutorResult<Value> {
        Ok(serde_json::json!({"status": "noop", "action": "send_email"}))
    }
    async fn read_telegram(&self, _params: &Params, _creds: &Credentials) -> ExecutorResult<Value> {
        Ok(serde_json::json!({"status": "noop", "action": "read_telegram"}))
    }
    async fn send_telegram(&self, _params: &Params, _creds: &Credentials) -> ExecutorResult<Value> {
        Ok(serde_json::json!({"status": "noop", "action": "send_telegram"}))
    }
    async fn read_slack(&self, _params: &Params, _creds: &Credentials) -> ExecutorResult<Value> {
        Ok(serde_json::json!({"status": "noop", "action": "read_slack"}))
    }
    async fn send_slack(&self, _params: &Params, _creds: &Credentials) -> ExecutorResult<Value> {
        Ok(serde_json::json!({"status": "noop", "action": "send_slack"}))
    }
    async fn make_call(&self, _params: &Params, _creds: &Credentials) -> ExecutorResult<Value> {
        Ok(serde_json::json!({"status": "noop", "action": "make_call"}))
    }
    async fn send_sms(&self, _params: &Params, _creds: &Credentials) -> ExecutorResult<Value> {
        Ok(serde_json::json!({"status": "noop", "action": "send_sms"}))
    }
}

/// Logs approval prompts instead of driving a real chat API. Stands in
/// until a concrete adapter (Telegram, Slack, ...) is wired up; approvals
/// routed through this channel only resolve via direct `approval_response`
/// calls or expiry, never via a real human tapping a button.
pub struct LoggingApprovalChannel {
    sequence: AtomicU64,
}

impl Default for LoggingApprovalChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingApprovalChannel {
    pub fn new() -> Self {
        Self { sequence: AtomicU64::new(0) }
    }
}

#[async_trait]
impl ApprovalChannel for LoggingApprovalChannel {
    async fn send_request(&self, request: &ApprovalRequest) -> ExecutorResult<(String, String)> {
        info!(
            action = %request.action,
            approval_id = %request.approval_id,
            requester = %request.requester,
            expires_at = %request.expires_at,
            "approval requested"
        );
        let message_id = self.sequence.fetch_add(1, Ordering::SeqCst);
        Ok(("console".to_string(), message_id.to_string()))
    }

    async fn edit_status(&self, chat_id: &str, message_id: &str, request: &ApprovalRequest) -> ExecutorResult<()> {
        info!(%chat_id, %message_id, approval_id = %request.approval_id, status = ?request.status, "approval status updated");
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> ExecutorResult<()> {
        info!(%callback_id, "approval callback answered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_routes_to_the_matching_method() {
        let integration = NoopIntegration;
        let result = integration
            .dispatch("send_sms", &Params::new(), &Credentials::new())
            .await
            .unwrap();
        assert_eq!(result["action"], "send_sms");
    }

    #[tokio::test]
    async fn dispatch_rejects_unregistered_action() {
        let integration = NoopIntegration;
        let result = integration.dispatch("delete_all_data", &Params::new(), &Credentials::new()).await;
        assert!(result.is_err());
    }
}
