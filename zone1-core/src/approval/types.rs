use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::ExecutorResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub action: String,
    pub params: Value,
    pub requester: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    /// Out-of-band correlation (chat id, message id) with the confirmation
    /// channel, filled in once `send_request` returns.
    pub chat_id: Option<String>,
    pub message_id: Option<String>,
    pub decider: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// Out-of-band confirmation channel (a chat bot). The approval manager
/// drives an admin chat through this trait; the default production adapter
/// (out of scope here) would implement it against a real chat API.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Sends the initial approval prompt; returns `(chat_id, message_id)`
    /// for later correlation.
    async fn send_request(&self, request: &ApprovalRequest) -> ExecutorResult<(String, String)>;

    /// Edits the original message to reflect a terminal status.
    async fn edit_status(&self, chat_id: &str, message_id: &str, request: &ApprovalRequest) -> ExecutorResult<()>;

    /// Answers an inbound callback to dismiss the client-side spinner.
    async fn answer_callback(&self, callback_id: &str) -> ExecutorResult<()>;
}
