//! Dispatch-by-`type` handler table. Each function maps one wire request
//! variant onto `Executor` methods and shapes the response envelope.

use super::protocol::{Request, ResponseEnvelope, ResponseStatus};
use crate::executor::{CapabilityRequestOutcome, Executor};
use crate::kill_switch::KillReason;
use std::sync::Arc;

pub async fn dispatch(executor: &Arc<Executor>, request: Request) -> ResponseEnvelope {
    match request {
        Request::Ping => handle_ping(),

        Request::Status => handle_status(executor),

        Request::ListActions => handle_list_actions(),

        Request::CapabilityRequest { action, params, request_id } => {
            handle_capability_request(executor, &action, params, &request_id).await
        }

        Request::CapabilityExecute { action, params, approval_id } => {
            handle_capability_execute(executor, &action, params, approval_id).await
        }

        Request::ContentSanitized { source, content, injection_detected, warnings: _ } => {
            handle_content_sanitized(executor, &source, content, injection_detected.unwrap_or(false)).await
        }

        Request::ApprovalResponse { approval_id, approved } => {
            handle_approval_response(executor, &approval_id, approved).await
        }

        Request::Kill { reason, details, triggered_by } => {
            handle_kill(executor, Some(reason), details, triggered_by)
        }
    }
}

fn handle_ping() -> ResponseEnvelope {
    ResponseEnvelope::new("pong")
        .with_status(ResponseStatus::Success)
        .with("timestamp", chrono::Utc::now().to_rfc3339())
        .with("server", "zone1-executor")
        .with("version", env!("CARGO_PKG_VERSION"))
}

fn handle_status(executor: &Arc<Executor>) -> ResponseEnvelope {
    let (killed, event) = executor.kill_switch.status();
    let audit_stats = executor.audit.stats().ok();

    let mut response = ResponseEnvelope::new("status")
        .with_status(ResponseStatus::Success)
        .with("killed", killed)
        .with("running", executor.is_running())
        .with("pending_approval_count", executor.approvals.pending_count() as u64);

    if let Some(event) = event {
        if let Ok(value) = serde_json::to_value(event) {
            response = response.with("kill_event", value);
        }
    }
    if let Some(stats) = audit_stats {
        if let Ok(value) = serde_json::to_value(stats) {
            response = response.with("audit", value);
        }
    }
    response
}

fn handle_list_actions() -> ResponseEnvelope {
    let actions: Vec<_> = crate::policy::ALLOWED_ACTIONS
        .iter()
        .map(|p| {
            serde_json::json!({
                "action": p.action,
                "approval_level": p.approval_level,
                "rate_cap": p.rate_cap,
                "description": p.description,
            })
        })
        .collect();

    ResponseEnvelope::new("list_actions").with_status(ResponseStatus::Success).with("actions", serde_json::Value::Array(actions))
}

async fn handle_capability_request(
    executor: &Arc<Executor>,
    action: &str,
    params: serde_json::Value,
    request_id: &str,
) -> ResponseEnvelope {
    match executor.request_capability(action, params, request_id).await {
        Ok(CapabilityRequestOutcome::Denied { error, message }) => {
            let mut response = ResponseEnvelope::new("capability_request")
                .with_status(ResponseStatus::Denied)
                .with("error", error);
            if let Some(message) = message {
                response = response.with("message", message);
            }
            response
        }
        Ok(CapabilityRequestOutcome::Approved { description }) => {
            let mut response = ResponseEnvelope::new("capability_request").with_status(ResponseStatus::Approved);
            if let Some(description) = description {
                response = response.with("description", description);
            }
            response
        }
        Ok(CapabilityRequestOutcome::PendingApproval { approval_id }) => ResponseEnvelope::new("capability_request")
            .with_status(ResponseStatus::PendingApproval)
            .with("approval_id", approval_id),
        Err(e) => ResponseEnvelope::error("capability_request", e.to_string()),
    }
}

async fn handle_capability_execute(
    executor: &Arc<Executor>,
    action: &str,
    params: serde_json::Value,
    approval_id: Option<String>,
) -> ResponseEnvelope {
    match executor.execute_action(action, params, approval_id, "zone2-agent").await {
        Ok(result) => ResponseEnvelope::new("capability_execute").with_status(ResponseStatus::Success).with("result", result),
        Err(e) => {
            let message = e.to_string();
            if message.contains("killed") {
                ResponseEnvelope::new("capability_execute")
                    .with_status(ResponseStatus::Error)
                    .with("error", "killed")
                    .with("message", message)
            } else if message.contains("Invalid or expired approval") {
                ResponseEnvelope::new("capability_execute")
                    .with_status(ResponseStatus::Error)
                    .with("error", "invalid_approval")
                    .with("message", message)
            } else {
                ResponseEnvelope::new("capability_execute")
                    .with_status(ResponseStatus::Error)
                    .with("error", "integration_failure")
                    .with("message", message)
            }
        }
    }
}

async fn handle_content_sanitized(
    executor: &Arc<Executor>,
    source: &str,
    content: serde_json::Value,
    injection_detected: bool,
) -> ResponseEnvelope {
    match executor.handle_content_sanitized(source, &content, injection_detected).await {
        Ok(canary_triggers) => ResponseEnvelope::new("content_sanitized")
            .with_status(ResponseStatus::Acknowledged)
            .with("canary_triggers", canary_triggers as u64),
        Err(e) => ResponseEnvelope::error("content_sanitized", e.to_string()),
    }
}

async fn handle_approval_response(executor: &Arc<Executor>, approval_id: &str, approved: bool) -> ResponseEnvelope {
    match executor.approvals.respond(approval_id, approved, "admin").await {
        Ok(_) => ResponseEnvelope::new("approval_response").with_status(ResponseStatus::Acknowledged),
        Err(_) => ResponseEnvelope::new("approval_response")
            .with_status(ResponseStatus::Error)
            .with("error", "invalid_approval")
            .with("message", "Invalid or expired approval ID"),
    }
}

fn handle_kill(executor: &Arc<Executor>, reason: Option<String>, details: Option<String>, triggered_by: Option<String>) -> ResponseEnvelope {
    let reason = KillReason::from_str_default(reason.as_deref().unwrap_or("manual"));
    executor.handle_kill(reason, details.as_deref().unwrap_or(""), triggered_by.as_deref().unwrap_or("unknown"));

    ResponseEnvelope::new("kill").with_status(ResponseStatus::Killed).with("message", "kill switch triggered")
}
