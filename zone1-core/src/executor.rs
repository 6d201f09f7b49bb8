//! Top-level composition: wires the audit log, policy engine, anomaly
//! detector, kill switch, canary registry, approval manager, and
//! credential vault into the single state graph the request server drives.

use crate::anomaly::AnomalyDetector;
use crate::approval::types::{ApprovalChannel, ApprovalRequest};
use crate::approval::ApprovalManager;
use crate::audit::{AuditEventKind, AuditLog};
use crate::canary::CanarySystem;
use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, ExecutorResult};
use crate::integrations::MessagingIntegration;
use crate::kill_switch::KillSwitch;
use crate::policy::PolicyEngine;
use crate::secrets::CredentialVault;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{info, warn};

pub struct Executor {
    pub config: ExecutorConfig,
    pub audit: AuditLog,
    pub policy: PolicyEngine,
    pub anomaly: AnomalyDetector,
    pub kill_switch: Arc<KillSwitch>,
    pub canary: CanarySystem,
    pub approvals: ApprovalManager,
    pub vault: CredentialVault,
    pub integration: Box<dyn MessagingIntegration>,
    running: AtomicBool,
}

/// Outcome of `execute_action`, already shaped for the wire response.
pub struct ExecuteOutcome {
    pub result: Value,
}

impl Executor {
    /// Constructs the executor and wires the approval manager's
    /// on-decision callback back to `execute_action`/audit via a weak
    /// reference, so decisions arriving from the background poller or an
    /// out-of-band channel route through the same path as a direct client
    /// `approval_response`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutorConfig,
        audit: AuditLog,
        kill_switch: Arc<KillSwitch>,
        canary: CanarySystem,
        approval_channel: Arc<dyn ApprovalChannel>,
        vault: CredentialVault,
        integration: Box<dyn MessagingIntegration>,
    ) -> Arc<Self> {
        let approval_expiry = config.approval_expiry_secs;

        Arc::new_cyclic(|weak: &Weak<Executor>| {
            let approvals = ApprovalManager::new(approval_channel, approval_expiry);
            let weak_self = weak.clone();
            approvals.set_on_decision(Box::new(move |request, approved| {
                if let Some(executor) = weak_self.upgrade() {
                    let request = request.clone();
                    tokio::spawn(async move {
                        executor.handle_approval_decision(request, approved).await;
                    });
                }
            }));

            Self {
                config,
                audit,
                policy: PolicyEngine::new(),
                anomaly: AnomalyDetector::new(),
                kill_switch,
                canary,
                approvals,
                vault,
                integration,
                running: AtomicBool::new(true),
            }
        })
    }

    /// Whether the request server is still accepting new connections.
    /// Reported in the `status` snapshot; cleared once on the shutdown
    /// signal (§5 Cancellation) and never set back.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Routes a terminal approval decision back into the execute path
    /// (approved) or emits `ACTION_REJECTED` (rejected/expired/cancelled).
    async fn handle_approval_decision(&self, request: ApprovalRequest, approved: bool) {
        if approved {
            if let Err(e) = self.execute_action(&request.action, request.params.clone(), None, &request.requester).await {
                warn!(error = %e, action = %request.action, "approved action failed to execute");
            }
        } else {
            let mut details = HashMap::new();
            details.insert("approval_id".to_string(), serde_json::json!(request.approval_id));
            let _ = self.audit.log(
                AuditEventKind::ActionRejected,
                Some(request.action.clone()),
                &request.requester,
                "zone2",
                details,
                None,
            );
        }
    }

    /// `capability_request` handler logic: evaluates policy and, if
    /// approval is required, opens a pending approval.
    pub async fn request_capability(&self, action: &str, params: Value, request_id: &str) -> ExecutorResult<CapabilityRequestOutcome> {
        let mut details = HashMap::new();
        details.insert("params".to_string(), params.clone());
        let _ = self.audit.log(
            AuditEventKind::ActionRequested,
            Some(action.to_string()),
            "zone2-agent",
            "zone2",
            details,
            Some(request_id.to_string()),
        );

        let decision = self.policy.check_action(action);
        if !decision.allowed {
            let mut details = HashMap::new();
            if let Some(error) = decision.error {
                details.insert("error".to_string(), serde_json::json!(error));
            }
            let _ = self.audit.log(
                AuditEventKind::PolicyDenied,
                Some(action.to_string()),
                "zone2-agent",
                "zone2",
                details,
                Some(request_id.to_string()),
            );
            return Ok(CapabilityRequestOutcome::Denied {
                error: decision.error.unwrap_or("action_not_allowed"),
                message: decision.message,
            });
        }

        if !decision.requires_approval {
            return Ok(CapabilityRequestOutcome::Approved {
                description: decision.description,
            });
        }

        let approval = self.approvals.create(action, params, "zone2-agent").await?;
        Ok(CapabilityRequestOutcome::PendingApproval {
            approval_id: approval.approval_id,
        })
    }

    /// `capability_execute` handler logic, also reused by the
    /// approval-decision callback (with `approval_id = None` there, since
    /// the pending entry has already been consumed by `respond`).
    pub async fn execute_action(
        &self,
        action: &str,
        params: Value,
        approval_id: Option<String>,
        requester: &str,
    ) -> ExecutorResult<Value> {
        if self.kill_switch.is_killed() {
            return Err(ExecutorError::Other("system is killed".to_string()));
        }

        if let Some(id) = &approval_id {
            if self.approvals.get(id).is_none() {
                return Err(ExecutorError::NotFound("Invalid or expired approval ID".to_string()));
            }
        }

        let mut request_details = HashMap::new();
        request_details.insert("params".to_string(), params.clone());
        let _ = self.audit.log(
            AuditEventKind::ActionRequested,
            Some(action.to_string()),
            requester,
            "zone1",
            request_details,
            None,
        );

        // Re-validate action-existence/approval only, not the hourly rate
        // cap: that was already spent against at request time, and
        // re-applying it here would deny bursts before the anomaly
        // detector - the component actually responsible for refusing
        // bursty executes (§4.3) - ever sees them.
        let decision = self.policy.validate_action_exists(action);
        if !decision.allowed {
            let mut details = HashMap::new();
            if let Some(error) = decision.error {
                details.insert("error".to_string(), serde_json::json!(error));
            }
            let _ = self.audit.log(
                AuditEventKind::PolicyDenied,
                Some(action.to_string()),
                requester,
                "zone1",
                details,
                None,
            );
            return Err(ExecutorError::Other(decision.message.unwrap_or_else(|| "denied".to_string())));
        }

        if !self.anomaly.check(action, &self.kill_switch) {
            return Err(ExecutorError::Other("system is killed".to_string()));
        }

        let creds = self.vault.resolve(action).await?;
        let params_map: HashMap<String, Value> = match &params {
            Value::Object(map) => map.clone().into_iter().collect(),
            _ => HashMap::new(),
        };

        let result = self.integration.dispatch(action, &params_map, &creds).await;

        match result {
            Ok(value) => {
                let mut details = HashMap::new();
                details.insert("result".to_string(), value.clone());
                let _ = self.audit.log(
                    AuditEventKind::ActionExecuted,
                    Some(action.to_string()),
                    requester,
                    "zone1",
                    details,
                    None,
                );
                if let Some(id) = &approval_id {
                    self.approvals.consume(id);
                }
                Ok(value)
            }
            Err(e) => {
                let mut details = HashMap::new();
                details.insert("error".to_string(), serde_json::json!(e.to_string()));
                let _ = self.audit.log(
                    AuditEventKind::ActionFailed,
                    Some(action.to_string()),
                    requester,
                    "zone1",
                    details,
                    None,
                );
                Err(e)
            }
        }
    }

    /// `content_sanitized` handler logic: acknowledges receipt, logs
    /// `CONTENT_SANITIZED`/`INJECTION_DETECTED`, and always scans the
    /// content through the canary registry.
    pub async fn handle_content_sanitized(
        &self,
        source: &str,
        content: &Value,
        injection_detected: bool,
    ) -> ExecutorResult<usize> {
        let mut details = HashMap::new();
        details.insert("source".to_string(), serde_json::json!(source));
        let _ = self.audit.log(
            AuditEventKind::ContentSanitized,
            None,
            "zone3",
            "zone3",
            details,
            None,
        );

        if injection_detected {
            let mut details = HashMap::new();
            details.insert("source".to_string(), serde_json::json!(source));
            let _ = self.audit.log(
                AuditEventKind::InjectionDetected,
                None,
                "zone3",
                "zone3",
                details,
                None,
            );
        }

        let content_str = content.to_string();
        let triggers = self.canary.check(&content_str, Some(source.to_string()), None, HashMap::new())?;
        Ok(triggers.len())
    }

    /// `kill` handler logic.
    pub fn handle_kill(&self, reason: crate::kill_switch::KillReason, details: &str, triggered_by: &str) {
        self.kill_switch.trigger(reason, details.to_string(), triggered_by.to_string());
        let mut event_details = HashMap::new();
        event_details.insert("details".to_string(), serde_json::json!(details));
        let _ = self.audit.log(
            AuditEventKind::KillSwitchTriggered,
            None,
            triggered_by,
            "zone1",
            event_details,
            None,
        );
    }

    pub fn seed(&self) -> ExecutorResult<()> {
        self.canary.seed_defaults()?;
        let _ = self.audit.log(
            AuditEventKind::SystemStart,
            None,
            "system",
            "zone1",
            HashMap::new(),
            None,
        );
        info!("executor state initialized");
        Ok(())
    }

    /// Periodically sweeps expired approvals and polls the kill-file
    /// sentinel; intended to run as background tasks for the process
    /// lifetime.
    pub async fn run_background_tasks(self: Arc<Self>) {
        let kill_switch = self.kill_switch.clone();
        let poll_interval = std::time::Duration::from_secs(self.config.kill_poll_interval_secs.max(1));
        tokio::spawn(async move {
            kill_switch.watch_kill_file(poll_interval).await;
        });

        let executor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                ticker.tick().await;
                executor.approvals.sweep_expired().await;
            }
        });
    }
}

pub enum CapabilityRequestOutcome {
    Denied { error: &'static str, message: Option<String> },
    Approved { description: Option<&'static str> },
    PendingApproval { approval_id: String },
}
