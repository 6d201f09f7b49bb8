//! Append-only, hash-chained audit log.
//!
//! Events are partitioned by UTC date into `audit-<YYYY-MM-DD>.jsonl` files,
//! one JSON object per line. Each event's `event_hash` covers the canonical
//! serialization of every other field concatenated with the previous event's
//! hash, so tampering with any on-disk line breaks the chain from that point
//! on. The running tail hash is mirrored into a sidecar `audit-chain.json` so
//! a restart can resume the chain without re-scanning every log file.

use crate::error::ExecutorResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const GENESIS: &str = "GENESIS";

/// Closed set of audit event kinds (wire-compatible lowercase names).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    ActionRequested,
    ActionApproved,
    ActionRejected,
    ActionExecuted,
    ActionFailed,
    PolicyDenied,
    KillSwitchTriggered,
    AnomalyDetected,
    ContentSanitized,
    InjectionDetected,
    AuthAttempt,
    ConfigChanged,
    SystemStart,
    SystemStop,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActionRequested => "action_requested",
            Self::ActionApproved => "action_approved",
            Self::ActionRejected => "action_rejected",
            Self::ActionExecuted => "action_executed",
            Self::ActionFailed => "action_failed",
            Self::PolicyDenied => "policy_denied",
            Self::KillSwitchTriggered => "kill_switch_triggered",
            Self::AnomalyDetected => "anomaly_detected",
            Self::ContentSanitized => "content_sanitized",
            Self::InjectionDetected => "injection_detected",
            Self::AuthAttempt => "auth_attempt",
            Self::ConfigChanged => "config_changed",
            Self::SystemStart => "system_start",
            Self::SystemStop => "system_stop",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventKind,
    pub action: Option<String>,
    pub actor: String,
    pub source_zone: String,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
    pub request_id: Option<String>,
    pub previous_hash: String,
    pub event_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_type: Option<AuditEventKind>,
    pub action: Option<String>,
    pub actor: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditStats {
    pub total_events: usize,
    pub by_type: HashMap<String, usize>,
    pub chain_valid: bool,
}

#[derive(Serialize, Deserialize)]
struct ChainSidecar {
    last_hash: String,
    updated: DateTime<Utc>,
}

struct AuditState {
    previous_hash: String,
}

/// Canonical, sorted-key JSON of the event fields that participate in the
/// hash (everything except `event_hash` itself), concatenated with the
/// previous hash.
fn canonical_payload(
    timestamp: &DateTime<Utc>,
    event_type: AuditEventKind,
    action: &Option<String>,
    actor: &str,
    source_zone: &str,
    details: &HashMap<String, serde_json::Value>,
    request_id: &Option<String>,
) -> String {
    // BTreeMap gives deterministic, sorted-key serialization - the Rust
    // analogue of Python's `json.dumps(..., sort_keys=True)`.
    let mut fields: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
    fields.insert("timestamp", serde_json::json!(timestamp.to_rfc3339()));
    fields.insert("event_type", serde_json::json!(event_type.as_str()));
    fields.insert("action", serde_json::json!(action));
    fields.insert("actor", serde_json::json!(actor));
    fields.insert("source_zone", serde_json::json!(source_zone));
    fields.insert(
        "details",
        serde_json::to_value(details.iter().collect::<BTreeMap<_, _>>()).unwrap(),
    );
    fields.insert("request_id", serde_json::json!(request_id));
    serde_json::to_string(&fields).expect("BTreeMap<&str, Value> always serializes")
}

fn compute_hash(payload: &str, previous_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hasher.update(previous_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Append-only audit log, partitioned by UTC date.
pub struct AuditLog {
    dir: PathBuf,
    state: Mutex<AuditState>,
}

impl AuditLog {
    pub fn open(dir: impl Into<PathBuf>) -> ExecutorResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let previous_hash = Self::load_chain_state(&dir)?;
        Ok(Self {
            dir,
            state: Mutex::new(AuditState { previous_hash }),
        })
    }

    fn chain_file(dir: &Path) -> PathBuf {
        dir.join("audit-chain.json")
    }

    fn load_chain_state(dir: &Path) -> ExecutorResult<String> {
        let path = Self::chain_file(dir);
        if !path.exists() {
            return Ok(GENESIS.to_string());
        }
        let content = fs::read_to_string(&path)?;
        match serde_json::from_str::<ChainSidecar>(&content) {
            Ok(sidecar) => Ok(sidecar.last_hash),
            Err(_) => Ok(GENESIS.to_string()),
        }
    }

    fn save_chain_state(&self, last_hash: &str) -> ExecutorResult<()> {
        let sidecar = ChainSidecar {
            last_hash: last_hash.to_string(),
            updated: Utc::now(),
        };
        let content = serde_json::to_string(&sidecar)?;
        fs::write(Self::chain_file(&self.dir), content)?;
        Ok(())
    }

    fn log_file_for(&self, timestamp: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("audit-{}.jsonl", timestamp.format("%Y-%m-%d")))
    }

    /// Append a new event, returning the stored event (with hashes filled in).
    #[allow(clippy::too_many_arguments)]
    pub fn log(
        &self,
        event_type: AuditEventKind,
        action: Option<String>,
        actor: &str,
        source_zone: &str,
        details: HashMap<String, serde_json::Value>,
        request_id: Option<String>,
    ) -> ExecutorResult<AuditEvent> {
        let mut state = self.state.lock().expect("audit log mutex poisoned");

        let timestamp = Utc::now();
        let payload = canonical_payload(
            &timestamp,
            event_type,
            &action,
            actor,
            source_zone,
            &details,
            &request_id,
        );
        let event_hash = compute_hash(&payload, &state.previous_hash);

        let event = AuditEvent {
            timestamp,
            event_type,
            action,
            actor: actor.to_string(),
            source_zone: source_zone.to_string(),
            details,
            request_id,
            previous_hash: state.previous_hash.clone(),
            event_hash: event_hash.clone(),
        };

        let line = serde_json::to_string(&event)?;
        let path = self.log_file_for(timestamp);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", line)?;

        self.save_chain_state(&event_hash)?;
        state.previous_hash = event_hash;

        Ok(event)
    }

    fn log_files(&self) -> ExecutorResult<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("audit-") && n.ends_with(".jsonl"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Recompute and compare every event's hash, in file order starting from
    /// `GENESIS`. Never mutates state.
    pub fn verify_chain(&self) -> ExecutorResult<(bool, Vec<String>)> {
        let mut errors = Vec::new();
        let mut previous_hash = GENESIS.to_string();

        for path in self.log_files()? {
            let content = fs::read_to_string(&path)?;
            let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("?");

            for (idx, line) in content.lines().enumerate() {
                let line_num = idx + 1;
                if line.trim().is_empty() {
                    continue;
                }
                let event: AuditEvent = match serde_json::from_str(line) {
                    Ok(e) => e,
                    Err(e) => {
                        errors.push(format!("{}:{}: invalid JSON - {}", file_name, line_num, e));
                        continue;
                    }
                };

                if event.previous_hash != previous_hash {
                    errors.push(format!(
                        "{}:{}: chain broken - expected {}..., got {}...",
                        file_name,
                        line_num,
                        &previous_hash[..previous_hash.len().min(8)],
                        &event.previous_hash[..event.previous_hash.len().min(8)],
                    ));
                }

                let payload = canonical_payload(
                    &event.timestamp,
                    event.event_type,
                    &event.action,
                    &event.actor,
                    &event.source_zone,
                    &event.details,
                    &event.request_id,
                );
                let expected_hash = compute_hash(&payload, &event.previous_hash);
                if expected_hash != event.event_hash {
                    errors.push(format!(
                        "{}:{}: hash mismatch - event may have been tampered",
                        file_name, line_num
                    ));
                }

                previous_hash = event.event_hash;
            }
        }

        Ok((errors.is_empty(), errors))
    }

    /// Query events, most recent first, applying all given filters.
    pub fn query(&self, filter: &AuditFilter) -> ExecutorResult<Vec<AuditEvent>> {
        let mut results = Vec::new();
        let mut files = self.log_files()?;
        files.reverse();

        'files: for path in files {
            let content = fs::read_to_string(&path)?;
            let mut lines: Vec<&str> = content.lines().collect();
            lines.reverse();

            for line in lines {
                if line.trim().is_empty() {
                    continue;
                }
                let event: AuditEvent = match serde_json::from_str(line) {
                    Ok(e) => e,
                    Err(_) => continue,
                };

                if let Some(kind) = filter.event_type {
                    if event.event_type != kind {
                        continue;
                    }
                }
                if let Some(ref action) = filter.action {
                    if event.action.as_deref() != Some(action.as_str()) {
                        continue;
                    }
                }
                if let Some(ref actor) = filter.actor {
                    if &event.actor != actor {
                        continue;
                    }
                }
                if let Some(start) = filter.start_time {
                    if event.timestamp < start {
                        continue;
                    }
                }
                if let Some(end) = filter.end_time {
                    if event.timestamp > end {
                        continue;
                    }
                }

                results.push(event);
                if results.len() >= filter.limit {
                    break 'files;
                }
            }
        }

        Ok(results)
    }

    /// Aggregate event-kind histogram plus chain validity, over every file.
    pub fn stats(&self) -> ExecutorResult<AuditStats> {
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut total = 0usize;

        for path in self.log_files()? {
            let content = fs::read_to_string(&path)?;
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                if let Ok(event) = serde_json::from_str::<AuditEvent>(line) {
                    *by_type.entry(event.event_type.as_str().to_string()).or_insert(0) += 1;
                    total += 1;
                }
            }
        }

        let (chain_valid, _) = self.verify_chain()?;
        Ok(AuditStats {
            total_events: total,
            by_type,
            chain_valid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn log() -> (tempfile::TempDir, AuditLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path()).unwrap();
        (dir, log)
    }

    #[test]
    fn first_event_chains_from_genesis() {
        let (_dir, log) = log();
        let event = log
            .log(
                AuditEventKind::SystemStart,
                None,
                "system",
                "zone1",
                HashMap::new(),
                None,
            )
            .unwrap();
        assert_eq!(event.previous_hash, GENESIS);
    }

    #[test]
    fn verify_passes_for_any_chain_length() {
        for k in 0..5 {
            let (_dir, log) = log();
            for i in 0..k {
                log.log(
                    AuditEventKind::ActionRequested,
                    Some(format!("action_{i}")),
                    "agent",
                    "zone2",
                    HashMap::new(),
                    None,
                )
                .unwrap();
            }
            let (valid, errors) = log.verify_chain().unwrap();
            assert!(valid, "k={k} errors={errors:?}");
            assert!(errors.is_empty());
        }
    }

    #[test]
    fn tampering_with_details_breaks_verification() {
        let (dir, log) = log();
        log.log(
            AuditEventKind::ActionExecuted,
            Some("send_email".into()),
            "agent",
            "zone2",
            HashMap::new(),
            None,
        )
        .unwrap();

        let files = log.log_files().unwrap();
        let path = &files[0];
        let content = fs::read_to_string(path).unwrap();
        let mut event: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        event["details"]["tampered"] = serde_json::json!(true);
        fs::write(path, format!("{}\n", event)).unwrap();

        let (valid, errors) = log.verify_chain().unwrap();
        assert!(!valid);
        assert!(errors.iter().any(|e| e.contains("hash mismatch")));
        let _ = dir;
    }

    #[test]
    fn query_returns_most_recent_first_and_respects_limit() {
        let (_dir, log) = log();
        for i in 0..3 {
            log.log(
                AuditEventKind::ActionExecuted,
                Some(format!("action_{i}")),
                "agent",
                "zone2",
                HashMap::new(),
                None,
            )
            .unwrap();
        }

        let mut filter = AuditFilter::new();
        filter.limit = 2;
        let results = log.query(&filter).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].action.as_deref(), Some("action_2"));
        assert_eq!(results[1].action.as_deref(), Some("action_1"));
    }

    #[test]
    fn stats_reports_totals_and_chain_validity() {
        let (_dir, log) = log();
        log.log(
            AuditEventKind::SystemStart,
            None,
            "system",
            "zone1",
            HashMap::new(),
            None,
        )
        .unwrap();
        let stats = log.stats().unwrap();
        assert_eq!(stats.total_events, 1);
        assert!(stats.chain_valid);
        assert_eq!(stats.by_type.get("system_start"), Some(&1));
    }
}
