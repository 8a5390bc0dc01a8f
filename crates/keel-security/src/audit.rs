//! ---
//! keel_section: "06-security-access-control"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Audit sinks with payload redaction and hash chaining."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::metrics::SecurityMetrics;

const REDACTED: &str = "[REDACTED]";
const GENESIS_HASH_LEN: usize = 64;

/// Result of the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Action completed.
    Success,
    /// Action ran and failed.
    Failure,
    /// Action was refused by the capability gate.
    Denied,
}

/// Who performed an action and how it ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    /// Actor identifier.
    pub actor: String,
    /// Outcome of the action.
    pub outcome: AuditOutcome,
}

impl AuditContext {
    /// Build a context for `actor`.
    pub fn new(actor: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            actor: actor.into(),
            outcome,
        }
    }
}

/// Destination for audit records. Implementations redact payloads before persisting.
pub trait AuditSink: Send + Sync {
    /// Persist one record.
    fn write(&self, action: &str, payload: &Value, context: &AuditContext) -> Result<()>;
}

/// Replaces values whose keys match sensitive patterns.
#[derive(Debug, Clone)]
pub struct Redactor {
    patterns: Vec<String>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(["password", "passwd", "secret", "key", "token"])
    }
}

impl Redactor {
    /// Keys containing any of `patterns` (case-insensitive) are redacted.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.patterns.iter().any(|p| key.contains(p.as_str()))
    }

    /// Return a copy of `value` with sensitive keys replaced, recursing into nested values.
    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, inner)| {
                        let replaced = if self.is_sensitive(key) {
                            Value::String(REDACTED.into())
                        } else {
                            self.redact(inner)
                        };
                        (key.clone(), replaced)
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            other => other.clone(),
        }
    }
}

/// Entry recorded in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// Timestamp when the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Actor responsible for the event.
    pub actor: String,
    /// Event type (e.g. `unit.start`, `capability.denied`).
    pub action: String,
    /// Outcome of the action.
    pub outcome: AuditOutcome,
    /// Redacted payload.
    pub metadata: Value,
    /// SHA-256 hash of the entry contents and previous hash.
    pub hash: String,
    /// Hash of the previous entry (or zero string for the first entry).
    pub previous_hash: String,
}

impl AuditEntry {
    fn compute_hash(
        timestamp: DateTime<Utc>,
        actor: &str,
        action: &str,
        outcome: AuditOutcome,
        metadata: &Value,
        previous_hash: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(
            timestamp
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_be_bytes(),
        );
        hasher.update(actor.as_bytes());
        hasher.update(action.as_bytes());
        hasher.update([outcome as u8]);
        hasher.update(metadata.to_string().as_bytes());
        hasher.update(previous_hash.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn verify_against(&self, previous: &str) -> bool {
        self.previous_hash == previous
            && Self::compute_hash(
                self.timestamp,
                &self.actor,
                &self.action,
                self.outcome,
                &self.metadata,
                previous,
            ) == self.hash
    }
}

/// Hash-chained audit log backed by a newline-delimited JSON file.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    last_hash: Mutex<String>,
    redactor: Redactor,
    metrics: Option<SecurityMetrics>,
}

impl AuditLog {
    /// Open an audit log at the given path. Existing entries are loaded to determine the head hash.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("unable to create {}", parent.display()))?;
        }
        let mut last_hash = "0".repeat(GENESIS_HASH_LEN);
        if path.exists() {
            for line in BufReader::new(fs::File::open(&path)?).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: AuditEntry = serde_json::from_str(&line)
                    .with_context(|| format!("corrupt audit entry in {}", path.display()))?;
                last_hash = entry.hash;
            }
        }
        Ok(Self {
            path,
            last_hash: Mutex::new(last_hash),
            redactor: Redactor::default(),
            metrics: None,
        })
    }

    /// Replace the default redaction patterns.
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Count failed writes in `keel_audit_write_failures_total`.
    pub fn with_metrics(mut self, metrics: SecurityMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a new audit entry to the log.
    pub fn append(
        &self,
        action: &str,
        payload: &Value,
        context: &AuditContext,
    ) -> Result<AuditEntry> {
        let mut last_hash = self.last_hash.lock();
        let timestamp = Utc::now();
        let metadata = self.redactor.redact(payload);
        let hash = AuditEntry::compute_hash(
            timestamp,
            &context.actor,
            action,
            context.outcome,
            &metadata,
            &last_hash,
        );
        let entry = AuditEntry {
            timestamp,
            actor: context.actor.clone(),
            action: action.to_string(),
            outcome: context.outcome,
            metadata,
            hash: hash.clone(),
            previous_hash: last_hash.clone(),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("unable to open audit log {}", self.path.display()))?;
        file.write_all(serde_json::to_string(&entry)?.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        *last_hash = hash;
        Ok(entry)
    }

    /// Read every entry in file order.
    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for line in BufReader::new(fs::File::open(&self.path)?).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    /// Verify integrity of the log (detect tampering).
    pub fn verify(&self) -> Result<bool> {
        let mut previous = "0".repeat(GENESIS_HASH_LEN);
        for entry in self.entries()? {
            if !entry.verify_against(&previous) {
                return Ok(false);
            }
            previous = entry.hash;
        }
        Ok(true)
    }
}

impl AuditSink for AuditLog {
    fn write(&self, action: &str, payload: &Value, context: &AuditContext) -> Result<()> {
        match self.append(action, payload, context) {
            Ok(_) => Ok(()),
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_audit_failure();
                }
                warn!(action, path = %self.path.display(), error = %err, "audit write failed");
                Err(err)
            }
        }
    }
}

/// Audit record retained by [`MemoryAuditSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedAudit {
    /// Action name.
    pub action: String,
    /// Redacted payload.
    pub payload: Value,
    /// Actor and outcome.
    pub context: AuditContext,
}

/// In-memory sink used when no audit path is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<RecordedAudit>>,
    redactor: Redactor,
}

impl MemoryAuditSink {
    /// Empty sink with default redaction patterns.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty sink with the given redactor.
    pub fn with_redactor(redactor: Redactor) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            redactor,
        }
    }

    /// Snapshot of recorded entries.
    pub fn entries(&self) -> Vec<RecordedAudit> {
        self.entries.lock().clone()
    }

    /// Entries with the given action name.
    pub fn entries_for(&self, action: &str) -> Vec<RecordedAudit> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn write(&self, action: &str, payload: &Value, context: &AuditContext) -> Result<()> {
        self.entries.lock().push(RecordedAudit {
            action: action.to_string(),
            payload: self.redactor.redact(payload),
            context: context.clone(),
        });
        Ok(())
    }
}

/// Sink that discards everything; selected when auditing is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn write(&self, _action: &str, _payload: &Value, _context: &AuditContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Seek, SeekFrom};
    use tempfile::tempdir;

    fn ctx() -> AuditContext {
        AuditContext::new("system", AuditOutcome::Success)
    }

    #[test]
    fn redaction_is_recursive_and_case_insensitive() {
        let redactor = Redactor::default();
        let value = json!({
            "unit": "db",
            "Password": "hunter2",
            "settings": {"api_token": "abc", "host": "h", "nested": [{"secretValue": 1}]}
        });
        let redacted = redactor.redact(&value);
        assert_eq!(redacted["unit"], "db");
        assert_eq!(redacted["Password"], REDACTED);
        assert_eq!(redacted["settings"]["api_token"], REDACTED);
        assert_eq!(redacted["settings"]["host"], "h");
        assert_eq!(redacted["settings"]["nested"][0]["secretValue"], REDACTED);
    }

    #[test]
    fn memory_sink_redacts_before_storing() {
        let sink = MemoryAuditSink::new();
        sink.write("unit.configure", &json!({"password": "x"}), &ctx())
            .unwrap();
        let entries = sink.entries_for("unit.configure");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload["password"], REDACTED);
    }

    #[test]
    fn audit_log_chains_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit").join("kernel.ndjson");
        {
            let log = AuditLog::open(&path).unwrap();
            log.write("unit.start", &json!({"unit": "db"}), &ctx()).unwrap();
        }
        let log = AuditLog::open(&path).unwrap();
        let entry = log
            .append("unit.stop", &json!({"unit": "db"}), &ctx())
            .unwrap();
        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entry.previous_hash, entries[0].hash);
        assert!(log.verify().unwrap());
    }

    #[test]
    fn audit_log_detects_tampering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::open(&path).unwrap();
        log.write("unit.start", &json!({"unit": "db"}), &ctx()).unwrap();
        log.write(
            "unit.fault_injected",
            &json!({"unit": "db", "reason": "drill"}),
            &AuditContext::new("chaos", AuditOutcome::Success),
        )
        .unwrap();
        assert!(log.verify().unwrap());

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        let mut entries: Vec<Value> = contents
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        entries[1]["metadata"]["reason"] = json!("nothing to see");
        file.set_len(0).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        for value in entries {
            file.write_all(value.to_string().as_bytes()).unwrap();
            file.write_all(b"\n").unwrap();
        }
        assert!(!AuditLog::open(&path).unwrap().verify().unwrap());
    }

    #[test]
    fn audit_log_stores_redacted_metadata() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("a.log")).unwrap();
        let entry = log
            .append("unit.configure", &json!({"db_password": "pw"}), &ctx())
            .unwrap();
        assert_eq!(entry.metadata["db_password"], REDACTED);
        assert!(!std::fs::read_to_string(log.path()).unwrap().contains("\"pw\""));
    }
}
