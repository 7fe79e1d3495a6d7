// Re-export dependencies used in public interfaces of common types

use std::collections::BTreeSet;
use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag that marks a snapshot as exempt from automatic deletion.
pub const PROTECTED_TAG: &str = "locked";

/// Upper bound for any diagnostic that is persisted or returned.
pub const MESSAGE_LIMIT: usize = 2000;

const REDACTED: &str = "[redacted]";

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Missing encryption key")]
    MissingKey,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Tool failure: {0}")]
    ToolFailure(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl BackupError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            BackupError::InvalidRequest(_) => "INVALID_REQUEST",
            BackupError::MissingKey => "MISSING_KEY",
            BackupError::Conflict(_) => "CONFLICT",
            BackupError::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            BackupError::ToolFailure(_) => "TOOL_FAILURE",
            BackupError::Timeout(_) => "TIMEOUT",
            BackupError::InvalidPath(_) => "INVALID_PATH",
            BackupError::NotFound(_) => "NOT_FOUND",
            BackupError::Io(_) => "IO_ERROR",
            BackupError::Internal(_) => "INTERNAL",
        }
    }

    /// Rewrite the carried message, keeping the variant.
    pub fn map_message(self, f: impl FnOnce(&str) -> String) -> Self {
        match self {
            BackupError::InvalidRequest(m) => BackupError::InvalidRequest(f(&m)),
            BackupError::MissingKey => BackupError::MissingKey,
            BackupError::Conflict(m) => BackupError::Conflict(f(&m)),
            BackupError::CapacityExceeded(m) => BackupError::CapacityExceeded(f(&m)),
            BackupError::ToolFailure(m) => BackupError::ToolFailure(f(&m)),
            BackupError::Timeout(m) => BackupError::Timeout(f(&m)),
            BackupError::InvalidPath(m) => BackupError::InvalidPath(f(&m)),
            BackupError::NotFound(m) => BackupError::NotFound(f(&m)),
            BackupError::Io(e) => BackupError::Io(e),
            BackupError::Internal(m) => BackupError::Internal(f(&m)),
        }
    }
}

// Define the primary Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Backup,
    Restore,
    Prepare,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Backup,
        OperationKind::Restore,
        OperationKind::Prepare,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Backup => "backup",
            OperationKind::Restore => "restore",
            OperationKind::Prepare => "prepare",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            OperationKind::Backup => "Backup",
            OperationKind::Restore => "Restore",
            OperationKind::Prepare => "Prepare",
        }
    }

    /// Message written when a running record outlives the staleness window.
    pub fn stale_message(&self) -> String {
        format!("{} appears stale. Please retry.", self.label())
    }
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    #[default]
    Idle,
    Running,
    // Older prepare records were written with "ready".
    #[serde(alias = "ready")]
    Completed,
    Failed,
}

/// Persisted state of one (entity, kind) operation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperationRecord {
    pub status: OperationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OperationRecord {
    pub fn idle() -> Self {
        Self::default()
    }

    /// Fresh claim: start now, no finish time, no message.
    pub fn running(now: DateTime<Utc>) -> Self {
        Self {
            status: OperationState::Running,
            started_at: Some(now),
            finished_at: None,
            message: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == OperationState::Running
    }

    /// A running record without a start time is never considered stale.
    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        if !self.is_running() {
            return false;
        }
        match (self.started_at, chrono::Duration::from_std(window)) {
            (Some(started), Ok(window)) => now - started > window,
            _ => false,
        }
    }
}

/// One snapshot as reported by the snapshot tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub short_id: String,
    pub time: DateTime<Utc>,
    /// `None` when the tool response did not include tags at all.
    #[serde(default)]
    pub tags: Option<BTreeSet<String>>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

impl Snapshot {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.as_ref().is_some_and(|tags| tags.contains(tag))
    }
}

/// Summary line emitted by a finished backup.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackupSummary {
    pub snapshot_id: Option<String>,
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub data_added: u64,
    pub total_bytes_processed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatsMode {
    /// Logical size of all restorable files.
    RestoreSize,
    /// Deduplicated size of the stored blobs.
    RawData,
}

impl StatsMode {
    pub fn as_arg(&self) -> &'static str {
        match self {
            StatsMode::RestoreSize => "restore-size",
            StatsMode::RawData => "raw-data",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RepoStats {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_file_count: u64,
    #[serde(default)]
    pub snapshots_count: u64,
}

/// Strip the secret from a diagnostic and clamp it to `limit` characters.
pub fn sanitize_message(message: &str, secret: Option<&str>, limit: usize) -> String {
    let trimmed = message.trim();
    let redacted = match secret {
        Some(secret) if !secret.is_empty() => trimmed.replace(secret, REDACTED),
        _ => trimmed.to_string(),
    };
    truncate_chars(&redacted, limit)
}

pub fn truncate_chars(message: &str, limit: usize) -> String {
    match message.char_indices().nth(limit) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serialization() {
        let record = OperationRecord::running(Utc::now());
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"status\":\"running\""));
        assert!(!json.contains("finished_at"));

        let legacy: OperationRecord = serde_json::from_str(r#"{"status":"ready"}"#).unwrap();
        assert_eq!(legacy.status, OperationState::Completed);
    }

    #[test]
    fn test_staleness() {
        let now = Utc::now();
        let window = Duration::from_secs(6 * 3600);

        let mut record = OperationRecord::running(now - chrono::Duration::hours(7));
        assert!(record.is_stale(now, window));

        record.started_at = Some(now - chrono::Duration::hours(1));
        assert!(!record.is_stale(now, window));

        record.started_at = None;
        assert!(!record.is_stale(now, window));

        let finished = OperationRecord {
            status: OperationState::Failed,
            started_at: Some(now - chrono::Duration::days(2)),
            ..Default::default()
        };
        assert!(!finished.is_stale(now, window));
    }

    #[test]
    fn test_sanitize_message() {
        let msg = "  Fatal: wrong password hunter2 for repo  ";
        assert_eq!(
            sanitize_message(msg, Some("hunter2"), MESSAGE_LIMIT),
            "Fatal: wrong password [redacted] for repo"
        );

        let long = "é".repeat(MESSAGE_LIMIT + 10);
        let clamped = sanitize_message(&long, None, MESSAGE_LIMIT);
        assert_eq!(clamped.chars().count(), MESSAGE_LIMIT);
    }

    #[test]
    fn test_protected_tag_lookup() {
        let snapshot = Snapshot {
            id: "a".repeat(64),
            short_id: "aaaaaaaa".to_string(),
            time: Utc::now(),
            tags: Some([PROTECTED_TAG.to_string()].into_iter().collect()),
            paths: vec![],
            hostname: None,
            size_bytes: None,
        };
        assert!(snapshot.has_tag(PROTECTED_TAG));

        let untagged = Snapshot { tags: None, ..snapshot };
        assert!(!untagged.has_tag(PROTECTED_TAG));
    }
}
