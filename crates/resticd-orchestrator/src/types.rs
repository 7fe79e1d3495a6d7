use std::fmt;

use chrono::{DateTime, Utc};
use resticd_common::{BackupSummary, OperationRecord, RepoStats, Snapshot};
use resticd_engine::{CacheStream, RetentionPolicy};
use serde::Serialize;

/// Identifies a repository and carries the caller's key, if any.
#[derive(Clone, Default)]
pub struct RepoTarget {
    pub server_id: String,
    pub owner: Option<String>,
    pub key: Option<String>,
}

impl RepoTarget {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            ..Default::default()
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub(crate) fn supplied_key(&self) -> Option<&str> {
        self.key.as_deref().filter(|key| !key.is_empty())
    }
}

impl fmt::Debug for RepoTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoTarget")
            .field("server_id", &self.server_id)
            .field("owner", &self.owner)
            .field("key", &self.key.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateBackup {
    pub target: RepoTarget,
    pub policy: RetentionPolicy,
    pub tags: Vec<String>,
    /// Return right after claiming and finish on a background task.
    pub detach: bool,
}

/// Either the claimed record of a detached run, or the finished result.
#[derive(Debug)]
pub enum Dispatch<T> {
    Started(OperationRecord),
    Finished(T),
}

impl<T> Dispatch<T> {
    pub fn is_started(&self) -> bool {
        matches!(self, Dispatch::Started(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupCreated {
    pub snapshot_id: Option<String>,
    /// Snapshots removed by retention before this backup.
    pub pruned: Vec<String>,
    pub summary: BackupSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupEntry {
    pub id: String,
    pub short_id: String,
    pub time: DateTime<Utc>,
    pub tags: Vec<String>,
    pub paths: Vec<String>,
    pub hostname: Option<String>,
    pub size_bytes: Option<u64>,
    pub locked: bool,
}

impl BackupEntry {
    pub(crate) fn from_snapshot(snapshot: Snapshot, locked: bool) -> Self {
        Self {
            tags: snapshot
                .tags
                .map(|tags| tags.into_iter().collect())
                .unwrap_or_default(),
            id: snapshot.id,
            short_id: snapshot.short_id,
            time: snapshot.time,
            paths: snapshot.paths,
            hostname: snapshot.hostname,
            size_bytes: snapshot.size_bytes,
            locked,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub snapshot_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockState {
    pub snapshot_id: String,
    pub locked: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepositoryStats {
    pub restore_size: RepoStats,
    pub raw_data: RepoStats,
    /// Bytes the repository occupies on disk.
    pub disk_bytes: u64,
}

/// A prepared archive being streamed to the client.
pub struct Download {
    pub file_name: String,
    pub len: u64,
    pub stream: CacheStream,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("file_name", &self.file_name)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}
