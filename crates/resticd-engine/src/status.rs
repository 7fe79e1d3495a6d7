use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use resticd_common::{
    truncate_chars, BackupError, OperationKind, OperationRecord, OperationState, Result,
};
use tokio::fs;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::is_valid_identifier;

/// Outcome of trying to take the cooperative lock on a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// A fresh running record was written.
    Accepted(OperationRecord),
    /// Someone else holds a live running record. Nothing was written.
    Conflict(OperationRecord),
}

/// File-backed operation records under `<restic_root>/.status/<kind>/<entity>.json`.
#[derive(Debug, Clone)]
pub struct StatusStore {
    base_dir: PathBuf,
    stale_after: Duration,
    retention: Duration,
    message_limit: usize,
}

impl StatusStore {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            base_dir: config.status_dir(),
            stale_after: config.stale_after,
            retention: config.status_retention,
            message_limit: config.message_limit,
        }
    }

    fn kind_dir(&self, kind: OperationKind) -> PathBuf {
        self.base_dir.join(kind.as_str())
    }

    fn record_path(&self, entity: &str, kind: OperationKind) -> Result<PathBuf> {
        if !is_valid_identifier(entity) {
            return Err(BackupError::InvalidRequest(format!(
                "invalid {} id: {:?}",
                kind, entity
            )));
        }
        Ok(self.kind_dir(kind).join(format!("{}.json", entity)))
    }

    /// Current record, with a stale running record rewritten to failed first.
    ///
    /// Unreadable or unparsable files yield `None`, which callers present as idle.
    pub async fn read(&self, entity: &str, kind: OperationKind) -> Result<Option<OperationRecord>> {
        let path = self.record_path(entity, kind)?;

        let record = match fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice::<OperationRecord>(&raw) {
                Ok(record) => record,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Ignoring unparsable status record");
                    return Ok(None);
                }
            },
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "Ignoring unreadable status record");
                }
                return Ok(None);
            }
        };

        let now = Utc::now();
        if record.is_stale(now, self.stale_after) {
            warn!(entity, %kind, "Marking stale running record as failed");
            let failed = OperationRecord {
                status: OperationState::Failed,
                started_at: record.started_at,
                finished_at: Some(now),
                message: Some(kind.stale_message()),
            };
            self.write(entity, kind, &failed).await?;
            return Ok(Some(failed));
        }

        Ok(Some(record))
    }

    pub async fn read_or_idle(&self, entity: &str, kind: OperationKind) -> Result<OperationRecord> {
        Ok(self.read(entity, kind).await?.unwrap_or_default())
    }

    /// Atomic replace through `<file>.tmp`, followed by best-effort pruning.
    pub async fn write(&self, entity: &str, kind: OperationKind, record: &OperationRecord) -> Result<()> {
        let path = self.record_path(entity, kind)?;
        let dir = self.kind_dir(kind);
        fs::create_dir_all(&dir).await?;

        let data = serde_json::to_vec_pretty(record)
            .map_err(|e| BackupError::Internal(format!("status serialization failed: {}", e)))?;

        let tmp = tmp_path(&path);
        fs::write(&tmp, &data).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        let pruned = self.prune(kind).await;
        if pruned > 0 {
            debug!(%kind, pruned, "Pruned expired status records");
        }
        Ok(())
    }

    /// Take the record for a new run unless a live one is already running.
    pub async fn claim_running(&self, entity: &str, kind: OperationKind) -> Result<Claim> {
        if let Some(current) = self.read(entity, kind).await? {
            if current.is_running() {
                return Ok(Claim::Conflict(current));
            }
        }

        let record = OperationRecord::running(Utc::now());
        self.write(entity, kind, &record).await?;
        Ok(Claim::Accepted(record))
    }

    /// Mark the run that started at `run_started` completed.
    ///
    /// Returns `None` without writing when the record belongs to another run.
    pub async fn complete(
        &self,
        entity: &str,
        kind: OperationKind,
        run_started: Option<DateTime<Utc>>,
    ) -> Result<Option<OperationRecord>> {
        self.finish(entity, kind, run_started, OperationState::Completed, None)
            .await
    }

    pub async fn fail(
        &self,
        entity: &str,
        kind: OperationKind,
        run_started: Option<DateTime<Utc>>,
        message: &str,
    ) -> Result<Option<OperationRecord>> {
        let message = truncate_chars(message.trim(), self.message_limit);
        self.finish(entity, kind, run_started, OperationState::Failed, Some(message))
            .await
    }

    async fn finish(
        &self,
        entity: &str,
        kind: OperationKind,
        run_started: Option<DateTime<Utc>>,
        state: OperationState,
        message: Option<String>,
    ) -> Result<Option<OperationRecord>> {
        // A run reaped as stale keeps its start time, so it may still settle.
        let owned = match self.read(entity, kind).await? {
            Some(current) => {
                current.started_at == run_started
                    && matches!(current.status, OperationState::Running | OperationState::Failed)
            }
            None => false,
        };
        if !owned {
            warn!(entity, %kind, "Record was taken over by a newer run, leaving it untouched");
            return Ok(None);
        }

        let record = OperationRecord {
            status: state,
            started_at: run_started,
            finished_at: Some(Utc::now()),
            message,
        };
        self.write(entity, kind, &record).await?;
        Ok(Some(record))
    }

    /// Remove records of `kind` older than the retention window. Never fails.
    pub async fn prune(&self, kind: OperationKind) -> usize {
        let dir = self.kind_dir(kind);
        match prune_dir(&dir, self.retention).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Status pruning failed");
                0
            }
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

async fn prune_dir(dir: &Path, retention: Duration) -> std::io::Result<usize> {
    let cutoff = match SystemTime::now().checked_sub(retention) {
        Some(cutoff) => cutoff,
        None => return Ok(0),
    };

    let mut removed = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => continue,
        };
        let expired = metadata.modified().map(|m| m < cutoff).unwrap_or(false);
        if expired {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to prune status record"),
            }
        }
    }
    Ok(removed)
}
