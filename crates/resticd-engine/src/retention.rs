use std::collections::HashSet;

use resticd_common::{BackupError, Result, Snapshot};
use serde::{Deserialize, Serialize};

use crate::tool::{RepoAccess, SnapshotTool, ToolResult};

/// Ceilings applied before a new snapshot is taken. Zero or `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_snapshots: Option<u64>,
    pub max_repo_bytes: Option<u64>,
}

impl RetentionPolicy {
    pub fn snapshot_limit(&self) -> Option<usize> {
        self.max_snapshots
            .filter(|max| *max > 0)
            .map(|max| usize::try_from(max).unwrap_or(usize::MAX))
    }

    pub fn byte_limit(&self) -> Option<u64> {
        self.max_repo_bytes.filter(|max| *max > 0)
    }
}

/// Ids of protected snapshots, computed once per listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtectedSet {
    ids: HashSet<String>,
}

impl ProtectedSet {
    /// Inline tags when every snapshot reported them, otherwise a `--tag` query.
    pub async fn load(
        tool: &dyn SnapshotTool,
        access: &RepoAccess,
        snapshots: &[Snapshot],
        tag: &str,
    ) -> ToolResult<Self> {
        if snapshots.iter().all(|s| s.tags.is_some()) {
            return Ok(Self::from_inline(snapshots, tag));
        }
        let tagged = tool.snapshots(access, Some(tag)).await?;
        Ok(Self::from_ids(tagged.into_iter().map(|s| s.id)))
    }

    pub fn from_inline(snapshots: &[Snapshot], tag: &str) -> Self {
        Self::from_ids(
            snapshots
                .iter()
                .filter(|s| s.has_tag(tag))
                .map(|s| s.id.clone()),
        )
    }

    pub fn from_ids(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    pub fn contains(&self, snapshot_id: &str) -> bool {
        self.ids.contains(snapshot_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Full ids to forget, oldest first.
    pub delete: Vec<String>,
}

/// The byte ceiling alone, checked before any listing. Nothing is ever pruned for size.
pub fn check_size(policy: &RetentionPolicy, repo_bytes: u64) -> Result<()> {
    match policy.byte_limit() {
        Some(max_bytes) if repo_bytes >= max_bytes => Err(BackupError::CapacityExceeded(format!(
            "repository size {} bytes reached the limit of {} bytes",
            repo_bytes, max_bytes
        ))),
        _ => Ok(()),
    }
}

/// Decide deletions. Rejections never carry a partial plan.
pub fn plan(
    policy: &RetentionPolicy,
    snapshots: &[Snapshot],
    protected: &ProtectedSet,
    repo_bytes: u64,
) -> Result<RetentionPlan> {
    check_size(policy, repo_bytes)?;

    let Some(max) = policy.snapshot_limit() else {
        return Ok(RetentionPlan::default());
    };
    if snapshots.len() < max {
        return Ok(RetentionPlan::default());
    }

    let needed = snapshots.len() - max + 1;
    let mut candidates: Vec<&Snapshot> = snapshots
        .iter()
        .filter(|s| !protected.contains(&s.id))
        .collect();

    if candidates.is_empty() {
        return Err(BackupError::CapacityExceeded(
            "snapshot limit reached and all snapshots protected".to_string(),
        ));
    }
    if candidates.len() < needed {
        return Err(BackupError::CapacityExceeded(format!(
            "snapshot limit reached: {} deletions needed but only {} unprotected snapshots",
            needed,
            candidates.len()
        )));
    }

    candidates.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)));
    Ok(RetentionPlan {
        delete: candidates
            .into_iter()
            .take(needed)
            .map(|s| s.id.clone())
            .collect(),
    })
}
