//! In-memory stand-in for the restic binary.
//!
//! Repository state lives in memory keyed by path, but initialization is
//! mirrored on disk through the `config` file so the resolver sees the same
//! repository age and size a real repository would have. Removing the
//! directory resets the repository, like it would for restic.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use resticd_common::{BackupSummary, RepoStats, Snapshot, StatsMode};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::tool::{LockInfo, RepoAccess, SnapshotTool, ToolError, ToolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Init,
    Backup,
    Snapshots,
    Tag,
    Forget,
    Stats,
    Restore,
    Locks,
    Unlock,
}

impl MockOp {
    fn command(&self) -> &'static str {
        match self {
            MockOp::Init => "init",
            MockOp::Backup => "backup",
            MockOp::Snapshots => "snapshots",
            MockOp::Tag => "tag",
            MockOp::Forget => "forget",
            MockOp::Stats => "stats",
            MockOp::Restore => "restore",
            MockOp::Locks => "list locks",
            MockOp::Unlock => "unlock",
        }
    }
}

/// Failure injected into the next call of one primitive.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    Busy { age: Option<Duration> },
    KeyMismatch,
    Failure { error: String },
    Timeout,
}

impl MockBehavior {
    fn into_error(self, op: MockOp) -> ToolError {
        match self {
            MockBehavior::Busy { age } => ToolError::Busy(LockInfo {
                created_at: None,
                age,
            }),
            MockBehavior::KeyMismatch => ToolError::KeyMismatch,
            MockBehavior::Failure { error } => ToolError::Failed {
                command: op.command().to_string(),
                message: error,
            },
            MockBehavior::Timeout => ToolError::TimedOut {
                command: op.command().to_string(),
                timeout: Duration::ZERO,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub op: MockOp,
    pub repo: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Default)]
struct MockRepo {
    key: String,
    snapshots: Vec<Snapshot>,
    locks: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockTool {
    repos: Arc<Mutex<HashMap<PathBuf, MockRepo>>>,
    failures: Arc<Mutex<HashMap<MockOp, VecDeque<MockBehavior>>>>,
    pub calls: Arc<Mutex<Vec<MockCall>>>,
    next_id: Arc<AtomicU64>,
    backup_delay: Duration,
    hide_inline_tags: bool,
}

impl MockTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every backup take this long, to hold the status claim open.
    pub fn with_backup_delay(mut self, delay: Duration) -> Self {
        self.backup_delay = delay;
        self
    }

    /// Report `tags: null` in full listings, like older restic releases.
    pub fn without_inline_tags(mut self) -> Self {
        self.hide_inline_tags = true;
        self
    }

    pub async fn fail_next(&self, op: MockOp, behavior: MockBehavior) {
        self.failures
            .lock()
            .await
            .entry(op)
            .or_default()
            .push_back(behavior);
    }

    /// Initialize a repository on disk and in memory with the access key.
    pub async fn seed_repo(&self, access: &RepoAccess) {
        tokio::fs::create_dir_all(&access.path).await.ok();
        tokio::fs::write(access.path.join("config"), b"mock repository")
            .await
            .ok();
        self.repos.lock().await.insert(
            access.path.clone(),
            MockRepo {
                key: access.key().to_string(),
                ..Default::default()
            },
        );
    }

    /// Add a snapshot with a given time and tags, returning its full id.
    pub async fn seed_snapshot(&self, access: &RepoAccess, time: DateTime<Utc>, tags: &[&str]) -> String {
        let id = self.fresh_id(&access.path);
        let snapshot = Snapshot {
            short_id: id[..8].to_string(),
            id: id.clone(),
            time,
            tags: Some(tags.iter().map(|t| t.to_string()).collect()),
            paths: vec![],
            hostname: Some("mock".to_string()),
            size_bytes: Some(1024),
        };
        if let Some(repo) = self.repos.lock().await.get_mut(&access.path) {
            repo.snapshots.push(snapshot);
        }
        id
    }

    pub async fn add_lock(&self, path: &Path, lock_id: &str) {
        if let Some(repo) = self.repos.lock().await.get_mut(path) {
            repo.locks.push(lock_id.to_string());
        }
    }

    /// Full ids currently stored, oldest first.
    pub async fn snapshot_ids(&self, path: &Path) -> Vec<String> {
        let repos = self.repos.lock().await;
        let mut snapshots: Vec<&Snapshot> = repos
            .get(path)
            .map(|r| r.snapshots.iter().collect())
            .unwrap_or_default();
        snapshots.sort_by_key(|s| s.time);
        snapshots.into_iter().map(|s| s.id.clone()).collect()
    }

    pub async fn call_count(&self, op: MockOp) -> usize {
        self.calls.lock().await.iter().filter(|c| c.op == op).count()
    }

    pub async fn calls_for(&self, op: MockOp) -> Vec<MockCall> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    fn fresh_id(&self, path: &Path) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(n.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    async fn enter(&self, op: MockOp, access: &RepoAccess, args: Vec<String>) -> ToolResult<()> {
        self.calls.lock().await.push(MockCall {
            op,
            repo: access.path.clone(),
            args,
        });
        let injected = self
            .failures
            .lock()
            .await
            .get_mut(&op)
            .and_then(|queue| queue.pop_front());
        match injected {
            Some(behavior) => Err(behavior.into_error(op)),
            None => Ok(()),
        }
    }

    /// Run `f` against an initialized repository opened with the right key.
    async fn with_repo<T>(
        &self,
        op: MockOp,
        access: &RepoAccess,
        f: impl FnOnce(&mut MockRepo) -> ToolResult<T>,
    ) -> ToolResult<T> {
        let on_disk = access.path.join("config").is_file();
        let mut repos = self.repos.lock().await;
        if !on_disk {
            repos.remove(&access.path);
        }
        let Some(repo) = repos.get_mut(&access.path) else {
            return Err(ToolError::Failed {
                command: op.command().to_string(),
                message: format!(
                    "Fatal: unable to open config file: stat {}/config: no such file or directory\nIs there a repository at the following location?",
                    access.path.display()
                ),
            });
        };
        if repo.key != access.key() {
            return Err(ToolError::KeyMismatch);
        }
        f(repo)
    }
}

#[async_trait]
impl SnapshotTool for MockTool {
    async fn init(&self, repo: &RepoAccess) -> ToolResult<()> {
        self.enter(MockOp::Init, repo, vec![]).await?;
        let on_disk = repo.path.join("config").is_file();
        if on_disk && self.repos.lock().await.contains_key(&repo.path) {
            return Err(ToolError::Failed {
                command: "init".to_string(),
                message: "Fatal: create key in repository failed: repository master key and config already initialized".to_string(),
            });
        }
        self.seed_repo(repo).await;
        Ok(())
    }

    async fn backup(&self, repo: &RepoAccess, source: &Path, tags: &[String]) -> ToolResult<BackupSummary> {
        let mut args = tags.to_vec();
        args.push(source.display().to_string());
        self.enter(MockOp::Backup, repo, args).await?;

        if !self.backup_delay.is_zero() {
            tokio::time::sleep(self.backup_delay).await;
        }

        let id = self.fresh_id(&repo.path);
        let source = source.display().to_string();
        let tags = tags.to_vec();
        self.with_repo(MockOp::Backup, repo, move |state| {
            state.snapshots.push(Snapshot {
                short_id: id[..8].to_string(),
                id: id.clone(),
                time: Utc::now(),
                tags: Some(tags.into_iter().collect()),
                paths: vec![source],
                hostname: Some("mock".to_string()),
                size_bytes: Some(1024),
            });
            Ok(BackupSummary {
                snapshot_id: Some(id),
                files_new: 1,
                total_bytes_processed: 1024,
                ..Default::default()
            })
        })
        .await
    }

    async fn snapshots(&self, repo: &RepoAccess, tag: Option<&str>) -> ToolResult<Vec<Snapshot>> {
        self.enter(MockOp::Snapshots, repo, tag.map(str::to_string).into_iter().collect())
            .await?;
        let hide = self.hide_inline_tags && tag.is_none();
        self.with_repo(MockOp::Snapshots, repo, |state| {
            Ok(state
                .snapshots
                .iter()
                .filter(|s| tag.map_or(true, |t| s.has_tag(t)))
                .cloned()
                .map(|mut s| {
                    if hide {
                        s.tags = None;
                    }
                    s
                })
                .collect())
        })
        .await
    }

    async fn add_tag(&self, repo: &RepoAccess, snapshot_id: &str, tag: &str) -> ToolResult<()> {
        self.enter(
            MockOp::Tag,
            repo,
            vec!["--add".into(), tag.into(), snapshot_id.into()],
        )
        .await?;
        self.with_repo(MockOp::Tag, repo, |state| {
            let snapshot = find_snapshot(state, snapshot_id, "tag")?;
            snapshot
                .tags
                .get_or_insert_with(Default::default)
                .insert(tag.to_string());
            Ok(())
        })
        .await
    }

    async fn remove_tag(&self, repo: &RepoAccess, snapshot_id: &str, tag: &str) -> ToolResult<()> {
        self.enter(
            MockOp::Tag,
            repo,
            vec!["--remove".into(), tag.into(), snapshot_id.into()],
        )
        .await?;
        self.with_repo(MockOp::Tag, repo, |state| {
            let snapshot = find_snapshot(state, snapshot_id, "tag")?;
            if let Some(tags) = snapshot.tags.as_mut() {
                tags.remove(tag);
            }
            Ok(())
        })
        .await
    }

    async fn forget(&self, repo: &RepoAccess, snapshot_ids: &[String], prune: bool) -> ToolResult<()> {
        let mut args = snapshot_ids.to_vec();
        if prune {
            args.insert(0, "--prune".to_string());
        }
        self.enter(MockOp::Forget, repo, args).await?;
        self.with_repo(MockOp::Forget, repo, |state| {
            for id in snapshot_ids {
                find_snapshot(state, id, "forget")?;
            }
            state
                .snapshots
                .retain(|s| !snapshot_ids.iter().any(|id| s.id.starts_with(id.as_str())));
            Ok(())
        })
        .await
    }

    async fn stats(&self, repo: &RepoAccess, mode: StatsMode) -> ToolResult<RepoStats> {
        self.enter(MockOp::Stats, repo, vec![mode.as_arg().to_string()])
            .await?;
        self.with_repo(MockOp::Stats, repo, |state| {
            let total: u64 = state.snapshots.iter().filter_map(|s| s.size_bytes).sum();
            let count = state.snapshots.len() as u64;
            Ok(match mode {
                StatsMode::RestoreSize => RepoStats {
                    total_size: total,
                    total_file_count: count,
                    snapshots_count: count,
                },
                StatsMode::RawData => RepoStats {
                    total_size: total / 2,
                    total_file_count: 0,
                    snapshots_count: count,
                },
            })
        })
        .await
    }

    async fn restore(
        &self,
        repo: &RepoAccess,
        snapshot_id: &str,
        target: &Path,
        include: Option<&Path>,
    ) -> ToolResult<()> {
        let mut args = vec![snapshot_id.to_string(), target.display().to_string()];
        if let Some(include) = include {
            args.push(include.display().to_string());
        }
        self.enter(MockOp::Restore, repo, args).await?;

        let full_id = self
            .with_repo(MockOp::Restore, repo, |state| {
                Ok(find_snapshot(state, snapshot_id, "restore")?.id.clone())
            })
            .await?;

        let dir = match include {
            Some(include) => target.join(include.strip_prefix("/").unwrap_or(include)),
            None => target.to_path_buf(),
        };
        let written = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(dir.join("restored.txt"), full_id.as_bytes()).await
        };
        written.await.map_err(ToolError::Spawn)
    }

    async fn list_locks(&self, repo: &RepoAccess) -> ToolResult<Vec<String>> {
        self.enter(MockOp::Locks, repo, vec![]).await?;
        self.with_repo(MockOp::Locks, repo, |state| Ok(state.locks.clone()))
            .await
    }

    async fn unlock(&self, repo: &RepoAccess) -> ToolResult<()> {
        self.enter(MockOp::Unlock, repo, vec![]).await?;
        self.with_repo(MockOp::Unlock, repo, |state| {
            state.locks.clear();
            Ok(())
        })
        .await
    }
}

fn find_snapshot<'a>(state: &'a mut MockRepo, id: &str, command: &str) -> ToolResult<&'a mut Snapshot> {
    state
        .snapshots
        .iter_mut()
        .find(|s| s.id == id || s.short_id == id || s.id.starts_with(id))
        .ok_or_else(|| ToolError::Failed {
            command: command.to_string(),
            message: format!("Fatal: no matching ID found for prefix \"{}\"", id),
        })
}
