use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use resticd_common::{BackupError, OperationKind, OperationRecord, Result, StatsMode};
use resticd_engine::retention::{self, ProtectedSet};
use resticd_engine::tool::resolve_snapshot_id;
use resticd_engine::{
    is_valid_identifier, ArchiveBrowser, ArchiveCache, ArchiveDownload, ArchiveEntry,
    ConcurrencyGuard, EngineConfig, OperationTicket, PreparedArchive, Recovery, RepoAccess,
    RepoLocation, RepositoryResolver, ResticTool, SnapshotTool, StatusStore, ToolResult,
};
use tracing::{error, info, instrument, warn, Instrument};

pub use resticd_engine as engine;
pub use resticd_common as common;

mod types;

pub use types::{
    BackupCreated, BackupEntry, CreateBackup, Dispatch, Download, LockState, RepoTarget,
    RepositoryStats, RestoreOutcome,
};

// --- Orchestrator Implementation ---
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<EngineConfig>,
    tool: Arc<dyn SnapshotTool>,
    resolver: RepositoryResolver,
    guard: ConcurrencyGuard,
    recovery: Recovery,
    cache: ArchiveCache,
    archives: ArchiveBrowser,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, tool: Arc<dyn SnapshotTool>) -> Self {
        let resolver = RepositoryResolver::new(&config);
        let guard = ConcurrencyGuard::new(StatusStore::new(&config), config.message_limit);
        let recovery = Recovery::new(tool.clone(), resolver.clone(), &config);
        Self {
            cache: ArchiveCache::new(&config),
            archives: ArchiveBrowser::new(&config),
            config: Arc::new(config),
            tool,
            resolver,
            guard,
            recovery,
        }
    }

    /// Orchestrator driving the restic binary named in `config`.
    pub fn with_restic(config: EngineConfig) -> Self {
        let tool = Arc::new(ResticTool::new(&config));
        Self::new(config, tool)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- Repository access ---

    async fn open(&self, target: &RepoTarget) -> Result<(RepoLocation, RepoAccess)> {
        let location = self
            .resolver
            .resolve(&target.server_id, target.owner.as_deref())
            .await?;
        let key = self
            .resolver
            .resolve_key(&location, target.supplied_key())
            .await?;
        let access = RepoAccess::new(location.path.clone(), key);
        Ok((location, access))
    }

    /// Like `open`, but the repository must already exist.
    async fn open_existing(&self, target: &RepoTarget) -> Result<(RepoLocation, RepoAccess)> {
        let location = self
            .resolver
            .resolve(&target.server_id, target.owner.as_deref())
            .await?;
        if !location.exists {
            return Err(BackupError::NotFound(format!(
                "no repository for server {}",
                target.server_id
            )));
        }
        let key = self
            .resolver
            .resolve_key(&location, target.supplied_key())
            .await?;
        let access = RepoAccess::new(location.path.clone(), key);
        Ok((location, access))
    }

    /// The stored key may have been replaced by a remediation.
    async fn current_access(&self, location: &RepoLocation, access: &RepoAccess) -> Result<RepoAccess> {
        match self.resolver.resolve_key(location, None).await {
            Ok(key) => Ok(RepoAccess::new(location.path.clone(), key)),
            Err(BackupError::MissingKey) => Ok(access.clone()),
            Err(e) => Err(e),
        }
    }

    async fn with_recovery<T, F, Fut>(
        &self,
        location: &RepoLocation,
        access: &RepoAccess,
        supplied_key: Option<&str>,
        op: F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn SnapshotTool>, RepoAccess) -> Fut,
        Fut: Future<Output = ToolResult<T>>,
    {
        let tool = self.tool.clone();
        self.recovery
            .run(location, access.clone(), supplied_key, move |access| {
                op(tool.clone(), access)
            })
            .await
    }

    /// Listing plus its protection set, computed once.
    async fn listing(
        &self,
        location: &RepoLocation,
        access: &RepoAccess,
        supplied_key: Option<&str>,
    ) -> Result<(Vec<resticd_common::Snapshot>, ProtectedSet, RepoAccess)> {
        let snapshots = self
            .with_recovery(location, access, supplied_key, |tool, access| async move {
                tool.snapshots(&access, None).await
            })
            .await?;
        let access = self.current_access(location, access).await?;
        let protected =
            ProtectedSet::load(&*self.tool, &access, &snapshots, &self.config.protected_tag)
                .await?;
        Ok((snapshots, protected, access))
    }

    /// Run `job` to a terminal state, inline or on a detached task.
    async fn dispatch<T, Fut>(&self, ticket: OperationTicket, detach: bool, job: Fut) -> Result<Dispatch<T>>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if detach {
            let record = ticket.record().clone();
            tokio::spawn(
                async move {
                    let failure = job.await.err().map(|e| e.to_string());
                    if let Err(e) = ticket.settle(failure).await {
                        error!(error = %e, "Failed to record operation outcome");
                    }
                }
                .in_current_span(),
            );
            return Ok(Dispatch::Started(record));
        }

        let outcome = job.await.map_err(|e| e.map_message(|m| ticket.redact(m)));
        let failure = outcome.as_ref().err().map(|e| e.to_string());
        if let Err(e) = ticket.settle(failure).await {
            error!(error = %e, "Failed to record operation outcome");
        }
        outcome.map(Dispatch::Finished)
    }

    // --- Backups ---

    #[instrument(skip(self, request), fields(server = %request.target.server_id))]
    pub async fn create_backup(&self, request: CreateBackup) -> Result<Dispatch<BackupCreated>> {
        validate_tags(&request.tags)?;
        let (location, access) = self.open(&request.target).await?;

        let ticket = self
            .guard
            .begin(&request.target.server_id, OperationKind::Backup)
            .await?;
        let ticket = redact_keys(ticket, &access, &request.target);
        info!(repository = %location.dir_name, detach = request.detach, "Backup accepted");

        let this = self.clone();
        let detach = request.detach;
        let job = async move { this.run_backup(location, access, request).await };
        self.dispatch(ticket, detach, job).await
    }

    async fn run_backup(
        &self,
        location: RepoLocation,
        access: RepoAccess,
        request: CreateBackup,
    ) -> Result<BackupCreated> {
        let supplied = request.target.supplied_key();
        let source = self.config.volume_path(&request.target.server_id);
        if !tokio::fs::metadata(&source).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(BackupError::NotFound(format!(
                "server volume {} does not exist",
                source.display()
            )));
        }

        self.resolver.ensure_dir(&location).await?;
        if !location.is_initialized() {
            info!(repository = %location.dir_name, "Initializing repository");
            self.tool.init(&access).await?;
        }

        let disk_bytes = self.resolver.size_bytes(&location).await?;
        retention::check_size(&request.policy, disk_bytes)?;

        let mut access = access;
        let mut pruned = Vec::new();
        if request.policy.snapshot_limit().is_some() {
            let (snapshots, protected, current) = self.listing(&location, &access, supplied).await?;
            access = current;
            let plan = retention::plan(&request.policy, &snapshots, &protected, disk_bytes)?;
            for id in plan.delete {
                let ids = vec![id.clone()];
                self.with_recovery(&location, &access, supplied, |tool, access| {
                    let ids = ids.clone();
                    async move { tool.forget(&access, &ids, true).await }
                })
                .await?;
                info!(snapshot_id = %id, "Retention removed snapshot");
                pruned.push(id);
            }
        }

        let tags = request.tags.clone();
        let summary = self
            .with_recovery(&location, &access, supplied, |tool, access| {
                let source = source.clone();
                let tags = tags.clone();
                async move { tool.backup(&access, &source, &tags).await }
            })
            .await?;
        info!(snapshot_id = ?summary.snapshot_id, pruned = pruned.len(), "Backup created");

        Ok(BackupCreated {
            snapshot_id: summary.snapshot_id.clone(),
            pruned,
            summary,
        })
    }

    /// Snapshots newest first, each flagged when protected.
    #[instrument(skip(self, target), fields(server = %target.server_id))]
    pub async fn list_backups(&self, target: &RepoTarget) -> Result<Vec<BackupEntry>> {
        let location = self
            .resolver
            .resolve(&target.server_id, target.owner.as_deref())
            .await?;
        if !location.exists || !location.is_initialized() {
            return Ok(Vec::new());
        }
        let (_, access) = self.open(target).await?;
        let (snapshots, protected, _) = self.listing(&location, &access, target.supplied_key()).await?;

        let mut entries: Vec<BackupEntry> = snapshots
            .into_iter()
            .map(|s| {
                let locked = protected.contains(&s.id);
                BackupEntry::from_snapshot(s, locked)
            })
            .collect();
        entries.sort_by(|a, b| b.time.cmp(&a.time));
        Ok(entries)
    }

    #[instrument(skip(self, target), fields(server = %target.server_id))]
    pub async fn backup_status(&self, target: &RepoTarget) -> Result<OperationRecord> {
        self.guard
            .store()
            .read_or_idle(&target.server_id, OperationKind::Backup)
            .await
    }

    #[instrument(skip(self, target), fields(server = %target.server_id, snapshot = %backup_id))]
    pub async fn lock_backup(&self, target: &RepoTarget, backup_id: &str) -> Result<LockState> {
        self.set_protection(target, backup_id, true).await
    }

    #[instrument(skip(self, target), fields(server = %target.server_id, snapshot = %backup_id))]
    pub async fn unlock_backup(&self, target: &RepoTarget, backup_id: &str) -> Result<LockState> {
        self.set_protection(target, backup_id, false).await
    }

    async fn set_protection(&self, target: &RepoTarget, backup_id: &str, locked: bool) -> Result<LockState> {
        validate_backup_id(backup_id)?;
        let (location, access) = self.open_existing(target).await?;
        let supplied = target.supplied_key();
        let (snapshots, _, access) = self.listing(&location, &access, supplied).await?;
        let snapshot_id =
            resolve_snapshot_id(&snapshots, backup_id).unwrap_or_else(|| backup_id.to_string());

        let tag = self.config.protected_tag.clone();
        let id = snapshot_id.clone();
        self.with_recovery(&location, &access, supplied, |tool, access| {
            let tag = tag.clone();
            let id = id.clone();
            async move {
                if locked {
                    tool.add_tag(&access, &id, &tag).await
                } else {
                    tool.remove_tag(&access, &id, &tag).await
                }
            }
        })
        .await?;

        info!(snapshot_id = %snapshot_id, locked, "Updated snapshot protection");
        Ok(LockState {
            snapshot_id,
            locked,
        })
    }

    /// Forget and prune one snapshot. Protected snapshots are refused.
    #[instrument(skip(self, target), fields(server = %target.server_id, snapshot = %backup_id))]
    pub async fn delete_backup(&self, target: &RepoTarget, backup_id: &str) -> Result<String> {
        validate_backup_id(backup_id)?;
        let (location, access) = self.open_existing(target).await?;
        let supplied = target.supplied_key();
        let (snapshots, protected, access) = self.listing(&location, &access, supplied).await?;

        let resolved = resolve_snapshot_id(&snapshots, backup_id);
        let is_protected = match &resolved {
            Some(id) => protected.contains(id),
            // The tool gets the raw id; refuse if it could reach a protected snapshot.
            None => snapshots.iter().any(|s| {
                protected.contains(&s.id)
                    && (s.id.starts_with(backup_id) || s.short_id == backup_id)
            }),
        };
        if is_protected {
            warn!("Refusing to delete protected snapshot");
            return Err(BackupError::Conflict(format!(
                "backup {} is locked",
                backup_id
            )));
        }

        let snapshot_id = resolved.unwrap_or_else(|| backup_id.to_string());
        let ids = vec![snapshot_id.clone()];
        self.with_recovery(&location, &access, supplied, |tool, access| {
            let ids = ids.clone();
            async move { tool.forget(&access, &ids, true).await }
        })
        .await?;

        info!(snapshot_id = %snapshot_id, "Deleted snapshot");
        Ok(snapshot_id)
    }

    #[instrument(skip(self, target), fields(server = %target.server_id))]
    pub async fn repository_stats(&self, target: &RepoTarget) -> Result<RepositoryStats> {
        let (location, access) = self.open_existing(target).await?;
        let supplied = target.supplied_key();

        let restore_size = self
            .with_recovery(&location, &access, supplied, |tool, access| async move {
                tool.stats(&access, StatsMode::RestoreSize).await
            })
            .await?;
        let access = self.current_access(&location, &access).await?;
        let raw_data = self
            .with_recovery(&location, &access, supplied, |tool, access| async move {
                tool.stats(&access, StatsMode::RawData).await
            })
            .await?;

        Ok(RepositoryStats {
            restore_size,
            raw_data,
            disk_bytes: self.resolver.size_bytes(&location).await?,
        })
    }

    /// Move every repository of the server into the archive root.
    #[instrument(skip(self))]
    pub async fn delete_repository(&self, server_id: &str) -> Result<usize> {
        for kind in [OperationKind::Backup, OperationKind::Restore] {
            if self.guard.store().read_or_idle(server_id, kind).await?.is_running() {
                return Err(BackupError::Conflict(format!(
                    "{} running for {}",
                    kind, server_id
                )));
            }
        }
        let moved = self.resolver.archive_server(server_id).await?;
        info!(moved, "Archived server repositories");
        Ok(moved)
    }

    // --- Restore ---

    #[instrument(skip(self, target), fields(server = %target.server_id, snapshot = %backup_id))]
    pub async fn restore_backup(
        &self,
        target: &RepoTarget,
        backup_id: &str,
        detach: bool,
    ) -> Result<Dispatch<RestoreOutcome>> {
        validate_backup_id(backup_id)?;
        let (location, access) = self.open_existing(target).await?;

        let ticket = self
            .guard
            .begin(&target.server_id, OperationKind::Restore)
            .await?;
        let ticket = redact_keys(ticket, &access, target);
        info!(detach, "Restore accepted");

        let this = self.clone();
        let target = target.clone();
        let backup_id = backup_id.to_string();
        let job = async move { this.run_restore(location, access, target, backup_id).await };
        self.dispatch(ticket, detach, job).await
    }

    async fn run_restore(
        &self,
        location: RepoLocation,
        access: RepoAccess,
        target: RepoTarget,
        backup_id: String,
    ) -> Result<RestoreOutcome> {
        let supplied = target.supplied_key();
        let (snapshots, _, access) = self.listing(&location, &access, supplied).await?;
        let snapshot_id =
            resolve_snapshot_id(&snapshots, &backup_id).unwrap_or_else(|| backup_id.clone());

        let restore_target = self.config.restore_target.clone();
        let include = self.config.volume_path(&target.server_id);
        let id = snapshot_id.clone();
        self.with_recovery(&location, &access, supplied, |tool, access| {
            let restore_target = restore_target.clone();
            let include = include.clone();
            let id = id.clone();
            async move {
                tool.restore(&access, &id, &restore_target, Some(include.as_path()))
                    .await
            }
        })
        .await?;

        info!(snapshot_id = %snapshot_id, "Restore completed");
        Ok(RestoreOutcome { snapshot_id })
    }

    #[instrument(skip(self, target), fields(server = %target.server_id))]
    pub async fn restore_status(&self, target: &RepoTarget) -> Result<OperationRecord> {
        self.guard
            .store()
            .read_or_idle(&target.server_id, OperationKind::Restore)
            .await
    }

    // --- Prepared downloads ---

    #[instrument(skip(self, target), fields(server = %target.server_id, snapshot = %backup_id))]
    pub async fn prepare_download(
        &self,
        target: &RepoTarget,
        backup_id: &str,
        detach: bool,
    ) -> Result<Dispatch<PreparedArchive>> {
        validate_backup_id(backup_id)?;
        let (location, access) = self.open_existing(target).await?;

        let entity = prepare_entity(&target.server_id, backup_id);
        let ticket = self.guard.begin(&entity, OperationKind::Prepare).await?;
        let ticket = redact_keys(ticket, &access, target);

        let this = self.clone();
        let target = target.clone();
        let backup_id = backup_id.to_string();
        let job = async move { this.run_prepare(location, access, target, backup_id).await };
        self.dispatch(ticket, detach, job).await
    }

    async fn run_prepare(
        &self,
        location: RepoLocation,
        access: RepoAccess,
        target: RepoTarget,
        backup_id: String,
    ) -> Result<PreparedArchive> {
        if let Some(existing) = self.cache.lookup(&target.server_id, &backup_id).await? {
            info!(path = %existing.path.display(), "Prepared archive already cached");
            return Ok(existing);
        }

        let supplied = target.supplied_key();
        let (snapshots, _, access) = self.listing(&location, &access, supplied).await?;
        let snapshot_id =
            resolve_snapshot_id(&snapshots, &backup_id).unwrap_or_else(|| backup_id.clone());

        self.cache
            .prepare_with(&target.server_id, &backup_id, |scratch: PathBuf, include: PathBuf| {
                let id = snapshot_id.clone();
                async move {
                    self.with_recovery(&location, &access, supplied, |tool, access| {
                        let scratch = scratch.clone();
                        let include = include.clone();
                        let id = id.clone();
                        async move { tool.restore(&access, &id, &scratch, Some(include.as_path())).await }
                    })
                    .await
                }
            })
            .await
    }

    #[instrument(skip(self, target), fields(server = %target.server_id, snapshot = %backup_id))]
    pub async fn prepare_status(&self, target: &RepoTarget, backup_id: &str) -> Result<OperationRecord> {
        validate_backup_id(backup_id)?;
        let entity = prepare_entity(&target.server_id, backup_id);
        self.guard
            .store()
            .read_or_idle(&entity, OperationKind::Prepare)
            .await
    }

    /// Stream the prepared archive, preparing it synchronously when missing.
    #[instrument(skip(self, target), fields(server = %target.server_id, snapshot = %backup_id))]
    pub async fn download(&self, target: &RepoTarget, backup_id: &str) -> Result<Download> {
        validate_backup_id(backup_id)?;

        let prepared = match self.cache.lookup(&target.server_id, backup_id).await? {
            Some(prepared) => prepared,
            None => match self.prepare_download(target, backup_id, false).await? {
                Dispatch::Finished(prepared) => prepared,
                Dispatch::Started(_) => {
                    return Err(BackupError::Internal(
                        "inline prepare returned without a result".to_string(),
                    ))
                }
            },
        };

        let stream = self.cache.open(&prepared.path).await?;
        info!(path = %prepared.path.display(), len = stream.len(), "Streaming prepared archive");
        Ok(Download {
            file_name: prepared.file_name(),
            len: stream.len(),
            stream,
        })
    }

    // --- Archived repositories ---

    pub async fn list_archives(&self) -> Result<Vec<ArchiveEntry>> {
        self.archives.list().await
    }

    #[instrument(skip(self))]
    pub async fn delete_archive(&self, archive_id: &str) -> Result<()> {
        self.archives.delete(archive_id).await
    }

    #[instrument(skip(self))]
    pub async fn download_archive(&self, archive_id: &str) -> Result<ArchiveDownload> {
        self.archives.stream_tar_gz(archive_id).await
    }
}

fn prepare_entity(server_id: &str, backup_id: &str) -> String {
    format!("{}-{}", server_id, backup_id)
}

/// Snapshot ids become restic arguments, so they may not look like flags.
fn validate_backup_id(backup_id: &str) -> Result<()> {
    if !is_valid_identifier(backup_id) {
        return Err(BackupError::InvalidRequest(format!(
            "invalid backup id: {:?}",
            backup_id
        )));
    }
    Ok(())
}

fn validate_tags(tags: &[String]) -> Result<()> {
    match tags.iter().find(|tag| !is_valid_identifier(tag)) {
        Some(tag) => Err(BackupError::InvalidRequest(format!("invalid tag: {:?}", tag))),
        None => Ok(()),
    }
}

fn redact_keys(ticket: OperationTicket, access: &RepoAccess, target: &RepoTarget) -> OperationTicket {
    let ticket = ticket.with_secret(access.key());
    match target.supplied_key() {
        Some(key) => ticket.with_secret(key),
        None => ticket,
    }
}
