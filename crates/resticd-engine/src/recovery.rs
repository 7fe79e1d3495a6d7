use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use resticd_common::{BackupError, Result};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::repo::{RepoLocation, RepositoryResolver};
use crate::tool::{RepoAccess, SnapshotTool, ToolError, ToolResult};

const KEY_MISMATCH: &str = "encryption key does not match repository";

/// Bounded remediation around one tool primitive. Each remedy runs at most once.
#[derive(Clone)]
pub struct Recovery {
    tool: Arc<dyn SnapshotTool>,
    resolver: RepositoryResolver,
    stale_lock_after: Duration,
    fresh_repo_window: Duration,
    fresh_repo_max_bytes: u64,
}

impl Recovery {
    pub fn new(tool: Arc<dyn SnapshotTool>, resolver: RepositoryResolver, config: &EngineConfig) -> Self {
        Self {
            tool,
            resolver,
            stale_lock_after: config.stale_lock_after,
            fresh_repo_window: config.fresh_repo_window,
            fresh_repo_max_bytes: config.fresh_repo_max_bytes,
        }
    }

    /// Run `op`, unlocking a stale repository lock or re-initializing a fresh
    /// repository on key mismatch before a single retry.
    ///
    /// `supplied_key` is the key from the request; after a re-initialization it
    /// becomes the stored key.
    pub async fn run<T, F, Fut>(
        &self,
        location: &RepoLocation,
        access: RepoAccess,
        supplied_key: Option<&str>,
        op: F,
    ) -> Result<T>
    where
        F: Fn(RepoAccess) -> Fut,
        Fut: Future<Output = ToolResult<T>>,
    {
        match op(access.clone()).await {
            Ok(value) => Ok(value),
            Err(ToolError::Busy(lock)) => {
                let age = lock.age_at(Utc::now());
                match age {
                    Some(age) if age >= self.stale_lock_after => {
                        warn!(
                            repository = %location.dir_name,
                            lock_age_secs = age.as_secs(),
                            "Removing stale repository lock"
                        );
                        self.tool.unlock(&access).await?;
                        Ok(op(access).await?)
                    }
                    _ => {
                        info!(
                            repository = %location.dir_name,
                            lock_age_secs = age.map(|a| a.as_secs()),
                            "Repository lock is held by a live process"
                        );
                        Err(BackupError::Conflict("repository busy".to_string()))
                    }
                }
            }
            Err(ToolError::KeyMismatch) => {
                if !self.is_fresh(location).await? {
                    return Err(BackupError::ToolFailure(KEY_MISMATCH.to_string()));
                }

                let key = supplied_key
                    .filter(|key| !key.is_empty())
                    .unwrap_or(access.key())
                    .to_string();
                warn!(
                    repository = %location.dir_name,
                    "Re-initializing freshly created repository after key mismatch"
                );
                self.resolver.wipe(location).await?;
                let fresh = RepoAccess::new(access.path.clone(), key.clone());
                self.tool.init(&fresh).await?;
                self.resolver.replace_key(location, &key).await?;
                Ok(op(fresh).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn is_fresh(&self, location: &RepoLocation) -> Result<bool> {
        let Some(age) = self.resolver.age(location).await else {
            return Ok(false);
        };
        if age >= self.fresh_repo_window {
            return Ok(false);
        }
        Ok(self.resolver.size_bytes(location).await? < self.fresh_repo_max_bytes)
    }
}
