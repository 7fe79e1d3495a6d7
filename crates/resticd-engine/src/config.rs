use std::path::PathBuf;
use std::time::Duration;

use resticd_common::{MESSAGE_LIMIT, PROTECTED_TAG};
use tracing::warn;

/// Hard deadlines for each snapshot tool primitive.
#[derive(Debug, Clone)]
pub struct ToolTimeouts {
    pub init: Duration,
    pub backup: Duration,
    pub snapshots: Duration,
    pub tag: Duration,
    pub forget: Duration,
    pub stats: Duration,
    pub restore: Duration,
    pub locks: Duration,
    pub unlock: Duration,
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            init: Duration::from_secs(2 * 60),
            backup: Duration::from_secs(6 * 3600),
            snapshots: Duration::from_secs(5 * 60),
            tag: Duration::from_secs(5 * 60),
            forget: Duration::from_secs(3600),
            stats: Duration::from_secs(30 * 60),
            restore: Duration::from_secs(6 * 3600),
            locks: Duration::from_secs(5 * 60),
            unlock: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub restic_binary: PathBuf,
    /// Parent directory of every repository, key file, status record and cache entry.
    pub restic_root: PathBuf,
    pub volumes_root: PathBuf,
    /// Directory a restore writes into; snapshots hold absolute volume paths.
    pub restore_target: PathBuf,
    pub protected_tag: String,
    /// Age after which a running record is reaped. Equal to the backup and restore
    /// deadlines, so a run can be reaped while its tool call is still inside its
    /// deadline. The reaped run then finds the record taken over and leaves it alone.
    pub stale_after: Duration,
    pub status_retention: Duration,
    pub stale_lock_after: Duration,
    pub fresh_repo_window: Duration,
    pub fresh_repo_max_bytes: u64,
    pub message_limit: usize,
    pub timeouts: ToolTimeouts,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            restic_binary: PathBuf::from("restic"),
            restic_root: PathBuf::from("/var/lib/pterodactyl/restic"),
            volumes_root: PathBuf::from("/var/lib/pterodactyl/volumes"),
            restore_target: PathBuf::from("/"),
            protected_tag: PROTECTED_TAG.to_string(),
            stale_after: Duration::from_secs(6 * 3600),
            status_retention: Duration::from_secs(7 * 24 * 3600),
            stale_lock_after: Duration::from_secs(30 * 60),
            fresh_repo_window: Duration::from_secs(2 * 60),
            fresh_repo_max_bytes: 1024 * 1024, // 1MiB
            message_limit: MESSAGE_LIMIT,
            timeouts: ToolTimeouts::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults rooted at `restic_root`, used by tests and embedded setups.
    pub fn rooted_at(restic_root: impl Into<PathBuf>) -> Self {
        Self {
            restic_root: restic_root.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `RESTICD_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(binary) = env_path("RESTICD_RESTIC_BINARY") {
            config.restic_binary = binary;
        }
        if let Some(root) = env_path("RESTICD_ROOT") {
            config.restic_root = root;
        }
        if let Some(volumes) = env_path("RESTICD_VOLUMES_ROOT") {
            config.volumes_root = volumes;
        }
        if let Some(target) = env_path("RESTICD_RESTORE_TARGET") {
            config.restore_target = target;
        }
        if let Ok(raw) = std::env::var("RESTICD_STALE_LOCK_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) => config.stale_lock_after = Duration::from_secs(secs),
                Err(_) => warn!(value = %raw, "Ignoring invalid RESTICD_STALE_LOCK_SECS"),
            }
        }

        config
    }

    pub fn status_dir(&self) -> PathBuf {
        self.restic_root.join(".status")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.restic_root.join(".keys")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.restic_root.join("temp")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.restic_root.join("archive")
    }

    /// Data directory of one server, the source of every backup.
    pub fn volume_path(&self, server_id: &str) -> PathBuf {
        self.volumes_root.join(server_id)
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
