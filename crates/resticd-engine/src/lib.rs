//! Repository-state engine for restic backups
//!
//! Components, leaf first:
//! - `status`: durable per (entity, kind) operation records
//! - `repo`: repository location and key resolution
//! - `tool`: the restic subprocess adapter behind the `SnapshotTool` trait
//! - `guard`: cooperative per-entity serialization on top of the status store
//! - `retention`: deletion planning under count and size ceilings
//! - `recovery`: bounded remediation of stale locks and fresh-repo key mismatches
//! - `cache`: prepared `tar.zst` exports of restored snapshots
//! - `archive`: browsing repositories archived after server deletion

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

// Re-export dependencies potentially needed by consumers (like orchestrator)
pub use resticd_common as common;

pub mod archive;
pub mod cache;
pub mod config;
pub mod guard;
pub mod recovery;
pub mod repo;
pub mod retention;
pub mod status;
pub mod test_utils;
pub mod tool;

pub use archive::{ArchiveBrowser, ArchiveDownload, ArchiveEntry};
pub use cache::{ArchiveCache, CacheStream, PreparedArchive};
pub use config::{EngineConfig, ToolTimeouts};
pub use guard::{ConcurrencyGuard, OperationTicket};
pub use recovery::Recovery;
pub use repo::{RepoLocation, RepositoryResolver};
pub use retention::{ProtectedSet, RetentionPlan, RetentionPolicy};
pub use status::{Claim, StatusStore};
pub use tool::{LockInfo, RepoAccess, ResticTool, SnapshotTool, ToolError, ToolResult};

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._+@-]{0,254}$").expect("identifier pattern is valid")
    })
}

/// Server ids, owners, status entities and archive names all share this alphabet.
pub fn is_valid_identifier(id: &str) -> bool {
    identifier_pattern().is_match(id)
}

/// Recursive sum of regular file sizes. A missing directory counts as empty.
pub(crate) async fn dir_size(root: &Path) -> std::io::Result<u64> {
    let mut size = 0u64;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                size += metadata.len();
            } else if metadata.is_dir() {
                pending.push(entry.path());
            }
        }
    }

    Ok(size)
}
