use std::fs::File;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::Context as _;
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use resticd_common::{BackupError, Result};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::tool::{RepoAccess, SnapshotTool};

const ZSTD_LEVEL: i32 = 3;
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedArchive {
    pub path: PathBuf,
    pub size: u64,
    /// True when an existing cache entry was returned without a restore.
    pub reused: bool,
}

impl PreparedArchive {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Cached `tar.zst` exports of restored snapshots under `<restic_root>/temp/`.
#[derive(Debug, Clone)]
pub struct ArchiveCache {
    temp_dir: PathBuf,
    volumes_root: PathBuf,
}

impl ArchiveCache {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            temp_dir: config.temp_dir(),
            volumes_root: config.volumes_root.clone(),
        }
    }

    /// `<temp>/<server>-<first 16 hex digits of sha256(server \0 snapshot)>.tar.zst`
    pub fn cache_path(&self, server_id: &str, snapshot_id: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(server_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(snapshot_id.as_bytes());
        let digest = hex::encode(hasher.finalize());
        self.temp_dir
            .join(format!("{}-{}.tar.zst", server_id, &digest[..16]))
    }

    /// A valid entry, if any. Zero-byte entries are corrupt and get removed.
    pub async fn lookup(&self, server_id: &str, snapshot_id: &str) -> Result<Option<PreparedArchive>> {
        let path = self.cache_path(server_id, snapshot_id);
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() && metadata.len() > 0 => Ok(Some(PreparedArchive {
                path,
                size: metadata.len(),
                reused: true,
            })),
            Ok(metadata) if metadata.is_file() => {
                warn!(path = %path.display(), "Removing empty prepared archive");
                fs::remove_file(&path).await?;
                Ok(None)
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn prepare(
        &self,
        tool: &dyn SnapshotTool,
        access: &RepoAccess,
        server_id: &str,
        snapshot_id: &str,
    ) -> Result<PreparedArchive> {
        self.prepare_with(server_id, snapshot_id, |scratch, include| async move {
            tool.restore(access, snapshot_id, &scratch, Some(include.as_path()))
                .await
                .map_err(BackupError::from)
        })
        .await
    }

    /// Like `prepare`, with the restore step supplied by the caller.
    ///
    /// `restore` receives the scratch directory and the volume path to include.
    pub async fn prepare_with<F, Fut>(
        &self,
        server_id: &str,
        snapshot_id: &str,
        restore: F,
    ) -> Result<PreparedArchive>
    where
        F: FnOnce(PathBuf, PathBuf) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if let Some(existing) = self.lookup(server_id, snapshot_id).await? {
            debug!(path = %existing.path.display(), "Reusing prepared archive");
            return Ok(existing);
        }

        fs::create_dir_all(&self.temp_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix(".restore-")
            .tempdir_in(&self.temp_dir)?;
        let include = self.volumes_root.join(server_id);

        info!(server_id, snapshot_id, "Restoring snapshot for archive");
        let outcome = async {
            restore(scratch.path().to_path_buf(), include).await?;
            let source = self.locate_volume(scratch.path(), server_id).await;
            self.compress(&source, server_id, snapshot_id).await
        }
        .await;

        let scratch_path = scratch.path().to_path_buf();
        match tokio::task::spawn_blocking(move || scratch.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(path = %scratch_path.display(), error = %e, "Failed to remove scratch directory"),
            Err(e) => warn!(path = %scratch_path.display(), error = %e, "Scratch cleanup task failed"),
        }

        let prepared = outcome?;
        info!(path = %prepared.path.display(), size = prepared.size, "Prepared archive");
        Ok(prepared)
    }

    /// Snapshots store absolute volume paths, so the data lands nested in the scratch dir.
    async fn locate_volume(&self, scratch: &Path, server_id: &str) -> PathBuf {
        let relative = self
            .volumes_root
            .strip_prefix("/")
            .unwrap_or(&self.volumes_root);
        let nested = scratch.join(relative).join(server_id);
        match fs::metadata(&nested).await {
            Ok(metadata) if metadata.is_dir() => nested,
            _ => scratch.to_path_buf(),
        }
    }

    async fn compress(&self, source: &Path, server_id: &str, snapshot_id: &str) -> Result<PreparedArchive> {
        let path = self.cache_path(server_id, snapshot_id);
        let mut partial = path.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let source = source.to_path_buf();
        let dest = partial.clone();
        let size = tokio::task::spawn_blocking(move || compress_dir(&source, &dest))
            .await
            .map_err(|e| BackupError::Internal(format!("compression task failed: {}", e)))?
            .map_err(|e| BackupError::Internal(format!("{:#}", e)));

        let size = match size {
            Ok(size) => size,
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        fs::rename(&partial, &path).await?;
        Ok(PreparedArchive {
            path,
            size,
            reused: false,
        })
    }

    /// Stream a cache entry; it is deleted once every byte has been yielded.
    pub async fn open(&self, path: &Path) -> Result<CacheStream> {
        let not_found = || BackupError::NotFound(format!("prepared archive {}", display_name(path)));

        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        if metadata.len() == 0 {
            warn!(path = %path.display(), "Removing empty prepared archive");
            let _ = fs::remove_file(path).await;
            return Err(not_found());
        }

        let file = fs::File::open(path).await?;
        Ok(CacheStream::new(file, path.to_path_buf(), metadata.len()))
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn compress_dir(source: &Path, dest: &Path) -> anyhow::Result<u64> {
    let file = File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
    let encoder = zstd::Encoder::new(file, ZSTD_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", source)
        .with_context(|| format!("archiving {}", source.display()))?;
    let file = builder.into_inner()?.finish()?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

struct ReadState {
    file: fs::File,
    path: PathBuf,
    remaining: u64,
}

/// Chunks of one cache entry, with its total length for `Content-Length`.
pub struct CacheStream {
    len: u64,
    inner: BoxStream<'static, std::io::Result<Bytes>>,
}

impl CacheStream {
    fn new(file: fs::File, path: PathBuf, len: u64) -> Self {
        let state = Some(ReadState {
            file,
            path,
            remaining: len,
        });
        let inner = stream::unfold(state, |state| async move {
            let mut state = state?;
            let mut buf = vec![0u8; CHUNK_SIZE];
            let n = match state.file.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => return Some((Err(e), None)),
            };
            if n == 0 {
                let err = std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "prepared archive shrank while streaming",
                );
                return Some((Err(err), None));
            }
            buf.truncate(n);
            state.remaining = state.remaining.saturating_sub(n as u64);

            if state.remaining == 0 {
                match fs::remove_file(&state.path).await {
                    Ok(()) => debug!(path = %state.path.display(), "Removed delivered archive"),
                    Err(e) => warn!(path = %state.path.display(), error = %e, "Failed to remove delivered archive"),
                }
                return Some((Ok(Bytes::from(buf)), None));
            }
            Some((Ok(Bytes::from(buf)), Some(state)))
        })
        .boxed();

        Self { len, inner }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Stream for CacheStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockOp, MockTool};
    use chrono::Utc;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, ArchiveCache, MockTool, RepoAccess, String) {
        let dir = TempDir::new().unwrap();
        let cache = ArchiveCache::new(&EngineConfig::rooted_at(dir.path()));
        let mock = MockTool::new();
        let access = RepoAccess::new(dir.path().join("srv1"), "key");
        mock.seed_repo(&access).await;
        let snapshot = mock.seed_snapshot(&access, Utc::now(), &[]).await;
        (dir, cache, mock, access, snapshot)
    }

    fn archive_entries(path: &Path) -> Vec<String> {
        let raw = std::fs::read(path).unwrap();
        let tar_bytes = zstd::decode_all(&raw[..]).unwrap();
        let mut archive = tar::Archive::new(std::io::Cursor::new(tar_bytes));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_cache_path_is_stable() {
        let cache = ArchiveCache::new(&EngineConfig::rooted_at("/srv/restic"));
        let a = cache.cache_path("srv1", "abc");
        assert_eq!(a, cache.cache_path("srv1", "abc"));
        assert_ne!(a, cache.cache_path("srv1", "abd"));

        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("srv1-"));
        assert!(name.ends_with(".tar.zst"));
        assert_eq!(name.len(), "srv1-".len() + 16 + ".tar.zst".len());
        assert_eq!(a.parent().unwrap(), Path::new("/srv/restic/temp"));
    }

    #[tokio::test]
    async fn test_prepare_then_reuse() {
        let (_dir, cache, mock, access, snapshot) = setup().await;

        let first = cache.prepare(&mock, &access, "srv1", &snapshot).await.unwrap();
        assert!(!first.reused);
        assert!(first.size > 0);
        assert!(archive_entries(&first.path)
            .iter()
            .any(|p| p.ends_with("restored.txt")));

        let second = cache.prepare(&mock, &access, "srv1", &snapshot).await.unwrap();
        assert!(second.reused);
        assert_eq!(second.path, first.path);
        assert_eq!(mock.call_count(MockOp::Restore).await, 1);

        let restore = &mock.calls_for(MockOp::Restore).await[0];
        assert!(restore.args.iter().any(|a| a.ends_with("/volumes/srv1")));

        // Scratch directories never outlive the prepare.
        let leftovers = std::fs::read_dir(first.path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".restore-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_empty_entry_is_rebuilt() {
        let (_dir, cache, mock, access, snapshot) = setup().await;
        let path = cache.cache_path("srv1", &snapshot);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"").unwrap();

        assert!(cache.lookup("srv1", &snapshot).await.unwrap().is_none());
        assert!(!path.exists());

        std::fs::write(&path, b"").unwrap();
        let prepared = cache.prepare(&mock, &access, "srv1", &snapshot).await.unwrap();
        assert!(!prepared.reused);
        assert_eq!(mock.call_count(MockOp::Restore).await, 1);
    }

    #[tokio::test]
    async fn test_failed_restore_leaves_no_entry() {
        let (_dir, cache, mock, access, _snapshot) = setup().await;
        let err = cache.prepare(&mock, &access, "srv1", "deadbeef").await.unwrap_err();
        assert!(matches!(err, BackupError::ToolFailure(_)));
        assert!(!cache.cache_path("srv1", "deadbeef").exists());
    }

    #[tokio::test]
    async fn test_stream_deletes_after_full_read() {
        let (_dir, cache, mock, access, snapshot) = setup().await;
        let prepared = cache.prepare(&mock, &access, "srv1", &snapshot).await.unwrap();
        let expected = std::fs::read(&prepared.path).unwrap();

        let stream = cache.open(&prepared.path).await.unwrap();
        assert_eq!(stream.len(), expected.len() as u64);
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), expected);
        assert!(!prepared.path.exists());
    }

    #[tokio::test]
    async fn test_abandoned_stream_keeps_entry() {
        let (_dir, cache, mock, access, snapshot) = setup().await;
        let prepared = cache.prepare(&mock, &access, "srv1", &snapshot).await.unwrap();

        let stream = cache.open(&prepared.path).await.unwrap();
        drop(stream);
        assert!(prepared.path.exists());
    }

    #[tokio::test]
    async fn test_open_empty_is_not_found() {
        let dir = TempDir::new().unwrap();
        let cache = ArchiveCache::new(&EngineConfig::rooted_at(dir.path()));
        let path = dir.path().join("empty.tar.zst");
        std::fs::write(&path, b"").unwrap();

        assert!(matches!(cache.open(&path).await, Err(BackupError::NotFound(_))));
        assert!(!path.exists());
        assert!(matches!(cache.open(&path).await, Err(BackupError::NotFound(_))));
    }
}
