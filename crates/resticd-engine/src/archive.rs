use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream::{self, BoxStream, StreamExt};
use resticd_common::{BackupError, Result};
use serde::Serialize;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::{dir_size, is_valid_identifier};

const CHANNEL_DEPTH: usize = 16;
const WRITE_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveEntry {
    pub id: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

pub struct ArchiveDownload {
    pub file_name: String,
    pub stream: BoxStream<'static, std::io::Result<Bytes>>,
}

/// Repositories moved aside after their server was deleted.
#[derive(Debug, Clone)]
pub struct ArchiveBrowser {
    root: PathBuf,
}

impl ArchiveBrowser {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            root: config.archive_dir(),
        }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Newest first. A missing archive root is an empty list.
    pub async fn list(&self) -> Result<Vec<ArchiveEntry>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut archives = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_valid_identifier(&id) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
            archives.push(ArchiveEntry {
                size_bytes: dir_size(&entry.path()).await?,
                modified_at: DateTime::<Utc>::from(modified),
                id,
            });
        }

        archives.sort_by(|a, b| b.modified_at.cmp(&a.modified_at).then_with(|| a.id.cmp(&b.id)));
        Ok(archives)
    }

    /// Validated path of one archive. Rejections happen before any file-system call.
    pub fn locate(&self, id: &str) -> Result<PathBuf> {
        let invalid = || BackupError::InvalidPath(format!("invalid archive id: {:?}", id));

        if !is_valid_identifier(id) {
            return Err(invalid());
        }
        if !Path::new(id)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(invalid());
        }

        let root = normalize(&self.root);
        let candidate = normalize(&root.join(id));
        if candidate == root || !candidate.starts_with(&root) {
            return Err(invalid());
        }
        Ok(candidate)
    }

    async fn existing(&self, id: &str) -> Result<PathBuf> {
        let path = self.locate(id)?;
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => Ok(path),
            Ok(_) => Err(BackupError::NotFound(format!("archive {}", id))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackupError::NotFound(format!("archive {}", id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let path = self.existing(id).await?;
        fs::remove_dir_all(&path).await?;

        let key = self.root.join(format!("{}.key", id));
        match fs::remove_file(&key).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(archive = id, "Deleted archived repository");
        Ok(())
    }

    /// Gzipped tar of the archive with entries under `<id>/`, produced on a blocking thread.
    pub async fn stream_tar_gz(&self, id: &str) -> Result<ArchiveDownload> {
        let path = self.existing(id).await?;
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(CHANNEL_DEPTH);
        let prefix = id.to_string();

        tokio::task::spawn_blocking(move || {
            let writer = ChannelWriter { tx: tx.clone() };
            if let Err(e) = write_tar_gz(&path, &prefix, writer) {
                // A closed receiver means the client went away; nothing to report to.
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    error!(archive = %prefix, error = %e, "Archive download failed");
                    let _ = tx.blocking_send(Err(e));
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        Ok(ArchiveDownload {
            file_name: format!("{}.tar.gz", id),
            stream,
        })
    }
}

fn write_tar_gz(source: &Path, prefix: &str, writer: ChannelWriter) -> std::io::Result<()> {
    let buffered = BufWriter::with_capacity(WRITE_BUFFER, writer);
    let encoder = GzEncoder::new(buffered, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(prefix, source)?;
    let mut buffered = builder.into_inner()?.finish()?;
    buffered.flush()
}

/// Blocking `Write` adapter over a bounded channel.
struct ChannelWriter {
    tx: mpsc::Sender<std::io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "download receiver closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Lexical normalization: drops `.` and resolves `..` without touching the disk.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use flate2::read::GzDecoder;
    use futures::TryStreamExt;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    #[test]
    fn test_traversal_rejected_for_any_root() {
        for root in ["/nonexistent/archive", "relative/archive", "/"] {
            let browser = ArchiveBrowser::with_root(root);
            for id in ["../secrets", "..", ".", "", "a/../../b", "/etc", ".hidden", "a/b"] {
                assert!(
                    matches!(browser.locate(id), Err(BackupError::InvalidPath(_))),
                    "{id:?} under {root:?} should be rejected"
                );
            }
            assert!(browser.locate("srv1+alice-1700000000").is_ok());
        }
    }

    #[tokio::test]
    async fn test_list_sorted_newest_first() {
        let dir = TempDir::new().unwrap();
        let browser = ArchiveBrowser::with_root(dir.path());
        for name in ["old", "new", "mid"] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
            std::fs::write(dir.path().join(name).join("config"), b"1234").unwrap();
        }
        std::fs::write(dir.path().join("old.key"), b"k").unwrap();
        let now = SystemTime::now();
        for (name, hours) in [("old", 48u64), ("mid", 24), ("new", 1)] {
            let t = now - Duration::from_secs(hours * 3600);
            filetime::set_file_mtime(dir.path().join(name), FileTime::from_system_time(t)).unwrap();
        }

        let ids: Vec<String> = browser.list().await.unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
        assert_eq!(browser.list().await.unwrap()[0].size_bytes, 4);

        let missing = ArchiveBrowser::with_root(dir.path().join("nope"));
        assert!(missing.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_dir_and_key() {
        let dir = TempDir::new().unwrap();
        let browser = ArchiveBrowser::with_root(dir.path());
        std::fs::create_dir_all(dir.path().join("srv1")).unwrap();
        std::fs::write(dir.path().join("srv1.key"), b"k").unwrap();

        browser.delete("srv1").await.unwrap();
        assert!(!dir.path().join("srv1").exists());
        assert!(!dir.path().join("srv1.key").exists());
        assert!(matches!(browser.delete("srv1").await, Err(BackupError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stream_prefixes_entries_with_id() {
        let dir = TempDir::new().unwrap();
        let browser = ArchiveBrowser::with_root(dir.path());
        std::fs::create_dir_all(dir.path().join("srv1/data")).unwrap();
        std::fs::write(dir.path().join("srv1/config"), b"cfg").unwrap();
        std::fs::write(dir.path().join("srv1/data/pack"), vec![7u8; 200_000]).unwrap();

        let download = browser.stream_tar_gz("srv1").await.unwrap();
        assert_eq!(download.file_name, "srv1.tar.gz");
        let chunks: Vec<Bytes> = download.stream.try_collect().await.unwrap();
        let gz = chunks.concat();

        let mut archive = tar::Archive::new(GzDecoder::new(&gz[..]));
        let paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(paths.iter().all(|p| p.starts_with("srv1")));
        assert!(paths.iter().any(|p| p == "srv1/data/pack"));

        assert!(matches!(
            browser.stream_tar_gz("absent").await,
            Err(BackupError::NotFound(_))
        ));
    }
}
