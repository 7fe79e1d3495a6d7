use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use resticd_common::{BackupError, Result};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::{dir_size, is_valid_identifier};

const OWNER_SEPARATOR: char = '+';
const RESERVED_NAMES: [&str; 2] = ["archive", "temp"];

/// Where a server's repository lives, whether or not it exists yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLocation {
    pub server_id: String,
    pub owner: Option<String>,
    /// Directory name under the restic root, also the key file stem.
    pub dir_name: String,
    pub path: PathBuf,
    pub exists: bool,
}

impl RepoLocation {
    /// A repository is initialized once restic has written its `config` file.
    pub fn is_initialized(&self) -> bool {
        self.path.join("config").is_file()
    }
}

#[derive(Debug, Clone)]
pub struct RepositoryResolver {
    root: PathBuf,
    keys_dir: PathBuf,
    archive_dir: PathBuf,
}

impl RepositoryResolver {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            root: config.restic_root.clone(),
            keys_dir: config.keys_dir(),
            archive_dir: config.archive_dir(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Owner-qualified directory first, then the bare server directory, then any
    /// `<server>+*` directory (newest wins), else the default for a new repository.
    pub async fn resolve(&self, server_id: &str, owner_hint: Option<&str>) -> Result<RepoLocation> {
        validate_server(server_id)?;
        let owner = normalize_owner(owner_hint)?;

        let default_name = match &owner {
            Some(owner) => format!("{}{}{}", server_id, OWNER_SEPARATOR, owner),
            None => server_id.to_string(),
        };

        if owner.is_some() && is_dir(&self.root.join(&default_name)).await {
            return Ok(self.location(server_id, owner, default_name, true));
        }

        if is_dir(&self.root.join(server_id)).await {
            return Ok(self.location(server_id, None, server_id.to_string(), true));
        }

        if let Some(found) = self.newest_owned_dir(server_id).await? {
            let found_owner = found
                .strip_prefix(&format!("{}{}", server_id, OWNER_SEPARATOR))
                .map(str::to_string);
            debug!(server_id, dir = %found, "Resolved repository by owner scan");
            return Ok(self.location(server_id, found_owner, found, true));
        }

        Ok(self.location(server_id, owner, default_name, false))
    }

    fn location(&self, server_id: &str, owner: Option<String>, dir_name: String, exists: bool) -> RepoLocation {
        RepoLocation {
            server_id: server_id.to_string(),
            owner,
            path: self.root.join(&dir_name),
            dir_name,
            exists,
        }
    }

    /// Every existing repository directory of a server: `<server>` and `<server>+*`.
    pub async fn server_dirs(&self, server_id: &str) -> Result<Vec<(String, SystemTime)>> {
        validate_server(server_id)?;
        let prefix = format!("{}{}", server_id, OWNER_SEPARATOR);

        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') || RESERVED_NAMES.contains(&name.as_str()) {
                continue;
            }
            if name != server_id && !name.starts_with(&prefix) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            dirs.push((name, metadata.modified().unwrap_or(UNIX_EPOCH)));
        }
        Ok(dirs)
    }

    async fn newest_owned_dir(&self, server_id: &str) -> Result<Option<String>> {
        let dirs = self.server_dirs(server_id).await?;
        Ok(dirs
            .into_iter()
            .filter(|(name, _)| name != server_id)
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
            .map(|(name, _)| name))
    }

    fn key_path(&self, location: &RepoLocation) -> PathBuf {
        self.keys_dir.join(format!("{}.key", location.dir_name))
    }

    async fn stored_key(&self, location: &RepoLocation) -> Result<Option<String>> {
        match fs::read_to_string(self.key_path(location)).await {
            Ok(raw) => {
                let key = raw.trim_end_matches(['\r', '\n']).to_string();
                Ok((!key.is_empty()).then_some(key))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// First write wins: a stored key always beats the supplied one.
    pub async fn resolve_key(&self, location: &RepoLocation, supplied: Option<&str>) -> Result<String> {
        let supplied = supplied.filter(|key| !key.is_empty());

        if let Some(stored) = self.stored_key(location).await? {
            if supplied.is_some_and(|key| key != stored) {
                warn!(
                    repository = %location.dir_name,
                    "Supplied encryption key differs from the stored key, using the stored key"
                );
            }
            return Ok(stored);
        }

        let Some(key) = supplied else {
            return Err(BackupError::MissingKey);
        };

        let path = self.key_path(location);
        let tmp = self.write_key_tmp(location, key).await?;
        // hard_link refuses to overwrite, so a concurrent first writer keeps its key.
        let linked = fs::hard_link(&tmp, &path).await;
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => {
                info!(repository = %location.dir_name, "Stored encryption key for repository");
                Ok(key.to_string())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                self.stored_key(location).await?.ok_or(BackupError::MissingKey)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite the stored key. Only used after re-initializing a fresh repository.
    pub async fn replace_key(&self, location: &RepoLocation, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(BackupError::MissingKey);
        }
        let tmp = self.write_key_tmp(location, key).await?;
        fs::rename(&tmp, self.key_path(location)).await?;
        warn!(repository = %location.dir_name, "Replaced stored encryption key");
        Ok(())
    }

    async fn write_key_tmp(&self, location: &RepoLocation, key: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.keys_dir).await?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let tmp = self.keys_dir.join(format!(
            ".{}.{}.{}.tmp",
            location.dir_name,
            std::process::id(),
            nanos
        ));

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, key.as_bytes()).await?;
        file.sync_all().await?;
        Ok(tmp)
    }

    pub async fn size_bytes(&self, location: &RepoLocation) -> Result<u64> {
        Ok(dir_size(&location.path).await?)
    }

    /// Time since restic wrote the repository `config`; `None` when never initialized.
    pub async fn age(&self, location: &RepoLocation) -> Option<Duration> {
        let modified = fs::metadata(location.path.join("config"))
            .await
            .and_then(|m| m.modified())
            .ok()?;
        Some(SystemTime::now().duration_since(modified).unwrap_or_default())
    }

    pub async fn ensure_dir(&self, location: &RepoLocation) -> Result<()> {
        fs::create_dir_all(&location.path).await?;
        Ok(())
    }

    /// Drop all repository contents, leaving an empty directory behind.
    pub async fn wipe(&self, location: &RepoLocation) -> Result<()> {
        match fs::remove_dir_all(&location.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&location.path).await?;
        warn!(repository = %location.dir_name, "Wiped repository contents");
        Ok(())
    }

    /// Move every repository of the server into the archive root, keys included.
    pub async fn archive_server(&self, server_id: &str) -> Result<usize> {
        let dirs = self.server_dirs(server_id).await?;
        if dirs.is_empty() {
            return Ok(0);
        }

        fs::create_dir_all(&self.archive_dir).await?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let mut moved = 0;
        for (name, _) in dirs {
            let mut target_name = name.clone();
            if fs::try_exists(self.archive_dir.join(&target_name)).await? {
                target_name = format!("{}-{}", name, stamp);
            }
            let target = self.archive_dir.join(&target_name);
            fs::rename(self.root.join(&name), &target).await?;

            let key = self.keys_dir.join(format!("{}.key", name));
            if fs::try_exists(&key).await? {
                fs::rename(&key, self.archive_dir.join(format!("{}.key", target_name))).await?;
            }

            info!(server_id, from = %name, to = %target_name, "Archived repository");
            moved += 1;
        }
        Ok(moved)
    }
}

fn validate_server(server_id: &str) -> Result<()> {
    if !is_valid_identifier(server_id) || server_id.contains(OWNER_SEPARATOR) {
        return Err(BackupError::InvalidRequest(format!(
            "invalid server id: {:?}",
            server_id
        )));
    }
    Ok(())
}

fn normalize_owner(owner: Option<&str>) -> Result<Option<String>> {
    let Some(owner) = owner.map(str::trim).filter(|o| !o.is_empty()) else {
        return Ok(None);
    };
    if !is_valid_identifier(owner) || owner.contains(OWNER_SEPARATOR) {
        return Err(BackupError::InvalidRequest(format!(
            "invalid owner username: {:?}",
            owner
        )));
    }
    Ok(Some(owner.to_string()))
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::TempDir;

    fn resolver(dir: &TempDir) -> RepositoryResolver {
        RepositoryResolver::new(&EngineConfig::rooted_at(dir.path()))
    }

    #[tokio::test]
    async fn test_resolve_prefers_owner_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("srv1+alice")).unwrap();
        std::fs::create_dir_all(dir.path().join("srv1")).unwrap();

        let loc = resolver(&dir).resolve("srv1", Some("alice")).await.unwrap();
        assert_eq!(loc.dir_name, "srv1+alice");
        assert!(loc.exists);

        let bare = resolver(&dir).resolve("srv1", Some("bob")).await.unwrap();
        assert_eq!(bare.dir_name, "srv1");
        assert_eq!(bare.owner, None);
    }

    #[tokio::test]
    async fn test_resolve_scans_for_renamed_owner() {
        let dir = TempDir::new().unwrap();
        let older = dir.path().join("srv1+old-name");
        let newer = dir.path().join("srv1+new-name");
        std::fs::create_dir_all(&older).unwrap();
        std::fs::create_dir_all(&newer).unwrap();
        std::fs::create_dir_all(dir.path().join("srv10+zed")).unwrap();

        let hour_ago = SystemTime::now() - Duration::from_secs(3600);
        filetime::set_file_mtime(&older, FileTime::from_system_time(hour_ago)).unwrap();

        let loc = resolver(&dir).resolve("srv1", Some("renamed")).await.unwrap();
        assert_eq!(loc.dir_name, "srv1+new-name");
        assert_eq!(loc.owner.as_deref(), Some("new-name"));
        assert!(loc.exists);
    }

    #[tokio::test]
    async fn test_resolve_defaults_for_new_repository() {
        let dir = TempDir::new().unwrap();
        let loc = resolver(&dir).resolve("srv1", Some("alice")).await.unwrap();
        assert_eq!(loc.path, dir.path().join("srv1+alice"));
        assert!(!loc.exists);

        let bare = resolver(&dir).resolve("srv1", Some("  ")).await.unwrap();
        assert_eq!(bare.dir_name, "srv1");
    }

    #[tokio::test]
    async fn test_resolve_rejects_bad_ids() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        assert!(matches!(
            resolver.resolve("../x", None).await,
            Err(BackupError::InvalidRequest(_))
        ));
        assert!(matches!(
            resolver.resolve("srv1", Some("a+b")).await,
            Err(BackupError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_key_first_write_wins() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        let loc = resolver.resolve("srv1", Some("alice")).await.unwrap();

        assert!(matches!(
            resolver.resolve_key(&loc, None).await,
            Err(BackupError::MissingKey)
        ));

        assert_eq!(resolver.resolve_key(&loc, Some("first")).await.unwrap(), "first");
        assert_eq!(resolver.resolve_key(&loc, Some("second")).await.unwrap(), "first");
        assert_eq!(resolver.resolve_key(&loc, None).await.unwrap(), "first");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join(".keys/srv1+alice.key"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        resolver.replace_key(&loc, "third").await.unwrap();
        assert_eq!(resolver.resolve_key(&loc, Some("fourth")).await.unwrap(), "third");
    }

    #[tokio::test]
    async fn test_archive_server_moves_repos_and_keys() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        std::fs::create_dir_all(dir.path().join("srv1+alice")).unwrap();
        std::fs::create_dir_all(dir.path().join("srv1")).unwrap();
        std::fs::create_dir_all(dir.path().join("srv2")).unwrap();
        std::fs::create_dir_all(dir.path().join("archive/srv1")).unwrap();

        let loc = resolver.resolve("srv1", Some("alice")).await.unwrap();
        resolver.resolve_key(&loc, Some("k")).await.unwrap();

        assert_eq!(resolver.archive_server("srv1").await.unwrap(), 2);
        assert!(!dir.path().join("srv1").exists());
        assert!(!dir.path().join("srv1+alice").exists());
        assert!(dir.path().join("srv2").exists());
        assert!(dir.path().join("archive/srv1+alice").is_dir());
        assert!(dir.path().join("archive/srv1+alice.key").is_file());

        let renamed = std::fs::read_dir(dir.path().join("archive"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("srv1-"))
            .count();
        assert_eq!(renamed, 1);

        assert_eq!(resolver.archive_server("srv3").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_age_and_size() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        let loc = resolver.resolve("srv1", None).await.unwrap();
        assert!(resolver.age(&loc).await.is_none());

        resolver.ensure_dir(&loc).await.unwrap();
        std::fs::write(loc.path.join("config"), vec![1u8; 64]).unwrap();
        assert!(loc.is_initialized());
        assert!(resolver.age(&loc).await.unwrap() < Duration::from_secs(60));
        assert_eq!(resolver.size_bytes(&loc).await.unwrap(), 64);

        resolver.wipe(&loc).await.unwrap();
        assert!(loc.path.is_dir());
        assert_eq!(resolver.size_bytes(&loc).await.unwrap(), 0);
    }
}
