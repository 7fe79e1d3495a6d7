use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use resticd_common::{
    sanitize_message, BackupError, BackupSummary, RepoStats, Snapshot, StatsMode, MESSAGE_LIMIT,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, error};

use crate::config::{EngineConfig, ToolTimeouts};

/// Variables that could point restic at a different key or repository.
const STRIPPED_ENV: [&str; 4] = [
    "RESTIC_PASSWORD",
    "RESTIC_PASSWORD_FILE",
    "RESTIC_PASSWORD_COMMAND",
    "RESTIC_REPOSITORY",
];

/// Repository path plus the key that opens it.
#[derive(Clone)]
pub struct RepoAccess {
    pub path: PathBuf,
    key: String,
}

impl RepoAccess {
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for RepoAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoAccess")
            .field("path", &self.path)
            .field("key", &"[redacted]")
            .finish()
    }
}

/// What restic reported about the lock that blocked an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockInfo {
    /// "lock was created at ..." in the tool host's local time.
    pub created_at: Option<NaiveDateTime>,
    /// The "(1h2m3s ago)" suffix.
    pub age: Option<Duration>,
}

impl LockInfo {
    pub fn parse(output: &str) -> Self {
        static CREATED: OnceLock<Regex> = OnceLock::new();
        static AGO: OnceLock<Regex> = OnceLock::new();
        let created_re = CREATED.get_or_init(|| {
            Regex::new(r"lock was created at (\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})")
                .expect("lock timestamp pattern is valid")
        });
        let ago_re = AGO.get_or_init(|| {
            Regex::new(r"\(([0-9.]+(?:h|m|s|ms|us|µs|ns)(?:[0-9.]+(?:h|m|s|ms|us|µs|ns))*) ago\)")
                .expect("lock age pattern is valid")
        });

        let created_at = created_re
            .captures(output)
            .and_then(|c| NaiveDateTime::parse_from_str(&c[1], "%Y-%m-%d %H:%M:%S").ok());
        let age = ago_re
            .captures(output)
            .and_then(|c| parse_go_duration(&c[1]));

        Self { created_at, age }
    }

    /// Lock age, preferring the reported duration over the creation timestamp.
    pub fn age_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        if let Some(age) = self.age {
            return Some(age);
        }
        let created = self.created_at?;
        let created = Local.from_local_datetime(&created).earliest()?;
        (now - created.with_timezone(&Utc)).to_std().ok()
    }
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("repository is locked by another process")]
    Busy(LockInfo),

    #[error("encryption key does not match repository")]
    KeyMismatch,

    #[error("restic {command} failed: {message}")]
    Failed { command: String, message: String },

    #[error("restic {command} timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    #[error("failed to run restic: {0}")]
    Spawn(#[source] std::io::Error),
}

impl From<ToolError> for BackupError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Busy(_) => BackupError::Conflict("repository busy".to_string()),
            ToolError::TimedOut { .. } => BackupError::Timeout(err.to_string()),
            other => BackupError::ToolFailure(other.to_string()),
        }
    }
}

pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// Coarse restic primitives. Implementations must never expose the key.
#[async_trait]
pub trait SnapshotTool: Send + Sync {
    async fn init(&self, repo: &RepoAccess) -> ToolResult<()>;

    async fn backup(&self, repo: &RepoAccess, source: &Path, tags: &[String]) -> ToolResult<BackupSummary>;

    /// All snapshots, or only those carrying `tag`.
    async fn snapshots(&self, repo: &RepoAccess, tag: Option<&str>) -> ToolResult<Vec<Snapshot>>;

    async fn add_tag(&self, repo: &RepoAccess, snapshot_id: &str, tag: &str) -> ToolResult<()>;

    async fn remove_tag(&self, repo: &RepoAccess, snapshot_id: &str, tag: &str) -> ToolResult<()>;

    async fn forget(&self, repo: &RepoAccess, snapshot_ids: &[String], prune: bool) -> ToolResult<()>;

    async fn stats(&self, repo: &RepoAccess, mode: StatsMode) -> ToolResult<RepoStats>;

    async fn restore(
        &self,
        repo: &RepoAccess,
        snapshot_id: &str,
        target: &Path,
        include: Option<&Path>,
    ) -> ToolResult<()>;

    async fn list_locks(&self, repo: &RepoAccess) -> ToolResult<Vec<String>>;

    async fn unlock(&self, repo: &RepoAccess) -> ToolResult<()>;
}

/// Drives the restic binary as a subprocess.
#[derive(Debug, Clone)]
pub struct ResticTool {
    binary_path: PathBuf,
    timeouts: ToolTimeouts,
}

impl ResticTool {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            binary_path: config.restic_binary.clone(),
            timeouts: config.timeouts.clone(),
        }
    }

    async fn run(
        &self,
        repo: &RepoAccess,
        command: &str,
        args: Vec<OsString>,
        timeout: Duration,
    ) -> ToolResult<String> {
        let mut cmd = AsyncCommand::new(&self.binary_path);
        cmd.env_clear()
            .envs(tool_environment(std::env::vars_os(), repo.key()))
            .arg("-r")
            .arg(&repo.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            "Running {} -r {} {}",
            self.binary_path.display(),
            repo.path.display(),
            join_args(&args)
        );

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!("Failed to spawn restic {}: {}", command, e);
                return Err(ToolError::Spawn(e));
            }
            Err(_) => {
                error!("restic {} timed out after {:?}", command, timeout);
                return Err(ToolError::TimedOut {
                    command: command.to_string(),
                    timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let err = classify_failure(command, &stdout, &stderr, Some(repo.key()));
        error!("restic {} failed ({}): {}", command, output.status, err);
        Err(err)
    }
}

#[async_trait]
impl SnapshotTool for ResticTool {
    async fn init(&self, repo: &RepoAccess) -> ToolResult<()> {
        self.run(repo, "init", args(["init"]), self.timeouts.init)
            .await
            .map(|_| ())
    }

    async fn backup(&self, repo: &RepoAccess, source: &Path, tags: &[String]) -> ToolResult<BackupSummary> {
        let mut argv = args(["backup", "--json"]);
        for tag in tags {
            argv.push("--tag".into());
            argv.push(tag.into());
        }
        argv.push(source.as_os_str().to_owned());

        let stdout = self.run(repo, "backup", argv, self.timeouts.backup).await?;
        Ok(parse_backup_summary(&stdout))
    }

    async fn snapshots(&self, repo: &RepoAccess, tag: Option<&str>) -> ToolResult<Vec<Snapshot>> {
        let mut argv = args(["snapshots", "--json"]);
        if let Some(tag) = tag {
            argv.push("--tag".into());
            argv.push(tag.into());
        }
        let stdout = self
            .run(repo, "snapshots", argv, self.timeouts.snapshots)
            .await?;
        parse_snapshots(&stdout).map_err(|message| ToolError::Failed {
            command: "snapshots".to_string(),
            message,
        })
    }

    async fn add_tag(&self, repo: &RepoAccess, snapshot_id: &str, tag: &str) -> ToolResult<()> {
        self.run(
            repo,
            "tag",
            args(["tag", "--add", tag, snapshot_id]),
            self.timeouts.tag,
        )
        .await
        .map(|_| ())
    }

    async fn remove_tag(&self, repo: &RepoAccess, snapshot_id: &str, tag: &str) -> ToolResult<()> {
        self.run(
            repo,
            "tag",
            args(["tag", "--remove", tag, snapshot_id]),
            self.timeouts.tag,
        )
        .await
        .map(|_| ())
    }

    async fn forget(&self, repo: &RepoAccess, snapshot_ids: &[String], prune: bool) -> ToolResult<()> {
        let mut argv = args(["forget"]);
        if prune {
            argv.push("--prune".into());
        }
        argv.extend(snapshot_ids.iter().map(OsString::from));
        self.run(repo, "forget", argv, self.timeouts.forget)
            .await
            .map(|_| ())
    }

    async fn stats(&self, repo: &RepoAccess, mode: StatsMode) -> ToolResult<RepoStats> {
        let stdout = self
            .run(
                repo,
                "stats",
                args(["stats", "--json", "--mode", mode.as_arg()]),
                self.timeouts.stats,
            )
            .await?;
        parse_stats(&stdout).map_err(|message| ToolError::Failed {
            command: "stats".to_string(),
            message,
        })
    }

    async fn restore(
        &self,
        repo: &RepoAccess,
        snapshot_id: &str,
        target: &Path,
        include: Option<&Path>,
    ) -> ToolResult<()> {
        let mut argv = args(["restore", snapshot_id, "--target"]);
        argv.push(target.as_os_str().to_owned());
        if let Some(include) = include {
            argv.push("--path".into());
            argv.push(include.as_os_str().to_owned());
        }
        self.run(repo, "restore", argv, self.timeouts.restore)
            .await
            .map(|_| ())
    }

    async fn list_locks(&self, repo: &RepoAccess) -> ToolResult<Vec<String>> {
        let stdout = self
            .run(
                repo,
                "list locks",
                args(["list", "locks", "--no-lock"]),
                self.timeouts.locks,
            )
            .await?;
        Ok(parse_lock_ids(&stdout))
    }

    async fn unlock(&self, repo: &RepoAccess) -> ToolResult<()> {
        self.run(repo, "unlock", args(["unlock"]), self.timeouts.unlock)
            .await
            .map(|_| ())
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<OsString> {
    items.iter().map(OsString::from).collect()
}

fn join_args(args: &[OsString]) -> String {
    args.iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// The inherited environment minus every restic credential source, plus the one key.
pub fn tool_environment<I>(base: I, key: &str) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: Vec<(OsString, OsString)> = base
        .into_iter()
        .filter(|(name, _)| !STRIPPED_ENV.iter().any(|s| name.as_os_str() == OsStr::new(s)))
        .collect();
    env.push(("RESTIC_PASSWORD".into(), key.into()));
    env
}

/// Map a non-zero exit to a typed failure from the combined output.
pub fn classify_failure(command: &str, stdout: &str, stderr: &str, key: Option<&str>) -> ToolError {
    let combined = format!("{}\n{}", stdout, stderr);
    let lower = combined.to_lowercase();

    if lower.contains("repository is already locked") || lower.contains("unable to create lock") {
        return ToolError::Busy(LockInfo::parse(&combined));
    }

    if lower.contains("wrong password")
        || lower.contains("ciphertext verification failed")
        || lower.contains("no key found")
    {
        return ToolError::KeyMismatch;
    }

    let detail = if stderr.trim().is_empty() { stdout } else { stderr };
    ToolError::Failed {
        command: command.to_string(),
        message: sanitize_message(detail, key, MESSAGE_LIMIT),
    }
}

/// Go `time.Duration` strings such as `1h2m3.5s` or `250ms`.
pub fn parse_go_duration(raw: &str) -> Option<Duration> {
    let mut rest = raw.trim();
    if rest.is_empty() {
        return None;
    }

    let mut total = 0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total += value * scale;
    }

    Duration::try_from_secs_f64(total).ok()
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    id: String,
    #[serde(default)]
    short_id: Option<String>,
    time: DateTime<Utc>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    paths: Option<Vec<String>>,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    summary: Option<RawSnapshotSummary>,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawSnapshotSummary {
    #[serde(default)]
    total_bytes_processed: Option<u64>,
}

impl From<RawSnapshot> for Snapshot {
    fn from(raw: RawSnapshot) -> Self {
        let short_id = raw
            .short_id
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| raw.id.chars().take(8).collect());
        let size_bytes = raw
            .summary
            .and_then(|s| s.total_bytes_processed)
            .or(raw.size);
        Snapshot {
            id: raw.id,
            short_id,
            time: raw.time,
            tags: raw.tags.map(|tags| tags.into_iter().collect()),
            paths: raw.paths.unwrap_or_default(),
            hostname: raw.hostname,
            size_bytes,
        }
    }
}

/// One JSON array, or newline-delimited objects and arrays.
pub fn parse_snapshots(stdout: &str) -> Result<Vec<Snapshot>, String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }

    if let Ok(list) = serde_json::from_str::<Vec<RawSnapshot>>(trimmed) {
        return Ok(list.into_iter().map(Snapshot::from).collect());
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Line {
        Many(Vec<RawSnapshot>),
        One(Box<RawSnapshot>),
    }

    let mut snapshots = Vec::new();
    for line in trimmed.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<Line>(line) {
            Ok(Line::Many(list)) => snapshots.extend(list.into_iter().map(Snapshot::from)),
            Ok(Line::One(raw)) => snapshots.push(Snapshot::from(*raw)),
            Err(e) => return Err(format!("unexpected snapshot listing: {}", e)),
        }
    }
    Ok(snapshots)
}

#[derive(Debug, Deserialize)]
struct RawBackupSummary {
    #[serde(default)]
    snapshot_id: Option<String>,
    #[serde(default)]
    files_new: u64,
    #[serde(default)]
    files_changed: u64,
    #[serde(default)]
    files_unmodified: u64,
    #[serde(default)]
    data_added: u64,
    #[serde(default)]
    total_bytes_processed: u64,
}

/// The `summary` message of `backup --json`. Progress lines are skipped.
pub fn parse_backup_summary(stdout: &str) -> BackupSummary {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line.trim()).ok())
        .filter(|value| value.get("message_type").and_then(|t| t.as_str()) == Some("summary"))
        .filter_map(|value| serde_json::from_value::<RawBackupSummary>(value).ok())
        .last()
        .map(|raw| BackupSummary {
            snapshot_id: raw.snapshot_id,
            files_new: raw.files_new,
            files_changed: raw.files_changed,
            files_unmodified: raw.files_unmodified,
            data_added: raw.data_added,
            total_bytes_processed: raw.total_bytes_processed,
        })
        .unwrap_or_default()
}

pub fn parse_stats(stdout: &str) -> Result<RepoStats, String> {
    serde_json::from_str(stdout.trim()).map_err(|e| format!("unexpected stats output: {}", e))
}

/// JSON array of ids, falling back to one hex id per line.
pub fn parse_lock_ids(stdout: &str) -> Vec<String> {
    if let Ok(ids) = serde_json::from_str::<Vec<String>>(stdout.trim()) {
        return ids;
    }
    stdout
        .lines()
        .map(str::trim)
        .filter(|token| !token.is_empty() && token.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_string)
        .collect()
}

/// Full id, then short id, then a unique prefix of a full id.
pub fn resolve_snapshot_id(snapshots: &[Snapshot], requested: &str) -> Option<String> {
    let requested = requested.trim();
    if requested.is_empty() {
        return None;
    }

    if let Some(s) = snapshots.iter().find(|s| s.id == requested) {
        return Some(s.id.clone());
    }
    if let Some(s) = snapshots.iter().find(|s| s.short_id == requested) {
        return Some(s.id.clone());
    }

    let mut matches = snapshots.iter().filter(|s| s.id.starts_with(requested));
    match (matches.next(), matches.next()) {
        (Some(only), None) => Some(only.id.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"[
        {"id":"aaaaaaaa11111111","short_id":"aaaaaaaa","time":"2024-05-01T10:00:00.123456789+02:00","tags":["locked","daily"],"paths":["/var/lib/pterodactyl/volumes/srv1"],"hostname":"node1"},
        {"id":"bbbbbbbb22222222","time":"2024-05-02T10:00:00Z","tags":null,"summary":{"total_bytes_processed":4096}}
    ]"#;

    #[test]
    fn test_parse_snapshot_array() {
        let snapshots = parse_snapshots(LISTING).unwrap();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots[0].has_tag("locked"));
        assert_eq!(snapshots[0].hostname.as_deref(), Some("node1"));
        assert_eq!(snapshots[1].short_id, "bbbbbbbb");
        assert_eq!(snapshots[1].tags, None);
        assert_eq!(snapshots[1].size_bytes, Some(4096));
    }

    #[test]
    fn test_parse_snapshot_ndjson_matches_array() {
        let ndjson = r#"
{"id":"aaaaaaaa11111111","short_id":"aaaaaaaa","time":"2024-05-01T10:00:00.123456789+02:00","tags":["locked","daily"],"paths":["/var/lib/pterodactyl/volumes/srv1"],"hostname":"node1"}

[{"id":"bbbbbbbb22222222","time":"2024-05-02T10:00:00Z","tags":null,"summary":{"total_bytes_processed":4096}}]
"#;
        assert_eq!(parse_snapshots(ndjson).unwrap(), parse_snapshots(LISTING).unwrap());
        assert!(parse_snapshots("").unwrap().is_empty());
        assert!(parse_snapshots("not json").is_err());
    }

    #[test]
    fn test_parse_backup_summary() {
        let stdout = r#"{"message_type":"status","percent_done":0.5}
{"message_type":"summary","files_new":3,"files_changed":1,"files_unmodified":7,"data_added":1234,"total_bytes_processed":9999,"snapshot_id":"cafebabe"}"#;
        let summary = parse_backup_summary(stdout);
        assert_eq!(summary.snapshot_id.as_deref(), Some("cafebabe"));
        assert_eq!(summary.files_new, 3);
        assert_eq!(summary.data_added, 1234);

        assert_eq!(parse_backup_summary("garbage"), BackupSummary::default());
    }

    #[test]
    fn test_parse_lock_ids_fallback() {
        assert_eq!(parse_lock_ids(r#"["abc123","def456"]"#), vec!["abc123", "def456"]);
        assert_eq!(
            parse_lock_ids("repository 1234 opened\nabc123\n\ndef456\n"),
            vec!["abc123", "def456"]
        );
    }

    #[test]
    fn test_parse_stats() {
        let stats =
            parse_stats(r#"{"total_size":2048,"total_file_count":12,"snapshots_count":3}"#).unwrap();
        assert_eq!(stats.total_size, 2048);
        assert_eq!(stats.snapshots_count, 3);
    }

    #[test]
    fn test_environment_has_exactly_one_password() {
        let base = vec![
            (OsString::from("PATH"), OsString::from("/usr/bin")),
            (OsString::from("RESTIC_PASSWORD"), OsString::from("old")),
            (OsString::from("RESTIC_PASSWORD_FILE"), OsString::from("/tmp/pw")),
            (OsString::from("RESTIC_PASSWORD_COMMAND"), OsString::from("cat")),
            (OsString::from("RESTIC_REPOSITORY"), OsString::from("/elsewhere")),
        ];
        let env = tool_environment(base, "s3cret");

        let password_vars: Vec<_> = env
            .iter()
            .filter(|(k, _)| k.to_string_lossy().starts_with("RESTIC_"))
            .collect();
        assert_eq!(password_vars.len(), 1);
        assert_eq!(password_vars[0].0, OsString::from("RESTIC_PASSWORD"));
        assert_eq!(password_vars[0].1, OsString::from("s3cret"));
        assert!(env.iter().any(|(k, _)| k == "PATH"));
    }

    #[test]
    fn test_classify_busy_with_lock_age() {
        let stderr = "unable to create lock in backend: repository is already locked by PID 42 on node1 by root (UID 0, GID 0)\nlock was created at 2024-05-01 10:00:00 (45m12.5s ago)\nstorage ID 1a2b3c4d";
        let ToolError::Busy(info) = classify_failure("backup", "", stderr, None) else {
            panic!("expected Busy");
        };
        assert_eq!(info.age, Some(Duration::from_secs_f64(45.0 * 60.0 + 12.5)));
        assert_eq!(
            info.created_at,
            NaiveDateTime::parse_from_str("2024-05-01 10:00:00", "%Y-%m-%d %H:%M:%S").ok()
        );
        assert_eq!(info.age_at(Utc::now()), info.age);
    }

    #[test]
    fn test_lock_age_from_timestamp() {
        let created = (Local::now() - chrono::Duration::minutes(40)).naive_local();
        let info = LockInfo {
            created_at: Some(created),
            age: None,
        };
        let age = info.age_at(Utc::now()).unwrap();
        assert!(age >= Duration::from_secs(39 * 60));
        assert!(LockInfo::default().age_at(Utc::now()).is_none());
    }

    #[test]
    fn test_classify_key_mismatch_and_failures() {
        assert!(matches!(
            classify_failure("snapshots", "", "Fatal: wrong password or no key found", None),
            ToolError::KeyMismatch
        ));
        assert!(matches!(
            classify_failure("snapshots", "", "ciphertext verification failed", None),
            ToolError::KeyMismatch
        ));

        let err = classify_failure("backup", "", "Fatal: unable to open config hunter2", Some("hunter2"));
        match err {
            ToolError::Failed { message, .. } => {
                assert!(!message.contains("hunter2"));
                assert!(message.contains("[redacted]"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_go_durations() {
        assert_eq!(parse_go_duration("1h2m3s"), Some(Duration::from_secs(3723)));
        assert_eq!(parse_go_duration("5m0s"), Some(Duration::from_secs(300)));
        assert_eq!(parse_go_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_go_duration("3x"), None);
        assert_eq!(parse_go_duration(""), None);
    }

    #[test]
    fn test_resolve_snapshot_id() {
        let snapshots = parse_snapshots(LISTING).unwrap();
        assert_eq!(
            resolve_snapshot_id(&snapshots, "bbbbbbbb22222222").as_deref(),
            Some("bbbbbbbb22222222")
        );
        assert_eq!(
            resolve_snapshot_id(&snapshots, "aaaaaaaa").as_deref(),
            Some("aaaaaaaa11111111")
        );
        assert_eq!(
            resolve_snapshot_id(&snapshots, "bbbb").as_deref(),
            Some("bbbbbbbb22222222")
        );
        assert_eq!(resolve_snapshot_id(&snapshots, "cccc"), None);

        let mut twins = snapshots.clone();
        twins[1].id = "aaaaaaaa99999999".to_string();
        twins[1].short_id = "aaaaaaaa".to_string();
        assert_eq!(resolve_snapshot_id(&twins, "aaaa"), None);
    }

    #[test]
    fn test_repo_access_debug_hides_key() {
        let access = RepoAccess::new("/srv/repo", "topsecret");
        let rendered = format!("{:?}", access);
        assert!(!rendered.contains("topsecret"));
        assert!(rendered.contains("/srv/repo"));
    }
}
