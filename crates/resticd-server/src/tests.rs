use crate::{create_app, status_for, AppState};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use resticd_common::{BackupError, PROTECTED_TAG};
use resticd_engine::test_utils::{MockOp, MockTool};
use resticd_engine::{EngineConfig, RepoAccess};
use resticd_orchestrator::Orchestrator;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const KEY: &str = "s3cret-key";

struct TestApp {
    _dir: TempDir,
    root: PathBuf,
    mock: MockTool,
    app: Router,
}

impl TestApp {
    fn new(mock: MockTool, api_token: Option<&str>) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::rooted_at(dir.path().join("restic"));
        config.volumes_root = dir.path().join("volumes");
        config.restore_target = dir.path().join("restore-target");
        std::fs::create_dir_all(config.volumes_root.join("srv1")).unwrap();
        std::fs::write(config.volumes_root.join("srv1/server.properties"), b"motd=hi").unwrap();

        let orchestrator = Orchestrator::new(config, Arc::new(mock.clone()));
        let app = create_app(AppState::new(orchestrator, api_token.map(str::to_string)));
        Self {
            root: dir.path().join("restic"),
            _dir: dir,
            mock,
            app,
        }
    }

    fn access(&self) -> RepoAccess {
        RepoAccess::new(self.root.join("srv1"), KEY)
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[cfg(test)]
mod server_tests {
    use super::*;

    #[tokio::test]
    async fn test_health_endpoint() {
        let t = TestApp::new(MockTool::new(), None);
        let (status, json) = t.send(get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_backup_without_key_is_rejected() {
        let t = TestApp::new(MockTool::new(), None);
        let (status, json) = t
            .send(post_json("/api/servers/srv1/backups/restic", json!({})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "MISSING_KEY");
        assert!(json["error"].is_string());
        assert_eq!(t.mock.call_count(MockOp::Backup).await, 0);
    }

    #[tokio::test]
    async fn test_backup_then_list() {
        let t = TestApp::new(MockTool::new(), None);
        let (status, json) = t
            .send(post_json(
                "/api/servers/srv1/backups/restic",
                json!({ "encryption_key": KEY, "max_snapshots": 5, "tags": ["nightly"] }),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "backup created");
        assert!(json["snapshot_id"].is_string());

        // Key is stored now; the listing does not need it.
        let (status, json) = t.send(get("/api/servers/srv1/backups/restic")).await;
        assert_eq!(status, StatusCode::OK);
        let backups = json["backups"].as_array().unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0]["locked"], false);
        assert_eq!(backups[0]["tags"], json!(["nightly"]));

        let (status, json) = t.send(get("/api/servers/srv1/backups/restic/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "completed");
        assert!(!json.to_string().contains(KEY));
    }

    #[tokio::test]
    async fn test_async_backup_and_conflict() {
        let t = TestApp::new(MockTool::new().with_backup_delay(Duration::from_millis(300)), None);
        let uri = format!("/api/servers/srv1/backups/restic?async=yes&encryption_key={}", KEY);

        let (status, json) = t.send(post_json(&uri, json!({}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["message"], "backup started");
        assert_eq!(json["status"]["status"], "running");

        let (status, json) = t.send(post_json(&uri, json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["code"], "CONFLICT");
    }

    #[tokio::test]
    async fn test_locked_backup_delete_conflicts() {
        let t = TestApp::new(MockTool::new(), None);
        let access = t.access();
        t.mock.seed_repo(&access).await;
        let id = t.mock.seed_snapshot(&access, chrono::Utc::now(), &[PROTECTED_TAG]).await;

        let uri = format!("/api/servers/srv1/backups/restic/{}?encryption_key={}", id, KEY);
        let (status, json) = t.send(delete(&uri)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["code"], "CONFLICT");
        assert_eq!(t.mock.call_count(MockOp::Forget).await, 0);

        let unlock = format!("/api/servers/srv1/backups/restic/{}/unlock", id);
        let (status, json) = t.send(post_json(&unlock, json!({ "encryption_key": KEY }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "unlocked");

        let (status, json) = t.send(delete(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["snapshot_id"], id);
    }

    #[tokio::test]
    async fn test_download_streams_prepared_archive() {
        let t = TestApp::new(MockTool::new(), None);
        let access = t.access();
        t.mock.seed_repo(&access).await;
        let id = t.mock.seed_snapshot(&access, chrono::Utc::now(), &[]).await;

        let uri = format!("/api/servers/srv1/backups/restic/{}/download?encryption_key={}", id, KEY);
        let response = t.app.clone().oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "application/zstd");
        let len: usize = response.headers()["content-length"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), len);
        // zstd frame magic
        assert_eq!(&body[..4], &[0x28, 0xb5, 0x2f, 0xfd]);
    }

    #[tokio::test]
    async fn test_archive_traversal_is_rejected() {
        let t = TestApp::new(MockTool::new(), None);
        let (status, json) = t
            .send(get("/api/restic/archives/..%2Fsecrets/download"))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "INVALID_PATH");

        let (status, json) = t.send(get("/api/restic/archives")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["archives"], json!([]));
    }

    #[tokio::test]
    async fn test_bearer_token_required() {
        let t = TestApp::new(MockTool::new(), Some("letmein"));

        let (status, json) = t.send(get("/api/restic/archives")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["code"], "UNAUTHORIZED");

        let request = Request::builder()
            .uri("/api/restic/archives")
            .header("authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        assert_eq!(t.send(request).await.0, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/api/restic/archives")
            .header("authorization", "Bearer letmein")
            .body(Body::empty())
            .unwrap();
        assert_eq!(t.send(request).await.0, StatusCode::OK);

        // Liveness stays open.
        assert_eq!(t.send(get("/health")).await.0, StatusCode::OK);
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (BackupError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (BackupError::MissingKey, StatusCode::BAD_REQUEST),
            (BackupError::Conflict("x".into()), StatusCode::CONFLICT),
            (BackupError::CapacityExceeded("x".into()), StatusCode::INSUFFICIENT_STORAGE),
            (BackupError::ToolFailure("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (BackupError::Timeout("x".into()), StatusCode::GATEWAY_TIMEOUT),
            (BackupError::InvalidPath("x".into()), StatusCode::BAD_REQUEST),
            (BackupError::NotFound("x".into()), StatusCode::NOT_FOUND),
        ];
        for (err, expected) in cases {
            assert_eq!(status_for(&err), expected, "{:?}", err);
        }
    }
}
