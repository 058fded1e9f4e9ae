pub mod admin;
pub mod hls;

use crate::state::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

/// 注册HTTP路由
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(admin::health)) // 健康检查
        .route("/sys/status", get(admin::sys_status)) // 系统状态
        .route("/streams", get(admin::list_streams)) // 获取流列表
        .route("/streams/:id/status", get(admin::stream_status)) // 单个流状态
        .route("/streams/:id/start", post(admin::handle_start)) // 启动流
        .route("/streams/:id/stop", post(admin::handle_stop)) // 停止流
        .route("/hls/:id/:file_name", get(hls::serve_hls_file)) // 获取HLS文件
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::admin::{self, StartRequest};
    use super::hls;
    use crate::config::AppConfig;
    use crate::engine::Engine;
    use crate::launcher::FfmpegLauncher;
    use crate::state::{AppState, SharedState};
    use crate::status::StreamState;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::Json;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::time::Instant;

    fn state(root: &TempDir) -> SharedState {
        let config = AppConfig::default();
        let launcher = Arc::new(FfmpegLauncher::new(config.ffmpeg.clone()));
        let engine = Arc::new(Engine::new(
            config.supervisor.clone(),
            root.path(),
            launcher,
        ));
        Arc::new(AppState {
            config,
            engine,
            started_at: Instant::now(),
            git_commit: None,
        })
    }

    #[tokio::test]
    async fn health_reports_commit_and_counts() {
        let root = TempDir::new().unwrap();
        let Json(body) = admin::health(State(state(&root))).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_streams"], 0);
        assert!(body.get("git_commit").is_some_and(|v| v.is_null()));

        let state = Arc::new(AppState {
            git_commit: Some("3f2c1ab".into()),
            ..Arc::into_inner(state(&root)).unwrap()
        });
        let Json(body) = admin::health(State(state)).await;
        assert_eq!(body["git_commit"], "3f2c1ab");
    }

    #[tokio::test]
    async fn git_commit_outside_a_repository_is_none() {
        let dir = TempDir::new().unwrap();
        let commit = admin::read_git_commit(dir.path()).await;
        assert!(commit.is_none());
    }

    #[tokio::test]
    async fn status_of_unknown_stream_is_idle() {
        let root = TempDir::new().unwrap();
        let Json(status) = admin::stream_status(State(state(&root)), Path("12".into()))
            .await
            .unwrap();
        assert_eq!(status.id, "12");
        assert_eq!(status.status, StreamState::Idle);
    }

    #[tokio::test]
    async fn invalid_id_is_rejected() {
        let root = TempDir::new().unwrap();
        let (code, _) = admin::stream_status(State(state(&root)), Path("a b".into()))
            .await
            .unwrap_err();
        assert_eq!(code, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn start_requires_a_source() {
        let root = TempDir::new().unwrap();
        let (code, Json(body)) = admin::handle_start(
            State(state(&root)),
            Path("1".into()),
            Json(StartRequest {
                source: "   ".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "source must not be empty");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let root = TempDir::new().unwrap();
        let Json(body) = admin::handle_stop(State(state(&root)), Path("3".into()))
            .await
            .unwrap();
        assert_eq!(body["status"], "stopped");
        assert_eq!(body["id"], "3");
    }

    #[tokio::test]
    async fn list_is_empty_without_streams() {
        let root = TempDir::new().unwrap();
        let Json(body) = admin::list_streams(State(state(&root))).await;
        assert_eq!(body["streams"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn hls_file_for_idle_stream_is_not_found() {
        let root = TempDir::new().unwrap();
        let result = hls::serve_hls_file(
            State(state(&root)),
            Path(("4".into(), "index.m3u8".into())),
        )
        .await;
        assert!(matches!(result, Err((StatusCode::NOT_FOUND, _))));
    }

    #[tokio::test]
    async fn hls_rejects_traversal() {
        let root = TempDir::new().unwrap();
        let result = hls::serve_hls_file(
            State(state(&root)),
            Path(("4".into(), "..".into())),
        )
        .await;
        assert!(matches!(result, Err((StatusCode::BAD_REQUEST, _))));
    }
}
