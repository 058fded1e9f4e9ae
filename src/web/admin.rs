use crate::launcher::resolve_executable;
use crate::state::{SharedState, StreamId};
use crate::status::StreamStatus;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path as FsPath;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error};

const GIT_COMMIT_TIMEOUT: Duration = Duration::from_secs(5);

pub type ApiError = (StatusCode, Json<Value>);

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub source: String,
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn parse_id(raw: &str) -> Result<StreamId, ApiError> {
    StreamId::parse(raw).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))
}

/// 健康检查 API
pub async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_streams": state.engine.active_count(),
        "ffmpeg_available": resolve_executable(&state.config.ffmpeg.binary).is_some(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "git_commit": state.git_commit,
    }))
}

/// 读取源码目录的短提交号，不在 git 仓库中或 git 不可用时返回 None
pub async fn read_git_commit(repo_dir: &FsPath) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .current_dir(repo_dir)
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(GIT_COMMIT_TIMEOUT, output).await {
        Ok(Ok(output)) if output.status.success() => {
            let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (!commit.is_empty()).then_some(commit)
        }
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            debug!("git rev-parse failed: {}", e);
            None
        }
        Err(_) => {
            debug!("git rev-parse timed out");
            None
        }
    }
}

/// 获取系统状态 API
/// 该处理函数返回系统的内存和负载信息，作为 JSON 响应
pub async fn sys_status(State(state): State<SharedState>) -> Json<Value> {
    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    // 获取负载信息，默认值为 0.0
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
        "active_streams": state.engine.active_count(),
    }))
}

/// 获取流列表 API
pub async fn list_streams(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "streams": state.engine.list() }))
}

/// 查询单个流状态，同时视为一次活跃信号
pub async fn stream_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<StreamStatus>, ApiError> {
    let id = parse_id(&id)?;
    state.engine.touch(&id);
    Ok(Json(state.engine.status(&id)))
}

/// 启动流 API
/// 流已在运行时只刷新活跃时间；启动失败返回 500
pub async fn handle_start(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<StartRequest>,
) -> Result<Json<StreamStatus>, ApiError> {
    let id = parse_id(&id)?;
    let source = req.source.trim();
    if source.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "source must not be empty"));
    }

    state.engine.start_stream(&id, source).await.map_err(|e| {
        error!("Failed to start stream [{}]: {}", id, e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    Ok(Json(state.engine.status(&id)))
}

/// 停止流 API，流不存在时同样返回成功
pub async fn handle_stop(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    state.engine.stop_stream(&id).await;
    Ok(Json(json!({ "status": "stopped", "id": id.as_str() })))
}
