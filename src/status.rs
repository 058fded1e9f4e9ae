use crate::launcher::PLAYLIST_NAME;
use crate::state::{Phase, StreamId, StreamRecord};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Starting,
    Streaming,
    Error,
}

impl From<Phase> for StreamState {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Starting => StreamState::Starting,
            Phase::Streaming => StreamState::Streaming,
            Phase::Error => StreamState::Error,
        }
    }
}

/// 对外展示的流状态，只读投影
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub id: String,
    pub status: StreamState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl StreamStatus {
    pub fn idle(id: &StreamId) -> Self {
        Self {
            id: id.to_string(),
            status: StreamState::Idle,
            output_url: None,
            source: None,
            started_at_ms: None,
            last_activity_ms: None,
            uptime_seconds: None,
            idle_seconds: None,
            pid: None,
        }
    }

    /// 投影前检查进程是否已退出，已退出则原地标记为 error
    pub fn observe(record: &StreamRecord) -> Self {
        if record.phase() != Phase::Error && !record.is_alive() {
            record.set_phase(Phase::Error);
        }

        Self {
            id: record.id.to_string(),
            status: record.phase().into(),
            output_url: Some(output_url(&record.id)),
            source: Some(record.source.clone()),
            started_at_ms: Some(record.started_at_unix_ms()),
            last_activity_ms: Some(record.last_activity_unix_ms()),
            uptime_seconds: Some(record.uptime().as_secs()),
            idle_seconds: Some(record.idle_for().as_secs()),
            pid: record.pid,
        }
    }
}

/// 客户端拉取播放列表的地址
pub fn output_url(id: &StreamId) -> String {
    format!("/hls/{}/{}", id, PLAYLIST_NAME)
}
