use crate::launcher::PLAYLIST_NAME;
use crate::registry::Registry;
use crate::state::{Phase, StreamRecord};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// 等待就绪的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// 播放列表已生成
    Ready,
    /// 超时但进程仍在运行，按就绪处理
    TimedOut,
    /// 进程在就绪前退出
    Exited,
    /// 等待期间被外部停止或替换
    Stopped,
}

/// 轮询等待播放列表出现
///
/// 每轮依次检查：记录是否仍在注册表中、进程是否存活、播放列表是否非空。
/// 超时时只要进程仍在运行就标记为 streaming，源可能只是连接较慢。
pub async fn await_ready(
    registry: Arc<Registry>,
    record: Arc<StreamRecord>,
    timeout: Duration,
    interval: Duration,
) -> Readiness {
    let playlist = record.output_dir.join(PLAYLIST_NAME);
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if let Some(outcome) = check_gone(&registry, &record) {
            return outcome;
        }

        if playlist_ready(&playlist).await {
            record.set_phase(Phase::Streaming);
            info!("Stream [{}] ready", record.id);
            return Readiness::Ready;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(interval.min(remaining)).await;
    }

    if let Some(outcome) = check_gone(&registry, &record) {
        return outcome;
    }
    record.set_phase(Phase::Streaming);
    warn!(
        "Stream [{}] did not produce a playlist within {:.1}s. Check the source URL and network connectivity.",
        record.id,
        timeout.as_secs_f64()
    );
    Readiness::TimedOut
}

fn check_gone(registry: &Registry, record: &Arc<StreamRecord>) -> Option<Readiness> {
    if !registry.is_current(record) {
        return Some(Readiness::Stopped);
    }
    if let Some(status) = record.exit_status() {
        record.set_phase(Phase::Error);
        error!(
            "FFmpeg for stream [{}] exited early ({}). stderr: {}",
            record.id,
            status,
            record.stderr.joined()
        );
        return Some(Readiness::Exited);
    }
    None
}

async fn playlist_ready(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.len() > 0)
        .unwrap_or(false)
}
