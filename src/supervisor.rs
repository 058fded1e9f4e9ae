use crate::engine::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 后台回收任务的句柄，关闭时取消并等待任务结束
pub struct SupervisorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// 取消回收循环并等待其退出。正在执行的一轮回收会先完成
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Supervisor task failed: {}", e);
        }
    }
}

/// 启动后台监控任务，定期回收空闲或已退出的流
///
/// # 任务流程：
/// - 每隔指定的时间间隔执行一轮 [`Engine::reap_once`]
/// - 空闲超时的流与进程意外退出的流都走与手动停止相同的回收路径
/// - 单轮回收在独立任务中执行，即使 panic 也不会中断循环
pub fn spawn(engine: Arc<Engine>, interval: Duration) -> SupervisorHandle {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run(engine, interval, cancel.clone()));
    info!(
        "Stream supervisor started (interval={}ms)",
        interval.as_millis()
    );
    SupervisorHandle { cancel, task }
}

async fn run(engine: Arc<Engine>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 第一次 tick 立即完成，跳过
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let cycle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.reap_once().await }
        });
        match cycle.await {
            Ok(0) => {}
            Ok(reclaimed) => info!("Supervisor reclaimed {} stream(s)", reclaimed),
            Err(e) => error!("Supervisor cycle failed: {}", e),
        }
    }

    info!("Stream supervisor stopped");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::launcher::Launcher;
    use crate::state::StreamId;
    use crate::status::StreamState;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::process::Command;

    struct SleepLauncher;

    impl Launcher for SleepLauncher {
        fn command(&self, _id: &StreamId, _source: &str, output_dir: &Path) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(r#"echo '#EXTM3U' > "$1/index.m3u8"; exec sleep 30"#)
                .arg("sh")
                .arg(output_dir);
            cmd
        }
    }

    fn engine(root: &TempDir, idle_timeout_ms: u64) -> Arc<Engine> {
        let config = SupervisorConfig {
            idle_timeout_ms,
            start_wait_ms: 3_000,
            probe_interval_ms: 50,
            reap_interval_ms: 50,
            stop_grace_ms: 1_000,
            min_free_memory_kb: 0,
        };
        Arc::new(Engine::new(config, root.path(), Arc::new(SleepLauncher)))
    }

    #[tokio::test]
    async fn loop_reclaims_idle_streams() {
        let root = TempDir::new().unwrap();
        let engine = engine(&root, 100);
        let id = StreamId::parse("2").unwrap();

        engine.start_stream(&id, "rtsp://a").await.unwrap();
        let handle = spawn(engine.clone(), Duration::from_millis(50));

        // 记录先被移除，目录在回收完成后才删除
        let outputs = || std::fs::read_dir(root.path()).unwrap().count();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while (engine.active_count() > 0 || outputs() > 0)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(engine.status(&id).status, StreamState::Idle);
        assert_eq!(outputs(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop_promptly() {
        let root = TempDir::new().unwrap();
        let engine = engine(&root, 60_000);
        let handle = spawn(engine, Duration::from_secs(3600));

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("supervisor did not stop");
    }

    #[tokio::test]
    async fn active_streams_survive_cycles() {
        let root = TempDir::new().unwrap();
        let engine = engine(&root, 60_000);
        let id = StreamId::parse("11").unwrap();

        engine.start_stream(&id, "rtsp://a").await.unwrap();
        let handle = spawn(engine.clone(), Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.shutdown().await;

        assert_eq!(engine.status(&id).status, StreamState::Streaming);
        engine.stop_all().await;
    }
}
