use crate::config::SupervisorConfig;
use crate::error::LaunchError;
use crate::launcher::{self, Launcher};
use crate::probe::{self, Readiness};
use crate::registry::{Ensure, Registry};
use crate::state::{Phase, StreamId, StreamRecord};
use crate::status::{output_url, StreamStatus};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_REAP_WAIT: Duration = Duration::from_secs(1);

/// 按需启动的流进程管理器
///
/// 显式构造并通过 `Arc` 共享，注册表是唯一的可变共享状态。
pub struct Engine {
    config: SupervisorConfig,
    hls_root: PathBuf,
    launcher: Arc<dyn Launcher>,
    registry: Arc<Registry>,
    launch_seq: AtomicU64,
}

impl Engine {
    pub fn new(
        config: SupervisorConfig,
        hls_root: impl Into<PathBuf>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        Self {
            config,
            hls_root: hls_root.into(),
            launcher,
            registry: Arc::new(Registry::default()),
            launch_seq: AtomicU64::new(0),
        }
    }

    /// 启动 (或刷新) 指定 id 的流，返回播放列表地址
    ///
    /// # 副作用
    /// - 首次启动时创建输出目录并启动子进程，然后等待就绪
    /// - 已在运行时只刷新最后活跃时间，不等待就绪
    /// - 旧进程已退出时先回收旧记录再重新启动
    ///
    /// # 错误处理
    /// - 只有启动失败会返回错误；启动后进程退出通过状态查询或回收任务观察
    /// - 内存检查在注册表锁外进行，已在运行的流不做检查
    pub async fn start_stream(&self, id: &StreamId, source: &str) -> Result<String, LaunchError> {
        if !self.registry.get(id).is_some_and(|record| record.is_alive()) {
            launcher::check_memory(self.config.min_free_memory_kb)?;
        }

        let record = loop {
            match self
                .registry
                .ensure_with(id, source, || self.launch(id, source))?
            {
                Ensure::Running(_) => {
                    debug!("Stream [{}] already running, refreshed", id);
                    return Ok(output_url(id));
                }
                Ensure::Launched(record) => break record,
                Ensure::Dead(stale) => {
                    warn!("Stream [{}] process is dead, restarting", id);
                    teardown_all(vec![stale], self.config.stop_grace()).await;
                }
            }
        };

        // 在锁外等待，并放到独立任务中，请求被取消时探测仍会完成
        let probe = tokio::spawn(probe::await_ready(
            self.registry.clone(),
            record,
            self.config.start_wait(),
            self.config.probe_interval(),
        ));
        if let Err(e) = probe.await {
            error!("Readiness probe for stream [{}] failed: {}", id, e);
        }

        Ok(output_url(id))
    }

    fn launch(&self, id: &StreamId, source: &str) -> Result<StreamRecord, LaunchError> {
        let seq = self.launch_seq.fetch_add(1, Ordering::Relaxed);
        let output_dir = self.hls_root.join(format!("{}-{}", id, seq));
        launcher::launch(self.launcher.as_ref(), id, source, &output_dir)
    }

    /// 等待指定流就绪，流不存在时立即返回
    pub async fn await_ready(&self, id: &StreamId, timeout: Duration) -> Readiness {
        match self.registry.get(id) {
            Some(record) => {
                probe::await_ready(
                    self.registry.clone(),
                    record,
                    timeout,
                    self.config.probe_interval(),
                )
                .await
            }
            None => Readiness::Stopped,
        }
    }

    /// 停止指定 id 的流任务，流不存在时什么也不做
    ///
    /// 先从注册表移除，再终止进程并删除输出目录。返回是否确实停止了一个流。
    pub async fn stop_stream(&self, id: &StreamId) -> bool {
        match self.registry.remove(id) {
            Some(record) => {
                teardown_all(vec![record], self.config.stop_grace()).await;
                true
            }
            None => false,
        }
    }

    pub fn touch(&self, id: &StreamId) -> bool {
        self.registry.touch(id)
    }

    pub fn record(&self, id: &StreamId) -> Option<Arc<StreamRecord>> {
        self.registry.get(id)
    }

    pub fn status(&self, id: &StreamId) -> StreamStatus {
        match self.registry.get(id) {
            Some(record) => StreamStatus::observe(&record),
            None => StreamStatus::idle(id),
        }
    }

    pub fn list(&self) -> Vec<StreamStatus> {
        self.registry
            .snapshot()
            .iter()
            .map(|record| StreamStatus::observe(record))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.registry.count()
    }

    /// 执行一轮回收：空闲超时或进程已退出的流走与 `stop_stream` 相同的回收路径
    pub async fn reap_once(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let mut reclaim = Vec::new();

        // --- 阶段 1: 检查流状态 ---
        for record in self.registry.snapshot() {
            let idle = record.idle_for();
            if idle > idle_timeout {
                info!(
                    "Stream [{}] idle for {}s. Scheduling stop.",
                    record.id,
                    idle.as_secs()
                );
            } else if let Some(status) = record.exit_status() {
                warn!("Stream [{}] exited unexpectedly with: {}", record.id, status);
                record.set_phase(Phase::Error);
            } else {
                continue;
            }

            if self.registry.remove_exact(&record) {
                reclaim.push(record);
            }
        }

        // --- 阶段 2: 执行停止流任务 ---
        let count = reclaim.len();
        teardown_all(reclaim, self.config.stop_grace()).await;
        count
    }

    /// 停止全部流，各流并发回收，总耗时受最长宽限期约束
    pub async fn stop_all(&self) {
        let records = self.registry.take_all();
        let count = records.len();
        teardown_all(records, self.config.stop_grace()).await;
        info!("All streams stopped ({} reclaimed)", count);
    }

    /// 创建输出根目录并清除上次运行遗留的目录
    pub async fn sweep_output_root(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.hls_root).await?;
        let mut entries = fs::read_dir(&self.hls_root).await?;
        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match fs::remove_dir_all(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove stale HLS output {:?}: {}", path, e),
            }
        }
        if removed > 0 {
            info!("Removed {} stale HLS output directories", removed);
        }
        Ok(())
    }
}

/// 并发回收多条记录。每条记录在独立任务中回收，调用方被取消时回收仍会完成
async fn teardown_all(records: Vec<Arc<StreamRecord>>, grace: Duration) {
    let handles: Vec<_> = records
        .into_iter()
        .map(|record| tokio::spawn(teardown(record, grace)))
        .collect();
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Stream teardown task failed: {}", e);
        }
    }
}

async fn teardown(record: Arc<StreamRecord>, grace: Duration) {
    terminate(&record, grace).await;

    match fs::remove_dir_all(&record.output_dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(
            "Failed to remove HLS output {:?} for stream [{}]: {}",
            record.output_dir, record.id, e
        ),
    }

    info!("Stream [{}] stopped and HLS files cleaned up.", record.id);
}

/// SIGTERM -> 等待宽限期 -> 强制结束
async fn terminate(record: &StreamRecord, grace: Duration) {
    if !record.is_alive() {
        return;
    }

    record.signal_terminate();
    if wait_exit(record, grace).await {
        return;
    }

    warn!(
        "Stream [{}] did not exit within {:.1}s, killing",
        record.id,
        grace.as_secs_f64()
    );
    record.force_kill();
    if !wait_exit(record, KILL_REAP_WAIT).await {
        error!("Stream [{}] still running after kill", record.id);
    }
}

async fn wait_exit(record: &StreamRecord, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !record.is_alive() {
            return true;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL.min(remaining)).await;
    }
}
