use crate::config::AppConfig;
use crate::engine::Engine;
use crate::error::StreamIdError;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::process::Child;
use tokio::time::Instant;

const MAX_STREAM_ID_LEN: usize = 64;
const STDERR_TAIL_LINES: usize = 20;

/// 调用方分配的流标识，同时用作输出目录名的一部分
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(String);

impl StreamId {
    pub fn parse(raw: &str) -> Result<Self, StreamIdError> {
        if raw.is_empty() {
            return Err(StreamIdError::Empty);
        }
        if raw.len() > MAX_STREAM_ID_LEN {
            return Err(StreamIdError::TooLong {
                max: MAX_STREAM_ID_LEN,
            });
        }
        if raw.starts_with('.') {
            return Err(StreamIdError::LeadingDot);
        }
        if let Some(c) = raw
            .chars()
            .find(|&c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(StreamIdError::InvalidChar(c));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 记录在生命周期内的阶段。空闲 (idle) 不是记录的状态，而是“没有记录”
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Streaming,
    Error,
}

/// 最近若干行 FFmpeg stderr 输出，用于诊断
#[derive(Debug, Default)]
pub struct StderrTail {
    lines: Mutex<VecDeque<String>>,
}

impl StderrTail {
    pub fn push(&self, line: String) {
        let mut lines = lock(&self.lines);
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn joined(&self) -> String {
        lock(&self.lines)
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// 运行时的流实例
pub struct StreamRecord {
    pub id: StreamId,
    /// 输入地址，记录存活期间不变
    pub source: String,
    /// 本次启动独占的输出目录，回收时删除
    pub output_dir: PathBuf,
    pub started_at: Instant,
    pub started_wall: SystemTime,
    pub pid: Option<u32>,
    pub stderr: Arc<StderrTail>,
    /// 相对 started_at 的毫秒偏移，无锁更新
    last_activity_ms: AtomicU64,
    phase: Mutex<Phase>,
    /// FFmpeg 子进程句柄
    process: Mutex<Child>,
}

impl StreamRecord {
    pub fn new(
        id: StreamId,
        source: String,
        output_dir: PathBuf,
        process: Child,
        stderr: Arc<StderrTail>,
    ) -> Self {
        Self {
            id,
            source,
            output_dir,
            started_at: Instant::now(),
            started_wall: SystemTime::now(),
            pid: process.id(),
            stderr,
            last_activity_ms: AtomicU64::new(0),
            phase: Mutex::new(Phase::Starting),
            process: Mutex::new(process),
        }
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    pub fn set_phase(&self, phase: Phase) {
        *lock(&self.phase) = phase;
    }

    /// 刷新最后活跃时间。并发刷新只会让时间戳前进
    pub fn touch(&self) {
        let now = self.started_at.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started_at.elapsed().saturating_sub(last)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn started_at_unix_ms(&self) -> u64 {
        unix_ms(self.started_wall)
    }

    pub fn last_activity_unix_ms(&self) -> u64 {
        unix_ms(self.started_wall) + self.last_activity_ms.load(Ordering::Relaxed)
    }

    /// 非阻塞地检查进程是否仍在运行。无法查询时按已退出处理
    pub fn is_alive(&self) -> bool {
        matches!(lock(&self.process).try_wait(), Ok(None))
    }

    /// 已退出时返回退出状态描述
    pub fn exit_status(&self) -> Option<String> {
        match lock(&self.process).try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({})", e)),
        }
    }

    /// 发送 SIGTERM，非 unix 平台直接强制结束。已退出的进程不再发信号。
    /// 持有进程锁期间子进程不会被回收，pid 不会被系统复用
    pub fn signal_terminate(&self) {
        let mut process = lock(&self.process);
        if !matches!(process.try_wait(), Ok(None)) {
            return;
        }
        #[cfg(unix)]
        {
            if let Some(pid) = process.id() {
                // SAFETY: pid 属于我们持有且尚未回收的子进程
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
                return;
            }
        }
        let _ = process.start_kill();
    }

    pub fn force_kill(&self) {
        let _ = lock(&self.process).start_kill();
    }
}

fn unix_ms(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 锁中毒时继续使用内部数据，单条记录的状态不会因此失效
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 全局应用上下文
pub struct AppState {
    pub config: AppConfig,
    pub engine: Arc<Engine>,
    pub started_at: Instant,
    /// 启动时读取的源码提交号
    pub git_commit: Option<String>,
}

pub type SharedState = Arc<AppState>;
