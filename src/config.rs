use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// HLS 切片存储根目录
    /// 建议配置为 /dev/shm/hls-relay 以保护闪存寿命
    #[serde(default = "default_hls_root")]
    pub hls_root: String,
}

/// FFmpeg 命令构建参数
#[derive(Debug, Deserialize, Clone)]
pub struct FfmpegConfig {
    #[serde(default = "default_ffmpeg_binary")]
    pub binary: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 单个切片时长 (秒)
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,
    /// 播放列表保留的切片数
    #[serde(default = "default_playlist_size")]
    pub playlist_size: u32,
    #[serde(default)]
    pub rtsp_transport: RtspTransport,
    /// 直接复制视频流，不做转码
    #[serde(default = "default_true")]
    pub copy_video: bool,
    /// 默认丢弃音频
    #[serde(default)]
    pub keep_audio: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RtspTransport {
    #[default]
    Tcp,
    Udp,
    Http,
}

impl RtspTransport {
    pub fn as_str(self) -> &'static str {
        match self {
            RtspTransport::Tcp => "tcp",
            RtspTransport::Udp => "udp",
            RtspTransport::Http => "http",
        }
    }
}

/// 流生命周期参数 (全部以毫秒为单位)
#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// 无访问超过该时长后自动回收
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// 等待播放列表出现的最长时间
    #[serde(default = "default_start_wait_ms")]
    pub start_wait_ms: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// 后台回收周期
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
    /// SIGTERM 之后等待进程退出的宽限期，超时则强制结束
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// 可用内存低于该值 (KB) 时拒绝启动新流，0 表示不检查
    #[serde(default = "default_min_free_memory_kb")]
    pub min_free_memory_kb: u64,
}

impl SupervisorConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn start_wait(&self) -> Duration {
        Duration::from_millis(self.start_wait_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            hls_root: default_hls_root(),
        }
    }
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: default_ffmpeg_binary(),
            log_level: default_log_level(),
            segment_seconds: default_segment_seconds(),
            playlist_size: default_playlist_size(),
            rtsp_transport: RtspTransport::default(),
            copy_video: true,
            keep_audio: false,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            start_wait_ms: default_start_wait_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            reap_interval_ms: default_reap_interval_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            min_free_memory_kb: default_min_free_memory_kb(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_hls_root() -> String {
    "./static/hls".to_string()
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

fn default_log_level() -> String {
    "error".to_string()
}

fn default_segment_seconds() -> u32 {
    2
}

fn default_playlist_size() -> u32 {
    6
}

fn default_true() -> bool {
    true
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_start_wait_ms() -> u64 {
    10_000
}

fn default_probe_interval_ms() -> u64 {
    400
}

fn default_reap_interval_ms() -> u64 {
    30_000
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

fn default_min_free_memory_kb() -> u64 {
    5_120
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_yaml(&content)?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置，任何非法值都直接报错而不是悄悄修正
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.listen.trim().is_empty() {
            bail!("server.listen must not be empty");
        }
        if self.server.hls_root.trim().is_empty() {
            bail!("server.hls_root must not be empty");
        }
        if self.ffmpeg.binary.trim().is_empty() {
            bail!("ffmpeg.binary must not be empty");
        }
        if self.ffmpeg.segment_seconds == 0 {
            bail!("ffmpeg.segment_seconds must be greater than 0");
        }
        if self.ffmpeg.playlist_size == 0 {
            bail!("ffmpeg.playlist_size must be greater than 0");
        }

        let sup = &self.supervisor;
        for (name, value) in [
            ("idle_timeout_ms", sup.idle_timeout_ms),
            ("start_wait_ms", sup.start_wait_ms),
            ("probe_interval_ms", sup.probe_interval_ms),
            ("reap_interval_ms", sup.reap_interval_ms),
            ("stop_grace_ms", sup.stop_grace_ms),
        ] {
            if value == 0 {
                bail!("supervisor.{} must be greater than 0", name);
            }
        }
        Ok(())
    }
}
