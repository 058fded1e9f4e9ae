use crate::config::FfmpegConfig;
use crate::error::LaunchError;
use crate::state::{StderrTail, StreamId, StreamRecord};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tracing::{debug, error, info, warn};

/// FFmpeg 写出的播放列表文件名
pub const PLAYLIST_NAME: &str = "index.m3u8";

/// 根据输入地址与输出目录构建转封装命令
///
/// 实现只负责命令本身；目录准备、stdio 与 spawn 由 [`launch`] 统一处理。
pub trait Launcher: Send + Sync {
    fn command(&self, id: &StreamId, source: &str, output_dir: &Path) -> Command;
}

pub struct FfmpegLauncher {
    config: FfmpegConfig,
}

impl FfmpegLauncher {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    /// RTSP -> HLS 参数。默认 `-c:v copy` 不转码，并丢弃音频
    pub fn args(&self, source: &str, output_dir: &Path) -> Vec<String> {
        let cfg = &self.config;
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-y".into(),
            "-loglevel".into(),
            cfg.log_level.clone(),
        ];

        // -rtsp_transport 是 RTSP demuxer 的私有选项，其他协议会报错
        let lower = source.to_ascii_lowercase();
        if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
            args.push("-rtsp_transport".into());
            args.push(cfg.rtsp_transport.as_str().into());
        }
        args.push("-i".into());
        args.push(source.to_string());

        if cfg.copy_video {
            args.extend(["-c:v".to_string(), "copy".to_string()]);
        } else {
            args.extend([
                "-c:v".to_string(),
                "libx264".to_string(),
                "-preset".to_string(),
                "veryfast".to_string(),
            ]);
        }
        if cfg.keep_audio {
            args.extend(["-c:a".to_string(), "aac".to_string()]);
        } else {
            args.push("-an".to_string());
        }

        let segment_pattern = output_dir.join("seg_%05d.ts");
        let playlist = output_dir.join(PLAYLIST_NAME);
        args.extend([
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            cfg.segment_seconds.to_string(),
            "-hls_list_size".to_string(),
            cfg.playlist_size.to_string(),
            "-hls_flags".to_string(),
            "delete_segments+append_list".to_string(),
            "-hls_segment_type".to_string(),
            "mpegts".to_string(),
            "-hls_segment_filename".to_string(),
            segment_pattern.to_string_lossy().into_owned(),
            playlist.to_string_lossy().into_owned(),
        ]);
        args
    }
}

impl Launcher for FfmpegLauncher {
    fn command(&self, _id: &StreamId, source: &str, output_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.args(source, output_dir));
        cmd
    }
}

/// 启动前检查系统内存，`min_free_kb` 为 0 时跳过
pub fn check_memory(min_free_kb: u64) -> Result<(), LaunchError> {
    if min_free_kb == 0 {
        return Ok(());
    }
    match sys_info::mem_info() {
        Ok(mem) if mem.avail < min_free_kb => Err(LaunchError::InsufficientMemory {
            available_kb: mem.avail,
        }),
        Ok(_) => Ok(()),
        Err(e) => {
            // 无法获取内存信息时仅记录警告而不阻断流程
            warn!("Failed to check memory usage: {}", e);
            Ok(())
        }
    }
}

/// 创建输出目录。目录名每次启动都不同，只有遗留目录才需要先清理
fn prepare_output_dir(dir: &Path) -> Result<(), LaunchError> {
    let created = match std::fs::create_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let _ = std::fs::remove_dir_all(dir);
            std::fs::create_dir_all(dir)
        }
        Err(_) => std::fs::create_dir_all(dir),
    };
    created.map_err(|source| LaunchError::OutputDir {
        path: dir.to_path_buf(),
        source,
    })
}

/// 启动子进程并返回新的流记录
///
/// # 副作用
/// - 清理并创建 `output_dir`，spawn 失败时删除
/// - stdin/stdout 丢弃，stderr 由后台任务持续读取，避免管道写满阻塞 FFmpeg
pub fn launch(
    launcher: &dyn Launcher,
    id: &StreamId,
    source: &str,
    output_dir: &Path,
) -> Result<StreamRecord, LaunchError> {
    prepare_output_dir(output_dir)?;

    let mut cmd = launcher.command(id, source, output_dir);
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!("Failed to spawn {} for stream [{}]: {}", program, id, e);
            let _ = std::fs::remove_dir_all(output_dir);
            return Err(if e.kind() == ErrorKind::NotFound {
                LaunchError::ExecutableNotFound { program }
            } else {
                LaunchError::Spawn { program, source: e }
            });
        }
    };

    let stderr = Arc::new(StderrTail::default());
    if let Some(pipe) = child.stderr.take() {
        tokio::spawn(drain_stderr(id.clone(), pipe, stderr.clone()));
    }

    info!(
        "Starting stream [{}] (pid {:?}). HLS Output: {:?}",
        id,
        child.id(),
        output_dir
    );

    Ok(StreamRecord::new(
        id.clone(),
        source.to_string(),
        output_dir.to_path_buf(),
        child,
        stderr,
    ))
}

/// 持续读取 stderr 直到 EOF。FFmpeg 输出的元数据不一定是 UTF-8，
/// 按字节读取后有损解码；提前停止读取会让 FFmpeg 因 SIGPIPE 退出
async fn drain_stderr(id: StreamId, pipe: ChildStderr, tail: Arc<StderrTail>) {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                debug!("Stream [{}] ffmpeg: {}", id, line);
                tail.push(line);
            }
            Err(e) => {
                debug!("Stream [{}] stderr closed: {}", id, e);
                break;
            }
        }
    }
}

/// 在 PATH 中查找可执行文件；包含路径分隔符时按路径直接检查
pub fn resolve_executable(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RtspTransport;

    fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn rtsp_source_copies_video_and_drops_audio() {
        let launcher = FfmpegLauncher::new(FfmpegConfig::default());
        let args = launcher.args("rtsp://cam.local/stream1", Path::new("/tmp/hls/5-0"));

        assert_eq!(arg_after(&args, "-rtsp_transport"), Some("tcp"));
        assert_eq!(arg_after(&args, "-i"), Some("rtsp://cam.local/stream1"));
        assert_eq!(arg_after(&args, "-c:v"), Some("copy"));
        assert!(args.iter().any(|a| a == "-an"));
        assert_eq!(arg_after(&args, "-hls_time"), Some("2"));
        assert_eq!(arg_after(&args, "-hls_list_size"), Some("6"));
        assert_eq!(
            arg_after(&args, "-hls_flags"),
            Some("delete_segments+append_list")
        );
        assert_eq!(
            arg_after(&args, "-hls_segment_filename"),
            Some("/tmp/hls/5-0/seg_%05d.ts")
        );
        assert_eq!(args.last().map(String::as_str), Some("/tmp/hls/5-0/index.m3u8"));
    }

    #[test]
    fn non_rtsp_source_skips_transport_flag() {
        let launcher = FfmpegLauncher::new(FfmpegConfig::default());
        let args = launcher.args("http://cam.local/live.flv", Path::new("/tmp/out"));
        assert!(!args.iter().any(|a| a == "-rtsp_transport"));
    }

    #[test]
    fn transcode_and_audio_options() {
        let config = FfmpegConfig {
            copy_video: false,
            keep_audio: true,
            rtsp_transport: RtspTransport::Udp,
            segment_seconds: 4,
            playlist_size: 3,
            ..FfmpegConfig::default()
        };
        let launcher = FfmpegLauncher::new(config);
        let args = launcher.args("RTSP://cam.local/s", Path::new("/tmp/out"));

        assert_eq!(arg_after(&args, "-rtsp_transport"), Some("udp"));
        assert_eq!(arg_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(arg_after(&args, "-c:a"), Some("aac"));
        assert!(!args.iter().any(|a| a == "-an"));
        assert_eq!(arg_after(&args, "-hls_time"), Some("4"));
        assert_eq!(arg_after(&args, "-hls_list_size"), Some("3"));
    }

    #[test]
    fn command_uses_configured_binary() {
        let config = FfmpegConfig {
            binary: "/opt/ffmpeg/bin/ffmpeg".into(),
            ..FfmpegConfig::default()
        };
        let launcher = FfmpegLauncher::new(config);
        let id = StreamId::parse("1").unwrap();
        let cmd = launcher.command(&id, "rtsp://a", Path::new("/tmp/out"));
        assert_eq!(cmd.as_std().get_program(), "/opt/ffmpeg/bin/ffmpeg");
    }

    #[test]
    fn prepare_output_dir_clears_leftovers_and_creates_parents() {
        let root = tempfile::TempDir::new().unwrap();
        let stale = root.path().join("3-0");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("index.m3u8"), b"#EXTM3U").unwrap();

        prepare_output_dir(&stale).unwrap();
        assert!(stale.is_dir());
        assert_eq!(std::fs::read_dir(&stale).unwrap().count(), 0);

        let nested = root.path().join("missing").join("4-1");
        prepare_output_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn memory_guard_can_be_disabled() {
        assert!(check_memory(0).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn resolves_executables() {
        assert!(resolve_executable("sh").is_some());
        assert!(resolve_executable("/bin/sh").is_some());
        assert!(resolve_executable("definitely-not-a-real-binary-xyz").is_none());
        assert!(resolve_executable("/nonexistent/dir/ffmpeg").is_none());
    }
}
