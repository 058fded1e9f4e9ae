//! 流管理相关的错误类型

use std::path::PathBuf;
use thiserror::Error;

/// 启动 FFmpeg 失败，只会同步返回给发起启动的请求
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("executable not found: {program}")]
    ExecutableNotFound { program: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to prepare output directory {path:?}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("insufficient system memory ({available_kb} KB available)")]
    InsufficientMemory { available_kb: u64 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamIdError {
    #[error("stream id must not be empty")]
    Empty,

    #[error("stream id is longer than {max} bytes")]
    TooLong { max: usize },

    #[error("stream id contains invalid character {0:?}")]
    InvalidChar(char),

    #[error("stream id must not start with '.'")]
    LeadingDot,
}
