//! HLS Relay - 按需启动的 RTSP -> HLS 流进程管理
//!
//! 调用方提供 `(流 id, 源地址)`，[`engine::Engine`] 负责启动 FFmpeg、
//! 等待播放列表就绪、汇报状态，并在手动停止或空闲超时后回收进程与输出目录。

pub mod config;
pub mod engine;
pub mod error;
pub mod launcher;
pub mod probe;
pub mod registry;
pub mod state;
pub mod status;
pub mod supervisor;
pub mod web;
