use clap::Parser;
use hls_relay::config::AppConfig;
use hls_relay::engine::Engine;
use hls_relay::launcher::{resolve_executable, FfmpegLauncher};
use hls_relay::state::AppState;
use hls_relay::web::admin;
use hls_relay::{supervisor, web};
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// HLS Relay - On-demand RTSP to HLS gateway
/// 解析命令行参数，加载配置文件，启动HTTP服务及后台回收任务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "hls-relay.yaml")]
    config: String,

    /// 覆盖配置中的监听地址
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    info!("HLS Relay initialized. HLS Root: {}", config.server.hls_root);

    if resolve_executable(&config.ffmpeg.binary).is_none() {
        warn!(
            "FFmpeg binary '{}' not found, streams will fail to start",
            config.ffmpeg.binary
        );
    }

    let launcher = Arc::new(FfmpegLauncher::new(config.ffmpeg.clone()));
    let engine = Arc::new(Engine::new(
        config.supervisor.clone(),
        &config.server.hls_root,
        launcher,
    ));
    engine.sweep_output_root().await?;

    // 启动后台回收任务
    let supervisor = supervisor::spawn(engine.clone(), config.supervisor.reap_interval());

    let git_commit = admin::read_git_commit(Path::new(env!("CARGO_MANIFEST_DIR"))).await;
    let state = Arc::new(AppState {
        config: config.clone(),
        engine: engine.clone(),
        started_at: Instant::now(),
        git_commit,
    });
    let app = web::router(state);

    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, stopping all active streams");
    supervisor.shutdown().await;
    engine.stop_all().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
