use clap::Parser;
use relay_link::clock::TokioClock;
use relay_link::config::AppConfig;
use relay_link::engine::FfmpegRunner;
use relay_link::health::HealthChecker;
use relay_link::store::JsonFileStore;
use relay_link::supervisor::{Supervisor, SupervisorOptions};
use relay_link::web::{self, ApiState};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Relay Link - 推流转发进程监督服务
/// 解析命令行参数，加载配置文件，恢复推流并启动HTTP服务及后台健康检查
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "relay-link.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统 (RUST_LOG 优先，默认 info)
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    info!(
        "Relay Link initialized. ffmpeg: {}, store: {}",
        config.server.ffmpeg_binary, config.server.store_path
    );

    // 组装监督器
    let store = Arc::new(JsonFileStore::open(&config.server.store_path).await?);
    let runner = Arc::new(
        FfmpegRunner::new(
            config.server.ffmpeg_binary.clone(),
            config.server.default_output_url.clone(),
            config.server.startup_grace(),
        )
        .with_progress(config.server.progress_report),
    );
    let supervisor = Arc::new(Supervisor::new(
        runner,
        store,
        Arc::new(TokioClock),
        SupervisorOptions::from_config(&config),
    ));

    // 恢复上次处于启用状态的推流
    if let Err(e) = supervisor.resume_active().await {
        error!("Failed to resume streams: {}", e);
    }

    // 启动后台健康检查
    let cancel = CancellationToken::new();
    let checker = HealthChecker::new(supervisor.clone(), config.server.health_check_interval());
    let health_task = tokio::spawn(checker.run(cancel.clone()));

    let app = web::router(ApiState {
        supervisor: supervisor.clone(),
        add_attempts: config.server.add_attempts,
    });

    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await?;

    // 停止健康检查并回收所有子进程
    cancel.cancel();
    if let Err(e) = health_task.await {
        error!("Health checker task failed: {}", e);
    }
    supervisor.shutdown().await;

    Ok(())
}
