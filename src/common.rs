use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crond_core::AppConfig;

use crate::app::{AppMode, Application};
use crate::shutdown::ShutdownManager;

/// 统一的命令行定义：server 与 agent 共享参数
pub fn build_cli(name: &'static str, about: &'static str) -> Command {
    Command::new(name)
        .version(env!("CARGO_PKG_VERSION"))
        .about(about)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别(覆盖配置文件)")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式(覆盖配置文件)")
                .value_parser(["json", "pretty"]),
        )
}

/// 初始化日志系统
pub fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
        other => anyhow::bail!("不支持的日志格式: {other}"),
    }
    Ok(())
}

/// 统一的启动流程：解析参数 → 加载配置 → 初始化日志 → 运行直到信号
pub async fn run_cli(
    app_name: &'static str,
    app_description: &'static str,
    mode: AppMode,
    service_name: &str,
) -> Result<()> {
    let matches = build_cli(app_name, app_description).get_matches();
    run_with_matches(&matches, mode, service_name).await
}

async fn run_with_matches(
    matches: &ArgMatches,
    mode: AppMode,
    service_name: &str,
) -> Result<()> {
    let config_path = matches.get_one::<String>("config").map(|s| s.as_str());
    let config = AppConfig::load(config_path).context("加载配置失败")?;

    let log_level = matches
        .get_one::<String>("log-level")
        .cloned()
        .unwrap_or_else(|| config.log.level.clone());
    let log_format = matches
        .get_one::<String>("log-format")
        .cloned()
        .unwrap_or_else(|| config.log.format.clone());
    init_logging(&log_level, &log_format)?;

    info!("启动 {} 服务, 模式: {:?}", service_name, mode);
    if let Some(path) = config_path {
        info!("配置文件: {}", path);
    }

    let app = Arc::new(Application::new(config, mode));
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e:#}");
                std::process::exit(1);
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Ok(Ok(())) => info!("{} 服务已优雅关闭", service_name),
        Err(_) => warn!("{} 服务关闭超时，强制退出", service_name),
    }
    info!("{} 服务已退出", service_name);
    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.unwrap_or_else(|e| {
            error!("安装Ctrl+C信号处理器失败: {}", e);
            std::process::exit(1);
        })
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {}", e);
                std::process::exit(1);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}
