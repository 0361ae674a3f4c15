use anyhow::Result;
use crond::app::AppMode;
use crond::common::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    run_cli(
        "crond-server",
        "分布式定时任务平台 - 控制面服务",
        AppMode::Server,
        "Server",
    )
    .await
}
