use anyhow::Result;
use crond::app::AppMode;
use crond::common::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    run_cli(
        "crond-agent",
        "分布式定时任务平台 - 执行节点",
        AppMode::Agent,
        "Agent",
    )
    .await
}
