//! agent 服务装配与生命周期
//!
//! 启动顺序：集群序号引导（雪花 ID 节点位）→ 注册 → 每个项目一个
//! 受监督的 watcher 循环 → 调度器主循环。引导、注册失败是致命错误；
//! 之后的一切故障都在各自的循环里自愈。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crond_core::supervisor::supervise;
use crond_core::{AppConfig, CrondResult, IdGenerator, KeyMaker, TaskReporter, Warner};
use crond_coordination::{AgentRegister, Coordinator, TaskPublisher};

use crate::scheduler::{SchedulerDeps, TaskScheduler};
use crate::watcher::TaskWatcher;

pub struct AgentService {
    projects: Vec<i64>,
    agent_ip: String,
    warner: Arc<dyn Warner>,
    register: AgentRegister,
    watcher: Arc<TaskWatcher>,
    scheduler: Option<TaskScheduler>,
}

impl AgentService {
    /// 装配 agent；协调器不可达、序号引导失败、注册失败都会在这里返回错误
    pub async fn new(
        config: &AppConfig,
        coordinator: Arc<dyn Coordinator>,
        reporter: Arc<dyn TaskReporter>,
        warner: Arc<dyn Warner>,
    ) -> CrondResult<Self> {
        let agent_ip = local_ip();
        let keys = KeyMaker::new(&config.coordinator.prefix);
        let projects = config.agent.projects.clone();

        let mut register = AgentRegister::new(
            Arc::clone(&coordinator),
            keys.clone(),
            &agent_ip,
            config.coordinator.lease_ttl_seconds,
        );

        let worker_id = register.bootstrap_worker_id().await?;
        info!("集群序号 {} (worker 位 {})", worker_id, worker_id % 1024);
        let idgen = Arc::new(IdGenerator::new(worker_id));

        register.register(&projects).await?;

        let publisher = Arc::new(TaskPublisher::new(
            Arc::clone(&coordinator),
            keys.clone(),
            idgen,
        ));

        let deps = SchedulerDeps {
            coordinator: Arc::clone(&coordinator),
            keys: keys.clone(),
            publisher: Arc::clone(&publisher),
            reporter,
            warner: Arc::clone(&warner),
            agent_ip: agent_ip.clone(),
            lock_ttl_seconds: config.coordinator.lease_ttl_seconds,
            grace: Duration::from_secs(config.agent.grace_seconds),
            output_limit_bytes: config.agent.output_limit_bytes,
        };
        let (events_tx, scheduler) = TaskScheduler::new(deps);

        let watcher = Arc::new(TaskWatcher::new(
            coordinator,
            keys,
            publisher,
            Arc::clone(&warner),
            &agent_ip,
            events_tx,
        ));

        Ok(Self {
            projects,
            agent_ip,
            warner,
            register,
            watcher,
            scheduler: Some(scheduler),
        })
    }

    pub fn agent_ip(&self) -> &str {
        &self.agent_ip
    }

    /// 运行直到关闭信号；返回前注销注册
    pub async fn run(mut self, shutdown_rx: broadcast::Receiver<()>) {
        let mut watcher_handles = Vec::with_capacity(self.projects.len());
        for project_id in self.projects.clone() {
            let watcher = Arc::clone(&self.watcher);
            watcher_handles.push(supervise(
                "task-watcher",
                self.agent_ip.clone(),
                Arc::clone(&self.warner),
                shutdown_rx.resubscribe(),
                move || {
                    let watcher = Arc::clone(&watcher);
                    async move { watcher.run_project(project_id).await }
                },
            ));
        }

        if let Some(scheduler) = self.scheduler.take() {
            scheduler.run(shutdown_rx.resubscribe()).await;
        }

        // watcher 监督器随关闭信号退出
        for handle in watcher_handles {
            let _ = handle.await;
        }
        if let Err(e) = self.register.deregister().await {
            warn!("注销失败(租约将自然过期): {}", e);
        }
        info!("agent {} 已退出", self.agent_ip);
    }
}

/// 本机对外 IP；UDP connect 不实际发包，只用来取路由源地址
pub fn local_ip() -> String {
    let probe = || -> std::io::Result<std::net::SocketAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        socket.local_addr()
    };
    match probe() {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => "127.0.0.1".to_string(),
    }
}
