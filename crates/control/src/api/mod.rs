//! 控制面 HTTP 接口
//!
//! 管理操作 + agent 上报入口。认证不在本仓库范围内。

pub mod handlers;
pub mod response;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::service::AppService;

pub fn create_router(service: Arc<AppService>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/api/v1/project", post(handlers::create_project))
        .route("/api/v1/project/list", get(handlers::list_projects))
        .route("/api/v1/project/update", post(handlers::update_project))
        .route("/api/v1/project/delete", post(handlers::delete_project))
        .route("/api/v1/project/users", get(handlers::project_users))
        .route(
            "/api/v1/project/log/clean",
            post(handlers::clean_project_logs),
        )
        .route("/api/v1/project/relevance", post(handlers::add_relevance))
        .route(
            "/api/v1/project/relevance/delete",
            post(handlers::remove_relevance),
        )
        .route("/api/v1/task", post(handlers::save_task))
        .route("/api/v1/task/delete", post(handlers::delete_task))
        .route("/api/v1/task/list", get(handlers::list_tasks))
        .route("/api/v1/task/detail", get(handlers::task_detail))
        .route("/api/v1/task/count", get(handlers::task_count))
        .route("/api/v1/task/kill", post(handlers::kill_task))
        .route("/api/v1/task/execute", post(handlers::execute_task))
        .route("/api/v1/task/log", get(handlers::list_task_logs))
        .route("/api/v1/task/log/total", get(handlers::task_log_total))
        .route("/api/v1/task/log/clean", post(handlers::clean_task_logs))
        .route("/api/v1/log/total", get(handlers::log_total_by_date))
        .route("/api/v1/user", post(handlers::create_user))
        .route("/api/v1/user/list", get(handlers::list_users))
        .route("/api/v1/user/password", post(handlers::change_password))
        .route("/api/v1/worker/list", get(handlers::list_workers))
        .route("/api/v1/report/result", post(handlers::report_result))
        .route("/api/v1/report/warning", post(handlers::report_warning))
        .with_state(service)
}
