use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crond_core::models::{Project, TaskExecuteResult, TaskInfo, TaskLog, User};
use crond_core::WarningData;

use super::response::{ApiError, ApiResponse};
use crate::service::{AppService, GetUserListArgs};

type AppState = State<Arc<AppService>>;
type Result<T> = std::result::Result<T, ApiError>;

fn default_pagesize() -> i64 {
    20
}

// ----------------------------------------------------------------------
// 项目
// ----------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub title: String,
    #[serde(default)]
    pub remark: String,
    pub uid: i64,
}

pub async fn create_project(
    State(service): AppState,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<ApiResponse<i64>>> {
    let project_id = service
        .create_project(Project {
            id: 0,
            title: req.title,
            remark: req.remark,
            uid: req.uid,
        })
        .await?;
    Ok(ApiResponse::ok(project_id))
}

#[derive(Deserialize)]
pub struct UidQuery {
    pub uid: i64,
}

pub async fn list_projects(
    State(service): AppState,
    Query(query): Query<UidQuery>,
) -> Result<Json<ApiResponse<Vec<Project>>>> {
    Ok(ApiResponse::ok(service.get_user_projects(query.uid).await?))
}

#[derive(Deserialize)]
pub struct DeleteProjectRequest {
    pub project_id: i64,
    pub uid: i64,
}

pub async fn delete_project(
    State(service): AppState,
    Json(req): Json<DeleteProjectRequest>,
) -> Result<Json<ApiResponse<()>>> {
    service.delete_project(req.project_id, req.uid).await?;
    Ok(ApiResponse::empty())
}

#[derive(Deserialize)]
pub struct UpdateProjectRequest {
    pub project_id: i64,
    pub uid: i64,
    pub title: String,
    #[serde(default)]
    pub remark: String,
}

pub async fn update_project(
    State(service): AppState,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<Json<ApiResponse<()>>> {
    service
        .update_project(req.project_id, req.uid, &req.title, &req.remark)
        .await?;
    Ok(ApiResponse::empty())
}

#[derive(Deserialize)]
pub struct RelevanceRequest {
    pub project_id: i64,
    pub uid: i64,
}

pub async fn add_relevance(
    State(service): AppState,
    Json(req): Json<RelevanceRequest>,
) -> Result<Json<ApiResponse<()>>> {
    service
        .create_project_relevance(req.project_id, req.uid)
        .await?;
    Ok(ApiResponse::empty())
}

pub async fn remove_relevance(
    State(service): AppState,
    Json(req): Json<RelevanceRequest>,
) -> Result<Json<ApiResponse<()>>> {
    service
        .delete_project_relevance(req.project_id, req.uid)
        .await?;
    Ok(ApiResponse::empty())
}

pub async fn project_users(
    State(service): AppState,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<ApiResponse<Vec<User>>>> {
    let relevances = service
        .get_project_relevance_users(query.project_id)
        .await?;
    let uids = relevances.iter().map(|r| r.uid).collect();
    Ok(ApiResponse::ok(service.get_users_by_ids(uids).await?))
}

// ----------------------------------------------------------------------
// 任务
// ----------------------------------------------------------------------

pub async fn save_task(
    State(service): AppState,
    Json(task): Json<TaskInfo>,
) -> Result<Json<ApiResponse<Option<TaskInfo>>>> {
    Ok(ApiResponse::ok(service.save_task(task).await?))
}

#[derive(Deserialize)]
pub struct TaskRef {
    pub project_id: i64,
    pub task_id: String,
}

pub async fn delete_task(
    State(service): AppState,
    Json(req): Json<TaskRef>,
) -> Result<Json<ApiResponse<Option<TaskInfo>>>> {
    Ok(ApiResponse::ok(
        service.delete_task(req.project_id, &req.task_id).await?,
    ))
}

#[derive(Deserialize)]
pub struct ProjectQuery {
    pub project_id: i64,
}

pub async fn list_tasks(
    State(service): AppState,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<ApiResponse<Vec<TaskInfo>>>> {
    Ok(ApiResponse::ok(
        service.get_task_list(query.project_id).await?,
    ))
}

#[derive(Deserialize)]
pub struct TaskQuery {
    pub project_id: i64,
    pub task_id: String,
}

pub async fn task_detail(
    State(service): AppState,
    Query(query): Query<TaskQuery>,
) -> Result<Json<ApiResponse<TaskInfo>>> {
    Ok(ApiResponse::ok(
        service.get_task(query.project_id, &query.task_id).await?,
    ))
}

pub async fn task_count(
    State(service): AppState,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<ApiResponse<usize>>> {
    Ok(ApiResponse::ok(
        service.get_project_task_count(query.project_id).await?,
    ))
}

pub async fn kill_task(
    State(service): AppState,
    Json(req): Json<TaskRef>,
) -> Result<Json<ApiResponse<()>>> {
    service.kill_task(req.project_id, &req.task_id).await?;
    Ok(ApiResponse::empty())
}

/// 临时调度：绕过 cron 立即执行一次
pub async fn execute_task(
    State(service): AppState,
    Json(req): Json<TaskRef>,
) -> Result<Json<ApiResponse<()>>> {
    service
        .temporary_scheduler_task(req.project_id, &req.task_id)
        .await?;
    Ok(ApiResponse::empty())
}

// ----------------------------------------------------------------------
// 日志
// ----------------------------------------------------------------------

#[derive(Deserialize)]
pub struct LogListQuery {
    pub project_id: i64,
    pub task_id: String,
    #[serde(default)]
    pub page: i64,
    #[serde(default = "default_pagesize")]
    pub pagesize: i64,
}

pub async fn list_task_logs(
    State(service): AppState,
    Query(query): Query<LogListQuery>,
) -> Result<Json<ApiResponse<Vec<TaskLog>>>> {
    let page = query.page.max(1);
    Ok(ApiResponse::ok(
        service
            .get_task_log_list(query.project_id, &query.task_id, page, query.pagesize)
            .await?,
    ))
}

pub async fn task_log_total(
    State(service): AppState,
    Query(query): Query<TaskQuery>,
) -> Result<Json<ApiResponse<i64>>> {
    Ok(ApiResponse::ok(
        service
            .get_task_log_total(query.project_id, &query.task_id)
            .await?,
    ))
}

pub async fn clean_task_logs(
    State(service): AppState,
    Json(req): Json<TaskRef>,
) -> Result<Json<ApiResponse<()>>> {
    service.clean_log(req.project_id, &req.task_id).await?;
    Ok(ApiResponse::empty())
}

pub async fn clean_project_logs(
    State(service): AppState,
    Json(req): Json<ProjectQuery>,
) -> Result<Json<ApiResponse<()>>> {
    service.clean_project_log(req.project_id).await?;
    Ok(ApiResponse::empty())
}

/// 概览：某天某错误标记的日志总数
#[derive(Deserialize)]
pub struct LogTotalByDateQuery {
    /// 逗号分隔的项目 ID 列表
    pub projects: String,
    pub timestamp: i64,
    #[serde(default)]
    pub err_type: i64,
}

pub async fn log_total_by_date(
    State(service): AppState,
    Query(query): Query<LogTotalByDateQuery>,
) -> Result<Json<ApiResponse<i64>>> {
    let projects: Vec<i64> = query
        .projects
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    Ok(ApiResponse::ok(
        service
            .get_log_total_by_date(projects, query.timestamp, query.err_type)
            .await?,
    ))
}

// ----------------------------------------------------------------------
// 用户
// ----------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub account: String,
    pub name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub permission: String,
}

pub async fn create_user(
    State(service): AppState,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<ApiResponse<()>>> {
    service
        .create_user(User {
            id: 0,
            account: req.account,
            name: req.name,
            password: req.password,
            salt: String::new(),
            permission: req.permission,
            create_time: 0,
        })
        .await?;
    Ok(ApiResponse::empty())
}

#[derive(Deserialize)]
pub struct UserListQuery {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub project_id: i64,
    #[serde(default)]
    pub page: i64,
    #[serde(default = "default_pagesize")]
    pub pagesize: i64,
}

#[derive(serde::Serialize)]
pub struct UserListResponse {
    pub list: Vec<User>,
    pub total: i64,
}

pub async fn list_users(
    State(service): AppState,
    Query(query): Query<UserListQuery>,
) -> Result<Json<ApiResponse<UserListResponse>>> {
    let args = GetUserListArgs {
        id: query.id,
        account: query.account,
        name: query.name,
        project_id: query.project_id,
        page: query.page.max(1),
        pagesize: query.pagesize,
    };
    let list = service.get_user_list(args.clone()).await?;
    let total = service.get_user_list_total(args).await?;
    Ok(ApiResponse::ok(UserListResponse { list, total }))
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub uid: i64,
    pub password: String,
    #[serde(default)]
    pub salt: String,
}

pub async fn change_password(
    State(service): AppState,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<ApiResponse<()>>> {
    service
        .change_password(req.uid, &req.password, &req.salt)
        .await?;
    Ok(ApiResponse::empty())
}

// ----------------------------------------------------------------------
// agent 发现与上报
// ----------------------------------------------------------------------

pub async fn list_workers(
    State(service): AppState,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<ApiResponse<Vec<String>>>> {
    Ok(ApiResponse::ok(
        service.get_worker_list(query.project_id).await?,
    ))
}

pub async fn report_result(
    State(service): AppState,
    Json(result): Json<TaskExecuteResult>,
) -> Result<Json<ApiResponse<()>>> {
    service.handle_report_result(&result).await?;
    Ok(ApiResponse::empty())
}

pub async fn report_warning(
    State(service): AppState,
    Json(data): Json<WarningData>,
) -> Result<Json<ApiResponse<()>>> {
    service.handle_report_warning(data).await?;
    Ok(ApiResponse::empty())
}

pub async fn health() -> Json<ApiResponse<&'static str>> {
    ApiResponse::ok("ok")
}
