//! 控制面服务门面
//!
//! 项目/用户/日志走关系存储，任务定义与一次性事件走协调器发布，
//! agent 发现走注册表前缀。所有查询条件用选择器表达。

use std::sync::Arc;

use chrono::Utc;

use crond_core::models::{Project, ProjectRelevance, TaskExecuteResult, TaskInfo, TaskLog, User};
use crond_core::{CrondError, CrondResult, KeyMaker, Warner, WarningData};
use crond_coordination::{registry, Coordinator, TaskPublisher};

use crate::selector::{Op, Selector};
use crate::store::{ProjectStore, RelevanceStore, SqlStore, TaskLogStore, UserStore};

/// 保留内部细节、替换面向调用方的消息
fn wrap_internal(err: CrondError, msg: &str) -> CrondError {
    match err {
        CrondError::Internal { log, .. } => CrondError::internal(msg, log),
        other => other,
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetUserListArgs {
    pub id: i64,
    pub account: String,
    pub name: String,
    pub project_id: i64,
    pub page: i64,
    pub pagesize: i64,
}

pub struct AppService {
    store: SqlStore,
    coordinator: Arc<dyn Coordinator>,
    keys: KeyMaker,
    publisher: Arc<TaskPublisher>,
    warner: Arc<dyn Warner>,
}

impl AppService {
    pub fn new(
        store: SqlStore,
        coordinator: Arc<dyn Coordinator>,
        keys: KeyMaker,
        publisher: Arc<TaskPublisher>,
        warner: Arc<dyn Warner>,
    ) -> Self {
        Self {
            store,
            coordinator,
            keys,
            publisher,
            warner,
        }
    }

    // ------------------------------------------------------------------
    // 项目
    // ------------------------------------------------------------------

    pub async fn get_project(&self, project_id: i64) -> CrondResult<Project> {
        let selector = Selector::new()
            .with("id", Op::Equals, project_id)
            .page(1, 1);
        let mut projects = self
            .store
            .project()
            .get_projects(&selector)
            .await
            .map_err(|e| wrap_internal(e, "无法获取项目信息"))?;
        projects.pop().ok_or(CrondError::ProjectNotExist)
    }

    pub async fn get_user_projects(&self, uid: i64) -> CrondResult<Vec<Project>> {
        let relevances = self
            .store
            .relevance()
            .get_list(&Selector::new().with("uid", Op::FindIn, uid))
            .await
            .map_err(|e| wrap_internal(e, "无法获取用户关联项目信息"))?;
        let pids: Vec<i64> = relevances.iter().map(|r| r.project_id).collect();
        self.store
            .project()
            .get_projects(&Selector::new().with("id", Op::In, pids))
            .await
            .map_err(|e| wrap_internal(e, "无法获取项目信息"))
    }

    pub async fn check_user_is_in_project(&self, project_id: i64, uid: i64) -> CrondResult<bool> {
        let selector = Selector::new()
            .with("project_id", Op::Equals, project_id)
            .with("uid", Op::FindIn, uid);
        let relevances = self
            .store
            .relevance()
            .get_list(&selector)
            .await
            .map_err(|e| wrap_internal(e, "获取项目归属信息失败"))?;
        Ok(!relevances.is_empty())
    }

    pub async fn check_user_project(
        &self,
        project_id: i64,
        uid: i64,
    ) -> CrondResult<Option<Project>> {
        let selector = Selector::new()
            .with("id", Op::Equals, project_id)
            .with("uid", Op::Equals, uid);
        let mut projects = self
            .store
            .project()
            .get_projects(&selector)
            .await
            .map_err(|e| wrap_internal(e, "获取项目信息失败"))?;
        Ok(projects.pop())
    }

    pub async fn check_project_exist_by_name(&self, title: &str) -> CrondResult<Option<Project>> {
        let mut projects = self
            .store
            .project()
            .get_projects(&Selector::new().with("title", Op::Equals, title))
            .await
            .map_err(|e| wrap_internal(e, "获取项目信息失败"))?;
        Ok(projects.pop())
    }

    /// 创建项目并把拥有者写入关联表，两步在一个事务里
    pub async fn create_project(&self, project: Project) -> CrondResult<i64> {
        if self.check_project_exist_by_name(&project.title).await?.is_some() {
            return Err(CrondError::internal("项目名已存在", &project.title));
        }
        let uid = project.uid;
        let mut tx = self.store.begin_tx().await?;
        let project_id = self
            .store
            .project()
            .create(Some(&mut tx), &project)
            .await
            .map_err(|e| wrap_internal(e, "创建项目失败"))?;
        self.store
            .relevance()
            .create(
                Some(&mut tx),
                &ProjectRelevance {
                    project_id,
                    uid,
                    create_time: Utc::now().timestamp(),
                },
            )
            .await
            .map_err(|e| wrap_internal(e, "创建项目关联关系失败"))?;
        tx.commit()
            .await
            .map_err(|e| CrondError::internal("提交事务失败", e))?;
        Ok(project_id)
    }

    /// 只有项目拥有者可以更新
    pub async fn update_project(
        &self,
        project_id: i64,
        uid: i64,
        title: &str,
        remark: &str,
    ) -> CrondResult<()> {
        if self.check_user_project(project_id, uid).await?.is_none() {
            return Err(CrondError::ProjectNotExist);
        }
        self.store
            .project()
            .update(project_id, title, remark)
            .await
            .map_err(|e| wrap_internal(e, "更新项目失败"))
    }

    /// 删除项目并级联清理其任务日志
    pub async fn delete_project(&self, project_id: i64, uid: i64) -> CrondResult<()> {
        let mut tx = self.store.begin_tx().await?;
        let selector = Selector::new()
            .with("id", Op::Equals, project_id)
            .with("uid", Op::Equals, uid);
        self.store
            .project()
            .delete(Some(&mut tx), &selector)
            .await
            .map_err(|e| wrap_internal(e, "删除项目失败"))?;
        self.store
            .task_log()
            .clean(
                Some(&mut tx),
                &Selector::new().with("project_id", Op::Equals, project_id),
            )
            .await
            .map_err(|e| wrap_internal(e, "清除项目日志失败"))?;
        tx.commit()
            .await
            .map_err(|e| CrondError::internal("提交事务失败", e))
    }

    pub async fn create_project_relevance(&self, project_id: i64, uid: i64) -> CrondResult<()> {
        self.get_project(project_id).await?;
        if self.get_user_info(uid).await?.is_none() {
            return Err(CrondError::RecordNotFound);
        }
        if self.check_user_is_in_project(project_id, uid).await? {
            return Err(CrondError::internal("用户已在项目中", format!("{project_id}/{uid}")));
        }
        self.store
            .relevance()
            .create(
                None,
                &ProjectRelevance {
                    project_id,
                    uid,
                    create_time: Utc::now().timestamp(),
                },
            )
            .await
            .map_err(|e| wrap_internal(e, "创建项目关联关系失败"))
    }

    pub async fn delete_project_relevance(&self, project_id: i64, uid: i64) -> CrondResult<()> {
        self.store
            .relevance()
            .delete(None, project_id, uid)
            .await
            .map_err(|e| wrap_internal(e, "删除项目关联关系失败"))
    }

    pub async fn get_project_relevance_users(
        &self,
        project_id: i64,
    ) -> CrondResult<Vec<ProjectRelevance>> {
        self.store
            .relevance()
            .get_list(&Selector::new().with("project_id", Op::Equals, project_id))
            .await
            .map_err(|e| wrap_internal(e, "获取用户项目关联列表失败"))
    }

    // ------------------------------------------------------------------
    // 用户
    // ------------------------------------------------------------------

    pub async fn get_user_by_account(&self, account: &str) -> CrondResult<Option<User>> {
        let selector = Selector::new()
            .with("account", Op::Equals, account)
            .page(1, 1);
        let mut users = self
            .store
            .user()
            .get_users(&selector)
            .await
            .map_err(|e| wrap_internal(e, "获取用户信息失败"))?;
        Ok(users.pop())
    }

    pub async fn get_user_info(&self, uid: i64) -> CrondResult<Option<User>> {
        let mut users = self
            .store
            .user()
            .get_users(&Selector::new().with("id", Op::Equals, uid))
            .await
            .map_err(|e| wrap_internal(e, "获取用户信息失败"))?;
        Ok(users.pop())
    }

    pub async fn get_users_by_ids(&self, uids: Vec<i64>) -> CrondResult<Vec<User>> {
        self.store
            .user()
            .get_users(&Selector::new().with("id", Op::In, uids))
            .await
            .map_err(|e| wrap_internal(e, "获取用户列表失败"))
    }

    pub async fn create_user(&self, mut user: User) -> CrondResult<()> {
        if self.get_user_by_account(&user.account).await?.is_some() {
            return Err(CrondError::internal("账号已存在", &user.account));
        }
        if user.create_time == 0 {
            user.create_time = Utc::now().timestamp();
        }
        self.store
            .user()
            .create(&user)
            .await
            .map_err(|e| wrap_internal(e, "创建用户失败"))
    }

    async fn parse_user_search_args(&self, args: &GetUserListArgs) -> CrondResult<Selector> {
        let mut selector = Selector::new();
        if args.project_id != 0 {
            let relevances = self.get_project_relevance_users(args.project_id).await?;
            let ids: Vec<i64> = relevances.iter().map(|r| r.uid).collect();
            selector = selector.with("id", Op::In, ids);
        } else if args.id != 0 {
            selector = selector.with("id", Op::Equals, args.id);
        }
        if !args.account.is_empty() {
            selector = selector.with("account", Op::Equals, args.account.as_str());
        }
        if !args.name.is_empty() {
            selector = selector.with("name", Op::Like, args.name.as_str());
        }
        Ok(selector.page(args.page, args.pagesize))
    }

    pub async fn get_user_list(&self, args: GetUserListArgs) -> CrondResult<Vec<User>> {
        let selector = self.parse_user_search_args(&args).await?;
        self.store
            .user()
            .get_users(&selector)
            .await
            .map_err(|e| wrap_internal(e, "获取用户列表失败"))
    }

    pub async fn get_user_list_total(&self, args: GetUserListArgs) -> CrondResult<i64> {
        let selector = self.parse_user_search_args(&args).await?;
        self.store
            .user()
            .get_total(&selector)
            .await
            .map_err(|e| wrap_internal(e, "获取用户数量失败"))
    }

    pub async fn change_password(&self, uid: i64, password: &str, salt: &str) -> CrondResult<()> {
        self.store
            .user()
            .change_password(uid, password, salt)
            .await
            .map_err(|e| wrap_internal(e, "更新密码失败"))
    }

    // ------------------------------------------------------------------
    // 任务（经协调器发布）
    // ------------------------------------------------------------------

    pub async fn save_task(&self, task: TaskInfo) -> CrondResult<Option<TaskInfo>> {
        // 项目必须存在才允许挂任务
        self.get_project(task.project_id).await?;
        self.publisher.save_task(task).await
    }

    pub async fn delete_task(
        &self,
        project_id: i64,
        task_id: &str,
    ) -> CrondResult<Option<TaskInfo>> {
        self.publisher.delete_task(project_id, task_id).await
    }

    pub async fn get_task_list(&self, project_id: i64) -> CrondResult<Vec<TaskInfo>> {
        self.publisher.get_task_list(project_id).await
    }

    pub async fn get_task(&self, project_id: i64, task_id: &str) -> CrondResult<TaskInfo> {
        self.publisher
            .get_task(project_id, task_id)
            .await?
            .ok_or(CrondError::RecordNotFound)
    }

    pub async fn kill_task(&self, project_id: i64, task_id: &str) -> CrondResult<()> {
        self.publisher.kill_task(project_id, task_id).await
    }

    /// 临时调度一次已注册任务
    pub async fn temporary_scheduler_task(
        &self,
        project_id: i64,
        task_id: &str,
    ) -> CrondResult<()> {
        let task = self.get_task(project_id, task_id).await?;
        self.publisher.temporary_scheduler_task(&task).await
    }

    pub async fn get_worker_list(&self, project_id: i64) -> CrondResult<Vec<String>> {
        registry::get_worker_list(&self.coordinator, &self.keys, project_id).await
    }

    pub async fn get_project_task_count(&self, project_id: i64) -> CrondResult<usize> {
        Ok(self.get_task_list(project_id).await?.len())
    }

    // ------------------------------------------------------------------
    // 日志
    // ------------------------------------------------------------------

    pub async fn get_task_log_list(
        &self,
        project_id: i64,
        task_id: &str,
        page: i64,
        pagesize: i64,
    ) -> CrondResult<Vec<TaskLog>> {
        let selector = Selector::new()
            .with("project_id", Op::Equals, project_id)
            .with("task_id", Op::Equals, task_id)
            .order_by("id DESC")
            .page(page, pagesize);
        self.store
            .task_log()
            .get_list(&selector)
            .await
            .map_err(|e| wrap_internal(e, "获取日志列表失败"))
    }

    pub async fn get_task_log_total(&self, project_id: i64, task_id: &str) -> CrondResult<i64> {
        let selector = Selector::new()
            .with("project_id", Op::Equals, project_id)
            .with("task_id", Op::Equals, task_id);
        self.store
            .task_log()
            .get_total(&selector)
            .await
            .map_err(|e| wrap_internal(e, "获取日志条数失败"))
    }

    /// 某天（时间戳起 24 小时内）某错误标记的日志总数
    pub async fn get_log_total_by_date(
        &self,
        projects: Vec<i64>,
        timestamp: i64,
        err_type: i64,
    ) -> CrondResult<i64> {
        let selector = Selector::new()
            .with("project_id", Op::In, projects)
            .with("start_time", Op::GreaterThan, timestamp)
            .with("start_time", Op::LessThan, timestamp + 86400)
            .with("with_error", Op::Equals, err_type);
        self.store
            .task_log()
            .get_total(&selector)
            .await
            .map_err(|e| wrap_internal(e, "获取日志条数失败"))
    }

    pub async fn clean_project_log(&self, project_id: i64) -> CrondResult<()> {
        self.store
            .task_log()
            .clean(
                None,
                &Selector::new().with("project_id", Op::Equals, project_id),
            )
            .await
            .map_err(|e| wrap_internal(e, "清除项目日志失败"))
    }

    pub async fn clean_log(&self, project_id: i64, task_id: &str) -> CrondResult<()> {
        let selector = Selector::new()
            .with("project_id", Op::Equals, project_id)
            .with("task_id", Op::Equals, task_id);
        self.store
            .task_log()
            .clean(None, &selector)
            .await
            .map_err(|e| wrap_internal(e, "清除日志失败"))
    }

    // ------------------------------------------------------------------
    // agent 上报入口
    // ------------------------------------------------------------------

    pub async fn handle_report_result(&self, result: &TaskExecuteResult) -> CrondResult<()> {
        self.store
            .task_log()
            .create(None, &TaskLog::from(result))
            .await
            .map_err(|e| wrap_internal(e, "写入任务日志失败"))
    }

    pub async fn handle_report_warning(&self, data: WarningData) -> CrondResult<()> {
        self.warner.warning(data).await
    }
}
