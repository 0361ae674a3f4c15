use async_trait::async_trait;
use sqlx::{MySql, MySqlPool, QueryBuilder, Row};

use crond_core::models::TaskLog;
use crond_core::CrondResult;

use crate::selector::Selector;
use crate::store::{db_err, TaskLogStore, Tx};

pub struct MySqlTaskLogStore {
    pool: MySqlPool,
}

impl MySqlTaskLogStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

const COLUMNS: &str =
    "id, project_id, task_id, name, result, start_time, end_time, command, with_error, client_ip";

fn row_to_log(row: &sqlx::mysql::MySqlRow) -> CrondResult<TaskLog> {
    Ok(TaskLog {
        id: row.try_get("id").map_err(db_err)?,
        project_id: row.try_get("project_id").map_err(db_err)?,
        task_id: row.try_get("task_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        result: row.try_get("result").map_err(db_err)?,
        start_time: row.try_get("start_time").map_err(db_err)?,
        end_time: row.try_get("end_time").map_err(db_err)?,
        command: row.try_get("command").map_err(db_err)?,
        with_error: row.try_get("with_error").map_err(db_err)?,
        client_ip: row.try_get("client_ip").map_err(db_err)?,
    })
}

#[async_trait]
impl TaskLogStore for MySqlTaskLogStore {
    async fn create(&self, tx: Option<&mut Tx>, log: &TaskLog) -> CrondResult<()> {
        let query = sqlx::query(
            "INSERT INTO task_log \
             (project_id, task_id, name, result, start_time, end_time, command, with_error, client_ip) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(log.project_id)
        .bind(&log.task_id)
        .bind(&log.name)
        .bind(&log.result)
        .bind(log.start_time)
        .bind(log.end_time)
        .bind(&log.command)
        .bind(log.with_error)
        .bind(&log.client_ip);
        match tx {
            Some(tx) => query.execute(&mut **tx).await,
            None => query.execute(&self.pool).await,
        }
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_list(&self, selector: &Selector) -> CrondResult<Vec<TaskLog>> {
        let mut qb = QueryBuilder::<MySql>::new(format!("SELECT {COLUMNS} FROM task_log"));
        selector.push_where(&mut qb);
        selector.push_suffix(&mut qb);
        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_log).collect()
    }

    async fn get_total(&self, selector: &Selector) -> CrondResult<i64> {
        let mut qb = QueryBuilder::<MySql>::new("SELECT COUNT(*) AS total FROM task_log");
        selector.push_where(&mut qb);
        let row = qb.build().fetch_one(&self.pool).await.map_err(db_err)?;
        row.try_get("total").map_err(db_err)
    }

    async fn clean(&self, tx: Option<&mut Tx>, selector: &Selector) -> CrondResult<()> {
        let mut qb = QueryBuilder::<MySql>::new("DELETE FROM task_log");
        selector.push_where(&mut qb);
        let query = qb.build();
        match tx {
            Some(tx) => query.execute(&mut **tx).await,
            None => query.execute(&self.pool).await,
        }
        .map_err(db_err)?;
        Ok(())
    }
}
