use async_trait::async_trait;
use sqlx::{MySql, MySqlPool, QueryBuilder, Row};

use crond_core::models::{Project, ProjectRelevance};
use crond_core::CrondResult;

use crate::selector::Selector;
use crate::store::{db_err, ProjectStore, RelevanceStore, Tx};

pub struct MySqlProjectStore {
    pool: MySqlPool,
}

impl MySqlProjectStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

fn row_to_project(row: &sqlx::mysql::MySqlRow) -> CrondResult<Project> {
    Ok(Project {
        id: row.try_get("id").map_err(db_err)?,
        title: row.try_get("title").map_err(db_err)?,
        remark: row.try_get("remark").map_err(db_err)?,
        uid: row.try_get("uid").map_err(db_err)?,
    })
}

#[async_trait]
impl ProjectStore for MySqlProjectStore {
    async fn create(&self, tx: Option<&mut Tx>, project: &Project) -> CrondResult<i64> {
        let query = sqlx::query("INSERT INTO project (title, remark, uid) VALUES (?, ?, ?)")
            .bind(&project.title)
            .bind(&project.remark)
            .bind(project.uid);
        let result = match tx {
            Some(tx) => query.execute(&mut **tx).await,
            None => query.execute(&self.pool).await,
        }
        .map_err(db_err)?;
        Ok(result.last_insert_id() as i64)
    }

    async fn get_projects(&self, selector: &Selector) -> CrondResult<Vec<Project>> {
        let mut qb = QueryBuilder::<MySql>::new("SELECT id, title, remark, uid FROM project");
        selector.push_where(&mut qb);
        selector.push_suffix(&mut qb);
        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_project).collect()
    }

    async fn update(&self, project_id: i64, title: &str, remark: &str) -> CrondResult<()> {
        sqlx::query("UPDATE project SET title = ?, remark = ? WHERE id = ?")
            .bind(title)
            .bind(remark)
            .bind(project_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, tx: Option<&mut Tx>, selector: &Selector) -> CrondResult<()> {
        let mut qb = QueryBuilder::<MySql>::new("DELETE FROM project");
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

pub struct MySqlRelevanceStore {
    pool: MySqlPool,
}

impl MySqlRelevanceStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RelevanceStore for MySqlRelevanceStore {
    async fn create(&self, tx: Option<&mut Tx>, relevance: &ProjectRelevance) -> CrondResult<()> {
        let query = sqlx::query(
            "INSERT INTO project_relevance (project_id, uid, create_time) VALUES (?, ?, ?)",
        )
        .bind(relevance.project_id)
        .bind(relevance.uid)
        .bind(relevance.create_time);
        match tx {
            Some(tx) => query.execute(&mut **tx).await,
            None => query.execute(&self.pool).await,
        }
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, tx: Option<&mut Tx>, project_id: i64, uid: i64) -> CrondResult<()> {
        let query = sqlx::query("DELETE FROM project_relevance WHERE project_id = ? AND uid = ?")
            .bind(project_id)
            .bind(uid);
        match tx {
            Some(tx) => query.execute(&mut **tx).await,
            None => query.execute(&self.pool).await,
        }
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_list(&self, selector: &Selector) -> CrondResult<Vec<ProjectRelevance>> {
        let mut qb =
            QueryBuilder::<MySql>::new("SELECT project_id, uid, create_time FROM project_relevance");
        selector.push_where(&mut qb);
        selector.push_suffix(&mut qb);
        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter()
            .map(|row| {
                Ok(ProjectRelevance {
                    project_id: row.try_get("project_id").map_err(db_err)?,
                    uid: row.try_get("uid").map_err(db_err)?,
                    create_time: row.try_get("create_time").map_err(db_err)?,
                })
            })
            .collect()
    }
}
