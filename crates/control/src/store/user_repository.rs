use async_trait::async_trait;
use sqlx::{MySql, MySqlPool, QueryBuilder, Row};

use crond_core::models::User;
use crond_core::CrondResult;

use crate::selector::Selector;
use crate::store::{db_err, UserStore};

pub struct MySqlUserStore {
    pool: MySqlPool,
}

impl MySqlUserStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

fn row_to_user(row: &sqlx::mysql::MySqlRow) -> CrondResult<User> {
    Ok(User {
        id: row.try_get("id").map_err(db_err)?,
        account: row.try_get("account").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        password: row.try_get("password").map_err(db_err)?,
        salt: row.try_get("salt").map_err(db_err)?,
        permission: row.try_get("permission").map_err(db_err)?,
        create_time: row.try_get("create_time").map_err(db_err)?,
    })
}

#[async_trait]
impl UserStore for MySqlUserStore {
    async fn create(&self, user: &User) -> CrondResult<()> {
        sqlx::query(
            "INSERT INTO `user` (account, name, password, salt, permission, create_time) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&user.account)
        .bind(&user.name)
        .bind(&user.password)
        .bind(&user.salt)
        .bind(&user.permission)
        .bind(user.create_time)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_users(&self, selector: &Selector) -> CrondResult<Vec<User>> {
        let mut qb = QueryBuilder::<MySql>::new(
            "SELECT id, account, name, password, salt, permission, create_time FROM `user`",
        );
        selector.push_where(&mut qb);
        selector.push_suffix(&mut qb);
        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_user).collect()
    }

    async fn get_total(&self, selector: &Selector) -> CrondResult<i64> {
        let mut qb = QueryBuilder::<MySql>::new("SELECT COUNT(*) AS total FROM `user`");
        selector.push_where(&mut qb);
        let row = qb.build().fetch_one(&self.pool).await.map_err(db_err)?;
        row.try_get("total").map_err(db_err)
    }

    async fn change_password(&self, uid: i64, password: &str, salt: &str) -> CrondResult<()> {
        sqlx::query("UPDATE `user` SET password = ?, salt = ? WHERE id = ?")
            .bind(password)
            .bind(salt)
            .bind(uid)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
