//! 选择器查询门面
//!
//! 存储层的所有查询条件都由 (字段, 操作符, 值) 组成的选择器表达，
//! 编译为带绑定参数的 SQL。字段名只来自代码内常量，值一律走绑定。

use sqlx::{MySql, QueryBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Equals,
    In,
    FindIn,
    Like,
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Str(String),
    IntList(Vec<i64>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Value::IntList(v)
    }
}

#[derive(Debug, Clone)]
pub struct Requirement {
    pub field: &'static str,
    pub op: Op,
    pub value: Value,
}

#[derive(Debug, Clone, Default)]
pub struct Selector {
    pub requirements: Vec<Requirement>,
    pub page: i64,
    pub pagesize: i64,
    pub order_by: Option<&'static str>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &'static str, op: Op, value: impl Into<Value>) -> Self {
        self.requirements.push(Requirement {
            field,
            op,
            value: value.into(),
        });
        self
    }

    pub fn page(mut self, page: i64, pagesize: i64) -> Self {
        self.page = page;
        self.pagesize = pagesize;
        self
    }

    pub fn order_by(mut self, order: &'static str) -> Self {
        self.order_by = Some(order);
        self
    }

    /// 追加 WHERE 子句；空列表的 IN 条件恒为假
    pub fn push_where(&self, qb: &mut QueryBuilder<'_, MySql>) {
        if self.requirements.is_empty() {
            return;
        }
        qb.push(" WHERE ");
        for (i, req) in self.requirements.iter().enumerate() {
            if i > 0 {
                qb.push(" AND ");
            }
            match (&req.op, &req.value) {
                (Op::Equals, Value::Int(v)) => {
                    qb.push(req.field).push(" = ").push_bind(*v);
                }
                (Op::Equals, Value::Str(v)) => {
                    qb.push(req.field).push(" = ").push_bind(v.clone());
                }
                (Op::In, Value::IntList(vs)) if vs.is_empty() => {
                    qb.push("1 = 0");
                }
                (Op::In, Value::IntList(vs)) => {
                    qb.push(req.field).push(" IN (");
                    let mut sep = qb.separated(", ");
                    for v in vs {
                        sep.push_bind(*v);
                    }
                    qb.push(")");
                }
                (Op::FindIn, Value::Int(v)) => {
                    qb.push("FIND_IN_SET(")
                        .push_bind(v.to_string())
                        .push(", ")
                        .push(req.field)
                        .push(")");
                }
                (Op::Like, Value::Str(v)) => {
                    qb.push(req.field)
                        .push(" LIKE ")
                        .push_bind(format!("%{v}%"));
                }
                (Op::GreaterThan, Value::Int(v)) => {
                    qb.push(req.field).push(" > ").push_bind(*v);
                }
                (Op::LessThan, Value::Int(v)) => {
                    qb.push(req.field).push(" < ").push_bind(*v);
                }
                // 操作符与值类型不匹配属于编码错误，条件恒为假以免误查
                _ => {
                    qb.push("1 = 0");
                }
            }
        }
    }

    /// 追加 ORDER BY / LIMIT / OFFSET
    pub fn push_suffix(&self, qb: &mut QueryBuilder<'_, MySql>) {
        if let Some(order) = self.order_by {
            qb.push(" ORDER BY ").push(order);
        }
        if self.pagesize > 0 {
            qb.push(" LIMIT ").push_bind(self.pagesize);
            if self.page > 1 {
                qb.push(" OFFSET ").push_bind((self.page - 1) * self.pagesize);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equals_and_less_than() {
        let selector = Selector::new()
            .with("project_id", Op::Equals, 1i64)
            .with("start_time", Op::LessThan, 1000i64);
        let mut qb = QueryBuilder::<MySql>::new("SELECT * FROM task_log");
        selector.push_where(&mut qb);
        assert_eq!(
            qb.sql(),
            "SELECT * FROM task_log WHERE project_id = ? AND start_time < ?"
        );
    }

    #[test]
    fn test_in_list() {
        let selector = Selector::new().with("id", Op::In, vec![1i64, 2, 3]);
        let mut qb = QueryBuilder::<MySql>::new("SELECT * FROM project");
        selector.push_where(&mut qb);
        assert_eq!(qb.sql(), "SELECT * FROM project WHERE id IN (?, ?, ?)");
    }

    #[test]
    fn test_empty_in_never_matches() {
        let selector = Selector::new().with("id", Op::In, Vec::<i64>::new());
        let mut qb = QueryBuilder::<MySql>::new("SELECT * FROM project");
        selector.push_where(&mut qb);
        assert_eq!(qb.sql(), "SELECT * FROM project WHERE 1 = 0");
    }

    #[test]
    fn test_find_in_set_and_like() {
        let selector = Selector::new()
            .with("uid", Op::FindIn, 42i64)
            .with("name", Op::Like, "张");
        let mut qb = QueryBuilder::<MySql>::new("SELECT * FROM `user`");
        selector.push_where(&mut qb);
        assert_eq!(
            qb.sql(),
            "SELECT * FROM `user` WHERE FIND_IN_SET(?, uid) AND name LIKE ?"
        );
    }

    #[test]
    fn test_pagination_and_order() {
        let selector = Selector::new()
            .with("project_id", Op::Equals, 1i64)
            .order_by("id DESC")
            .page(3, 20);
        let mut qb = QueryBuilder::<MySql>::new("SELECT * FROM task_log");
        selector.push_where(&mut qb);
        selector.push_suffix(&mut qb);
        assert_eq!(
            qb.sql(),
            "SELECT * FROM task_log WHERE project_id = ? ORDER BY id DESC LIMIT ? OFFSET ?"
        );
    }

    #[test]
    fn test_mismatched_value_never_matches() {
        let selector = Selector::new().with("id", Op::In, 7i64);
        let mut qb = QueryBuilder::<MySql>::new("SELECT * FROM project");
        selector.push_where(&mut qb);
        assert_eq!(qb.sql(), "SELECT * FROM project WHERE 1 = 0");
    }

    #[test]
    fn test_no_requirements_no_where() {
        let selector = Selector::new();
        let mut qb = QueryBuilder::<MySql>::new("SELECT * FROM project");
        selector.push_where(&mut qb);
        assert_eq!(qb.sql(), "SELECT * FROM project");
    }
}
