use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Paper {
    pub uid: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub publisher_id: Option<i64>,
    pub date: Option<NaiveDate>,
    pub language_id: Option<i64>,
    pub relation: Option<String>,
    /// `None` 表示尚未分类
    pub sustainable: Option<bool>,
    pub annotated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Creator {
    pub id: i64,
    /// 没有名字的作者存为空字符串
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Institute {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
}

/// 论文及其全部关联实体的名称，用于展示和比较
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaperDetail {
    pub paper: Paper,
    pub creators: Vec<String>,
    pub institutes: Vec<String>,
    pub ddcs: Vec<String>,
    pub keywords: Vec<String>,
    pub resource_types: Vec<String>,
    pub publisher: Option<String>,
    pub language: Option<String>,
}

/// 机构层级树的一个节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstituteNode {
    pub name: String,
    pub children: Vec<InstituteNode>,
}

impl InstituteNode {
    pub fn leaf(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn with_children(name: impl Into<String>, children: Vec<InstituteNode>) -> Self {
        Self {
            name: name.into(),
            children,
        }
    }
}
