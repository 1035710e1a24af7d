//! 按自然键查找或创建关联实体
//!
//! 每个函数都在调用方给出的连接（通常是同步事务）上执行，返回实体的行 id。

use sqlx::SqliteConnection;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::storage::models::{Institute, InstituteNode};
use crate::utils::GzResult;

/// 只按名称去重、没有层级的词表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vocabulary {
    Keyword,
    Publisher,
    Language,
    ResourceType,
}

impl Vocabulary {
    pub fn table(&self) -> &'static str {
        match self {
            Vocabulary::Keyword => "keywords",
            Vocabulary::Publisher => "publishers",
            Vocabulary::Language => "languages",
            Vocabulary::ResourceType => "resource_types",
        }
    }
}

pub async fn get_or_create_named(conn: &mut SqliteConnection, vocabulary: Vocabulary, name: &str) -> GzResult<i64> {
    let table = vocabulary.table();

    let existing: Option<i64> = sqlx::query_scalar(&format!("SELECT id FROM {} WHERE name = ?", table))
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let result = sqlx::query(&format!("INSERT INTO {} (name) VALUES (?)", table))
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(result.last_insert_rowid())
}

/// 将 "Last, First" 拆成 (first, last)；没有逗号时名字为空
pub fn split_creator(raw: &str) -> (String, String) {
    match raw.split_once(',') {
        Some((last, first)) => (first.trim().to_string(), last.trim().to_string()),
        None => (String::new(), raw.trim().to_string()),
    }
}

pub async fn get_or_create_creator(conn: &mut SqliteConnection, first_name: &str, last_name: &str) -> GzResult<i64> {
    let existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM creators WHERE first_name = ? AND last_name = ?")
            .bind(first_name)
            .bind(last_name)
            .fetch_optional(&mut *conn)
            .await?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let result = sqlx::query("INSERT INTO creators (first_name, last_name) VALUES (?, ?)")
        .bind(first_name)
        .bind(last_name)
        .execute(&mut *conn)
        .await?;
    Ok(result.last_insert_rowid())
}

/// 将 "330 Economics" 拆成 (330, "Economics")
pub fn split_ddc(raw: &str) -> Option<(i64, String)> {
    let (number, name) = raw.trim().split_once(' ')?;
    let number = number.parse::<i64>().ok()?;
    Some((number, name.trim().to_string()))
}

/// 分类号以编号为键，已存在时保留最先写入的名称
pub async fn get_or_create_ddc(conn: &mut SqliteConnection, dewey_number: i64, name: &str) -> GzResult<i64> {
    let existing: Option<String> = sqlx::query_scalar("SELECT name FROM ddcs WHERE dewey_number = ?")
        .bind(dewey_number)
        .fetch_optional(&mut *conn)
        .await?;

    match existing {
        Some(stored) => {
            if stored != name {
                debug!("分类号 {} 已存在为 '{}'，忽略新名称 '{}'", dewey_number, stored, name);
            }
        }
        None => {
            sqlx::query("INSERT INTO ddcs (dewey_number, name) VALUES (?, ?)")
                .bind(dewey_number)
                .bind(name)
                .execute(&mut *conn)
                .await?;
        }
    }

    Ok(dewey_number)
}

/// 按 (name, parent) 查找或创建机构，返回 (id, 是否新建)
pub async fn get_or_create_institute(
    conn: &mut SqliteConnection,
    name: &str,
    parent_id: Option<i64>,
) -> GzResult<(i64, bool)> {
    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM institutes WHERE name = ? AND parent_id IS ?")
        .bind(name)
        .bind(parent_id)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(id) = existing {
        return Ok((id, false));
    }

    let result = sqlx::query("INSERT INTO institutes (name, parent_id) VALUES (?, ?)")
        .bind(name)
        .bind(parent_id)
        .execute(&mut *conn)
        .await?;
    Ok((result.last_insert_rowid(), true))
}

/// 论文只带机构名：取最早存入的同名机构，没有则建为根机构
pub async fn institute_for_paper(conn: &mut SqliteConnection, name: &str) -> GzResult<i64> {
    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM institutes WHERE name = ? ORDER BY id LIMIT 1")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;

    match existing {
        Some(id) => Ok(id),
        None => Ok(get_or_create_institute(conn, name, None).await?.0),
    }
}

/// 自上而下存储机构树，父节点总是先于子节点写入，返回新建节点数
pub async fn store_institute_tree(conn: &mut SqliteConnection, roots: &[InstituteNode]) -> GzResult<usize> {
    let mut stack: Vec<(&InstituteNode, Option<i64>)> = roots.iter().rev().map(|node| (node, None)).collect();
    let mut created = 0;

    while let Some((node, parent_id)) = stack.pop() {
        let (id, is_new) = get_or_create_institute(conn, &node.name, parent_id).await?;
        if is_new {
            created += 1;
        }
        for child in node.children.iter().rev() {
            stack.push((child, Some(id)));
        }
    }

    Ok(created)
}

/// 从直接父节点到根节点的祖先链
pub async fn institute_ancestors(conn: &mut SqliteConnection, id: i64) -> GzResult<Vec<Institute>> {
    let mut ancestors = Vec::new();
    let mut visited = HashSet::from([id]);
    let mut current = id;

    loop {
        let parent: Option<Institute> = sqlx::query_as(
            "SELECT p.id, p.name, p.parent_id FROM institutes c JOIN institutes p ON p.id = c.parent_id WHERE c.id = ?",
        )
        .bind(current)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(parent) = parent else { break };
        if !visited.insert(parent.id) {
            warn!("机构 {} 的祖先链中出现环，在 {} 处截断", id, parent.id);
            break;
        }
        current = parent.id;
        ancestors.push(parent);
    }

    Ok(ancestors)
}

pub async fn known_institute_names(conn: &mut SqliteConnection) -> GzResult<HashSet<String>> {
    let names: Vec<String> = sqlx::query_scalar("SELECT DISTINCT name FROM institutes")
        .fetch_all(&mut *conn)
        .await?;
    Ok(names.into_iter().collect())
}

pub async fn known_resource_types(conn: &mut SqliteConnection) -> GzResult<HashSet<String>> {
    let names: Vec<String> = sqlx::query_scalar("SELECT name FROM resource_types")
        .fetch_all(&mut *conn)
        .await?;
    Ok(names.into_iter().collect())
}
