use sqlx::SqliteConnection;
use tracing::debug;

use crate::classifier::document_text;
use crate::parser::{Label, PaperMetadata};
use crate::storage::entities::{self, Vocabulary};
use crate::storage::models::{Paper, PaperDetail};
use crate::utils::GzResult;

const PAPER_COLUMNS: &str =
    "uid, title, description, publisher_id, date, language_id, relation, sustainable, annotated";

/// 一篇论文引用的全部实体 id
struct ResolvedRefs {
    creators: Vec<i64>,
    institutes: Vec<i64>,
    ddcs: Vec<i64>,
    keywords: Vec<i64>,
    resource_types: Vec<i64>,
    publisher: Option<i64>,
    language: Option<i64>,
}

async fn resolve_refs(conn: &mut SqliteConnection, meta: &PaperMetadata) -> GzResult<ResolvedRefs> {
    let mut creators = Vec::with_capacity(meta.creators.len());
    for raw in &meta.creators {
        let (first, last) = entities::split_creator(raw);
        creators.push(entities::get_or_create_creator(conn, &first, &last).await?);
    }

    let mut institutes = Vec::with_capacity(meta.institutes.len());
    for name in &meta.institutes {
        institutes.push(entities::institute_for_paper(conn, name).await?);
    }

    let mut ddcs = Vec::with_capacity(meta.ddcs.len());
    for raw in &meta.ddcs {
        match entities::split_ddc(raw) {
            Some((number, name)) => ddcs.push(entities::get_or_create_ddc(conn, number, &name).await?),
            None => debug!("论文 {} 的分类号格式不正确，跳过: {}", meta.uid, raw),
        }
    }

    let mut keywords = Vec::with_capacity(meta.keywords.len());
    for name in &meta.keywords {
        keywords.push(entities::get_or_create_named(conn, Vocabulary::Keyword, name).await?);
    }

    let mut resource_types = Vec::with_capacity(meta.resource_types.len());
    for name in &meta.resource_types {
        resource_types.push(entities::get_or_create_named(conn, Vocabulary::ResourceType, name).await?);
    }

    let publisher = match &meta.publisher {
        Some(name) => Some(entities::get_or_create_named(conn, Vocabulary::Publisher, name).await?),
        None => None,
    };
    let language = match &meta.language {
        Some(name) => Some(entities::get_or_create_named(conn, Vocabulary::Language, name).await?),
        None => None,
    };

    Ok(ResolvedRefs {
        creators,
        institutes,
        ddcs,
        keywords,
        resource_types,
        publisher,
        language,
    })
}

async fn replace_links(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    uid: &str,
    ids: &[i64],
) -> GzResult<()> {
    sqlx::query(&format!("DELETE FROM {} WHERE paper_uid = ?", table))
        .bind(uid)
        .execute(&mut *conn)
        .await?;

    // 同一实体在一条记录里出现多次时只保留一条关联
    let insert = format!("INSERT OR IGNORE INTO {} (paper_uid, {}) VALUES (?, ?)", table, column);
    for id in ids {
        sqlx::query(&insert).bind(uid).bind(id).execute(&mut *conn).await?;
    }
    Ok(())
}

/// 创建或更新论文
///
/// 关联集合整体替换，标量字段覆盖。只有元数据携带 `label` 时才写入
/// `sustainable`/`annotated`，否则保留已有的分类和标注状态。
pub async fn upsert_paper(conn: &mut SqliteConnection, meta: &PaperMetadata) -> GzResult<Paper> {
    let refs = resolve_refs(conn, meta).await?;
    let label = meta.label.unwrap_or(Label::new(None, false));

    sqlx::query(
        r#"
        INSERT INTO papers (uid, title, description, publisher_id, date, language_id, relation, sustainable, annotated)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(uid) DO UPDATE SET
            title = excluded.title,
            description = excluded.description,
            publisher_id = excluded.publisher_id,
            date = excluded.date,
            language_id = excluded.language_id,
            relation = excluded.relation,
            sustainable = CASE WHEN ? THEN excluded.sustainable ELSE papers.sustainable END,
            annotated = CASE WHEN ? THEN excluded.annotated ELSE papers.annotated END,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(&meta.uid)
    .bind(&meta.title)
    .bind(&meta.description)
    .bind(refs.publisher)
    .bind(meta.date)
    .bind(refs.language)
    .bind(&meta.relation)
    .bind(label.sustainable)
    .bind(label.annotated)
    .bind(meta.label.is_some())
    .bind(meta.label.is_some())
    .execute(&mut *conn)
    .await?;

    replace_creators(conn, &meta.uid, &refs.creators).await?;
    replace_links(conn, "paper_institutes", "institute_id", &meta.uid, &refs.institutes).await?;
    replace_links(conn, "paper_ddcs", "dewey_number", &meta.uid, &refs.ddcs).await?;
    replace_links(conn, "paper_keywords", "keyword_id", &meta.uid, &refs.keywords).await?;
    replace_links(conn, "paper_resource_types", "resource_type_id", &meta.uid, &refs.resource_types).await?;

    let paper = sqlx::query_as(&format!("SELECT {} FROM papers WHERE uid = ?", PAPER_COLUMNS))
        .bind(&meta.uid)
        .fetch_one(&mut *conn)
        .await?;
    Ok(paper)
}

/// 作者保留原始顺序
async fn replace_creators(conn: &mut SqliteConnection, uid: &str, ids: &[i64]) -> GzResult<()> {
    sqlx::query("DELETE FROM paper_creators WHERE paper_uid = ?")
        .bind(uid)
        .execute(&mut *conn)
        .await?;

    for (position, id) in ids.iter().enumerate() {
        sqlx::query("INSERT OR IGNORE INTO paper_creators (paper_uid, creator_id, position) VALUES (?, ?, ?)")
            .bind(uid)
            .bind(id)
            .bind(position as i64)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// 删除论文及其关联行，共享实体保留；论文不存在时什么也不做
pub async fn delete_paper(conn: &mut SqliteConnection, uid: &str) -> GzResult<bool> {
    for table in [
        "paper_creators",
        "paper_institutes",
        "paper_ddcs",
        "paper_keywords",
        "paper_resource_types",
    ] {
        sqlx::query(&format!("DELETE FROM {} WHERE paper_uid = ?", table))
            .bind(uid)
            .execute(&mut *conn)
            .await?;
    }

    let result = sqlx::query("DELETE FROM papers WHERE uid = ?")
        .bind(uid)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_paper(conn: &mut SqliteConnection, uid: &str) -> GzResult<Option<Paper>> {
    let paper = sqlx::query_as(&format!("SELECT {} FROM papers WHERE uid = ?", PAPER_COLUMNS))
        .bind(uid)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(paper)
}

/// 覆盖标签（人工标注、旧标注导入）
pub async fn set_label(conn: &mut SqliteConnection, uid: &str, label: Label) -> GzResult<bool> {
    let result = sqlx::query(
        "UPDATE papers SET sustainable = ?, annotated = ?, updated_at = CURRENT_TIMESTAMP WHERE uid = ?",
    )
    .bind(label.sustainable)
    .bind(label.annotated)
    .bind(uid)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// 写入机器预测结果，已人工标注的论文不受影响
pub async fn set_prediction(conn: &mut SqliteConnection, uid: &str, sustainable: Option<bool>) -> GzResult<bool> {
    let result = sqlx::query("UPDATE papers SET sustainable = ? WHERE uid = ? AND annotated = 0")
        .bind(sustainable)
        .bind(uid)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// 训练语料：全部已标注论文
pub async fn annotated_corpus(conn: &mut SqliteConnection) -> GzResult<Vec<(String, bool)>> {
    let rows: Vec<(Option<String>, Option<String>, bool)> = sqlx::query_as(
        "SELECT title, description, sustainable FROM papers WHERE annotated = 1 AND sustainable IS NOT NULL ORDER BY uid",
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(title, description, sustainable)| {
            (document_text(title.as_deref(), description.as_deref()), sustainable)
        })
        .collect())
}

/// 全部未标注论文的 (uid, 文本)
pub async fn unannotated_documents(conn: &mut SqliteConnection) -> GzResult<Vec<(String, String)>> {
    let rows: Vec<(String, Option<String>, Option<String>)> =
        sqlx::query_as("SELECT uid, title, description FROM papers WHERE annotated = 0 ORDER BY uid")
            .fetch_all(&mut *conn)
            .await?;

    Ok(rows
        .into_iter()
        .map(|(uid, title, description)| (uid, document_text(title.as_deref(), description.as_deref())))
        .collect())
}

/// 随机取若干未标注论文的 uid
pub async fn random_unannotated(conn: &mut SqliteConnection, limit: usize) -> GzResult<Vec<String>> {
    let uids = sqlx::query_scalar("SELECT uid FROM papers WHERE annotated = 0 ORDER BY RANDOM() LIMIT ?")
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await?;
    Ok(uids)
}

async fn linked_names(conn: &mut SqliteConnection, sql: &str, uid: &str) -> GzResult<Vec<String>> {
    let names = sqlx::query_scalar(sql).bind(uid).fetch_all(&mut *conn).await?;
    Ok(names)
}

/// 读取论文及全部关联实体名称
pub async fn load_detail(conn: &mut SqliteConnection, uid: &str) -> GzResult<Option<PaperDetail>> {
    let Some(paper) = get_paper(conn, uid).await? else {
        return Ok(None);
    };

    let creators = linked_names(
        conn,
        r#"SELECT CASE WHEN c.first_name = '' THEN c.last_name ELSE c.last_name || ', ' || c.first_name END
           FROM paper_creators pc JOIN creators c ON c.id = pc.creator_id
           WHERE pc.paper_uid = ? ORDER BY pc.position"#,
        uid,
    )
    .await?;
    let institutes = linked_names(
        conn,
        "SELECT i.name FROM paper_institutes pi JOIN institutes i ON i.id = pi.institute_id WHERE pi.paper_uid = ? ORDER BY i.name",
        uid,
    )
    .await?;
    let ddcs = linked_names(
        conn,
        "SELECT printf('%03d', d.dewey_number) || ' ' || d.name FROM paper_ddcs pd JOIN ddcs d ON d.dewey_number = pd.dewey_number WHERE pd.paper_uid = ? ORDER BY d.dewey_number",
        uid,
    )
    .await?;
    let keywords = linked_names(
        conn,
        "SELECT k.name FROM paper_keywords pk JOIN keywords k ON k.id = pk.keyword_id WHERE pk.paper_uid = ? ORDER BY k.name",
        uid,
    )
    .await?;
    let resource_types = linked_names(
        conn,
        "SELECT r.name FROM paper_resource_types pr JOIN resource_types r ON r.id = pr.resource_type_id WHERE pr.paper_uid = ? ORDER BY r.name",
        uid,
    )
    .await?;

    let publisher: Option<String> = sqlx::query_scalar("SELECT name FROM publishers WHERE id = ?")
        .bind(paper.publisher_id)
        .fetch_optional(&mut *conn)
        .await?;
    let language: Option<String> = sqlx::query_scalar("SELECT name FROM languages WHERE id = ?")
        .bind(paper.language_id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(Some(PaperDetail {
        paper,
        creators,
        institutes,
        ddcs,
        keywords,
        resource_types,
        publisher,
        language,
    }))
}
