//! 旧系统人工标注的一次性导入

use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

use crate::parser::date::parse_lenient;
use crate::parser::{Label, PaperMetadata};
use crate::storage::settings::{self, params};
use crate::storage::{papers, Database};
use crate::utils::GzResult;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LegacyRecord {
    pub uid: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub creators: Vec<String>,
    pub institutes: Vec<String>,
    pub ddcs: Vec<String>,
    pub keywords: Vec<String>,
    pub publisher: Option<String>,
    pub date: Option<String>,
    pub resource_types: Vec<String>,
    pub language: Option<String>,
    pub relation: Option<String>,
    pub sustainable: Option<bool>,
    pub annotated: bool,
}

impl LegacyRecord {
    fn label(&self) -> Label {
        Label::new(self.sustainable, self.annotated)
    }

    fn into_metadata(self) -> PaperMetadata {
        let label = Some(self.label());
        PaperMetadata {
            date: self.date.as_deref().and_then(|raw| parse_lenient(raw).ok()),
            uid: self.uid,
            title: self.title,
            creators: self.creators,
            institutes: self.institutes,
            ddcs: self.ddcs,
            keywords: self.keywords,
            description: self.description,
            publisher: self.publisher,
            resource_types: self.resource_types,
            language: self.language,
            relation: self.relation,
            label,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyImport {
    AlreadyImported,
    Imported { relabelled: usize, created: usize },
}

/// 导入旧标注；已有论文只覆盖标签，新论文完整写入
///
/// 整个文件在一个事务中导入，导入标记随同一事务提交。
pub async fn import_legacy_annotations(db: &Database, path: &Path) -> GzResult<LegacyImport> {
    {
        let mut conn = db.pool().acquire().await?;
        if settings::get_flag(&mut conn, params::LEGACY_ANNOTATIONS_IMPORTED).await? {
            info!("旧标注已导入，跳过");
            return Ok(LegacyImport::AlreadyImported);
        }
    }

    let content = tokio::fs::read_to_string(path).await?;
    let records: Vec<LegacyRecord> = serde_json::from_str(&content)?;
    info!("开始导入旧标注: {} 条", records.len());

    let mut tx = db.begin().await?;
    let mut relabelled = 0;
    let mut created = 0;

    for record in records {
        if record.uid.trim().is_empty() {
            warn!("旧标注缺少 uid，跳过");
            continue;
        }

        if papers::get_paper(&mut tx, &record.uid).await?.is_some() {
            papers::set_label(&mut tx, &record.uid, record.label()).await?;
            relabelled += 1;
        } else {
            papers::upsert_paper(&mut tx, &record.into_metadata()).await?;
            created += 1;
        }
    }

    settings::set_flag(&mut tx, params::LEGACY_ANNOTATIONS_IMPORTED, true).await?;
    tx.commit().await?;

    info!("旧标注导入完成: 更新 {} 篇，新建 {} 篇", relabelled, created);
    Ok(LegacyImport::Imported { relabelled, created })
}
