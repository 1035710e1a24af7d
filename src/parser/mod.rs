pub mod date;
pub mod subject;

pub use subject::{SubjectBuckets, SubjectClassifier};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

use crate::crawler::RawRecord;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("记录缺少标识符")]
    MissingIdentifier,
}

/// 人工标注或导入时携带的分类标签
///
/// `annotated` 为真时 `sustainable` 必然已知；构造时会强制这一点。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub sustainable: Option<bool>,
    pub annotated: bool,
}

impl Label {
    pub fn new(sustainable: Option<bool>, annotated: bool) -> Self {
        Self {
            sustainable,
            annotated: annotated && sustainable.is_some(),
        }
    }

    pub fn annotated(sustainable: bool) -> Self {
        Self::new(Some(sustainable), true)
    }
}

/// 规范化后的论文元数据
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaperMetadata {
    pub uid: String,
    pub title: Option<String>,
    /// "Last, First" 或 "Last"，拆分在入库时进行
    pub creators: Vec<String>,
    pub institutes: Vec<String>,
    /// "330 Economics" 形式的分类号
    pub ddcs: Vec<String>,
    pub keywords: Vec<String>,
    pub description: Option<String>,
    pub publisher: Option<String>,
    pub date: Option<NaiveDate>,
    pub resource_types: Vec<String>,
    pub language: Option<String>,
    pub relation: Option<String>,
    /// 远端同步的记录不带标签，只有旧标注导入才会设置
    pub label: Option<Label>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedRecord {
    Paper(PaperMetadata),
    Deleted(String),
}

/// 将远端原始记录转换为规范化元数据
pub struct Normalizer {
    subjects: SubjectClassifier,
    known_institutes: HashSet<String>,
    known_resource_types: HashSet<String>,
}

impl Normalizer {
    pub fn new(known_institutes: HashSet<String>, known_resource_types: HashSet<String>) -> Self {
        Self {
            subjects: SubjectClassifier::new(),
            known_institutes,
            known_resource_types,
        }
    }

    pub fn normalize(&self, raw: &RawRecord) -> Result<NormalizedRecord, NormalizeError> {
        let uid = raw.identifier.trim();
        if uid.is_empty() {
            return Err(NormalizeError::MissingIdentifier);
        }

        let fields = match &raw.fields {
            Some(fields) => fields,
            None => return Ok(NormalizedRecord::Deleted(uid.to_string())),
        };

        let subjects = fields.get("subject").map(Vec::as_slice).unwrap_or(&[]);
        let SubjectBuckets { ddcs, institutes, keywords } =
            self.subjects.partition(subjects, &self.known_institutes);

        // 资源类型只接受受控词表中的值
        let resource_types = fields
            .get("type")
            .map(|types| {
                types
                    .iter()
                    .map(|t| t.trim())
                    .filter(|t| self.known_resource_types.contains(*t))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let date = first(fields, "date").and_then(|raw_date| match date::parse_lenient(&raw_date) {
            Ok(date) => Some(date),
            Err(e) => {
                debug!("记录 {} 的日期无法解析，置空: {}", uid, e);
                None
            }
        });

        let creators = fields
            .get("creator")
            .map(|c| c.iter().filter(|name| !name.trim().is_empty()).cloned().collect())
            .unwrap_or_default();

        Ok(NormalizedRecord::Paper(PaperMetadata {
            uid: uid.to_string(),
            title: first(fields, "title"),
            creators,
            institutes,
            ddcs,
            keywords,
            description: first(fields, "description"),
            publisher: first(fields, "publisher"),
            date,
            resource_types,
            language: first(fields, "language"),
            relation: first(fields, "relation"),
            label: None,
        }))
    }
}

fn first(fields: &HashMap<String, Vec<String>>, name: &str) -> Option<String> {
    fields
        .get(name)
        .and_then(|values| values.first())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
