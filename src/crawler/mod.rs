pub mod oai;
pub mod response;

pub use oai::OaiClient;

use std::collections::HashMap;
use thiserror::Error;

/// 远端拉取错误
///
/// `Transient` 表示网络层面的失败（断线、超时、限流），本次同步应中止，
/// 下一次调度时重试；`Protocol` 表示远端返回了无法理解的响应。
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("网络暂时不可用: {0}")]
    Transient(String),

    #[error("协议错误 [{code}]: {message}")]
    Protocol { code: String, message: String },

    #[error("HTTP客户端初始化失败: {0}")]
    ClientInit(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    pub(crate) fn malformed(detail: impl std::fmt::Display) -> Self {
        FetchError::Protocol {
            code: "malformedResponse".to_string(),
            message: detail.to_string(),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Transient(e.to_string())
    }
}

/// 远端的一条原始记录
///
/// `fields` 为 `None` 表示该记录已在远端删除。
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub identifier: String,
    pub datestamp: Option<String>,
    pub fields: Option<HashMap<String, Vec<String>>>,
}

impl RawRecord {
    pub fn deleted(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            datestamp: None,
            fields: None,
        }
    }
}

/// ListSets 返回的一个集合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetEntry {
    pub spec: String,
    pub name: String,
}
