pub mod logger;
pub mod scheduler;

use thiserror::Error;

use crate::classifier::ClassifierError;
use crate::crawler::FetchError;
use crate::parser::NormalizeError;

#[derive(Error, Debug)]
pub enum GzError {
    #[error("数据库错误: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// 批次提交失败，整个批次已回滚
    #[error("提交失败: {0}")]
    CommitError(sqlx::Error),

    #[error("拉取错误: {0}")]
    FetchError(#[from] FetchError),

    #[error("记录规范化错误: {0}")]
    NormalizeError(#[from] NormalizeError),

    #[error("分类器错误: {0}")]
    ClassifierError(#[from] ClassifierError),

    #[error("设置错误: {0}")]
    SettingError(String),

    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),
}

pub type GzResult<T> = Result<T, GzError>;
