//! 可持续性文本分类
//!
//! 模型由 [`ClassifierAdapter`] 持有，重新训练时整体替换。正在进行的预测
//! 持有旧模型的快照，不受替换影响。

pub mod naive_bayes;

pub use naive_bayes::NaiveBayes;

use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("训练语料为空")]
    EmptyCorpus,

    #[error("训练失败: {0}")]
    Training(String),
}

/// 二分类文本模型：`true` 表示可持续
pub trait TextClassifier: Send + Sync {
    fn fit(&mut self, corpus: &[(String, bool)]) -> Result<(), ClassifierError>;

    /// 未训练的模型不应被调用，见 [`TextClassifier::is_fitted`]
    fn predict(&self, documents: &[String]) -> Vec<bool>;

    fn is_fitted(&self) -> bool;
}

/// 分类用文本：`title | description`，缺失的部分为空字符串
pub fn document_text(title: Option<&str>, description: Option<&str>) -> String {
    format!("{} | {}", title.unwrap_or(""), description.unwrap_or(""))
}

type Factory = Box<dyn Fn() -> Box<dyn TextClassifier> + Send + Sync>;

pub struct ClassifierAdapter {
    model: RwLock<Arc<dyn TextClassifier>>,
    factory: Factory,
}

impl Default for ClassifierAdapter {
    fn default() -> Self {
        Self::with_factory(|| Box::new(NaiveBayes::default()))
    }
}

impl ClassifierAdapter {
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn TextClassifier> + Send + Sync + 'static,
    {
        let model: Arc<dyn TextClassifier> = Arc::from(factory());
        Self {
            model: RwLock::new(model),
            factory: Box::new(factory),
        }
    }

    /// 用全新模型训练并替换当前模型；训练失败时保留旧模型
    pub fn train(&self, corpus: &[(String, bool)]) -> Result<(), ClassifierError> {
        if corpus.is_empty() {
            return Err(ClassifierError::EmptyCorpus);
        }

        let mut fresh = (self.factory)();
        fresh.fit(corpus)?;

        let sustainable = corpus.iter().filter(|(_, label)| *label).count();
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = Arc::from(fresh);
        info!("分类模型已更新: {} 篇语料，其中 {} 篇可持续", corpus.len(), sustainable);
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<dyn TextClassifier> {
        Arc::clone(&self.model.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_fitted(&self) -> bool {
        self.snapshot().is_fitted()
    }

    pub fn predict_one(&self, text: &str) -> Option<bool> {
        self.predict_batch(&[text.to_string()]).pop().flatten()
    }

    pub fn predict_batch(&self, texts: &[String]) -> Vec<Option<bool>> {
        let model = self.snapshot();
        if !model.is_fitted() {
            return vec![None; texts.len()];
        }
        model.predict(texts).into_iter().map(Some).collect()
    }
}
