pub mod defaults;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use defaults::{SettingDefaults, SettingKind, SettingName};

pub const CONFIG_PATH: &str = "config/settings.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub harvester: HarvesterConfig,
    pub storage: StorageConfig,
    pub annotation: AnnotationConfig,
    pub defaults: SettingDefaults,
}

/// OAI-PMH 拉取配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HarvesterConfig {
    /// 仅用于首次初始化 `zora_url` 设置，运行时以数据库中的设置为准
    pub base_url: String,
    pub metadata_prefix: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub user_agent: String,
    /// `from` 参数粒度: "seconds" 或 "day"
    pub granularity: String,
    pub institute_set_prefix: String,
    pub resource_type_set_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: String,
    /// 0 表示整个拉取窗口在一个事务中提交
    pub commit_batch_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AnnotationConfig {
    pub legacy_annotations_path: String,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_PATH))
    }

    /// 读取配置文件，并允许 `GREENZORA__HARVESTER__BASE_URL` 这类环境变量覆盖
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("GREENZORA")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn database_url(&self) -> String {
        format!("sqlite:{}", self.storage.database_path)
    }
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.zora.uzh.ch/cgi/oai2".to_string(),
            metadata_prefix: "oai_dc".to_string(),
            timeout_secs: 60,
            max_retries: 3,
            retry_delay_ms: 3000,
            user_agent: "GreenZoraBot/1.0 (sustainability research)".to_string(),
            granularity: "seconds".to_string(),
            institute_set_prefix: "subjects".to_string(),
            resource_type_set_prefix: "types".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "./data/greenzora.db".to_string(),
            commit_batch_size: 0,
        }
    }
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            legacy_annotations_path: "data/legacy_annotations.json".to_string(),
        }
    }
}
