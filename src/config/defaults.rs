use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 设置值的存储类型，数据库中统一存为字符串
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Int,
    String,
    Boolean,
    Datetime,
}

impl SettingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKind::Int => "int",
            SettingKind::String => "string",
            SettingKind::Boolean => "boolean",
            SettingKind::Datetime => "datetime",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "int" => Some(SettingKind::Int),
            "string" => Some(SettingKind::String),
            "boolean" => Some(SettingKind::Boolean),
            "datetime" => Some(SettingKind::Datetime),
            _ => None,
        }
    }
}

/// 可在运行时修改的服务设置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingName {
    /// 标注预留超时（分钟）
    AnnotationTimeout,
    /// 机构列表刷新间隔（天）
    InstituteUpdateInterval,
    /// 资源类型刷新间隔（天）
    ResourceTypeUpdateInterval,
    /// ZORA 拉取间隔（天）
    ZoraPullInterval,
    ZoraUrl,
}

impl SettingName {
    pub const ALL: [SettingName; 5] = [
        SettingName::AnnotationTimeout,
        SettingName::InstituteUpdateInterval,
        SettingName::ResourceTypeUpdateInterval,
        SettingName::ZoraPullInterval,
        SettingName::ZoraUrl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingName::AnnotationTimeout => "annotation_timeout",
            SettingName::InstituteUpdateInterval => "institute_update_interval",
            SettingName::ResourceTypeUpdateInterval => "resource_type_update_interval",
            SettingName::ZoraPullInterval => "zora_pull_interval",
            SettingName::ZoraUrl => "zora_url",
        }
    }

    pub fn kind(&self) -> SettingKind {
        match self {
            SettingName::ZoraUrl => SettingKind::String,
            _ => SettingKind::Int,
        }
    }
}

impl fmt::Display for SettingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingName::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| format!("未知设置: {}", s))
    }
}

/// 首次初始化数据库时写入 settings 表的默认值
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SettingDefaults {
    pub annotation_timeout: i64,
    pub institute_update_interval: i64,
    pub resource_type_update_interval: i64,
    pub zora_pull_interval: i64,
}

impl SettingDefaults {
    /// 按设置名给出默认值字符串，`zora_url` 取自 harvester.base_url
    pub fn entries(&self, zora_url: &str) -> Vec<(SettingName, String)> {
        vec![
            (SettingName::AnnotationTimeout, self.annotation_timeout.to_string()),
            (SettingName::InstituteUpdateInterval, self.institute_update_interval.to_string()),
            (
                SettingName::ResourceTypeUpdateInterval,
                self.resource_type_update_interval.to_string(),
            ),
            (SettingName::ZoraPullInterval, self.zora_pull_interval.to_string()),
            (SettingName::ZoraUrl, zora_url.to_string()),
        ]
    }
}

impl Default for SettingDefaults {
    fn default() -> Self {
        Self {
            annotation_timeout: 10,
            institute_update_interval: 7,
            resource_type_update_interval: 7,
            zora_pull_interval: 14,
        }
    }
}
