//! 设置与运行参数
//!
//! 两张表都以字符串存值，并记录类型名，读取时按类型解析。
//! `settings` 可由管理员修改；`operation_parameters` 只由程序自身维护
//! （同步检查点、一次性导入标记等）。

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqliteConnection;

use crate::config::{SettingKind, SettingName};
use crate::utils::{GzError, GzResult};

pub mod params {
    pub const DATABASE_INITIALIZED: &str = "database_initialized";
    /// 上一次成功完成拉取的时间，即下一次拉取的 `from`
    pub const LAST_ZORA_PULL: &str = "last_zora_pull";
    pub const LEGACY_ANNOTATIONS_IMPORTED: &str = "legacy_annotations_imported";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    Int(i64),
    Text(String),
    Bool(bool),
    Datetime(DateTime<Utc>),
}

impl SettingValue {
    pub fn parse(kind: SettingKind, raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        match kind {
            SettingKind::Int => raw
                .parse::<i64>()
                .map(SettingValue::Int)
                .map_err(|e| format!("'{}' 不是整数: {}", raw, e)),
            SettingKind::String => Ok(SettingValue::Text(raw.to_string())),
            SettingKind::Boolean => match raw {
                "1" | "true" => Ok(SettingValue::Bool(true)),
                "0" | "false" => Ok(SettingValue::Bool(false)),
                _ => Err(format!("'{}' 不是布尔值", raw)),
            },
            SettingKind::Datetime => DateTime::parse_from_rfc3339(raw)
                .map(|dt| SettingValue::Datetime(dt.with_timezone(&Utc)))
                .map_err(|e| format!("'{}' 不是时间戳: {}", raw, e)),
        }
    }

    pub fn to_storage(&self) -> String {
        match self {
            SettingValue::Int(v) => v.to_string(),
            SettingValue::Text(v) => v.clone(),
            SettingValue::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            SettingValue::Datetime(v) => v.to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SettingValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// 一次设置修改的前后值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingChange {
    pub name: SettingName,
    pub old: Option<SettingValue>,
    pub new: SettingValue,
}

async fn read_typed(
    conn: &mut SqliteConnection,
    table: &str,
    name: &str,
) -> GzResult<Option<SettingValue>> {
    let row: Option<(Option<String>, String)> =
        sqlx::query_as(&format!("SELECT value, type_name FROM {} WHERE name = ?", table))
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;

    let (value, type_name) = match row {
        Some((Some(value), type_name)) => (value, type_name),
        _ => return Ok(None),
    };

    let kind = SettingKind::parse(&type_name)
        .ok_or_else(|| GzError::SettingError(format!("{} 的类型未知: {}", name, type_name)))?;
    SettingValue::parse(kind, &value)
        .map(Some)
        .map_err(|e| GzError::SettingError(format!("{}: {}", name, e)))
}

pub async fn get_setting(conn: &mut SqliteConnection, name: SettingName) -> GzResult<Option<SettingValue>> {
    read_typed(conn, "settings", name.as_str()).await
}

pub async fn get_int(conn: &mut SqliteConnection, name: SettingName) -> GzResult<i64> {
    get_setting(conn, name)
        .await?
        .and_then(|v| v.as_int())
        .ok_or_else(|| GzError::SettingError(format!("缺少整数设置 {}", name)))
}

pub async fn get_text(conn: &mut SqliteConnection, name: SettingName) -> GzResult<String> {
    get_setting(conn, name)
        .await?
        .and_then(|v| v.as_text().map(str::to_string))
        .ok_or_else(|| GzError::SettingError(format!("缺少字符串设置 {}", name)))
}

/// 修改设置并返回前后值；副作用由调用方通过 `apply_setting_change` 处理
pub async fn set_setting(conn: &mut SqliteConnection, name: SettingName, raw: &str) -> GzResult<SettingChange> {
    let new = SettingValue::parse(name.kind(), raw)
        .map_err(|e| GzError::SettingError(format!("{}: {}", name, e)))?;
    if let SettingValue::Int(v) = new {
        if v <= 0 {
            return Err(GzError::SettingError(format!("{} 必须为正数", name)));
        }
    }

    let old = get_setting(conn, name).await?;

    sqlx::query(
        r#"
        INSERT INTO settings (name, value, type_name) VALUES (?, ?, ?)
        ON CONFLICT(name) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(name.as_str())
    .bind(new.to_storage())
    .bind(name.kind().as_str())
    .execute(&mut *conn)
    .await?;

    Ok(SettingChange { name, old, new })
}

pub(crate) async fn insert_default_setting(conn: &mut SqliteConnection, name: SettingName, value: &str) -> GzResult<()> {
    sqlx::query("INSERT OR IGNORE INTO settings (name, value, type_name) VALUES (?, ?, ?)")
        .bind(name.as_str())
        .bind(value)
        .bind(name.kind().as_str())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn insert_default_parameters(conn: &mut SqliteConnection) -> GzResult<()> {
    let defaults: [(&str, Option<&str>, SettingKind); 3] = [
        (params::DATABASE_INITIALIZED, Some("0"), SettingKind::Boolean),
        (params::LAST_ZORA_PULL, None, SettingKind::Datetime),
        (params::LEGACY_ANNOTATIONS_IMPORTED, Some("0"), SettingKind::Boolean),
    ];

    for (name, value, kind) in defaults {
        sqlx::query("INSERT OR IGNORE INTO operation_parameters (name, value, type_name) VALUES (?, ?, ?)")
            .bind(name)
            .bind(value)
            .bind(kind.as_str())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// 当前全部设置的原始值，用于检测其他进程的修改
pub async fn snapshot(conn: &mut SqliteConnection) -> GzResult<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT name, value FROM settings ORDER BY name")
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows)
}

async fn write_parameter(conn: &mut SqliteConnection, name: &str, value: Option<SettingValue>, kind: SettingKind) -> GzResult<()> {
    sqlx::query(
        r#"
        INSERT INTO operation_parameters (name, value, type_name) VALUES (?, ?, ?)
        ON CONFLICT(name) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(name)
    .bind(value.map(|v| v.to_storage()))
    .bind(kind.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get_flag(conn: &mut SqliteConnection, name: &str) -> GzResult<bool> {
    Ok(matches!(
        read_typed(conn, "operation_parameters", name).await?,
        Some(SettingValue::Bool(true))
    ))
}

pub async fn set_flag(conn: &mut SqliteConnection, name: &str, value: bool) -> GzResult<()> {
    write_parameter(conn, name, Some(SettingValue::Bool(value)), SettingKind::Boolean).await
}

/// 读取同步检查点，首次运行时为 `None`
pub async fn get_checkpoint(conn: &mut SqliteConnection) -> GzResult<Option<DateTime<Utc>>> {
    match read_typed(conn, "operation_parameters", params::LAST_ZORA_PULL).await? {
        Some(SettingValue::Datetime(ts)) => Ok(Some(ts)),
        _ => Ok(None),
    }
}

pub async fn set_checkpoint(conn: &mut SqliteConnection, checkpoint: DateTime<Utc>) -> GzResult<()> {
    write_parameter(
        conn,
        params::LAST_ZORA_PULL,
        Some(SettingValue::Datetime(checkpoint)),
        SettingKind::Datetime,
    )
    .await
}
