use chrono::{DateTime, NaiveDate};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DateParseError {
    #[error("无法识别的日期格式: {0}")]
    UnknownFormat(String),

    #[error("日期不存在: {0}")]
    InvalidCalendarDate(String),
}

fn iso_like() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{4})(?:[-/](\d{1,2})(?:[-/](\d{1,2}))?)?(?:[T ].*)?$").expect("日期正则无效")
    })
}

fn dotted() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,2})\.(\d{1,2})\.(\d{4})$").expect("日期正则无效"))
}

/// 宽松解析日期
///
/// 支持 `YYYY`、`YYYY-MM`、`YYYY-MM-DD`、`YYYY/MM/DD`、`DD.MM.YYYY` 以及带时间的
/// RFC 3339 时间戳。缺失的月、日按 1 补齐。ZORA 中存在 `2009-11-31` 这类不存在的日期，
/// 此时返回 `InvalidCalendarDate`，由调用方决定置空。
pub fn parse_lenient(raw: &str) -> Result<NaiveDate, DateParseError> {
    let raw = raw.trim();

    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(timestamp.date_naive());
    }

    let (year, month, day) = if let Some(caps) = iso_like().captures(raw) {
        (
            caps.get(1).map(|m| m.as_str()),
            caps.get(2).map(|m| m.as_str()),
            caps.get(3).map(|m| m.as_str()),
        )
    } else if let Some(caps) = dotted().captures(raw) {
        (
            caps.get(3).map(|m| m.as_str()),
            caps.get(2).map(|m| m.as_str()),
            caps.get(1).map(|m| m.as_str()),
        )
    } else {
        return Err(DateParseError::UnknownFormat(raw.to_string()));
    };

    let year: i32 = year
        .and_then(|y| y.parse().ok())
        .ok_or_else(|| DateParseError::UnknownFormat(raw.to_string()))?;
    let month: u32 = month.and_then(|m| m.parse().ok()).unwrap_or(1);
    let day: u32 = day.and_then(|d| d.parse().ok()).unwrap_or(1);

    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| DateParseError::InvalidCalendarDate(raw.to_string()))
}
