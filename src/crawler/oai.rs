use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::response::{self, OaiPage};
use super::{FetchError, RawRecord, SetEntry};
use crate::config::HarvesterConfig;

/// OAI-PMH 客户端
pub struct OaiClient {
    client: Client,
    base_url: String,
    metadata_prefix: String,
    max_retries: u32,
    retry_delay: Duration,
    day_granularity: bool,
}

impl OaiClient {
    pub fn new(base_url: &str, config: &HarvesterConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| FetchError::ClientInit(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            metadata_prefix: config.metadata_prefix.clone(),
            max_retries: config.max_retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            day_granularity: config.granularity == "day",
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 拉取自 `since` 以来新增、修改或删除的记录，`None` 表示全部记录
    ///
    /// 返回的流按页惰性请求，调用方只需不断调用 `next`。
    pub fn list_records(&self, since: Option<DateTime<Utc>>) -> RecordStream<'_> {
        RecordStream {
            client: self,
            since,
            buffer: VecDeque::new(),
            resumption_token: None,
            started: false,
            pages: 0,
        }
    }

    /// 按标识符获取单条记录
    pub async fn get_record(&self, identifier: &str) -> Result<RawRecord, FetchError> {
        let params = vec![
            ("verb", "GetRecord".to_string()),
            ("identifier", identifier.to_string()),
            ("metadataPrefix", self.metadata_prefix.clone()),
        ];
        let page = self.fetch_page(&params).await?;

        page.records.into_iter().next().ok_or_else(|| FetchError::Protocol {
            code: "idDoesNotExist".to_string(),
            message: format!("远端没有记录 {}", identifier),
        })
    }

    /// 获取全部集合（机构层级与资源类型的来源）
    pub async fn list_sets(&self) -> Result<Vec<SetEntry>, FetchError> {
        let mut sets = Vec::new();
        let mut params = vec![("verb", "ListSets".to_string())];

        loop {
            let page = self.fetch_page(&params).await?;
            sets.extend(page.sets);

            match page.resumption_token {
                Some(token) => {
                    params = vec![
                        ("verb", "ListSets".to_string()),
                        ("resumptionToken", token),
                    ];
                }
                None => break,
            }
        }

        info!("获取到 {} 个集合", sets.len());
        Ok(sets)
    }

    fn format_from(&self, since: DateTime<Utc>) -> String {
        if self.day_granularity {
            since.format("%Y-%m-%d").to_string()
        } else {
            since.format("%Y-%m-%dT%H:%M:%SZ").to_string()
        }
    }

    async fn fetch_page(&self, params: &[(&str, String)]) -> Result<OaiPage, FetchError> {
        let body = self.request(params).await?;
        response::parse_page(&body)?.into_result()
    }

    /// 发送请求，网络错误和 429/5xx 会重试，重试耗尽后返回 `Transient`
    async fn request(&self, params: &[(&str, String)]) -> Result<String, FetchError> {
        let mut last_error = None;

        for attempt in 1..=self.max_retries {
            if attempt > 1 {
                debug!("等待 {}ms 后重试 (第 {}/{} 次)", self.retry_delay.as_millis(), attempt, self.max_retries);
                tokio::time::sleep(self.retry_delay).await;
            }

            let response = match self.client.get(&self.base_url).query(params).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("请求失败 (第 {}/{} 次): {}", attempt, self.max_retries, e);
                    last_error = Some(FetchError::from(e));
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                warn!("远端返回 {} (第 {}/{} 次尝试)", status, attempt, self.max_retries);
                last_error = Some(FetchError::Transient(format!("远端返回 {}", status)));
                continue;
            }

            if !status.is_success() {
                return Err(FetchError::Protocol {
                    code: format!("http{}", status.as_u16()),
                    message: format!("远端返回 {}", status),
                });
            }

            // 读取响应体时断线同样视为暂时性错误
            return response.text().await.map_err(FetchError::from);
        }

        Err(last_error.unwrap_or_else(|| FetchError::Transient("请求失败".to_string())))
    }
}

/// 按页惰性获取记录的流
pub struct RecordStream<'a> {
    client: &'a OaiClient,
    since: Option<DateTime<Utc>>,
    buffer: VecDeque<RawRecord>,
    resumption_token: Option<String>,
    started: bool,
    pages: usize,
}

impl<'a> RecordStream<'a> {
    /// 返回下一条记录；流结束时返回 `Ok(None)`
    pub async fn next(&mut self) -> Result<Option<RawRecord>, FetchError> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Ok(Some(record));
            }

            let params = if !self.started {
                let mut params = vec![
                    ("verb", "ListRecords".to_string()),
                    ("metadataPrefix", self.client.metadata_prefix.clone()),
                ];
                if let Some(since) = self.since {
                    params.push(("from", self.client.format_from(since)));
                }
                params
            } else {
                match self.resumption_token.take() {
                    Some(token) => vec![
                        ("verb", "ListRecords".to_string()),
                        ("resumptionToken", token),
                    ],
                    None => return Ok(None),
                }
            };

            self.started = true;
            let page = self.client.fetch_page(&params).await?;
            self.pages += 1;
            debug!("第 {} 页: {} 条记录", self.pages, page.records.len());

            self.buffer.extend(page.records);
            self.resumption_token = page.resumption_token;
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }
}
