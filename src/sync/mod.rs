//! 增量同步
//!
//! 一次拉取的流程：取检查点，按页拉取自检查点以来变化的记录，逐条规范化后
//! 删除或写入，未标注的论文立即分类，全部处理完后在同一事务中写入新的检查点
//! 并提交。写事务只在记录拉取完毕后打开，网络请求期间不持有数据库写锁。
//! 拉取中断或提交失败时事务回滚，检查点保持不变，下一次拉取会重新处理同一
//! 时间窗口；写入是幂等的，重复处理不会产生重复数据。

pub mod annotation;
pub mod legacy;
pub mod vocabulary;

use chrono::{DateTime, SubsecRound, Utc};
use sqlx::{Connection, SqliteConnection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

use crate::classifier::{document_text, ClassifierAdapter};
use crate::config::{AppConfig, SettingName};
use crate::crawler::{OaiClient, RawRecord};
use crate::parser::{NormalizedRecord, Normalizer};
use crate::storage::models::Paper;
use crate::storage::settings::{self, SettingValue};
use crate::storage::{entities, papers, Database};
use crate::utils::scheduler::JobKind;
use crate::utils::{GzError, GzResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Fetching,
    Processing,
    Committing,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub upserted: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub classified: usize,
    pub pages: usize,
    pub checkpoint: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// 已有拉取在进行，本次未做任何事
    Skipped,
}

/// 设置修改需要的后续动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingEffect {
    Reschedule { job: JobKind, days: i64 },
    ReconnectClient,
    None,
}

pub struct SyncService {
    db: Database,
    config: AppConfig,
    client: RwLock<Arc<OaiClient>>,
    classifier: ClassifierAdapter,
    state: Mutex<SyncState>,
    running: tokio::sync::Mutex<()>,
}

fn commit_error(e: GzError) -> GzError {
    match e {
        GzError::DatabaseError(e) => GzError::CommitError(e),
        other => other,
    }
}

impl SyncService {
    /// 用数据库中的 `zora_url` 设置创建服务
    pub async fn new(db: Database, config: AppConfig) -> GzResult<Self> {
        let url = {
            let mut conn = db.pool().acquire().await?;
            settings::get_text(&mut conn, SettingName::ZoraUrl).await?
        };
        let client = OaiClient::new(&url, &config.harvester)?;
        info!("同步服务已创建，远端地址: {}", url);

        Ok(Self {
            db,
            config,
            client: RwLock::new(Arc::new(client)),
            classifier: ClassifierAdapter::default(),
            state: Mutex::new(SyncState::Idle),
            running: tokio::sync::Mutex::new(()),
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn classifier(&self) -> &ClassifierAdapter {
        &self.classifier
    }

    pub fn client(&self) -> Arc<OaiClient> {
        Arc::clone(&self.client.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SyncState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    async fn normalizer(&self) -> GzResult<Normalizer> {
        let mut conn = self.db.pool().acquire().await?;
        let institutes = entities::known_institute_names(&mut conn).await?;
        let resource_types = entities::known_resource_types(&mut conn).await?;
        Ok(Normalizer::new(institutes, resource_types))
    }

    /// 执行一次增量拉取；已有拉取在进行时直接返回 `Skipped`
    pub async fn run_pull(&self) -> GzResult<SyncOutcome> {
        let Ok(_running) = self.running.try_lock() else {
            info!("上一次拉取尚未结束，跳过本次");
            return Ok(SyncOutcome::Skipped);
        };

        match self.pull_window().await {
            Ok(report) => {
                self.set_state(SyncState::Idle);
                info!(
                    "拉取完成: 写入 {} 篇，删除 {} 篇，跳过 {} 条，分类 {} 篇，共 {} 页",
                    report.upserted, report.deleted, report.skipped, report.classified, report.pages
                );
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                self.set_state(SyncState::Failed);
                match &e {
                    GzError::FetchError(fetch) if fetch.is_transient() => {
                        warn!("远端暂时不可用，检查点保持不变，下次调度重试: {}", e)
                    }
                    _ => error!("拉取失败，检查点保持不变: {}", e),
                }
                Err(e)
            }
        }
    }

    async fn pull_window(&self) -> GzResult<SyncReport> {
        let since = {
            let mut conn = self.db.pool().acquire().await?;
            settings::get_checkpoint(&mut conn).await?
        };
        let normalizer = self.normalizer().await?;
        let client = self.client();

        // 在处理前记录时间，处理期间远端的修改留给下一次拉取；
        // 截断到检查点的存储精度
        let candidate = Utc::now().trunc_subsecs(6);
        match since {
            Some(ts) => info!("开始拉取 {} 以来的变更", ts),
            None => info!("首次拉取，获取全部记录"),
        }

        let batch_size = self.config.storage.commit_batch_size;
        let mut report = SyncReport::default();
        let mut stream = client.list_records(since);
        let mut pending = Vec::new();

        loop {
            self.set_state(SyncState::Fetching);
            let Some(raw) = stream.next().await? else {
                break;
            };
            pending.push(raw);

            if batch_size > 0 && pending.len() >= batch_size {
                let mut tx = self.db.begin().await?;
                self.process_batch(&mut tx, &normalizer, &pending, &mut report).await?;
                self.set_state(SyncState::Committing);
                tx.commit().await.map_err(GzError::CommitError)?;
                debug!("已提交 {} 条记录", pending.len());
                pending.clear();
            }
        }

        let mut tx = self.db.begin().await?;
        self.process_batch(&mut tx, &normalizer, &pending, &mut report).await?;
        self.set_state(SyncState::Committing);
        settings::set_checkpoint(&mut tx, candidate).await.map_err(commit_error)?;
        tx.commit().await.map_err(GzError::CommitError)?;

        report.pages = stream.pages_fetched();
        report.checkpoint = Some(candidate);
        Ok(report)
    }

    async fn process_batch(
        &self,
        conn: &mut SqliteConnection,
        normalizer: &Normalizer,
        records: &[RawRecord],
        report: &mut SyncReport,
    ) -> GzResult<()> {
        self.set_state(SyncState::Processing);
        for raw in records {
            self.process_record(conn, normalizer, raw, report).await?;
        }
        Ok(())
    }

    /// 处理单条记录；规范化、删除或写入失败的记录只记日志并跳过
    async fn process_record(
        &self,
        conn: &mut SqliteConnection,
        normalizer: &Normalizer,
        raw: &RawRecord,
        report: &mut SyncReport,
    ) -> GzResult<()> {
        let metadata = match normalizer.normalize(raw) {
            Ok(NormalizedRecord::Paper(metadata)) => metadata,
            Ok(NormalizedRecord::Deleted(uid)) => return self.remove_record(conn, &uid, report).await,
            Err(e) => {
                warn!("跳过无法规范化的记录: {}", e);
                report.skipped += 1;
                return Ok(());
            }
        };

        // 单条记录在保存点中写入，失败时只回滚这一条
        let mut savepoint = conn.begin().await?;
        match papers::upsert_paper(&mut savepoint, &metadata).await {
            Ok(paper) => {
                if self.classify_inline(&mut savepoint, &paper).await? {
                    report.classified += 1;
                }
                savepoint.commit().await?;
                report.upserted += 1;
            }
            Err(e) => {
                warn!("论文 {} 写入失败，跳过: {}", metadata.uid, e);
                savepoint.rollback().await?;
                report.skipped += 1;
            }
        }
        Ok(())
    }

    async fn remove_record(&self, conn: &mut SqliteConnection, uid: &str, report: &mut SyncReport) -> GzResult<()> {
        let mut savepoint = conn.begin().await?;
        match papers::delete_paper(&mut savepoint, uid).await {
            Ok(removed) => {
                savepoint.commit().await?;
                if removed {
                    debug!("论文 {} 已在远端删除", uid);
                    report.deleted += 1;
                }
            }
            Err(e) => {
                warn!("论文 {} 删除失败，跳过: {}", uid, e);
                savepoint.rollback().await?;
                report.skipped += 1;
            }
        }
        Ok(())
    }

    async fn classify_inline(&self, conn: &mut SqliteConnection, paper: &Paper) -> GzResult<bool> {
        if paper.annotated {
            return Ok(false);
        }
        let text = document_text(paper.title.as_deref(), paper.description.as_deref());
        match self.classifier.predict_one(&text) {
            Some(sustainable) => papers::set_prediction(conn, &paper.uid, Some(sustainable)).await,
            None => Ok(false),
        }
    }

    /// 按标识符拉取单条记录并写入；记录已在远端删除时返回 `None`
    pub async fn fetch_one(&self, identifier: &str) -> GzResult<Option<Paper>> {
        let raw = self.client().get_record(identifier).await?;
        let normalizer = self.normalizer().await?;

        let mut tx = self.db.begin().await?;
        let paper = match normalizer.normalize(&raw)? {
            NormalizedRecord::Deleted(uid) => {
                papers::delete_paper(&mut tx, &uid).await?;
                None
            }
            NormalizedRecord::Paper(metadata) => {
                let paper = papers::upsert_paper(&mut tx, &metadata).await?;
                self.classify_inline(&mut tx, &paper).await?;
                papers::get_paper(&mut tx, &paper.uid).await?
            }
        };
        tx.commit().await.map_err(GzError::CommitError)?;
        Ok(paper)
    }

    /// 用全部已标注论文训练新模型并替换，然后重新分类所有未标注论文
    pub async fn retrain(&self) -> GzResult<usize> {
        let corpus = {
            let mut conn = self.db.pool().acquire().await?;
            papers::annotated_corpus(&mut conn).await?
        };
        self.classifier.train(&corpus)?;

        let mut tx = self.db.begin().await?;
        let documents = papers::unannotated_documents(&mut tx).await?;
        let texts: Vec<String> = documents.iter().map(|(_, text)| text.clone()).collect();
        let predictions = self.classifier.predict_batch(&texts);

        for ((uid, _), sustainable) in documents.iter().zip(predictions) {
            papers::set_prediction(&mut tx, uid, sustainable).await?;
        }
        tx.commit().await.map_err(GzError::CommitError)?;

        info!("重新分类 {} 篇未标注论文", documents.len());
        Ok(documents.len())
    }

    /// 启动时若已有标注数据则训练模型
    pub async fn train_if_possible(&self) -> GzResult<bool> {
        let corpus = {
            let mut conn = self.db.pool().acquire().await?;
            papers::annotated_corpus(&mut conn).await?
        };
        if corpus.is_empty() {
            warn!("没有已标注论文，分类器保持未训练状态");
            return Ok(false);
        }
        self.classifier.train(&corpus)?;
        Ok(true)
    }

    pub async fn refresh_institutes(&self) -> GzResult<usize> {
        vocabulary::load_institutes(&self.client(), &self.db, &self.config.harvester.institute_set_prefix).await
    }

    pub async fn refresh_resource_types(&self) -> GzResult<usize> {
        vocabulary::load_resource_types(&self.client(), &self.db, &self.config.harvester.resource_type_set_prefix).await
    }

    /// 处理设置修改的副作用
    ///
    /// `zora_url` 立即重建客户端；间隔类设置返回 `Reschedule`，由调度器执行。
    pub fn apply_setting_change(
        &self,
        name: SettingName,
        old: Option<&SettingValue>,
        new: &SettingValue,
    ) -> GzResult<SettingEffect> {
        if old == Some(new) {
            return Ok(SettingEffect::None);
        }

        let reschedule = |job| match new.as_int() {
            Some(days) => Ok(SettingEffect::Reschedule { job, days }),
            None => Err(GzError::SettingError(format!("{} 不是整数", name))),
        };

        let effect = match name {
            SettingName::ZoraUrl => {
                let url = new
                    .as_text()
                    .ok_or_else(|| GzError::SettingError(format!("{} 不是字符串", name)))?;
                let client = OaiClient::new(url, &self.config.harvester)?;
                *self.client.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(client);
                SettingEffect::ReconnectClient
            }
            SettingName::ZoraPullInterval => reschedule(JobKind::Pull)?,
            SettingName::InstituteUpdateInterval => reschedule(JobKind::Institutes)?,
            SettingName::ResourceTypeUpdateInterval => reschedule(JobKind::ResourceTypes)?,
            // 每次预留时读取
            SettingName::AnnotationTimeout => SettingEffect::None,
        };

        info!("设置 {} 已修改为 {}", name, new.to_storage());
        Ok(effect)
    }

    pub async fn update_setting(&self, name: SettingName, raw: &str) -> GzResult<SettingEffect> {
        let change = {
            let mut conn = self.db.pool().acquire().await?;
            settings::set_setting(&mut conn, name, raw).await?
        };
        self.apply_setting_change(change.name, change.old.as_ref(), &change.new)
    }

    /// 对比设置快照，处理其他进程写入的修改
    pub async fn poll_setting_changes(&self, last: &mut Vec<(String, String)>) -> GzResult<Vec<SettingEffect>> {
        let current = {
            let mut conn = self.db.pool().acquire().await?;
            settings::snapshot(&mut conn).await?
        };
        let previous: HashMap<&str, &str> = last.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let mut effects = Vec::new();
        for (key, value) in &current {
            let old_raw = previous.get(key.as_str()).copied();
            if old_raw == Some(value.as_str()) {
                continue;
            }
            let Ok(name) = key.parse::<SettingName>() else {
                debug!("忽略未知设置 {}", key);
                continue;
            };

            let new = SettingValue::parse(name.kind(), value).map_err(GzError::SettingError)?;
            let old = old_raw.and_then(|raw| SettingValue::parse(name.kind(), raw).ok());
            effects.push(self.apply_setting_change(name, old.as_ref(), &new)?);
        }

        *last = current;
        Ok(effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettingDefaults;
    use crate::crawler::FetchError;
    use crate::parser::Label;
use crate::storage::papers::tests::sample;
    use mockito::{Matcher, Server, ServerGuard};

    fn record_xml(id: &str, title: &str, subjects: &[&str]) -> String {
        let subjects: String = subjects.iter().map(|s| format!("<dc:subject>{}</dc:subject>", s)).collect();
        format!(
            r#"<record><header><identifier>{id}</identifier><datestamp>2018-01-01T00:00:00Z</datestamp></header>
            <metadata><oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/">
            <dc:title>{title}</dc:title><dc:creator>Muster, Hans</dc:creator>{subjects}
            <dc:date>2009-11-31</dc:date></oai_dc:dc></metadata></record>"#
        )
    }

    fn deleted_xml(id: &str) -> String {
        format!(r#"<record><header status="deleted"><identifier>{id}</identifier><datestamp>2018-01-01</datestamp></header></record>"#)
    }

    fn list_records(records: &[String], token: Option<&str>) -> String {
        let token = token.map(|t| format!("<resumptionToken>{}</resumptionToken>", t)).unwrap_or_default();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"><ListRecords>{}{}</ListRecords></OAI-PMH>"#,
            records.concat(),
            token
        )
    }

    fn no_records_match() -> String {
        r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"><error code="noRecordsMatch">nothing</error></OAI-PMH>"#.to_string()
    }

    async fn service_for(server: &ServerGuard, batch_size: usize) -> SyncService {
        let db = Database::in_memory().await;
        {
            let mut conn = db.pool().acquire().await.unwrap();
            settings::set_setting(&mut conn, SettingName::ZoraUrl, &format!("{}/oai", server.url()))
                .await
                .unwrap();
        }
        let mut config = AppConfig::default();
        config.harvester.max_retries = 1;
        config.harvester.retry_delay_ms = 0;
        config.harvester.timeout_secs = 5;
        config.storage.commit_batch_size = batch_size;
        SyncService::new(db, config).await.unwrap()
    }

    async fn count(service: &SyncService, sql: &str) -> i64 {
        let mut conn = service.database().pool().acquire().await.unwrap();
        sqlx::query_scalar(sql).fetch_one(&mut *conn).await.unwrap()
    }

    async fn checkpoint(service: &SyncService) -> Option<DateTime<Utc>> {
        let mut conn = service.database().pool().acquire().await.unwrap();
        settings::get_checkpoint(&mut conn).await.unwrap()
    }

    fn completed(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Completed(report) => report,
            SyncOutcome::Skipped => panic!("拉取被跳过"),
        }
    }

    fn verb(name: &str) -> Matcher {
        Matcher::UrlEncoded("verb".into(), name.into())
    }

    #[tokio::test]
    async fn pull_ingests_records_and_advances_checkpoint() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/oai")
            .match_query(verb("ListRecords"))
            .with_body(list_records(
                &[
                    record_xml("oai:1", "Solar power", &["330 Economics", "AI, ethics, policy"]),
                    record_xml("oai:2", "Wind power", &[]),
                    deleted_xml("oai:unknown"),
                ],
                None,
            ))
            .create_async()
            .await;
        let service = service_for(&server, 0).await;
        let before = Utc::now();

        let report = completed(service.run_pull().await.unwrap());
        assert_eq!(report.upserted, 2);
        assert_eq!(report.deleted, 0);
        assert_eq!(report.pages, 1);
        assert_eq!(service.state(), SyncState::Idle);

        let stored = checkpoint(&service).await.unwrap();
        assert!(stored >= before);
        assert_eq!(Some(stored), report.checkpoint);

        let mut conn = service.database().pool().acquire().await.unwrap();
        let detail = papers::load_detail(&mut conn, "oai:1").await.unwrap().unwrap();
        assert_eq!(detail.ddcs, vec!["330 Economics"]);
        assert_eq!(detail.keywords, vec!["AI", "ethics", "policy"]);
        assert_eq!(detail.paper.date, None);
        drop(conn);

        // 第二次拉取同一窗口不会产生重复数据
        completed(service.run_pull().await.unwrap());
        assert_eq!(count(&service, "SELECT COUNT(*) FROM papers").await, 2);
        assert_eq!(count(&service, "SELECT COUNT(*) FROM creators").await, 1);
        assert_eq!(count(&service, "SELECT COUNT(*) FROM paper_creators").await, 2);
        assert!(checkpoint(&service).await.unwrap() > stored);
    }

    #[tokio::test]
    async fn deleted_record_removes_paper_but_keeps_shared_entities() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/oai")
            .match_query(verb("ListRecords"))
            .with_body(list_records(&[deleted_xml("oai:1")], None))
            .create_async()
            .await;
        let service = service_for(&server, 0).await;
        {
            let mut conn = service.database().pool().acquire().await.unwrap();
            papers::upsert_paper(&mut conn, &sample("oai:1")).await.unwrap();
            papers::upsert_paper(&mut conn, &sample("oai:2")).await.unwrap();
        }

        let report = completed(service.run_pull().await.unwrap());
        assert_eq!(report.deleted, 1);
        assert_eq!(count(&service, "SELECT COUNT(*) FROM papers").await, 1);
        assert_eq!(count(&service, "SELECT COUNT(*) FROM creators").await, 2);
        assert_eq!(
            count(&service, "SELECT COUNT(*) FROM paper_keywords WHERE paper_uid = 'oai:1'").await,
            0
        );
    }

    #[tokio::test]
    async fn no_records_match_still_advances_checkpoint() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/oai")
            .match_query(verb("ListRecords"))
            .with_body(no_records_match())
            .create_async()
            .await;
        let service = service_for(&server, 0).await;

        let report = completed(service.run_pull().await.unwrap());
        assert_eq!(report.upserted, 0);
        assert!(checkpoint(&service).await.is_some());
    }

    #[tokio::test]
    async fn interrupted_pull_rolls_back_and_keeps_checkpoint() {
        let mut server = Server::new_async().await;
        let _first = server
            .mock("GET", "/oai")
            .match_query(Matcher::AllOf(vec![
                verb("ListRecords"),
                Matcher::UrlEncoded("metadataPrefix".into(), "oai_dc".into()),
            ]))
            .with_body(list_records(&[record_xml("oai:1", "One", &[])], Some("page2")))
            .create_async()
            .await;
        let _second = server
            .mock("GET", "/oai")
            .match_query(Matcher::UrlEncoded("resumptionToken".into(), "page2".into()))
            .with_status(503)
            .create_async()
            .await;
        let service = service_for(&server, 0).await;

        let err = service.run_pull().await.unwrap_err();
        assert!(matches!(err, GzError::FetchError(FetchError::Transient(_))));
        assert_eq!(service.state(), SyncState::Failed);
        assert!(checkpoint(&service).await.is_none());
        assert_eq!(count(&service, "SELECT COUNT(*) FROM papers").await, 0);
    }

    #[tokio::test]
    async fn sub_batches_commit_but_checkpoint_waits_for_the_window() {
        let mut server = Server::new_async().await;
        let _first = server
            .mock("GET", "/oai")
            .match_query(Matcher::AllOf(vec![
                verb("ListRecords"),
                Matcher::UrlEncoded("metadataPrefix".into(), "oai_dc".into()),
            ]))
            .with_body(list_records(
                &[record_xml("oai:1", "One", &[]), record_xml("oai:2", "Two", &[])],
                Some("page2"),
            ))
            .create_async()
            .await;
        let _second = server
            .mock("GET", "/oai")
            .match_query(Matcher::UrlEncoded("resumptionToken".into(), "page2".into()))
            .with_status(500)
            .create_async()
            .await;
        let service = service_for(&server, 1).await;

        assert!(service.run_pull().await.is_err());
        assert!(checkpoint(&service).await.is_none());
        assert_eq!(count(&service, "SELECT COUNT(*) FROM papers").await, 2);
    }

    #[tokio::test]
    async fn commit_failure_keeps_checkpoint_and_rerun_is_clean() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/oai")
            .match_query(verb("ListRecords"))
            .with_body(list_records(
                &[record_xml("oai:1", "One", &[]), record_xml("oai:2", "Two", &[])],
                None,
            ))
            .create_async()
            .await;
        let service = service_for(&server, 0).await;

        sqlx::query(
            r#"
            CREATE TRIGGER fail_checkpoint BEFORE UPDATE ON operation_parameters
            WHEN NEW.name = 'last_zora_pull'
            BEGIN SELECT RAISE(ABORT, 'disk full'); END
            "#,
        )
        .execute(service.database().pool())
        .await
        .unwrap();

        let err = service.run_pull().await.unwrap_err();
        assert!(matches!(err, GzError::CommitError(_)));
        assert_eq!(service.state(), SyncState::Failed);
        assert!(checkpoint(&service).await.is_none());
        assert_eq!(count(&service, "SELECT COUNT(*) FROM papers").await, 0);

        sqlx::query("DROP TRIGGER fail_checkpoint")
            .execute(service.database().pool())
            .await
            .unwrap();

        completed(service.run_pull().await.unwrap());
        assert!(checkpoint(&service).await.is_some());
        assert_eq!(count(&service, "SELECT COUNT(*) FROM papers").await, 2);
        assert_eq!(count(&service, "SELECT COUNT(*) FROM paper_creators").await, 2);
    }

    #[tokio::test]
    async fn failing_record_is_skipped_without_partial_writes() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/oai")
            .match_query(verb("ListRecords"))
            .with_body(list_records(
                &[
                    record_xml("oai:1", "Bad", &["poison"]),
                    record_xml("", "No identifier", &[]),
                    record_xml("oai:2", "Good", &["energy"]),
                ],
                None,
            ))
            .create_async()
            .await;
        let service = service_for(&server, 0).await;

        sqlx::query(
            r#"
            CREATE TRIGGER reject_poison BEFORE INSERT ON keywords
            WHEN NEW.name = 'poison'
            BEGIN SELECT RAISE(ABORT, 'rejected'); END
            "#,
        )
        .execute(service.database().pool())
        .await
        .unwrap();

        let report = completed(service.run_pull().await.unwrap());
        assert_eq!(report.upserted, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(count(&service, "SELECT COUNT(*) FROM papers").await, 1);
        // 失败记录创建的作者随保存点回滚，成功记录重新创建了一次
        assert_eq!(count(&service, "SELECT COUNT(*) FROM creators").await, 1);
        assert_eq!(count(&service, "SELECT COUNT(*) FROM keywords").await, 1);
    }

    #[tokio::test]
    async fn overlapping_pull_is_skipped() {
        let server = Server::new_async().await;
        let service = service_for(&server, 0).await;

        let _held = service.running.try_lock().unwrap();
        assert_eq!(service.run_pull().await.unwrap(), SyncOutcome::Skipped);
        assert!(checkpoint(&service).await.is_none());
    }

    #[tokio::test]
    async fn pull_classifies_unannotated_papers_only() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/oai")
            .match_query(verb("ListRecords"))
            .with_body(list_records(
                &[
                    record_xml("oai:1", "Renewable energy transition", &[]),
                    record_xml("oai:2", "Renewable energy policy", &[]),
                ],
                None,
            ))
            .create_async()
            .await;
        let service = service_for(&server, 0).await;
        {
            let mut conn = service.database().pool().acquire().await.unwrap();
            papers::upsert_paper(&mut conn, &sample("oai:2")).await.unwrap();
            papers::set_label(&mut conn, "oai:2", Label::annotated(false)).await.unwrap();
        }
        service
            .classifier()
            .train(&[
                ("Renewable energy | wind".to_string(), true),
                ("Roman law | history".to_string(), false),
            ])
            .unwrap();

        let report = completed(service.run_pull().await.unwrap());
        assert_eq!(report.classified, 1);

        let mut conn = service.database().pool().acquire().await.unwrap();
        let classified = papers::get_paper(&mut conn, "oai:1").await.unwrap().unwrap();
        assert_eq!(classified.sustainable, Some(true));
        assert!(!classified.annotated);

        let annotated = papers::get_paper(&mut conn, "oai:2").await.unwrap().unwrap();
        assert_eq!(annotated.sustainable, Some(false));
        assert!(annotated.annotated);
        assert_eq!(annotated.title.as_deref(), Some("Renewable energy policy"));
    }

    #[tokio::test]
    async fn untrained_classifier_leaves_label_unknown() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/oai")
            .match_query(verb("ListRecords"))
            .with_body(list_records(&[record_xml("oai:1", "Anything", &[])], None))
            .create_async()
            .await;
        let service = service_for(&server, 0).await;

        let report = completed(service.run_pull().await.unwrap());
        assert_eq!(report.classified, 0);
        assert!(!service.train_if_possible().await.unwrap());

        let mut conn = service.database().pool().acquire().await.unwrap();
        assert_eq!(papers::get_paper(&mut conn, "oai:1").await.unwrap().unwrap().sustainable, None);
    }

    #[tokio::test]
    async fn retrain_reclassifies_unannotated_papers() {
        let server = Server::new_async().await;
        let service = service_for(&server, 0).await;
        {
            let mut conn = service.database().pool().acquire().await.unwrap();
            for (uid, title, label) in [
                ("a", "Solar energy storage", Some(true)),
                ("b", "Medieval poetry", Some(false)),
                ("c", "Solar energy markets", None),
                ("d", "Poetry of the medieval court", None),
            ] {
                let mut meta = sample(uid);
                meta.title = Some(title.to_string());
                meta.description = None;
                meta.keywords.clear();
                meta.ddcs.clear();
                meta.label = label.map(Label::annotated);
                papers::upsert_paper(&mut conn, &meta).await.unwrap();
            }
        }

        assert_eq!(service.retrain().await.unwrap(), 2);

        let mut conn = service.database().pool().acquire().await.unwrap();
        assert_eq!(papers::get_paper(&mut conn, "c").await.unwrap().unwrap().sustainable, Some(true));
        assert_eq!(papers::get_paper(&mut conn, "d").await.unwrap().unwrap().sustainable, Some(false));
        assert_eq!(papers::get_paper(&mut conn, "a").await.unwrap().unwrap().sustainable, Some(true));
    }

    #[tokio::test]
    async fn fetch_one_stores_a_single_record() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/oai")
            .match_query(Matcher::AllOf(vec![
                verb("GetRecord"),
                Matcher::UrlEncoded("identifier".into(), "oai:9".into()),
            ]))
            .with_body(format!(
                r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"><GetRecord>{}</GetRecord></OAI-PMH>"#,
                record_xml("oai:9", "Single", &[])
            ))
            .create_async()
            .await;
        let service = service_for(&server, 0).await;

        let paper = service.fetch_one("oai:9").await.unwrap().unwrap();
        assert_eq!(paper.title.as_deref(), Some("Single"));
        assert!(checkpoint(&service).await.is_none());
    }

    #[tokio::test]
    async fn setting_changes_map_to_effects() {
        let server = Server::new_async().await;
        let service = service_for(&server, 0).await;

        assert_eq!(
            service.update_setting(SettingName::ZoraPullInterval, "3").await.unwrap(),
            SettingEffect::Reschedule { job: JobKind::Pull, days: 3 }
        );
        assert_eq!(
            service.update_setting(SettingName::InstituteUpdateInterval, "2").await.unwrap(),
            SettingEffect::Reschedule { job: JobKind::Institutes, days: 2 }
        );
        assert_eq!(
            service.update_setting(SettingName::AnnotationTimeout, "30").await.unwrap(),
            SettingEffect::None
        );
        assert_eq!(
            service.update_setting(SettingName::ZoraUrl, "http://mirror.example/oai").await.unwrap(),
            SettingEffect::ReconnectClient
        );
        assert_eq!(service.client().base_url(), "http://mirror.example/oai");

        // 值未变化时没有副作用
        assert_eq!(
            service.update_setting(SettingName::ZoraPullInterval, "3").await.unwrap(),
            SettingEffect::None
        );
    }

    #[tokio::test]
    async fn polling_picks_up_external_setting_changes() {
        let server = Server::new_async().await;
        let service = service_for(&server, 0).await;

        let mut last = {
            let mut conn = service.database().pool().acquire().await.unwrap();
            settings::snapshot(&mut conn).await.unwrap()
        };
        assert!(service.poll_setting_changes(&mut last).await.unwrap().is_empty());

        {
            let mut conn = service.database().pool().acquire().await.unwrap();
            settings::set_setting(&mut conn, SettingName::ResourceTypeUpdateInterval, "5")
                .await
                .unwrap();
        }
        assert_eq!(
            service.poll_setting_changes(&mut last).await.unwrap(),
            vec![SettingEffect::Reschedule { job: JobKind::ResourceTypes, days: 5 }]
        );
        assert!(service.poll_setting_changes(&mut last).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_deletion_is_skipped_and_window_commits() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/oai")
            .match_query(verb("ListRecords"))
            .with_body(list_records(&[deleted_xml("oai:1"), deleted_xml("oai:2")], None))
            .create_async()
            .await;
        let service = service_for(&server, 0).await;
        {
            let mut conn = service.database().pool().acquire().await.unwrap();
            papers::upsert_paper(&mut conn, &sample("oai:1")).await.unwrap();
            papers::upsert_paper(&mut conn, &sample("oai:2")).await.unwrap();
        }

        sqlx::query(
            r#"
            CREATE TRIGGER protect_paper BEFORE DELETE ON papers
            WHEN OLD.uid = 'oai:1'
            BEGIN SELECT RAISE(ABORT, 'locked'); END
            "#,
        )
        .execute(service.database().pool())
        .await
        .unwrap();

        let report = completed(service.run_pull().await.unwrap());
        assert_eq!(report.deleted, 1);
        assert_eq!(report.skipped, 1);
        assert!(checkpoint(&service).await.is_some());
        assert_eq!(count(&service, "SELECT COUNT(*) FROM papers WHERE uid = 'oai:1'").await, 1);
        assert_eq!(count(&service, "SELECT COUNT(*) FROM paper_creators WHERE paper_uid = 'oai:1'").await, 2);
        assert_eq!(count(&service, "SELECT COUNT(*) FROM papers WHERE uid = 'oai:2'").await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn other_writers_proceed_while_pages_are_fetched() {
        use sqlx::sqlite::SqliteConnectOptions;
        use sqlx::ConnectOptions;
        use std::time::Duration;

        let mut server = Server::new_async().await;
        let _first = server
            .mock("GET", "/oai")
            .match_query(Matcher::AllOf(vec![
                verb("ListRecords"),
                Matcher::UrlEncoded("metadataPrefix".into(), "oai_dc".into()),
            ]))
            .with_body(list_records(&[record_xml("oai:1", "One", &[])], Some("page2")))
            .create_async()
            .await;
        let _second = server
            .mock("GET", "/oai")
            .match_query(Matcher::UrlEncoded("resumptionToken".into(), "page2".into()))
            .with_body_from_request(|_| {
                std::thread::sleep(Duration::from_millis(1500));
                list_records(&[record_xml("oai:2", "Two", &[])], None).into_bytes()
            })
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("greenzora.db").display());
        let db = Database::new(&url).await.unwrap();
        db.init_schema().await.unwrap();
        db.initialize(&SettingDefaults::default(), &format!("{}/oai", server.url()))
            .await
            .unwrap();
        {
            let mut conn = db.pool().acquire().await.unwrap();
            papers::upsert_paper(&mut conn, &sample("oai:local")).await.unwrap();
        }
        let mut config = AppConfig::default();
        config.harvester.max_retries = 1;
        config.harvester.retry_delay_ms = 0;
        config.harvester.timeout_secs = 10;
        let service = SyncService::new(db, config).await.unwrap();

        // 独立连接，几乎不等待锁：写锁被占用时立即失败
        let writer = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let mut conn = url
                .parse::<SqliteConnectOptions>()
                .unwrap()
                .busy_timeout(Duration::from_millis(100))
                .connect()
                .await
                .unwrap();
            papers::set_label(&mut conn, "oai:local", Label::annotated(true)).await
        };

        let (pull, labelled) = tokio::join!(service.run_pull(), writer);
        assert!(labelled.unwrap());
        let report = completed(pull.unwrap());
        assert_eq!(report.upserted, 2);
        assert_eq!(report.pages, 2);

        let mut conn = service.database().pool().acquire().await.unwrap();
        let local = papers::get_paper(&mut conn, "oai:local").await.unwrap().unwrap();
        assert!(local.annotated);
    }
}
