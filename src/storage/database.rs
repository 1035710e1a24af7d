use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::info;

use crate::config::SettingDefaults;
use crate::storage::settings::{self, params};
use crate::utils::GzResult;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS publishers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS languages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resource_types (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS keywords (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS creators (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        first_name TEXT NOT NULL DEFAULT '',
        last_name TEXT NOT NULL,
        UNIQUE(first_name, last_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS institutes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        parent_id INTEGER REFERENCES institutes(id)
    )
    "#,
    // 同名机构可以挂在不同父节点下
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_institutes_name_parent ON institutes(name, COALESCE(parent_id, 0))",
    r#"
    CREATE TABLE IF NOT EXISTS ddcs (
        dewey_number INTEGER PRIMARY KEY,
        name TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS papers (
        uid TEXT PRIMARY KEY,
        title TEXT,
        description TEXT,
        publisher_id INTEGER REFERENCES publishers(id),
        date TEXT,
        language_id INTEGER REFERENCES languages(id),
        relation TEXT,
        sustainable INTEGER,
        annotated INTEGER NOT NULL DEFAULT 0,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
        CHECK (annotated = 0 OR sustainable IS NOT NULL)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS paper_creators (
        paper_uid TEXT NOT NULL REFERENCES papers(uid) ON DELETE CASCADE,
        creator_id INTEGER NOT NULL REFERENCES creators(id),
        position INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (paper_uid, creator_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS paper_institutes (
        paper_uid TEXT NOT NULL REFERENCES papers(uid) ON DELETE CASCADE,
        institute_id INTEGER NOT NULL REFERENCES institutes(id),
        PRIMARY KEY (paper_uid, institute_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS paper_ddcs (
        paper_uid TEXT NOT NULL REFERENCES papers(uid) ON DELETE CASCADE,
        dewey_number INTEGER NOT NULL REFERENCES ddcs(dewey_number),
        PRIMARY KEY (paper_uid, dewey_number)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS paper_keywords (
        paper_uid TEXT NOT NULL REFERENCES papers(uid) ON DELETE CASCADE,
        keyword_id INTEGER NOT NULL REFERENCES keywords(id),
        PRIMARY KEY (paper_uid, keyword_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS paper_resource_types (
        paper_uid TEXT NOT NULL REFERENCES papers(uid) ON DELETE CASCADE,
        resource_type_id INTEGER NOT NULL REFERENCES resource_types(id),
        PRIMARY KEY (paper_uid, resource_type_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        name TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        type_name TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS operation_parameters (
        name TEXT PRIMARY KEY,
        value TEXT,
        type_name TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_papers_annotated ON papers(annotated)",
];

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> GzResult<Self> {
        // 确保使用create_if_missing选项
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(
                database_url
                    .parse::<SqliteConnectOptions>()?
                    .create_if_missing(true)
                    .foreign_keys(true),
            )
            .await?;

        info!("数据库连接成功: {}", database_url);
        Ok(Self { pool })
    }

    /// 单连接内存库，测试专用
    #[cfg(test)]
    pub async fn in_memory() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Self { pool };
        db.init_schema().await.unwrap();
        db.initialize(&SettingDefaults::default(), "http://localhost/oai")
            .await
            .unwrap();
        db
    }

    pub async fn init_schema(&self) -> GzResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("数据库表结构初始化完成");
        Ok(())
    }

    /// 首次启动时写入默认设置和运行参数，已初始化则跳过
    pub async fn initialize(&self, defaults: &SettingDefaults, zora_url: &str) -> GzResult<()> {
        let mut tx = self.pool.begin().await?;

        if settings::get_flag(&mut tx, params::DATABASE_INITIALIZED).await? {
            info!("数据库已初始化，跳过默认值写入");
            return Ok(());
        }

        for (name, value) in defaults.entries(zora_url) {
            settings::insert_default_setting(&mut tx, name, &value).await?;
        }
        settings::insert_default_parameters(&mut tx).await?;
        settings::set_flag(&mut tx, params::DATABASE_INITIALIZED, true).await?;

        tx.commit().await?;
        info!("默认设置与运行参数已写入");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> GzResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_and_initialization_are_idempotent() {
        let db = Database::in_memory().await;

        db.init_schema().await.unwrap();
        db.initialize(&SettingDefaults::default(), "http://elsewhere/oai")
            .await
            .unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        let url = settings::get_setting(&mut conn, crate::config::SettingName::ZoraUrl)
            .await
            .unwrap();
        assert_eq!(url, Some(settings::SettingValue::Text("http://localhost/oai".into())));
        assert!(settings::get_checkpoint(&mut conn).await.unwrap().is_none());
        assert!(!settings::get_flag(&mut conn, params::LEGACY_ANNOTATIONS_IMPORTED).await.unwrap());
    }

    #[tokio::test]
    async fn annotated_paper_requires_a_label() {
        let db = Database::in_memory().await;
        let result = sqlx::query("INSERT INTO papers (uid, sustainable, annotated) VALUES ('x', NULL, 1)")
            .execute(db.pool())
            .await;
        assert!(result.is_err());
    }
}
