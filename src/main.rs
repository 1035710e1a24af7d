mod classifier;
mod config;
mod crawler;
mod parser;
mod storage;
mod sync;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use config::{AppConfig, SettingName, CONFIG_PATH};
use storage::{settings, stats, Database};
use sync::annotation::{AnnotationDesk, Submission};
use sync::legacy::{self, LegacyImport};
use sync::{SettingEffect, SyncOutcome, SyncService};
use utils::logger;
use utils::scheduler::{every_days, JobKind, TaskScheduler};

const SETTINGS_POLL_SECS: u64 = 60;

#[derive(Parser)]
#[command(name = "greenzora")]
#[command(about = "ZORA 论文元数据同步与可持续性分类", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 初始化配置和数据库
    Init,
    /// 增量拉取远端记录
    Pull {
        /// 只拉取指定标识符的记录
        #[arg(long)]
        id: Option<String>,
    },
    /// 更新机构层级和资源类型
    Vocab,
    /// 导入旧系统的人工标注
    ImportLegacy {
        /// JSON 文件路径，默认取配置中的路径
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
    /// 重新训练分类模型并重新分类未标注论文
    Retrain,
    /// 启动定时任务
    Schedule,
    /// 在终端中人工标注论文
    Annotate {
        /// 本次标注的篇数
        #[arg(short, long, default_value_t = 10)]
        count: usize,
    },
    /// 查看或修改运行设置
    Setting {
        name: Option<String>,
        value: Option<String>,
    },
    /// 生成统计报告
    Report {
        /// 输出路径，默认 data/reports/statistics_<日期>.json
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_logger();
    info!("greenzora 启动");

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => init_command().await?,
        Commands::Pull { id } => pull_command(id).await?,
        Commands::Vocab => vocab_command().await?,
        Commands::ImportLegacy { path } => import_legacy_command(path).await?,
        Commands::Retrain => retrain_command().await?,
        Commands::Schedule => schedule_command().await?,
        Commands::Annotate { count } => annotate_command(count).await?,
        Commands::Setting { name, value } => setting_command(name, value).await?,
        Commands::Report { output } => report_command(output).await?,
    }

    Ok(())
}

/// 打开数据库；表结构和默认设置的写入都是幂等的
async fn open_database(config: &AppConfig) -> Result<Database> {
    if let Some(dir) = Path::new(&config.storage.database_path).parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let db = Database::new(&config.database_url()).await?;
    db.init_schema().await?;
    db.initialize(&config.defaults, &config.harvester.base_url).await?;
    Ok(db)
}

async fn open_service() -> Result<SyncService> {
    let config = AppConfig::load()?;
    let db = open_database(&config).await?;
    Ok(SyncService::new(db, config).await?)
}

async fn init_command() -> Result<()> {
    info!("初始化系统...");

    tokio::fs::create_dir_all("data/reports").await?;
    tokio::fs::create_dir_all("config").await?;

    if Path::new(CONFIG_PATH).exists() {
        info!("配置文件已存在，保留: {}", CONFIG_PATH);
    } else {
        AppConfig::default().save(CONFIG_PATH)?;
        info!("已生成配置文件: {}", CONFIG_PATH);
    }

    let config = AppConfig::load()?;
    info!("正在初始化数据库: {}", config.database_url());
    open_database(&config).await?;

    info!("✅ 系统初始化完成！");
    info!("下一步:");
    info!("  1. 编辑 {} 确认远端地址", CONFIG_PATH);
    info!("  2. 运行 'greenzora vocab' 获取机构和资源类型");
    info!("  3. 运行 'greenzora pull' 开始同步");

    Ok(())
}

async fn pull_command(id: Option<String>) -> Result<()> {
    let service = open_service().await?;
    service.train_if_possible().await?;

    if let Some(id) = id {
        match service.fetch_one(&id).await? {
            Some(paper) => info!("论文 {} 已更新: {}", paper.uid, paper.title.unwrap_or_default()),
            None => info!("论文 {} 已在远端删除", id),
        }
        return Ok(());
    }

    match service.run_pull().await? {
        SyncOutcome::Completed(report) => info!("✅ 同步完成，写入 {} 篇", report.upserted),
        SyncOutcome::Skipped => info!("已有同步在进行"),
    }
    Ok(())
}

async fn vocab_command() -> Result<()> {
    let service = open_service().await?;
    let created = service.refresh_institutes().await?;
    let types = service.refresh_resource_types().await?;
    info!("✅ 词表更新完成: 新建 {} 个机构，共 {} 个资源类型", created, types);
    Ok(())
}

async fn import_legacy_command(path: Option<PathBuf>) -> Result<()> {
    let config = AppConfig::load()?;
    let db = open_database(&config).await?;
    let path = path.unwrap_or_else(|| PathBuf::from(&config.annotation.legacy_annotations_path));

    match legacy::import_legacy_annotations(&db, &path).await? {
        LegacyImport::AlreadyImported => info!("旧标注此前已导入"),
        LegacyImport::Imported { relabelled, created } => {
            info!("✅ 旧标注导入完成: 更新 {} 篇，新建 {} 篇", relabelled, created)
        }
    }
    Ok(())
}

async fn retrain_command() -> Result<()> {
    let service = open_service().await?;
    let reclassified = service.retrain().await?;
    info!("✅ 模型已重建，重新分类 {} 篇论文", reclassified);
    Ok(())
}

/// 首次启动的准备：词表、旧标注、模型
async fn bootstrap(service: &SyncService, config: &AppConfig) {
    if let Err(e) = service.refresh_institutes().await {
        warn!("机构更新失败: {}", e);
    }
    if let Err(e) = service.refresh_resource_types().await {
        warn!("资源类型更新失败: {}", e);
    }

    let legacy_path = Path::new(&config.annotation.legacy_annotations_path);
    if legacy_path.exists() {
        if let Err(e) = legacy::import_legacy_annotations(service.database(), legacy_path).await {
            warn!("旧标注导入失败: {}", e);
        }
    }

    if let Err(e) = service.train_if_possible().await {
        warn!("模型训练失败: {}", e);
    }
}

async fn handle_effect(scheduler: &TaskScheduler, effect: SettingEffect) {
    if let SettingEffect::Reschedule { job, days } = effect {
        match scheduler.reschedule(job, every_days(days)).await {
            Ok(()) => info!("任务 {} 已改为每 {} 天执行", job, days),
            Err(e) => error!("任务 {} 重新调度失败: {}", job, e),
        }
    }
}

async fn schedule_command() -> Result<()> {
    info!("启动定时任务调度器...");

    let config = AppConfig::load()?;
    let db = open_database(&config).await?;
    let service = Arc::new(SyncService::new(db.clone(), config.clone()).await?);
    bootstrap(&service, &config).await;

    let (pull_days, institute_days, resource_type_days, snapshot) = {
        let mut conn = db.pool().acquire().await?;
        (
            settings::get_int(&mut conn, SettingName::ZoraPullInterval).await?,
            settings::get_int(&mut conn, SettingName::InstituteUpdateInterval).await?,
            settings::get_int(&mut conn, SettingName::ResourceTypeUpdateInterval).await?,
            settings::snapshot(&mut conn).await?,
        )
    };

    let scheduler = TaskScheduler::new().await?;

    let svc = Arc::clone(&service);
    scheduler
        .add_interval_job(JobKind::Pull, every_days(pull_days), move || {
            let svc = Arc::clone(&svc);
            async move {
                if let Err(e) = svc.run_pull().await {
                    error!("定时拉取失败: {}", e);
                }
            }
        })
        .await?;

    let svc = Arc::clone(&service);
    scheduler
        .add_interval_job(JobKind::Institutes, every_days(institute_days), move || {
            let svc = Arc::clone(&svc);
            async move {
                if let Err(e) = svc.refresh_institutes().await {
                    error!("机构更新失败: {}", e);
                }
            }
        })
        .await?;

    let svc = Arc::clone(&service);
    scheduler
        .add_interval_job(JobKind::ResourceTypes, every_days(resource_type_days), move || {
            let svc = Arc::clone(&svc);
            async move {
                if let Err(e) = svc.refresh_resource_types().await {
                    error!("资源类型更新失败: {}", e);
                }
            }
        })
        .await?;

    // 其他进程（setting 命令）修改的设置由这里生效
    let svc = Arc::clone(&service);
    let handle = scheduler.clone();
    let last = Arc::new(tokio::sync::Mutex::new(snapshot));
    scheduler
        .add_interval_job(JobKind::SettingsWatch, Duration::from_secs(SETTINGS_POLL_SECS), move || {
            let svc = Arc::clone(&svc);
            let handle = handle.clone();
            let last = Arc::clone(&last);
            async move {
                let mut last = last.lock().await;
                match svc.poll_setting_changes(&mut last).await {
                    Ok(effects) => {
                        for effect in effects {
                            handle_effect(&handle, effect).await;
                        }
                    }
                    Err(e) => error!("读取设置失败: {}", e),
                }
            }
        })
        .await?;

    scheduler.start().await?;

    if let Err(e) = service.run_pull().await {
        error!("启动时拉取失败: {}", e);
    }

    info!("调度器运行中，按 Ctrl+C 停止");

    tokio::signal::ctrl_c().await?;
    info!("收到停止信号");

    scheduler.shutdown().await?;
    Ok(())
}

async fn annotate_command(count: usize) -> Result<()> {
    let config = AppConfig::load()?;
    let db = open_database(&config).await?;
    let desk = AnnotationDesk::new(db);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    for _ in 0..count {
        let Some(detail) = desk.reserve_next().await? else {
            info!("没有待标注的论文");
            break;
        };

        println!("\n[{}] {}", detail.paper.uid, detail.paper.title.as_deref().unwrap_or("(无标题)"));
        if !detail.creators.is_empty() {
            println!("作者: {}", detail.creators.join("; "));
        }
        println!("{}", detail.paper.description.as_deref().unwrap_or("(无摘要)"));
        println!("可持续? [y/n/q]");

        let Some(answer) = lines.next_line().await? else {
            break;
        };
        let sustainable = match answer.trim() {
            "y" | "Y" => true,
            "n" | "N" => false,
            _ => break,
        };

        match desk.submit(&detail.paper.uid, sustainable).await? {
            Submission::Accepted => info!("已保存"),
            Submission::Expired => warn!("预留已过期，标注未保存"),
        }
    }

    Ok(())
}

async fn setting_command(name: Option<String>, value: Option<String>) -> Result<()> {
    let config = AppConfig::load()?;
    let db = open_database(&config).await?;
    let mut conn = db.pool().acquire().await?;

    let Some(name) = name else {
        for (name, value) in settings::snapshot(&mut conn).await? {
            println!("{} = {}", name, value);
        }
        return Ok(());
    };

    let name = SettingName::from_str(&name).map_err(|e| anyhow::anyhow!(e))?;
    match value {
        None => {
            let current = settings::get_setting(&mut conn, name).await?;
            println!("{} = {}", name, current.map(|v| v.to_storage()).unwrap_or_default());
        }
        Some(raw) => {
            let change = settings::set_setting(&mut conn, name, &raw).await?;
            info!(
                "设置 {}: {} -> {}",
                name,
                change.old.map(|v| v.to_storage()).unwrap_or_default(),
                change.new.to_storage()
            );
            info!("运行中的调度器会在 {} 秒内应用该修改", SETTINGS_POLL_SECS);
        }
    }
    Ok(())
}

async fn report_command(output: Option<PathBuf>) -> Result<()> {
    let config = AppConfig::load()?;
    let db = open_database(&config).await?;
    let mut conn = db.pool().acquire().await?;

    let report = stats::build_report(&mut conn).await?;
    let output = output.unwrap_or_else(|| {
        let date = chrono::Local::now().format("%Y-%m-%d");
        PathBuf::from(format!("data/reports/statistics_{}.json", date))
    });
    if let Some(dir) = output.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(&output, serde_json::to_string_pretty(&report)?).await?;

    info!(
        "✅ 报告已生成: {} ({} 篇论文，其中 {} 篇可持续)",
        output.display(),
        report.total_papers,
        report.sustainable_papers
    );
    Ok(())
}
