use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;
use uuid::Uuid;

/// 调度器管理的周期任务
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Pull,
    Institutes,
    ResourceTypes,
    SettingsWatch,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobKind::Pull => "拉取",
            JobKind::Institutes => "机构更新",
            JobKind::ResourceTypes => "资源类型更新",
            JobKind::SettingsWatch => "设置监听",
        };
        f.write_str(name)
    }
}

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

struct Registered {
    id: Uuid,
    run: JobFn,
}

/// 周期任务调度，克隆后共享同一个调度器
#[derive(Clone)]
pub struct TaskScheduler {
    scheduler: JobScheduler,
    jobs: Arc<Mutex<HashMap<JobKind, Registered>>>,
}

pub fn every_days(n: i64) -> Duration {
    Duration::from_secs(n.max(1) as u64 * 24 * 60 * 60)
}

impl TaskScheduler {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn build_job(kind: JobKind, interval: Duration, run: JobFn) -> Result<Job> {
        let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let run = Arc::clone(&run);
            Box::pin(async move {
                info!("执行定时任务: {}", kind);
                run().await;
            })
        })?;
        Ok(job)
    }

    /// 注册按固定间隔执行的任务，同类任务已存在时替换
    pub async fn add_interval_job<F, Fut>(&self, kind: JobKind, interval: Duration, job_fn: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let run: JobFn = Arc::new(move || Box::pin(job_fn()) as JobFuture);
        self.register(kind, interval, run).await
    }

    async fn register(&self, kind: JobKind, interval: Duration, run: JobFn) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(old) = jobs.remove(&kind) {
            self.scheduler.remove(&old.id).await?;
        }

        let id = self
            .scheduler
            .add(Self::build_job(kind, interval, Arc::clone(&run))?)
            .await?;
        jobs.insert(kind, Registered { id, run });

        info!("已注册定时任务 {}，间隔 {} 秒", kind, interval.as_secs());
        Ok(())
    }

    /// 以新的间隔重新调度已注册的任务
    pub async fn reschedule(&self, kind: JobKind, interval: Duration) -> Result<()> {
        let run = {
            let jobs = self.jobs.lock().await;
            let registered = jobs.get(&kind).ok_or_else(|| anyhow!("任务 {} 未注册", kind))?;
            Arc::clone(&registered.run)
        };
        self.register(kind, interval, run).await
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await?;
        info!("任务调度器已启动");
        Ok(())
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.scheduler.shutdown().await?;
        info!("任务调度器已关闭");
        Ok(())
    }
}
