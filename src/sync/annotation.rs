use chrono::Duration;
use tracing::{debug, info};

use crate::config::SettingName;
use crate::parser::Label;
use crate::storage::cache::Cache;
use crate::storage::models::PaperDetail;
use crate::storage::{papers, settings, Database};
use crate::utils::GzResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    /// 预留已过期或从未预留
    Expired,
}

/// 人工标注台：随机分配未标注论文，预留到 `annotation_timeout` 分钟后过期
#[derive(Clone)]
pub struct AnnotationDesk {
    db: Database,
    reservations: Cache<()>,
}

impl AnnotationDesk {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            reservations: Cache::new(),
        }
    }

    /// 预留一篇未被他人预留的未标注论文；没有可分配的论文时返回 `None`
    pub async fn reserve_next(&self) -> GzResult<Option<PaperDetail>> {
        self.reservations.clear_expired();
        let reserved = self.reservations.live_keys();

        let mut conn = self.db.pool().acquire().await?;
        let timeout = settings::get_int(&mut conn, SettingName::AnnotationTimeout).await?;

        // 多取 reserved.len() 篇，保证至少有一篇未被预留
        let candidates = papers::random_unannotated(&mut conn, reserved.len() + 1).await?;
        let Some(uid) = candidates.into_iter().find(|uid| !reserved.contains(uid)) else {
            return Ok(None);
        };

        self.reservations.insert(uid.clone(), (), Duration::minutes(timeout));
        debug!("论文 {} 已预留 {} 分钟", uid, timeout);
        papers::load_detail(&mut conn, &uid).await
    }

    pub async fn submit(&self, uid: &str, sustainable: bool) -> GzResult<Submission> {
        if self.reservations.take(uid).is_none() {
            debug!("论文 {} 的预留已过期", uid);
            return Ok(Submission::Expired);
        }

        let mut conn = self.db.pool().acquire().await?;
        papers::set_label(&mut conn, uid, Label::annotated(sustainable)).await?;
        info!("论文 {} 已标注为 {}", uid, if sustainable { "可持续" } else { "不可持续" });
        Ok(Submission::Accepted)
    }

    pub fn is_reserved(&self, uid: &str) -> bool {
        self.reservations.contains(uid)
    }

    #[cfg(test)]
    fn expire(&self, uid: &str) {
        self.reservations.insert(uid, (), Duration::seconds(-1));
    }
}
