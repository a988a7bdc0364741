//! 同步协调器 - 按实体的准入控制与节流
//!
//! 每个内容域持有一个协调器实例，提供三件事：
//!
//! - **进行中登记**：`(站点, 实体)` 维度的进行中同步表。并发发起的
//!   同步收敛到同一个共享句柄，绝不会对同一实体跑两份工作。
//! - **运行到底**：工作一旦登记就 spawn 出去独立执行，调用方可以不
//!   等待，但无法中途取消。
//! - **节流**：记录每个实体最近一次同步时间，`is_sync_needed` 在最小
//!   重同步间隔内返回 false，让回前台之类的触发变得廉价。
//!
//! 「检查成员 → 登记」之间不允许出现 await 点，登记表用同步锁保护；
//! 这是至多一个进行中同步这一不变量的全部依赖。

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::{CampusSDKError, Result};
use crate::storage::kv::KvStore;
use crate::sync::SyncEntityId;

/// 默认最小重同步间隔（秒）
pub const DEFAULT_MIN_RESYNC_SECS: i64 = 300;

/// 进行中同步的共享句柄：多次 await 得到同一份结果
pub type SyncHandle<R> = Shared<BoxFuture<'static, Result<R>>>;

type OngoingKey = (String, SyncEntityId);

/// 同步协调器，每个内容域一个实例
#[derive(Clone)]
pub struct SyncCoordinator<R>
where
    R: Clone + Send + Sync + 'static,
{
    component: &'static str,
    min_resync_secs: i64,
    kv: Arc<KvStore>,
    ongoing: Arc<Mutex<HashMap<OngoingKey, SyncHandle<R>>>>,
}

impl<R> SyncCoordinator<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new(component: &'static str, kv: Arc<KvStore>) -> Self {
        Self {
            component,
            min_resync_secs: DEFAULT_MIN_RESYNC_SECS,
            kv,
            ongoing: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 覆盖最小重同步间隔
    pub fn with_min_resync_secs(mut self, secs: i64) -> Self {
        self.min_resync_secs = secs;
        self
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    fn sync_time_key(&self, entity: &SyncEntityId) -> String {
        format!("sync_time:{}:{}", self.component, entity)
    }

    /// 实体是否有进行中的同步
    pub fn is_syncing(&self, entity: &SyncEntityId, site_id: &str) -> bool {
        self.ongoing
            .lock()
            .contains_key(&(site_id.to_string(), entity.clone()))
    }

    /// 取进行中同步的共享句柄
    pub fn get_ongoing_sync(&self, entity: &SyncEntityId, site_id: &str) -> Option<SyncHandle<R>> {
        self.ongoing
            .lock()
            .get(&(site_id.to_string(), entity.clone()))
            .cloned()
    }

    /// 登记一次同步并返回共享句柄
    ///
    /// 工作被 spawn 出去独立执行：即使没有任何调用方 await 句柄，它也
    /// 会运行到结束（成功、丢弃耗尽或传输失败），结束后自动从登记表
    /// 移除。登记发生在本函数返回之前，期间没有 await 点。
    pub fn add_ongoing_sync<F>(&self, entity: &SyncEntityId, site_id: &str, work: F) -> SyncHandle<R>
    where
        F: Future<Output = Result<R>> + Send + 'static,
    {
        let key: OngoingKey = (site_id.to_string(), entity.clone());

        let task = tokio::spawn(work);
        let handle: SyncHandle<R> = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(CampusSDKError::Runtime(format!("同步任务异常退出: {}", e))),
            }
        }
        .boxed()
        .shared();

        {
            let mut ongoing = self.ongoing.lock();
            ongoing.insert(key.clone(), handle.clone());
        }

        // 工作结束后移除登记
        let ongoing = Arc::clone(&self.ongoing);
        let settle_watcher = handle.clone();
        tokio::spawn(async move {
            let _ = settle_watcher.await;
            ongoing.lock().remove(&key);
        });

        handle
    }

    /// 最近一次同步时间（Unix 秒，无记录时为 0）
    pub async fn get_sync_time(&self, entity: &SyncEntityId, site_id: &str) -> i64 {
        match self.kv.get::<i64>(site_id, &self.sync_time_key(entity)).await {
            Ok(Some(ts)) => ts,
            Ok(None) => 0,
            Err(e) => {
                debug!("读取同步时间失败，按未同步处理: {}", e);
                0
            }
        }
    }

    /// 距离上次同步是否已超过最小重同步间隔
    pub async fn is_sync_needed(&self, entity: &SyncEntityId, site_id: &str) -> bool {
        let last = self.get_sync_time(entity, site_id).await;
        if last == 0 {
            return true;
        }
        chrono::Utc::now().timestamp() - last >= self.min_resync_secs
    }

    /// 记录本次同步时间
    ///
    /// 写入失败只会导致将来多一次同步，不会丢数据，所以吞掉错误。
    pub async fn record_sync_time(&self, entity: &SyncEntityId, site_id: &str) {
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = self.kv.set(site_id, &self.sync_time_key(entity), &now).await {
            debug!("记录同步时间失败: {}", e);
        }
    }
}
