//! Wiki 域同步服务
//!
//! 队列内容是离线新建的 Wiki 页面，同步实体是子 Wiki。子 Wiki 可能在
//! 服务端尚不存在（首次给某个分组建页面），此时实体由
//! (wiki, user, group) 三元组标识。页面标题在子 Wiki 内唯一：发送前用
//! 服务端页面列表做基线，撞标题的页面按冲突丢弃。
//!
//! 结果里除了通用的 updated/warnings，还带上创建成功与被丢弃的页面
//! 清单，编辑页用它决定跳转到哪个新页面。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::{CampusSDKError, Result};
use crate::events::EventManager;
use crate::network::NetworkMonitor;
use crate::storage::offline::{MutationRecord, OfflineMutationStore};
use crate::sync::coordinator::SyncCoordinator;
use crate::sync::scheduler::SyncAgent;
use crate::sync::{offline_data_deleted_warning, SyncBlockRegistry, SyncEntityId, SyncResult};

pub const COMPONENT: &str = "mod_wiki";
const COMPONENT_NAME: &str = "Wiki";

/// 计算子 Wiki 的同步实体键
pub fn subwiki_entity(subwiki_id: u64, wiki_id: u64, user_id: u64, group_id: u64) -> SyncEntityId {
    if subwiki_id > 0 {
        SyncEntityId::Subwiki(subwiki_id)
    } else {
        SyncEntityId::WikiUserGroup {
            wiki_id,
            user_id,
            group_id,
        }
    }
}

/// 离线新建的 Wiki 页面
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WikiNewPageRecord {
    /// 0 表示子 Wiki 尚未在服务端创建
    pub subwiki_id: u64,
    pub wiki_id: u64,
    pub user_id: u64,
    pub group_id: u64,
    pub title: String,
    pub content: String,
    pub created_at: i64,
}

impl MutationRecord for WikiNewPageRecord {
    fn entity_id(&self) -> SyncEntityId {
        subwiki_entity(self.subwiki_id, self.wiki_id, self.user_id, self.group_id)
    }

    fn mutation_key(&self) -> String {
        format!("page:{}", self.title)
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }
}

/// 服务端页面（基线）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WikiServerPage {
    pub id: u64,
    pub title: String,
}

/// Wiki 域服务端接口
#[async_trait]
pub trait WikiApi: Send + Sync {
    /// 子 Wiki 当前页面列表（冲突基线）。子 Wiki 不存在时返回空列表。
    async fn get_subwiki_pages(
        &self,
        site_id: &str,
        subwiki_id: u64,
        wiki_id: u64,
        user_id: u64,
        group_id: u64,
    ) -> Result<Vec<WikiServerPage>>;

    /// 新建页面，返回页面 id
    #[allow(clippy::too_many_arguments)]
    async fn new_page(
        &self,
        site_id: &str,
        title: &str,
        content: &str,
        subwiki_id: u64,
        wiki_id: u64,
        user_id: u64,
        group_id: u64,
    ) -> Result<u64>;

    async fn invalidate_subwiki(&self, site_id: &str, wiki_id: u64) -> Result<()>;
}

/// 创建成功的页面
#[derive(Debug, Clone, PartialEq)]
pub struct WikiCreatedPage {
    pub page_id: u64,
    pub title: String,
}

/// 被丢弃的页面及原因
#[derive(Debug, Clone, PartialEq)]
pub struct WikiDiscardedPage {
    pub title: String,
    pub warning: String,
}

/// Wiki 同步结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WikiSyncResult {
    pub updated: bool,
    pub warnings: Vec<String>,
    pub created: Vec<WikiCreatedPage>,
    pub discarded: Vec<WikiDiscardedPage>,
}

impl WikiSyncResult {
    fn as_sync_result(&self) -> SyncResult {
        SyncResult {
            updated: self.updated,
            warnings: self.warnings.clone(),
        }
    }
}

/// Wiki 域同步服务
#[derive(Clone)]
pub struct WikiSyncService {
    coordinator: SyncCoordinator<WikiSyncResult>,
    blocks: Arc<SyncBlockRegistry>,
    pages: Arc<dyn OfflineMutationStore<WikiNewPageRecord>>,
    api: Arc<dyn WikiApi>,
    network: Arc<NetworkMonitor>,
    events: Arc<EventManager>,
}

impl WikiSyncService {
    pub fn new(
        coordinator: SyncCoordinator<WikiSyncResult>,
        blocks: Arc<SyncBlockRegistry>,
        pages: Arc<dyn OfflineMutationStore<WikiNewPageRecord>>,
        api: Arc<dyn WikiApi>,
        network: Arc<NetworkMonitor>,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            coordinator,
            blocks,
            pages,
            api,
            network,
            events,
        }
    }

    /// 同步站点内全部子 Wiki 的离线页面
    pub async fn sync_all_wikis(&self, site_id: &str, force: bool) -> Result<()> {
        // 一个实体可能对应多条页面记录，pending_entities 已去重
        for entity in self.pages.pending_entities(site_id).await? {
            let records = self.pages.get_pending(site_id, &entity).await?;
            let Some(first) = records.first() else {
                continue;
            };
            let (subwiki_id, wiki_id, user_id, group_id) =
                (first.subwiki_id, first.wiki_id, first.user_id, first.group_id);

            let outcome = if force {
                self.sync_subwiki(site_id, subwiki_id, wiki_id, user_id, group_id)
                    .await
                    .map(Some)
            } else {
                self.sync_subwiki_if_needed(site_id, subwiki_id, wiki_id, user_id, group_id)
                    .await
            };

            match outcome {
                Ok(Some(result)) if result.updated => {
                    self.events
                        .emit_sync_completed(COMPONENT, site_id, &entity, &result.as_sync_result());
                }
                Ok(_) => {}
                Err(e) if e.is_sync_blocked() => {
                    debug!("子 Wiki {} 被编辑锁占用，本轮跳过", entity);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    pub async fn sync_subwiki_if_needed(
        &self,
        site_id: &str,
        subwiki_id: u64,
        wiki_id: u64,
        user_id: u64,
        group_id: u64,
    ) -> Result<Option<WikiSyncResult>> {
        let entity = subwiki_entity(subwiki_id, wiki_id, user_id, group_id);
        if self.coordinator.is_sync_needed(&entity, site_id).await {
            return self
                .sync_subwiki(site_id, subwiki_id, wiki_id, user_id, group_id)
                .await
                .map(Some);
        }
        Ok(None)
    }

    /// 同步一个子 Wiki 的离线新页面
    pub async fn sync_subwiki(
        &self,
        site_id: &str,
        subwiki_id: u64,
        wiki_id: u64,
        user_id: u64,
        group_id: u64,
    ) -> Result<WikiSyncResult> {
        let entity = subwiki_entity(subwiki_id, wiki_id, user_id, group_id);

        if self.blocks.is_blocked(COMPONENT, &entity, site_id) {
            debug!("子 Wiki {} 正在编辑中，无法同步", entity);
            return Err(CampusSDKError::SyncBlocked {
                component: COMPONENT.to_string(),
                entity: entity.to_string(),
            });
        }

        if let Some(ongoing) = self.coordinator.get_ongoing_sync(&entity, site_id) {
            return ongoing.await;
        }

        debug!("尝试同步子 Wiki {} @ {}", entity, site_id);

        let this = self.clone();
        let site = site_id.to_string();
        let work =
            async move { this.perform_sync(&site, subwiki_id, wiki_id, user_id, group_id).await };

        self.coordinator.add_ongoing_sync(&entity, site_id, work).await
    }

    async fn perform_sync(
        &self,
        site_id: &str,
        subwiki_id: u64,
        wiki_id: u64,
        user_id: u64,
        group_id: u64,
    ) -> Result<WikiSyncResult> {
        let entity = subwiki_entity(subwiki_id, wiki_id, user_id, group_id);
        let mut result = WikiSyncResult::default();

        let records = self.pages.get_pending(site_id, &entity).await?;
        if records.is_empty() {
            self.coordinator.record_sync_time(&entity, site_id).await;
            return Ok(result);
        }

        if !self.network.is_online().await {
            return Err(CampusSDKError::Offline);
        }

        // 冲突基线：子 Wiki 当前页面标题
        let server_pages = self
            .api
            .get_subwiki_pages(site_id, subwiki_id, wiki_id, user_id, group_id)
            .await?;

        let outcome: Result<()> = async {
            for record in &records {
                self.send_page(site_id, &entity, record, &server_pages, &mut result)
                    .await?;
            }
            Ok(())
        }
        .await;

        if outcome.is_ok() && result.updated {
            if let Err(e) = self.api.invalidate_subwiki(site_id, wiki_id).await {
                debug!("失效子 Wiki 缓存失败: {}", e);
            }
        }

        self.coordinator.record_sync_time(&entity, site_id).await;

        outcome?;
        Ok(result)
    }

    async fn send_page(
        &self,
        site_id: &str,
        entity: &SyncEntityId,
        record: &WikiNewPageRecord,
        server_pages: &[WikiServerPage],
        result: &mut WikiSyncResult,
    ) -> Result<()> {
        let title_taken = server_pages
            .iter()
            .any(|p| p.title.eq_ignore_ascii_case(&record.title));
        if title_taken {
            // 标题已被占用：按冲突丢弃
            let warning = offline_data_deleted_warning(
                COMPONENT_NAME,
                &record.title,
                "同名页面已在服务器端存在",
            );
            result.discarded.push(WikiDiscardedPage {
                title: record.title.clone(),
                warning: warning.clone(),
            });
            result.warnings.push(warning);
            result.updated = true;
            return self
                .pages
                .delete(site_id, entity, &record.mutation_key())
                .await;
        }

        match self
            .api
            .new_page(
                site_id,
                &record.title,
                &record.content,
                record.subwiki_id,
                record.wiki_id,
                record.user_id,
                record.group_id,
            )
            .await
        {
            Ok(page_id) => {
                result.created.push(WikiCreatedPage {
                    page_id,
                    title: record.title.clone(),
                });
            }
            Err(e) if e.is_webservice_error() => {
                let warning =
                    offline_data_deleted_warning(COMPONENT_NAME, &record.title, &e.to_string());
                result.discarded.push(WikiDiscardedPage {
                    title: record.title.clone(),
                    warning: warning.clone(),
                });
                result.warnings.push(warning);
            }
            Err(e) => return Err(e),
        }

        result.updated = true;
        self.pages.delete(site_id, entity, &record.mutation_key()).await
    }
}

#[async_trait]
impl SyncAgent for WikiSyncService {
    fn component(&self) -> &'static str {
        COMPONENT
    }

    async fn has_pending(&self, site_id: &str) -> Result<bool> {
        self.pages.has_pending(site_id).await
    }

    async fn sync_site(&self, site_id: &str, force: bool) -> Result<()> {
        self.sync_all_wikis(site_id, force).await
    }
}
