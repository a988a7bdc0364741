//! 论坛域同步服务
//!
//! 两条队列：离线发起的新讨论（按论坛+用户为实体）和离线写的回帖
//! （按讨论+用户为实体）。发帖前先把附件重传成草稿区，草稿区 id 作为
//! `attachmentsid` 选项随帖子提交。发帖是追加型操作，没有服务端基线
//! 可比较，冲突只能以服务端拒绝的形式出现（丢弃并警告）。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{CampusSDKError, Result};
use crate::events::EventManager;
use crate::network::NetworkMonitor;
use crate::storage::files::StoredFileManager;
use crate::storage::offline::{MutationRecord, OfflineMutationStore};
use crate::sync::coordinator::SyncCoordinator;
use crate::sync::reupload::{AttachmentReuploader, AttachmentSet};
use crate::sync::scheduler::SyncAgent;
use crate::sync::{offline_data_deleted_warning, SyncBlockRegistry, SyncEntityId, SyncResult};

pub const COMPONENT: &str = "mod_forum";
const COMPONENT_NAME: &str = "论坛";

/// 讨论队列与回帖队列各自独立的同步命名空间
/// （两类实体都是「id + 用户」，分开命名空间避免键撞在一起）
pub const DISCUSSIONS_COMPONENT: &str = "mod_forum_discussions";
pub const REPLIES_COMPONENT: &str = "mod_forum_replies";

/// 离线发起的新讨论
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForumDiscussionRecord {
    pub forum_id: u64,
    pub user_id: u64,
    pub group_id: i64,
    pub subject: String,
    pub message: String,
    pub options: HashMap<String, Value>,
    pub attachments: AttachmentSet,
    /// 创建时间同时充当记录键（同一论坛下唯一）
    pub created_at: i64,
}

impl ForumDiscussionRecord {
    fn attachment_area(&self) -> String {
        format!("discussion_{}", self.created_at)
    }
}

impl MutationRecord for ForumDiscussionRecord {
    fn entity_id(&self) -> SyncEntityId {
        SyncEntityId::EntityUser {
            id: self.forum_id,
            user_id: self.user_id,
        }
    }

    fn mutation_key(&self) -> String {
        format!("discussion:{}", self.created_at)
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }
}

/// 离线写的回帖
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForumReplyRecord {
    pub forum_id: u64,
    pub discussion_id: u64,
    /// 被回复的帖子
    pub post_id: u64,
    pub user_id: u64,
    pub subject: String,
    pub message: String,
    pub options: HashMap<String, Value>,
    pub attachments: AttachmentSet,
    pub created_at: i64,
}

impl ForumReplyRecord {
    fn attachment_area(&self) -> String {
        format!("reply_{}", self.post_id)
    }
}

impl MutationRecord for ForumReplyRecord {
    fn entity_id(&self) -> SyncEntityId {
        SyncEntityId::EntityUser {
            id: self.discussion_id,
            user_id: self.user_id,
        }
    }

    fn mutation_key(&self) -> String {
        format!("reply:{}", self.post_id)
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }
}

/// 论坛域服务端接口
#[async_trait]
pub trait ForumApi: Send + Sync {
    /// 发新讨论，返回讨论 id
    async fn add_discussion(
        &self,
        site_id: &str,
        forum_id: u64,
        subject: &str,
        message: &str,
        group_id: i64,
        options: &HashMap<String, Value>,
    ) -> Result<u64>;

    /// 回帖，返回新帖子 id
    async fn reply_post(
        &self,
        site_id: &str,
        post_id: u64,
        subject: &str,
        message: &str,
        options: &HashMap<String, Value>,
    ) -> Result<u64>;

    async fn invalidate_discussions(&self, site_id: &str, forum_id: u64) -> Result<()>;

    async fn invalidate_posts(&self, site_id: &str, discussion_id: u64) -> Result<()>;
}

/// 论坛域同步服务
#[derive(Clone)]
pub struct ForumSyncService {
    discussions_coordinator: SyncCoordinator<SyncResult>,
    replies_coordinator: SyncCoordinator<SyncResult>,
    blocks: Arc<SyncBlockRegistry>,
    discussions: Arc<dyn OfflineMutationStore<ForumDiscussionRecord>>,
    replies: Arc<dyn OfflineMutationStore<ForumReplyRecord>>,
    api: Arc<dyn ForumApi>,
    network: Arc<NetworkMonitor>,
    reuploader: Arc<AttachmentReuploader>,
    files: StoredFileManager,
    events: Arc<EventManager>,
}

impl ForumSyncService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        discussions_coordinator: SyncCoordinator<SyncResult>,
        replies_coordinator: SyncCoordinator<SyncResult>,
        blocks: Arc<SyncBlockRegistry>,
        discussions: Arc<dyn OfflineMutationStore<ForumDiscussionRecord>>,
        replies: Arc<dyn OfflineMutationStore<ForumReplyRecord>>,
        api: Arc<dyn ForumApi>,
        network: Arc<NetworkMonitor>,
        reuploader: Arc<AttachmentReuploader>,
        files: StoredFileManager,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            discussions_coordinator,
            replies_coordinator,
            blocks,
            discussions,
            replies,
            api,
            network,
            reuploader,
            files,
            events,
        }
    }

    /// 同步站点内全部论坛离线数据
    pub async fn sync_all_forums(&self, site_id: &str, force: bool) -> Result<()> {
        for entity in self.discussions.pending_entities(site_id).await? {
            let SyncEntityId::EntityUser { id, user_id } = entity else {
                continue;
            };
            let outcome = if force {
                self.sync_forum_discussions(site_id, id, user_id).await.map(Some)
            } else {
                self.sync_forum_discussions_if_needed(site_id, id, user_id).await
            };
            self.report(site_id, DISCUSSIONS_COMPONENT, id, user_id, outcome)?;
        }

        for entity in self.replies.pending_entities(site_id).await? {
            let SyncEntityId::EntityUser { id, user_id } = entity else {
                continue;
            };
            let outcome = if force {
                self.sync_discussion_replies(site_id, id, user_id).await.map(Some)
            } else {
                self.sync_discussion_replies_if_needed(site_id, id, user_id).await
            };
            self.report(site_id, REPLIES_COMPONENT, id, user_id, outcome)?;
        }

        Ok(())
    }

    fn report(
        &self,
        site_id: &str,
        component: &str,
        id: u64,
        user_id: u64,
        outcome: Result<Option<SyncResult>>,
    ) -> Result<()> {
        match outcome {
            Ok(Some(result)) if result.updated => {
                self.events.emit_sync_completed(
                    component,
                    site_id,
                    &SyncEntityId::EntityUser { id, user_id },
                    &result,
                );
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if e.is_sync_blocked() => {
                debug!("{} {}#{} 被编辑锁占用，本轮跳过", component, id, user_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn sync_forum_discussions_if_needed(
        &self,
        site_id: &str,
        forum_id: u64,
        user_id: u64,
    ) -> Result<Option<SyncResult>> {
        let entity = SyncEntityId::EntityUser {
            id: forum_id,
            user_id,
        };
        if self.discussions_coordinator.is_sync_needed(&entity, site_id).await {
            return self
                .sync_forum_discussions(site_id, forum_id, user_id)
                .await
                .map(Some);
        }
        Ok(None)
    }

    /// 同步某论坛下该用户离线发起的全部新讨论
    pub async fn sync_forum_discussions(
        &self,
        site_id: &str,
        forum_id: u64,
        user_id: u64,
    ) -> Result<SyncResult> {
        let entity = SyncEntityId::EntityUser {
            id: forum_id,
            user_id,
        };

        if self.blocks.is_blocked(DISCUSSIONS_COMPONENT, &entity, site_id) {
            debug!("论坛 {} 的新讨论正在编辑中，无法同步", forum_id);
            return Err(CampusSDKError::SyncBlocked {
                component: DISCUSSIONS_COMPONENT.to_string(),
                entity: entity.to_string(),
            });
        }

        if let Some(ongoing) = self.discussions_coordinator.get_ongoing_sync(&entity, site_id) {
            return ongoing.await;
        }

        debug!("尝试同步论坛 {} 用户 {} 的新讨论 @ {}", forum_id, user_id, site_id);

        let this = self.clone();
        let site = site_id.to_string();
        let work = async move { this.perform_discussions_sync(&site, forum_id, user_id).await };

        self.discussions_coordinator
            .add_ongoing_sync(&entity, site_id, work)
            .await
    }

    async fn perform_discussions_sync(
        &self,
        site_id: &str,
        forum_id: u64,
        user_id: u64,
    ) -> Result<SyncResult> {
        let entity = SyncEntityId::EntityUser {
            id: forum_id,
            user_id,
        };
        let mut result = SyncResult::default();

        let records = self.discussions.get_pending(site_id, &entity).await?;
        if records.is_empty() {
            self.discussions_coordinator.record_sync_time(&entity, site_id).await;
            return Ok(result);
        }

        if !self.network.is_online().await {
            return Err(CampusSDKError::Offline);
        }

        let outcome: Result<()> = async {
            for record in &records {
                self.send_discussion(site_id, &entity, record, &mut result).await?;
            }
            Ok(())
        }
        .await;

        if outcome.is_ok() && result.updated {
            if let Err(e) = self.api.invalidate_discussions(site_id, forum_id).await {
                debug!("失效讨论列表缓存失败: {}", e);
            }
        }

        self.discussions_coordinator.record_sync_time(&entity, site_id).await;

        outcome?;
        Ok(result)
    }

    async fn send_discussion(
        &self,
        site_id: &str,
        entity: &SyncEntityId,
        record: &ForumDiscussionRecord,
        result: &mut SyncResult,
    ) -> Result<()> {
        let send_outcome: Result<()> = async {
            let mut options = record.options.clone();
            if !record.attachments.is_empty() {
                let draft_id = self
                    .reuploader
                    .reupload_set(
                        site_id,
                        COMPONENT,
                        record.forum_id,
                        &record.attachments,
                        &record.attachment_area(),
                    )
                    .await?;
                options.insert("attachmentsid".to_string(), json!(draft_id));
            }
            self.api
                .add_discussion(
                    site_id,
                    record.forum_id,
                    &record.subject,
                    &record.message,
                    record.group_id,
                    &options,
                )
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = send_outcome {
            if !e.is_webservice_error() {
                return Err(e);
            }
            result
                .warnings
                .push(offline_data_deleted_warning(COMPONENT_NAME, &record.subject, &e.to_string()));
        }

        result.updated = true;
        self.delete_discussion(site_id, entity, record).await
    }

    async fn delete_discussion(
        &self,
        site_id: &str,
        entity: &SyncEntityId,
        record: &ForumDiscussionRecord,
    ) -> Result<()> {
        self.discussions
            .delete(site_id, entity, &record.mutation_key())
            .await?;
        if record.attachments.has_offline {
            if let Err(e) = self
                .files
                .delete_stored_files(site_id, COMPONENT, &record.attachment_area())
                .await
            {
                debug!("清理讨论附件目录失败: {}", e);
            }
        }
        Ok(())
    }

    pub async fn sync_discussion_replies_if_needed(
        &self,
        site_id: &str,
        discussion_id: u64,
        user_id: u64,
    ) -> Result<Option<SyncResult>> {
        let entity = SyncEntityId::EntityUser {
            id: discussion_id,
            user_id,
        };
        if self.replies_coordinator.is_sync_needed(&entity, site_id).await {
            return self
                .sync_discussion_replies(site_id, discussion_id, user_id)
                .await
                .map(Some);
        }
        Ok(None)
    }

    /// 同步某讨论下该用户的全部离线回帖
    pub async fn sync_discussion_replies(
        &self,
        site_id: &str,
        discussion_id: u64,
        user_id: u64,
    ) -> Result<SyncResult> {
        let entity = SyncEntityId::EntityUser {
            id: discussion_id,
            user_id,
        };

        if self.blocks.is_blocked(REPLIES_COMPONENT, &entity, site_id) {
            debug!("讨论 {} 的回帖正在编辑中，无法同步", discussion_id);
            return Err(CampusSDKError::SyncBlocked {
                component: REPLIES_COMPONENT.to_string(),
                entity: entity.to_string(),
            });
        }

        if let Some(ongoing) = self.replies_coordinator.get_ongoing_sync(&entity, site_id) {
            return ongoing.await;
        }

        debug!("尝试同步讨论 {} 用户 {} 的回帖 @ {}", discussion_id, user_id, site_id);

        let this = self.clone();
        let site = site_id.to_string();
        let work = async move { this.perform_replies_sync(&site, discussion_id, user_id).await };

        self.replies_coordinator
            .add_ongoing_sync(&entity, site_id, work)
            .await
    }

    async fn perform_replies_sync(
        &self,
        site_id: &str,
        discussion_id: u64,
        user_id: u64,
    ) -> Result<SyncResult> {
        let entity = SyncEntityId::EntityUser {
            id: discussion_id,
            user_id,
        };
        let mut result = SyncResult::default();

        let records = self.replies.get_pending(site_id, &entity).await?;
        if records.is_empty() {
            self.replies_coordinator.record_sync_time(&entity, site_id).await;
            return Ok(result);
        }

        if !self.network.is_online().await {
            return Err(CampusSDKError::Offline);
        }

        let mut forum_id = None;
        let outcome: Result<()> = async {
            for record in &records {
                forum_id = Some(record.forum_id);
                self.send_reply(site_id, &entity, record, &mut result).await?;
            }
            Ok(())
        }
        .await;

        if outcome.is_ok() && result.updated {
            if let Some(forum_id) = forum_id {
                if let Err(e) = self.api.invalidate_discussions(site_id, forum_id).await {
                    debug!("失效讨论列表缓存失败: {}", e);
                }
            }
            if let Err(e) = self.api.invalidate_posts(site_id, discussion_id).await {
                debug!("失效帖子缓存失败: {}", e);
            }
        }

        self.replies_coordinator.record_sync_time(&entity, site_id).await;

        outcome?;
        Ok(result)
    }

    async fn send_reply(
        &self,
        site_id: &str,
        entity: &SyncEntityId,
        record: &ForumReplyRecord,
        result: &mut SyncResult,
    ) -> Result<()> {
        let send_outcome: Result<()> = async {
            let mut options = record.options.clone();
            if !record.attachments.is_empty() {
                let draft_id = self
                    .reuploader
                    .reupload_set(
                        site_id,
                        COMPONENT,
                        record.forum_id,
                        &record.attachments,
                        &record.attachment_area(),
                    )
                    .await?;
                options.insert("attachmentsid".to_string(), json!(draft_id));
            }
            self.api
                .reply_post(site_id, record.post_id, &record.subject, &record.message, &options)
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = send_outcome {
            if !e.is_webservice_error() {
                return Err(e);
            }
            result
                .warnings
                .push(offline_data_deleted_warning(COMPONENT_NAME, &record.subject, &e.to_string()));
        }

        result.updated = true;
        self.delete_reply(site_id, entity, record).await
    }

    async fn delete_reply(
        &self,
        site_id: &str,
        entity: &SyncEntityId,
        record: &ForumReplyRecord,
    ) -> Result<()> {
        self.replies.delete(site_id, entity, &record.mutation_key()).await?;
        if record.attachments.has_offline {
            if let Err(e) = self
                .files
                .delete_stored_files(site_id, COMPONENT, &record.attachment_area())
                .await
            {
                debug!("清理回帖附件目录失败: {}", e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SyncAgent for ForumSyncService {
    fn component(&self) -> &'static str {
        COMPONENT
    }

    async fn has_pending(&self, site_id: &str) -> Result<bool> {
        Ok(self.discussions.has_pending(site_id).await? || self.replies.has_pending(site_id).await?)
    }

    async fn sync_site(&self, site_id: &str, force: bool) -> Result<()> {
        self.sync_all_forums(site_id, force).await
    }
}
