//! 互评（工作坊）域同步服务
//!
//! 队列里有两类记录：对自己作品的提交动作（新增/修改/删除，可能串成
//! 一条动作链）和对他人作品的互评。两类都以工作坊 id 为同步实体。
//! 冲突基线是服务端对应提交/互评的最后修改时间：服务端更新、或实体在
//! 服务端已不存在，整条动作链按冲突丢弃。

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

pub const COMPONENT: &str = "mod_workshop";
const COMPONENT_NAME: &str = "互评";

/// 提交动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkshopAction {
    Add,
    Update,
    Delete,
}

impl WorkshopAction {
    fn as_str(&self) -> &'static str {
        match self {
            WorkshopAction::Add => "add",
            WorkshopAction::Update => "update",
            WorkshopAction::Delete => "delete",
        }
    }
}

/// 离线保存的提交动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkshopSubmissionActionRecord {
    pub workshop_id: u64,
    pub course_id: u64,
    pub user_id: u64,
    /// 0 表示新增、尚无服务端 id
    pub submission_id: u64,
    pub action: WorkshopAction,
    pub title: String,
    pub content: String,
    pub attachments: AttachmentSet,
    pub created_at: i64,
}

impl WorkshopSubmissionActionRecord {
    fn attachment_area(&self) -> String {
        format!("submission_{}", self.user_id)
    }
}

impl MutationRecord for WorkshopSubmissionActionRecord {
    fn entity_id(&self) -> SyncEntityId {
        SyncEntityId::Entity(self.workshop_id)
    }

    fn mutation_key(&self) -> String {
        format!("action:{}:{}", self.submission_id, self.action.as_str())
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }
}

/// 离线保存的互评
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkshopAssessmentRecord {
    pub workshop_id: u64,
    pub course_id: u64,
    pub user_id: u64,
    pub assessment_id: u64,
    /// 评审表单字段，原样传给服务端
    pub input_data: HashMap<String, Value>,
    pub attachments: AttachmentSet,
    pub created_at: i64,
}

impl WorkshopAssessmentRecord {
    fn attachment_area(&self) -> String {
        format!("assessment_{}", self.assessment_id)
    }
}

impl MutationRecord for WorkshopAssessmentRecord {
    fn entity_id(&self) -> SyncEntityId {
        SyncEntityId::Entity(self.workshop_id)
    }

    fn mutation_key(&self) -> String {
        format!("assessment:{}", self.assessment_id)
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }
}

/// 服务端工作坊信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workshop {
    pub id: u64,
    pub course_id: u64,
    pub name: String,
    /// 提交是否允许附件
    pub submission_files_enabled: bool,
}

/// 服务端提交/互评的修改标记
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkshopTimestamp {
    pub time_modified: i64,
}

/// 互评域服务端接口
///
/// 读取的「不存在」是正常返回值（None），不是错误，丢弃逻辑依赖
/// 这个区分。
#[async_trait]
pub trait WorkshopApi: Send + Sync {
    async fn get_workshop(&self, site_id: &str, course_id: u64, workshop_id: u64) -> Result<Workshop>;

    async fn get_submission(
        &self,
        site_id: &str,
        workshop_id: u64,
        submission_id: u64,
    ) -> Result<Option<WorkshopTimestamp>>;

    async fn add_submission(
        &self,
        site_id: &str,
        workshop_id: u64,
        title: &str,
        content: &str,
        attachments_draft_id: Option<u64>,
    ) -> Result<u64>;

    async fn update_submission(
        &self,
        site_id: &str,
        submission_id: u64,
        title: &str,
        content: &str,
        attachments_draft_id: Option<u64>,
    ) -> Result<()>;

    async fn delete_submission(&self, site_id: &str, submission_id: u64) -> Result<()>;

    async fn get_assessment(
        &self,
        site_id: &str,
        workshop_id: u64,
        assessment_id: u64,
    ) -> Result<Option<WorkshopTimestamp>>;

    async fn update_assessment(
        &self,
        site_id: &str,
        assessment_id: u64,
        input_data: &HashMap<String, Value>,
    ) -> Result<()>;

    async fn invalidate_content(&self, site_id: &str, workshop_id: u64) -> Result<()>;
}

/// 互评域同步服务
#[derive(Clone)]
pub struct WorkshopSyncService {
    coordinator: SyncCoordinator<SyncResult>,
    blocks: Arc<SyncBlockRegistry>,
    submission_actions: Arc<dyn OfflineMutationStore<WorkshopSubmissionActionRecord>>,
    assessments: Arc<dyn OfflineMutationStore<WorkshopAssessmentRecord>>,
    api: Arc<dyn WorkshopApi>,
    network: Arc<NetworkMonitor>,
    reuploader: Arc<AttachmentReuploader>,
    files: StoredFileManager,
    events: Arc<EventManager>,
}

impl WorkshopSyncService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator: SyncCoordinator<SyncResult>,
        blocks: Arc<SyncBlockRegistry>,
        submission_actions: Arc<dyn OfflineMutationStore<WorkshopSubmissionActionRecord>>,
        assessments: Arc<dyn OfflineMutationStore<WorkshopAssessmentRecord>>,
        api: Arc<dyn WorkshopApi>,
        network: Arc<NetworkMonitor>,
        reuploader: Arc<AttachmentReuploader>,
        files: StoredFileManager,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            coordinator,
            blocks,
            submission_actions,
            assessments,
            api,
            network,
            reuploader,
            files,
            events,
        }
    }

    /// 同步站点内全部工作坊离线数据
    pub async fn sync_all_workshops(&self, site_id: &str, force: bool) -> Result<()> {
        let mut entities = self.submission_actions.pending_entities(site_id).await?;
        for entity in self.assessments.pending_entities(site_id).await? {
            if !entities.contains(&entity) {
                entities.push(entity);
            }
        }

        for entity in entities {
            let SyncEntityId::Entity(workshop_id) = entity else {
                continue;
            };

            let outcome = if force {
                self.sync_workshop(site_id, workshop_id).await.map(Some)
            } else {
                self.sync_workshop_if_needed(site_id, workshop_id).await
            };

            match outcome {
                Ok(Some(result)) if result.updated => {
                    self.events.emit_sync_completed(
                        COMPONENT,
                        site_id,
                        &SyncEntityId::Entity(workshop_id),
                        &result,
                    );
                }
                Ok(_) => {}
                Err(e) if e.is_sync_blocked() => {
                    debug!("工作坊 {} 被编辑锁占用，本轮跳过", workshop_id);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    pub async fn sync_workshop_if_needed(
        &self,
        site_id: &str,
        workshop_id: u64,
    ) -> Result<Option<SyncResult>> {
        let entity = SyncEntityId::Entity(workshop_id);
        if self.coordinator.is_sync_needed(&entity, site_id).await {
            return self.sync_workshop(site_id, workshop_id).await.map(Some);
        }
        Ok(None)
    }

    /// 同步一个工作坊
    pub async fn sync_workshop(&self, site_id: &str, workshop_id: u64) -> Result<SyncResult> {
        let entity = SyncEntityId::Entity(workshop_id);

        if self.blocks.is_blocked(COMPONENT, &entity, site_id) {
            debug!("工作坊 {} 正在编辑中，无法同步", workshop_id);
            return Err(CampusSDKError::SyncBlocked {
                component: COMPONENT.to_string(),
                entity: entity.to_string(),
            });
        }

        if let Some(ongoing) = self.coordinator.get_ongoing_sync(&entity, site_id) {
            return ongoing.await;
        }

        debug!("尝试同步工作坊 {} @ {}", workshop_id, site_id);

        let this = self.clone();
        let site = site_id.to_string();
        let work = async move { this.perform_sync(&site, workshop_id).await };

        self.coordinator.add_ongoing_sync(&entity, site_id, work).await
    }

    async fn perform_sync(&self, site_id: &str, workshop_id: u64) -> Result<SyncResult> {
        let entity = SyncEntityId::Entity(workshop_id);
        let mut result = SyncResult::default();

        let actions = self.submission_actions.get_pending(site_id, &entity).await?;
        let assessments = self.assessments.get_pending(site_id, &entity).await?;

        if actions.is_empty() && assessments.is_empty() {
            self.coordinator.record_sync_time(&entity, site_id).await;
            return Ok(result);
        }

        if !self.network.is_online().await {
            return Err(CampusSDKError::Offline);
        }

        let course_id = actions
            .first()
            .map(|a| a.course_id)
            .or_else(|| assessments.first().map(|a| a.course_id))
            .unwrap_or(0);
        let workshop = self.api.get_workshop(site_id, course_id, workshop_id).await?;

        let outcome: Result<()> = async {
            if !actions.is_empty() {
                self.sync_submission_chain(site_id, &workshop, &actions, &mut result)
                    .await?;
            }
            for assessment in &assessments {
                self.sync_assessment(site_id, &workshop, assessment, &mut result)
                    .await?;
            }
            Ok(())
        }
        .await;

        if outcome.is_ok() && result.updated {
            if let Err(e) = self.api.invalidate_content(site_id, workshop_id).await {
                debug!("失效工作坊缓存失败: {}", e);
            }
        }

        self.coordinator.record_sync_time(&entity, site_id).await;

        outcome?;
        Ok(result)
    }

    /// 回放一条提交动作链
    ///
    /// 链条整体共享一个冲突基线：第一条动作针对的提交在服务端被改过或
    /// 已不存在，整条链丢弃（后续动作建立在第一条之上，单独发送没有意义）。
    async fn sync_submission_chain(
        &self,
        site_id: &str,
        workshop: &Workshop,
        actions: &[WorkshopSubmissionActionRecord],
        result: &mut SyncResult,
    ) -> Result<()> {
        let entity = SyncEntityId::Entity(workshop.id);
        let first = &actions[0];

        if first.submission_id > 0 {
            let conflicted = match self
                .api
                .get_submission(site_id, workshop.id, first.submission_id)
                .await?
            {
                // 服务端已不存在 → 丢弃
                None => true,
                // 服务端在本地动作之后又被改过 → 丢弃
                Some(server) => server.time_modified >= first.created_at,
            };

            if conflicted {
                result.warnings.push(offline_data_deleted_warning(
                    COMPONENT_NAME,
                    &workshop.name,
                    "提交已在服务器端被修改",
                ));
                result.updated = true;
                for action in actions {
                    self.delete_action(site_id, &entity, action).await?;
                }
                return Ok(());
            }
        }

        let mut submission_id = first.submission_id;

        for action in actions {
            if action.submission_id > 0 {
                submission_id = action.submission_id;
            }

            let send_outcome: Result<()> = async {
                let draft_id = if workshop.submission_files_enabled && !action.attachments.is_empty()
                {
                    Some(
                        self.reuploader
                            .reupload_set(
                                site_id,
                                COMPONENT,
                                workshop.id,
                                &action.attachments,
                                &action.attachment_area(),
                            )
                            .await?,
                    )
                } else {
                    None
                };

                match action.action {
                    WorkshopAction::Add => {
                        submission_id = self
                            .api
                            .add_submission(site_id, workshop.id, &action.title, &action.content, draft_id)
                            .await?;
                    }
                    WorkshopAction::Update => {
                        self.api
                            .update_submission(site_id, submission_id, &action.title, &action.content, draft_id)
                            .await?;
                    }
                    WorkshopAction::Delete => {
                        self.api.delete_submission(site_id, submission_id).await?;
                    }
                }
                Ok(())
            }
            .await;

            if let Err(e) = send_outcome {
                if !e.is_webservice_error() {
                    return Err(e);
                }
                result.warnings.push(offline_data_deleted_warning(
                    COMPONENT_NAME,
                    &workshop.name,
                    &e.to_string(),
                ));
            }

            result.updated = true;
            self.delete_action(site_id, &entity, action).await?;
        }

        Ok(())
    }

    async fn delete_action(
        &self,
        site_id: &str,
        entity: &SyncEntityId,
        action: &WorkshopSubmissionActionRecord,
    ) -> Result<()> {
        self.submission_actions
            .delete(site_id, entity, &action.mutation_key())
            .await?;
        if action.attachments.has_offline {
            if let Err(e) = self
                .files
                .delete_stored_files(site_id, COMPONENT, &action.attachment_area())
                .await
            {
                debug!("清理提交附件目录失败: {}", e);
            }
        }
        Ok(())
    }

    async fn sync_assessment(
        &self,
        site_id: &str,
        workshop: &Workshop,
        record: &WorkshopAssessmentRecord,
        result: &mut SyncResult,
    ) -> Result<()> {
        let entity = SyncEntityId::Entity(workshop.id);

        let conflicted = match self
            .api
            .get_assessment(site_id, workshop.id, record.assessment_id)
            .await?
        {
            None => true,
            Some(server) => server.time_modified >= record.created_at,
        };

        if conflicted {
            result.warnings.push(offline_data_deleted_warning(
                COMPONENT_NAME,
                &workshop.name,
                "互评已在服务器端被修改",
            ));
            result.updated = true;
            return self.delete_assessment(site_id, &entity, record).await;
        }

        let send_outcome: Result<()> = async {
            let mut input_data = record.input_data.clone();
            if !record.attachments.is_empty() {
                let draft_id = self
                    .reuploader
                    .reupload_set(
                        site_id,
                        COMPONENT,
                        workshop.id,
                        &record.attachments,
                        &record.attachment_area(),
                    )
                    .await?;
                input_data.insert("feedback_attachments_id".to_string(), json!(draft_id));
            }
            self.api
                .update_assessment(site_id, record.assessment_id, &input_data)
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = send_outcome {
            if !e.is_webservice_error() {
                return Err(e);
            }
            result.warnings.push(offline_data_deleted_warning(
                COMPONENT_NAME,
                &workshop.name,
                &e.to_string(),
            ));
        }

        result.updated = true;
        self.delete_assessment(site_id, &entity, record).await
    }

    async fn delete_assessment(
        &self,
        site_id: &str,
        entity: &SyncEntityId,
        record: &WorkshopAssessmentRecord,
    ) -> Result<()> {
        self.assessments
            .delete(site_id, entity, &record.mutation_key())
            .await?;
        if record.attachments.has_offline {
            if let Err(e) = self
                .files
                .delete_stored_files(site_id, COMPONENT, &record.attachment_area())
                .await
            {
                debug!("清理互评附件目录失败: {}", e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SyncAgent for WorkshopSyncService {
    fn component(&self) -> &'static str {
        COMPONENT
    }

    async fn has_pending(&self, site_id: &str) -> Result<bool> {
        Ok(self.submission_actions.has_pending(site_id).await?
            || self.assessments.has_pending(site_id).await?)
    }

    async fn sync_site(&self, site_id: &str, force: bool) -> Result<()> {
        self.sync_all_workshops(site_id, force).await
    }
}
