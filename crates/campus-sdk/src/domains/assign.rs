//! 作业域同步服务
//!
//! 离线队列里有两类记录：提交（学生改了自己的作答）和评分（教师离线
//! 打分）。两类都以作业 id 为同步实体，提交先回放、评分随后；单条评分
//! 还有独立的编辑锁（教师可能正开着某个学生的评分面板），被锁的评分
//! 跳过并记入 `grades_blocked`，不拖垮整个作业的同步。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{CampusSDKError, Result};
use crate::events::EventManager;
use crate::network::NetworkMonitor;
use crate::storage::files::StoredFileManager;
use crate::storage::offline::{MutationRecord, OfflineMutationStore};
use crate::sync::coordinator::SyncCoordinator;
use crate::sync::plugin::{OfflinePluginData, PluginContext, PluginData, PluginSnapshot, SubmissionPluginDelegate};
use crate::sync::scheduler::SyncAgent;
use crate::sync::{offline_data_deleted_warning, SyncBlockRegistry, SyncEntityId, SyncResult};

pub const COMPONENT: &str = "mod_assign";
const COMPONENT_NAME: &str = "作业";

/// 离线保存的作业提交
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignSubmissionRecord {
    pub assign_id: u64,
    pub course_id: u64,
    pub user_id: u64,
    /// 各插件的离线数据，键为插件类型。空表 = 用户删除了自己的提交。
    pub plugin_data: HashMap<String, OfflinePluginData>,
    /// 记录创建时服务端提交的最后修改时间，冲突判断基线
    pub online_time_modified: i64,
    /// 用户是否点了「提交供评分」
    pub submitted: bool,
    pub submission_statement: bool,
    pub created_at: i64,
}

impl MutationRecord for AssignSubmissionRecord {
    fn entity_id(&self) -> SyncEntityId {
        SyncEntityId::Entity(self.assign_id)
    }

    fn mutation_key(&self) -> String {
        format!("submission:{}", self.user_id)
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }
}

/// 离线保存的评分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignGradeRecord {
    pub assign_id: u64,
    pub course_id: u64,
    pub user_id: u64,
    pub grade: f64,
    pub attempt_number: i64,
    pub add_attempt: bool,
    pub workflow_state: String,
    pub apply_to_all: bool,
    pub outcomes: HashMap<u64, f64>,
    /// 离线录入评分的时间，与服务端反馈时间比较
    pub time_modified: i64,
    pub created_at: i64,
}

impl MutationRecord for AssignGradeRecord {
    fn entity_id(&self) -> SyncEntityId {
        SyncEntityId::Entity(self.assign_id)
    }

    fn mutation_key(&self) -> String {
        format!("grade:{}", self.user_id)
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }
}

/// 服务端作业信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignAssignment {
    pub id: u64,
    pub course_id: u64,
    pub name: String,
    /// 是否启用草稿模式（启用时「提交供评分」是独立动作）
    pub submission_drafts: bool,
}

/// 服务端提交状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignSubmission {
    pub time_modified: i64,
    pub plugins: Vec<PluginSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignFeedback {
    pub graded_date: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignSubmissionStatus {
    pub submission: Option<AssignSubmission>,
    pub feedback: Option<AssignFeedback>,
}

/// 作业域服务端接口
///
/// 读取必须走网络（同步要拿新鲜基线，不能读缓存）；写入返回的
/// WebService 错误必须与传输错误可区分。
#[async_trait]
pub trait AssignApi: Send + Sync {
    async fn get_assignment(&self, site_id: &str, course_id: u64, assign_id: u64) -> Result<AssignAssignment>;

    async fn get_submission_status(
        &self,
        site_id: &str,
        assign_id: u64,
        user_id: u64,
    ) -> Result<AssignSubmissionStatus>;

    async fn save_submission(&self, site_id: &str, assign_id: u64, plugin_data: &PluginData) -> Result<()>;

    async fn submit_for_grading(&self, site_id: &str, assign_id: u64, accept_statement: bool) -> Result<()>;

    async fn remove_submission(&self, site_id: &str, assign_id: u64, user_id: u64) -> Result<()>;

    async fn submit_grading_form(
        &self,
        site_id: &str,
        assign_id: u64,
        user_id: u64,
        grade: &AssignGradeRecord,
    ) -> Result<()>;

    /// 数据送达后失效实体缓存，让 UI 重新拉取
    async fn invalidate_content(&self, site_id: &str, assign_id: u64) -> Result<()>;
}

/// 作业同步结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignSyncResult {
    pub updated: bool,
    pub warnings: Vec<String>,
    /// 因评分面板开着而被跳过的评分（userid 列表）
    pub grades_blocked: Vec<u64>,
}

impl AssignSyncResult {
    fn as_sync_result(&self) -> SyncResult {
        SyncResult {
            updated: self.updated,
            warnings: self.warnings.clone(),
        }
    }
}

/// 作业域同步服务
#[derive(Clone)]
pub struct AssignSyncService {
    coordinator: SyncCoordinator<AssignSyncResult>,
    blocks: Arc<SyncBlockRegistry>,
    submissions: Arc<dyn OfflineMutationStore<AssignSubmissionRecord>>,
    grades: Arc<dyn OfflineMutationStore<AssignGradeRecord>>,
    api: Arc<dyn AssignApi>,
    network: Arc<NetworkMonitor>,
    plugins: Arc<SubmissionPluginDelegate>,
    files: StoredFileManager,
    events: Arc<EventManager>,
}

impl AssignSyncService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator: SyncCoordinator<AssignSyncResult>,
        blocks: Arc<SyncBlockRegistry>,
        submissions: Arc<dyn OfflineMutationStore<AssignSubmissionRecord>>,
        grades: Arc<dyn OfflineMutationStore<AssignGradeRecord>>,
        api: Arc<dyn AssignApi>,
        network: Arc<NetworkMonitor>,
        plugins: Arc<SubmissionPluginDelegate>,
        files: StoredFileManager,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            coordinator,
            blocks,
            submissions,
            grades,
            api,
            network,
            plugins,
            files,
            events,
        }
    }

    /// 某个学生评分的锁键
    pub fn grade_entity(assign_id: u64, user_id: u64) -> SyncEntityId {
        SyncEntityId::EntityUser {
            id: assign_id,
            user_id,
        }
    }

    /// 作业是否有待同步数据
    pub async fn has_data_to_sync(&self, site_id: &str, assign_id: u64) -> Result<bool> {
        let entity = SyncEntityId::Entity(assign_id);
        Ok(!self.submissions.get_pending(site_id, &entity).await?.is_empty()
            || !self.grades.get_pending(site_id, &entity).await?.is_empty())
    }

    /// 同步站点内所有有离线数据的作业
    pub async fn sync_all_assignments(&self, site_id: &str, force: bool) -> Result<()> {
        let mut entities = self.submissions.pending_entities(site_id).await?;
        for entity in self.grades.pending_entities(site_id).await? {
            if !entities.contains(&entity) {
                entities.push(entity);
            }
        }

        for entity in entities {
            let SyncEntityId::Entity(assign_id) = entity else {
                continue;
            };

            let outcome = if force {
                self.sync_assign(site_id, assign_id).await.map(Some)
            } else {
                self.sync_assign_if_needed(site_id, assign_id).await
            };

            match outcome {
                Ok(Some(result)) if result.updated => {
                    self.events.emit_sync_completed(
                        COMPONENT,
                        site_id,
                        &SyncEntityId::Entity(assign_id),
                        &result.as_sync_result(),
                    );
                }
                Ok(_) => {}
                Err(e) if e.is_sync_blocked() => {
                    debug!("作业 {} 被编辑锁占用，本轮跳过", assign_id);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// 距上次同步超过节流间隔时才同步
    pub async fn sync_assign_if_needed(
        &self,
        site_id: &str,
        assign_id: u64,
    ) -> Result<Option<AssignSyncResult>> {
        let entity = SyncEntityId::Entity(assign_id);
        if self.coordinator.is_sync_needed(&entity, site_id).await {
            return self.sync_assign(site_id, assign_id).await.map(Some);
        }
        Ok(None)
    }

    /// 同步一个作业
    pub async fn sync_assign(&self, site_id: &str, assign_id: u64) -> Result<AssignSyncResult> {
        let entity = SyncEntityId::Entity(assign_id);

        // 编辑锁占用：快速失败，不读离线存储
        if self.blocks.is_blocked(COMPONENT, &entity, site_id) {
            debug!("作业 {} 正在编辑中，无法同步", assign_id);
            return Err(CampusSDKError::SyncBlocked {
                component: COMPONENT.to_string(),
                entity: entity.to_string(),
            });
        }

        // 已有进行中的同步：共享同一次执行
        if let Some(ongoing) = self.coordinator.get_ongoing_sync(&entity, site_id) {
            return ongoing.await;
        }

        debug!("尝试同步作业 {} @ {}", assign_id, site_id);

        let this = self.clone();
        let site = site_id.to_string();
        let work = async move { this.perform_sync(&site, assign_id).await };

        self.coordinator.add_ongoing_sync(&entity, site_id, work).await
    }

    async fn perform_sync(&self, site_id: &str, assign_id: u64) -> Result<AssignSyncResult> {
        let entity = SyncEntityId::Entity(assign_id);
        let mut result = AssignSyncResult::default();

        let submissions = self.submissions.get_pending(site_id, &entity).await?;
        let grades = self.grades.get_pending(site_id, &entity).await?;

        if submissions.is_empty() && grades.is_empty() {
            // 没有待同步数据，最常见的情形：不打网络
            self.coordinator.record_sync_time(&entity, site_id).await;
            return Ok(result);
        }

        if !self.network.is_online().await {
            // 断网时整批拒绝，避免半批提交
            return Err(CampusSDKError::Offline);
        }

        let course_id = submissions
            .first()
            .map(|s| s.course_id)
            .or_else(|| grades.first().map(|g| g.course_id))
            .unwrap_or(0);
        let assign = self.api.get_assignment(site_id, course_id, assign_id).await?;

        let outcome = self
            .flush_queues(site_id, &assign, &submissions, &grades, &mut result)
            .await;

        if outcome.is_ok() && result.updated {
            // 数据已送达，失效缓存让 UI 拉新数据；失败不致命
            if let Err(e) = self.api.invalidate_content(site_id, assign_id).await {
                debug!("失效作业缓存失败: {}", e);
            }
        }

        // 无论队列结局如何都记录同步时间
        self.coordinator.record_sync_time(&entity, site_id).await;

        outcome?;
        Ok(result)
    }

    /// 按创建顺序回放两类队列。传输失败立即中止，已处理的记录保持已处理。
    async fn flush_queues(
        &self,
        site_id: &str,
        assign: &AssignAssignment,
        submissions: &[AssignSubmissionRecord],
        grades: &[AssignGradeRecord],
        result: &mut AssignSyncResult,
    ) -> Result<()> {
        for submission in submissions {
            self.sync_submission(site_id, assign, submission, &mut result.warnings)
                .await?;
            result.updated = true;
        }

        for grade in grades {
            match self
                .sync_submission_grade(site_id, assign, grade, &mut result.warnings)
                .await
            {
                Ok(()) => result.updated = true,
                Err(e) if e.is_sync_blocked() => {
                    // 评分面板开着，跳过这条评分但继续同步
                    result.grades_blocked.push(grade.user_id);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn sync_submission(
        &self,
        site_id: &str,
        assign: &AssignAssignment,
        offline: &AssignSubmissionRecord,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        let status = self
            .api
            .get_submission_status(site_id, assign.id, offline.user_id)
            .await?;

        if let Some(submission) = &status.submission {
            if submission.time_modified != offline.online_time_modified {
                // 服务端提交已变化：丢弃本地修改，不发送
                warnings.push(offline_data_deleted_warning(
                    COMPONENT_NAME,
                    &assign.name,
                    "提交已在服务器端被修改",
                ));
                return self.delete_submission_data(site_id, assign.id, offline).await;
            }
        }

        if let Err(e) = self.send_submission(site_id, assign, offline, &status).await {
            if !e.is_webservice_error() {
                // 本地/传输错误：保留记录，整体拒绝
                return Err(e);
            }
            // 服务端明确拒绝：丢弃并记警告
            warnings.push(offline_data_deleted_warning(
                COMPONENT_NAME,
                &assign.name,
                &e.to_string(),
            ));
        }

        self.delete_submission_data(site_id, assign.id, offline).await
    }

    async fn send_submission(
        &self,
        site_id: &str,
        assign: &AssignAssignment,
        offline: &AssignSubmissionRecord,
        status: &AssignSubmissionStatus,
    ) -> Result<()> {
        if offline.plugin_data.is_empty() {
            // 空插件数据 = 用户删除了自己的提交
            return self
                .api
                .remove_submission(site_id, assign.id, offline.user_id)
                .await;
        }

        let mut payload = PluginData::new();
        if let Some(submission) = &status.submission {
            for snapshot in &submission.plugins {
                if let Some(offline_plugin) = offline.plugin_data.get(&snapshot.plugin_type) {
                    let ctx = PluginContext {
                        component: COMPONENT,
                        entity_id: assign.id,
                        site_id,
                        plugin: snapshot,
                    };
                    self.plugins
                        .prepare_sync_data(&ctx, offline_plugin, &mut payload)
                        .await?;
                }
            }
        }

        self.api.save_submission(site_id, assign.id, &payload).await?;

        if assign.submission_drafts && offline.submitted {
            // 用户点过「提交供评分」，补一次正式提交
            self.api
                .submit_for_grading(site_id, assign.id, offline.submission_statement)
                .await?;
        }

        Ok(())
    }

    async fn delete_submission_data(
        &self,
        site_id: &str,
        assign_id: u64,
        offline: &AssignSubmissionRecord,
    ) -> Result<()> {
        self.submissions
            .delete(site_id, &SyncEntityId::Entity(assign_id), &offline.mutation_key())
            .await?;

        // 附件目录一并清理，失败不致命
        for plugin in offline.plugin_data.values() {
            if plugin.attachments.has_offline {
                if let Err(e) = self
                    .files
                    .delete_stored_files(site_id, COMPONENT, &plugin.area)
                    .await
                {
                    debug!("清理附件目录失败: {}", e);
                }
            }
        }

        Ok(())
    }

    async fn sync_submission_grade(
        &self,
        site_id: &str,
        assign: &AssignAssignment,
        offline: &AssignGradeRecord,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        let grade_entity = Self::grade_entity(assign.id, offline.user_id);
        if self.blocks.is_blocked(COMPONENT, &grade_entity, site_id) {
            return Err(CampusSDKError::SyncBlocked {
                component: COMPONENT.to_string(),
                entity: grade_entity.to_string(),
            });
        }

        let status = self
            .api
            .get_submission_status(site_id, assign.id, offline.user_id)
            .await?;

        let graded_date = status.feedback.as_ref().map(|f| f.graded_date).unwrap_or(0);
        if graded_date > offline.time_modified {
            // 服务端已重新评分：丢弃离线评分
            warnings.push(offline_data_deleted_warning(
                COMPONENT_NAME,
                &assign.name,
                "评分已在服务器端被修改",
            ));
            return self
                .grades
                .delete(site_id, &SyncEntityId::Entity(assign.id), &offline.mutation_key())
                .await;
        }

        if let Err(e) = self
            .api
            .submit_grading_form(site_id, assign.id, offline.user_id, offline)
            .await
        {
            if !e.is_webservice_error() {
                return Err(e);
            }
            warnings.push(offline_data_deleted_warning(
                COMPONENT_NAME,
                &assign.name,
                &e.to_string(),
            ));
        }

        self.grades
            .delete(site_id, &SyncEntityId::Entity(assign.id), &offline.mutation_key())
            .await
    }
}

#[async_trait]
impl SyncAgent for AssignSyncService {
    fn component(&self) -> &'static str {
        COMPONENT
    }

    async fn has_pending(&self, site_id: &str) -> Result<bool> {
        Ok(self.submissions.has_pending(site_id).await? || self.grades.has_pending(site_id).await?)
    }

    async fn sync_site(&self, site_id: &str, force: bool) -> Result<()> {
        self.sync_all_assignments(site_id, force).await
    }
}
