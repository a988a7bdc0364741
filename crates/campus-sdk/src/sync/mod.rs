//! 离线同步引擎
//!
//! 职责：
//! - 把各内容域（作业、论坛、词汇表、Wiki、互评）的离线修改队列回放到服务端
//! - 按实体维度保证同一时间至多一个进行中的同步（并发调用收敛到同一结果）
//! - 最小重同步间隔节流，避免每次回前台都打网络
//! - 尊重编辑器持有的实体锁（被锁实体快速失败，不读离线存储）
//! - 冲突/服务端拒绝 → 丢弃并产生警告；传输失败 → 中止剩余队列，下次重试

pub mod block;
pub mod coordinator;
pub mod plugin;
pub mod reupload;
pub mod scheduler;

pub use block::SyncBlockRegistry;
pub use coordinator::{SyncCoordinator, SyncHandle, DEFAULT_MIN_RESYNC_SECS};
pub use plugin::{
    FormFields, PluginData, PluginContext, PluginSnapshot, SubmissionPluginDelegate,
    SubmissionPluginHandler,
};
pub use reupload::{
    AttachmentReuploader, AttachmentSet, AttachmentSource, OnlineFileRef, EMPTY_DRAFT_AREA_ID,
};
pub use scheduler::{SiteRoster, SiteSyncScheduler, StaticSiteRoster, SyncAgent};

use serde::{Deserialize, Serialize};
use std::fmt;

/// 站点标识
pub type SiteId = String;

/// 被同步实体的复合键
///
/// 大多数域用单个数字 id 即可；Wiki 的子 Wiki 可能尚未在服务端创建
/// （subwiki id 还不存在），此时由 (wiki, user, group) 三元组标识。
/// 结构化键避免了字符串拼接带来的歧义。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncEntityId {
    /// 单实体 id（作业 id、词汇表 id、讨论 id …）
    Entity(u64),
    /// 实体 + 用户维度（按用户隔离的队列，如某作业某学生的评分）
    EntityUser { id: u64, user_id: u64 },
    /// 已存在的子 Wiki
    Subwiki(u64),
    /// 尚未创建的子 Wiki，由所属 Wiki/用户/分组标识
    WikiUserGroup {
        wiki_id: u64,
        user_id: u64,
        group_id: u64,
    },
}

impl fmt::Display for SyncEntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEntityId::Entity(id) => write!(f, "e:{}", id),
            SyncEntityId::EntityUser { id, user_id } => write!(f, "eu:{}:{}", id, user_id),
            SyncEntityId::Subwiki(id) => write!(f, "sw:{}", id),
            SyncEntityId::WikiUserGroup {
                wiki_id,
                user_id,
                group_id,
            } => write!(f, "wug:{}:{}:{}", wiki_id, user_id, group_id),
        }
    }
}

/// 一次同步的聚合结果
///
/// `updated` 表示有数据发生了变化（发送成功或被丢弃都算），
/// `warnings` 聚合了所有被丢弃记录的人类可读说明，最终展示给用户。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub updated: bool,
    pub warnings: Vec<String>,
}

impl SyncResult {
    pub fn merge(&mut self, other: SyncResult) {
        self.updated = self.updated || other.updated;
        self.warnings.extend(other.warnings);
    }
}

/// 生成"离线数据已被删除"的警告文案
///
/// 与所有域共用同一格式，保证聚合展示时风格一致。
pub fn offline_data_deleted_warning(component_name: &str, item_name: &str, reason: &str) -> String {
    format!(
        "{}「{}」的离线数据已被删除: {}",
        component_name, item_name, reason
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_display_is_unambiguous() {
        // 不同变体即使数字相同也不会渲染出同一个存储键
        let a = SyncEntityId::Entity(42);
        let b = SyncEntityId::Subwiki(42);
        let c = SyncEntityId::EntityUser { id: 42, user_id: 0 };
        assert_ne!(a.to_string(), b.to_string());
        assert_ne!(a.to_string(), c.to_string());
        assert_eq!(a.to_string(), "e:42");
        assert_eq!(
            SyncEntityId::WikiUserGroup {
                wiki_id: 3,
                user_id: 7,
                group_id: 0
            }
            .to_string(),
            "wug:3:7:0"
        );
    }

    #[test]
    fn test_result_merge() {
        let mut result = SyncResult::default();
        result.merge(SyncResult {
            updated: true,
            warnings: vec!["w1".to_string()],
        });
        result.merge(SyncResult {
            updated: false,
            warnings: vec!["w2".to_string()],
        });
        assert!(result.updated);
        assert_eq!(result.warnings, vec!["w1", "w2"]);
    }
}
