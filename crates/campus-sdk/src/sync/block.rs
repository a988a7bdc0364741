//! 实体编辑锁注册表
//!
//! 用户打开某实体的编辑器时加锁，关闭时解锁；锁存在期间同步引擎对该
//! 实体快速失败。锁的生命周期完全由编辑方掌握：纯内存、无超时，引擎
//! 只做成员检查，绝不代为解锁。

use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::debug;

use crate::sync::SyncEntityId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BlockKey {
    component: String,
    entity: SyncEntityId,
    site_id: String,
}

/// 同步阻塞注册表
#[derive(Debug, Default)]
pub struct SyncBlockRegistry {
    blocks: RwLock<HashSet<BlockKey>>,
}

impl SyncBlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(component: &str, entity: &SyncEntityId, site_id: &str) -> BlockKey {
        BlockKey {
            component: component.to_string(),
            entity: entity.clone(),
            site_id: site_id.to_string(),
        }
    }

    /// 加锁：编辑器打开时调用
    pub fn block(&self, component: &str, entity: &SyncEntityId, site_id: &str) {
        debug!("阻塞同步: {} {} @ {}", component, entity, site_id);
        self.blocks.write().insert(Self::key(component, entity, site_id));
    }

    /// 解锁：编辑器关闭时调用。重复解锁无副作用。
    pub fn unblock(&self, component: &str, entity: &SyncEntityId, site_id: &str) {
        debug!("解除阻塞: {} {} @ {}", component, entity, site_id);
        self.blocks.write().remove(&Self::key(component, entity, site_id));
    }

    /// 实体当前是否被编辑锁占用
    pub fn is_blocked(&self, component: &str, entity: &SyncEntityId, site_id: &str) -> bool {
        self.blocks.read().contains(&Self::key(component, entity, site_id))
    }

    /// 清掉某站点的全部锁（站点登出时调用）
    pub fn clear_site(&self, site_id: &str) {
        self.blocks.write().retain(|key| key.site_id != site_id);
    }
}
