//! 事件系统模块 - 同步完成通知
//!
//! 每次同步结束都会广播一个事件，UI 据此决定是否刷新页面、
//! 是否向用户展示被丢弃数据的警告。订阅方掉线（缓冲满）只会丢事件，
//! 不会阻塞同步引擎。

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::sync::{SyncEntityId, SyncResult};

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 一次实体同步已结束
    SyncCompleted {
        /// 内容域组件名（mod_assign / mod_forum / …）
        component: String,
        site_id: String,
        /// 实体键的稳定渲染（SyncEntityId 的 Display 形式）
        entity: String,
        updated: bool,
        warnings: Vec<String>,
    },
}

/// 事件广播管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 广播一个事件（没有订阅者不算错误）
    pub fn emit(&self, event: SyncEvent) {
        if self.sender.send(event).is_err() {
            debug!("事件无订阅者，已忽略");
        }
    }

    /// 广播同步完成事件
    pub fn emit_sync_completed(
        &self,
        component: &str,
        site_id: &str,
        entity: &SyncEntityId,
        result: &SyncResult,
    ) {
        self.emit(SyncEvent::SyncCompleted {
            component: component.to_string(),
            site_id: site_id.to_string(),
            entity: entity.to_string(),
            updated: result.updated,
            warnings: result.warnings.clone(),
        });
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sync_completed_event() {
        let events = EventManager::default();
        let mut receiver = events.subscribe();

        let result = SyncResult {
            updated: true,
            warnings: vec!["discarded".to_string()],
        };
        events.emit_sync_completed("mod_assign", "site1", &SyncEntityId::Entity(42), &result);

        match receiver.recv().await.unwrap() {
            SyncEvent::SyncCompleted {
                component,
                site_id,
                entity,
                updated,
                warnings,
            } => {
                assert_eq!(component, "mod_assign");
                assert_eq!(site_id, "site1");
                assert_eq!(entity, "e:42");
                assert!(updated);
                assert_eq!(warnings.len(), 1);
            }
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let events = EventManager::default();
        // 不应 panic，也不应返回错误
        events.emit_sync_completed(
            "mod_forum",
            "site1",
            &SyncEntityId::Entity(1),
            &SyncResult::default(),
        );
    }
}
