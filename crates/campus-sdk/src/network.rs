//! 网络状态模块 - 同步引擎的连通性门控
//!
//! 平台层（Android/iOS）通过 [`NetworkStatusListener`] 上报真实网络状态，
//! [`NetworkMonitor`] 负责缓存当前状态并广播变化。同步引擎只关心
//! `is_online()`：离线时整批同步直接拒绝，调度器的触发也会被跳过。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// 网络状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 网络受限（按在线处理，上传可能较慢）
    Limited,
    /// 离线
    Offline,
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
}

/// 网络状态监听器 trait（由平台层实现）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync {
    /// 获取当前网络状态
    async fn current_status(&self) -> NetworkStatus;
}

/// 固定状态监听器：没有平台监听器时的缺省实现，也用于测试
#[derive(Debug)]
pub struct StaticNetworkListener {
    status: RwLock<NetworkStatus>,
}

impl StaticNetworkListener {
    pub fn new(status: NetworkStatus) -> Self {
        Self {
            status: RwLock::new(status),
        }
    }

    pub async fn set(&self, status: NetworkStatus) {
        *self.status.write().await = status;
    }
}

impl Default for StaticNetworkListener {
    fn default() -> Self {
        Self::new(NetworkStatus::Online)
    }
}

#[async_trait]
impl NetworkStatusListener for StaticNetworkListener {
    async fn current_status(&self) -> NetworkStatus {
        self.status.read().await.clone()
    }
}

/// 网络监控管理器
///
/// 持有平台监听器，缓存最近一次状态并向订阅者广播变化。
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    current: Arc<RwLock<NetworkStatus>>,
    sender: broadcast::Sender<NetworkStatusEvent>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        let (sender, _) = broadcast::channel(16);

        Self {
            listener,
            current: Arc::new(RwLock::new(NetworkStatus::Online)),
            sender,
        }
    }

    /// 向监听器查询一次状态并更新缓存，返回最新状态
    pub async fn refresh(&self) -> NetworkStatus {
        let status = self.listener.current_status().await;
        self.set_status(status.clone()).await;
        status
    }

    /// 获取缓存的当前网络状态
    pub async fn status(&self) -> NetworkStatus {
        self.current.read().await.clone()
    }

    /// 平台层主动上报状态变化
    pub async fn set_status(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut current = self.current.write().await;
            std::mem::replace(&mut *current, new_status.clone())
        };

        if old_status != new_status {
            debug!("网络状态变化: {:?} -> {:?}", old_status, new_status);
            let _ = self.sender.send(NetworkStatusEvent {
                old_status,
                new_status,
            });
        }
    }

    /// 是否在线（受限网络按在线处理）
    pub async fn is_online(&self) -> bool {
        matches!(
            self.status().await,
            NetworkStatus::Online | NetworkStatus::Limited
        )
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.sender.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(Arc::new(StaticNetworkListener::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_is_online() {
        let monitor = NetworkMonitor::default();
        assert!(monitor.is_online().await);

        monitor.set_status(NetworkStatus::Offline).await;
        assert!(!monitor.is_online().await);

        monitor.set_status(NetworkStatus::Limited).await;
        assert!(monitor.is_online().await);
    }

    #[tokio::test]
    async fn test_status_change_broadcast() {
        let monitor = NetworkMonitor::default();
        let mut receiver = monitor.subscribe();

        monitor.set_status(NetworkStatus::Offline).await;
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.old_status, NetworkStatus::Online);
        assert_eq!(event.new_status, NetworkStatus::Offline);

        // 状态未变化时不广播
        monitor.set_status(NetworkStatus::Offline).await;
        assert!(receiver.try_recv().is_err());
    }
}
