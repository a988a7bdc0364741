//! Campus SDK - 移动端学习平台客户端核心
//!
//! 本 SDK 的核心是离线同步引擎：
//! - 📴 离线编辑：作业提交、论坛发帖、词汇表词条、Wiki 页面、互评打分落盘排队
//! - 🔁 联网回放：待同步记录按实体串行回放到服务端，同一实体绝不并发同步
//! - ⏱️ 同步节流：最小重同步间隔，回前台不等于打网络
//! - 🔒 编辑锁：正在编辑的实体快速失败，不碰离线存储
//! - 📎 附件重传：在线引用与本地文件归一到同一个草稿区
//! - ⚠️ 冲突处理：服务端已变化或明确拒绝 → 丢弃并聚合警告，绝不静默丢数据
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use campus_sdk::network::NetworkMonitor;
//! use campus_sdk::sync::{SiteSyncScheduler, StaticSiteRoster};
//!
//! # async fn demo() {
//! let network = Arc::new(NetworkMonitor::default());
//! let roster = Arc::new(StaticSiteRoster::new(vec!["site1".to_string()]));
//! let scheduler = SiteSyncScheduler::new(roster, network);
//!
//! // 各内容域服务构建后注册到调度器
//! // scheduler.register_agent(assign_service);
//!
//! // 应用回到前台时触发一轮机会式同步
//! scheduler.on_app_foreground().await;
//! # }
//! ```

pub mod error;
pub mod version;
pub mod events;
pub mod network;
pub mod http_client;
pub mod storage;
pub mod sync;
pub mod domains;

// 重新导出核心类型，方便使用
pub use error::{CampusSDKError, Result};
pub use events::{EventManager, SyncEvent};
pub use http_client::{FileHttpClient, FileTransport, HttpClientConfig};
pub use network::{NetworkMonitor, NetworkStatus, NetworkStatusListener};
pub use storage::{KvMutationStore, KvStore, MutationRecord, OfflineMutationStore, StoredFileManager};
pub use sync::{
    AttachmentReuploader, AttachmentSet, AttachmentSource, OnlineFileRef, SiteRoster,
    SiteSyncScheduler, SyncAgent, SyncBlockRegistry, SyncCoordinator, SyncEntityId, SyncResult,
};

/// 初始化日志输出（宿主应用或 FFI 层启动时调用一次）
///
/// 重复调用安全：已有全局订阅者时保持原样。
pub fn init_logging(debug_mode: bool) {
    let level = if debug_mode {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init();
}
