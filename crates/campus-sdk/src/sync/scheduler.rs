//! 站点同步调度器
//!
//! 统一处理机会式触发：回到前台、网络恢复、用户手动刷新。对每个已登录
//! 站点、每个注册的内容域先做一次廉价的存在性检查，有待同步数据才把
//! 控制权交给域同步服务（服务内部再按实体做节流与准入）。
//!
//! 调度器自身不碰网络：离线时所有触发都是空操作。

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::network::NetworkMonitor;

/// 已登录站点清单（会话层实现）
#[async_trait]
pub trait SiteRoster: Send + Sync {
    async fn site_ids(&self) -> Result<Vec<String>>;
}

/// 固定站点清单：单站点应用或测试用
pub struct StaticSiteRoster {
    sites: Vec<String>,
}

impl StaticSiteRoster {
    pub fn new(sites: Vec<String>) -> Self {
        Self { sites }
    }
}

#[async_trait]
impl SiteRoster for StaticSiteRoster {
    async fn site_ids(&self) -> Result<Vec<String>> {
        Ok(self.sites.clone())
    }
}

/// 内容域同步代理
///
/// 每个域同步服务实现本 trait 并注册到调度器。`has_pending` 必须是
/// 纯本地检查；`sync_site` 负责枚举该站点内有待同步数据的实体并逐个
/// 同步（force 为 false 时尊重最小重同步间隔）。
#[async_trait]
pub trait SyncAgent: Send + Sync {
    fn component(&self) -> &'static str;

    async fn has_pending(&self, site_id: &str) -> Result<bool>;

    async fn sync_site(&self, site_id: &str, force: bool) -> Result<()>;
}

/// 站点同步调度器
pub struct SiteSyncScheduler {
    agents: RwLock<Vec<Arc<dyn SyncAgent>>>,
    roster: Arc<dyn SiteRoster>,
    network: Arc<NetworkMonitor>,
}

impl SiteSyncScheduler {
    pub fn new(roster: Arc<dyn SiteRoster>, network: Arc<NetworkMonitor>) -> Self {
        Self {
            agents: RwLock::new(Vec::new()),
            roster,
            network,
        }
    }

    /// 注册一个内容域（启动时调用一次）
    pub fn register_agent(&self, agent: Arc<dyn SyncAgent>) {
        debug!("注册同步代理: {}", agent.component());
        self.agents.write().push(agent);
    }

    /// 触发：应用回到前台
    pub async fn on_app_foreground(&self) {
        self.run(false).await;
    }

    /// 触发：网络恢复
    pub async fn on_connectivity_restored(&self) {
        self.run(false).await;
    }

    /// 触发：用户手动"立即同步"（忽略节流间隔）
    pub async fn sync_now(&self) {
        self.run(true).await;
    }

    async fn run(&self, force: bool) {
        if !self.network.is_online().await {
            debug!("设备离线，跳过本轮同步调度");
            return;
        }

        let sites = match self.roster.site_ids().await {
            Ok(sites) => sites,
            Err(e) => {
                warn!("读取站点清单失败，跳过本轮同步调度: {}", e);
                return;
            }
        };

        let agents: Vec<Arc<dyn SyncAgent>> = self.agents.read().clone();

        for site_id in &sites {
            for agent in &agents {
                match agent.has_pending(site_id).await {
                    Ok(false) => {
                        // 没有待同步数据的域只花一次存在性检查
                        continue;
                    }
                    Ok(true) => {
                        if let Err(e) = agent.sync_site(site_id, force).await {
                            // 后台自动同步保持安静，失败留给下一次触发
                            warn!("{} 同步失败 @ {}: {}", agent.component(), site_id, e);
                        }
                    }
                    Err(e) => {
                        warn!("{} 待同步检查失败 @ {}: {}", agent.component(), site_id, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CampusSDKError;
    use crate::network::NetworkStatus;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 记录调用的假域代理
    struct CountingAgent {
        pending: bool,
        pending_checks: AtomicU32,
        syncs: AtomicU32,
        forced: AtomicU32,
    }

    impl CountingAgent {
        fn new(pending: bool) -> Self {
            Self {
                pending,
                pending_checks: AtomicU32::new(0),
                syncs: AtomicU32::new(0),
                forced: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SyncAgent for CountingAgent {
        fn component(&self) -> &'static str {
            "mod_test"
        }

        async fn has_pending(&self, _site_id: &str) -> Result<bool> {
            self.pending_checks.fetch_add(1, Ordering::SeqCst);
            Ok(self.pending)
        }

        async fn sync_site(&self, _site_id: &str, force: bool) -> Result<()> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            if force {
                self.forced.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn scheduler_with(sites: Vec<&str>, network: Arc<NetworkMonitor>) -> SiteSyncScheduler {
        SiteSyncScheduler::new(
            Arc::new(StaticSiteRoster::new(
                sites.into_iter().map(String::from).collect(),
            )),
            network,
        )
    }

    #[tokio::test]
    async fn test_idle_domain_costs_one_existence_check() {
        let scheduler = scheduler_with(vec!["site1"], Arc::new(NetworkMonitor::default()));
        let agent = Arc::new(CountingAgent::new(false));
        scheduler.register_agent(agent.clone());

        scheduler.on_app_foreground().await;

        assert_eq!(agent.pending_checks.load(Ordering::SeqCst), 1);
        assert_eq!(agent.syncs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pending_domain_synced_per_site() {
        let scheduler = scheduler_with(vec!["site1", "site2"], Arc::new(NetworkMonitor::default()));
        let agent = Arc::new(CountingAgent::new(true));
        scheduler.register_agent(agent.clone());

        scheduler.on_connectivity_restored().await;
        assert_eq!(agent.syncs.load(Ordering::SeqCst), 2);
        assert_eq!(agent.forced.load(Ordering::SeqCst), 0);

        scheduler.sync_now().await;
        assert_eq!(agent.forced.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_offline_triggers_are_noops() {
        let network = Arc::new(NetworkMonitor::default());
        network.set_status(NetworkStatus::Offline).await;

        let scheduler = scheduler_with(vec!["site1"], network);
        let agent = Arc::new(CountingAgent::new(true));
        scheduler.register_agent(agent.clone());

        scheduler.on_app_foreground().await;
        scheduler.sync_now().await;

        assert_eq!(agent.pending_checks.load(Ordering::SeqCst), 0);
        assert_eq!(agent.syncs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_agent_failure_does_not_stop_other_agents() {
        struct FailingAgent;

        #[async_trait]
        impl SyncAgent for FailingAgent {
            fn component(&self) -> &'static str {
                "mod_failing"
            }

            async fn has_pending(&self, _site_id: &str) -> Result<bool> {
                Ok(true)
            }

            async fn sync_site(&self, _site_id: &str, _force: bool) -> Result<()> {
                Err(CampusSDKError::Transport("timeout".to_string()))
            }
        }

        let scheduler = scheduler_with(vec!["site1"], Arc::new(NetworkMonitor::default()));
        let healthy = Arc::new(CountingAgent::new(true));
        scheduler.register_agent(Arc::new(FailingAgent));
        scheduler.register_agent(healthy.clone());

        scheduler.on_app_foreground().await;
        assert_eq!(healthy.syncs.load(Ordering::SeqCst), 1);
    }
}
