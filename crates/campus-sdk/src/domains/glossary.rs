//! 词汇表域同步服务
//!
//! 队列内容是离线新建的词条，按词汇表+用户为实体。词条的唯一性约束在
//! 概念名上：发送前先拉一次服务端词条列表做基线，概念已存在的词条直接
//! 按冲突丢弃，省一次必然失败的写请求；漏网的重名（两台设备同时同步）
//! 仍会以服务端拒绝的形式回来，同样丢弃并警告。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
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

pub const COMPONENT: &str = "mod_glossary";
const COMPONENT_NAME: &str = "词汇表";

/// 离线新建的词条
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlossaryEntryRecord {
    pub glossary_id: u64,
    pub course_id: u64,
    pub user_id: u64,
    pub concept: String,
    pub definition: String,
    pub options: HashMap<String, Value>,
    pub attachments: AttachmentSet,
    pub created_at: i64,
}

impl GlossaryEntryRecord {
    fn attachment_area(&self) -> String {
        format!("entry_{}", self.created_at)
    }
}

impl MutationRecord for GlossaryEntryRecord {
    fn entity_id(&self) -> SyncEntityId {
        SyncEntityId::EntityUser {
            id: self.glossary_id,
            user_id: self.user_id,
        }
    }

    fn mutation_key(&self) -> String {
        format!("entry:{}", self.created_at)
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }
}

/// 服务端词条（基线）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlossaryServerEntry {
    pub id: u64,
    pub concept: String,
}

/// 词汇表域服务端接口
#[async_trait]
pub trait GlossaryApi: Send + Sync {
    /// 拉取词汇表当前词条列表（冲突基线，必须走网络）
    async fn get_entries(&self, site_id: &str, glossary_id: u64) -> Result<Vec<GlossaryServerEntry>>;

    /// 新建词条，返回词条 id
    async fn add_entry(
        &self,
        site_id: &str,
        glossary_id: u64,
        concept: &str,
        definition: &str,
        options: &HashMap<String, Value>,
        attachments_draft_id: Option<u64>,
    ) -> Result<u64>;

    async fn invalidate_entries(&self, site_id: &str, glossary_id: u64) -> Result<()>;
}

/// 词汇表域同步服务
#[derive(Clone)]
pub struct GlossarySyncService {
    coordinator: SyncCoordinator<SyncResult>,
    blocks: Arc<SyncBlockRegistry>,
    entries: Arc<dyn OfflineMutationStore<GlossaryEntryRecord>>,
    api: Arc<dyn GlossaryApi>,
    network: Arc<NetworkMonitor>,
    reuploader: Arc<AttachmentReuploader>,
    files: StoredFileManager,
    events: Arc<EventManager>,
}

impl GlossarySyncService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator: SyncCoordinator<SyncResult>,
        blocks: Arc<SyncBlockRegistry>,
        entries: Arc<dyn OfflineMutationStore<GlossaryEntryRecord>>,
        api: Arc<dyn GlossaryApi>,
        network: Arc<NetworkMonitor>,
        reuploader: Arc<AttachmentReuploader>,
        files: StoredFileManager,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            coordinator,
            blocks,
            entries,
            api,
            network,
            reuploader,
            files,
            events,
        }
    }

    /// 同步站点内全部词汇表离线词条
    pub async fn sync_all_glossaries(&self, site_id: &str, force: bool) -> Result<()> {
        for entity in self.entries.pending_entities(site_id).await? {
            let SyncEntityId::EntityUser { id, user_id } = entity else {
                continue;
            };

            let outcome = if force {
                self.sync_glossary_entries(site_id, id, user_id).await.map(Some)
            } else {
                self.sync_glossary_entries_if_needed(site_id, id, user_id).await
            };

            match outcome {
                Ok(Some(result)) if result.updated => {
                    self.events.emit_sync_completed(
                        COMPONENT,
                        site_id,
                        &SyncEntityId::EntityUser { id, user_id },
                        &result,
                    );
                }
                Ok(_) => {}
                Err(e) if e.is_sync_blocked() => {
                    debug!("词汇表 {} 被编辑锁占用，本轮跳过", id);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    pub async fn sync_glossary_entries_if_needed(
        &self,
        site_id: &str,
        glossary_id: u64,
        user_id: u64,
    ) -> Result<Option<SyncResult>> {
        let entity = SyncEntityId::EntityUser {
            id: glossary_id,
            user_id,
        };
        if self.coordinator.is_sync_needed(&entity, site_id).await {
            return self
                .sync_glossary_entries(site_id, glossary_id, user_id)
                .await
                .map(Some);
        }
        Ok(None)
    }

    /// 同步某词汇表下该用户的离线词条
    pub async fn sync_glossary_entries(
        &self,
        site_id: &str,
        glossary_id: u64,
        user_id: u64,
    ) -> Result<SyncResult> {
        let entity = SyncEntityId::EntityUser {
            id: glossary_id,
            user_id,
        };

        if self.blocks.is_blocked(COMPONENT, &entity, site_id) {
            debug!("词汇表 {} 正在编辑中，无法同步", glossary_id);
            return Err(CampusSDKError::SyncBlocked {
                component: COMPONENT.to_string(),
                entity: entity.to_string(),
            });
        }

        if let Some(ongoing) = self.coordinator.get_ongoing_sync(&entity, site_id) {
            return ongoing.await;
        }

        debug!("尝试同步词汇表 {} 用户 {} 的词条 @ {}", glossary_id, user_id, site_id);

        let this = self.clone();
        let site = site_id.to_string();
        let work = async move { this.perform_sync(&site, glossary_id, user_id).await };

        self.coordinator.add_ongoing_sync(&entity, site_id, work).await
    }

    async fn perform_sync(&self, site_id: &str, glossary_id: u64, user_id: u64) -> Result<SyncResult> {
        let entity = SyncEntityId::EntityUser {
            id: glossary_id,
            user_id,
        };
        let mut result = SyncResult::default();

        let records = self.entries.get_pending(site_id, &entity).await?;
        if records.is_empty() {
            self.coordinator.record_sync_time(&entity, site_id).await;
            return Ok(result);
        }

        if !self.network.is_online().await {
            return Err(CampusSDKError::Offline);
        }

        // 冲突基线：服务端当前的概念列表
        let server_entries = self.api.get_entries(site_id, glossary_id).await?;

        let outcome: Result<()> = async {
            for record in &records {
                self.send_entry(site_id, &entity, record, &server_entries, &mut result)
                    .await?;
            }
            Ok(())
        }
        .await;

        if outcome.is_ok() && result.updated {
            if let Err(e) = self.api.invalidate_entries(site_id, glossary_id).await {
                debug!("失效词条缓存失败: {}", e);
            }
        }

        self.coordinator.record_sync_time(&entity, site_id).await;

        outcome?;
        Ok(result)
    }

    async fn send_entry(
        &self,
        site_id: &str,
        entity: &SyncEntityId,
        record: &GlossaryEntryRecord,
        server_entries: &[GlossaryServerEntry],
        result: &mut SyncResult,
    ) -> Result<()> {
        let duplicated = server_entries
            .iter()
            .any(|e| e.concept.eq_ignore_ascii_case(&record.concept));
        if duplicated {
            // 概念已在服务端存在：按冲突丢弃，不发送
            result.warnings.push(offline_data_deleted_warning(
                COMPONENT_NAME,
                &record.concept,
                "同名概念已在服务器端存在",
            ));
            result.updated = true;
            return self.delete_entry(site_id, entity, record).await;
        }

        let send_outcome: Result<()> = async {
            let draft_id = if record.attachments.is_empty() {
                None
            } else {
                Some(
                    self.reuploader
                        .reupload_set(
                            site_id,
                            COMPONENT,
                            record.glossary_id,
                            &record.attachments,
                            &record.attachment_area(),
                        )
                        .await?,
                )
            };
            self.api
                .add_entry(
                    site_id,
                    record.glossary_id,
                    &record.concept,
                    &record.definition,
                    &record.options,
                    draft_id,
                )
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
                &record.concept,
                &e.to_string(),
            ));
        }

        result.updated = true;
        self.delete_entry(site_id, entity, record).await
    }

    async fn delete_entry(
        &self,
        site_id: &str,
        entity: &SyncEntityId,
        record: &GlossaryEntryRecord,
    ) -> Result<()> {
        self.entries.delete(site_id, entity, &record.mutation_key()).await?;
        if record.attachments.has_offline {
            if let Err(e) = self
                .files
                .delete_stored_files(site_id, COMPONENT, &record.attachment_area())
                .await
            {
                debug!("清理词条附件目录失败: {}", e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SyncAgent for GlossarySyncService {
    fn component(&self) -> &'static str {
        COMPONENT
    }

    async fn has_pending(&self, site_id: &str) -> Result<bool> {
        self.entries.has_pending(site_id).await
    }

    async fn sync_site(&self, site_id: &str, force: bool) -> Result<()> {
        self.sync_all_glossaries(site_id, force).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::FileTransport;
    use crate::storage::kv::KvStore;
    use crate::storage::offline::KvMutationStore;
    use parking_lot::Mutex;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockGlossaryApi {
        server_concepts: Vec<String>,
        added: Mutex<Vec<String>>,
        fail_concept: Option<String>,
    }

    #[async_trait]
    impl GlossaryApi for MockGlossaryApi {
        async fn get_entries(&self, _site_id: &str, _glossary_id: u64) -> Result<Vec<GlossaryServerEntry>> {
            Ok(self
                .server_concepts
                .iter()
                .enumerate()
                .map(|(i, concept)| GlossaryServerEntry {
                    id: i as u64 + 1,
                    concept: concept.clone(),
                })
                .collect())
        }

        async fn add_entry(
            &self,
            _site_id: &str,
            _glossary_id: u64,
            concept: &str,
            _definition: &str,
            _options: &HashMap<String, Value>,
            _attachments_draft_id: Option<u64>,
        ) -> Result<u64> {
            if self.fail_concept.as_deref() == Some(concept) {
                return Err(CampusSDKError::from_ws_response("writefailed", "词条被拒绝"));
            }
            self.added.lock().push(concept.to_string());
            Ok(500)
        }

        async fn invalidate_entries(&self, _site_id: &str, _glossary_id: u64) -> Result<()> {
            Ok(())
        }
    }

    struct NoopTransport;

    #[async_trait]
    impl FileTransport for NoopTransport {
        async fn upload_to_draft_area(
            &self,
            _site_id: &str,
            _file_path: &Path,
            _file_name: &str,
            draft_area_id: Option<u64>,
        ) -> Result<u64> {
            Ok(draft_area_id.unwrap_or(321))
        }

        async fn download_remote_file(
            &self,
            _site_id: &str,
            _file_url: &str,
            _component: &str,
            _component_id: u64,
        ) -> Result<PathBuf> {
            Ok(PathBuf::from("/tmp/downloaded"))
        }
    }

    async fn harness(api: MockGlossaryApi) -> (GlossarySyncService, Arc<KvMutationStore<GlossaryEntryRecord>>, Arc<MockGlossaryApi>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let kv = Arc::new(KvStore::new(temp_dir.path()).await.unwrap());
        let entries = Arc::new(KvMutationStore::new(kv.clone(), "glossary_entry"));
        let api = Arc::new(api);
        let files = StoredFileManager::new(temp_dir.path().join("files"));

        let service = GlossarySyncService::new(
            SyncCoordinator::new(COMPONENT, kv.clone()),
            Arc::new(SyncBlockRegistry::new()),
            entries.clone(),
            api.clone(),
            Arc::new(NetworkMonitor::default()),
            Arc::new(AttachmentReuploader::new(Arc::new(NoopTransport), files.clone())),
            files,
            Arc::new(EventManager::default()),
        );

        (service, entries, api, temp_dir)
    }

    fn entry(concept: &str, created_at: i64) -> GlossaryEntryRecord {
        GlossaryEntryRecord {
            glossary_id: 10,
            course_id: 3,
            user_id: 1,
            concept: concept.to_string(),
            definition: "定义".to_string(),
            options: HashMap::new(),
            attachments: AttachmentSet::default(),
            created_at,
        }
    }

    #[tokio::test]
    async fn test_new_concept_is_sent() {
        let (service, entries, api, _tmp) = harness(MockGlossaryApi::default()).await;
        entries.save("site1", &entry("递归", 100)).await.unwrap();

        let result = service.sync_glossary_entries("site1", 10, 1).await.unwrap();
        assert!(result.updated);
        assert!(result.warnings.is_empty());
        assert_eq!(api.added.lock().clone(), vec!["递归"]);
    }

    #[tokio::test]
    async fn test_duplicate_concept_is_discarded_without_write() {
        let api = MockGlossaryApi {
            server_concepts: vec!["递归".to_string()],
            ..Default::default()
        };
        let (service, entries, api_ref, _tmp) = harness(api).await;
        entries.save("site1", &entry("递归", 100)).await.unwrap();

        let result = service.sync_glossary_entries("site1", 10, 1).await.unwrap();
        assert!(result.updated);
        assert_eq!(result.warnings.len(), 1);
        // 没发出写请求，记录已清掉
        assert!(api_ref.added.lock().is_empty());
        assert!(entries
            .get_pending("site1", &SyncEntityId::EntityUser { id: 10, user_id: 1 })
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_ws_rejection_discards_entry() {
        let api = MockGlossaryApi {
            fail_concept: Some("坏词条".to_string()),
            ..Default::default()
        };
        let (service, entries, _api, _tmp) = harness(api).await;
        entries.save("site1", &entry("坏词条", 100)).await.unwrap();
        entries.save("site1", &entry("好词条", 200)).await.unwrap();

        let result = service.sync_glossary_entries("site1", 10, 1).await.unwrap();
        assert!(result.updated);
        assert_eq!(result.warnings.len(), 1);
        assert!(entries
            .get_pending("site1", &SyncEntityId::EntityUser { id: 10, user_id: 1 })
            .await
            .unwrap()
            .is_empty());
    }
}
