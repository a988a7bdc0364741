//! 离线修改存储 - 待同步记录的持久化
//!
//! 每个内容域一个存储实例，按实体键组织待同步记录。契约刻意保持小：
//! 同步引擎只需要「枚举 / 读取 / 删除」，写入发生在 UI 的离线编辑路径。
//!
//! 「没有离线数据」是正常结果（空集合），不是错误；错误只保留给
//! 真正的存储故障。

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;
use crate::storage::kv::KvStore;
use crate::sync::SyncEntityId;

/// 一条待同步的离线记录
///
/// 各内容域定义自己的记录类型并实现本 trait；引擎只依赖这三个维度。
pub trait MutationRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// 记录归属的同步实体
    fn entity_id(&self) -> SyncEntityId;

    /// 实体内的记录键（同一实体下唯一，例如 userid 或 timecreated）
    fn mutation_key(&self) -> String;

    /// 记录创建时间（Unix 秒）。同一实体的记录严格按创建顺序回放。
    fn created_at(&self) -> i64;
}

/// 离线修改存储契约
#[async_trait]
pub trait OfflineMutationStore<M: MutationRecord>: Send + Sync {
    /// 保存（或覆盖）一条记录。UI 的离线编辑路径使用。
    async fn save(&self, site_id: &str, record: &M) -> Result<()>;

    /// 某实体的全部待同步记录，按创建时间升序
    async fn get_pending(&self, site_id: &str, entity: &SyncEntityId) -> Result<Vec<M>>;

    /// 站点内全部待同步记录（调度器使用）
    async fn get_all_pending(&self, site_id: &str) -> Result<Vec<M>>;

    /// 删除一条记录（发送成功或丢弃后调用）
    async fn delete(&self, site_id: &str, entity: &SyncEntityId, mutation_key: &str) -> Result<()>;

    /// 站点内至少有一条待同步记录的实体列表（去重）
    async fn pending_entities(&self, site_id: &str) -> Result<Vec<SyncEntityId>> {
        let mut entities = Vec::new();
        for record in self.get_all_pending(site_id).await? {
            let entity = record.entity_id();
            if !entities.contains(&entity) {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    /// 站点内是否存在任何待同步记录（廉价存在性检查）
    async fn has_pending(&self, site_id: &str) -> Result<bool>;
}

/// 存储的离线记录无法解码
///
/// 损坏的记录会被记日志并从存储中清掉，绝不允许一条坏记录把整个
/// 队列卡死。
#[derive(Debug, Clone, thiserror::Error)]
#[error("离线记录 {key} 解码失败: {reason}")]
pub struct MutationDecodeError {
    pub key: String,
    pub reason: String,
}

/// 基于 KV 存储的通用离线修改存储
///
/// 键格式：`{prefix}:{entity}:{mutation_key}`，entity 用
/// [`SyncEntityId`] 的 Display 形式，天然按实体聚簇。
pub struct KvMutationStore<M> {
    kv: Arc<KvStore>,
    prefix: &'static str,
    _marker: PhantomData<fn() -> M>,
}

impl<M: MutationRecord> KvMutationStore<M> {
    pub fn new(kv: Arc<KvStore>, prefix: &'static str) -> Self {
        Self {
            kv,
            prefix,
            _marker: PhantomData,
        }
    }

    fn record_key(&self, entity: &SyncEntityId, mutation_key: &str) -> String {
        format!("{}:{}:{}", self.prefix, entity, mutation_key)
    }

    fn entity_prefix(&self, entity: &SyncEntityId) -> String {
        format!("{}:{}:", self.prefix, entity)
    }

    /// 解码一批扫描结果，损坏的记录清掉并跳过
    async fn decode_records(&self, site_id: &str, raw: Vec<(String, Vec<u8>)>) -> Result<Vec<M>> {
        let mut records = Vec::with_capacity(raw.len());
        for (key, bytes) in raw {
            match serde_json::from_slice::<M>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    let decode_err = MutationDecodeError {
                        key: key.clone(),
                        reason: e.to_string(),
                    };
                    warn!("{}，该记录将被丢弃", decode_err);
                    self.kv.delete(site_id, &key).await?;
                }
            }
        }
        records.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.mutation_key().cmp(&b.mutation_key()))
        });
        Ok(records)
    }
}

#[async_trait]
impl<M: MutationRecord> OfflineMutationStore<M> for KvMutationStore<M> {
    async fn save(&self, site_id: &str, record: &M) -> Result<()> {
        let key = self.record_key(&record.entity_id(), &record.mutation_key());
        self.kv.set(site_id, &key, record).await
    }

    async fn get_pending(&self, site_id: &str, entity: &SyncEntityId) -> Result<Vec<M>> {
        let raw = self.kv.scan_prefix(site_id, &self.entity_prefix(entity)).await?;
        self.decode_records(site_id, raw).await
    }

    async fn get_all_pending(&self, site_id: &str) -> Result<Vec<M>> {
        let raw = self
            .kv
            .scan_prefix(site_id, &format!("{}:", self.prefix))
            .await?;
        self.decode_records(site_id, raw).await
    }

    async fn delete(&self, site_id: &str, entity: &SyncEntityId, mutation_key: &str) -> Result<()> {
        self.kv
            .delete(site_id, &self.record_key(entity, mutation_key))
            .await
    }

    async fn has_pending(&self, site_id: &str) -> Result<bool> {
        self.kv
            .any_with_prefix(site_id, &format!("{}:", self.prefix))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestRecord {
        entity: u64,
        user_id: u64,
        payload: String,
        created_at: i64,
    }

    impl MutationRecord for TestRecord {
        fn entity_id(&self) -> SyncEntityId {
            SyncEntityId::Entity(self.entity)
        }

        fn mutation_key(&self) -> String {
            self.user_id.to_string()
        }

        fn created_at(&self) -> i64 {
            self.created_at
        }
    }

    async fn new_store(temp_dir: &TempDir) -> KvMutationStore<TestRecord> {
        let kv = Arc::new(KvStore::new(temp_dir.path()).await.unwrap());
        KvMutationStore::new(kv, "test_mutation")
    }

    #[tokio::test]
    async fn test_save_get_delete_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir).await;
        let entity = SyncEntityId::Entity(42);

        let record = TestRecord {
            entity: 42,
            user_id: 7,
            payload: "draft".to_string(),
            created_at: 100,
        };
        store.save("site1", &record).await.unwrap();

        let pending = store.get_pending("site1", &entity).await.unwrap();
        assert_eq!(pending, vec![record.clone()]);
        assert!(store.has_pending("site1").await.unwrap());

        store.delete("site1", &entity, "7").await.unwrap();
        assert!(store.get_pending("site1", &entity).await.unwrap().is_empty());
        assert!(!store.has_pending("site1").await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_sorted_by_creation_order() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir).await;

        for (user_id, created_at) in [(3u64, 300i64), (1, 100), (2, 200)] {
            store
                .save(
                    "site1",
                    &TestRecord {
                        entity: 42,
                        user_id,
                        payload: String::new(),
                        created_at,
                    },
                )
                .await
                .unwrap();
        }

        let pending = store
            .get_pending("site1", &SyncEntityId::Entity(42))
            .await
            .unwrap();
        let order: Vec<i64> = pending.iter().map(|r| r.created_at).collect();
        assert_eq!(order, vec![100, 200, 300]);
    }

    #[tokio::test]
    async fn test_pending_entities_deduplicated() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir).await;

        for (entity, user_id) in [(42u64, 1u64), (42, 2), (43, 1)] {
            store
                .save(
                    "site1",
                    &TestRecord {
                        entity,
                        user_id,
                        payload: String::new(),
                        created_at: 0,
                    },
                )
                .await
                .unwrap();
        }

        let entities = store.pending_entities("site1").await.unwrap();
        assert_eq!(entities.len(), 2);
        assert!(entities.contains(&SyncEntityId::Entity(42)));
        assert!(entities.contains(&SyncEntityId::Entity(43)));
    }

    #[tokio::test]
    async fn test_corrupted_record_is_dropped_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let kv = Arc::new(KvStore::new(temp_dir.path()).await.unwrap());
        let store: KvMutationStore<TestRecord> = KvMutationStore::new(kv.clone(), "test_mutation");

        store
            .save(
                "site1",
                &TestRecord {
                    entity: 42,
                    user_id: 1,
                    payload: String::new(),
                    created_at: 100,
                },
            )
            .await
            .unwrap();
        // 手工写入一条解不开的记录
        kv.set("site1", "test_mutation:e:42:broken", &serde_json::json!("not a record"))
            .await
            .unwrap();

        let pending = store
            .get_pending("site1", &SyncEntityId::Entity(42))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        // 坏记录已被清掉，第二次读取不再触碰它
        assert!(!kv.exists("site1", "test_mutation:e:42:broken").await.unwrap());
    }
}
