//! KV 存储模块 - 基于 sled 的本地键值存储
//!
//! 本模块提供：
//! - 按站点隔离的命名空间（一个 Tree 对应一个站点）
//! - 同步时间戳、离线修改记录等引擎状态的持久化
//! - 站点删除时级联清理（drop 掉整个 Tree）

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use sled::{Db, Tree};
use serde::{Serialize, de::DeserializeOwned};
use crate::error::{CampusSDKError, Result};

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    #[allow(dead_code)]
    base_path: PathBuf,
    /// 主数据库实例
    db: Arc<Db>,
    /// 站点专属的 Tree 实例
    site_trees: Arc<RwLock<HashMap<String, Tree>>>,
}

impl KvStore {
    /// 创建新的 KV 存储实例
    pub async fn new(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path).await
            .map_err(|e| CampusSDKError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 打开 sled 数据库（进程切换后旧实例可能刚释放锁，重试多次带退避）
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<sled::Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            CampusSDKError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        Ok(Self {
            base_path,
            db: Arc::new(db),
            site_trees: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// 获取站点 Tree，不存在时按需打开
    async fn site_tree(&self, site_id: &str) -> Result<Tree> {
        {
            let trees = self.site_trees.read().await;
            if let Some(tree) = trees.get(site_id) {
                return Ok(tree.clone());
            }
        }

        let tree_name = format!("site_{}", site_id);
        let tree = self.db.open_tree(&tree_name)
            .map_err(|e| CampusSDKError::KvStore(format!("打开站点 Tree 失败: {}", e)))?;

        let mut trees = self.site_trees.write().await;
        trees.insert(site_id.to_string(), tree.clone());
        Ok(tree)
    }

    /// 删除站点的全部本地数据（站点登出/移除时级联清理）
    pub async fn drop_site(&self, site_id: &str) -> Result<()> {
        let mut trees = self.site_trees.write().await;
        trees.remove(site_id);

        let tree_name = format!("site_{}", site_id);
        self.db.drop_tree(&tree_name)
            .map_err(|e| CampusSDKError::KvStore(format!("删除站点 Tree 失败: {}", e)))?;

        tracing::info!("站点本地数据已清理: {}", site_id);
        Ok(())
    }

    /// 设置键值对
    pub async fn set<V>(&self, site_id: &str, key: &str, value: &V) -> Result<()>
    where
        V: Serialize,
    {
        let tree = self.site_tree(site_id).await?;
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| CampusSDKError::Serialization(format!("序列化值失败: {}", e)))?;

        tree.insert(key, value_bytes)
            .map_err(|e| CampusSDKError::KvStore(format!("设置键值对失败: {}", e)))?;

        Ok(())
    }

    /// 获取键值对
    pub async fn get<V>(&self, site_id: &str, key: &str) -> Result<Option<V>>
    where
        V: DeserializeOwned,
    {
        let tree = self.site_tree(site_id).await?;

        let result = tree.get(key)
            .map_err(|e| CampusSDKError::KvStore(format!("获取键值对失败: {}", e)))?;

        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| CampusSDKError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 删除键值对
    pub async fn delete(&self, site_id: &str, key: &str) -> Result<()> {
        let tree = self.site_tree(site_id).await?;

        tree.remove(key)
            .map_err(|e| CampusSDKError::KvStore(format!("删除键值对失败: {}", e)))?;

        Ok(())
    }

    /// 检查键是否存在
    pub async fn exists(&self, site_id: &str, key: &str) -> Result<bool> {
        let tree = self.site_tree(site_id).await?;

        let result = tree.contains_key(key)
            .map_err(|e| CampusSDKError::KvStore(format!("检查键存在失败: {}", e)))?;

        Ok(result)
    }

    /// 指定前缀下是否有任意键（存在性检查，不反序列化）
    pub async fn any_with_prefix(&self, site_id: &str, prefix: &str) -> Result<bool> {
        let tree = self.site_tree(site_id).await?;

        match tree.scan_prefix(prefix.as_bytes()).next() {
            Some(Ok(_)) => Ok(true),
            Some(Err(e)) => Err(CampusSDKError::KvStore(format!("扫描前缀失败: {}", e))),
            None => Ok(false),
        }
    }

    /// 获取指定前缀的所有键值对（键按字节序返回）
    pub async fn scan_prefix(&self, site_id: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let tree = self.site_tree(site_id).await?;
        let mut results = Vec::new();

        for entry in tree.scan_prefix(prefix.as_bytes()) {
            let (key, value_bytes) = entry
                .map_err(|e| CampusSDKError::KvStore(format!("扫描前缀失败: {}", e)))?;

            let key = String::from_utf8(key.to_vec())
                .map_err(|e| CampusSDKError::KvStore(format!("存储键不是合法 UTF-8: {}", e)))?;

            results.push((key, value_bytes.to_vec()));
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use serde_json::json;

    #[tokio::test]
    async fn test_kv_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        let test_data = json!({
            "name": "test",
            "value": 123
        });

        store.set("site1", "test_key", &test_data).await.unwrap();
        let retrieved: serde_json::Value = store.get("site1", "test_key").await.unwrap().unwrap();
        assert_eq!(retrieved, test_data);

        assert!(store.exists("site1", "test_key").await.unwrap());
        assert!(!store.exists("site1", "missing").await.unwrap());

        // 其它站点看不到这个键
        assert!(!store.exists("site2", "test_key").await.unwrap());

        store.delete("site1", "test_key").await.unwrap();
        let deleted: Option<serde_json::Value> = store.get("site1", "test_key").await.unwrap();
        assert!(deleted.is_none());
    }

    #[tokio::test]
    async fn test_kv_store_prefix_scan() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        for i in 1..=3 {
            let key = format!("queue:item{}", i);
            store.set("site1", &key, &json!({ "value": i })).await.unwrap();
        }
        store.set("site1", "other:key", &json!({})).await.unwrap();

        let results = store.scan_prefix("site1", "queue:").await.unwrap();
        assert_eq!(results.len(), 3);

        assert!(store.any_with_prefix("site1", "queue:").await.unwrap());
        assert!(!store.any_with_prefix("site1", "nothing:").await.unwrap());
        assert!(!store.any_with_prefix("site2", "queue:").await.unwrap());
    }

    #[tokio::test]
    async fn test_kv_store_drop_site() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        store.set("site1", "key", &json!(1)).await.unwrap();
        store.set("site2", "key", &json!(2)).await.unwrap();

        store.drop_site("site1").await.unwrap();

        assert!(!store.exists("site1", "key").await.unwrap());
        assert!(store.exists("site2", "key").await.unwrap());
    }
}
