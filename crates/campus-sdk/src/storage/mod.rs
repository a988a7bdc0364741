//! 存储层
//!
//! - `kv`：基于 sled 的站点隔离键值存储（同步时间戳、离线记录落盘）
//! - `offline`：离线修改存储契约与通用实现
//! - `files`：离线附件目录管理

pub mod files;
pub mod kv;
pub mod offline;

pub use files::StoredFileManager;
pub use kv::KvStore;
pub use offline::{KvMutationStore, MutationDecodeError, MutationRecord, OfflineMutationStore};
