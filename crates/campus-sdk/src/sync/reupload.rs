//! 附件重传器 - 把混合附件集合归一到一个草稿区
//!
//! 待同步记录的附件是异构的：一部分已经在服务端（编辑前就挂在实体上
//! 的在线文件），一部分是离线期间新选的本地文件。提交时服务端只认一个
//! 草稿区 id，所以这里把两类文件统一灌进同一个草稿区：
//!
//! - 在线文件先下载再重新上传，归一成草稿区内容
//! - 第一个文件上传时由服务端新建草稿区，其余文件按输入顺序追加
//! - 空集合直接返回众所周知的空草稿区 id，不打网络
//! - 任何一个文件失败，整个操作失败，错误里带上出错文件名

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CampusSDKError, Result};
use crate::http_client::FileTransport;
use crate::storage::files::StoredFileManager;

/// 空附件集合对应的草稿区 id（服务端约定值，表示"没有文件"）
pub const EMPTY_DRAFT_AREA_ID: u64 = 1;

/// 已在服务端的文件引用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineFileRef {
    pub file_url: String,
    pub file_name: String,
    /// 服务端最后修改时间，用于下载缓存判断
    pub time_modified: i64,
}

/// 重传输入：在线引用或本地文件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttachmentSource {
    Online(OnlineFileRef),
    Local(PathBuf),
}

impl AttachmentSource {
    fn file_name(&self) -> String {
        match self {
            AttachmentSource::Online(file) => file.file_name.clone(),
            AttachmentSource::Local(path) => path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("file")
                .to_string(),
        }
    }
}

/// 待同步记录携带的附件集合
///
/// 在线引用直接内嵌在记录里；本地文件存在附件目录中，记录只带一个
/// 标志位，同步时从目录枚举。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentSet {
    pub online: Vec<OnlineFileRef>,
    pub has_offline: bool,
}

impl AttachmentSet {
    pub fn is_empty(&self) -> bool {
        self.online.is_empty() && !self.has_offline
    }
}

/// 附件重传器
pub struct AttachmentReuploader {
    transport: Arc<dyn FileTransport>,
    files: StoredFileManager,
}

impl AttachmentReuploader {
    pub fn new(transport: Arc<dyn FileTransport>, files: StoredFileManager) -> Self {
        Self { transport, files }
    }

    /// 把一组附件上传到同一个草稿区，返回草稿区 id
    pub async fn reupload(
        &self,
        site_id: &str,
        component: &str,
        component_id: u64,
        sources: &[AttachmentSource],
    ) -> Result<u64> {
        if sources.is_empty() {
            return Ok(EMPTY_DRAFT_AREA_ID);
        }

        let mut used_names = HashSet::new();

        // 先传第一个文件拿到新草稿区 id
        let draft_id = self
            .upload_one(site_id, component, component_id, &sources[0], None, &mut used_names)
            .await?;

        // 其余文件逐个追加到同一草稿区，避免服务端命名竞争
        for source in &sources[1..] {
            self.upload_one(site_id, component, component_id, source, Some(draft_id), &mut used_names)
                .await?;
        }

        debug!(
            "附件重传完成: {} 个文件 -> 草稿区 {} ({} #{})",
            sources.len(),
            draft_id,
            component,
            component_id
        );

        Ok(draft_id)
    }

    /// 便捷入口：记录携带的 [`AttachmentSet`] + 附件目录区域
    pub async fn reupload_set(
        &self,
        site_id: &str,
        component: &str,
        component_id: u64,
        set: &AttachmentSet,
        area: &str,
    ) -> Result<u64> {
        let mut sources: Vec<AttachmentSource> =
            set.online.iter().cloned().map(AttachmentSource::Online).collect();

        if set.has_offline {
            for path in self.files.list_stored_files(site_id, component, area)? {
                sources.push(AttachmentSource::Local(path));
            }
        }

        self.reupload(site_id, component, component_id, &sources).await
    }

    async fn upload_one(
        &self,
        site_id: &str,
        component: &str,
        component_id: u64,
        source: &AttachmentSource,
        draft_id: Option<u64>,
        used_names: &mut HashSet<String>,
    ) -> Result<u64> {
        let file_name = unique_file_name(used_names, &source.file_name());
        used_names.insert(file_name.to_lowercase());

        let local_path = match source {
            AttachmentSource::Local(path) => path.clone(),
            AttachmentSource::Online(file) => {
                // 在线文件先落地，再以草稿区文件的身份传回去
                self.transport
                    .download_remote_file(site_id, &file.file_url, component, component_id)
                    .await
                    .map_err(|e| with_file_context(&file_name, e))?
            }
        };

        self.transport
            .upload_to_draft_area(site_id, &local_path, &file_name, draft_id)
            .await
            .map_err(|e| with_file_context(&file_name, e))
    }
}

/// 给错误补上文件上下文
///
/// 服务端结构化拒绝保持原分类（调用方据此决定丢弃记录），
/// 其余错误包成附件错误并带上文件名。
fn with_file_context(file_name: &str, error: CampusSDKError) -> CampusSDKError {
    match error {
        CampusSDKError::WebService { code, message } => CampusSDKError::WebService {
            code,
            message: format!("{}: {}", file_name, message),
        },
        other => CampusSDKError::Attachment {
            file_name: file_name.to_string(),
            source: Box::new(other),
        },
    }
}

/// 在草稿区内保证文件名唯一（大小写不敏感），冲突时在扩展名前加序号
fn unique_file_name(used: &HashSet<String>, name: &str) -> String {
    if !used.contains(&name.to_lowercase()) {
        return name.to_string();
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{}", ext)),
        _ => (name.to_string(), String::new()),
    };

    let mut counter = 1;
    loop {
        let candidate = format!("{}_{}{}", stem, counter, ext);
        if !used.contains(&candidate.to_lowercase()) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::Path;
    use tempfile::TempDir;

    /// 内存文件传输：记录调用序列，可注入指定文件的失败
    #[derive(Default)]
    struct MockTransport {
        uploads: Mutex<Vec<(String, Option<u64>)>>,
        downloads: Mutex<Vec<String>>,
        fail_on: Mutex<Option<String>>,
        next_draft_id: Mutex<u64>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                next_draft_id: Mutex::new(100),
                ..Default::default()
            }
        }

        fn fail_on(self, file_name: &str) -> Self {
            *self.fail_on.lock() = Some(file_name.to_string());
            self
        }

        fn uploaded_names(&self) -> Vec<String> {
            self.uploads.lock().iter().map(|(n, _)| n.clone()).collect()
        }
    }

    #[async_trait]
    impl FileTransport for MockTransport {
        async fn upload_to_draft_area(
            &self,
            _site_id: &str,
            _file_path: &Path,
            file_name: &str,
            draft_area_id: Option<u64>,
        ) -> Result<u64> {
            if self.fail_on.lock().as_deref() == Some(file_name) {
                return Err(CampusSDKError::Transport("connection reset".to_string()));
            }
            self.uploads.lock().push((file_name.to_string(), draft_area_id));
            match draft_area_id {
                Some(id) => Ok(id),
                None => {
                    let mut next = self.next_draft_id.lock();
                    *next += 1;
                    Ok(*next)
                }
            }
        }

        async fn download_remote_file(
            &self,
            _site_id: &str,
            file_url: &str,
            _component: &str,
            _component_id: u64,
        ) -> Result<PathBuf> {
            self.downloads.lock().push(file_url.to_string());
            Ok(PathBuf::from("/tmp/downloaded"))
        }
    }

    fn online(name: &str) -> AttachmentSource {
        AttachmentSource::Online(OnlineFileRef {
            file_url: format!("https://files.example.com/{}", name),
            file_name: name.to_string(),
            time_modified: 0,
        })
    }

    fn new_reuploader(transport: Arc<MockTransport>, temp_dir: &TempDir) -> AttachmentReuploader {
        AttachmentReuploader::new(transport, StoredFileManager::new(temp_dir.path()))
    }

    #[tokio::test]
    async fn test_empty_input_short_circuits() {
        let transport = Arc::new(MockTransport::new());
        let temp_dir = TempDir::new().unwrap();
        let reuploader = new_reuploader(transport.clone(), &temp_dir);

        let draft = reuploader.reupload("site1", "mod_forum", 5, &[]).await.unwrap();
        assert_eq!(draft, EMPTY_DRAFT_AREA_ID);
        assert!(transport.uploads.lock().is_empty());
        assert!(transport.downloads.lock().is_empty());
    }

    #[tokio::test]
    async fn test_first_file_creates_draft_rest_append() {
        let transport = Arc::new(MockTransport::new());
        let temp_dir = TempDir::new().unwrap();
        let reuploader = new_reuploader(transport.clone(), &temp_dir);

        let sources = vec![
            AttachmentSource::Local(PathBuf::from("/data/a.txt")),
            AttachmentSource::Local(PathBuf::from("/data/b.txt")),
            AttachmentSource::Local(PathBuf::from("/data/c.txt")),
        ];
        let draft = reuploader.reupload("site1", "mod_forum", 5, &sources).await.unwrap();

        let uploads = transport.uploads.lock().clone();
        assert_eq!(uploads[0], ("a.txt".to_string(), None));
        assert_eq!(uploads[1], ("b.txt".to_string(), Some(draft)));
        assert_eq!(uploads[2], ("c.txt".to_string(), Some(draft)));
    }

    #[tokio::test]
    async fn test_online_files_are_downloaded_then_uploaded() {
        let transport = Arc::new(MockTransport::new());
        let temp_dir = TempDir::new().unwrap();
        let reuploader = new_reuploader(transport.clone(), &temp_dir);

        let sources = vec![online("report.pdf"), online("notes.txt")];
        reuploader.reupload("site1", "mod_assign", 42, &sources).await.unwrap();

        // 每个在线文件都先下载再上传，没有直接引用远端文件的路径
        assert_eq!(transport.downloads.lock().len(), 2);
        assert_eq!(transport.uploaded_names(), vec!["report.pdf", "notes.txt"]);
    }

    #[tokio::test]
    async fn test_all_online_input_is_repeatable() {
        let temp_dir = TempDir::new().unwrap();
        let sources = vec![online("report.pdf"), online("notes.txt")];

        let t1 = Arc::new(MockTransport::new());
        new_reuploader(t1.clone(), &temp_dir)
            .reupload("site1", "mod_assign", 42, &sources)
            .await
            .unwrap();

        let t2 = Arc::new(MockTransport::new());
        new_reuploader(t2.clone(), &temp_dir)
            .reupload("site1", "mod_assign", 42, &sources)
            .await
            .unwrap();

        // 两次调用得到内容等价的草稿区（同样的文件、同样的顺序）
        assert_eq!(t1.uploaded_names(), t2.uploaded_names());
    }

    #[tokio::test]
    async fn test_single_failure_fails_whole_operation() {
        let transport = Arc::new(MockTransport::new().fail_on("b.txt"));
        let temp_dir = TempDir::new().unwrap();
        let reuploader = new_reuploader(transport.clone(), &temp_dir);

        let sources = vec![
            AttachmentSource::Local(PathBuf::from("/data/a.txt")),
            AttachmentSource::Local(PathBuf::from("/data/b.txt")),
        ];
        let err = reuploader
            .reupload("site1", "mod_forum", 5, &sources)
            .await
            .unwrap_err();

        // 错误指出了是哪个文件失败
        match err {
            CampusSDKError::Attachment { file_name, .. } => assert_eq!(file_name, "b.txt"),
            other => panic!("期望附件错误，得到 {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reupload_set_combines_online_and_stored() {
        let transport = Arc::new(MockTransport::new());
        let temp_dir = TempDir::new().unwrap();
        let files = StoredFileManager::new(temp_dir.path());
        files
            .store_file("site1", "mod_forum", "reply_9", "local.txt", b"body")
            .await
            .unwrap();
        let reuploader = AttachmentReuploader::new(transport.clone(), files);

        let set = AttachmentSet {
            online: vec![OnlineFileRef {
                file_url: "https://files.example.com/old.pdf".to_string(),
                file_name: "old.pdf".to_string(),
                time_modified: 0,
            }],
            has_offline: true,
        };
        reuploader
            .reupload_set("site1", "mod_forum", 9, &set, "reply_9")
            .await
            .unwrap();

        assert_eq!(transport.uploaded_names(), vec!["old.pdf", "local.txt"]);
    }

    #[test]
    fn test_unique_file_name() {
        let mut used = HashSet::new();
        assert_eq!(unique_file_name(&used, "a.txt"), "a.txt");

        used.insert("a.txt".to_string());
        assert_eq!(unique_file_name(&used, "a.txt"), "a_1.txt");
        assert_eq!(unique_file_name(&used, "A.TXT"), "A_1.TXT");

        used.insert("a_1.txt".to_string());
        assert_eq!(unique_file_name(&used, "a.txt"), "a_2.txt");

        // 无扩展名
        used.insert("readme".to_string());
        assert_eq!(unique_file_name(&used, "readme"), "readme_1");
    }
}
