//! 本地附件目录管理
//!
//! 离线编辑时选择的附件会被复制到按 (站点, 组件, 区域) 组织的目录里，
//! 同步时从目录枚举出来交给重传器。记录删除时目录一并清理。
//!
//! 目录布局：`{base}/{site_id}/{component}/{area}/...`

use std::path::PathBuf;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{CampusSDKError, Result};

/// 离线附件目录管理器
#[derive(Debug, Clone)]
pub struct StoredFileManager {
    base_path: PathBuf,
}

impl StoredFileManager {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// 附件区域目录。area 由调用域决定，例如 `reply_12`、`entry_1650000000`。
    pub fn area_dir(&self, site_id: &str, component: &str, area: &str) -> PathBuf {
        self.base_path.join(site_id).join(component).join(area)
    }

    /// 把一个本地文件存入附件区域（UI 离线编辑路径）
    pub async fn store_file(
        &self,
        site_id: &str,
        component: &str,
        area: &str,
        file_name: &str,
        contents: &[u8],
    ) -> Result<PathBuf> {
        let dir = self.area_dir(site_id, component, area);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CampusSDKError::IO(format!("创建附件目录失败: {}", e)))?;

        let path = dir.join(file_name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| CampusSDKError::IO(format!("写入附件失败: {}", e)))?;

        Ok(path)
    }

    /// 枚举附件区域内的全部文件（稳定排序）。目录不存在时返回空列表。
    pub fn list_stored_files(&self, site_id: &str, component: &str, area: &str) -> Result<Vec<PathBuf>> {
        let dir = self.area_dir(site_id, component, area);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1) {
            let entry = entry
                .map_err(|e| CampusSDKError::IO(format!("枚举附件目录失败: {}", e)))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// 删除附件区域（记录发送成功或被丢弃后调用）。目录不存在不算错误。
    pub async fn delete_stored_files(&self, site_id: &str, component: &str, area: &str) -> Result<()> {
        let dir = self.area_dir(site_id, component, area);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!("附件目录已清理: {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CampusSDKError::IO(format!("清理附件目录失败: {}", e))),
        }
    }
}
