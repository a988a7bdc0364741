//! HTTP 客户端模块 - 草稿区文件上传/下载
//!
//! 服务端以「草稿区」组织上传：第一次上传拿到 draft item id，
//! 后续文件带着同一个 id 传入同一个草稿区，最终提交时整个草稿区
//! 作为附件集合挂到业务数据上。
//!
//! [`FileTransport`] 是引擎依赖的边界；[`FileHttpClient`] 是基于
//! reqwest 的默认实现，测试里用内存实现替换。

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::RwLock;
use reqwest::{multipart, Client, StatusCode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::error::{CampusSDKError, Result};

/// HTTP 客户端配置
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(30),
            request_timeout_secs: Some(300), // 文件上传可能需要较长时间
        }
    }
}

/// 草稿区上传响应
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DraftUploadResponse {
    pub item_id: u64,
    #[serde(default)]
    pub file_url: Option<String>,
}

/// 服务端错误响应体（区分校验拒绝与传输故障的依据）
#[derive(Debug, Clone, serde::Deserialize)]
struct WsErrorBody {
    #[serde(rename = "errorcode")]
    error_code: String,
    message: String,
}

/// 文件传输边界
///
/// 上传返回草稿区 id；`draft_area_id` 为 None 时由服务端新建草稿区。
#[async_trait]
pub trait FileTransport: Send + Sync {
    async fn upload_to_draft_area(
        &self,
        site_id: &str,
        file_path: &Path,
        file_name: &str,
        draft_area_id: Option<u64>,
    ) -> Result<u64>;

    /// 下载远端文件到本地，返回本地路径。component/component_id 用于
    /// 下载缓存归属标记。
    async fn download_remote_file(
        &self,
        site_id: &str,
        file_url: &str,
        component: &str,
        component_id: u64,
    ) -> Result<PathBuf>;
}

/// HTTP 文件客户端（reqwest 实现）
pub struct FileHttpClient {
    client: Client,
    base_url: String,
    download_dir: PathBuf,
    /// 各站点的上传令牌（登录层写入）
    site_tokens: RwLock<HashMap<String, String>>,
}

impl FileHttpClient {
    pub fn new(
        config: &HttpClientConfig,
        base_url: impl Into<String>,
        download_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let mut builder = Client::builder();

        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }

        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| CampusSDKError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            download_dir: download_dir.into(),
            site_tokens: RwLock::new(HashMap::new()),
        })
    }

    /// 登录层注入站点上传令牌
    pub fn set_site_token(&self, site_id: &str, token: impl Into<String>) {
        self.site_tokens.write().insert(site_id.to_string(), token.into());
    }

    fn site_token(&self, site_id: &str) -> Result<String> {
        self.site_tokens
            .read()
            .get(site_id)
            .cloned()
            .ok_or_else(|| CampusSDKError::Config(format!("站点 {} 没有上传令牌", site_id)))
    }

    /// 非 2xx 响应的归类：能解析出结构化错误体的算服务端拒绝，
    /// 其余一律按传输失败处理。
    async fn classify_error_response(status: StatusCode, response: reqwest::Response) -> CampusSDKError {
        let body = response.text().await.unwrap_or_else(|_| "无法读取错误信息".to_string());
        if let Ok(ws_error) = serde_json::from_str::<WsErrorBody>(&body) {
            return CampusSDKError::WebService {
                code: ws_error.error_code,
                message: ws_error.message,
            };
        }
        error!("❌ 请求失败，HTTP 状态码: {}, 错误: {}", status, body);
        CampusSDKError::Transport(format!("HTTP 状态码: {} ({})", status, body))
    }
}

#[async_trait]
impl FileTransport for FileHttpClient {
    async fn upload_to_draft_area(
        &self,
        site_id: &str,
        file_path: &Path,
        file_name: &str,
        draft_area_id: Option<u64>,
    ) -> Result<u64> {
        let token = self.site_token(site_id)?;

        let file_data = tokio::fs::read(file_path)
            .await
            .map_err(|e| CampusSDKError::IO(format!("读取文件失败: {}", e)))?;
        let file_size = file_data.len();

        info!("📤 开始上传文件: {} ({} bytes)", file_name, file_size);

        let mime_type = detect_mime_type(file_path);
        let part = multipart::Part::bytes(file_data)
            .file_name(file_name.to_string())
            .mime_str(&mime_type)
            .map_err(|e| CampusSDKError::Other(format!("创建 multipart part 失败: {}", e)))?;

        let mut form = multipart::Form::new().part("file", part);
        if let Some(item_id) = draft_area_id {
            form = form.text("itemid", item_id.to_string());
        }

        let url = format!("{}/sites/{}/draftfiles", self.base_url, site_id);
        let response = self
            .client
            .post(&url)
            .header("X-Upload-Token", token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| CampusSDKError::Transport(format!("上传文件失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify_error_response(status, response).await);
        }

        let result: DraftUploadResponse = response
            .json()
            .await
            .map_err(|e| CampusSDKError::Serialization(format!("解析上传响应失败: {}", e)))?;

        info!("✅ 文件上传成功: {} -> 草稿区 {}", file_name, result.item_id);

        Ok(result.item_id)
    }

    async fn download_remote_file(
        &self,
        _site_id: &str,
        file_url: &str,
        component: &str,
        component_id: u64,
    ) -> Result<PathBuf> {
        info!(
            "📥 开始下载文件: {} ({}#{})",
            file_url, component, component_id
        );

        let response = self
            .client
            .get(file_url)
            .send()
            .await
            .map_err(|e| CampusSDKError::Transport(format!("下载文件失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify_error_response(status, response).await);
        }

        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| CampusSDKError::IO(format!("创建下载目录失败: {}", e)))?;

        // 临时文件名带 uuid 前缀，避免并发下载同名文件互相覆盖
        let file_name = file_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("file");
        let output_path = self
            .download_dir
            .join(format!("{}_{}", uuid::Uuid::new_v4(), file_name));

        let mut file = tokio::fs::File::create(&output_path)
            .await
            .map_err(|e| CampusSDKError::IO(format!("创建输出文件失败: {}", e)))?;

        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;
        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result
                .map_err(|e| CampusSDKError::Transport(format!("读取数据块失败: {}", e)))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| CampusSDKError::IO(format!("写入文件失败: {}", e)))?;
            downloaded += chunk.len() as u64;
        }

        file.sync_all()
            .await
            .map_err(|e| CampusSDKError::IO(format!("同步文件失败: {}", e)))?;

        info!("✅ 文件下载成功: {} ({} bytes)", output_path.display(), downloaded);

        Ok(output_path)
    }
}

/// 检测文件的 MIME 类型（简单实现）
fn detect_mime_type(path: &Path) -> String {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        match ext.to_lowercase().as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "gif" => "image/gif",
            "mp4" => "video/mp4",
            "mp3" => "audio/mpeg",
            "pdf" => "application/pdf",
            "zip" => "application/zip",
            "txt" => "text/plain",
            "html" | "htm" => "text/html",
            "doc" | "docx" => "application/msword",
            _ => "application/octet-stream",
        }
    } else {
        "application/octet-stream"
    }
    .to_string()
}
