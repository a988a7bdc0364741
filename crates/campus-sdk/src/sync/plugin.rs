//! 提交插件委托 - 按插件类型的策略注册表
//!
//! 一份作业提交由若干插件组成（文本、文件、…）。每种插件类型注册一个
//! 处理器，负责三件事：把表单输入转成提交载荷、把离线存储的字段转成
//! 同步载荷、判断输入相对服务端基线是否有变化（编辑器用它决定要不要
//! 存离线记录，警告文案也依赖同一套比较逻辑）。
//!
//! 未注册的插件类型不是错误，只是「不支持离线编辑」：查找返回 None，
//! 委托方法安静跳过。

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::sync::reupload::{AttachmentReuploader, AttachmentSet, OnlineFileRef};

/// 表单输入字段
pub type FormFields = HashMap<String, Value>;

/// 发往服务端的载荷字段
pub type PluginData = HashMap<String, Value>;

/// 服务端当前插件状态快照（编辑与冲突判断的基线）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginSnapshot {
    pub plugin_type: String,
    /// 当前字段值（如已提交的正文）
    pub fields: HashMap<String, Value>,
    /// 当前挂在实体上的在线文件
    pub files: Vec<OnlineFileRef>,
}

/// 离线记录里属于某个插件的那部分数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OfflinePluginData {
    pub fields: HashMap<String, Value>,
    pub attachments: AttachmentSet,
    /// 本地附件目录区域名（如 `submission_7`）
    pub area: String,
}

/// 插件处理器的调用上下文
pub struct PluginContext<'a> {
    pub component: &'a str,
    pub entity_id: u64,
    pub site_id: &'a str,
    pub plugin: &'a PluginSnapshot,
}

/// 提交插件处理器
#[async_trait]
pub trait SubmissionPluginHandler: Send + Sync {
    /// 插件类型串（注册表键）
    fn plugin_type(&self) -> &'static str;

    /// 站点层面是否允许离线编辑该插件
    fn is_enabled_for_edit(&self) -> bool {
        true
    }

    /// 表单输入 → 提交载荷（在线编辑路径）
    async fn prepare_submission_data(
        &self,
        ctx: &PluginContext<'_>,
        input: &FormFields,
        out: &mut PluginData,
    ) -> Result<()>;

    /// 离线存储字段 → 同步载荷（同步引擎路径）
    async fn prepare_sync_data(
        &self,
        ctx: &PluginContext<'_>,
        offline: &OfflinePluginData,
        out: &mut PluginData,
    ) -> Result<()>;

    /// 输入相对服务端基线是否有变化
    async fn has_data_changed(&self, ctx: &PluginContext<'_>, input: &FormFields) -> Result<bool>;
}

/// 提交插件注册表
///
/// 启动时每种插件类型注册一次，之后只读。
#[derive(Default)]
pub struct SubmissionPluginDelegate {
    handlers: RwLock<HashMap<String, Arc<dyn SubmissionPluginHandler>>>,
}

impl SubmissionPluginDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn SubmissionPluginHandler>) {
        let plugin_type = handler.plugin_type().to_string();
        debug!("注册提交插件处理器: {}", plugin_type);
        self.handlers.write().insert(plugin_type, handler);
    }

    fn lookup(&self, plugin_type: &str) -> Option<Arc<dyn SubmissionPluginHandler>> {
        self.handlers.read().get(plugin_type).cloned()
    }

    /// 插件类型是否支持离线编辑
    pub fn is_supported(&self, plugin_type: &str) -> bool {
        self.lookup(plugin_type)
            .map(|h| h.is_enabled_for_edit())
            .unwrap_or(false)
    }

    /// 表单输入 → 提交载荷。未注册类型安静跳过。
    pub async fn prepare_submission_data(
        &self,
        ctx: &PluginContext<'_>,
        input: &FormFields,
        out: &mut PluginData,
    ) -> Result<()> {
        match self.lookup(&ctx.plugin.plugin_type) {
            Some(handler) if handler.is_enabled_for_edit() => {
                handler.prepare_submission_data(ctx, input, out).await
            }
            _ => Ok(()),
        }
    }

    /// 离线字段 → 同步载荷。未注册类型安静跳过。
    pub async fn prepare_sync_data(
        &self,
        ctx: &PluginContext<'_>,
        offline: &OfflinePluginData,
        out: &mut PluginData,
    ) -> Result<()> {
        match self.lookup(&ctx.plugin.plugin_type) {
            Some(handler) if handler.is_enabled_for_edit() => {
                handler.prepare_sync_data(ctx, offline, out).await
            }
            _ => Ok(()),
        }
    }

    /// 输入相对基线是否有变化。未注册类型视为无变化。
    pub async fn has_data_changed(&self, ctx: &PluginContext<'_>, input: &FormFields) -> Result<bool> {
        match self.lookup(&ctx.plugin.plugin_type) {
            Some(handler) if handler.is_enabled_for_edit() => {
                handler.has_data_changed(ctx, input).await
            }
            _ => Ok(false),
        }
    }
}

/// 文本类提交插件
///
/// 字段约定：`text`（正文）与 `format`（富文本格式号）。
pub struct TextSubmissionHandler;

impl TextSubmissionHandler {
    fn text_of(fields: &HashMap<String, Value>) -> &str {
        fields.get("text").and_then(Value::as_str).unwrap_or("")
    }
}

#[async_trait]
impl SubmissionPluginHandler for TextSubmissionHandler {
    fn plugin_type(&self) -> &'static str {
        "text"
    }

    async fn prepare_submission_data(
        &self,
        _ctx: &PluginContext<'_>,
        input: &FormFields,
        out: &mut PluginData,
    ) -> Result<()> {
        out.insert(
            "text_editor".to_string(),
            json!({
                "text": Self::text_of(input),
                "format": input.get("format").cloned().unwrap_or(json!(1)),
            }),
        );
        Ok(())
    }

    async fn prepare_sync_data(
        &self,
        _ctx: &PluginContext<'_>,
        offline: &OfflinePluginData,
        out: &mut PluginData,
    ) -> Result<()> {
        out.insert(
            "text_editor".to_string(),
            json!({
                "text": Self::text_of(&offline.fields),
                "format": offline.fields.get("format").cloned().unwrap_or(json!(1)),
            }),
        );
        Ok(())
    }

    async fn has_data_changed(&self, ctx: &PluginContext<'_>, input: &FormFields) -> Result<bool> {
        // 富文本编辑器经常附带尾部空白，比较时忽略
        let current = Self::text_of(&ctx.plugin.fields).trim_end();
        let entered = Self::text_of(input).trim_end();
        Ok(current != entered)
    }
}

/// 文件类提交插件
///
/// 同步时把离线附件集合重传成草稿区，载荷里只放草稿区 id。
pub struct FileSubmissionHandler {
    reuploader: Arc<AttachmentReuploader>,
}

impl FileSubmissionHandler {
    pub fn new(reuploader: Arc<AttachmentReuploader>) -> Self {
        Self { reuploader }
    }

    fn input_file_names(input: &FormFields) -> Vec<String> {
        input
            .get("files")
            .and_then(Value::as_array)
            .map(|files| {
                files
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl SubmissionPluginHandler for FileSubmissionHandler {
    fn plugin_type(&self) -> &'static str {
        "file"
    }

    async fn prepare_submission_data(
        &self,
        _ctx: &PluginContext<'_>,
        input: &FormFields,
        out: &mut PluginData,
    ) -> Result<()> {
        // 在线编辑路径：编辑器已经把文件传进草稿区，这里透传 id
        if let Some(draft_id) = input.get("files_draft_id") {
            out.insert("files_draft_id".to_string(), draft_id.clone());
        }
        Ok(())
    }

    async fn prepare_sync_data(
        &self,
        ctx: &PluginContext<'_>,
        offline: &OfflinePluginData,
        out: &mut PluginData,
    ) -> Result<()> {
        let draft_id = self
            .reuploader
            .reupload_set(
                ctx.site_id,
                ctx.component,
                ctx.entity_id,
                &offline.attachments,
                &offline.area,
            )
            .await?;
        out.insert("files_draft_id".to_string(), json!(draft_id));
        Ok(())
    }

    async fn has_data_changed(&self, ctx: &PluginContext<'_>, input: &FormFields) -> Result<bool> {
        let current: Vec<String> = ctx.plugin.files.iter().map(|f| f.file_name.clone()).collect();
        Ok(Self::input_file_names(input) != current)
    }
}
