use std::fmt;

#[derive(Debug, Clone)]
pub enum CampusSDKError {
    KvStore(String),
    Serialization(String),
    IO(String),
    InvalidData(String),
    Config(String),
    Runtime(String),
    Other(String),
    /// 设备离线，整批同步被拒绝
    Offline,
    /// 实体正在被编辑器占用，同步被阻塞
    SyncBlocked {
        component: String,
        entity: String,
    },
    /// 网络/传输层失败（可在下一次同步重试）
    Transport(String),
    /// 服务端结构化拒绝（校验错误等，不可重试，丢弃本地数据）
    WebService {
        code: String,
        message: String,
    },
    /// 附件处理失败，保留文件上下文
    Attachment {
        file_name: String,
        source: Box<CampusSDKError>,
    },
}

impl fmt::Display for CampusSDKError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CampusSDKError::KvStore(e) => write!(f, "KV store error: {}", e),
            CampusSDKError::Serialization(e) => write!(f, "Serialization error: {}", e),
            CampusSDKError::IO(e) => write!(f, "IO error: {}", e),
            CampusSDKError::InvalidData(e) => write!(f, "Invalid data: {}", e),
            CampusSDKError::Config(e) => write!(f, "Config error: {}", e),
            CampusSDKError::Runtime(e) => write!(f, "Runtime error: {}", e),
            CampusSDKError::Other(e) => write!(f, "Other error: {}", e),
            CampusSDKError::Offline => write!(f, "Device is offline"),
            CampusSDKError::SyncBlocked { component, entity } => {
                write!(f, "Sync blocked: {} {} is being edited", component, entity)
            }
            CampusSDKError::Transport(e) => write!(f, "Transport error: {}", e),
            CampusSDKError::WebService { code, message } => {
                write!(f, "Web service error [{}]: {}", code, message)
            }
            CampusSDKError::Attachment { file_name, source } => {
                write!(f, "Attachment error ({}): {}", file_name, source)
            }
        }
    }
}

impl std::error::Error for CampusSDKError {}

impl From<serde_json::Error> for CampusSDKError {
    fn from(error: serde_json::Error) -> Self {
        CampusSDKError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for CampusSDKError {
    fn from(error: std::io::Error) -> Self {
        CampusSDKError::IO(error.to_string())
    }
}

impl From<sled::Error> for CampusSDKError {
    fn from(error: sled::Error) -> Self {
        CampusSDKError::KvStore(error.to_string())
    }
}

impl CampusSDKError {
    /// 判断是否是服务端结构化拒绝（wserror 类）
    ///
    /// 返回 true 表示服务端明确拒绝了这份数据：对应的离线记录应当被
    /// 丢弃并记录警告，而不是留在队列里无限重试。
    pub fn is_webservice_error(&self) -> bool {
        match self {
            CampusSDKError::WebService { .. } => true,
            CampusSDKError::Attachment { source, .. } => source.is_webservice_error(),
            _ => false,
        }
    }

    /// 判断是否是同步被阻塞错误
    pub fn is_sync_blocked(&self) -> bool {
        matches!(self, CampusSDKError::SyncBlocked { .. })
    }

    /// 从服务端响应创建 WebService 错误
    pub fn from_ws_response(code: impl Into<String>, message: impl Into<String>) -> Self {
        CampusSDKError::WebService {
            code: code.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CampusSDKError>;
