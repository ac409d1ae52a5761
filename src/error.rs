use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 推理 Oracle 调用错误
    #[error("Oracle错误: {0}")]
    Oracle(#[from] OracleError),
    /// 向量服务错误
    #[error("向量服务错误: {0}")]
    Embedding(#[from] EmbeddingError),
    /// 题库存储错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 推理 Oracle 调用错误
///
/// 涵盖传输层失败与响应协议违规两类。协议违规（`SchemaViolation` /
/// `UnknownLabel` / `SnippetMismatch`）表示模型输出不符合约定格式，
/// 可在有限次数内重试。
#[derive(Debug, Error)]
pub enum OracleError {
    /// API 调用失败
    #[error("Oracle API调用失败 (模型: {model}): {source}")]
    ApiCallFailed {
        model: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 返回内容为空
    #[error("Oracle返回内容为空 (模型: {model})")]
    EmptyContent { model: String },
    /// 响应不符合约定格式
    #[error("Oracle响应格式违规: {reason} (响应预览: {preview})")]
    SchemaViolation { reason: String, preview: String },
    /// 题型标签超出封闭词表
    #[error("题型标签超出封闭词表: '{label}'")]
    UnknownLabel { label: String },
    /// 返回的题目起始片段与原文不符
    #[error("题目起始片段与原文不符: '{snippet}'")]
    SnippetMismatch { snippet: String },
}

impl OracleError {
    /// 判断是否为响应协议违规（区别于传输层失败）
    pub fn is_schema_violation(&self) -> bool {
        matches!(
            self,
            OracleError::SchemaViolation { .. }
                | OracleError::UnknownLabel { .. }
                | OracleError::SnippetMismatch { .. }
        )
    }
}

/// 向量服务错误
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// 网络请求失败
    #[error("Embedding请求失败 ({endpoint}): {source}")]
    RequestFailed {
        endpoint: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// API 返回错误响应
    #[error("Embedding API返回错误响应 ({endpoint}): status={status}, message={message}")]
    BadResponse {
        endpoint: String,
        status: u16,
        message: String,
    },
    /// API 返回空结果
    #[error("Embedding API返回空结果 (模型: {model})")]
    EmptyResponse { model: String },
    /// 向量维度不匹配
    #[error("向量维度不匹配: 期望 {expected}, 实际 {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// JSON 解析失败
    #[error("Embedding响应JSON解析失败: {source}")]
    JsonParseFailed {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// 题库存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 文件不存在
    #[error("文件不存在: {path}")]
    NotFound { path: String },
    /// 读取文件失败
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 写入文件失败
    #[error("写入文件失败 ({path}): {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 删除文件失败
    #[error("删除文件失败 ({path}): {source}")]
    DeleteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// JSON 解析失败
    #[error("JSON解析失败 ({path}): {source}")]
    JsonParseFailed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    /// JSON 序列化失败
    #[error("JSON序列化失败: {source}")]
    SerializeFailed {
        #[source]
        source: serde_json::Error,
    },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件读取失败
    #[error("配置文件读取失败 ({path}): {source}")]
    FileReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

// ========== 便捷构造函数 ==========

impl OracleError {
    /// 创建 API 调用失败错误
    pub fn api_call_failed(
        model: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        OracleError::ApiCallFailed {
            model: model.into(),
            source: Box::new(source),
        }
    }

    /// 创建响应格式违规错误，响应预览截断到 80 字符
    pub fn schema_violation(reason: impl Into<String>, response: &str) -> Self {
        OracleError::SchemaViolation {
            reason: reason.into(),
            preview: response.chars().take(80).collect(),
        }
    }
}

impl EmbeddingError {
    /// 创建网络请求失败错误
    pub fn request_failed(
        endpoint: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        EmbeddingError::RequestFailed {
            endpoint: endpoint.into(),
            source: Box::new(source),
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
