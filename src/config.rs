use crate::error::ConfigError;
use serde::Deserialize;

/// 程序配置文件
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 同时处理的文档数量
    pub max_concurrent_documents: usize,
    /// OCR 结果 Markdown 文件存放目录
    pub input_folder: String,
    /// 教学大纲文本文件路径（为空则跳过主题标注）
    pub syllabus_file: String,
    /// 题库工作区目录（持久化 JSON 存放处）
    pub workspace_folder: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
    /// 是否强制重新导入已入库的文档
    pub force_reingest: bool,
    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    // --- Embedding 配置 ---
    pub embedding_api_key: String,
    pub embedding_api_base_url: String,
    pub embedding_model_name: String,
    pub embedding_dimensions: usize,
    // --- 抽取参数 ---
    /// 单题分类的最大尝试次数
    pub classify_max_attempts: usize,
    /// 单条向量化的最大尝试次数
    pub embed_max_attempts: usize,
    /// 重试退避基准延迟（毫秒），按尝试次数指数递增
    pub retry_base_delay_ms: u64,
    // --- 标注参数 ---
    /// 每题最多保留的主题标签数
    pub tagging_top_k: usize,
    /// 主题标签的最低余弦相似度
    pub tagging_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_documents: 4,
            input_folder: "ocr_results".to_string(),
            syllabus_file: "syllabus.txt".to_string(),
            workspace_folder: "question_bank".to_string(),
            verbose_logging: false,
            output_log_file: "output.txt".to_string(),
            force_reingest: false,
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o".to_string(),
            embedding_api_key: String::new(),
            embedding_api_base_url: "https://api.openai.com/v1".to_string(),
            embedding_model_name: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1536,
            classify_max_attempts: 2,
            embed_max_attempts: 3,
            retry_base_delay_ms: 500,
            tagging_top_k: 3,
            tagging_threshold: 0.5,
        }
    }
}

impl Config {
    /// 从环境变量读取配置，未设置的项使用默认值
    pub fn from_env() -> Self {
        Self::default().merged_env()
    }

    /// 从 TOML 配置文件读取配置，文件中未出现的项使用默认值
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadFailed {
            path: path.to_string(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::TomlParseFailed {
            path: path.to_string(),
            source: e,
        })
    }

    /// 加载配置：存在 `config.toml` 时以其为基础，再接受环境变量覆盖
    pub fn load() -> Self {
        let base = if std::path::Path::new("config.toml").exists() {
            match Self::from_file("config.toml") {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("⚠️ 配置文件加载失败，使用默认配置: {}", e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };
        base.merged_env()
    }

    /// 在现有配置上应用环境变量覆盖
    fn merged_env(self) -> Self {
        Self {
            max_concurrent_documents: std::env::var("MAX_CONCURRENT_DOCUMENTS").ok().and_then(|v| v.parse().ok()).unwrap_or(self.max_concurrent_documents),
            input_folder: std::env::var("INPUT_FOLDER").unwrap_or(self.input_folder),
            syllabus_file: std::env::var("SYLLABUS_FILE").unwrap_or(self.syllabus_file),
            workspace_folder: std::env::var("WORKSPACE_FOLDER").unwrap_or(self.workspace_folder),
            verbose_logging: std::env::var("VERBOSE_LOGGING").ok().and_then(|v| v.parse().ok()).unwrap_or(self.verbose_logging),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(self.output_log_file),
            force_reingest: std::env::var("FORCE_REINGEST").ok().and_then(|v| v.parse().ok()).unwrap_or(self.force_reingest),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or(self.llm_api_key),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(self.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(self.llm_model_name),
            embedding_api_key: std::env::var("EMBEDDING_API_KEY").unwrap_or(self.embedding_api_key),
            embedding_api_base_url: std::env::var("EMBEDDING_API_BASE_URL").unwrap_or(self.embedding_api_base_url),
            embedding_model_name: std::env::var("EMBEDDING_MODEL_NAME").unwrap_or(self.embedding_model_name),
            embedding_dimensions: std::env::var("EMBEDDING_DIMENSIONS").ok().and_then(|v| v.parse().ok()).unwrap_or(self.embedding_dimensions),
            classify_max_attempts: std::env::var("CLASSIFY_MAX_ATTEMPTS").ok().and_then(|v| v.parse().ok()).unwrap_or(self.classify_max_attempts),
            embed_max_attempts: std::env::var("EMBED_MAX_ATTEMPTS").ok().and_then(|v| v.parse().ok()).unwrap_or(self.embed_max_attempts),
            retry_base_delay_ms: std::env::var("RETRY_BASE_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(self.retry_base_delay_ms),
            tagging_top_k: std::env::var("TAGGING_TOP_K").ok().and_then(|v| v.parse().ok()).unwrap_or(self.tagging_top_k),
            tagging_threshold: std::env::var("TAGGING_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(self.tagging_threshold),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retry_bounds() {
        let config = Config::default();
        assert_eq!(config.classify_max_attempts, 2);
        assert_eq!(config.embed_max_attempts, 3);
        assert_eq!(config.tagging_top_k, 3);
        assert!((config.tagging_threshold - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn toml_partial_override() {
        let parsed: Config = toml::from_str(
            r#"
            max_concurrent_documents = 8
            input_folder = "papers"
            tagging_threshold = 0.6
            "#,
        )
        .expect("TOML 解析失败");
        assert_eq!(parsed.max_concurrent_documents, 8);
        assert_eq!(parsed.input_folder, "papers");
        assert!((parsed.tagging_threshold - 0.6).abs() < f32::EPSILON);
        // 未出现的字段取默认值
        assert_eq!(parsed.workspace_folder, "question_bank");
        assert_eq!(parsed.classify_max_attempts, 2);
    }
}
