//! Embedding 客户端 - 基础设施层
//!
//! 只负责"文本 → 向量"这一件事，不关心向量的用途
//!
//! ## 技术栈
//! - 使用 `reqwest` 直接调用 OpenAI 兼容的 `/embeddings` 端点
//! - 支持自定义端点与模型

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::EmbeddingError;

/// Embedding 能力接口
///
/// 记录向量化与语义检索都依赖此接口；`model_id` 参与持久化，
/// 模型变更时用于判断缓存向量是否失效。
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 计算单条文本的向量
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// 批量计算向量，默认实现逐条调用 `embed`
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 向量维度
    fn dimensions(&self) -> usize;

    /// 模型标识，写入持久化文件用于失效判断
    fn model_id(&self) -> &str;
}

// ========== OpenAI 兼容端点的请求/响应结构 ==========

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

/// OpenAI 兼容端点的 Embedding 客户端
pub struct OpenAiEmbedding {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedding {
    /// 创建新的 Embedding 客户端
    pub fn new(config: &Config) -> Self {
        let endpoint = format!(
            "{}/embeddings",
            config.embedding_api_base_url.trim_end_matches('/')
        );
        Self {
            client: reqwest::Client::new(),
            api_key: config.embedding_api_key.clone(),
            endpoint,
            model: config.embedding_model_name.clone(),
            dimensions: config.embedding_dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let results = self.embed_batch(&[text]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmptyResponse {
                model: self.model.clone(),
            })
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("调用 Embedding API，模型: {}, 批量: {}", self.model, texts.len());

        let request_body = EmbeddingRequest {
            model: &self.model,
            input: texts.to_vec(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                warn!("Embedding 请求失败: {}", e);
                EmbeddingError::request_failed(&self.endpoint, e)
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);

            warn!("Embedding API 返回错误: {} {}", status, detail);
            return Err(EmbeddingError::BadResponse {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
                message: detail,
            });
        }

        let embedding_response: EmbeddingResponse =
            response
                .json()
                .await
                .map_err(|e| EmbeddingError::JsonParseFailed {
                    source: Box::new(e),
                })?;

        let vectors: Vec<Vec<f32>> = embedding_response
            .data
            .into_iter()
            .map(|d| d.embedding)
            .collect();

        // 维度校验，异常维度的向量进入索引会污染相似度计算
        for v in &vectors {
            if v.len() != self.dimensions {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dimensions,
                    actual: v.len(),
                });
            }
        }

        debug!("Embedding API 调用成功，返回 {} 条向量", vectors.len());

        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试 Embedding API 连接性
    ///
    /// 运行方式：
    /// ```bash
    /// cargo test test_embedding_api -- --ignored --nocapture
    /// ```
    #[tokio::test]
    #[ignore]
    async fn test_embedding_api() {
        let _ = tracing_subscriber::fmt::try_init();

        let mut config = Config::default();
        config.embedding_api_key = std::env::var("EMBEDDING_API_KEY").unwrap_or_default();

        let provider = OpenAiEmbedding::new(&config);

        println!("\n========== 测试 Embedding API ==========");
        let result = provider.embed("[Numerical] 1. Evaluate the limit of (1+1/n)^n.").await;

        match result {
            Ok(vector) => {
                println!("✅ Embedding API 调用成功！");
                println!("向量维度: {}", vector.len());
                assert_eq!(vector.len(), provider.dimensions());
            }
            Err(e) => {
                println!("❌ Embedding API 调用失败: {}", e);
                panic!("测试失败: {}", e);
            }
        }
    }

    #[test]
    fn endpoint_joins_base_url() {
        let mut config = Config::default();
        config.embedding_api_base_url = "https://api.example.com/v1/".to_string();
        let provider = OpenAiEmbedding::new(&config);
        assert_eq!(provider.endpoint, "https://api.example.com/v1/embeddings");
    }
}
