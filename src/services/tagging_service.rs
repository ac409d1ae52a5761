//! 主题标注服务 - 业务能力层
//!
//! 只负责"题目向量 → 主题标签"能力，不关心流程
//!
//! ## 标注规则
//! 每个 (主题, 子主题) 对的整合文本 `"{topic}: {subtopic}"` 有一条标签
//! 向量。题目向量与全部标签向量算余弦相似度，取相似度不低于阈值的
//! 前 K 个；相似度并列时按大纲声明顺序取先出现者，保证同输入必得
//! 同输出。

use crate::clients::embedding::EmbeddingProvider;
use crate::error::EmbeddingError;
use crate::models::question::TopicTag;
use crate::models::taxonomy::{LabelEmbedding, Taxonomy};
use std::cmp::Ordering;
use tracing::{info, warn};

/// 主题标注服务
///
/// 职责：
/// - 为主题树的每个 (主题, 子主题) 对计算标签向量
/// - 对单个题目向量做 top-K 阈值标注
/// - 不出现 Vec<QuestionRecord>
/// - 不关心流程顺序
pub struct TaggingService {
    top_k: usize,
    threshold: f32,
}

impl TaggingService {
    /// 创建新的标注服务
    pub fn new(top_k: usize, threshold: f32) -> Self {
        Self { top_k, threshold }
    }

    /// 为主题树计算标签向量
    ///
    /// 没有子主题的主题产生不了 (主题, 子主题) 对，跳过并告警。
    pub async fn embed_labels(
        &self,
        provider: &dyn EmbeddingProvider,
        taxonomy: &Taxonomy,
    ) -> Result<Vec<LabelEmbedding>, EmbeddingError> {
        let mut texts: Vec<String> = Vec::with_capacity(taxonomy.pair_count());
        let mut coords: Vec<(usize, usize)> = Vec::with_capacity(taxonomy.pair_count());

        for (topic_index, topic) in taxonomy.topics.iter().enumerate() {
            if topic.subtopics.is_empty() {
                warn!("主题 '{}' 没有子主题，不参与标注", topic.name);
                continue;
            }
            for (subtopic_index, subtopic) in topic.subtopics.iter().enumerate() {
                texts.push(LabelEmbedding::integrated_text(&topic.name, subtopic));
                coords.push((topic_index, subtopic_index));
            }
        }

        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let vectors = provider.embed_batch(&refs).await?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::EmptyResponse {
                model: provider.model_id().to_string(),
            });
        }

        let labels: Vec<LabelEmbedding> = coords
            .into_iter()
            .zip(vectors)
            .map(|((topic_index, subtopic_index), embedding)| LabelEmbedding {
                topic: taxonomy.topics[topic_index].name.clone(),
                subtopic: taxonomy.topics[topic_index].subtopics[subtopic_index].clone(),
                topic_index,
                subtopic_index,
                embedding,
            })
            .collect();

        info!("标签向量计算完成: {} 条", labels.len());
        Ok(labels)
    }

    /// 对单个题目向量做主题标注
    ///
    /// 返回相似度降序的标签列表；没有标签向量或全部低于阈值时为空。
    pub fn tag(&self, question_embedding: &[f32], labels: &[LabelEmbedding]) -> Vec<TopicTag> {
        let mut scored: Vec<(usize, f32)> = labels
            .iter()
            .enumerate()
            .map(|(decl_order, label)| {
                (decl_order, cosine_similarity(question_embedding, &label.embedding))
            })
            .filter(|&(_, score)| score >= self.threshold)
            .collect();

        // 相似度降序；并列按声明顺序，保证确定性
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(self.top_k);

        scored
            .into_iter()
            .map(|(decl_order, score)| TopicTag {
                topic: labels[decl_order].topic.clone(),
                subtopic: labels[decl_order].subtopic.clone(),
                score,
            })
            .collect()
    }
}

/// 两个向量的余弦相似度，任一向量为零向量时返回 0.0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::taxonomy::TopicNode;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// 返回预置向量的桩 Embedding
    struct CannedEmbedder {
        vectors: HashMap<String, Vec<f32>>,
    }

    #[async_trait]
    impl EmbeddingProvider for CannedEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.vectors
                .get(text)
                .cloned()
                .ok_or_else(|| EmbeddingError::EmptyResponse {
                    model: "canned".to_string(),
                })
        }

        fn dimensions(&self) -> usize {
            3
        }

        fn model_id(&self) -> &str {
            "canned"
        }
    }

    fn label(topic: &str, subtopic: &str, ti: usize, si: usize, v: Vec<f32>) -> LabelEmbedding {
        LabelEmbedding {
            topic: topic.to_string(),
            subtopic: subtopic.to_string(),
            topic_index: ti,
            subtopic_index: si,
            embedding: v,
        }
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.3, -0.7, 0.2];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn tag_filters_below_threshold() {
        let svc = TaggingService::new(3, 0.5);
        let labels = vec![
            label("A", "x", 0, 0, vec![1.0, 0.0]),
            label("A", "y", 0, 1, vec![0.0, 1.0]),
        ];
        // 与第一个标签同向，与第二个正交
        let tags = svc.tag(&[2.0, 0.0], &labels);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].topic, "A");
        assert_eq!(tags[0].subtopic, "x");
        assert!(tags[0].score > 0.99);
    }

    #[test]
    fn tag_truncates_to_top_k() {
        let svc = TaggingService::new(2, 0.0);
        let labels = vec![
            label("A", "x", 0, 0, vec![1.0, 0.0]),
            label("A", "y", 0, 1, vec![0.9, 0.1]),
            label("B", "z", 1, 0, vec![0.8, 0.2]),
        ];
        let tags = svc.tag(&[1.0, 0.0], &labels);
        assert_eq!(tags.len(), 2);
        // 按相似度降序
        assert!(tags[0].score >= tags[1].score);
        assert_eq!(tags[0].subtopic, "x");
    }

    #[test]
    fn tie_break_prefers_declaration_order() {
        let svc = TaggingService::new(1, 0.0);
        // 两个标签向量完全相同，得分并列
        let labels = vec![
            label("First", "s", 0, 0, vec![1.0, 0.0]),
            label("Second", "s", 1, 0, vec![1.0, 0.0]),
        ];
        let tags = svc.tag(&[1.0, 0.0], &labels);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].topic, "First");
    }

    #[test]
    fn tagging_is_deterministic() {
        let svc = TaggingService::new(3, 0.1);
        let labels = vec![
            label("A", "x", 0, 0, vec![0.7, 0.7]),
            label("B", "y", 1, 0, vec![0.6, 0.8]),
            label("C", "z", 2, 0, vec![0.9, 0.1]),
        ];
        let q = vec![0.5, 0.5];
        let first = svc.tag(&q, &labels);
        let second = svc.tag(&q, &labels);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_labels_give_empty_tags() {
        let svc = TaggingService::new(3, 0.5);
        assert!(svc.tag(&[1.0, 0.0], &[]).is_empty());
    }

    #[tokio::test]
    async fn embed_labels_builds_integrated_texts() {
        let mut vectors = HashMap::new();
        vectors.insert("Graphs: Trees".to_string(), vec![1.0, 0.0, 0.0]);
        vectors.insert("Graphs: Cycles".to_string(), vec![0.0, 1.0, 0.0]);
        let provider = CannedEmbedder { vectors };

        let taxonomy = Taxonomy {
            course_name: "Discrete Math".to_string(),
            topics: vec![
                TopicNode {
                    name: "Graphs".to_string(),
                    subtopics: vec!["Trees".to_string(), "Cycles".to_string()],
                },
                // 没有子主题的主题被跳过
                TopicNode {
                    name: "Logic".to_string(),
                    subtopics: vec![],
                },
            ],
        };

        let svc = TaggingService::new(3, 0.5);
        let labels = svc
            .embed_labels(&provider, &taxonomy)
            .await
            .expect("标签向量计算应当成功");
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].topic, "Graphs");
        assert_eq!(labels[0].subtopic, "Trees");
        assert_eq!(labels[0].topic_index, 0);
        assert_eq!(labels[1].subtopic_index, 1);
    }

    #[tokio::test]
    async fn embed_labels_of_empty_taxonomy_is_empty() {
        let provider = CannedEmbedder {
            vectors: HashMap::new(),
        };
        let svc = TaggingService::new(3, 0.5);
        let labels = svc
            .embed_labels(&provider, &Taxonomy::empty())
            .await
            .expect("空树应当成功");
        assert!(labels.is_empty());
    }
}
