//! 题库索引 - 业务能力层
//!
//! 按文档分区的内存索引：整文档原子发布与移除、元数据过滤查询、
//! 语义检索、主题视图。

use crate::clients::EmbeddingProvider;
use crate::error::EmbeddingError;
use crate::models::{
    Document, Independence, QuestionRecord, QuestionType, RecordStatus, Taxonomy,
};
use crate::services::cosine_similarity;
use serde::Serialize;
use std::cmp::Ordering;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 过滤查询条件
///
/// 所有字段为 None 时匹配全部记录。`topic` 与 `subtopic` 同时给出时
/// 要求同一个标签对同时满足两者，而不是分别出自不同标签。
#[derive(Debug, Clone, Default)]
pub struct QuestionFilter {
    pub question_type: Option<QuestionType>,
    pub topic: Option<String>,
    pub subtopic: Option<String>,
    pub source_document: Option<String>,
    pub independence: Option<Independence>,
    pub status: Option<RecordStatus>,
}

impl QuestionFilter {
    /// 判断单条记录是否满足全部已给出的条件
    pub fn matches(&self, record: &QuestionRecord) -> bool {
        if let Some(qt) = self.question_type {
            if record.question_type != Some(qt) {
                return false;
            }
        }
        match (&self.topic, &self.subtopic) {
            (Some(topic), Some(subtopic)) => {
                if !record
                    .topics
                    .iter()
                    .any(|tag| tag.topic == *topic && tag.subtopic == *subtopic)
                {
                    return false;
                }
            }
            (Some(topic), None) => {
                if !record.topics.iter().any(|tag| tag.topic == *topic) {
                    return false;
                }
            }
            (None, Some(subtopic)) => {
                if !record.topics.iter().any(|tag| tag.subtopic == *subtopic) {
                    return false;
                }
            }
            (None, None) => {}
        }
        if let Some(source) = &self.source_document {
            if record.id.document_id != *source {
                return false;
            }
        }
        if let Some(ind) = self.independence {
            if record.sub_questions_independent != ind {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        true
    }
}

/// 语义检索命中：记录与其对查询文本的余弦相似度
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: QuestionRecord,
    pub score: f32,
}

/// 主题视图中的子主题分组
#[derive(Debug, Clone, Serialize)]
pub struct SubtopicGroup {
    pub name: String,
    pub records: Vec<QuestionRecord>,
}

/// 主题视图中的主题分组
#[derive(Debug, Clone, Serialize)]
pub struct TopicGroup {
    pub name: String,
    pub subtopics: Vec<SubtopicGroup>,
}

/// 按主题组织的题库视图
///
/// 主题按大纲声明顺序排列，只含有题目的子主题与主题。
#[derive(Debug, Clone, Serialize)]
pub struct TopicView {
    pub course_name: String,
    pub topics: Vec<TopicGroup>,
}

/// 题库索引
///
/// 职责：
/// - 按文档分区持有全部题目记录
/// - 整文档原子发布（同 ID 整体替换）与移除
/// - 元数据过滤查询与语义检索
/// - 不触发任何处理流程，只回答查询
///
/// 文档间按发布顺序排列，文档内按题号顺序排列。唯一的共享可变状态，
/// 用读写锁保护，发布与移除都在一次写锁内完成。
pub struct QuestionBank {
    documents: RwLock<Vec<Document>>,
}

impl QuestionBank {
    /// 创建空题库
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(Vec::new()),
        }
    }

    /// 发布整个文档
    ///
    /// 同 ID 文档已存在时整体替换，其余文档的内容与相对顺序不受影响。
    ///
    /// # 返回
    /// 返回被替换下来的旧文档（首次发布返回 None）
    pub async fn publish_document(&self, document: Document) -> Option<Document> {
        let mut documents = self.documents.write().await;
        let record_count = document.records.len();

        if let Some(pos) = documents.iter().position(|d| d.id == document.id) {
            warn!("⚠️ 文档 {} 已在题库中，整体替换", document.id);
            let old = std::mem::replace(&mut documents[pos], document);
            Some(old)
        } else {
            info!(
                "✓ 文档 {} 已发布到题库（{} 条记录）",
                document.id, record_count
            );
            documents.push(document);
            None
        }
    }

    /// 移除一个文档，不触动其他文档的记录、顺序与标注
    pub async fn remove_document(&self, document_id: &str) -> Option<Document> {
        let mut documents = self.documents.write().await;
        let pos = documents.iter().position(|d| d.id == document_id)?;
        let removed = documents.remove(pos);
        info!(
            "🗑️ 文档 {} 已从题库移除（{} 条记录）",
            document_id,
            removed.records.len()
        );
        Some(removed)
    }

    /// 清空题库
    ///
    /// # 返回
    /// 返回被移除的文档数
    pub async fn clear(&self) -> usize {
        let mut documents = self.documents.write().await;
        let count = documents.len();
        documents.clear();
        if count > 0 {
            info!("🗑️ 题库已清空（{} 个文档）", count);
        }
        count
    }

    /// 文档是否已在题库中
    pub async fn contains_document(&self, document_id: &str) -> bool {
        let documents = self.documents.read().await;
        documents.iter().any(|d| d.id == document_id)
    }

    /// 全部文档 ID，按发布顺序
    pub async fn document_ids(&self) -> Vec<String> {
        let documents = self.documents.read().await;
        documents.iter().map(|d| d.id.clone()).collect()
    }

    /// 文档总数
    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }

    /// 记录总数
    pub async fn record_count(&self) -> usize {
        let documents = self.documents.read().await;
        documents.iter().map(|d| d.records.len()).sum()
    }

    /// 全部文档的快照（持久化与统计用）
    pub async fn snapshot(&self) -> Vec<Document> {
        self.documents.read().await.clone()
    }

    /// 过滤查询
    ///
    /// 文档间按发布顺序、文档内按题号顺序返回匹配记录。
    /// 降级记录带着自身的 status 一并返回，不做静默剔除。
    pub async fn filter_records(&self, filter: &QuestionFilter) -> Vec<QuestionRecord> {
        let documents = self.documents.read().await;
        let hits: Vec<QuestionRecord> = documents
            .iter()
            .flat_map(|d| d.records.iter())
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        debug!("🔍 过滤查询命中 {} 条记录", hits.len());
        hits
    }

    /// 语义检索
    ///
    /// 用同一向量服务对查询文本求向量，在满足过滤条件且持有向量的
    /// 记录上按余弦相似度降序排序。没有向量的记录（向量化失败或
    /// 分类失败未入向量阶段）不参与语义检索。
    ///
    /// # 参数
    /// - `provider`: 向量服务（必须与入库时同一模型）
    /// - `query`: 自由文本查询
    /// - `top_k`: 返回的最大命中数
    /// - `filter`: 附加过滤条件
    ///
    /// # 返回
    /// 返回按相似度降序的命中列表
    pub async fn semantic_search(
        &self,
        provider: &dyn EmbeddingProvider,
        query: &str,
        top_k: usize,
        filter: &QuestionFilter,
    ) -> Result<Vec<SearchHit>, EmbeddingError> {
        let query_embedding = provider.embed(query).await?;

        let documents = self.documents.read().await;
        let mut hits: Vec<SearchHit> = documents
            .iter()
            .flat_map(|d| d.records.iter())
            .filter(|r| filter.matches(r))
            .filter_map(|r| {
                let embedding = r.embedding.as_ref()?;
                let score = cosine_similarity(&query_embedding, embedding);
                Some(SearchHit {
                    record: r.clone(),
                    score,
                })
            })
            .collect();
        drop(documents);

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(top_k);
        debug!("🔍 语义检索返回 {} 条命中", hits.len());
        Ok(hits)
    }

    /// 按主题组织的视图
    ///
    /// 每条已标注记录归入其最佳标签（首个标签）对应的 (主题, 子主题)，
    /// 未标注记录与标签不在当前大纲内的记录不进入视图。
    pub async fn by_topic(&self, taxonomy: &Taxonomy) -> TopicView {
        let documents = self.documents.read().await;

        let mut buckets: Vec<Vec<Vec<QuestionRecord>>> = taxonomy
            .topics
            .iter()
            .map(|t| vec![Vec::new(); t.subtopics.len()])
            .collect();

        for record in documents.iter().flat_map(|d| d.records.iter()) {
            let Some(best) = record.topics.first() else {
                continue;
            };
            let located = taxonomy.topics.iter().enumerate().find_map(|(ti, t)| {
                if t.name != best.topic {
                    return None;
                }
                t.subtopics
                    .iter()
                    .position(|s| *s == best.subtopic)
                    .map(|si| (ti, si))
            });
            if let Some((ti, si)) = located {
                buckets[ti][si].push(record.clone());
            }
        }

        let topics = taxonomy
            .topics
            .iter()
            .zip(buckets)
            .filter_map(|(node, subs)| {
                let subtopics: Vec<SubtopicGroup> = node
                    .subtopics
                    .iter()
                    .zip(subs)
                    .filter(|(_, records)| !records.is_empty())
                    .map(|(name, records)| SubtopicGroup {
                        name: name.clone(),
                        records,
                    })
                    .collect();
                if subtopics.is_empty() {
                    None
                } else {
                    Some(TopicGroup {
                        name: node.name.clone(),
                        subtopics,
                    })
                }
            })
            .collect();

        TopicView {
            course_name: taxonomy.course_name.clone(),
            topics,
        }
    }
}

impl Default for QuestionBank {
    fn default() -> Self {
        Self::new()
    }
}
