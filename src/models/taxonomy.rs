use serde::{Deserialize, Serialize};

/// 大纲主题节点：主题名与其下显式列出的子主题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicNode {
    pub name: String,
    #[serde(default)]
    pub subtopics: Vec<String>,
}

/// 两级主题分类树
///
/// 仅保留大纲原文中显式出现的主题与子主题，不做推断补全。
/// 空树是合法状态，表示主题标注不可用。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taxonomy {
    /// 课程名（大纲未给出时为空串）
    #[serde(default)]
    pub course_name: String,
    #[serde(default)]
    pub topics: Vec<TopicNode>,
}

impl Taxonomy {
    pub fn empty() -> Self {
        Self {
            course_name: String::new(),
            topics: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// (主题, 子主题) 对的总数
    pub fn pair_count(&self) -> usize {
        self.topics.iter().map(|t| t.subtopics.len()).sum()
    }
}

/// 标签向量：一个 (主题, 子主题) 对的整合文本向量
///
/// 整合文本为 `"{topic}: {subtopic}"`，向量由其一次性计算。
/// `topic_index`/`subtopic_index` 记录大纲声明顺序，用于得分并列时的
/// 确定性排序。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelEmbedding {
    pub topic: String,
    pub subtopic: String,
    pub topic_index: usize,
    pub subtopic_index: usize,
    pub embedding: Vec<f32>,
}

impl LabelEmbedding {
    /// 送入向量模型的整合文本
    pub fn integrated_text(topic: &str, subtopic: &str) -> String {
        format!("{}: {}", topic, subtopic)
    }
}
