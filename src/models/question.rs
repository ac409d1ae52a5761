use phf::phf_map;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 题目起始片段的可见字符数上限
pub const SNIPPET_LEN: usize = 20;

/// 题型封闭词表（大小写敏感，与分类 Oracle 的约定一致）
static TYPE_LABELS: phf::Map<&'static str, QuestionType> = phf_map! {
    "True/False" => QuestionType::TrueFalse,
    "Short Answer" => QuestionType::ShortAnswer,
    "Theory" => QuestionType::Theory,
    "Numerical" => QuestionType::Numerical,
    "Proof" => QuestionType::Proof,
    "Comparison" => QuestionType::Comparison,
};

/// 题型
///
/// 六个封闭标签，序列化时使用词表原文（如 `"True/False"`），
/// 保证入库 JSON 与 Oracle 词表之间往返无损。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuestionType {
    #[serde(rename = "True/False")]
    TrueFalse,
    #[serde(rename = "Short Answer")]
    ShortAnswer,
    #[serde(rename = "Theory")]
    Theory,
    #[serde(rename = "Numerical")]
    Numerical,
    #[serde(rename = "Proof")]
    Proof,
    #[serde(rename = "Comparison")]
    Comparison,
}

impl QuestionType {
    /// 全部题型，按词表声明顺序
    pub const ALL: [QuestionType; 6] = [
        QuestionType::TrueFalse,
        QuestionType::ShortAnswer,
        QuestionType::Theory,
        QuestionType::Numerical,
        QuestionType::Proof,
        QuestionType::Comparison,
    ];

    /// 词表标签原文
    pub fn label(self) -> &'static str {
        match self {
            QuestionType::TrueFalse => "True/False",
            QuestionType::ShortAnswer => "Short Answer",
            QuestionType::Theory => "Theory",
            QuestionType::Numerical => "Numerical",
            QuestionType::Proof => "Proof",
            QuestionType::Comparison => "Comparison",
        }
    }

    /// 按词表原文查找题型，大小写敏感，词表外返回 None
    pub fn from_label(label: &str) -> Option<Self> {
        TYPE_LABELS.get(label).copied()
    }
}

impl fmt::Display for QuestionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// 子问互赖性三态
///
/// `NoSubQuestions` 表示题目没有子问标记，此时不存在 true/false 判定。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Independence {
    /// 各子问可独立作答
    Independent,
    /// 存在子问依赖其他子问
    Dependent,
    /// 没有子问
    NoSubQuestions,
}

impl Independence {
    /// 转换为布尔三态：有子问时 Some(是否独立)，无子问时 None
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Independence::Independent => Some(true),
            Independence::Dependent => Some(false),
            Independence::NoSubQuestions => None,
        }
    }
}

/// 题目记录的终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// 分类、向量化全部完成
    Complete,
    /// 分类在重试耗尽后仍未通过校验
    ExtractionFailed,
    /// 分类完成但向量化失败，可过滤不可语义检索
    EmbeddingUnavailable,
}

/// 主题标签：(主题, 子主题) 对及其余弦相似度
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicTag {
    pub topic: String,
    pub subtopic: String,
    pub score: f32,
}

impl PartialEq for TopicTag {
    fn eq(&self, other: &Self) -> bool {
        self.topic == other.topic && self.subtopic == other.subtopic
    }
}

/// 题目记录标识
///
/// 由文档 ID 与题号组成；同文档内题号重复时用出现序号区分。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub document_id: String,
    pub ordinal: u32,
    /// 同题号第几次出现（从 1 计）
    pub occurrence: u32,
}

impl RecordId {
    pub fn new(document_id: impl Into<String>, ordinal: u32, occurrence: u32) -> Self {
        Self {
            document_id: document_id.into(),
            ordinal,
            occurrence,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.occurrence > 1 {
            write!(f, "{}#{}-{}", self.document_id, self.ordinal, self.occurrence)
        } else {
            write!(f, "{}#{}", self.document_id, self.ordinal)
        }
    }
}

/// 子问块：一个主问内的单个子问
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubBlock {
    /// 子问标号（`a`、`b`、`1`、`2` 等，不含括号与点号）
    pub label: String,
    /// 子问全文，从标记处起到下一个子问标记前，含标记本身
    pub text: String,
}

/// 主问块：分段器的输出单元
///
/// 文本逐字保留，内嵌表格、公式、图片引用一律不剥离。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionBlock {
    /// 题号，按原文照抄，不要求连续
    pub ordinal: u32,
    /// 从本题标记到下一主问标记前的全部文本
    pub raw_text: String,
    /// 识别出的子问序列（可能为空）
    #[serde(default)]
    pub sub_blocks: Vec<SubBlock>,
    /// 题号与同文档先前块重复
    #[serde(default)]
    pub duplicate_ordinal: bool,
}

impl QuestionBlock {
    /// 题目行（块的首行）
    pub fn question_line(&self) -> &str {
        self.raw_text.lines().next().unwrap_or("")
    }
}

/// 题目记录：入库的最终单元
///
/// 不变量：`question_type` 为 None 当且仅当 `status == ExtractionFailed`；
/// `sub_question_snippets` 非空仅当互赖性判定为 Independent；
/// `embedding` 为 None 时记录可过滤但不参与语义检索。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionRecord {
    pub id: RecordId,
    /// 题目行前 20 个可见字符（行更短时为整行）
    pub snippet: String,
    pub question_type: Option<QuestionType>,
    pub sub_questions_independent: Independence,
    /// 独立子问的起始片段，按原文出现顺序
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_question_snippets: Vec<String>,
    /// 主题标签，按相似度降序
    #[serde(default)]
    pub topics: Vec<TopicTag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub status: RecordStatus,
    /// 原始块文本，逐字保留
    pub raw_text: String,
    /// 题号重复标记（审计用）
    #[serde(default)]
    pub duplicate_ordinal: bool,
    /// 本地依赖扫描结论（审计用）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_scan_dependent: Option<bool>,
    /// Oracle 互赖性裁决（审计用）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oracle_verdict: Option<bool>,
}

impl QuestionRecord {
    /// 是否可参与语义检索
    pub fn is_searchable(&self) -> bool {
        self.embedding.is_some()
    }
}

/// 计算题目行的规范起始片段：前 20 个可见字符，行更短时取整行
pub fn snippet_of(line: &str) -> String {
    line.chars().take(SNIPPET_LEN).collect()
}
