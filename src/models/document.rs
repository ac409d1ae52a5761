use crate::models::question::QuestionRecord;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// 待处理的 OCR 文档源
///
/// 由加载器从 Markdown 文件读出，`id` 取文件名主干。
#[derive(Debug, Clone)]
pub struct DocumentSource {
    pub id: String,
    pub name: String,
    pub file_path: String,
    pub raw_text: String,
}

/// 入库文档：一个 OCR 源的全部题目记录
///
/// 题库按文档分区，发布与移除都以整个文档为单位。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_file: String,
    pub ingested_at: DateTime<Local>,
    pub records: Vec<QuestionRecord>,
}

impl Document {
    pub fn new(id: impl Into<String>, source_file: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_file: source_file.into(),
            ingested_at: Local::now(),
            records: Vec::new(),
        }
    }
}
