//! 工作区存储 - 业务能力层
//!
//! 把入库文档与当前大纲以 JSON 落盘，进程重启后可恢复。
//! 布局：`<workspace>/documents/<文档ID>.json` 每文档一件，
//! `<workspace>/syllabus.json` 保存分类树、标签向量与向量模型 ID。

use crate::error::StoreError;
use crate::models::{Document, LabelEmbedding, Taxonomy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 落盘的大纲：分类树、标签向量与计算时所用的向量模型
///
/// 加载时模型 ID 与当前配置不一致即视为全部向量失效，需要重算。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSyllabus {
    pub taxonomy: Taxonomy,
    pub embedding_model: String,
    #[serde(default)]
    pub labels: Vec<LabelEmbedding>,
}

/// 工作区存储
///
/// 职责：
/// - 文档记录（含向量）的保存、加载、删除
/// - 大纲与标签向量的保存、加载
/// - 判断文档是否已入库（跳过重复处理的依据）
/// - 不理解记录内容，只做无损 JSON 往返
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    /// 创建指向工作区目录的存储（不触盘）
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// 工作区根目录
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn documents_dir(&self) -> PathBuf {
        self.root.join("documents")
    }

    fn document_path(&self, document_id: &str) -> PathBuf {
        self.documents_dir().join(format!("{}.json", document_id))
    }

    fn syllabus_path(&self) -> PathBuf {
        self.root.join("syllabus.json")
    }

    /// 创建工作区目录结构（已存在时无动作）
    pub fn ensure_layout(&self) -> Result<(), StoreError> {
        let dir = self.documents_dir();
        fs::create_dir_all(&dir).map_err(|e| StoreError::WriteFailed {
            path: dir.display().to_string(),
            source: e,
        })
    }

    /// 保存单个文档（同 ID 覆盖）
    pub fn save_document(&self, document: &Document) -> Result<(), StoreError> {
        self.ensure_layout()?;
        let path = self.document_path(&document.id);
        let json = serde_json::to_string_pretty(document)
            .map_err(|e| StoreError::SerializeFailed { source: e })?;
        fs::write(&path, json).map_err(|e| StoreError::WriteFailed {
            path: path.display().to_string(),
            source: e,
        })?;
        debug!("✓ 文档 {} 已落盘（{} 条记录）", document.id, document.records.len());
        Ok(())
    }

    /// 加载单个文档
    pub fn load_document(&self, document_id: &str) -> Result<Document, StoreError> {
        let path = self.document_path(document_id);
        if !path.exists() {
            return Err(StoreError::NotFound {
                path: path.display().to_string(),
            });
        }
        let content = fs::read_to_string(&path).map_err(|e| StoreError::ReadFailed {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| StoreError::JsonParseFailed {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// 加载工作区内全部文档
    ///
    /// 按文件名排序保证加载顺序确定；单个文件损坏时告警跳过，
    /// 不影响其余文档。
    pub fn load_all_documents(&self) -> Result<Vec<Document>, StoreError> {
        let dir = self.documents_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir).map_err(|e| StoreError::ReadFailed {
            path: dir.display().to_string(),
            source: e,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        paths.sort();

        let mut documents = Vec::new();
        for path in paths {
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!("⚠️ 读取文档文件失败，跳过 {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_str::<Document>(&content) {
                Ok(document) => documents.push(document),
                Err(e) => {
                    warn!("⚠️ 解析文档文件失败，跳过 {}: {}", path.display(), e);
                }
            }
        }

        info!("📁 从工作区加载了 {} 个文档", documents.len());
        Ok(documents)
    }

    /// 删除单个文档的落盘文件
    ///
    /// # 返回
    /// 文件存在且删除成功返回 true，本就不存在返回 false
    pub fn remove_document(&self, document_id: &str) -> Result<bool, StoreError> {
        let path = self.document_path(document_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|e| StoreError::DeleteFailed {
            path: path.display().to_string(),
            source: e,
        })?;
        info!("🗑️ 已删除文档文件: {}", path.display());
        Ok(true)
    }

    /// 文档是否已入库（落盘文件存在即视为已入库）
    pub fn is_ingested(&self, document_id: &str) -> bool {
        self.document_path(document_id).exists()
    }

    /// 保存大纲与标签向量
    pub fn save_syllabus(&self, stored: &StoredSyllabus) -> Result<(), StoreError> {
        self.ensure_layout()?;
        let path = self.syllabus_path();
        let json = serde_json::to_string_pretty(stored)
            .map_err(|e| StoreError::SerializeFailed { source: e })?;
        fs::write(&path, json).map_err(|e| StoreError::WriteFailed {
            path: path.display().to_string(),
            source: e,
        })?;
        debug!(
            "✓ 大纲已落盘（{} 个标签向量，模型: {}）",
            stored.labels.len(),
            stored.embedding_model
        );
        Ok(())
    }

    /// 加载大纲与标签向量，从未保存过时返回 None
    pub fn load_syllabus(&self) -> Result<Option<StoredSyllabus>, StoreError> {
        let path = self.syllabus_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|e| StoreError::ReadFailed {
            path: path.display().to_string(),
            source: e,
        })?;
        let stored = serde_json::from_str(&content).map_err(|e| StoreError::JsonParseFailed {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(Some(stored))
    }

    /// 清空工作区：删除全部文档文件与大纲文件
    ///
    /// # 返回
    /// 返回删除的文档文件数
    pub fn clear(&self) -> Result<usize, StoreError> {
        let dir = self.documents_dir();
        let mut removed = 0;
        if dir.exists() {
            let entries = fs::read_dir(&dir).map_err(|e| StoreError::ReadFailed {
                path: dir.display().to_string(),
                source: e,
            })?;
            for entry in entries.filter_map(|entry| entry.ok()) {
                let path = entry.path();
                if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                    fs::remove_file(&path).map_err(|e| StoreError::DeleteFailed {
                        path: path.display().to_string(),
                        source: e,
                    })?;
                    removed += 1;
                }
            }
        }

        let syllabus = self.syllabus_path();
        if syllabus.exists() {
            fs::remove_file(&syllabus).map_err(|e| StoreError::DeleteFailed {
                path: syllabus.display().to_string(),
                source: e,
            })?;
        }

        info!("🗑️ 工作区已清空（{} 个文档文件）", removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Independence, QuestionRecord, QuestionType, RecordId, RecordStatus, TopicNode, TopicTag,
    };
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workspace(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("时钟异常")
            .subsec_nanos();
        std::env::temp_dir().join(format!("qbank_store_{}_{}_{}", tag, std::process::id(), nanos))
    }

    fn sample_document() -> Document {
        let mut d = Document::new("midterm_2023", "midterm_2023.mmd");
        d.records.push(QuestionRecord {
            id: RecordId::new("midterm_2023", 1, 1),
            snippet: "1. 证明下列命题成立，并给出反".to_string(),
            question_type: Some(QuestionType::Proof),
            sub_questions_independent: Independence::Independent,
            sub_question_snippets: vec!["(a) 先证必要性".to_string()],
            topics: vec![TopicTag {
                topic: "Matrices".to_string(),
                subtopic: "Determinants".to_string(),
                score: 0.8125,
            }],
            embedding: Some(vec![0.1, -0.25, 0.5]),
            status: RecordStatus::Complete,
            raw_text: "1. 证明下列命题成立，并给出反例。\n(a) 先证必要性。\n(b) 再证充分性。\n$\\det(AB) = \\det(A)\\det(B)$".to_string(),
            duplicate_ordinal: false,
            local_scan_dependent: Some(false),
            oracle_verdict: Some(true),
        });
        d
    }

    #[test]
    fn document_round_trip_is_lossless() {
        let root = temp_workspace("round_trip");
        let store = WorkspaceStore::new(&root);
        let original = sample_document();

        store.save_document(&original).expect("保存失败");
        let loaded = store.load_document("midterm_2023").expect("加载失败");

        assert_eq!(loaded.id, original.id);
        assert_eq!(loaded.records.len(), 1);
        let (a, b) = (&loaded.records[0], &original.records[0]);
        assert_eq!(a.raw_text, b.raw_text);
        assert_eq!(a.snippet, b.snippet);
        assert_eq!(a.topics, b.topics);
        assert_eq!(a.embedding, b.embedding);
        assert_eq!(a.sub_question_snippets, b.sub_question_snippets);
        assert_eq!(a.status, b.status);

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn load_missing_document_is_not_found() {
        let root = temp_workspace("missing");
        let store = WorkspaceStore::new(&root);
        match store.load_document("ghost") {
            Err(StoreError::NotFound { .. }) => {}
            other => panic!("期望 NotFound，实际 {:?}", other.map(|d| d.id)),
        }
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn is_ingested_tracks_saved_documents() {
        let root = temp_workspace("ingested");
        let store = WorkspaceStore::new(&root);
        assert!(!store.is_ingested("midterm_2023"));

        store.save_document(&sample_document()).expect("保存失败");
        assert!(store.is_ingested("midterm_2023"));

        let removed = store.remove_document("midterm_2023").expect("删除失败");
        assert!(removed);
        assert!(!store.is_ingested("midterm_2023"));
        assert!(!store.remove_document("midterm_2023").expect("重复删除应返回 false"));

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn load_all_skips_corrupt_files() {
        let root = temp_workspace("corrupt");
        let store = WorkspaceStore::new(&root);
        store.save_document(&sample_document()).expect("保存失败");
        fs::write(root.join("documents").join("broken.json"), "{ not json").expect("写入失败");

        let documents = store.load_all_documents().expect("加载失败");
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].id, "midterm_2023");

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn syllabus_round_trip_keeps_model_and_labels() {
        let root = temp_workspace("syllabus");
        let store = WorkspaceStore::new(&root);
        assert!(store.load_syllabus().expect("加载失败").is_none());

        let stored = StoredSyllabus {
            taxonomy: Taxonomy {
                course_name: "Linear Algebra".to_string(),
                topics: vec![TopicNode {
                    name: "Matrices".to_string(),
                    subtopics: vec!["Determinants".to_string()],
                }],
            },
            embedding_model: "text-embedding-3-small".to_string(),
            labels: vec![LabelEmbedding {
                topic: "Matrices".to_string(),
                subtopic: "Determinants".to_string(),
                topic_index: 0,
                subtopic_index: 0,
                embedding: vec![0.5, 0.5],
            }],
        };
        store.save_syllabus(&stored).expect("保存失败");

        let loaded = store.load_syllabus().expect("加载失败").expect("应有大纲");
        assert_eq!(loaded.taxonomy, stored.taxonomy);
        assert_eq!(loaded.embedding_model, "text-embedding-3-small");
        assert_eq!(loaded.labels.len(), 1);
        assert_eq!(loaded.labels[0].embedding, vec![0.5, 0.5]);

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn clear_removes_documents_and_syllabus() {
        let root = temp_workspace("clear");
        let store = WorkspaceStore::new(&root);
        store.save_document(&sample_document()).expect("保存失败");
        store
            .save_syllabus(&StoredSyllabus {
                taxonomy: Taxonomy::empty(),
                embedding_model: "m".to_string(),
                labels: Vec::new(),
            })
            .expect("保存失败");

        let removed = store.clear().expect("清空失败");
        assert_eq!(removed, 1);
        assert!(!store.is_ingested("midterm_2023"));
        assert!(store.load_syllabus().expect("加载失败").is_none());

        fs::remove_dir_all(&root).ok();
    }
}
