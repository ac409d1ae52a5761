//! 文档处理流程 - 流程层
//!
//! 核心职责：定义"一个文档"的完整处理流程
//!
//! 流程顺序：
//! 1. 分段 → 主问块序列
//! 2. 逐块分类 + 互赖性裁决（块间并发）
//! 3. 逐条向量化（有限重试，失败降级）
//! 4. 主题标注（标签为空时跳过）

use anyhow::Result;
use futures::future::join_all;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::clients::{EmbeddingProvider, ReasoningOracle};
use crate::config::Config;
use crate::error::EmbeddingError;
use crate::models::{
    snippet_of, Document, DocumentSource, LabelEmbedding, QuestionBlock, QuestionRecord, RecordId,
    RecordStatus, Taxonomy,
};
use crate::services::{
    Classification, ClassifyService, DependencyService, Resolution, SegmentService, TaggingService,
};
use crate::workflow::document_ctx::DocumentCtx;

/// 单文档处理统计
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowStats {
    pub total_records: usize,
    pub complete: usize,
    pub extraction_failed: usize,
    pub embedding_unavailable: usize,
    pub tagged: usize,
}

/// 单个主问块经过分类与互赖裁决后的中间结果
struct BlockOutcome {
    classification: Option<Classification>,
    resolution: Resolution,
}

/// 文档处理流程
///
/// - 编排单个文档的完整处理流程
/// - 决定何时分类、何时裁决、何时降级
/// - 不持有题库与存储，产出的文档由上层发布
/// - 只依赖业务能力（services）
pub struct DocumentFlow {
    segment_service: SegmentService,
    classify_service: ClassifyService,
    dependency_service: DependencyService,
    tagging_service: TaggingService,
    embedder: Arc<dyn EmbeddingProvider>,
    image_ref: Regex,
    embed_max_attempts: usize,
    retry_base_delay_ms: u64,
    verbose_logging: bool,
}

impl DocumentFlow {
    /// 创建新的文档处理流程
    pub fn new(
        config: &Config,
        oracle: Arc<dyn ReasoningOracle>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        Ok(Self {
            segment_service: SegmentService::new()?,
            classify_service: ClassifyService::new(
                Arc::clone(&oracle),
                config.classify_max_attempts,
                config.retry_base_delay_ms,
            ),
            dependency_service: DependencyService::new(
                oracle,
                config.classify_max_attempts,
                config.retry_base_delay_ms,
            )?,
            tagging_service: TaggingService::new(config.tagging_top_k, config.tagging_threshold),
            embedder,
            image_ref: Regex::new(r"!\[[^\]]*\]\([^)]*\)")?,
            embed_max_attempts: config.embed_max_attempts.max(1),
            retry_base_delay_ms: config.retry_base_delay_ms,
            verbose_logging: config.verbose_logging,
        })
    }

    /// 处理一个文档：分段、分类、裁决、向量化、标注
    ///
    /// 阶段内的失败全部降级到单条记录（ExtractionFailed /
    /// EmbeddingUnavailable），流程本身总能产出文档。
    ///
    /// # 参数
    /// - `source`: 待处理的 OCR 文档源
    /// - `labels`: 当前大纲的标签向量（为空则跳过标注）
    /// - `ctx`: 文档上下文
    ///
    /// # 返回
    /// 返回 (入库文档, 处理统计)
    pub async fn run(
        &self,
        source: &DocumentSource,
        labels: &[LabelEmbedding],
        ctx: &DocumentCtx,
    ) -> (Document, FlowStats) {
        let mut document = Document::new(&source.id, &source.name);
        let mut stats = FlowStats::default();

        // ========== 阶段 1: 分段 ==========
        let blocks = self.segment_service.segment(&source.raw_text);
        if blocks.is_empty() {
            warn!(
                "[文档 {}] ⚠️ 未识别出任何主问标记，产出 0 条记录",
                ctx.document_index
            );
            return (document, stats);
        }
        info!(
            "[文档 {}] ✓ 分段完成，共 {} 个主问块",
            ctx.document_index,
            blocks.len()
        );

        // ========== 阶段 2: 分类 + 互赖裁决（块间并发）==========
        let outcomes = join_all(blocks.iter().map(|b| self.process_block(b, ctx))).await;

        let mut occurrences: HashMap<u32, u32> = HashMap::new();
        for (block, outcome) in blocks.iter().zip(outcomes) {
            let occurrence = occurrences
                .entry(block.ordinal)
                .and_modify(|c| *c += 1)
                .or_insert(1);
            document
                .records
                .push(self.build_record(&source.id, block, outcome, *occurrence));
        }

        // ========== 阶段 3: 向量化（逐条，失败降级）==========
        for record in document.records.iter_mut() {
            // 分类失败的记录不进入向量阶段
            if record.status == RecordStatus::ExtractionFailed {
                continue;
            }
            match self.embed_record(record, ctx).await {
                Some(embedding) => record.embedding = Some(embedding),
                None => record.status = RecordStatus::EmbeddingUnavailable,
            }
        }

        // ========== 阶段 4: 主题标注 ==========
        if labels.is_empty() {
            debug!("[文档 {}] 大纲标签为空，跳过主题标注", ctx.document_index);
        } else {
            for record in document.records.iter_mut() {
                if let Some(embedding) = &record.embedding {
                    record.topics = self.tagging_service.tag(embedding, labels);
                }
            }
        }

        for record in &document.records {
            stats.total_records += 1;
            match record.status {
                RecordStatus::Complete => stats.complete += 1,
                RecordStatus::ExtractionFailed => stats.extraction_failed += 1,
                RecordStatus::EmbeddingUnavailable => stats.embedding_unavailable += 1,
            }
            if !record.topics.is_empty() {
                stats.tagged += 1;
            }
        }

        info!(
            "[文档 {}] ✅ 处理完成: {} 条记录（完成 {}, 分类失败 {}, 向量缺失 {}, 已标注 {}）",
            ctx.document_index,
            stats.total_records,
            stats.complete,
            stats.extraction_failed,
            stats.embedding_unavailable,
            stats.tagged
        );

        (document, stats)
    }

    /// 为当前大纲计算标签向量
    pub async fn embed_labels(
        &self,
        taxonomy: &Taxonomy,
    ) -> Result<Vec<LabelEmbedding>, EmbeddingError> {
        self.tagging_service
            .embed_labels(self.embedder.as_ref(), taxonomy)
            .await
    }

    /// 当前向量服务的模型 ID
    pub fn embedding_model(&self) -> &str {
        self.embedder.model_id()
    }

    /// 向量模型变更后刷新一个已入库文档：重算向量并重新标注
    ///
    /// 分类失败的记录保持原样；重算失败的记录降级为向量缺失。
    ///
    /// # 返回
    /// 返回刷新后仍缺向量的记录数
    pub async fn refresh_embeddings(
        &self,
        document: &mut Document,
        labels: &[LabelEmbedding],
        ctx: &DocumentCtx,
    ) -> usize {
        let mut unavailable = 0;
        for record in document.records.iter_mut() {
            if record.status == RecordStatus::ExtractionFailed {
                continue;
            }
            match self.embed_record(record, ctx).await {
                Some(embedding) => {
                    record.embedding = Some(embedding);
                    record.status = RecordStatus::Complete;
                }
                None => {
                    record.embedding = None;
                    record.status = RecordStatus::EmbeddingUnavailable;
                    unavailable += 1;
                }
            }
            record.topics = match (&record.embedding, labels.is_empty()) {
                (Some(embedding), false) => self.tagging_service.tag(embedding, labels),
                _ => Vec::new(),
            };
        }
        unavailable
    }

    /// 单块处理：分类、互赖裁决
    async fn process_block(&self, block: &QuestionBlock, ctx: &DocumentCtx) -> BlockOutcome {
        if self.verbose_logging {
            self.log_block(ctx.document_index, block);
        }

        let classification = match self.classify_service.classify_block(block).await {
            Ok(classification) => Some(classification),
            Err(e) => {
                warn!(
                    "[文档 {}] ⚠️ 题 {} 分类失败，记录降级: {}",
                    ctx.document_index, block.ordinal, e
                );
                None
            }
        };

        let resolution = match &classification {
            Some(c) => self.dependency_service.resolve(block, c.oracle_independent).await,
            None => self.dependency_service.resolve_without_oracle(block),
        };

        BlockOutcome {
            classification,
            resolution,
        }
    }

    /// 把块处理结果组装为入库记录
    fn build_record(
        &self,
        document_id: &str,
        block: &QuestionBlock,
        outcome: BlockOutcome,
        occurrence: u32,
    ) -> QuestionRecord {
        let BlockOutcome {
            classification,
            resolution,
        } = outcome;

        let (snippet, question_type, status) = match classification {
            Some(c) => (c.snippet, Some(c.question_type), RecordStatus::Complete),
            // 分类失败时片段按原文本地计算，题型缺失
            None => (
                snippet_of(block.question_line()),
                None,
                RecordStatus::ExtractionFailed,
            ),
        };

        QuestionRecord {
            id: RecordId::new(document_id, block.ordinal, occurrence),
            snippet,
            question_type,
            sub_questions_independent: resolution.independence,
            sub_question_snippets: resolution.sub_question_snippets,
            topics: Vec::new(),
            embedding: None,
            status,
            raw_text: block.raw_text.clone(),
            duplicate_ordinal: block.duplicate_ordinal,
            local_scan_dependent: resolution.local_scan_dependent,
            oracle_verdict: resolution.oracle_verdict,
        }
    }

    /// 单条记录向量化，带有限重试
    async fn embed_record(&self, record: &QuestionRecord, ctx: &DocumentCtx) -> Option<Vec<f32>> {
        let text = self.embedding_text(record);

        for attempt in 1..=self.embed_max_attempts {
            match self.embedder.embed(&text).await {
                Ok(embedding) => return Some(embedding),
                Err(e) => {
                    warn!(
                        "[文档 {}] ⚠️ 记录 {} 向量化失败 (尝试 {}/{}): {}",
                        ctx.document_index, record.id, attempt, self.embed_max_attempts, e
                    );
                    if attempt < self.embed_max_attempts {
                        let shift = (attempt - 1).min(10) as u32;
                        sleep(Duration::from_millis(
                            self.retry_base_delay_ms.saturating_mul(1 << shift),
                        ))
                        .await;
                    }
                }
            }
        }
        None
    }

    /// 向量化前的整合文本：`[题型] 正文`，图片引用标记剥离
    fn embedding_text(&self, record: &QuestionRecord) -> String {
        let stripped = self.image_ref.replace_all(&record.raw_text, "");
        let label = record
            .question_type
            .map(|t| t.label())
            .unwrap_or("Unknown");
        format!("[{}] {}", label, stripped.trim())
    }

    // ========== 日志辅助方法 ==========

    /// 显示主问块预览
    fn log_block(&self, document_index: usize, block: &QuestionBlock) {
        let preview = crate::utils::logging::truncate_text(&block.raw_text, 80);
        info!("[文档 {}] 题 {}: {}", document_index, block.ordinal, preview);
    }
}
