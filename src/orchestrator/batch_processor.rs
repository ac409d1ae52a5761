//! 批量文档处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个应用的入口，负责批量文档的处理和资源管理。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：启动日志、创建 Oracle 与向量客户端、打开工作区
//! 2. **大纲准备**：复用落盘的主题分类树，或从大纲文件重新构建
//! 3. **工作区恢复**：加载已入库文档进题库，向量模型变更时整库重算
//! 4. **并发控制**：使用 Semaphore 限制并发数量
//! 5. **分批处理**：将文档分批次处理，每批完成后再开始下一批
//! 6. **全局统计**：汇总所有文档的处理结果
//!
//! ## 设计特点
//!
//! - **顶层编排**：不处理单个文档的细节
//! - **资源所有者**：唯一持有题库索引与工作区存储的模块
//! - **并发安全**：通过 Semaphore 和 tokio::spawn 实现并发
//! - **向下委托**：委托 DocumentFlow 处理单个文档

use crate::bank::{QuestionBank, StoredSyllabus, WorkspaceStore};
use crate::clients::{LlmOracle, OpenAiEmbedding, ReasoningOracle};
use crate::config::Config;
use crate::models::{load_all_markdown_files, DocumentSource, LabelEmbedding, Taxonomy};
use crate::services::SyllabusService;
use crate::utils::logging::{
    init_log_file, log_batch_complete, log_batch_start, log_documents_loaded, log_startup,
};
use crate::workflow::{DocumentCtx, DocumentFlow, FlowStats};
use anyhow::Result;
use std::fs;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// 应用主结构
pub struct App {
    config: Config,
    flow: Arc<DocumentFlow>,
    syllabus_service: SyllabusService,
    bank: Arc<QuestionBank>,
    store: Arc<WorkspaceStore>,
}

impl App {
    /// 初始化应用
    pub fn initialize(config: Config) -> Result<Self> {
        // 初始化日志文件
        init_log_file(&config.output_log_file)?;

        log_startup(config.max_concurrent_documents);

        let oracle: Arc<dyn ReasoningOracle> = Arc::new(LlmOracle::new(&config));
        let embedder = Arc::new(OpenAiEmbedding::new(&config));

        let flow = Arc::new(DocumentFlow::new(&config, Arc::clone(&oracle), embedder)?);
        let syllabus_service = SyllabusService::new(
            oracle,
            config.classify_max_attempts,
            config.retry_base_delay_ms,
        )?;

        let store = Arc::new(WorkspaceStore::new(&config.workspace_folder));
        store.ensure_layout()?;

        Ok(Self {
            config,
            flow,
            syllabus_service,
            bank: Arc::new(QuestionBank::new()),
            store,
        })
    }

    /// 题库索引（检索接口由调用方消费）
    pub fn bank(&self) -> Arc<QuestionBank> {
        Arc::clone(&self.bank)
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<()> {
        // 准备大纲与标签向量
        let (taxonomy, labels, model_changed) = self.prepare_syllabus().await?;
        let labels = Arc::new(labels);

        // 恢复已入库的文档
        self.restore_workspace(&labels, model_changed).await?;

        // 扫描输入目录
        let sources = self.load_sources().await?;
        if sources.is_empty() {
            warn!("⚠️ 没有找到待处理的Markdown文件，程序结束");
            self.print_bank_summary(&taxonomy).await;
            return Ok(());
        }

        // 跳过已入库的文档
        let (pending, skipped) = self.filter_pending(sources);
        if pending.is_empty() {
            info!("✓ 所有文档均已入库，无需重新处理");
            self.print_bank_summary(&taxonomy).await;
            return Ok(());
        }

        log_documents_loaded(pending.len(), self.config.max_concurrent_documents);

        // 处理所有文档
        let mut stats = self.process_all_documents(pending, &labels).await?;
        stats.skipped = skipped;

        // 输出最终统计
        print_final_stats(&stats, &self.config);
        self.print_bank_summary(&taxonomy).await;

        Ok(())
    }

    /// 准备大纲：优先复用落盘结果，否则从大纲文件构建
    ///
    /// # 返回
    /// 返回 (分类树, 标签向量, 向量模型是否变更)
    async fn prepare_syllabus(&self) -> Result<(Taxonomy, Vec<LabelEmbedding>, bool)> {
        let current_model = self.flow.embedding_model().to_string();

        let stored = match self.store.load_syllabus() {
            Ok(stored) => stored,
            Err(e) => {
                warn!("⚠️ 已保存的大纲不可用，将重新构建: {}", e);
                None
            }
        };

        if let Some(stored) = stored {
            if stored.embedding_model == current_model {
                info!(
                    "✓ 复用已保存的大纲: 课程 '{}'，{} 个主题，{} 个标签向量",
                    stored.taxonomy.course_name,
                    stored.taxonomy.topics.len(),
                    stored.labels.len()
                );
                return Ok((stored.taxonomy, stored.labels, false));
            }

            // 模型变更：分类树保留，所有向量作废重算
            warn!(
                "⚡ 向量模型由 {} 变更为 {}，已保存的向量全部失效",
                stored.embedding_model, current_model
            );
            let labels = self.embed_labels_or_warn(&stored.taxonomy).await;
            if !labels.is_empty() {
                self.save_syllabus(&stored.taxonomy, &labels)?;
            }
            return Ok((stored.taxonomy, labels, true));
        }

        // 首次运行：从大纲文件构建
        let taxonomy = self.build_taxonomy_from_file().await;
        let labels = self.embed_labels_or_warn(&taxonomy).await;
        // 只落盘可用的大纲，失败的下次运行重试
        if !labels.is_empty() {
            self.save_syllabus(&taxonomy, &labels)?;
        }
        Ok((taxonomy, labels, false))
    }

    /// 读取大纲文件并提取主题分类树，失败时降级为空树
    async fn build_taxonomy_from_file(&self) -> Taxonomy {
        let path = &self.config.syllabus_file;
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!("⚠️ 大纲文件不可读 ({}): {}，主题标注不可用", path, e);
                return Taxonomy::empty();
            }
        };

        info!("🔍 正在从大纲提取主题分类树...");
        match self.syllabus_service.build_taxonomy(&text).await {
            Ok(taxonomy) => {
                if taxonomy.is_empty() {
                    warn!("⚠️ 大纲未产出任何主题，主题标注不可用");
                } else {
                    info!(
                        "✓ 分类树提取完成: 课程 '{}'，{} 个主题 / {} 个标签对",
                        taxonomy.course_name,
                        taxonomy.topics.len(),
                        taxonomy.pair_count()
                    );
                }
                taxonomy
            }
            Err(e) => {
                warn!("⚠️ 大纲提取失败，主题标注不可用: {}", e);
                Taxonomy::empty()
            }
        }
    }

    /// 计算标签向量，失败时降级为空（本次运行不做主题标注）
    async fn embed_labels_or_warn(&self, taxonomy: &Taxonomy) -> Vec<LabelEmbedding> {
        if taxonomy.is_empty() {
            return Vec::new();
        }
        match self.flow.embed_labels(taxonomy).await {
            Ok(labels) => {
                info!("✓ 标签向量就绪: {} 个", labels.len());
                labels
            }
            Err(e) => {
                warn!("⚠️ 标签向量计算失败，主题标注不可用: {}", e);
                Vec::new()
            }
        }
    }

    fn save_syllabus(&self, taxonomy: &Taxonomy, labels: &[LabelEmbedding]) -> Result<()> {
        self.store.save_syllabus(&StoredSyllabus {
            taxonomy: taxonomy.clone(),
            embedding_model: self.flow.embedding_model().to_string(),
            labels: labels.to_vec(),
        })?;
        Ok(())
    }

    /// 将已入库文档载入题库；向量模型变更时先整库重算再发布
    async fn restore_workspace(
        &self,
        labels: &[LabelEmbedding],
        model_changed: bool,
    ) -> Result<()> {
        let mut documents = self.store.load_all_documents()?;
        if documents.is_empty() {
            return Ok(());
        }

        if model_changed {
            info!(
                "⚡ 正在用新模型重算 {} 个已入库文档的向量...",
                documents.len()
            );
            for (idx, document) in documents.iter_mut().enumerate() {
                let ctx = DocumentCtx::new(document.id.clone(), idx + 1);
                let unavailable = self.flow.refresh_embeddings(document, labels, &ctx).await;
                if unavailable > 0 {
                    warn!("{} ⚠️ 重算后仍有 {} 条记录缺向量", ctx, unavailable);
                }
                self.store.save_document(document)?;
            }
        }

        let count = documents.len();
        for document in documents {
            self.bank.publish_document(document).await;
        }
        info!("✓ 已恢复 {} 个入库文档", count);
        Ok(())
    }

    /// 扫描输入目录
    async fn load_sources(&self) -> Result<Vec<DocumentSource>> {
        info!("\n📁 正在扫描待处理的文档...");
        load_all_markdown_files(&self.config.input_folder).await
    }

    /// 过滤掉已入库的文档
    ///
    /// # 返回
    /// 返回 (待处理文档, 跳过数)
    fn filter_pending(&self, sources: Vec<DocumentSource>) -> (Vec<DocumentSource>, usize) {
        if self.config.force_reingest {
            return (sources, 0);
        }
        let total = sources.len();
        let pending: Vec<DocumentSource> = sources
            .into_iter()
            .filter(|s| !self.store.is_ingested(&s.id))
            .collect();
        let skipped = total - pending.len();
        if skipped > 0 {
            info!(
                "✓ 跳过 {} 个已入库文档（设置 FORCE_REINGEST=true 可强制重处理）",
                skipped
            );
        }
        (pending, skipped)
    }

    /// 处理所有文档
    async fn process_all_documents(
        &self,
        sources: Vec<DocumentSource>,
        labels: &Arc<Vec<LabelEmbedding>>,
    ) -> Result<ProcessingStats> {
        let max_concurrent = self.config.max_concurrent_documents;
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let total = sources.len();
        let mut stats = ProcessingStats {
            total,
            ..Default::default()
        };

        // 分批处理
        for batch_start in (0..total).step_by(max_concurrent) {
            let batch_end = (batch_start + max_concurrent).min(total);
            let batch_sources = &sources[batch_start..batch_end];
            let batch_num = batch_start / max_concurrent + 1;
            let total_batches = (total + max_concurrent - 1) / max_concurrent;

            log_batch_start(batch_num, total_batches, batch_start + 1, batch_end, total);

            // 处理本批
            let batch_result = self
                .process_batch(batch_sources, batch_start, semaphore.clone(), labels)
                .await?;

            stats.success += batch_result.success;
            stats.failed += batch_result.failed;
            stats.records.add(batch_result.records);

            log_batch_complete(batch_num, batch_result.success, batch_end - batch_start);
        }

        Ok(stats)
    }

    /// 处理单个批次
    async fn process_batch(
        &self,
        batch_sources: &[DocumentSource],
        batch_start: usize,
        semaphore: Arc<Semaphore>,
        labels: &Arc<Vec<LabelEmbedding>>,
    ) -> Result<BatchResult> {
        let mut batch_handles = Vec::new();

        // 为本批创建并发任务
        for (idx, source) in batch_sources.iter().enumerate() {
            let document_index = batch_start + idx + 1;
            let permit = semaphore.clone().acquire_owned().await?;

            let flow = Arc::clone(&self.flow);
            let bank = Arc::clone(&self.bank);
            let store = Arc::clone(&self.store);
            let labels = Arc::clone(labels);
            let source = source.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let ctx = DocumentCtx::new(source.id.clone(), document_index);
                let (document, flow_stats) = flow.run(&source, &labels, &ctx).await;

                if let Err(e) = store.save_document(&document) {
                    error!("{} ❌ 文档落盘失败: {}", ctx, e);
                    return Err(anyhow::Error::from(e));
                }
                bank.publish_document(document).await;
                Ok(flow_stats)
            });
            batch_handles.push((document_index, handle));
        }

        // 等待本批所有任务完成
        let mut result = BatchResult::default();

        for (document_index, handle) in batch_handles {
            match handle.await {
                Ok(Ok(flow_stats)) => {
                    result.success += 1;
                    result.records.merge(flow_stats);
                }
                Ok(Err(_)) => {
                    result.failed += 1;
                }
                Err(e) => {
                    error!("[文档 {}] 任务执行失败: {}", document_index, e);
                    result.failed += 1;
                }
            }
        }

        Ok(result)
    }

    /// 题库现状摘要
    async fn print_bank_summary(&self, taxonomy: &Taxonomy) {
        info!(
            "📊 题库现状: {} 个文档, {} 条记录",
            self.bank.document_count().await,
            self.bank.record_count().await
        );
        if !taxonomy.is_empty() {
            let view = self.bank.by_topic(taxonomy).await;
            for topic in &view.topics {
                let count: usize = topic.subtopics.iter().map(|s| s.records.len()).sum();
                info!("  {}: {} 题", topic.name, count);
            }
        }
    }
}

/// 处理统计
#[derive(Debug, Default)]
struct ProcessingStats {
    success: usize,
    failed: usize,
    skipped: usize,
    total: usize,
    records: RecordTotals,
}

/// 批次处理结果
#[derive(Debug, Default)]
struct BatchResult {
    success: usize,
    failed: usize,
    records: RecordTotals,
}

/// 记录级累计统计
#[derive(Debug, Default, Clone, Copy)]
struct RecordTotals {
    total: usize,
    complete: usize,
    extraction_failed: usize,
    embedding_unavailable: usize,
    tagged: usize,
}

impl RecordTotals {
    fn merge(&mut self, stats: FlowStats) {
        self.total += stats.total_records;
        self.complete += stats.complete;
        self.extraction_failed += stats.extraction_failed;
        self.embedding_unavailable += stats.embedding_unavailable;
        self.tagged += stats.tagged;
    }

    fn add(&mut self, other: RecordTotals) {
        self.total += other.total;
        self.complete += other.complete;
        self.extraction_failed += other.extraction_failed;
        self.embedding_unavailable += other.embedding_unavailable;
        self.tagged += other.tagged;
    }
}

// ========== 日志辅助函数 ==========

fn print_final_stats(stats: &ProcessingStats, config: &Config) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", stats.success, stats.total);
    info!("❌ 失败: {}", stats.failed);
    if stats.skipped > 0 {
        info!("📋 跳过（已入库）: {}", stats.skipped);
    }
    info!("{}", "=".repeat(60));
    info!(
        "📄 记录: 共 {} 条（完成 {}，分类失败 {}，向量缺失 {}，已标注 {}）",
        stats.records.total,
        stats.records.complete,
        stats.records.extraction_failed,
        stats.records.embedding_unavailable,
        stats.records.tagged
    );
    info!("{}", "=".repeat(60));
    info!("\n日志已保存至: {}", config.output_log_file);
}
