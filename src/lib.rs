//! # OCR Question Bank
//!
//! 一个从 OCR 试卷 Markdown 构建可检索题库的 Rust 应用程序
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Clients）
//! - `clients/` - 持有外部 API 连接，只暴露能力
//! - `ReasoningOracle` - LLM 推理能力（题型分类 / 互赖判定 / 大纲提取）
//! - `EmbeddingProvider` - 文本向量化能力
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单个题目块
//! - `SegmentService` - Markdown 切分能力
//! - `ClassifyService` - 题型分类能力
//! - `DependencyService` - 子题互赖判定能力
//! - `TaggingService` - 主题标注能力
//! - `SyllabusService` - 大纲分类树提取能力
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个文档"的完整处理流程
//! - `DocumentCtx` - 上下文封装（document_id + document_index）
//! - `DocumentFlow` - 流程编排（segment → classify → dependency → embed → tag）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_processor` - 批量文档处理器，管理资源和并发
//!
//! 横向支撑：`bank/`（题库索引与工作区存储）、`models/`（领域模型与加载器）
//!
//! ## 模块结构

pub mod bank;
pub mod clients;
pub mod config;
pub mod error;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use bank::{QuestionBank, QuestionFilter, SearchHit, TopicView, WorkspaceStore};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use models::{Document, QuestionRecord, Taxonomy};
pub use orchestrator::App;
pub use workflow::{DocumentCtx, DocumentFlow, FlowStats};
