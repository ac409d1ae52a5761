//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量处理和流程调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_processor` - 批量文档处理器
//! - 管理应用生命周期（初始化、运行、统计）
//! - 准备大纲分类树与标签向量（复用落盘结果或重新构建）
//! - 恢复已入库文档，向量模型变更时整库重算
//! - 批量加载文档（Vec<DocumentSource>）并跳过已入库者
//! - 控制并发数量（Semaphore）
//! - 输出全局统计信息
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理 Vec<DocumentSource>)
//!     ↓
//! workflow::DocumentFlow (处理单个文档)
//!     ↓
//! services (能力层：segment / classify / dependency / tagging / syllabus)
//!     ↓
//! clients (基础设施：ReasoningOracle / EmbeddingProvider)
//! ```
//!
//! ## 设计原则
//!
//! 1. **单一职责**：batch_processor 只管批量调度与资源
//! 2. **资源隔离**：只有编排层持有题库索引和工作区存储
//! 3. **向下依赖**：编排层 → workflow → services → clients
//! 4. **无业务逻辑**：只做调度和统计，不做具体业务判断

pub mod batch_processor;

// 重新导出主要类型
pub use batch_processor::App;
