//! 流程层 - 编排单个文档的处理流程
//!
//! 这一层定义"一个文档怎么处理"，不关心批量调度与资源管理

pub mod document_ctx;
pub mod document_flow;

pub use document_ctx::DocumentCtx;
pub use document_flow::{DocumentFlow, FlowStats};
