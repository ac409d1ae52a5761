//! 文档处理上下文
//!
//! 封装"我正在处理哪个文档"这一信息

use std::fmt::Display;

/// 文档处理上下文
///
/// 包含处理单个文档所需的全部上下文信息
#[derive(Debug, Clone)]
pub struct DocumentCtx {
    /// 文档ID（文件名主干）
    pub document_id: String,

    /// 文档在本批次中的序号（仅用于日志显示，从1开始）
    pub document_index: usize,
}

impl DocumentCtx {
    /// 创建新的文档上下文
    pub fn new(document_id: String, document_index: usize) -> Self {
        Self {
            document_id,
            document_index,
        }
    }
}

impl Display for DocumentCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[文档 ID#{} 序号#{}]", self.document_id, self.document_index)
    }
}
