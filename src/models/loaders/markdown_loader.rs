use crate::models::document::DocumentSource;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 识别为 OCR 结果的文件扩展名（Mathpix `.mmd` 与普通 Markdown）
const MARKDOWN_EXTENSIONS: [&str; 3] = ["mmd", "md", "markdown"];

/// 读取单个 Markdown 文件并转换为 DocumentSource 对象
pub async fn load_markdown_source(path: &Path) -> Result<DocumentSource> {
    let raw_text = fs::read_to_string(path)
        .await
        .with_context(|| format!("无法读取Markdown文件: {}", path.display()))?;

    let name = path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let id = document_id_from_path(path);

    Ok(DocumentSource {
        id,
        name,
        file_path: path.to_string_lossy().to_string(),
        raw_text,
    })
}

/// 从文件夹中加载所有 Markdown 文件并转换为 DocumentSource 对象列表
///
/// 单个文件读取失败只记录警告，不中断整个批次。
pub async fn load_all_markdown_files(folder_path: &str) -> Result<Vec<DocumentSource>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut markdown_files = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_markdown_file(&path) {
            markdown_files.push(path);
        }
    }
    // 目录遍历顺序不稳定，按文件名排序保证批次顺序确定
    markdown_files.sort();

    let mut sources = Vec::new();
    for path in markdown_files {
        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        match load_markdown_source(&path).await {
            Ok(source) => {
                tracing::info!("成功加载 {} 字符", source.raw_text.chars().count());
                sources.push(source);
            }
            Err(e) => {
                tracing::warn!("加载文件失败 {}: {}", path.display(), e);
            }
        }
    }

    Ok(sources)
}

/// 文档 ID：文件名主干，非字母数字字符替换为下划线
pub fn document_id_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    stem.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn is_markdown_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| MARKDOWN_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
