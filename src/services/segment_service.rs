//! 分段服务 - 业务能力层
//!
//! 只负责"把 OCR Markdown 切成主问块"能力，纯本地扫描，不调用任何网络服务
//!
//! ## 识别规则
//! - 主问标记：`1.` `1)` `1、` 形式的题号，出现在行首，或出现在行内时
//!   其前方是空白且空白之前是句末符号（`?` `!` `.` 及对应全角符号）。
//!   OCR 常把两道短题合并到同一行，行内规则用于拆开这种情况。
//! - 子问标记：`(a)` `a)` `a.` 从 a 起按字母升序，或 `(1)` `(2)` 从 1 起
//!   按数字升序。序列必须从头开始且至少两项，否则视为正文里的普通括号。
//! - 块文本逐字保留，两个主问标记之间的内容全部归属前一块。

use crate::models::question::{QuestionBlock, SubBlock};
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashMap;
use tracing::warn;

/// 分段服务
///
/// 职责：
/// - 扫描全文定位主问标记并切块
/// - 在块内识别子问序列
/// - 标记题号重复的块
/// - 不出现网络调用
/// - 不关心流程顺序
pub struct SegmentService {
    main_marker: Regex,
    paren_letter: Regex,
    paren_digit: Regex,
    bare_letter: Regex,
}

impl SegmentService {
    /// 创建新的分段服务
    pub fn new() -> Result<Self> {
        Ok(Self {
            // `1.` / `1)` 后必须跟空白；`1、` 在中文排版中本身即是分隔
            main_marker: Regex::new(r"(\d{1,3})(?:[.)]\s|、)")
                .context("主问标记正则编译失败")?,
            paren_letter: Regex::new(r"\(([a-z])\)").context("子问标记正则编译失败")?,
            paren_digit: Regex::new(r"\((\d{1,2})\)").context("子问标记正则编译失败")?,
            bare_letter: Regex::new(r"([a-z])[.)]\s").context("子问标记正则编译失败")?,
        })
    }

    /// 把一篇 OCR 文档切成主问块序列
    ///
    /// 没有任何主问标记时返回空列表，由调用方决定如何登记。
    pub fn segment(&self, raw_text: &str) -> Vec<QuestionBlock> {
        let markers = self.find_main_markers(raw_text);
        if markers.is_empty() {
            return Vec::new();
        }

        // 题号出现次数，重复题号的所有块都要标记
        let mut ordinal_counts: HashMap<u32, usize> = HashMap::new();
        for &(_, ordinal) in &markers {
            *ordinal_counts.entry(ordinal).or_insert(0) += 1;
        }

        let mut blocks = Vec::with_capacity(markers.len());
        let mut last_ordinal: Option<u32> = None;
        for (i, &(pos, ordinal)) in markers.iter().enumerate() {
            let end = markers
                .get(i + 1)
                .map(|&(next_pos, _)| next_pos)
                .unwrap_or(raw_text.len());
            let text = raw_text[pos..end].trim_end().to_string();

            let duplicate = ordinal_counts.get(&ordinal).copied().unwrap_or(0) > 1;
            if duplicate {
                warn!("题号 {} 重复出现，保留为独立块并标记", ordinal);
            }
            if let Some(last) = last_ordinal {
                if ordinal < last {
                    warn!("题号乱序: {} 出现在 {} 之后", ordinal, last);
                }
            }
            last_ordinal = Some(ordinal);

            let sub_blocks = self.find_sub_blocks(&text);
            blocks.push(QuestionBlock {
                ordinal,
                raw_text: text,
                sub_blocks,
                duplicate_ordinal: duplicate,
            });
        }

        blocks
    }

    /// 定位全部主问标记，返回 (字节位置, 题号)
    fn find_main_markers(&self, text: &str) -> Vec<(usize, u32)> {
        let mut markers = Vec::new();
        for caps in self.main_marker.captures_iter(text) {
            let (whole, digits) = match (caps.get(0), caps.get(1)) {
                (Some(w), Some(d)) => (w, d),
                _ => continue,
            };
            if !is_block_boundary(text, whole.start()) {
                continue;
            }
            let ordinal = match digits.as_str().parse::<u32>() {
                Ok(n) => n,
                Err(_) => continue,
            };
            markers.push((whole.start(), ordinal));
        }
        markers
    }

    /// 在块内识别子问序列
    ///
    /// 字母链（`(a)`/`a)`/`a.`）优先于数字链（`(1)`/`(2)`）。
    fn find_sub_blocks(&self, block_text: &str) -> Vec<SubBlock> {
        let letter_chain = build_chain(&self.letter_candidates(block_text), 'a');
        if letter_chain.len() >= 2 {
            return slice_sub_blocks(block_text, &letter_chain);
        }
        let digit_chain = build_digit_chain(&self.digit_candidates(block_text));
        if digit_chain.len() >= 2 {
            return slice_sub_blocks(block_text, &digit_chain);
        }
        Vec::new()
    }

    /// 字母子问候选，含括号形式与裸字母形式，按位置排序
    fn letter_candidates(&self, text: &str) -> Vec<(usize, char)> {
        let mut candidates = Vec::new();
        for caps in self.paren_letter.captures_iter(text) {
            if let (Some(whole), Some(letter)) = (caps.get(0), caps.get(1)) {
                if is_sub_boundary(text, whole.start()) {
                    if let Some(c) = letter.as_str().chars().next() {
                        candidates.push((whole.start(), c));
                    }
                }
            }
        }
        for caps in self.bare_letter.captures_iter(text) {
            if let (Some(whole), Some(letter)) = (caps.get(0), caps.get(1)) {
                if is_sub_boundary(text, whole.start()) {
                    if let Some(c) = letter.as_str().chars().next() {
                        candidates.push((whole.start(), c));
                    }
                }
            }
        }
        candidates.sort_by_key(|&(pos, _)| pos);
        candidates.dedup_by_key(|&mut (pos, _)| pos);
        candidates
    }

    /// 数字子问候选，仅括号形式（裸数字形式是主问标记）
    fn digit_candidates(&self, text: &str) -> Vec<(usize, u32)> {
        let mut candidates = Vec::new();
        for caps in self.paren_digit.captures_iter(text) {
            if let (Some(whole), Some(digits)) = (caps.get(0), caps.get(1)) {
                if is_sub_boundary(text, whole.start()) {
                    if let Ok(n) = digits.as_str().parse::<u32>() {
                        candidates.push((whole.start(), n));
                    }
                }
            }
        }
        candidates.sort_by_key(|&(pos, _)| pos);
        candidates
    }
}

/// 主问标记的边界检查
///
/// 向前回看：跳过行内空白后，遇到行首或句末符号才算块边界。
/// 这样 `3.1.` 的小节号、`f(a) = 1. 5` 里的数值、`Total: 10.` 的统计行
/// 都不会被误认成题号。
fn is_block_boundary(text: &str, pos: usize) -> bool {
    if pos == 0 {
        return true;
    }
    let mut skipped_space = false;
    for c in text[..pos].chars().rev() {
        match c {
            ' ' | '\t' => skipped_space = true,
            '\n' | '\r' => return true,
            other => {
                return skipped_space
                    && matches!(other, '?' | '!' | '.' | '？' | '！' | '。');
            }
        }
    }
    // 整个前缀都是空白
    true
}

/// 子问标记的边界检查：前一个字符必须是空白或不存在
///
/// 排除 `f(a)` 这类函数记号。
fn is_sub_boundary(text: &str, pos: usize) -> bool {
    match text[..pos].chars().next_back() {
        None => true,
        Some(c) => c.is_whitespace(),
    }
}

/// 从候选中构建以 `start` 起的严格升序字母链，返回链上各标记的位置与标号
fn build_chain(candidates: &[(usize, char)], start: char) -> Vec<(usize, String)> {
    let mut chain = Vec::new();
    let mut expected = start;
    for &(pos, c) in candidates {
        if c == expected {
            chain.push((pos, c.to_string()));
            expected = (expected as u8 + 1) as char;
        }
    }
    chain
}

/// 从候选中构建以 1 起的严格升序数字链
fn build_digit_chain(candidates: &[(usize, u32)]) -> Vec<(usize, String)> {
    let mut chain = Vec::new();
    let mut expected = 1u32;
    for &(pos, n) in candidates {
        if n == expected {
            chain.push((pos, n.to_string()));
            expected += 1;
        }
    }
    chain
}

/// 按链上位置切出子问块，每块从自身标记起到下一标记前
fn slice_sub_blocks(block_text: &str, chain: &[(usize, String)]) -> Vec<SubBlock> {
    let mut subs = Vec::with_capacity(chain.len());
    for (i, (pos, label)) in chain.iter().enumerate() {
        let end = chain
            .get(i + 1)
            .map(|(next_pos, _)| *next_pos)
            .unwrap_or(block_text.len());
        subs.push(SubBlock {
            label: label.clone(),
            text: block_text[*pos..end].trim_end().to_string(),
        });
    }
    subs
}
