//! 子问互赖性服务 - 业务能力层
//!
//! 只负责"一组子问是否相互独立"的裁决，不关心流程
//!
//! ## 裁决顺序
//! 1. 没有子问标记 → 互赖性不存在（分段器优先于 Oracle 的任何说法）
//! 2. 本地回指扫描命中（"part"/"above"/"previous"/"earlier" 或对其他
//!    子问标号的字面引用）→ 直接判 dependent，不再咨询 Oracle
//! 3. 分类阶段 Oracle 已判 false → 采信 false
//! 4. 其余情况做一次深度裁决调用；只有本地扫描与 Oracle 同时指向
//!    independent 才判 independent，并在此时抽取各子问起始片段
//!
//! 信号冲突或深度调用重试耗尽时保守判 dependent，并记录审计日志。

use crate::clients::oracle::ReasoningOracle;
use crate::error::OracleError;
use crate::models::question::{Independence, QuestionBlock};
use anyhow::Result;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// 互赖性裁决结果
#[derive(Debug, Clone)]
pub struct Resolution {
    pub independence: Independence,
    /// 独立子问的起始片段，按原文出现顺序；仅 independent 时非空
    pub sub_question_snippets: Vec<String>,
    /// 本地回指扫描结论（审计用；无子问时为 None）
    pub local_scan_dependent: Option<bool>,
    /// Oracle 的最终裁决（深度调用优先于分类阶段的快速裁决）
    pub oracle_verdict: Option<bool>,
}

/// 深度裁决调用的解析结果
struct DeepVerdict {
    independent: bool,
    question_starts: Vec<String>,
}

/// 子问互赖性服务
///
/// 职责：
/// - 本地回指扫描
/// - 深度裁决调用与 JSON 协议校验
/// - 起始片段在原文中的边界定位
/// - 只处理单个块，不关心流程顺序
pub struct DependencyService {
    oracle: Arc<dyn ReasoningOracle>,
    max_attempts: usize,
    retry_base_delay_ms: u64,
    reference_phrase: Regex,
    label_citation: Regex,
    fenced_json: Regex,
}

impl DependencyService {
    /// 创建新的互赖性服务
    pub fn new(oracle: Arc<dyn ReasoningOracle>, max_attempts: usize, retry_base_delay_ms: u64) -> Result<Self> {
        Ok(Self {
            oracle,
            max_attempts: max_attempts.max(1),
            retry_base_delay_ms,
            reference_phrase: Regex::new(r"(?i)\b(parts?|above|previous(?:ly)?|earlier)\b")?,
            label_citation: Regex::new(r"\(([a-z]|\d{1,2})\)")?,
            fenced_json: Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```")?,
        })
    }

    /// 裁决一个主问块的子问互赖性
    ///
    /// # 参数
    /// - `block`: 主问块
    /// - `classifier_verdict`: 分类阶段 Oracle 给出的快速裁决
    ///
    /// 失败不向上传播：重试耗尽或信号冲突一律保守判 dependent 并记审计
    /// 日志，记录保持 Complete 状态。
    pub async fn resolve(
        &self,
        block: &QuestionBlock,
        classifier_verdict: Option<bool>,
    ) -> Resolution {
        // 1. 分段器没发现子问：互赖性不存在，Oracle 说什么都不算
        if block.sub_blocks.is_empty() {
            if classifier_verdict.is_some() {
                warn!(
                    "题 {} 无子问标记但 Oracle 给出互赖裁决 {:?}，以分段器为准",
                    block.ordinal, classifier_verdict
                );
            }
            return Resolution {
                independence: Independence::NoSubQuestions,
                sub_question_snippets: Vec::new(),
                local_scan_dependent: None,
                oracle_verdict: classifier_verdict,
            };
        }

        // 2. 本地回指扫描，命中即定论
        if self.local_scan_dependent(block) {
            debug!("题 {} 本地扫描发现回指，判定 dependent", block.ordinal);
            return Resolution {
                independence: Independence::Dependent,
                sub_question_snippets: Vec::new(),
                local_scan_dependent: Some(true),
                oracle_verdict: classifier_verdict,
            };
        }

        // 3. 分类阶段已判 false，采信
        if classifier_verdict == Some(false) {
            return Resolution {
                independence: Independence::Dependent,
                sub_question_snippets: Vec::new(),
                local_scan_dependent: Some(false),
                oracle_verdict: Some(false),
            };
        }

        // 4. 深度裁决：本地干净且 Oracle 未否定，需要两方一致才判 independent
        match self.deep_check(block).await {
            Ok(verdict) if verdict.independent => Resolution {
                independence: Independence::Independent,
                sub_question_snippets: verdict.question_starts,
                local_scan_dependent: Some(false),
                oracle_verdict: Some(true),
            },
            Ok(_) => {
                if classifier_verdict == Some(true) {
                    info!(
                        "题 {} 分类阶段判 independent 但深度裁决判 dependent，采信深度裁决",
                        block.ordinal
                    );
                }
                Resolution {
                    independence: Independence::Dependent,
                    sub_question_snippets: Vec::new(),
                    local_scan_dependent: Some(false),
                    oracle_verdict: Some(false),
                }
            }
            Err(e) => {
                warn!(
                    "题 {} 互赖裁决不可用，保守判 dependent: {}",
                    block.ordinal, e
                );
                Resolution {
                    independence: Independence::Dependent,
                    sub_question_snippets: Vec::new(),
                    local_scan_dependent: Some(false),
                    oracle_verdict: classifier_verdict,
                }
            }
        }
    }

    /// 分类已失败时的保守裁决，不再调用 Oracle
    ///
    /// 无子问时仍为 NoSubQuestions；有子问时本地扫描照做（审计用），
    /// 结论一律 dependent。
    pub fn resolve_without_oracle(&self, block: &QuestionBlock) -> Resolution {
        if block.sub_blocks.is_empty() {
            return Resolution {
                independence: Independence::NoSubQuestions,
                sub_question_snippets: Vec::new(),
                local_scan_dependent: None,
                oracle_verdict: None,
            };
        }
        let local = self.local_scan_dependent(block);
        warn!("题 {} 分类失败，互赖性保守判 dependent", block.ordinal);
        Resolution {
            independence: Independence::Dependent,
            sub_question_snippets: Vec::new(),
            local_scan_dependent: Some(local),
            oracle_verdict: None,
        }
    }

    /// 本地回指扫描
    ///
    /// 任一子问正文含回指短语，或字面引用了本组其他子问的标号，
    /// 整组判 dependent。标号引用只认本组确实存在的标号，避免把
    /// 数学记号里的普通括号当成引用。
    fn local_scan_dependent(&self, block: &QuestionBlock) -> bool {
        let labels: Vec<&str> = block.sub_blocks.iter().map(|s| s.label.as_str()).collect();

        for sub in &block.sub_blocks {
            if self.reference_phrase.is_match(&sub.text) {
                return true;
            }
            for caps in self.label_citation.captures_iter(&sub.text) {
                let (whole, label) = match (caps.get(0), caps.get(1)) {
                    (Some(w), Some(l)) => (w, l),
                    _ => continue,
                };
                // 位置 0 是子问自己的前导标记
                if whole.start() == 0 {
                    continue;
                }
                if labels.contains(&label.as_str()) {
                    return true;
                }
            }
        }
        false
    }

    /// 深度裁决调用，带有限重试
    async fn deep_check(&self, block: &QuestionBlock) -> Result<DeepVerdict, OracleError> {
        let (user_message, system_message) = self.build_messages(block);

        let mut last_error = OracleError::EmptyContent {
            model: self.oracle.model_name().to_string(),
        };

        for attempt in 1..=self.max_attempts {
            let response = match self
                .oracle
                .complete(&user_message, Some(&system_message))
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        "互赖裁决调用失败 (尝试 {}/{}): {}",
                        attempt, self.max_attempts, e
                    );
                    last_error = OracleError::ApiCallFailed {
                        model: self.oracle.model_name().to_string(),
                        source: e.into(),
                    };
                    self.backoff(attempt).await;
                    continue;
                }
            };

            match self.parse_deep_response(block, &response) {
                Ok(verdict) => return Ok(verdict),
                Err(e) => {
                    warn!(
                        "互赖裁决响应校验失败 (尝试 {}/{}): {}",
                        attempt, self.max_attempts, e
                    );
                    last_error = e;
                    self.backoff(attempt).await;
                }
            }
        }

        Err(last_error)
    }

    async fn backoff(&self, attempt: usize) {
        if attempt < self.max_attempts {
            let shift = (attempt - 1).min(10) as u32;
            let delay = self.retry_base_delay_ms.saturating_mul(1 << shift);
            sleep(Duration::from_millis(delay)).await;
        }
    }

    fn build_messages(&self, block: &QuestionBlock) -> (String, String) {
        let system_message = "You are a careful exam analyst. You return only the JSON object \
                              you are asked for, with no commentary."
            .to_string();

        let user_message = format!(
            r#"The text in <Question> is one main exam question whose lettered or numbered sub-questions have already been located.

Decide whether the sub-questions are independent tasks: each one can be solved separately without using answers or intermediate results from any other sub-question.

If they are independent, return exactly this JSON:
{{"sub_questions_independent": true, "question_starts": ["...", "..."]}}
where question_starts lists, for each sub-question in the order it appears, the first 10-20 characters of that sub-question copied verbatim from the text, including its marker (e.g. "(a) Compute").

If any sub-question depends on another, return exactly:
{{"sub_questions_independent": false}}
Do not include question_starts when the answer is false.

<Question>
{block_text}
</Question>

Return only JSON, no commentary."#,
            block_text = block.raw_text,
        );

        (user_message, system_message)
    }

    /// 解析深度裁决的 JSON 响应
    ///
    /// 依次尝试：整体直接解析、围栏代码块、首尾花括号切片。
    fn parse_deep_response(
        &self,
        block: &QuestionBlock,
        response: &str,
    ) -> Result<DeepVerdict, OracleError> {
        let value = self
            .extract_json(response)
            .ok_or_else(|| OracleError::schema_violation("响应中找不到 JSON 对象", response))?;

        let independent = value
            .get("sub_questions_independent")
            .and_then(Value::as_bool)
            .ok_or_else(|| {
                OracleError::schema_violation("缺少 sub_questions_independent 布尔字段", response)
            })?;

        if !independent {
            // false 响应必须省略 question_starts，出现即协议违规
            if value.get("question_starts").is_some() {
                return Err(OracleError::schema_violation(
                    "false 响应不得包含 question_starts",
                    response,
                ));
            }
            return Ok(DeepVerdict {
                independent: false,
                question_starts: Vec::new(),
            });
        }

        let starts = value
            .get("question_starts")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                OracleError::schema_violation("true 响应缺少 question_starts 数组", response)
            })?;
        if starts.is_empty() {
            return Err(OracleError::schema_violation(
                "question_starts 数组为空",
                response,
            ));
        }

        // 每个起始片段都必须能在原文中按边界定位
        let mut located: Vec<(usize, String)> = Vec::with_capacity(starts.len());
        for start in starts {
            let snippet = start.as_str().map(str::trim).unwrap_or("");
            if snippet.is_empty() {
                return Err(OracleError::schema_violation(
                    "question_starts 含非字符串或空项",
                    response,
                ));
            }
            let pos = find_with_boundary(&block.raw_text, snippet).ok_or_else(|| {
                OracleError::SnippetMismatch {
                    snippet: snippet.to_string(),
                }
            })?;
            located.push((pos, snippet.to_string()));
        }
        located.sort_by_key(|&(pos, _)| pos);
        located.dedup_by_key(|(pos, _)| *pos);

        Ok(DeepVerdict {
            independent: true,
            question_starts: located.into_iter().map(|(_, s)| s).collect(),
        })
    }

    fn extract_json(&self, response: &str) -> Option<Value> {
        if let Ok(v) = serde_json::from_str::<Value>(response.trim()) {
            return Some(v);
        }
        if let Some(caps) = self.fenced_json.captures(response) {
            if let Some(inner) = caps.get(1) {
                if let Ok(v) = serde_json::from_str::<Value>(inner.as_str()) {
                    return Some(v);
                }
            }
        }
        let start = response.find('{')?;
        let end = response.rfind('}')?;
        if end > start {
            serde_json::from_str::<Value>(&response[start..=end]).ok()
        } else {
            None
        }
    }
}

/// 在原文中定位片段，要求片段前一个字符不是字母数字或下划线
///
/// 避免 `1.` 匹配进 `11.` 这类部分命中，返回首个合法位置。
fn find_with_boundary(text: &str, needle: &str) -> Option<usize> {
    for (pos, _) in text.match_indices(needle) {
        let boundary_ok = match text[..pos].chars().next_back() {
            None => true,
            Some(c) => !(c.is_alphanumeric() || c == '_'),
        };
        if boundary_ok {
            return Some(pos);
        }
    }
    None
}
