//! 分类服务 - 业务能力层
//!
//! 只负责"单个主问块的题型判定"能力，不关心流程
//!
//! ## 响应协议
//! Oracle 必须恰好返回三行：
//! ```text
//! question_start: <题目行前 20 个可见字符>
//! question_type: <封闭词表中的题型标签>
//! sub_questions_independent: <true|false|None>
//! ```
//! 任何偏离（多余评论、词表外标签、片段不是题目行前缀）都按协议违规
//! 拒绝，在有限次数内重试，重试耗尽由调用方把记录标为抽取失败。

use crate::clients::oracle::ReasoningOracle;
use crate::error::OracleError;
use crate::models::question::{snippet_of, QuestionBlock, QuestionType, SNIPPET_LEN};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// 单个主问块的分类结果
#[derive(Debug, Clone)]
pub struct Classification {
    /// 规范化后的题目起始片段
    pub snippet: String,
    pub question_type: QuestionType,
    /// Oracle 对子问互赖性的快速裁决（尚未与本地扫描合并）
    pub oracle_independent: Option<bool>,
}

/// 分类服务
///
/// 职责：
/// - 构建分类提示词并调用 Oracle
/// - 校验三行响应协议
/// - 协议违规与传输失败的有限重试
/// - 只处理单个块，不出现 Vec<QuestionBlock>
/// - 不关心流程顺序
pub struct ClassifyService {
    oracle: Arc<dyn ReasoningOracle>,
    max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl ClassifyService {
    /// 创建新的分类服务
    pub fn new(oracle: Arc<dyn ReasoningOracle>, max_attempts: usize, retry_base_delay_ms: u64) -> Self {
        Self {
            oracle,
            max_attempts: max_attempts.max(1),
            retry_base_delay_ms,
        }
    }

    /// 对一个主问块进行题型判定
    ///
    /// # 参数
    /// - `block`: 分段器产出的主问块
    ///
    /// # 返回
    /// 校验通过的分类结果；重试耗尽时返回最后一次的错误
    pub async fn classify_block(&self, block: &QuestionBlock) -> Result<Classification, OracleError> {
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
                        "分类调用失败 (尝试 {}/{}): {}",
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

            match self.validate_response(block, &response) {
                Ok(classification) => {
                    debug!(
                        "题 {} 分类为 {} (独立性: {:?})",
                        block.ordinal,
                        classification.question_type,
                        classification.oracle_independent
                    );
                    return Ok(classification);
                }
                Err(e) => {
                    warn!(
                        "分类响应校验失败 (尝试 {}/{}): {}",
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

    /// 构建分类提示词，返回 (user_message, system_message)
    fn build_messages(&self, block: &QuestionBlock) -> (String, String) {
        let system_message =
            "You are an exam question classifier and sub-question assessor. \
             You always answer in the exact three-line format you are given, with no commentary."
                .to_string();

        let user_message = format!(
            r#"The text in <QuestionBlock> is one main question extracted from an OCR'd exam paper.

Task
1. question_start – copy exactly the first {snippet_len} visible characters of the question line including its numbering, point value, punctuation, and spacing. If the line has fewer than {snippet_len} characters, copy the entire line.
2. question_type – pick one label from this fixed list (case-sensitive):
   • True/False – asks for a true-or-false judgment.
   • Short Answer – expects a brief phrase or ≤ 2-sentence answer.
   • Theory – conceptual explanation without detailed computation.
   • Numerical – requires calculation and a numeric result.
   • Proof – demands a formal derivation or proof.
   • Comparison – explicitly asks to compare or contrast items.
3. sub_questions_independent – decide whether the lettered sub-parts (a), (b), … are independent tasks (can be solved separately without sharing intermediate results).
   • Output true if every sub-question is independent of the others.
   • Output false if any sub-question depends on answers or work from another.
   • Output None if the main question has no sub-questions.

Rules
• Preserve original capitalization, spaces, math notation, etc., in the snippet.
• Produce no commentary.

<QuestionBlock>
{block_text}
</QuestionBlock>

Output exactly three lines in this exact order:
question_start: <snippet>
question_type: <type>
sub_questions_independent: <true|false|None>
Do not output anything else—no extra headers, numbering, or explanations."#,
            snippet_len = SNIPPET_LEN,
            block_text = block.raw_text,
        );

        (user_message, system_message)
    }

    /// 校验三行响应协议并规范化片段
    fn validate_response(
        &self,
        block: &QuestionBlock,
        response: &str,
    ) -> Result<Classification, OracleError> {
        let lines: Vec<&str> = response
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        if lines.len() != 3 {
            return Err(OracleError::schema_violation(
                format!("期望恰好 3 行，实际 {} 行", lines.len()),
                response,
            ));
        }

        let snippet_value = strip_prefix_field(lines[0], "question_start:")
            .ok_or_else(|| OracleError::schema_violation("第 1 行缺少 question_start 前缀", response))?;
        let type_value = strip_prefix_field(lines[1], "question_type:")
            .ok_or_else(|| OracleError::schema_violation("第 2 行缺少 question_type 前缀", response))?;
        let independent_value = strip_prefix_field(lines[2], "sub_questions_independent:")
            .ok_or_else(|| {
                OracleError::schema_violation("第 3 行缺少 sub_questions_independent 前缀", response)
            })?;

        let question_type =
            QuestionType::from_label(type_value).ok_or_else(|| OracleError::UnknownLabel {
                label: type_value.to_string(),
            })?;

        let oracle_independent = match independent_value {
            "true" => Some(true),
            "false" => Some(false),
            "None" | "none" | "null" => None,
            other => {
                return Err(OracleError::schema_violation(
                    format!("互赖性取值非法: '{}'", other),
                    response,
                ))
            }
        };

        let canonical = self.check_snippet(block, snippet_value)?;

        Ok(Classification {
            snippet: canonical,
            question_type,
            oracle_independent,
        })
    }

    /// 片段必须是题目行的字面前缀，长度不超过 20 字符，
    /// 不足 20 字符时必须等于整行（允许行尾空白被模型剥掉）。
    /// 校验通过后返回规范片段，保证下游前缀性质按位成立。
    fn check_snippet(&self, block: &QuestionBlock, snippet: &str) -> Result<String, OracleError> {
        let line = block.question_line();
        let canonical = snippet_of(line);

        if snippet.is_empty()
            || !line.starts_with(snippet)
            || snippet.chars().count() > SNIPPET_LEN
        {
            return Err(OracleError::SnippetMismatch {
                snippet: snippet.to_string(),
            });
        }

        let full_length = snippet.chars().count() == canonical.chars().count();
        let trimmed_match = snippet == canonical.trim_end();
        if !full_length && !trimmed_match && snippet != line {
            return Err(OracleError::SnippetMismatch {
                snippet: snippet.to_string(),
            });
        }

        Ok(canonical)
    }
}

/// 剥掉字段前缀并 trim，前缀缺失返回 None
fn strip_prefix_field<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix).map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 按脚本顺序吐出响应的桩 Oracle
    struct ScriptedOracle {
        responses: Mutex<VecDeque<String>>,
    }

    impl ScriptedOracle {
        fn new(responses: &[&str]) -> Self {
            Self {
                responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            }
        }
    }

    #[async_trait]
    impl ReasoningOracle for ScriptedOracle {
        async fn complete(&self, _user: &str, _system: Option<&str>) -> Result<String> {
            let mut guard = self.responses.lock().expect("锁中毒");
            guard
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("脚本响应已用尽"))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn block(text: &str) -> QuestionBlock {
        QuestionBlock {
            ordinal: 1,
            raw_text: text.to_string(),
            sub_blocks: Vec::new(),
            duplicate_ordinal: false,
        }
    }

    fn service(responses: &[&str]) -> ClassifyService {
        ClassifyService::new(Arc::new(ScriptedOracle::new(responses)), 2, 0)
    }

    #[tokio::test]
    async fn accepts_well_formed_response() {
        let b = block("1. Is the matrix A invertible? Justify briefly.");
        let svc = service(&[
            "question_start: 1. Is the matrix A i\nquestion_type: True/False\nsub_questions_independent: None",
        ]);
        let c = svc.classify_block(&b).await.expect("分类应当成功");
        assert_eq!(c.question_type, QuestionType::TrueFalse);
        assert_eq!(c.oracle_independent, None);
        assert_eq!(c.snippet, snippet_of(b.question_line()));
        assert!(b.raw_text.starts_with(&c.snippet));
    }

    #[tokio::test]
    async fn rejects_label_outside_vocabulary() {
        let b = block("1. Describe the algorithm.");
        let svc = service(&[
            "question_start: 1. Describe the alg\nquestion_type: Essay\nsub_questions_independent: None",
            "question_start: 1. Describe the alg\nquestion_type: Essay\nsub_questions_independent: None",
        ]);
        let err = svc.classify_block(&b).await.expect_err("词表外标签必须拒绝");
        assert!(matches!(err, OracleError::UnknownLabel { .. }));
    }

    #[tokio::test]
    async fn rejects_commentary_around_fields() {
        let b = block("1. Compute the determinant of B.");
        let svc = service(&[
            "Sure! Here is my answer:\nquestion_start: 1. Compute the deter\nquestion_type: Numerical\nsub_questions_independent: None",
            "Sure! Here is my answer:\nquestion_start: 1. Compute the deter\nquestion_type: Numerical\nsub_questions_independent: None",
        ]);
        let err = svc.classify_block(&b).await.expect_err("多余评论必须拒绝");
        assert!(err.is_schema_violation());
    }

    #[tokio::test]
    async fn rejects_snippet_that_is_not_a_prefix() {
        let b = block("1. Compute the determinant of B.");
        let svc = service(&[
            "question_start: Compute the determin\nquestion_type: Numerical\nsub_questions_independent: None",
            "question_start: Compute the determin\nquestion_type: Numerical\nsub_questions_independent: None",
        ]);
        let err = svc.classify_block(&b).await.expect_err("非前缀片段必须拒绝");
        assert!(matches!(err, OracleError::SnippetMismatch { .. }));
    }

    #[tokio::test]
    async fn rejects_short_snippet_when_line_is_longer() {
        let b = block("1. Compute the determinant of B.");
        let svc = service(&[
            "question_start: 1. Compute\nquestion_type: Numerical\nsub_questions_independent: None",
            "question_start: 1. Compute\nquestion_type: Numerical\nsub_questions_independent: None",
        ]);
        let err = svc.classify_block(&b).await.expect_err("过短片段必须拒绝");
        assert!(matches!(err, OracleError::SnippetMismatch { .. }));
    }

    #[tokio::test]
    async fn accepts_whole_line_snippet_for_short_lines() {
        let b = block("2. Prove it.\nMore context on later lines.");
        let svc = service(&[
            "question_start: 2. Prove it.\nquestion_type: Proof\nsub_questions_independent: None",
        ]);
        let c = svc.classify_block(&b).await.expect("短行整行片段应当通过");
        assert_eq!(c.snippet, "2. Prove it.");
    }

    #[tokio::test]
    async fn retries_once_then_succeeds() {
        let b = block("3. Compare BFS and DFS.");
        let svc = service(&[
            "garbage with no fields",
            "question_start: 3. Compare BFS and D\nquestion_type: Comparison\nsub_questions_independent: None",
        ]);
        let c = svc.classify_block(&b).await.expect("第二次尝试应当成功");
        assert_eq!(c.question_type, QuestionType::Comparison);
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let b = block("4. State the theorem.");
        let svc = service(&["nope", "still nope"]);
        let err = svc.classify_block(&b).await.expect_err("重试耗尽必须报错");
        assert!(err.is_schema_violation());
    }

    #[tokio::test]
    async fn canonicalizes_snippet_with_stripped_trailing_space() {
        // 行的第 20 个字符恰好是空格，模型 trim 后少一个字符也接受，
        // 但存储的是规范片段
        let line = "5. (13 points) Find the eigenvalues of C.";
        let canonical = snippet_of(line);
        assert!(canonical.ends_with(' ') || canonical.chars().count() == SNIPPET_LEN);
        let b = block(line);
        let reply = format!(
            "question_start: {}\nquestion_type: Numerical\nsub_questions_independent: None",
            canonical.trim_end()
        );
        let svc = service(&[&reply]);
        let c = svc.classify_block(&b).await.expect("trim 后的片段应当通过");
        assert_eq!(c.snippet, canonical);
    }
}
