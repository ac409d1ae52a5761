//! 大纲服务 - 业务能力层
//!
//! 只负责"大纲文本 → 两级主题树"能力，不关心流程
//!
//! ## 提取原则
//! 只保留大纲原文显式出现的主题与子主题，绝不推断补全；日程、评分
//! 政策、办公时间等行政内容一律忽略。提取不出任何主题时返回空树，
//! 这是合法结果而不是错误。

use crate::clients::oracle::ReasoningOracle;
use crate::error::OracleError;
use crate::models::taxonomy::{Taxonomy, TopicNode};
use anyhow::Result;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Oracle 响应的线格式
#[derive(Debug, Deserialize)]
struct SyllabusReply {
    #[serde(default)]
    course_name: String,
    #[serde(default)]
    topics: Vec<TopicReply>,
}

#[derive(Debug, Deserialize)]
struct TopicReply {
    #[serde(default)]
    name: String,
    #[serde(default)]
    subtopics: Vec<String>,
}

/// 大纲服务
///
/// 职责：
/// - 构建大纲解析提示词并调用 Oracle
/// - 解析 JSON 响应（直接 / 围栏代码块 / 花括号切片）
/// - 清洗主题树：去重、剔除无描述性的名字
/// - 不关心流程顺序
pub struct SyllabusService {
    oracle: Arc<dyn ReasoningOracle>,
    max_attempts: usize,
    retry_base_delay_ms: u64,
    fenced_json: Regex,
}

impl SyllabusService {
    /// 创建新的大纲服务
    pub fn new(oracle: Arc<dyn ReasoningOracle>, max_attempts: usize, retry_base_delay_ms: u64) -> Result<Self> {
        Ok(Self {
            oracle,
            max_attempts: max_attempts.max(1),
            retry_base_delay_ms,
            fenced_json: Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```")?,
        })
    }

    /// 从大纲文本构建主题树
    ///
    /// # 返回
    /// - 解析成功：清洗后的主题树（可能为空树）
    /// - 响应始终不合协议：空树（附警告日志）
    /// - 传输层重试耗尽：错误向上传播，由调用方决定降级
    pub async fn build_taxonomy(&self, syllabus_text: &str) -> Result<Taxonomy> {
        let (user_message, system_message) = self.build_messages(syllabus_text);

        let mut last_transport_error: Option<anyhow::Error> = None;

        for attempt in 1..=self.max_attempts {
            let response = match self
                .oracle
                .complete(&user_message, Some(&system_message))
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        "大纲解析调用失败 (尝试 {}/{}): {}",
                        attempt, self.max_attempts, e
                    );
                    last_transport_error = Some(e);
                    self.backoff(attempt).await;
                    continue;
                }
            };

            match self.parse_reply(&response) {
                Ok(reply) => {
                    let taxonomy = sanitize(reply);
                    info!(
                        "大纲解析完成: 课程 '{}', {} 个主题, {} 个 (主题, 子主题) 对",
                        taxonomy.course_name,
                        taxonomy.topics.len(),
                        taxonomy.pair_count()
                    );
                    return Ok(taxonomy);
                }
                Err(e) => {
                    warn!(
                        "大纲响应解析失败 (尝试 {}/{}): {}",
                        attempt, self.max_attempts, e
                    );
                    last_transport_error = None;
                    self.backoff(attempt).await;
                }
            }
        }

        if let Some(e) = last_transport_error {
            return Err(e.context("大纲解析调用在重试耗尽后仍失败"));
        }

        // 响应拿到了但始终不合协议：提取不出主题按空树处理
        warn!("大纲响应在重试耗尽后仍不合协议，按空主题树处理");
        Ok(Taxonomy::empty())
    }

    async fn backoff(&self, attempt: usize) {
        if attempt < self.max_attempts {
            let shift = (attempt - 1).min(10) as u32;
            let delay = self.retry_base_delay_ms.saturating_mul(1 << shift);
            sleep(Duration::from_millis(delay)).await;
        }
    }

    fn build_messages(&self, syllabus_text: &str) -> (String, String) {
        let system_message = "You are a syllabus analyst. You return only the JSON object \
                              you are asked for, with no commentary."
            .to_string();

        let user_message = format!(
            r#"The text in <Syllabus> is an OCR'd course syllabus.

Extract the course name and a two-level topic hierarchy:
- topics: the main subject areas the course covers
- subtopics: the sub-areas explicitly listed under each topic

Rules
• Only include topics and subtopics that are explicitly present in the text. Do not infer, merge, or invent entries.
• Ignore schedules, dates, grading policy, office hours, textbook lists, and other administrative content.
• A topic name must be descriptive; never use a bare page or section number as a name.
• If the text contains no course topics at all, return an empty topics list.

<Syllabus>
{syllabus_text}
</Syllabus>

Return exactly this JSON and nothing else:
{{"course_name": "...", "topics": [{{"name": "...", "subtopics": ["...", "..."]}}]}}"#,
        );

        (user_message, system_message)
    }

    /// 解析 JSON 响应，依次尝试：整体直接解析、围栏代码块、首尾花括号切片
    fn parse_reply(&self, response: &str) -> Result<SyllabusReply, OracleError> {
        if let Ok(reply) = serde_json::from_str::<SyllabusReply>(response.trim()) {
            return Ok(reply);
        }
        if let Some(caps) = self.fenced_json.captures(response) {
            if let Some(inner) = caps.get(1) {
                if let Ok(reply) = serde_json::from_str::<SyllabusReply>(inner.as_str()) {
                    return Ok(reply);
                }
            }
        }
        if let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) {
            if end > start {
                if let Ok(reply) = serde_json::from_str::<SyllabusReply>(&response[start..=end]) {
                    return Ok(reply);
                }
            }
        }
        Err(OracleError::schema_violation(
            "响应不是合法的大纲 JSON",
            response,
        ))
    }
}

/// 清洗主题树
///
/// 剔除没有字母的名字（纯数字、纯符号），主题与子主题分别按首次出现
/// 去重，名字全部 trim。
fn sanitize(reply: SyllabusReply) -> Taxonomy {
    let mut seen_topics: HashSet<String> = HashSet::new();
    let mut topics = Vec::new();

    for topic in reply.topics {
        let name = topic.name.trim().to_string();
        if !is_descriptive(&name) {
            warn!("剔除无描述性的主题名: '{}'", name);
            continue;
        }
        if !seen_topics.insert(name.clone()) {
            warn!("剔除重复主题: '{}'", name);
            continue;
        }

        let mut seen_subs: HashSet<String> = HashSet::new();
        let mut subtopics = Vec::new();
        for sub in topic.subtopics {
            let sub = sub.trim().to_string();
            if !is_descriptive(&sub) {
                continue;
            }
            if seen_subs.insert(sub.clone()) {
                subtopics.push(sub);
            }
        }

        topics.push(TopicNode { name, subtopics });
    }

    Taxonomy {
        course_name: reply.course_name.trim().to_string(),
        topics,
    }
}

/// 名字必须含至少一个字母才算有描述性
fn is_descriptive(name: &str) -> bool {
    !name.is_empty() && name.chars().any(|c| c.is_alphabetic())
}
