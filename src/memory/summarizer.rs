//! 对话摘要器
//!
//! 把一段旧消息压缩为固定五段结构（事实 / 已完成 / 未完成/待办 / 约束 / 下一步）。
//! LlmSummarizer 调模型生成；出错或输出为空时由 HeuristicSummarizer 关键词规则兜底，
//! 所以 [`summarize_with_fallback`] 永不失败。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::llm::{ChatRequest, LlmClient};
use crate::memory::{Message, Role};

/// 摘要器 trait
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String, String>;
}

const MAX_SECTION_ITEMS: usize = 3;
const ITEM_CHARS: usize = 120;
const UNSPECIFIED: &str = "未明确";

const DONE_KEYWORDS: &[&str] = &["已完成", "完成", "实现", "修复", "新增", "更新", "改为"];
const TODO_KEYWORDS: &[&str] = &["需要", "请", "想要", "待", "下一步", "TODO"];
const CONSTRAINT_KEYWORDS: &[&str] = &["不要", "必须", "仅", "不能", "限制", "要求", "注意"];

/// 五段式结构化摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredSummary {
    pub facts: Vec<String>,
    pub done: Vec<String>,
    pub todo: Vec<String>,
    pub constraints: Vec<String>,
    pub next_steps: Vec<String>,
}

impl StructuredSummary {
    /// 没有任何可摘要内容时的占位摘要
    pub fn empty() -> Self {
        Self {
            facts: vec!["无".to_string()],
            done: vec![UNSPECIFIED.to_string()],
            todo: vec![UNSPECIFIED.to_string()],
            constraints: vec![UNSPECIFIED.to_string()],
            next_steps: vec!["无".to_string()],
        }
    }

    pub fn render(&self) -> String {
        format!(
            "事实: {}\n已完成: {}\n未完成/待办: {}\n约束: {}\n下一步: {}",
            self.facts.join("；"),
            self.done.join("；"),
            self.todo.join("；"),
            self.constraints.join("；"),
            self.next_steps.join("；"),
        )
    }
}

/// 单行化并截断到 120 字符
fn clip_item(content: &str) -> String {
    let flat = content.trim().replace('\n', " ");
    if flat.chars().count() > ITEM_CHARS {
        let head: String = flat.chars().take(ITEM_CHARS).collect();
        format!("{head}...")
    } else {
        flat
    }
}

fn push_capped(list: &mut Vec<String>, item: &str) {
    if list.len() < MAX_SECTION_ITEMS {
        list.push(item.to_string());
    }
}

fn or_unspecified(list: Vec<String>) -> Vec<String> {
    if list.is_empty() {
        vec![UNSPECIFIED.to_string()]
    } else {
        list
    }
}

/// 确定性关键词摘要：user 消息作为事实，含完成词的 assistant 消息作为已完成，
/// 含请求词 / 约束词的任意消息作为待办 / 约束
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicSummarizer;

impl HeuristicSummarizer {
    pub fn structured(&self, messages: &[Message]) -> StructuredSummary {
        if messages.is_empty() {
            return StructuredSummary::empty();
        }

        let mut facts = Vec::new();
        let mut done = Vec::new();
        let mut todo = Vec::new();
        let mut constraints = Vec::new();

        for msg in messages {
            let content = msg.text().trim();
            if content.is_empty() {
                continue;
            }
            let item = clip_item(content);

            if msg.role == Role::User {
                push_capped(&mut facts, &item);
            }
            if msg.role == Role::Assistant && DONE_KEYWORDS.iter().any(|k| item.contains(k)) {
                push_capped(&mut done, &item);
            }
            if TODO_KEYWORDS.iter().any(|k| item.contains(k)) {
                push_capped(&mut todo, &item);
            }
            if CONSTRAINT_KEYWORDS.iter().any(|k| item.contains(k)) {
                push_capped(&mut constraints, &item);
            }
        }

        let todo = or_unspecified(todo);
        let next_steps = todo.iter().take(2).cloned().collect();
        StructuredSummary {
            facts: or_unspecified(facts),
            done: or_unspecified(done),
            todo,
            constraints: or_unspecified(constraints),
            next_steps,
        }
    }

    pub fn summarize_text(&self, messages: &[Message]) -> String {
        self.structured(messages).render()
    }
}

#[async_trait]
impl Summarizer for HeuristicSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, String> {
        Ok(self.summarize_text(messages))
    }
}

/// 基于 LLM 的对话摘要器
pub struct LlmSummarizer {
    llm: Arc<dyn LlmClient>,
    max_input_chars: usize,
    max_output_chars: usize,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            max_input_chars: 4000,
            max_output_chars: 500,
        }
    }

    /// 每条消息一行 "role: content"，累计超过上限即停止并追加 "..."
    fn format_messages(&self, messages: &[Message]) -> String {
        let mut parts = Vec::new();
        let mut total = 0usize;
        for msg in messages {
            let line = format!("{}: {}", msg.role.as_str(), msg.text().trim().replace('\n', " "));
            total += line.chars().count() + 1;
            parts.push(line);
            if total >= self.max_input_chars {
                break;
            }
        }
        let mut text = parts.join("\n");
        if total >= self.max_input_chars {
            text.push_str("\n...");
        }
        text
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, String> {
        if messages.is_empty() {
            return Ok(StructuredSummary::empty().render());
        }
        let prompt = format!(
            "请用中文将对话压缩为结构化摘要，要求：\n\
             - 保留关键事实、决策、任务、约束与未完成事项\n\
             - 明确写出“已完成”的事项\n\
             - 不要编造信息\n\
             - 严格按以下格式输出，每行一个字段，不要附加其他文字：\n\
             事实: ...\n已完成: ...\n未完成/待办: ...\n约束: ...\n下一步: ...\n\
             对话内容如下：\n{}",
            self.format_messages(messages)
        );
        let request = ChatRequest::new(vec![
            Message::system("你是一个严谨的对话摘要器。"),
            Message::user(prompt),
        ]);
        let response = self.llm.chat(request).await.map_err(|e| e.to_string())?;
        let text = response.content_text().trim();
        if text.chars().count() > self.max_output_chars {
            let head: String = text.chars().take(self.max_output_chars).collect();
            Ok(format!("{}...", head.trim_end()))
        } else {
            Ok(text.to_string())
        }
    }
}

/// 先用主摘要器，出错或为空时退回启发式摘要
pub async fn summarize_with_fallback(primary: Option<&dyn Summarizer>, messages: &[Message]) -> String {
    if let Some(summarizer) = primary {
        match summarizer.summarize(messages).await {
            Ok(summary) if !summary.trim().is_empty() => return summary.trim().to_string(),
            Ok(_) => warn!("summarizer returned empty output, using heuristic"),
            Err(e) => warn!("summarizer failed: {}, using heuristic", e),
        }
    }
    HeuristicSummarizer.summarize_text(messages)
}
