//! ReAct 主循环
//!
//! 每一步：检查取消 -> 整理上下文（压缩结果留作后续步骤的工作上下文）-> 带全部工具 schema 调用模型 ->
//! 有 tool_calls 则并行执行并把结果写回 transcript，否则 content 即最终回答。
//! 达到最大步数时合成一段有界的「步数上限」回复。工具失败折叠为文本，模型调用失败向上传播。

use std::sync::Arc;

use tracing::{debug, info};

use crate::core::AgentError;
use crate::llm::{ChatRequest, LlmClient};
use crate::memory::{
    extract_spill_path, ContextWindowManager, Message, Summarizer, TokenEstimator,
};
use crate::tools::{ToolContext, ToolInvoker};

/// 单次对话内最大 ReAct 步数，防止死循环
pub const DEFAULT_MAX_STEPS: usize = 20;
/// 步数上限回复中过程摘要的 token 上限
const PROGRESS_SUMMARY_TOKENS: usize = 200;
/// 结果不做超长落盘处理的工具
const SKILL_TOOL: &str = "skill";

/// ReAct 运行结果：最终回复与本次新增的消息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReactOutcome {
    pub reply: String,
    pub new_messages: Vec<Message>,
}

impl ReactOutcome {
    /// 取消时的空结果
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.reply.is_empty() && self.new_messages.is_empty()
    }
}

/// 一次工具调用的记录，用于步数上限时的过程摘要
#[derive(Debug, Clone)]
struct ToolEvent {
    name: String,
    content: String,
}

impl ToolEvent {
    fn is_error(&self) -> bool {
        let lower = self.content.trim().to_lowercase();
        lower.starts_with("tool error")
            || lower.starts_with("tool not found")
            || lower.contains("error")
            || self.content.contains("错误")
    }
}

/// ReAct 执行引擎：持有模型、工具调用器与上下文窗口
pub struct ReactLoop {
    llm: Arc<dyn LlmClient>,
    invoker: Arc<ToolInvoker>,
    window: Arc<ContextWindowManager>,
    summarizer: Option<Arc<dyn Summarizer>>,
    system_prompt: String,
    max_steps: usize,
}

impl ReactLoop {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        invoker: Arc<ToolInvoker>,
        window: Arc<ContextWindowManager>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            invoker,
            window,
            summarizer: None,
            system_prompt: system_prompt.into(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    fn with_system(&self, transcript: &[Message]) -> Vec<Message> {
        let mut full = Vec::with_capacity(transcript.len() + 1);
        full.push(Message::system(self.system_prompt.clone()));
        full.extend_from_slice(transcript);
        full
    }

    /// 拼上 system prompt 并按预算整理，作为一次模型调用的输入；
    /// 发生压缩时 transcript 被替换为压缩后的版本（不含 system）
    pub async fn prepare(&self, transcript: &mut Vec<Message>) -> Vec<Message> {
        let mut full = self.with_system(transcript.as_slice());
        let prepared = self
            .window
            .prepare_in_place(&mut full, self.summarizer.as_deref(), true)
            .await;
        *transcript = full.into_iter().skip(1).collect();
        prepared
    }

    /// 在给定 transcript 上执行 ReAct；返回最终回复与新增消息（不含输入 history）
    pub async fn run(
        &self,
        history: &[Message],
        ctx: &ToolContext,
    ) -> Result<ReactOutcome, AgentError> {
        // 工作上下文：system + history，压缩后直接替换，后续步骤只在其后追加
        let mut context = self.with_system(history);
        let mut new_messages = Vec::new();
        let mut events: Vec<ToolEvent> = Vec::new();
        let tools = self.invoker.specs();

        for step in 0..self.max_steps {
            if ctx.is_cancelled() {
                info!(user_id = %ctx.user_id, step, "react cancelled");
                return Ok(ReactOutcome::empty());
            }

            let prepared = self
                .window
                .prepare_in_place(&mut context, self.summarizer.as_deref(), true)
                .await;
            let request = ChatRequest::new(prepared).with_tools(tools.clone());
            let response = self.llm.chat(request).await?;

            if !response.has_tool_calls() {
                let reply = response.content_text().trim().to_string();
                let message = Message::assistant(reply.clone());
                new_messages.push(message);
                debug!(step, "react final answer");
                return Ok(ReactOutcome {
                    reply,
                    new_messages,
                });
            }

            let calls = response.tool_calls.clone();
            let assistant = Message::assistant_with_tool_calls(response.content.clone(), calls.clone());
            context.push(assistant.clone());
            new_messages.push(assistant);

            info!(step, count = calls.len(), "react tool calls");
            let results = self.invoker.invoke_all(&calls, ctx).await;
            if ctx.is_cancelled() {
                info!(user_id = %ctx.user_id, step, "react cancelled after tools");
                return Ok(ReactOutcome::empty());
            }

            for (call, result) in calls.iter().zip(results) {
                let content = if call.name == SKILL_TOOL {
                    result
                } else {
                    self.window.normalize_tool_output(&result)
                };
                events.push(ToolEvent {
                    name: call.name.clone(),
                    content: content.clone(),
                });
                let message = Message::tool(call.id.clone(), call.name.clone(), content);
                context.push(message.clone());
                new_messages.push(message);
            }
        }

        info!(max_steps = self.max_steps, "react step limit reached");
        let reply = step_limit_reply(self.max_steps, self.max_steps, &events);
        new_messages.push(Message::assistant(reply.clone()));
        Ok(ReactOutcome {
            reply,
            new_messages,
        })
    }
}

/// 步数上限时的标准回复
fn step_limit_reply(max_steps: usize, steps: usize, events: &[ToolEvent]) -> String {
    let summary = progress_summary(events);
    [
        format!("已达到最大 {max_steps} 步执行（max_steps={max_steps}）。"),
        format!("本次已执行 {steps} 步 / 工具调用 {} 次。", events.len()),
        String::new(),
        "过程摘要（≤200 tokens）：".to_string(),
        summary,
        String::new(),
        "未完成：".to_string(),
        "- 尚未完成最终汇总与输出。".to_string(),
        String::new(),
        "需要你帮助：".to_string(),
        "- 请补充关键缺失信息或确认是否继续执行（回复“继续”也可以）。".to_string(),
    ]
    .join("\n")
}

fn tool_action(name: &str) -> Option<&'static str> {
    let name = name.to_lowercase();
    if name.contains("search") {
        Some("检索资料")
    } else if name.contains("fetch") || name.contains("web") || name.contains("browse") {
        Some("抓取网页")
    } else if name.contains("read") {
        Some("读取文件")
    } else if name.contains("write") || name.contains("edit") {
        Some("写入/编辑内容")
    } else if name.contains("skill") {
        Some("加载技能提示")
    } else {
        None
    }
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

/// 过程摘要：用过的工具、首个落盘路径、工具报错；限制在 200 token 内
fn progress_summary(events: &[ToolEvent]) -> String {
    if events.is_empty() {
        return "已尝试分析任务，但未执行任何工具调用，当前停在规划阶段。".to_string();
    }

    let mut names: Vec<&str> = Vec::new();
    let mut actions: Vec<&str> = Vec::new();
    let mut spills: Vec<String> = Vec::new();
    let mut failed: Vec<&str> = Vec::new();
    for event in events {
        push_unique(&mut names, event.name.as_str());
        if let Some(action) = tool_action(&event.name) {
            push_unique(&mut actions, action);
        }
        if let Some(path) = extract_spill_path(&event.content) {
            spills.push(path);
        }
        if event.is_error() {
            push_unique(&mut failed, event.name.as_str());
        }
    }

    let mut tools = names.iter().take(4).copied().collect::<Vec<_>>().join("、");
    if names.len() > 4 {
        tools.push_str(" 等");
    }
    let mut parts = vec![format!("已调用工具 {tools}，共 {} 次。", events.len())];
    if !actions.is_empty() {
        parts.push(format!("主要进行了{}。", actions.join("、")));
    }
    match spills.len() {
        0 => {}
        1 => parts.push(format!("其中有 1 次输出过长已落盘到 {}。", spills[0])),
        n => parts.push(format!("其中有 {n} 次输出过长，已落盘到 {} 等。", spills[0])),
    }
    if !failed.is_empty() {
        parts.push(format!("过程中出现工具报错：{}。", failed.join("、")));
    }
    TokenEstimator::truncate_to_tokens(&parts.join(""), PROGRESS_SUMMARY_TOKENS)
}
