//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：输入有序消息 + 工具 schema + 固定采样参数，
//! 输出最终文本或一批工具调用。传输层失败以 LlmError 返回，由调用方视为当前步骤的致命错误。

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::memory::{Message, ToolCall};

/// 模型调用错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    /// 网络 / HTTP 层失败
    #[error("transport: {0}")]
    Transport(String),

    /// 端点返回非 2xx
    #[error("status {status}: {body}")]
    Status { status: u16, body: String },

    /// 返回体无法解析
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// 一次模型调用请求
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// OpenAI tools 规范（function schema）列表；为空时不下发 tools
    pub tools: Vec<Value>,
    pub temperature: f32,
    pub top_p: f32,
    pub stop: Option<String>,
}

impl ChatRequest {
    /// 固定采样参数：temperature 0，top_p 0.1
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            temperature: 0.0,
            top_p: 0.1,
            stop: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        self.stop = Some(stop.into());
        self
    }
}

/// 模型回复：tool_calls 非空即为「要执行工具」，否则 content 为最终回答
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            content: None,
            tool_calls: calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn content_text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 阻塞式请求 / 响应
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;
}
