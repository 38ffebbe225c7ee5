//! OpenAI 兼容 API 客户端
//!
//! 直接以 reqwest 调用任意 OpenAI 兼容端点的 /chat/completions（可配置 base_url）；
//! 支持通义千问 compatible-mode、OpenAI、DeepSeek、自建代理等。工具调用走原生 tools / tool_calls 字段。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::llm::{ChatRequest, ChatResponse, LlmClient, LlmError};
use crate::memory::{Message, Role, ToolCall};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 HTTP Client、端点与 model 名
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    /// 累计 token 使用统计，每次调用后写入日志
    usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            usage: TokenUsage::new(),
        })
    }

    fn request_body(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(to_wire_message).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "top_p": request.top_p,
        });
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
            body["tool_choice"] = json!("auto");
        }
        if let Some(stop) = &request.stop {
            body["stop"] = json!([stop]);
        }
        body
    }
}

/// Message -> OpenAI 线上格式；assistant 的 tool_calls 需包成 {id, type, function}
fn to_wire_message(m: &Message) -> Value {
    let mut v = json!({
        "role": m.role.as_str(),
        "content": m.content,
    });
    if m.role == Role::Assistant && !m.tool_calls.is_empty() {
        let calls: Vec<Value> = m
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.arguments },
                })
            })
            .collect();
        v["tool_calls"] = json!(calls);
    }
    if m.role == Role::Tool {
        if let Some(id) = &m.tool_call_id {
            v["tool_call_id"] = json!(id);
        }
        if let Some(name) = &m.tool_name {
            v["name"] = json!(name);
        }
    }
    v
}

/// 解析 choices[0].message；arguments 若为对象（部分端点如此返回）则序列化回字符串
fn parse_response(data: &Value) -> Result<ChatResponse, LlmError> {
    let message = data["choices"]
        .get(0)
        .map(|c| &c["message"])
        .ok_or_else(|| LlmError::InvalidResponse("no choices in response".to_string()))?;

    let content = message["content"].as_str().map(|s| s.to_string());
    let mut tool_calls = Vec::new();
    if let Some(tcs) = message["tool_calls"].as_array() {
        for tc in tcs {
            // 部分端点不返回 id；补一个在整段对话内唯一的 id
            let id = tc["id"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(String::from)
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
            let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
            let arguments = match &tc["function"]["arguments"] {
                Value::String(s) => s.clone(),
                Value::Null => "{}".to_string(),
                other => other.to_string(),
            };
            tool_calls.push(ToolCall::new(id, name, arguments));
        }
    }
    Ok(ChatResponse {
        content,
        tool_calls,
    })
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let body = self.request_body(&request);
        let url = format!("{}/chat/completions", self.base_url);
        info!(model = %self.model, url = %url, tools = request.tools.len(), "calling LLM API");

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("HTTP request failed: {}", e);
                LlmError::Transport(e.to_string())
            })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        if !status.is_success() {
            error!(status = %status, "LLM API error: {}", text);
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        debug!(bytes = text.len(), "LLM response received");

        let data: Value =
            serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        // 提取 token 使用统计
        if let Some(usage) = data.get("usage") {
            let prompt = usage["prompt_tokens"].as_u64().unwrap_or(0);
            let completion = usage["completion_tokens"].as_u64().unwrap_or(0);
            self.usage.add(prompt, completion);
            let (_, _, total) = self.usage.get();
            info!(prompt, completion, total_tokens = total, "token usage");
        }

        parse_response(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_wraps_tool_calls() {
        let msg = Message::assistant_with_tool_calls(
            None,
            vec![ToolCall::new("c1", "read", r#"{"path":"a.txt"}"#)],
        );
        let v = to_wire_message(&msg);
        assert_eq!(v["tool_calls"][0]["type"], "function");
        assert_eq!(v["tool_calls"][0]["function"]["name"], "read");
        assert!(v["content"].is_null());

        let tool = to_wire_message(&Message::tool("c1", "read", "ok"));
        assert_eq!(tool["tool_call_id"], "c1");
    }

    #[test]
    fn parses_tool_calls_with_object_arguments() {
        let data = json!({
            "choices": [{ "message": {
                "content": null,
                "tool_calls": [
                    { "id": "x", "function": { "name": "time", "arguments": "{}" } },
                    { "function": { "name": "read", "arguments": { "path": "a" } } }
                ]
            }}]
        });
        let resp = parse_response(&data).unwrap();
        assert_eq!(resp.tool_calls.len(), 2);
        assert_eq!(resp.tool_calls[0].id, "x");
        assert!(resp.tool_calls[1].id.starts_with("call_"));
        assert_ne!(resp.tool_calls[1].id, "call_1");
        assert_eq!(resp.tool_calls[1].arguments, r#"{"path":"a"}"#);
    }

    #[test]
    fn body_includes_sampling_and_tools() {
        let client =
            OpenAiClient::new("http://localhost:1/v1/", "m", "k", Duration::from_secs(1)).unwrap();
        let req = ChatRequest::new(vec![Message::user("hi")])
            .with_tools(vec![json!({"type": "function"})])
            .with_stop("\n");
        let body = client.request_body(&req);
        assert_eq!(body["top_p"].as_f64().map(|v| (v * 10.0).round()), Some(1.0));
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["stop"][0], "\n");
        assert_eq!(client.base_url, "http://localhost:1/v1");
    }

    #[test]
    fn token_usage_accumulates() {
        let usage = TokenUsage::new();
        usage.add(10, 5);
        usage.add(3, 2);
        assert_eq!(usage.get(), (13, 7, 20));
    }

    #[test]
    fn missing_choices_is_invalid() {
        assert!(matches!(
            parse_response(&json!({})),
            Err(LlmError::InvalidResponse(_))
        ));
    }
}
