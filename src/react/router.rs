//! 任务路由：判断本次任务走 ReCAP 还是 ReAct
//!
//! 只看最近 12 条消息，让模型输出 RECAP 或 REACT；任何失败都退回 ReAct。

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RoutingPolicy;
use crate::llm::{ChatRequest, LlmClient};
use crate::memory::{Message, Role};

const ROUTER_WINDOW: usize = 12;

const ROUTER_PROMPT: &str = "你是任务路由器，需要判断用户最新的任务应该用哪种方式执行。\n\
- RECAP：任务复杂，需要拆分为多个子任务、多个阶段或多次检索汇总才能完成。\n\
- REACT：简单问答、闲聊、单步工具调用或可以直接完成的任务。\n\
只输出 RECAP 或 REACT。";

/// 执行引擎
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    React,
    Recap,
}

pub struct TaskRouter {
    llm: Arc<dyn LlmClient>,
    policy: RoutingPolicy,
}

impl TaskRouter {
    pub fn new(llm: Arc<dyn LlmClient>, policy: RoutingPolicy) -> Self {
        Self { llm, policy }
    }

    /// 按策略选择引擎；auto 时询问模型
    pub async fn route(&self, history: &[Message]) -> Route {
        match self.policy {
            RoutingPolicy::React => Route::React,
            RoutingPolicy::Recap => Route::Recap,
            RoutingPolicy::Auto => self.classify(history).await,
        }
    }

    async fn classify(&self, history: &[Message]) -> Route {
        let start = history.len().saturating_sub(ROUTER_WINDOW);
        let mut messages = vec![Message::system(ROUTER_PROMPT)];
        // 只保留文本对话，避免把悬空的 tool 消息发给模型
        messages.extend(
            history[start..]
                .iter()
                .filter(|m| matches!(m.role, Role::User | Role::Assistant) && !m.text().is_empty())
                .map(|m| match m.role {
                    Role::User => Message::user(m.text()),
                    _ => Message::assistant(m.text()),
                }),
        );

        let response = match self.llm.chat(ChatRequest::new(messages)).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "router call failed, using react");
                return Route::React;
            }
        };
        let decision = parse_route(response.content_text());
        debug!(?decision, "task routed");
        decision
    }
}

/// 解析路由输出；无法识别时为 ReAct
pub fn parse_route(output: &str) -> Route {
    let upper = output.trim().to_uppercase();
    if upper.starts_with("RECAP") || (upper.contains("RECAP") && !upper.contains("REACT")) {
        Route::Recap
    } else {
        Route::React
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, LlmError, MockLlmClient};

    #[test]
    fn parses_router_answers() {
        assert_eq!(parse_route("RECAP"), Route::Recap);
        assert_eq!(parse_route(" recap\n"), Route::Recap);
        assert_eq!(parse_route("REACT"), Route::React);
        assert_eq!(parse_route("不确定"), Route::React);
    }

    #[tokio::test]
    async fn auto_policy_asks_model_with_recent_window() {
        let mock = Arc::new(MockLlmClient::scripted([ChatResponse::text("RECAP")]));
        let router = TaskRouter::new(mock.clone(), RoutingPolicy::Auto);
        let history: Vec<Message> = (0..20).map(|i| Message::user(format!("m{i}"))).collect();
        assert_eq!(router.route(&history).await, Route::Recap);
        let sent = mock.request_messages(0).unwrap();
        assert_eq!(sent.len(), 1 + ROUTER_WINDOW);
        assert_eq!(sent[1].text(), "m8");
    }

    #[tokio::test]
    async fn failures_fall_back_to_react() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::Transport("down".into()));
        let router = TaskRouter::new(mock, RoutingPolicy::Auto);
        assert_eq!(router.route(&[Message::user("hi")]).await, Route::React);
    }

    #[tokio::test]
    async fn fixed_policies_skip_the_model() {
        let mock = Arc::new(MockLlmClient::new());
        let router = TaskRouter::new(mock.clone(), RoutingPolicy::Recap);
        assert_eq!(router.route(&[Message::user("hi")]).await, Route::Recap);
        assert_eq!(mock.calls(), 0);
    }
}
