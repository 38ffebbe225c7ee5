//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本依次返回预置回复；脚本耗尽后回显最后一条 User 消息，便于本地跑通完整流程。

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::llm::{ChatRequest, ChatResponse, LlmClient, LlmError};
use crate::memory::{latest_user_text, Message};

/// Mock 客户端：脚本化回复 + 请求记录
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以一组回复构造；每次 chat 弹出一条
    pub fn scripted(responses: impl IntoIterator<Item = ChatResponse>) -> Self {
        let mock = Self::new();
        for r in responses {
            mock.push(r);
        }
        mock
    }

    pub fn push(&self, response: ChatResponse) {
        self.script.lock().push_back(Ok(response));
    }

    pub fn push_error(&self, error: LlmError) {
        self.script.lock().push_back(Err(error));
    }

    /// 已收到的请求数
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// 第 n 次请求的消息快照
    pub fn request_messages(&self, n: usize) -> Option<Vec<Message>> {
        self.requests.lock().get(n).map(|r| r.messages.clone())
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let last_user = latest_user_text(&request.messages)
            .unwrap_or("(no input)")
            .to_string();
        self.requests.lock().push(request);

        if let Some(next) = self.script.lock().pop_front() {
            return next;
        }
        Ok(ChatResponse::text(format!("Echo from Mock: {}", last_user)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn script_then_echo() {
        let mock = MockLlmClient::scripted([ChatResponse::text("first")]);
        let req = ChatRequest::new(vec![Message::user("hello")]);

        let a = mock.chat(req.clone()).await.unwrap();
        assert_eq!(a.content_text(), "first");
        let b = mock.chat(req).await.unwrap();
        assert_eq!(b.content_text(), "Echo from Mock: hello");
        assert_eq!(mock.calls(), 2);
    }
}
