//! 工具调用上下文
//!
//! 每次工具调用都带上当前用户、任务取消令牌，以及可选的会话监管（ask_human 用）
//! 和系统事件发送端（alarm 用）。

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{SessionSupervisor, SystemEvent};

#[derive(Clone, Debug)]
pub struct ToolContext {
    pub user_id: String,
    pub cancel: CancellationToken,
    pub session: Option<Arc<SessionSupervisor>>,
    pub events: Option<mpsc::UnboundedSender<SystemEvent>>,
}

impl ToolContext {
    pub fn new(user_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            user_id: user_id.into(),
            cancel,
            session: None,
            events: None,
        }
    }

    /// 不挂任何前端的上下文（测试、一次性调用）
    pub fn detached(user_id: impl Into<String>) -> Self {
        Self::new(user_id, CancellationToken::new())
    }

    pub fn with_session(mut self, session: Arc<SessionSupervisor>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SystemEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
