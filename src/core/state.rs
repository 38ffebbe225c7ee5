//! 状态定义：任务阶段、系统事件与对外消息
//!
//! 每个用户的任务状态机：Idle → Running → {完成 → Idle, AwaitingHuman, Cancelling → Idle}。
//! Outbound 是协调器发给前端（CLI / IM 适配层）的唯一出口。

use serde::Serialize;

/// 单个用户的任务阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
pub enum TaskPhase {
    #[default]
    Idle,
    Running,
    /// 工具 ask_human 正在等待用户回答
    AwaitingHuman,
    /// 已请求取消，等待任务收尾
    Cancelling,
}

impl TaskPhase {
    /// 是否有任务在途（含等待人工与取消中）
    pub fn is_busy(&self) -> bool {
        !matches!(self, TaskPhase::Idle)
    }
}

/// 系统侧产生的消息（如闹钟到点），投递到协调器队列后按任务执行
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemEvent {
    pub user_id: String,
    pub text: String,
}

impl SystemEvent {
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            text: text.into(),
        }
    }
}

/// 发往前端的消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outbound {
    /// 任务最终回复；seq 为本任务内的递增序号
    Reply { user_id: String, seq: u64, text: String },
    /// ask_human 提出的问题
    Question { user_id: String, seq: u64, text: String },
    /// 状态提示（忙碌、已停止等）
    Notice { user_id: String, text: String },
    /// 任务失败
    Error { user_id: String, text: String },
}

impl Outbound {
    pub fn user_id(&self) -> &str {
        match self {
            Outbound::Reply { user_id, .. }
            | Outbound::Question { user_id, .. }
            | Outbound::Notice { user_id, .. }
            | Outbound::Error { user_id, .. } => user_id,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Outbound::Reply { text, .. }
            | Outbound::Question { text, .. }
            | Outbound::Notice { text, .. }
            | Outbound::Error { text, .. } => text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_is_the_only_free_phase() {
        assert!(!TaskPhase::Idle.is_busy());
        assert!(TaskPhase::Running.is_busy());
        assert!(TaskPhase::AwaitingHuman.is_busy());
        assert!(TaskPhase::Cancelling.is_busy());
    }

    #[test]
    fn outbound_serializes_with_kind_tag() {
        let msg = Outbound::Reply {
            user_id: "u".into(),
            seq: 2,
            text: "done".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "reply");
        assert_eq!(json["seq"], 2);
        assert_eq!(msg.text(), "done");
        assert_eq!(msg.user_id(), "u");
    }
}
