//! 会话监管：单用户的任务生命周期、取消与人工介入
//!
//! 每个用户一个 SessionSupervisor，持有当前任务的 CancellationToken、待回答的问题、
//! 系统消息队列、回复序号与「忙碌时收到消息」标记。锁只在入队 / 出队 / 发信号时持有，从不跨 await。

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::state::{Outbound, TaskPhase};

#[derive(Debug)]
struct RunState {
    phase: TaskPhase,
    cancel: CancellationToken,
    pending_question: Option<oneshot::Sender<String>>,
    system_queue: VecDeque<String>,
    reply_seq: u64,
    heard_while_busy: bool,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            phase: TaskPhase::Idle,
            cancel: CancellationToken::new(),
            pending_question: None,
            system_queue: VecDeque::new(),
            reply_seq: 1,
            heard_while_busy: false,
        }
    }
}

/// 任务结束时取出的收尾信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskFinish {
    pub cancelled: bool,
    pub heard_while_busy: bool,
}

/// 单用户的任务生命周期管理
#[derive(Debug)]
pub struct SessionSupervisor {
    user_id: String,
    state: Mutex<RunState>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl SessionSupervisor {
    pub fn new(user_id: impl Into<String>, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            user_id: user_id.into(),
            state: Mutex::new(RunState::default()),
            outbound,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn phase(&self) -> TaskPhase {
        self.state.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase().is_busy()
    }

    /// 空闲时原子地切到 Running 并换新令牌；已有任务在途时返回 None
    pub fn begin_task(&self) -> Option<CancellationToken> {
        let mut state = self.state.lock();
        if state.phase.is_busy() {
            return None;
        }
        state.phase = TaskPhase::Running;
        state.cancel = CancellationToken::new();
        state.reply_seq = 1;
        state.heard_while_busy = false;
        Some(state.cancel.clone())
    }

    /// 任务结束：回到 Idle 并取出收尾信息
    pub fn finish_task(&self) -> TaskFinish {
        let mut state = self.state.lock();
        let finish = TaskFinish {
            cancelled: state.cancel.is_cancelled(),
            heard_while_busy: std::mem::take(&mut state.heard_while_busy),
        };
        state.phase = TaskPhase::Idle;
        state.pending_question = None;
        finish
    }

    /// 取消在途任务（连同待回答的问题）；空闲时返回 false
    pub fn cancel_task(&self) -> bool {
        let mut state = self.state.lock();
        if !state.phase.is_busy() {
            return false;
        }
        state.cancel.cancel();
        state.pending_question = None;
        state.phase = TaskPhase::Cancelling;
        true
    }

    /// 有待回答的问题时把文本作为回答送达
    pub fn answer(&self, text: &str) -> bool {
        let sender = {
            let mut state = self.state.lock();
            let sender = state.pending_question.take();
            if sender.is_some() {
                state.phase = TaskPhase::Running;
            }
            sender
        };
        match sender {
            Some(tx) => tx.send(text.to_string()).is_ok(),
            None => false,
        }
    }

    pub fn has_pending_question(&self) -> bool {
        self.state.lock().pending_question.is_some()
    }

    pub fn mark_heard_while_busy(&self) {
        self.state.lock().heard_while_busy = true;
    }

    /// 本任务内的下一个回复序号
    pub fn next_seq(&self) -> u64 {
        let mut state = self.state.lock();
        let seq = state.reply_seq;
        state.reply_seq += 1;
        seq
    }

    pub fn push_system(&self, text: String) {
        self.state.lock().system_queue.push_back(text);
    }

    pub fn pop_system(&self) -> Option<String> {
        self.state.lock().system_queue.pop_front()
    }

    pub fn pending_system(&self) -> usize {
        self.state.lock().system_queue.len()
    }

    pub fn send(&self, message: Outbound) {
        if self.outbound.send(message).is_err() {
            warn!(user_id = %self.user_id, "outbound channel closed");
        }
    }

    pub fn notice(&self, text: impl Into<String>) {
        self.send(Outbound::Notice {
            user_id: self.user_id.clone(),
            text: text.into(),
        });
    }

    /// 向用户提问并等待回答；任务被取消时返回 None
    pub async fn ask(&self, question: &str, cancel: &CancellationToken) -> Option<String> {
        if cancel.is_cancelled() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            state.pending_question = Some(tx);
            state.phase = TaskPhase::AwaitingHuman;
        }
        let seq = self.next_seq();
        self.send(Outbound::Question {
            user_id: self.user_id.clone(),
            seq,
            text: question.to_string(),
        });
        debug!(user_id = %self.user_id, "waiting for human input");

        let answer = tokio::select! {
            reply = rx => reply.ok(),
            _ = cancel.cancelled() => None,
        };

        let mut state = self.state.lock();
        state.pending_question = None;
        if state.phase == TaskPhase::AwaitingHuman {
            state.phase = TaskPhase::Running;
        }
        answer.map(|a| a.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn supervisor() -> (Arc<SessionSupervisor>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(SessionSupervisor::new("u1", tx)), rx)
    }

    #[test]
    fn only_one_task_at_a_time() {
        let (sup, _rx) = supervisor();
        assert!(sup.begin_task().is_some());
        assert!(sup.begin_task().is_none());
        let finish = sup.finish_task();
        assert!(!finish.cancelled);
        assert!(sup.begin_task().is_some());
    }

    #[test]
    fn cancel_trips_token_and_reports_on_finish() {
        let (sup, _rx) = supervisor();
        let token = sup.begin_task().unwrap();
        sup.mark_heard_while_busy();
        assert!(sup.cancel_task());
        assert!(token.is_cancelled());
        assert_eq!(sup.phase(), TaskPhase::Cancelling);

        let finish = sup.finish_task();
        assert!(finish.cancelled);
        assert!(finish.heard_while_busy);
        assert!(!sup.cancel_task());
        // 新任务拿到新令牌
        assert!(!sup.begin_task().unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn ask_receives_answer() {
        let (sup, mut rx) = supervisor();
        let token = sup.begin_task().unwrap();
        let asker = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.ask("which city?", &token).await })
        };

        let question = rx.recv().await.unwrap();
        assert!(matches!(question, Outbound::Question { ref text, .. } if text == "which city?"));
        assert_eq!(sup.phase(), TaskPhase::AwaitingHuman);
        assert!(sup.answer(" Paris "));
        assert_eq!(asker.await.unwrap(), Some("Paris".to_string()));
        assert_eq!(sup.phase(), TaskPhase::Running);
    }

    #[tokio::test]
    async fn ask_unblocks_on_cancel() {
        let (sup, mut rx) = supervisor();
        let token = sup.begin_task().unwrap();
        let asker = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.ask("continue?", &token).await })
        };
        rx.recv().await.unwrap();
        sup.cancel_task();
        let answer = tokio::time::timeout(Duration::from_secs(1), asker)
            .await
            .unwrap()
            .unwrap();
        assert!(answer.is_none());
        assert!(!sup.answer("late"));
    }

    #[test]
    fn system_queue_is_fifo_and_seq_resets_per_task() {
        let (sup, _rx) = supervisor();
        sup.push_system("a".into());
        sup.push_system("b".into());
        assert_eq!(sup.pop_system().as_deref(), Some("a"));
        assert_eq!(sup.pending_system(), 1);

        sup.begin_task();
        assert_eq!(sup.next_seq(), 1);
        assert_eq!(sup.next_seq(), 2);
        sup.finish_task();
        sup.begin_task();
        assert_eq!(sup.next_seq(), 1);
    }
}
