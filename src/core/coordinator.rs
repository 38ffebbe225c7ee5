//! 任务协调器：每个用户同一时刻只跑一个任务
//!
//! submit 把用户输入分流为：新任务 / ask_human 的回答 / 取消 / 忙碌提示。
//! 系统消息（闹钟等）先入队，当前任务结束后按 FIFO 逐条作为任务执行。
//! 所有对外输出经 Outbound 通道发给前端。

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::core::session_supervisor::SessionSupervisor;
use crate::core::state::{Outbound, SystemEvent, TaskPhase};
use crate::tools::ToolContext;

pub const DEFAULT_CANCEL_KEYWORD: &str = "停止任务";

const BUSY_NOTICE: &str = "正在完成您给的任务，在任务完成或者失败前我都会捂住我的耳朵不听任何别的话，除非你显式的输入【停止任务】这4个字";
const HEARD_WHILE_BUSY_NOTICE: &str =
    "我现在任务完成了，我注意到你之前给我发了消息，但我都没有听见，你可以重新和我说一遍";
const CANCELLED_NOTICE: &str = "已停止任务。";
const NOTHING_TO_CANCEL_NOTICE: &str = "当前没有正在执行的任务。";

/// submit 的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// 启动了新任务
    Started,
    /// 作为 ask_human 的回答送达
    Answered,
    /// 取消了在途任务
    Cancelled,
    /// 任务在途，本条消息被忽略
    Busy,
    /// 空输入或无可取消的任务
    Ignored,
}

pub struct TaskCoordinator {
    agent: Arc<Agent>,
    cancel_keyword: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedSender<SystemEvent>,
    sessions: Mutex<HashMap<String, Arc<SessionSupervisor>>>,
}

impl TaskCoordinator {
    /// 创建协调器并启动系统事件泵（需在 tokio 运行时内调用）
    pub fn new(
        agent: Arc<Agent>,
        cancel_keyword: impl Into<String>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Arc<Self> {
        let (events, inbox) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            agent,
            cancel_keyword: cancel_keyword.into(),
            outbound,
            events,
            sessions: Mutex::new(HashMap::new()),
        });
        tokio::spawn(pump_events(Arc::downgrade(&coordinator), inbox));
        coordinator
    }

    /// 系统事件发送端（闹钟等定时器使用）
    pub fn events(&self) -> mpsc::UnboundedSender<SystemEvent> {
        self.events.clone()
    }

    pub fn phase(&self, user_id: &str) -> TaskPhase {
        self.session(user_id).phase()
    }

    fn session(&self, user_id: &str) -> Arc<SessionSupervisor> {
        self.sessions
            .lock()
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(SessionSupervisor::new(user_id, self.outbound.clone())))
            .clone()
    }

    /// 处理一条用户输入
    pub fn submit(self: &Arc<Self>, user_id: &str, text: &str) -> Submission {
        let text = text.trim();
        if text.is_empty() {
            return Submission::Ignored;
        }
        let session = self.session(user_id);

        if text == self.cancel_keyword {
            if session.cancel_task() {
                info!(user_id, "task cancelled by user");
                session.notice(CANCELLED_NOTICE);
                return Submission::Cancelled;
            }
            session.notice(NOTHING_TO_CANCEL_NOTICE);
            return Submission::Ignored;
        }

        if session.is_running() {
            if session.has_pending_question() && session.answer(text) {
                debug!(user_id, "human answer delivered");
                return Submission::Answered;
            }
            session.mark_heard_while_busy();
            session.notice(BUSY_NOTICE);
            return Submission::Busy;
        }

        match session.begin_task() {
            Some(cancel) => {
                self.spawn_task(session, text.to_string(), cancel);
                Submission::Started
            }
            None => {
                session.mark_heard_while_busy();
                session.notice(BUSY_NOTICE);
                Submission::Busy
            }
        }
    }

    /// 系统消息入队；用户空闲时立即开始处理
    pub fn enqueue_system(self: &Arc<Self>, user_id: &str, text: impl Into<String>) {
        let session = self.session(user_id);
        session.push_system(text.into());
        debug!(user_id, pending = session.pending_system(), "system message queued");
        self.drain_if_idle(session);
    }

    fn drain_if_idle(self: &Arc<Self>, session: Arc<SessionSupervisor>) {
        if session.pending_system() == 0 {
            return;
        }
        let Some(cancel) = session.begin_task() else {
            return;
        };
        match session.pop_system() {
            Some(text) => self.spawn_task(session, text, cancel),
            None => {
                session.finish_task();
            }
        }
    }

    fn spawn_task(self: &Arc<Self>, session: Arc<SessionSupervisor>, text: String, cancel: CancellationToken) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_task(&session, text, cancel).await;
            this.drain_if_idle(session);
        });
    }

    async fn run_task(&self, session: &Arc<SessionSupervisor>, text: String, cancel: CancellationToken) {
        let user_id = session.user_id().to_string();
        let ctx = ToolContext::new(user_id.clone(), cancel)
            .with_session(session.clone())
            .with_events(self.events.clone());

        let result = self.agent.run_task(&user_id, &text, &ctx).await;
        let finish = session.finish_task();

        match result {
            // Some 表示回复已写入历史：即使取消恰好晚到也照常送达，与历史保持一致
            Ok(Some(reply)) => {
                let seq = session.next_seq();
                session.send(Outbound::Reply {
                    user_id: user_id.clone(),
                    seq,
                    text: reply,
                });
            }
            Ok(None) => debug!(user_id = %user_id, "task cancelled, no reply"),
            Err(e) if !finish.cancelled => {
                warn!(user_id = %user_id, error = %e, "task failed");
                session.send(Outbound::Error {
                    user_id: user_id.clone(),
                    text: format!("任务执行失败：{e}"),
                });
            }
            Err(e) => debug!(user_id = %user_id, error = %e, "task failed after cancel"),
        }
        if finish.heard_while_busy {
            session.notice(HEARD_WHILE_BUSY_NOTICE);
        }
    }
}

/// 把定时器等投递的系统事件转入对应用户的队列；协调器释放后退出
async fn pump_events(coordinator: Weak<TaskCoordinator>, mut inbox: mpsc::UnboundedReceiver<SystemEvent>) {
    while let Some(event) = inbox.recv().await {
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        coordinator.enqueue_system(&event.user_id, event.text);
    }
    debug!("system event pump stopped");
}
