//! ReCAP：递归分解规划
//!
//! 先为任务生成 Plan，再按顺序执行子任务：primitive 或已达最大深度的交给 ReAct，其余递归规划。
//! 每个子任务完成后以 assistant 身份回注 `[ReCAP REINJECT]`，仍有剩余子任务时请求修订计划。
//! 子任务需要人工输入时立即停止并把结果交还调用方。
//! 步数上限是全局的：所有深度共享同一个已派发子任务计数。

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::core::AgentError;
use crate::llm::ChatRequest;
use crate::memory::{latest_user_text, Message};
use crate::react::loop_::ReactLoop;
use crate::react::planner::{
    parse_plan, planning_prompt, refine_prompt, Plan, PlanParseError, Subtask, DEFAULT_MAX_SUBTASKS,
};
use crate::tools::ToolContext;

pub const DEFAULT_MAX_DEPTH: usize = 3;
pub const DEFAULT_RECAP_MAX_STEPS: usize = 20;

const PLAN_MARKER: &str = "[ReCAP PLAN]";
const SUBTASK_MARKER: &str = "[Subtask]";
const REINJECT_MARKER: &str = "[ReCAP REINJECT]";
const UPDATE_MARKER: &str = "[ReCAP UPDATE]";

/// 子任务文本中显式要求用户输入的关键词
const INPUT_KEYWORDS: &[&str] = &[
    "ask_human",
    "询问用户",
    "向用户确认",
    "请用户",
    "让用户",
    "用户提供",
    "用户确认",
    "ask the user",
    "ask user",
    "confirm with the user",
];

/// 结果中请求澄清的短语
const CLARIFY_PHRASES: &[&str] = &[
    "请提供",
    "请告诉我",
    "请确认",
    "请补充",
    "需要你提供",
    "需要您提供",
    "能否提供",
    "please provide",
    "please clarify",
    "could you clarify",
    "can you confirm",
];

/// ReCAP 运行结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecapOutcome {
    pub reply: String,
    pub new_messages: Vec<Message>,
    /// 为 true 时 reply 是在向用户要信息，而不是最终答案
    pub needs_human_input: bool,
}

impl RecapOutcome {
    pub fn is_empty(&self) -> bool {
        self.reply.is_empty() && self.new_messages.is_empty()
    }
}

/// 单层求解的结果
enum Solved {
    Cancelled,
    Finished { reply: String, needs_human: bool },
    StepLimit { reply: String },
}

/// 一次 run 内跨递归共享的状态
struct RecapRun {
    transcript: Vec<Message>,
    new_messages: Vec<Message>,
    steps: usize,
}

impl RecapRun {
    fn push(&mut self, message: Message) {
        self.transcript.push(message.clone());
        self.new_messages.push(message);
    }

    fn extend(&mut self, messages: Vec<Message>) {
        self.transcript.extend(messages.iter().cloned());
        self.new_messages.extend(messages);
    }
}

/// 是否需要停下来等用户输入；结果为空时不停
pub fn needs_human_input(subtask: &str, result: &str) -> bool {
    let result = result.trim();
    if result.is_empty() {
        return false;
    }
    let subtask = subtask.to_lowercase();
    if INPUT_KEYWORDS.iter().any(|k| subtask.contains(k)) {
        return true;
    }
    if result.ends_with('?') || result.ends_with('？') {
        return true;
    }
    let lower = result.to_lowercase();
    CLARIFY_PHRASES.iter().any(|p| lower.contains(p))
}

fn render_tasks(tasks: &[Subtask]) -> String {
    serde_json::to_string(tasks).unwrap_or_else(|_| "[]".to_string())
}

/// ReCAP 规划器：复用 ReactLoop 的模型与上下文整理
pub struct RecapPlanner {
    react: Arc<ReactLoop>,
    max_depth: usize,
    max_subtasks: usize,
    max_steps: usize,
}

impl RecapPlanner {
    pub fn new(react: Arc<ReactLoop>) -> Self {
        Self {
            react,
            max_depth: DEFAULT_MAX_DEPTH,
            max_subtasks: DEFAULT_MAX_SUBTASKS,
            max_steps: DEFAULT_RECAP_MAX_STEPS,
        }
    }

    pub fn with_limits(mut self, max_depth: usize, max_subtasks: usize, max_steps: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self.max_subtasks = max_subtasks.max(1);
        self.max_steps = max_steps.max(1);
        self
    }

    /// 以 history 中最近一条 user 消息为任务执行 ReCAP
    pub async fn run(
        &self,
        history: &[Message],
        ctx: &ToolContext,
    ) -> Result<RecapOutcome, AgentError> {
        let task = latest_user_text(history).unwrap_or_default().to_string();
        let mut run = RecapRun {
            transcript: history.to_vec(),
            new_messages: Vec::new(),
            steps: 0,
        };

        match self.solve(task, 0, &mut run, ctx).await? {
            Solved::Cancelled => {
                info!(user_id = %ctx.user_id, "recap cancelled");
                Ok(RecapOutcome::default())
            }
            Solved::Finished { reply, needs_human } => Ok(RecapOutcome {
                reply,
                new_messages: run.new_messages,
                needs_human_input: needs_human,
            }),
            Solved::StepLimit { reply } => {
                run.push(Message::assistant(reply.clone()));
                Ok(RecapOutcome {
                    reply,
                    new_messages: run.new_messages,
                    needs_human_input: false,
                })
            }
        }
    }

    fn step_limit_reply(&self, partial: &str) -> String {
        let line = format!(
            "已达到 ReCAP 最大执行步数（max_steps={}），以上为目前的部分结果。",
            self.max_steps
        );
        if partial.trim().is_empty() {
            line
        } else {
            format!("{}\n\n{}", partial.trim(), line)
        }
    }

    /// 向模型请求计划；取消返回 None，解析失败由调用方回退
    async fn request_plan(
        &self,
        prompt: String,
        run: &mut RecapRun,
        ctx: &ToolContext,
    ) -> Result<Option<Result<Plan, PlanParseError>>, AgentError> {
        if ctx.is_cancelled() {
            return Ok(None);
        }
        let mut messages = self.react.prepare(&mut run.transcript).await;
        messages.push(Message::user(prompt));
        let response = self.react.llm().chat(ChatRequest::new(messages)).await?;
        if ctx.is_cancelled() {
            return Ok(None);
        }
        Ok(Some(parse_plan(response.content_text(), self.max_subtasks)))
    }

    fn solve<'a>(
        &'a self,
        task: String,
        depth: usize,
        run: &'a mut RecapRun,
        ctx: &'a ToolContext,
    ) -> BoxFuture<'a, Result<Solved, AgentError>> {
        Box::pin(async move {
            let prompt = planning_prompt(&task, self.max_subtasks);
            let plan = match self.request_plan(prompt, run, ctx).await? {
                None => return Ok(Solved::Cancelled),
                Some(Ok(plan)) => plan,
                Some(Err(e)) => {
                    warn!(depth, error = %e, "initial plan invalid, falling back to single subtask");
                    Plan::single(&task)
                }
            };
            run.push(Message::assistant(format!(
                "{PLAN_MARKER}\n{}",
                render_tasks(&plan.subtasks)
            )));

            let mut remaining: VecDeque<Subtask> = plan.subtasks.into();
            let mut last_result = String::new();

            while let Some(subtask) = remaining.pop_front() {
                if ctx.is_cancelled() {
                    return Ok(Solved::Cancelled);
                }
                run.steps += 1;
                if run.steps > self.max_steps {
                    info!(steps = run.steps, "recap step limit reached");
                    return Ok(Solved::StepLimit {
                        reply: self.step_limit_reply(&last_result),
                    });
                }
                run.push(Message::user(format!("{SUBTASK_MARKER} {}", subtask.task)));
                debug!(depth, task = %subtask.task, primitive = subtask.is_primitive, "recap subtask");

                let result = if subtask.is_primitive || depth >= self.max_depth {
                    let outcome = self.react.run(&run.transcript, ctx).await?;
                    if ctx.is_cancelled() {
                        return Ok(Solved::Cancelled);
                    }
                    run.extend(outcome.new_messages);
                    outcome.reply
                } else {
                    match self.solve(subtask.task.clone(), depth + 1, run, ctx).await? {
                        Solved::Finished {
                            reply,
                            needs_human: false,
                        } => reply,
                        other => return Ok(other),
                    }
                };
                last_result = result;

                if needs_human_input(&subtask.task, &last_result) {
                    info!(depth, "recap paused for human input");
                    return Ok(Solved::Finished {
                        reply: last_result,
                        needs_human: true,
                    });
                }

                let pending: Vec<Subtask> = remaining.iter().cloned().collect();
                run.push(Message::assistant(format!(
                    "{REINJECT_MARKER}\nTask: {task}\nDone: {}\nResult: {last_result}\nRemaining: {}",
                    subtask.task,
                    render_tasks(&pending),
                )));
                if pending.is_empty() {
                    continue;
                }
                let prompt = refine_prompt(&task, &pending, self.max_subtasks);
                match self.request_plan(prompt, run, ctx).await? {
                    None => return Ok(Solved::Cancelled),
                    Some(Ok(revised)) => {
                        run.push(Message::assistant(format!(
                            "{UPDATE_MARKER}\n{}",
                            render_tasks(&revised.subtasks)
                        )));
                        remaining = revised.subtasks.into();
                    }
                    Some(Err(e)) => debug!(error = %e, "refinement invalid, keeping remaining plan"),
                }
            }

            Ok(Solved::Finished {
                reply: last_result,
                needs_human: false,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, MockLlmClient};
    use crate::memory::{ContextWindowManager, Role};
    use crate::tools::{ToolInvoker, ToolRegistry};

    fn planner(mock: Arc<MockLlmClient>) -> RecapPlanner {
        let invoker = Arc::new(ToolInvoker::new(Arc::new(ToolRegistry::new()), 5));
        let window = Arc::new(ContextWindowManager::new(60_000));
        let react = Arc::new(ReactLoop::new(mock, invoker, window, "sys"));
        RecapPlanner::new(react)
    }

    fn history() -> Vec<Message> {
        vec![Message::user("查一下天气并写总结")]
    }

    fn texts(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.text().to_string()).collect()
    }

    const PLAN_AB: &str = r#"{"subtasks":[{"task":"A","is_primitive":true},{"task":"B","is_primitive":true}]}"#;

    #[tokio::test]
    async fn question_result_stops_before_next_subtask() {
        let mock = Arc::new(MockLlmClient::scripted([
            ChatResponse::text(PLAN_AB),
            ChatResponse::text("你想查询哪个城市?"),
        ]));
        let out = planner(mock.clone()).run(&history(), &ToolContext::detached("u")).await.unwrap();
        assert!(out.needs_human_input);
        assert_eq!(out.reply, "你想查询哪个城市?");
        assert_eq!(mock.calls(), 2);
        assert!(!texts(&out.new_messages).iter().any(|t| t == "[Subtask] B"));
    }

    #[tokio::test]
    async fn refinement_replaces_remaining_plan() {
        let mock = Arc::new(MockLlmClient::scripted([
            ChatResponse::text(PLAN_AB),
            ChatResponse::text("a done"),
            ChatResponse::text(r#"```json
{"subtasks":[{"task":"B2","is_primitive":true}]}
```"#),
            ChatResponse::text("final"),
        ]));
        let out = planner(mock.clone()).run(&history(), &ToolContext::detached("u")).await.unwrap();
        assert_eq!(out.reply, "final");
        assert!(!out.needs_human_input);
        assert_eq!(mock.calls(), 4);

        let texts = texts(&out.new_messages);
        assert!(texts[0].starts_with("[ReCAP PLAN]"));
        assert!(texts.iter().any(|t| t.starts_with("[ReCAP UPDATE]")));
        assert!(texts.iter().any(|t| t == "[Subtask] B2"));
        assert!(!texts.iter().any(|t| t == "[Subtask] B"));
        assert!(out.new_messages.contains(&Message::assistant("final")));
    }

    #[tokio::test]
    async fn every_finished_subtask_is_reinjected_as_assistant() {
        let mock = Arc::new(MockLlmClient::scripted([
            ChatResponse::text(PLAN_AB),
            ChatResponse::text("a done"),
            ChatResponse::text("not json"),
            ChatResponse::text("b done"),
        ]));
        let out = planner(mock.clone()).run(&history(), &ToolContext::detached("u")).await.unwrap();
        assert_eq!(out.reply, "b done");
        // 最后一个子任务之后不再请求修订
        assert_eq!(mock.calls(), 4);

        let reinjected: Vec<&Message> = out
            .new_messages
            .iter()
            .filter(|m| m.text().starts_with("[ReCAP REINJECT]"))
            .collect();
        assert_eq!(reinjected.len(), 2);
        assert!(reinjected.iter().all(|m| m.role == Role::Assistant));
        assert_eq!(
            reinjected[0].text(),
            format!(
                "[ReCAP REINJECT]\nTask: 查一下天气并写总结\nDone: A\nResult: a done\nRemaining: {}",
                render_tasks(&[Subtask::primitive("B")])
            )
        );
        assert_eq!(
            reinjected[1].text(),
            "[ReCAP REINJECT]\nTask: 查一下天气并写总结\nDone: B\nResult: b done\nRemaining: []"
        );
        assert_eq!(out.new_messages.last().unwrap().text(), reinjected[1].text());
    }

    #[tokio::test]
    async fn malformed_plan_falls_back_to_the_task_itself() {
        let mock = Arc::new(MockLlmClient::scripted([
            ChatResponse::text("I cannot plan this"),
            ChatResponse::text("answer"),
        ]));
        let out = planner(mock).run(&history(), &ToolContext::detached("u")).await.unwrap();
        assert_eq!(out.reply, "answer");
        assert!(texts(&out.new_messages).contains(&"[Subtask] 查一下天气并写总结".to_string()));
    }

    #[tokio::test]
    async fn step_ceiling_is_shared_across_the_run() {
        let mock = Arc::new(MockLlmClient::scripted([
            ChatResponse::text(PLAN_AB),
            ChatResponse::text("partial a"),
            ChatResponse::text("not json"),
        ]));
        let out = planner(mock.clone())
            .with_limits(3, 5, 1)
            .run(&history(), &ToolContext::detached("u"))
            .await
            .unwrap();
        assert!(out.reply.starts_with("partial a"));
        assert!(out.reply.contains("max_steps=1"));
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn non_primitive_subtask_recurses_until_max_depth() {
        let nested = r#"{"subtasks":[{"task":"X","is_primitive":false}]}"#;
        let mock = Arc::new(MockLlmClient::scripted([
            ChatResponse::text(nested),
            ChatResponse::text(r#"{"subtasks":[{"task":"x1","is_primitive":true}]}"#),
            ChatResponse::text("r"),
        ]));
        let out = planner(mock.clone()).run(&history(), &ToolContext::detached("u")).await.unwrap();
        assert_eq!(out.reply, "r");
        assert_eq!(mock.calls(), 3);

        // max_depth=1：顶层的非 primitive 子任务仍会分解一次，第 1 层起一律交给 ReAct
        let mock = Arc::new(MockLlmClient::scripted([
            ChatResponse::text(nested),
            ChatResponse::text(r#"{"subtasks":[{"task":"Y","is_primitive":false}]}"#),
            ChatResponse::text("leaf"),
        ]));
        let out = planner(mock.clone())
            .with_limits(1, 5, 20)
            .run(&history(), &ToolContext::detached("u"))
            .await
            .unwrap();
        assert_eq!(out.reply, "leaf");
        assert_eq!(mock.calls(), 3);
        let texts = texts(&out.new_messages);
        assert!(texts.contains(&"[Subtask] X".to_string()));
        assert!(texts.contains(&"[Subtask] Y".to_string()));
    }

    #[tokio::test]
    async fn cancelled_run_is_empty() {
        let mock = Arc::new(MockLlmClient::new());
        let ctx = ToolContext::detached("u");
        ctx.cancel.cancel();
        let out = planner(mock.clone()).run(&history(), &ctx).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(mock.calls(), 0);
    }

    #[test]
    fn detects_requests_for_input() {
        assert!(needs_human_input("询问用户所在城市", "ok"));
        assert!(needs_human_input("A", "是哪一天？"));
        assert!(needs_human_input("A", "请提供文件路径"));
        assert!(!needs_human_input("A", "已完成。"));
        // 空结果不算在等用户输入
        assert!(!needs_human_input("询问用户所在城市", "  "));
    }
}
