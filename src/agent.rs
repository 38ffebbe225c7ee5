//! Headless Agent 运行时
//!
//! 把一次用户任务串起来：历史命令 -> 打开会话并写入 user 消息 -> 路由 ->
//! ReCAP 或 ReAct -> 写回新消息并尝试重命名。取消或出错时回滚到打开会话时的基线。

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::core::AgentError;
use crate::llm::{create_llm_from_config, LlmClient};
use crate::memory::{
    ContextWindowManager, HistoryStore, LlmSummarizer, Message, SessionHandle, SpillStore,
    Summarizer,
};
use crate::react::{ReactLoop, RecapPlanner, Route, TaskRouter};
use crate::tools::{default_registry, ToolContext, ToolInvoker};

/// 未提供 config/prompts/system.txt 时使用的系统提示词
pub const DEFAULT_SYSTEM_PROMPT: &str = "你是一个可靠的个人助理，可以调用工具完成用户的任务。\n\
- 信息不足且无法通过工具获得时，用 ask_human 向用户提问，不要臆测。\n\
- 工具结果过长时会被保存到文件，只展示开头部分；需要完整内容时用 read 工具按行读取。\n\
- 用户要求定时提醒或到点做事时，用 time 确认当前时间后再用 alarm 设置固定日期时间的闹钟。\n\
- 以【system message】或【system commands】开头的消息由系统发出（例如闹钟到点），不是用户本人说的话，按其中的要求完成任务。\n\
- 回答使用简洁的中文。";

const SYSTEM_PROMPT_PATHS: [&str; 2] = ["config/prompts/system.txt", "../config/prompts/system.txt"];

/// 读取系统提示词：优先 config/prompts/system.txt
pub fn load_system_prompt() -> String {
    SYSTEM_PROMPT_PATHS
        .into_iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
}

/// 一次任务执行所需的全部组件，可被多个用户共享
pub struct Agent {
    history: Arc<HistoryStore>,
    react: Arc<ReactLoop>,
    recap: RecapPlanner,
    router: TaskRouter,
}

impl Agent {
    pub fn new(
        history: Arc<HistoryStore>,
        react: Arc<ReactLoop>,
        recap: RecapPlanner,
        router: TaskRouter,
    ) -> Self {
        Self {
            history,
            react,
            recap,
            router,
        }
    }

    /// 按配置创建：LLM 后端由 [llm] 段决定
    pub fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let llm = create_llm_from_config(&cfg.llm);
        Self::with_llm(cfg, llm, load_system_prompt())
    }

    /// 使用给定的 LLM 客户端与系统提示词组装
    pub fn with_llm(
        cfg: &AppConfig,
        llm: Arc<dyn LlmClient>,
        system_prompt: impl Into<String>,
    ) -> Result<Self, AgentError> {
        let workspace = cfg.app.workspace_root.as_path();
        std::fs::create_dir_all(workspace).map_err(|e| {
            AgentError::ConfigError(format!("workspace_root {}: {}", workspace.display(), e))
        })?;

        let window = Arc::new(
            ContextWindowManager::new(cfg.context.max_tokens)
                .with_spill_store(SpillStore::new(workspace))
                .with_tool_output_limits(cfg.context.tool_output_limit, cfg.context.tool_output_preview),
        );
        let summarizer: Arc<dyn Summarizer> = Arc::new(LlmSummarizer::new(llm.clone()));
        let invoker = Arc::new(
            ToolInvoker::new(Arc::new(default_registry(workspace)), cfg.tools.tool_timeout_secs)
                .with_max_workers(cfg.agent.max_tool_workers),
        );
        let react = Arc::new(
            ReactLoop::new(llm.clone(), invoker, window.clone(), system_prompt)
                .with_summarizer(summarizer.clone())
                .with_max_steps(cfg.agent.max_steps),
        );
        let recap = RecapPlanner::new(react.clone()).with_limits(
            cfg.agent.recap_max_depth,
            cfg.agent.recap_max_subtasks,
            cfg.agent.recap_max_steps,
        );
        let router = TaskRouter::new(llm, cfg.app.routing);
        let history = Arc::new(
            HistoryStore::new(cfg.app.history_dir.clone(), window).with_summarizer(summarizer),
        );
        Ok(Self::new(history, react, recap, router))
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// 执行一次任务；返回 None 表示任务被取消（历史已回滚），返回 Some 时回复已写入历史
    pub async fn run_task(
        &self,
        user_id: &str,
        content: &str,
        ctx: &ToolContext,
    ) -> Result<Option<String>, AgentError> {
        let content = content.trim();
        if let Some(reply) = self.handle_command(user_id, content)? {
            return Ok(Some(reply));
        }

        let mut handle = self.history.open_session(user_id)?;
        match self.execute(&mut handle, content, ctx).await {
            Ok(Some(reply)) => Ok(Some(reply)),
            Ok(None) => {
                info!(user_id, "task cancelled, rolling back");
                self.history.rollback(&handle)?;
                Ok(None)
            }
            Err(e) => {
                warn!(user_id, error = %e, "task failed, rolling back");
                if let Err(rollback) = self.history.rollback(&handle) {
                    warn!(user_id, error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        handle: &mut SessionHandle,
        content: &str,
        ctx: &ToolContext,
    ) -> Result<Option<String>, AgentError> {
        self.history.append(handle, &[Message::user(content)]).await?;
        if ctx.is_cancelled() {
            return Ok(None);
        }

        let messages = self.history.load_messages(&handle.path)?;
        let route = self.router.route(&messages).await;
        info!(user_id = %handle.user_id, ?route, "task started");
        let (reply, new_messages) = match route {
            Route::Recap => {
                let outcome = self.recap.run(&messages, ctx).await?;
                (outcome.reply, outcome.new_messages)
            }
            Route::React => {
                let outcome = self.react.run(&messages, ctx).await?;
                (outcome.reply, outcome.new_messages)
            }
        };
        if ctx.is_cancelled() {
            return Ok(None);
        }

        self.history.append(handle, &new_messages).await?;
        // 写回期间（可能含摘要调用）到达的取消同样回滚
        if ctx.is_cancelled() {
            return Ok(None);
        }
        self.history.finalize(handle)?;
        Ok(Some(reply))
    }

    /// /listhistory、/history <name>、/newhistory；非命令返回 None
    fn handle_command(&self, user_id: &str, content: &str) -> Result<Option<String>, AgentError> {
        let mut parts = content.splitn(2, char::is_whitespace);
        let command = parts.next().unwrap_or_default();
        let arg = parts.next().map(str::trim).unwrap_or_default();

        let reply = match command {
            "/listhistory" => {
                let names = self.history.list_sessions(user_id)?;
                if names.is_empty() {
                    "历史列表为空。".to_string()
                } else {
                    format!("历史列表：\n{}", names.join("\n"))
                }
            }
            "/history" if arg.is_empty() => "用法：/history 历史名".to_string(),
            "/history" => match self.history.switch_session(user_id, arg)? {
                Some(path) => format!("已切换到历史：{}", self.history.display_name(&path)?),
                None => "未找到该历史名。".to_string(),
            },
            "/newhistory" => {
                let path = self.history.create_session(user_id)?;
                format!("已新建历史：{}", self.history.display_name(&path)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(reply))
    }

    /// 当前会话的记录文件
    pub fn session_path(&self, user_id: &str) -> Result<PathBuf, AgentError> {
        Ok(self.history.current_path(user_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingPolicy;
    use crate::llm::{ChatResponse, LlmError, MockLlmClient};
    use tempfile::TempDir;

    fn agent(dir: &TempDir, mock: Arc<MockLlmClient>) -> Agent {
        let mut cfg = AppConfig::default();
        cfg.app.workspace_root = dir.path().join("ws");
        cfg.app.history_dir = dir.path().join("history");
        cfg.app.routing = RoutingPolicy::React;
        Agent::with_llm(&cfg, mock, "sys").unwrap()
    }

    #[tokio::test]
    async fn task_reply_is_persisted() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockLlmClient::scripted([ChatResponse::text("4")]));
        let agent = agent(&dir, mock);
        let ctx = ToolContext::detached("alice");
        let reply = agent.run_task("alice", "2+2?", &ctx).await.unwrap();
        assert_eq!(reply.as_deref(), Some("4"));

        let path = agent.session_path("alice").unwrap();
        let messages = agent.history().load_messages(&path).unwrap();
        assert_eq!(messages, vec![Message::user("2+2?"), Message::assistant("4")]);
        assert_eq!(agent.history().rounds(&path).unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_task_rolls_back() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir, Arc::new(MockLlmClient::new()));
        let ctx = ToolContext::detached("bob");
        ctx.cancel.cancel();
        assert_eq!(agent.run_task("bob", "hello", &ctx).await.unwrap(), None);
        let path = agent.session_path("bob").unwrap();
        assert_eq!(agent.history().message_count(&path).unwrap(), 0);
    }

    #[tokio::test]
    async fn llm_error_rolls_back_and_propagates() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::Status {
            status: 500,
            body: "oops".into(),
        });
        let agent = agent(&dir, mock);
        let err = agent
            .run_task("carol", "hello", &ToolContext::detached("carol"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Llm(_)));
        let path = agent.session_path("carol").unwrap();
        assert_eq!(agent.history().message_count(&path).unwrap(), 0);
    }

    /// 摘要时触发取消，模拟写回历史期间用户喊停
    struct CancelOnSummarize {
        cancel: tokio_util::sync::CancellationToken,
    }

    #[async_trait::async_trait]
    impl Summarizer for CancelOnSummarize {
        async fn summarize(&self, _messages: &[Message]) -> Result<String, String> {
            self.cancel.cancel();
            Ok("摘要".to_string())
        }
    }

    #[tokio::test]
    async fn cancel_during_persist_rolls_back() {
        let dir = TempDir::new().unwrap();
        let ctx = ToolContext::detached("frank");
        let mock = Arc::new(MockLlmClient::scripted([
            ChatResponse::tool_calls(vec![crate::memory::ToolCall::new("c1", "lookup", "{}")]),
            ChatResponse::text("done"),
        ]));
        let history = Arc::new(
            HistoryStore::new(dir.path().join("history"), Arc::new(ContextWindowManager::new(50)))
                .with_summarizer(Arc::new(CancelOnSummarize {
                    cancel: ctx.cancel.clone(),
                })),
        );
        let invoker = Arc::new(ToolInvoker::new(Arc::new(crate::tools::ToolRegistry::new()), 5));
        let react = Arc::new(ReactLoop::new(
            mock.clone(),
            invoker,
            Arc::new(ContextWindowManager::new(60_000)),
            "sys",
        ));
        let agent = Agent::new(
            history,
            react.clone(),
            RecapPlanner::new(react),
            TaskRouter::new(mock.clone(), RoutingPolicy::React),
        );

        // 单条 user 消息不会压缩；写回 4 条消息时超预算，摘要过程中取消
        let reply = agent.run_task("frank", &"x".repeat(400), &ctx).await.unwrap();
        assert_eq!(reply, None);
        assert_eq!(mock.calls(), 2);

        let path = agent.session_path("frank").unwrap();
        assert_eq!(agent.history().message_count(&path).unwrap(), 0);
        let mirror = crate::memory::ConversationPersistence::new(&path).mirror().load().unwrap();
        assert!(mirror.messages.is_empty());
    }

    #[tokio::test]
    async fn history_commands_skip_the_model() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockLlmClient::new());
        let agent = agent(&dir, mock.clone());
        let ctx = ToolContext::detached("dave");

        let listed = agent.run_task("dave", "/listhistory", &ctx).await.unwrap().unwrap();
        assert_eq!(listed, "历史列表为空。");
        let created = agent.run_task("dave", "/newhistory", &ctx).await.unwrap().unwrap();
        assert!(created.starts_with("已新建历史："));
        let name = created.trim_start_matches("已新建历史：").to_string();

        let usage = agent.run_task("dave", "/history", &ctx).await.unwrap().unwrap();
        assert_eq!(usage, "用法：/history 历史名");
        let missing = agent.run_task("dave", "/history nope", &ctx).await.unwrap().unwrap();
        assert_eq!(missing, "未找到该历史名。");
        let switched = agent
            .run_task("dave", &format!("/history {name}"), &ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(switched, format!("已切换到历史：{name}"));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn session_is_renamed_after_three_rounds() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir, Arc::new(MockLlmClient::new()));
        let ctx = ToolContext::detached("erin");
        for text in ["帮我 写诗", "再来一首", "谢谢"] {
            agent.run_task("erin", text, &ctx).await.unwrap();
        }
        let path = agent.session_path("erin").unwrap();
        let name = agent.history().display_name(&path).unwrap();
        assert!(name.ends_with("_帮我_写诗"), "{name}");
    }
}
