//! 工具调用器
//!
//! 把模型一轮给出的多个 ToolCall 并行执行（Semaphore 限流，最多 8 个 worker），结果按调用顺序返回。
//! 每个调用的失败相互隔离并折叠为文本：`Tool not found: ...` / `Tool error: ...`。
//! 每次调用施加超时（ask_human 这类等人工的工具除外），并输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::{AgentError, TaskScheduler, DEFAULT_TOOL_WORKERS};
use crate::memory::ToolCall;
use crate::tools::{Tool, ToolContext, ToolEntry, ToolRegistry};

/// 工具调用器：持有注册表、单次超时与并发上限
pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    max_workers: usize,
}

impl ToolInvoker {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
            max_workers: DEFAULT_TOOL_WORKERS,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 下发给模型的全部工具 schema
    pub fn specs(&self) -> Vec<Value> {
        self.registry.specs()
    }

    /// 并行执行一批调用，按输入顺序返回结果文本
    pub async fn invoke_all(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<String> {
        if calls.is_empty() {
            return Vec::new();
        }
        let scheduler = TaskScheduler::for_batch(self.max_workers, calls.len());
        scheduler
            .run_all(calls.iter().map(|call| self.invoke(call, ctx)))
            .await
    }

    /// 执行单个调用；任何失败都折叠为文本
    pub async fn invoke(&self, call: &ToolCall, ctx: &ToolContext) -> String {
        let tool = match self.registry.get(&call.name) {
            None => return format!("Tool not found: {}", call.name),
            Some(ToolEntry::Static(_)) => {
                return format!("Tool error: {} is schema-only", call.name)
            }
            Some(ToolEntry::Invocable(tool)) => tool.clone(),
        };
        let args = match parse_arguments(&call.arguments) {
            Ok(args) => args,
            Err(e) => return format!("Tool error: {e}"),
        };
        match self.execute(&tool, args, ctx).await {
            Ok(content) => content,
            Err(AgentError::ToolExecutionFailed(msg)) => format!("Tool error: {msg}"),
            Err(AgentError::ToolTimeout(name)) => format!(
                "Tool error: {} timed out after {}s",
                name,
                self.timeout.as_secs()
            ),
            Err(e) => format!("Tool error: {e}"),
        }
    }

    /// 超时内执行；超时返回 ToolTimeout，工具返回 Err 则转为 ToolExecutionFailed；输出 JSON 审计日志
    async fn execute(
        &self,
        tool: &Arc<dyn Tool>,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<String, AgentError> {
        let start = Instant::now();
        let preview = args_preview(&args);
        let result = if tool.exempt_from_timeout() {
            Ok(tool.execute(args, ctx).await)
        } else {
            timeout(self.timeout, tool.execute(args, ctx)).await
        };

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "user_id": ctx.user_id,
            "tool": tool.name(),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(AgentError::ToolExecutionFailed(e)),
            Err(_) => Err(AgentError::ToolTimeout(tool.name().to_string())),
        }
    }
}

/// 宽松解析参数：空串视为 `{}`，否则必须是合法 JSON
fn parse_arguments(raw: &str) -> Result<Value, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Null) => Ok(Value::Object(Default::default())),
        Ok(v) => Ok(v),
        Err(e) => Err(format!("invalid arguments JSON: {e}")),
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
