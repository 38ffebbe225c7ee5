//! AskHuman 工具：向用户提问并挂起当前任务直到收到回答
//!
//! 问题经 SessionSupervisor 发往前端；等待与任务取消竞争，取消时返回空串。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::{parameters_for, parse_args};
use crate::tools::{Tool, ToolContext};

#[derive(Debug, Deserialize, JsonSchema)]
struct AskArgs {
    /// Question to ask the user.
    question: String,
}

pub struct AskHumanTool;

#[async_trait]
impl Tool for AskHumanTool {
    fn name(&self) -> &str {
        "ask_human"
    }

    fn description(&self) -> &str {
        "Ask the user a question and wait for the reply. \
         Use when you must confirm or request missing info."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<AskArgs>()
    }

    fn exempt_from_timeout(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let args: AskArgs = parse_args(args)?;
        let question = args.question.trim();
        if question.is_empty() {
            return Err("question is required".to_string());
        }
        let session = ctx
            .session
            .as_ref()
            .ok_or_else(|| "user context not bound".to_string())?;
        Ok(session.ask(question, &ctx.cancel).await.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Outbound, SessionSupervisor};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn forwards_question_and_returns_answer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Arc::new(SessionSupervisor::new("u1", tx));
        let cancel = session.begin_task().unwrap();
        let ctx = ToolContext::new("u1", cancel).with_session(session.clone());

        let handle = tokio::spawn(async move {
            AskHumanTool
                .execute(json!({"question": "哪个城市？"}), &ctx)
                .await
        });
        match rx.recv().await.unwrap() {
            Outbound::Question { text, .. } => assert_eq!(text, "哪个城市？"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(session.answer("上海"));
        assert_eq!(handle.await.unwrap().unwrap(), "上海");
    }

    #[tokio::test]
    async fn unbound_context_is_an_error() {
        let out = AskHumanTool
            .execute(json!({"question": "?"}), &ToolContext::detached("u"))
            .await;
        assert_eq!(out.unwrap_err(), "user context not bound");
    }
}
