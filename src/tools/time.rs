//! 本地时间工具

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolContext};

pub struct TimeTool;

#[async_trait]
impl Tool for TimeTool {
    fn name(&self) -> &str {
        "time"
    }

    fn description(&self) -> &str {
        "Get the current local time."
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String, String> {
        let now = chrono::Local::now();
        Ok(format!("当前本地时间：{}", now.format("%Y-%m-%d %H:%M:%S")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_local_time() {
        let out = TimeTool
            .execute(Value::Null, &ToolContext::detached("u"))
            .await
            .unwrap();
        assert!(out.starts_with("当前本地时间："));
        assert_eq!(out.chars().count(), "当前本地时间：".chars().count() + 19);
    }
}
