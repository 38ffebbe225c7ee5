//! 闹钟工具：仅支持固定日期时间
//!
//! 到点后把 `【system message】闹钟时间到：...` 作为系统事件投递给协调器，由其排队执行。

use async_trait::async_trait;
use chrono::NaiveDateTime;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::core::SystemEvent;
use crate::tools::schema::{parameters_for, parse_args};
use crate::tools::{Tool, ToolContext};

const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"];

#[derive(Debug, Deserialize, JsonSchema)]
struct AlarmArgs {
    /// Absolute datetime in YYYY-MM-DD HH:MM or YYYY-MM-DD HH:MM:SS.
    datetime: String,
    /// What the user wants to do when the alarm fires.
    task: String,
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
}

/// 闹钟触发时投递的系统消息
pub fn alarm_message(at: &NaiveDateTime, task: &str) -> String {
    format!(
        "【system message】闹钟时间到：{}。你当时的要求是：{}",
        at.format("%Y-%m-%d %H:%M:%S"),
        task
    )
}

pub struct AlarmTool;

#[async_trait]
impl Tool for AlarmTool {
    fn name(&self) -> &str {
        "alarm"
    }

    fn description(&self) -> &str {
        "Set an alarm for a fixed date/time. \
         Input must be an absolute datetime (YYYY-MM-DD HH:MM or YYYY-MM-DD HH:MM:SS). \
         Include the task to perform when the alarm fires."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<AlarmArgs>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let args: AlarmArgs = parse_args(args)?;
        let at = parse_datetime(&args.datetime).ok_or_else(|| {
            "闹钟时间格式错误，请使用固定日期时间：YYYY-MM-DD HH:MM 或 YYYY-MM-DD HH:MM:SS。".to_string()
        })?;
        let task = args.task.trim().to_string();
        if task.is_empty() {
            return Err("闹钟设置失败：请提供闹钟到点后要执行的任务描述。".to_string());
        }
        let now = chrono::Local::now().naive_local();
        let delay = (at - now)
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| "闹钟时间必须晚于当前时间。".to_string())?;
        let events = ctx
            .events
            .clone()
            .ok_or_else(|| "闹钟设置失败：未绑定触发上下文。".to_string())?;

        let user_id = ctx.user_id.clone();
        let text = alarm_message(&at, &task);
        info!(user_id = %user_id, at = %at, "alarm scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if events.send(SystemEvent::new(user_id, text)).is_err() {
                tracing::warn!("alarm fired after coordinator shut down");
            }
        });

        Ok(format!(
            "闹钟已设置：{}，任务：{}",
            at.format("%Y-%m-%d %H:%M:%S"),
            task
        ))
    }
}
