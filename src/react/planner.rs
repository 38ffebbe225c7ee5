//! Planner：ReCAP 计划结构与解析
//!
//! 从模型文本中提取 JSON（```json ... ``` 或最外层花括号）并解析为 Plan；
//! 结构不合法时返回 PlanParseError，由调用方按回退策略处理。

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 默认每次规划最多保留的子任务数
pub const DEFAULT_MAX_SUBTASKS: usize = 5;

/// 单个子任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Subtask {
    /// 子任务描述
    pub task: String,
    /// 是否可直接执行（不再拆分）
    #[serde(default)]
    pub is_primitive: bool,
}

impl Subtask {
    pub fn primitive(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            is_primitive: true,
        }
    }
}

/// 规划结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Plan {
    #[serde(default)]
    pub thought: String,
    pub subtasks: Vec<Subtask>,
}

impl Plan {
    /// 初始规划的回退：把原任务作为唯一的 primitive 子任务
    pub fn single(task: &str) -> Self {
        Self {
            thought: String::new(),
            subtasks: vec![Subtask::primitive(task)],
        }
    }
}

/// 计划解析错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanParseError {
    #[error("no JSON object found")]
    NoJson,

    #[error("invalid plan JSON: {0}")]
    Invalid(String),

    #[error("plan has no valid subtasks")]
    Empty,
}

/// 下发给模型的 Plan JSON Schema（紧凑文本）
pub fn plan_schema_json() -> String {
    let schema = schema_for!(Plan);
    serde_json::to_string(&schema).unwrap_or_else(|_| "{}".to_string())
}

/// 提取 JSON 文本：优先 ```json 代码块，其次任意 ``` 代码块，最后最外层花括号
fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let rest = &trimmed[start + fence.len()..];
            let body = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest).trim();
            if body.starts_with('{') {
                return Some(body);
            }
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解析计划：丢弃 task 为空的条目，至少保留一项，截断到 max_subtasks
pub fn parse_plan(output: &str, max_subtasks: usize) -> Result<Plan, PlanParseError> {
    let json = extract_json(output).ok_or(PlanParseError::NoJson)?;
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| PlanParseError::Invalid(e.to_string()))?;
    let items = value
        .get("subtasks")
        .and_then(|v| v.as_array())
        .ok_or_else(|| PlanParseError::Invalid("missing subtasks list".to_string()))?;

    let subtasks: Vec<Subtask> = items
        .iter()
        .filter_map(|item| {
            let task = item.get("task")?.as_str()?.trim();
            if task.is_empty() {
                return None;
            }
            let is_primitive = item
                .get("is_primitive")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            Some(Subtask {
                task: task.to_string(),
                is_primitive,
            })
        })
        .take(max_subtasks.max(1))
        .collect();
    if subtasks.is_empty() {
        return Err(PlanParseError::Empty);
    }

    let thought = value
        .get("thought")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Ok(Plan { thought, subtasks })
}

/// 初始规划提示词
pub fn planning_prompt(task: &str, max_subtasks: usize) -> String {
    format!(
        "请把下面的任务拆分为最多 {max_subtasks} 个按顺序执行的子任务。\n\
         能直接用工具或一次回答完成的子任务标记 is_primitive=true，仍需继续拆分的标记为 false。\n\
         只输出一个 JSON 对象，格式遵循以下 JSON Schema：\n{schema}\n\n任务：{task}",
        schema = plan_schema_json(),
    )
}

/// 剩余计划修订提示词
pub fn refine_prompt(task: &str, remaining: &[Subtask], max_subtasks: usize) -> String {
    let remaining_json = serde_json::to_string(remaining).unwrap_or_else(|_| "[]".to_string());
    format!(
        "根据上面已完成子任务的结果，修订任务「{task}」剩余的子任务（最多 {max_subtasks} 个）。\n\
         当前剩余子任务：{remaining_json}\n\
         如无需修改，原样输出剩余子任务。只输出一个 JSON 对象，格式遵循以下 JSON Schema：\n{schema}",
        schema = plan_schema_json(),
    )
}
