//! 工具注册表
//!
//! 所有可执行工具实现 Tool trait（name / description / parameters_schema / execute），
//! 只有 schema 没有实现的工具以 ToolEntry::Static 注册：会下发给模型，但调用时只返回错误文本。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::ToolContext;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型 tool_calls 中的 function.name）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema（供 LLM 生成正确的参数格式）
    /// 默认返回空对象，表示无参数
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// OpenAI tools 规范
    fn spec(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name(),
                "description": self.description(),
                "parameters": self.parameters_schema(),
            }
        })
    }

    /// 为 true 时不受统一超时约束（如等待人工回复）
    fn exempt_from_timeout(&self) -> bool {
        false
    }

    /// 执行工具；Err 会被调用方折叠为 `Tool error: ...` 文本
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String>;
}

/// 注册项：可执行工具或仅有 schema 的静态声明
#[derive(Clone)]
pub enum ToolEntry {
    Invocable(Arc<dyn Tool>),
    Static(Value),
}

impl ToolEntry {
    pub fn name(&self) -> String {
        match self {
            ToolEntry::Invocable(tool) => tool.name().to_string(),
            ToolEntry::Static(spec) => spec["function"]["name"]
                .as_str()
                .or_else(|| spec["name"].as_str())
                .unwrap_or_default()
                .to_string(),
        }
    }

    pub fn spec(&self) -> Value {
        match self {
            ToolEntry::Invocable(tool) => tool.spec(),
            ToolEntry::Static(spec) => spec.clone(),
        }
    }
}

/// 工具注册表：保持注册顺序，同名后注册者覆盖先注册者
#[derive(Default, Clone)]
pub struct ToolRegistry {
    entries: Vec<ToolEntry>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, entry: ToolEntry) {
        let name = entry.name();
        match self.index.get(&name) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index.insert(name, self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.insert(ToolEntry::Invocable(Arc::new(tool)));
    }

    /// 注册只有 schema 的工具（不可执行）
    pub fn register_static(&mut self, spec: Value) {
        self.insert(ToolEntry::Static(spec));
    }

    pub fn get(&self, name: &str) -> Option<&ToolEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.entries.iter().map(ToolEntry::name).collect()
    }

    /// 全部工具的 OpenAI tools 规范（按注册顺序）
    pub fn specs(&self) -> Vec<Value> {
        self.entries.iter().map(ToolEntry::spec).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "test tool"
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String, String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn registry_keeps_order_and_overrides_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(Named("a"));
        reg.register_static(json!({"type": "function", "function": {"name": "b", "parameters": {}}}));
        reg.register(Named("a"));
        assert_eq!(reg.tool_names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(reg.len(), 2);
        assert!(matches!(reg.get("b"), Some(ToolEntry::Static(_))));
        assert!(reg.get("c").is_none());
    }

    #[test]
    fn spec_uses_function_shape() {
        let spec = Named("time").spec();
        assert_eq!(spec["type"], "function");
        assert_eq!(spec["function"]["name"], "time");
        assert_eq!(spec["function"]["parameters"]["type"], "object");
    }
}
