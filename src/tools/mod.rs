//! 工具层：Tool trait 与注册表、并行调用器，以及运行时自带的 read / ask_human / alarm / time

pub mod alarm;
pub mod ask_human;
pub mod context;
pub mod filesystem;
pub mod invoker;
pub mod registry;
pub mod schema;
pub mod time;

use std::path::Path;

pub use alarm::AlarmTool;
pub use ask_human::AskHumanTool;
pub use context::ToolContext;
pub use filesystem::{ReadTool, SafeFs};
pub use invoker::ToolInvoker;
pub use registry::{Tool, ToolEntry, ToolRegistry};
pub use schema::{parameters_for, parse_args};
pub use time::TimeTool;

/// 默认工具集：read（沙箱为 workspace_root）、ask_human、alarm、time
pub fn default_registry(workspace_root: impl AsRef<Path>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(ReadTool::new(workspace_root));
    registry.register(AskHumanTool);
    registry.register(AlarmTool);
    registry.register(TimeTool);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_exposes_core_tools() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = default_registry(dir.path());
        assert_eq!(registry.tool_names(), vec!["read", "ask_human", "alarm", "time"]);
        let specs = registry.specs();
        assert_eq!(specs.len(), 4);
        assert_eq!(specs[0]["function"]["parameters"]["required"][0], "path");
    }
}
