//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ANGEL__*` 覆盖（双下划线表示嵌套，如 `ANGEL__AGENT__MAX_STEPS=8`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub context: ContextSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
}

/// 任务引擎选择策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoutingPolicy {
    /// 由模型判断任务复杂度
    #[default]
    Auto,
    React,
    Recap,
}

/// [app] 段：工作目录、历史目录、取消口令
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 工具沙箱根目录（超长工具输出也落在其下的 tool_outputs/）
    pub workspace_root: PathBuf,
    /// 对话历史根目录，按用户分子目录
    pub history_dir: PathBuf,
    /// 任务运行中输入该口令即取消任务
    pub cancel_keyword: String,
    pub routing: RoutingPolicy,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            workspace_root: PathBuf::from("agent_workspace"),
            history_dir: PathBuf::from("chat_history"),
            cancel_keyword: "停止任务".to_string(),
            routing: RoutingPolicy::Auto,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai（任意 OpenAI 兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "qwen3-max".to_string(),
            base_url: Some("https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()),
            api_key_env: "DASHSCOPE_API_KEY".to_string(),
            timeout_secs: 120,
        }
    }
}

/// [context] 段：上下文 token 预算与超长工具输出阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub max_tokens: usize,
    /// 超过该字符数的工具输出落盘
    pub tool_output_limit: usize,
    /// 落盘后在对话中保留的前缀字符数
    pub tool_output_preview: usize,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_tokens: 60_000,
            tool_output_limit: 10_000,
            tool_output_preview: 1_000,
        }
    }
}

/// [agent] 段：ReAct / ReCAP 的步数与深度上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_steps: usize,
    pub recap_max_depth: usize,
    pub recap_max_subtasks: usize,
    /// ReCAP 全局子任务步数上限（跨递归层级共享）
    pub recap_max_steps: usize,
    /// 单轮内并行工具调用的 worker 上限
    pub max_tool_workers: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_steps: 20,
            recap_max_depth: 3,
            recap_max_subtasks: 5,
            recap_max_steps: 20,
            max_tool_workers: 8,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）；ask_human 不受此限制
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 120,
        }
    }
}

/// 从 config 目录加载配置，环境变量 ANGEL__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ANGEL__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ANGEL")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.context.max_tokens, 60_000);
        assert_eq!(cfg.context.tool_output_limit, 10_000);
        assert_eq!(cfg.agent.max_tool_workers, 8);
        assert_eq!(cfg.agent.recap_max_depth, 3);
        assert_eq!(cfg.app.cancel_keyword, "停止任务");
        assert_eq!(cfg.app.routing, RoutingPolicy::Auto);
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[agent]\nmax_steps = 4\n\n[app]\nrouting = \"recap\"\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.agent.max_steps, 4);
        assert_eq!(cfg.app.routing, RoutingPolicy::Recap);
        // 未出现的键保持默认
        assert_eq!(cfg.agent.recap_max_subtasks, 5);
    }
}
