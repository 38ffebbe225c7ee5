//! Angel - 步数受控的工具调用 Agent 运行时
//!
//! 模块划分：
//! - **agent**: 无头 Agent 运行时（历史命令、路由、执行、持久化与回滚）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、任务状态、会话监管、工具并发调度、任务协调器
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 消息模型、token 估算、摘要、上下文窗口、对话历史存储
//! - **react**: ReAct 主循环、ReCAP 递归规划、任务路由
//! - **tools**: Tool trait、注册表、并行调用器，以及 read / ask_human / alarm / time

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod react;
pub mod tools;

pub use agent::Agent;
pub use core::{AgentError, Outbound, Submission, TaskCoordinator};
