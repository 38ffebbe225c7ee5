//! 核心编排层：错误类型、任务状态、会话监管、工具并发调度与任务协调器

pub mod coordinator;
pub mod error;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;

pub use coordinator::{Submission, TaskCoordinator, DEFAULT_CANCEL_KEYWORD};
pub use error::AgentError;
pub use session_supervisor::{SessionSupervisor, TaskFinish};
pub use state::{Outbound, SystemEvent, TaskPhase};
pub use task_scheduler::{TaskScheduler, DEFAULT_TOOL_WORKERS};
