//! 认知层：ReAct 主循环、ReCAP 递归规划、计划解析与任务路由

pub mod loop_;
pub mod planner;
pub mod recap;
pub mod router;

pub use loop_::{ReactLoop, ReactOutcome, DEFAULT_MAX_STEPS};
pub use planner::{parse_plan, Plan, PlanParseError, Subtask};
pub use recap::{needs_human_input, RecapOutcome, RecapPlanner};
pub use router::{parse_route, Route, TaskRouter};
