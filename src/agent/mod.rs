//! Agent 层：计划值类型、规划器、计划执行器与任务事件

pub mod events;
pub mod executor;
pub mod plan;
pub mod planner;

pub use events::TaskEvent;
pub use executor::{ExecutionControl, ExecutionOutcome, PlanExecutor, StepObserver, StepResult, StopReason};
pub use plan::{normalize_steps, Plan, PlanStep, Reflection};
pub use planner::Planner;

/// 一次任务执行的归属：记忆按 agent 分区、按 task 过滤
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskScope {
    pub agent_id: String,
    pub task_id: String,
}

impl TaskScope {
    pub fn new(agent_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_id: task_id.into(),
        }
    }
}
