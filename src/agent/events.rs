//! 任务生命周期事件，经 broadcast 通道推送给订阅者

use serde::{Deserialize, Serialize};

use crate::engine::TaskStatus;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskStarted {
        task_id: String,
        agent_id: String,
    },
    PlanCreated {
        task_id: String,
        steps: usize,
    },
    StepCompleted {
        task_id: String,
        step_id: u32,
        success: bool,
    },
    TaskFinished {
        task_id: String,
        agent_id: String,
        status: TaskStatus,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::TaskStarted { task_id, .. }
            | TaskEvent::PlanCreated { task_id, .. }
            | TaskEvent::StepCompleted { task_id, .. }
            | TaskEvent::TaskFinished { task_id, .. } => task_id,
        }
    }
}
