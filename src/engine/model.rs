//! Agent / Task / TaskStep 记录
//!
//! 状态机：`pending → running → {completed, failed, cancelled}`。
//! started_at 只在第一次进入 running 时写入，completed_at 只在第一次进入终态时写入；
//! 重试重新入队时清空 completed_at，保持"completed_at 有值 ⇔ 终态"。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::{Plan, Reflection, StepResult};
use crate::core::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 运行路径上允许的边；终态没有出边（重试重新入队走单独的操作）
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| EngineError::Repository(format!("unknown task status: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Running,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Running => "running",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(AgentStatus::Idle),
            "running" => Ok(AgentStatus::Running),
            other => Err(EngineError::Repository(format!("unknown agent status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub model: String,
    pub workspace: String,
    pub max_iterations: u32,
    pub temperature: f32,
    pub status: AgentStatus,
    #[serde(default)]
    pub current_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: impl Into<String>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            workspace: format!("workspace/{}", id),
            id,
            name: name.into(),
            description: None,
            model: "gpt-4o-mini".to_string(),
            max_iterations: 10,
            temperature: 0.7,
            status: AgentStatus::Idle,
            current_task_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }
}

/// 重试与运行期簿记；已知键是字段，其余放进 extra
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskMeta {
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub agent_id: String,
    pub goal: String,
    pub status: TaskStatus,
    /// 越大越先
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub results: Vec<StepResult>,
    #[serde(default)]
    pub reflection: Option<Reflection>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub meta_data: TaskMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(agent_id: impl Into<String>, goal: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            goal: goal.into(),
            status: TaskStatus::Pending,
            priority: 0,
            scheduled_for: None,
            plan: None,
            results: Vec::new(),
            reflection: None,
            error: None,
            meta_data: TaskMeta::default(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 立即派发可见：pending 且没有未来的激活时间
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.scheduled_for.map_or(true, |at| at <= now)
    }

    /// 校验并应用一次状态迁移
    pub fn apply_transition(&mut self, next: TaskStatus, now: DateTime<Utc>) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        if next == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// failed → pending，重试计数加一
    pub fn requeue_for_retry(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.status != TaskStatus::Failed {
            return Err(EngineError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        self.status = TaskStatus::Pending;
        self.meta_data.retry_count += 1;
        self.meta_data.last_retry = Some(now);
        self.meta_data.cancel_requested = false;
        self.completed_at = None;
        self.error = None;
        self.updated_at = now;
        Ok(())
    }
}

/// 一次运行写回的结果字段
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub plan: Option<Plan>,
    pub results: Vec<StepResult>,
    pub reflection: Option<Reflection>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStep {
    pub task_id: String,
    pub step_number: u32,
    pub action: String,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub input_data: Value,
    #[serde(default)]
    pub output_data: Value,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

/// 归档记录：任务连同它的步骤
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedTask {
    pub task: Task,
    pub steps: Vec<TaskStep>,
    pub archived_at: DateTime<Utc>,
}
