//! 错误类型与恢复动作
//!
//! 分三层：步骤级 [`AgentError`]、记忆层 [`MemoryError`]、引擎级 [`EngineError`]。
//! 由 [`crate::core::RecoveryEngine`] 映射为 [`RecoveryAction`]。

use thiserror::Error;

use crate::engine::TaskStatus;
use crate::llm::LlmError;

/// 规划 / 执行步骤中出现的错误（解析、推理、工具、取消）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("LLM error: {0}")]
    LlmError(#[from] LlmError),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Tool '{0}' not found")]
    UnknownTool(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
}

/// KV 缓存 / 向量索引等记忆后端错误
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Memory backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Memory entry not found: {0}")]
    NotFound(String),
}

/// 任务生命周期引擎错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// 派发级错误：Agent 一直忙碌，任务仍为 pending
    #[error("Agent {agent_id} busy after {attempts} dispatch attempts")]
    AgentBusy { agent_id: String, attempts: u32 },

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Agent {0} has an active task")]
    AgentActive(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Execution error: {0}")]
    Execution(#[from] AgentError),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

/// 恢复引擎根据错误类别给出的建议动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 瞬时基础设施 / 供应商错误：退避后重试，次数有限
    RetryWithBackoff,
    /// 规划或解析失败：使用回退计划 / 默认反思
    Fallback,
    /// 工具错误：记为失败步骤，继续下一步
    RecordStepFailure,
    /// Agent 忙碌：任务保持 pending，稍后重新派发
    RetryDispatch,
    /// 不可恢复：任务记为失败（或启动时直接退出）
    Abort,
}
