//! 错误恢复引擎
//!
//! 把步骤级与引擎级错误归入五类（瞬时基础设施、规划解析、工具、资源争用、致命配置），
//! 返回 RecoveryAction，供执行器与生命周期引擎决定是重试、回退、记失败步骤还是终止。

use crate::core::{AgentError, EngineError, MemoryError, RecoveryAction};

#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 步骤 / 规划层错误的分类
    pub fn classify_agent(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::JsonParseError(_) => RecoveryAction::Fallback,
            AgentError::LlmError(e) if e.is_retryable() => RecoveryAction::RetryWithBackoff,
            AgentError::LlmError(_) => RecoveryAction::Fallback,
            AgentError::ToolExecutionFailed(_)
            | AgentError::ToolTimeout(_)
            | AgentError::UnknownTool(_) => RecoveryAction::RecordStepFailure,
            AgentError::Memory(e) => self.classify_memory(e),
            AgentError::Cancelled | AgentError::ConfigError(_) => RecoveryAction::Abort,
        }
    }

    /// 引擎层错误的分类
    pub fn classify(&self, err: &EngineError) -> RecoveryAction {
        match err {
            EngineError::AgentBusy { .. } => RecoveryAction::RetryDispatch,
            EngineError::Repository(_) | EngineError::Archive(_) | EngineError::Scheduler(_) => {
                RecoveryAction::RetryWithBackoff
            }
            EngineError::Memory(e) => self.classify_memory(e),
            EngineError::Execution(e) => self.classify_agent(e),
            EngineError::AgentNotFound(_)
            | EngineError::TaskNotFound(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::AgentActive(_) => RecoveryAction::Abort,
        }
    }

    fn classify_memory(&self, err: &MemoryError) -> RecoveryAction {
        match err {
            MemoryError::Backend(_) => RecoveryAction::RetryWithBackoff,
            MemoryError::Serialization(_) | MemoryError::NotFound(_) => RecoveryAction::Abort,
        }
    }
}
