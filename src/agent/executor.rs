//! 计划执行器
//!
//! 按顺序执行步骤，每步之前依次检查：取消标志 → 墙钟预算。
//! 工具步骤在注册表中解析（未知工具记为该步失败），否则调用推理能力生成"思考"结果。
//! 每步结果立即写入短期记忆；失败的步骤不中断循环。
//! 结果持久化在有限次退避重试后仍失败时，执行以 Aborted 结束，已有结果保留。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::{Plan, PlanStep, Planner, TaskScope};
use crate::core::{AgentError, EngineError, RecoveryAction, RecoveryEngine};
use crate::llm::{LlmClient, Message};
use crate::memory::{AgentMemory, Metadata};
use crate::tools::ToolExecutor;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step_id: u32,
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tool_used: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

impl StepResult {
    pub fn ok(step_id: u32, result: Value, tool_used: Option<String>) -> Self {
        Self {
            step_id,
            success: true,
            result: Some(result),
            error: None,
            tool_used,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn failed(step_id: u32, error: impl Into<String>, tool_used: Option<String>) -> Self {
        Self {
            step_id,
            success: false,
            result: None,
            error: Some(error.into()),
            tool_used,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    Cancelled,
    TimedOut,
    /// 基础设施错误（如步骤结果无法持久化）
    Aborted(String),
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// 执行结束时的计划（自适应重规划可能替换了尾部）
    pub plan: Plan,
    pub results: Vec<StepResult>,
    pub stop: StopReason,
}

/// 每步持久化后的回调（生命周期引擎用来写心跳、TaskStep 行与事件）
#[async_trait]
pub trait StepObserver: Send + Sync {
    async fn step_completed(
        &self,
        scope: &TaskScope,
        step: &PlanStep,
        result: &StepResult,
    ) -> Result<(), EngineError>;
}

/// 单次执行的控制参数
#[derive(Debug, Clone)]
pub struct ExecutionControl {
    pub cancel: CancellationToken,
    /// 任务开始时间；预算从这里算起
    pub started: Instant,
    pub max_execution_time: Duration,
}

impl ExecutionControl {
    pub fn new(cancel: CancellationToken, max_execution_time: Duration) -> Self {
        Self {
            cancel,
            started: Instant::now(),
            max_execution_time,
        }
    }
}

pub struct PlanExecutor {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolExecutor>,
    memory: Arc<AgentMemory>,
    planner: Option<Arc<Planner>>,
    recovery: RecoveryEngine,
    persist_attempts: u32,
    persist_backoff: Duration,
}

impl PlanExecutor {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<ToolExecutor>, memory: Arc<AgentMemory>) -> Self {
        Self {
            llm,
            tools,
            memory,
            planner: None,
            recovery: RecoveryEngine::new(),
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(100),
        }
    }

    /// 开启自适应重规划：失败步骤之后请求规划器细化剩余步骤
    pub fn with_adaptive_planner(mut self, planner: Arc<Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_persist_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.persist_attempts = attempts.max(1);
        self.persist_backoff = backoff;
        self
    }

    pub async fn execute_plan(
        &self,
        scope: &TaskScope,
        plan: &Plan,
        control: &ExecutionControl,
        observer: Option<&dyn StepObserver>,
    ) -> ExecutionOutcome {
        let mut plan = plan.clone();
        let mut results: Vec<StepResult> = Vec::new();
        let mut index = 0;

        let stop = loop {
            let Some(step) = plan.steps.get(index).cloned() else {
                break StopReason::Completed;
            };

            if control.cancel.is_cancelled() {
                tracing::info!(task_id = %scope.task_id, completed = results.len(), "execution cancelled");
                break StopReason::Cancelled;
            }
            if control.started.elapsed() > control.max_execution_time {
                tracing::warn!(task_id = %scope.task_id, completed = results.len(), "execution time limit reached");
                break StopReason::TimedOut;
            }

            tracing::info!(task_id = %scope.task_id, step_id = step.id, "executing step: {}", step.description);
            let result = match &step.tool {
                Some(tool) => self.run_tool_step(&step, tool).await,
                None => self.run_thinking_step(&step, &plan, &results).await,
            };
            if !result.success {
                tracing::warn!(task_id = %scope.task_id, step_id = step.id, error = ?result.error, "step failed");
            }

            if let Err(e) = self.persist(scope, &result).await {
                results.push(result);
                break StopReason::Aborted(format!("failed to persist step {}: {}", step.id, e));
            }
            if let Some(observer) = observer {
                if let Err(e) = observer.step_completed(scope, &step, &result).await {
                    results.push(result);
                    break StopReason::Aborted(format!("failed to record step {}: {}", step.id, e));
                }
            }

            let failed = !result.success;
            results.push(result);
            index += 1;

            if failed {
                if let Some(planner) = &self.planner {
                    if index < plan.steps.len() {
                        let refined = planner
                            .refine_plan(scope, &plan, index, results.last())
                            .await;
                        plan = plan.splice_refinement(index, refined);
                    }
                }
            }
        };

        ExecutionOutcome {
            plan,
            results,
            stop,
        }
    }

    async fn run_tool_step(&self, step: &PlanStep, tool: &str) -> StepResult {
        if !self.tools.contains(tool) {
            let err = AgentError::UnknownTool(tool.to_string());
            return StepResult::failed(step.id, err.to_string(), Some(tool.to_string()));
        }

        let outcome = self.tools.execute(tool, step.tool_args.clone()).await;
        StepResult {
            step_id: step.id,
            success: outcome.success,
            result: outcome.result,
            error: outcome.error,
            tool_used: Some(tool.to_string()),
            metadata: outcome.metadata,
            timestamp: Utc::now(),
        }
    }

    async fn run_thinking_step(&self, step: &PlanStep, plan: &Plan, previous: &[StepResult]) -> StepResult {
        let messages = vec![
            Message::system(
                "You are an autonomous agent executing a plan. For this step, think and provide \
                 an analysis or conclusion based on the previous steps.",
            ),
            Message::user(thinking_context(step, plan, previous)),
        ];
        match self.llm.generate_text(&messages).await {
            Ok(text) => StepResult::ok(step.id, Value::String(text), None),
            Err(e) => StepResult::failed(step.id, format!("Thinking step failed: {}", e), None),
        }
    }

    /// 写短期记忆，瞬时错误按指数退避重试
    async fn persist(&self, scope: &TaskScope, result: &StepResult) -> Result<(), AgentError> {
        let payload = serde_json::to_value(result).map_err(crate::core::MemoryError::from)?;
        let mut delay = self.persist_backoff;
        let mut attempt = 1;
        loop {
            match self
                .memory
                .record_step_result(&scope.agent_id, &scope.task_id, result.step_id, payload.clone())
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) => {
                    let err = AgentError::from(e);
                    let retryable = self.recovery.classify_agent(&err) == RecoveryAction::RetryWithBackoff;
                    if !retryable || attempt >= self.persist_attempts {
                        return Err(err);
                    }
                    tracing::warn!(task_id = %scope.task_id, attempt, error = %err, "step persistence failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }
}

fn thinking_context(step: &PlanStep, plan: &Plan, previous: &[StepResult]) -> String {
    let mut ctx = format!("Goal: {}\n\nPlan reasoning: {}\n\n", plan.goal, plan.thought);
    if !previous.is_empty() {
        ctx.push_str("Previous steps:\n");
        for result in previous {
            let desc = plan
                .steps
                .iter()
                .find(|s| s.id == result.step_id)
                .map(|s| s.description.as_str())
                .unwrap_or("Unknown step");
            ctx.push_str(&format!("Step {}: {}\n", result.step_id, desc));
            if result.success {
                let shown = result
                    .result
                    .as_ref()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| "No result".into());
                ctx.push_str(&format!("Result: {}\n\n", shown));
            } else {
                ctx.push_str(&format!(
                    "Error: {}\n\n",
                    result.error.as_deref().unwrap_or("Unknown error")
                ));
            }
        }
    }
    ctx.push_str(&format!(
        "Current step ({}): {}\n\nProvide your analysis or conclusion for this step.",
        step.id, step.description
    ));
    ctx
}
