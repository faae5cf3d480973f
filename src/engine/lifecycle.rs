//! 任务生命周期引擎
//!
//! 派发：认领 Agent（idle → running 比较交换）→ 任务 running → 组装上下文 → 规划 → 执行 → 反思 → 终态。
//! Agent 的释放放在受保护的作用域里：运行路径返回错误或 panic 时任务记为 failed，Agent 仍回到 idle。
//! 已终态任务的重复投递不做任何事。
//!
//! 周期性维护：到期的定时任务提升为可派发、失败任务在窗口内重试、超过保留期的终态任务先归档后删除。

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::agent::{
    ExecutionControl, PlanExecutor, PlanStep, Planner, StepObserver, StepResult, StopReason,
    TaskEvent, TaskScope,
};
use crate::config::AppConfig;
use crate::core::{CancelRegistry, EngineError};
use crate::engine::{
    Agent, ArchiveSink, ArchivedTask, Scheduler, Task, TaskOutcome, TaskRepository, TaskStatus,
    TaskStep,
};
use crate::llm::LlmClient;
use crate::memory::{AgentMemory, ContextAssembler};
use crate::tools::ToolExecutor;

pub const TIME_LIMIT_ERROR: &str = "execution time limit exceeded";

/// 引擎运行参数
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_execution_time: Duration,
    pub max_retries: u32,
    pub retry_window: Duration,
    pub retention: Duration,
    pub dispatch_max_attempts: u32,
    pub dispatch_backoff: Duration,
    pub cleanup_batch_size: usize,
    pub adaptive_replanning: bool,
    pub max_short_term: usize,
    pub max_long_term: usize,
    pub min_score: f32,
    pub workspace_root: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let engine = &config.engine;
        Self {
            max_execution_time: engine.max_execution_time(),
            max_retries: engine.max_retries,
            retry_window: Duration::from_secs(engine.retry_window_secs),
            retention: Duration::from_secs(engine.retention_secs),
            dispatch_max_attempts: engine.dispatch_max_attempts.max(1),
            dispatch_backoff: engine.dispatch_backoff(),
            cleanup_batch_size: 100,
            adaptive_replanning: engine.adaptive_replanning,
            max_short_term: config.memory.max_short_term,
            max_long_term: config.memory.max_long_term,
            min_score: config.memory.min_score,
            workspace_root: config.app.workspace_root.clone(),
        }
    }
}

/// 引擎依赖的外部服务，进程启动时构造一次
#[derive(Clone)]
pub struct EngineServices {
    pub repository: Arc<dyn TaskRepository>,
    pub memory: Arc<AgentMemory>,
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<ToolExecutor>,
    pub scheduler: Arc<dyn Scheduler>,
    pub archive: Arc<dyn ArchiveSink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub goal: String,
    pub status: TaskStatus,
    pub success: Option<bool>,
    pub steps: usize,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub archived: usize,
    pub deleted: usize,
}

pub struct TaskEngine {
    repo: Arc<dyn TaskRepository>,
    memory: Arc<AgentMemory>,
    scheduler: Arc<dyn Scheduler>,
    archive: Arc<dyn ArchiveSink>,
    context: ContextAssembler,
    planner: Arc<Planner>,
    executor: PlanExecutor,
    cancels: CancelRegistry,
    events: broadcast::Sender<TaskEvent>,
    settings: EngineSettings,
}

impl TaskEngine {
    pub fn new(services: EngineServices, settings: EngineSettings) -> Self {
        let planner = Arc::new(Planner::new(services.llm.clone()).with_memory(services.memory.clone()));
        let mut executor = PlanExecutor::new(
            services.llm.clone(),
            services.tools.clone(),
            services.memory.clone(),
        );
        if settings.adaptive_replanning {
            executor = executor.with_adaptive_planner(planner.clone());
        }
        let context = ContextAssembler::new(services.memory.clone(), services.tools.registry().clone())
            .with_limits(settings.max_short_term, settings.max_long_term, settings.min_score);
        let (events, _) = broadcast::channel(256);

        Self {
            repo: services.repository,
            memory: services.memory,
            scheduler: services.scheduler,
            archive: services.archive,
            context,
            planner,
            executor,
            cancels: CancelRegistry::default(),
            events,
            settings,
        }
    }

    /// 任务取消 token 从 root 派生，关闭时运行中的任务在下一个步骤边界停止
    pub fn with_cancel_root(mut self, root: tokio_util::sync::CancellationToken) -> Self {
        self.cancels = CancelRegistry::new(root);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn repository(&self) -> &Arc<dyn TaskRepository> {
        &self.repo
    }

    pub fn memory(&self) -> &Arc<AgentMemory> {
        &self.memory
    }

    pub fn cancels(&self) -> &CancelRegistry {
        &self.cancels
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TaskEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(event);
    }

    // ---------- Agent 管理 ----------

    pub async fn create_agent(&self, agent: Agent) -> Result<Agent, EngineError> {
        if let Some(root) = &self.settings.workspace_root {
            let dir = root.join(&agent.id);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| EngineError::Repository(format!("workspace {}: {}", dir.display(), e)))?;
        }
        self.repo.insert_agent(&agent).await?;
        self.snapshot_agent(&agent).await;
        tracing::info!(agent_id = %agent.id, name = %agent.name, "agent created");
        Ok(agent)
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Agent, EngineError> {
        self.repo
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))
    }

    /// 记忆中的 Agent 状态快照
    pub async fn agent_state(&self, agent_id: &str) -> Result<Option<Value>, EngineError> {
        Ok(self.memory.load_agent_state(agent_id).await?)
    }

    /// 有进行中任务时拒绝；否则删除关系记录与两层记忆
    pub async fn delete_agent(&self, agent_id: &str) -> Result<bool, EngineError> {
        if !self.repo.delete_agent(agent_id).await? {
            return Ok(false);
        }
        let removed = self.memory.delete_agent_memories(agent_id).await?;
        tracing::info!(agent_id, memories = removed, "agent deleted");
        Ok(true)
    }

    async fn snapshot_agent(&self, agent: &Agent) {
        let state = json!({
            "id": agent.id,
            "name": agent.name,
            "status": agent.status,
            "current_task_id": agent.current_task_id,
            "updated_at": agent.updated_at,
        });
        if let Err(e) = self.memory.save_agent_state(&agent.id, state).await {
            tracing::warn!(agent_id = %agent.id, error = %e, "failed to snapshot agent state");
        }
    }

    // ---------- 任务 ----------

    /// 创建任务；没有未来激活时间的任务立即投递给调度器
    pub async fn create_task(&self, task: Task) -> Result<Task, EngineError> {
        if task.status != TaskStatus::Pending {
            return Err(EngineError::InvalidTransition {
                task_id: task.id.clone(),
                from: task.status,
                to: TaskStatus::Pending,
            });
        }
        self.repo.insert_task(&task).await?;
        tracing::info!(task_id = %task.id, agent_id = %task.agent_id, scheduled_for = ?task.scheduled_for, "task created");
        if task.is_dispatchable(Utc::now()) {
            self.scheduler.submit(&task.agent_id, &task.id).await?;
        }
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task, EngineError> {
        self.repo
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    pub async fn task_steps(&self, task_id: &str) -> Result<Vec<TaskStep>, EngineError> {
        self.repo.steps_for(task_id).await
    }

    /// 调度器入口。Agent 忙碌时按固定退避重试，次数用尽返回 [`EngineError::AgentBusy`]，任务保持 pending
    pub async fn dispatch(&self, agent_id: &str, task_id: &str) -> Result<Task, EngineError> {
        let max_attempts = self.settings.dispatch_max_attempts;
        for attempt in 1..=max_attempts {
            let task = self.get_task(task_id).await?;
            if task.agent_id != agent_id {
                return Err(EngineError::Scheduler(format!(
                    "task {} does not belong to agent {}",
                    task_id, agent_id
                )));
            }
            if !task.is_dispatchable(Utc::now()) {
                tracing::debug!(task_id, status = %task.status, "task not dispatchable, skipping delivery");
                return Ok(task);
            }

            if self.repo.try_claim_agent(agent_id, task_id).await? {
                return self.run_claimed(agent_id, task_id).await;
            }

            tracing::info!(agent_id, task_id, attempt, max_attempts, "agent busy");
            if attempt < max_attempts {
                tokio::time::sleep(self.settings.dispatch_backoff).await;
            }
        }
        Err(EngineError::AgentBusy {
            agent_id: agent_id.to_string(),
            attempts: max_attempts,
        })
    }

    /// Agent 已认领；无论运行结果如何都释放
    async fn run_claimed(&self, agent_id: &str, task_id: &str) -> Result<Task, EngineError> {
        // 认领期间可能有重复投递已把任务跑完
        let task = match self.repo.get_task(task_id).await {
            Ok(Some(task)) if task.status == TaskStatus::Pending => task,
            other => {
                self.release(agent_id).await;
                return match other {
                    Ok(Some(task)) => Ok(task),
                    Ok(None) => Err(EngineError::TaskNotFound(task_id.to_string())),
                    Err(e) => Err(e),
                };
            }
        };

        let result = std::panic::AssertUnwindSafe(self.run_task(task))
            .catch_unwind()
            .await;

        let finished = match result {
            Ok(Ok(task)) => Ok(task),
            Ok(Err(e)) => {
                tracing::error!(task_id, error = %e, "task run failed");
                self.fail_task(task_id, e.to_string()).await
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                tracing::error!(task_id, panic = %msg, "task run panicked");
                self.fail_task(task_id, format!("execution panicked: {}", msg)).await
            }
        };

        self.cancels.remove(task_id);
        self.release(agent_id).await;
        finished
    }

    async fn release(&self, agent_id: &str) {
        match self.repo.release_agent(agent_id).await {
            Ok(agent) => self.snapshot_agent(&agent).await,
            Err(e) => tracing::error!(agent_id, error = %e, "failed to release agent"),
        }
    }

    async fn run_task(&self, task: Task) -> Result<Task, EngineError> {
        let scope = TaskScope::new(&task.agent_id, &task.id);
        let started = Instant::now();
        // 先登记 token，迁移到 running 之后到达的取消请求都能直接命中
        let cancel = self.cancels.register(&task.id);
        let task = self
            .repo
            .transition_task(&task.id, TaskStatus::Running, Utc::now())
            .await?;
        if let Ok(agent) = self.get_agent(&task.agent_id).await {
            self.snapshot_agent(&agent).await;
        }
        self.emit(TaskEvent::TaskStarted {
            task_id: task.id.clone(),
            agent_id: task.agent_id.clone(),
        });
        tracing::info!(task_id = %task.id, agent_id = %task.agent_id, goal = %task.goal, "task started");

        if task.meta_data.cancel_requested {
            cancel.cancel();
        }
        if cancel.is_cancelled() {
            return self
                .finish(&task, TaskStatus::Cancelled, TaskOutcome::default())
                .await;
        }

        let context = self.context.assemble(&task.agent_id, &task.goal).await;
        let plan = self.planner.create_plan(&scope, &task.goal, &context).await;
        self.repo
            .record_outcome(
                &task.id,
                &TaskOutcome {
                    plan: Some(plan.clone()),
                    ..TaskOutcome::default()
                },
            )
            .await?;
        self.emit(TaskEvent::PlanCreated {
            task_id: task.id.clone(),
            steps: plan.steps.len(),
        });

        let control = ExecutionControl {
            cancel,
            started,
            max_execution_time: self.settings.max_execution_time,
        };
        // 重试沿用之前的步骤记录，编号接着往后排
        let prior = self
            .repo
            .steps_for(&task.id)
            .await?
            .iter()
            .map(|s| s.step_number)
            .max()
            .unwrap_or(0);
        let recorder = StepRecorder {
            repo: self.repo.clone(),
            events: self.events.clone(),
            seq: AtomicU32::new(prior),
        };
        let outcome = self
            .executor
            .execute_plan(&scope, &plan, &control, Some(&recorder))
            .await;

        let reflection = self
            .planner
            .reflect_on_task(&scope, &task.goal, &outcome.plan, &outcome.results, &context)
            .await;

        let (status, error) = match &outcome.stop {
            StopReason::Completed => (TaskStatus::Completed, None),
            StopReason::Cancelled => (TaskStatus::Cancelled, None),
            StopReason::TimedOut => (TaskStatus::Cancelled, Some(TIME_LIMIT_ERROR.to_string())),
            StopReason::Aborted(reason) => (TaskStatus::Failed, Some(reason.clone())),
        };
        self.finish(
            &task,
            status,
            TaskOutcome {
                plan: Some(outcome.plan),
                results: outcome.results,
                reflection: Some(reflection),
                error,
            },
        )
        .await
    }

    /// 写回结果，再做终态迁移（最后一次写入）
    async fn finish(&self, task: &Task, status: TaskStatus, outcome: TaskOutcome) -> Result<Task, EngineError> {
        self.repo.record_outcome(&task.id, &outcome).await?;
        let done = self.repo.transition_task(&task.id, status, Utc::now()).await?;
        tracing::info!(
            task_id = %done.id,
            status = %done.status,
            steps = done.results.len(),
            error = ?done.error,
            "task finished"
        );
        self.emit(TaskEvent::TaskFinished {
            task_id: done.id.clone(),
            agent_id: done.agent_id.clone(),
            status: done.status,
        });
        Ok(done)
    }

    /// 运行路径出错或 panic：保留已写入的部分结果，记为 failed
    async fn fail_task(&self, task_id: &str, message: String) -> Result<Task, EngineError> {
        let task = self.get_task(task_id).await?;
        if task.is_terminal() {
            return Ok(task);
        }
        let outcome = TaskOutcome {
            plan: task.plan.clone(),
            results: task.results.clone(),
            reflection: task.reflection.clone(),
            error: Some(message),
        };
        self.repo.record_outcome(task_id, &outcome).await?;
        if task.status != TaskStatus::Running {
            return self.get_task(task_id).await;
        }
        let done = self
            .repo
            .transition_task(task_id, TaskStatus::Failed, Utc::now())
            .await?;
        self.emit(TaskEvent::TaskFinished {
            task_id: done.id.clone(),
            agent_id: done.agent_id.clone(),
            status: done.status,
        });
        Ok(done)
    }

    /// 协作式取消：running 任务在下一个步骤边界停止；pending 任务派发时直接以 cancelled 结束。
    /// 任务已终态时返回 false
    pub async fn cancel_task(&self, task_id: &str) -> Result<bool, EngineError> {
        let task = self.repo.request_cancel(task_id).await?;
        if task.is_terminal() {
            return Ok(false);
        }
        let signalled = self.cancels.cancel(task_id);
        tracing::info!(task_id, status = %task.status, signalled, "cancellation requested");
        Ok(true)
    }

    /// 取消某个 Agent 当前的任务
    pub async fn cancel_agent_task(&self, agent_id: &str) -> Result<bool, EngineError> {
        let agent = self.get_agent(agent_id).await?;
        match agent.current_task_id {
            Some(task_id) => self.cancel_task(&task_id).await,
            None => Ok(false),
        }
    }

    // ---------- 维护 ----------

    /// 提升到期的定时任务；取出即清空 scheduled_for，随后投递
    pub async fn promote_scheduled_tasks(&self) -> Result<usize, EngineError> {
        let due = self.repo.take_due_scheduled(Utc::now()).await?;
        let mut submitted = 0;
        for task in &due {
            match self.scheduler.submit(&task.agent_id, &task.id).await {
                Ok(()) => submitted += 1,
                Err(e) => tracing::error!(task_id = %task.id, error = %e, "failed to submit scheduled task"),
            }
        }
        if submitted > 0 {
            tracing::info!(count = submitted, "scheduled tasks promoted");
        }
        Ok(submitted)
    }

    /// 窗口内的失败任务在重试次数未满时重新入队
    pub async fn retry_failed_tasks(&self) -> Result<usize, EngineError> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(self.settings.retry_window).unwrap_or(chrono::Duration::zero());
        let mut requeued = 0;
        for task in self.repo.failed_since(cutoff).await? {
            let Some(task) = self
                .repo
                .requeue_failed(&task.id, self.settings.max_retries, now)
                .await?
            else {
                continue;
            };
            tracing::info!(task_id = %task.id, retry_count = task.meta_data.retry_count, "retrying failed task");
            // 已回到 pending 的任务投递失败时留给下次 recover
            match self.scheduler.submit(&task.agent_id, &task.id).await {
                Ok(()) => requeued += 1,
                Err(e) => tracing::error!(task_id = %task.id, error = %e, "failed to submit retried task"),
            }
        }
        Ok(requeued)
    }

    /// 超过保留期的终态任务：先归档，归档成功才删除
    pub async fn cleanup_old_tasks(&self) -> Result<CleanupReport, EngineError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.settings.retention).unwrap_or(chrono::Duration::zero());
        let batch_size = self.settings.cleanup_batch_size.max(1);
        let mut report = CleanupReport::default();

        loop {
            let tasks = self.repo.terminal_before(cutoff, batch_size).await?;
            if tasks.is_empty() {
                break;
            }
            let full_batch = tasks.len() == batch_size;

            let mut records = Vec::with_capacity(tasks.len());
            for task in tasks {
                let steps = self.repo.steps_for(&task.id).await?;
                records.push(ArchivedTask {
                    task,
                    steps,
                    archived_at: Utc::now(),
                });
            }
            if let Err(e) = self.archive.write(&records).await {
                tracing::error!(batch = records.len(), error = %e, "archive failed, keeping tasks");
                return Err(e);
            }
            report.archived += records.len();

            for record in &records {
                if self.repo.delete_task(&record.task.id).await? {
                    report.deleted += 1;
                }
            }
            if !full_batch {
                break;
            }
        }

        if report.archived > 0 {
            tracing::info!(archived = report.archived, deleted = report.deleted, "old tasks cleaned up");
        }
        Ok(report)
    }

    /// 启动时调用：遗留的 running 任务记为 failed 并释放 Agent，可派发的 pending 任务重新投递
    pub async fn recover(&self) -> Result<usize, EngineError> {
        for task in self.repo.tasks_with_status(TaskStatus::Running).await? {
            tracing::warn!(task_id = %task.id, "found orphaned running task");
            self.fail_task(&task.id, "worker stopped during execution".to_string())
                .await?;
            self.release(&task.agent_id).await;
        }
        let pending = self.repo.dispatchable_tasks(Utc::now()).await?;
        for task in &pending {
            self.scheduler.submit(&task.agent_id, &task.id).await?;
        }
        Ok(pending.len())
    }

    /// Agent 的任务历史，新的在前
    pub async fn task_history(&self, agent_id: &str, limit: usize) -> Result<Vec<TaskSummary>, EngineError> {
        self.get_agent(agent_id).await?;
        let tasks = self.repo.tasks_for_agent(agent_id, limit).await?;
        Ok(tasks
            .into_iter()
            .map(|t| TaskSummary {
                goal: t.plan.as_ref().map(|p| p.goal.clone()).unwrap_or_else(|| t.goal.clone()),
                success: t.reflection.as_ref().map(|r| r.success),
                steps: t.results.len(),
                task_id: t.id,
                status: t.status,
                error: t.error,
                created_at: t.created_at,
                completed_at: t.completed_at,
            })
            .collect())
    }
}

/// 每步之后：心跳、TaskStep 行、事件
struct StepRecorder {
    repo: Arc<dyn TaskRepository>,
    events: broadcast::Sender<TaskEvent>,
    seq: AtomicU32,
}

#[async_trait]
impl StepObserver for StepRecorder {
    async fn step_completed(
        &self,
        scope: &TaskScope,
        step: &PlanStep,
        result: &StepResult,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        self.repo.touch_heartbeat(&scope.task_id, now).await?;

        let output = match (&result.result, &result.error) {
            (Some(v), _) => v.clone(),
            (None, Some(e)) => json!({ "error": e }),
            (None, None) => Value::Null,
        };
        let row = TaskStep {
            task_id: scope.task_id.clone(),
            step_number: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            action: step.description.clone(),
            tool: result.tool_used.clone(),
            input_data: step.tool_args.clone(),
            output_data: output,
            status: if result.success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            },
            created_at: now,
        };
        self.repo.append_step(&row).await?;

        let _ = self.events.send(TaskEvent::StepCompleted {
            task_id: scope.task_id.clone(),
            step_id: result.step_id,
            success: result.success,
        });
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
