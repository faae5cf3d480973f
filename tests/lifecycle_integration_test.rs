//! 任务生命周期集成测试：派发、取消、时限、重试、定时提升、清理、恢复、工作池重投

mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{harness, harness_with_repository, plan_json, reflection_json, settings};
use hive::agent::TaskEvent;
use hive::core::EngineError;
use hive::engine::{
    Agent, AgentStatus, HealthMonitor, HealthStatus, InMemoryRepository, Task, TaskEngine,
    TaskOutcome, TaskRepository, TaskStatus, TaskStep, WorkerPool, TIME_LIMIT_ERROR,
};
use hive::llm::MockLlmClient;
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_task_runs_to_completion() {
    let mut h = harness(settings(), MockLlmClient::new());
    let agent = h.agent("researcher").await;
    let task = h.engine.create_task(Task::new(&agent.id, "say hello")).await.unwrap();

    let jobs = h.drain_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].task_id, task.id);

    h.llm.push_json(plan_json(&[("hello", Some("echo")), ("world", Some("echo"))]));
    h.llm.push_json(reflection_json(true));

    let done = h.engine.dispatch(&agent.id, &task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.results.len(), 2);
    assert!(done.results.iter().all(|r| r.success));
    assert!(done.error.is_none());
    assert!(done.reflection.as_ref().is_some_and(|r| r.success));
    let started = done.started_at.unwrap();
    let completed = done.completed_at.unwrap();
    assert!(completed >= started);

    let steps = h.engine.task_steps(&task.id).await.unwrap();
    let numbers: Vec<u32> = steps.iter().map(|s| s.step_number).collect();
    assert_eq!(numbers, vec![1, 2]);
    assert_eq!(steps[0].tool.as_deref(), Some("echo"));
    assert!(done.meta_data.last_heartbeat.is_some());

    let agent = h.engine.get_agent(&agent.id).await.unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);
    assert!(agent.current_task_id.is_none());

    let state = h.engine.agent_state(&agent.id).await.unwrap().unwrap();
    assert_eq!(state["status"], json!("idle"));
}

#[tokio::test]
async fn test_redelivery_of_finished_task_is_noop() {
    let h = harness(settings(), MockLlmClient::new());
    let agent = h.agent("a").await;
    let task = h.engine.create_task(Task::new(&agent.id, "once")).await.unwrap();

    h.llm.push_json(plan_json(&[("only", Some("echo"))]));
    h.llm.push_json(reflection_json(true));
    let first = h.engine.dispatch(&agent.id, &task.id).await.unwrap();
    let calls = h.llm.call_count();

    let again = h.engine.dispatch(&agent.id, &task.id).await.unwrap();
    assert_eq!(again.status, TaskStatus::Completed);
    assert_eq!(again.completed_at, first.completed_at);
    assert_eq!(again.results.len(), first.results.len());
    assert_eq!(h.llm.call_count(), calls);
    assert_eq!(h.engine.task_steps(&task.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_tool_does_not_fail_task() {
    let h = harness(settings(), MockLlmClient::new());
    let agent = h.agent("a").await;
    let task = h.engine.create_task(Task::new(&agent.id, "mixed")).await.unwrap();

    h.llm.push_json(plan_json(&[("lookup", Some("no_such_tool")), ("echo it", Some("echo"))]));
    h.llm.push_json(reflection_json(false));
    let done = h.engine.dispatch(&agent.id, &task.id).await.unwrap();

    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.results.len(), 2);
    assert!(!done.results[0].success);
    assert_eq!(done.results[0].error.as_deref(), Some("Tool 'no_such_tool' not found"));
    assert!(done.results[1].success);

    let steps = h.engine.task_steps(&task.id).await.unwrap();
    assert_eq!(steps[0].status, TaskStatus::Failed);
    assert_eq!(steps[1].status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_panic_fails_task_and_releases_agent() {
    let h = harness(settings(), MockLlmClient::new());
    let agent = h.agent("a").await;
    let task = h.engine.create_task(Task::new(&agent.id, "boom")).await.unwrap();

    h.llm.push_json(plan_json(&[("fine", Some("echo")), ("blow up", Some("explode"))]));
    let done = h.engine.dispatch(&agent.id, &task.id).await.unwrap();

    assert_eq!(done.status, TaskStatus::Failed);
    assert!(done.error.as_deref().unwrap().contains("tool exploded"));
    assert!(done.completed_at.is_some());
    assert!(done.plan.is_some());
    assert_eq!(h.engine.task_steps(&task.id).await.unwrap().len(), 1);

    let agent = h.engine.get_agent(&agent.id).await.unwrap();
    assert!(agent.is_idle());
    assert_eq!(h.engine.cancels().active_count(), 0);
}

#[tokio::test]
async fn test_busy_agent_keeps_task_pending() {
    let h = harness(settings(), MockLlmClient::new());
    let agent = h.agent("a").await;
    let task = h.engine.create_task(Task::new(&agent.id, "wait")).await.unwrap();

    assert!(h.repo.try_claim_agent(&agent.id, "someone-else").await.unwrap());
    let err = h.engine.dispatch(&agent.id, &task.id).await.unwrap_err();
    assert!(matches!(err, EngineError::AgentBusy { attempts: 3, .. }));
    assert_eq!(h.engine.get_task(&task.id).await.unwrap().status, TaskStatus::Pending);
    assert_eq!(h.llm.call_count(), 0);

    h.repo.release_agent(&agent.id).await.unwrap();
    h.llm.push_json(plan_json(&[("go", Some("echo"))]));
    h.llm.push_json(reflection_json(true));
    let done = h.engine.dispatch(&agent.id, &task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_dispatch_rejects_foreign_agent() {
    let h = harness(settings(), MockLlmClient::new());
    let a = h.agent("a").await;
    let b = h.agent("b").await;
    let task = h.engine.create_task(Task::new(&a.id, "mine")).await.unwrap();

    let err = h.engine.dispatch(&b.id, &task.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Scheduler(_)));
    assert!(h.engine.get_agent(&b.id).await.unwrap().is_idle());
}

#[tokio::test]
async fn test_cancel_pending_task_skips_planning() {
    let h = harness(settings(), MockLlmClient::new());
    let agent = h.agent("a").await;
    let task = h.engine.create_task(Task::new(&agent.id, "never mind")).await.unwrap();

    assert!(h.engine.cancel_task(&task.id).await.unwrap());
    let done = h.engine.dispatch(&agent.id, &task.id).await.unwrap();

    assert_eq!(done.status, TaskStatus::Cancelled);
    assert!(done.results.is_empty());
    assert!(done.plan.is_none());
    assert_eq!(h.llm.call_count(), 0);
    assert!(!h.engine.cancel_task(&task.id).await.unwrap());
}

#[tokio::test]
async fn test_cancel_running_task_keeps_partial_results() {
    let llm = MockLlmClient::new().with_delay(Duration::from_millis(50));
    let h = harness(settings(), llm);
    let agent = h.agent("a").await;
    let task = h.engine.create_task(Task::new(&agent.id, "long job")).await.unwrap();

    let steps: Vec<(&str, Option<&str>)> = (0..5).map(|_| ("think", None)).collect();
    h.llm.push_json(plan_json(&steps));

    let mut events = h.engine.subscribe();
    let engine = h.engine.clone();
    let (agent_id, task_id) = (agent.id.clone(), task.id.clone());
    let run = tokio::spawn(async move { engine.dispatch(&agent_id, &task_id).await });

    loop {
        match events.recv().await.unwrap() {
            TaskEvent::StepCompleted { step_id: 1, .. } => break,
            _ => continue,
        }
    }
    assert!(h.engine.cancel_agent_task(&agent.id).await.unwrap());

    let done = run.await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Cancelled);
    assert!(done.error.is_none());
    assert!(!done.results.is_empty());
    assert!(done.results.len() < 5);
    assert!(done.completed_at.is_some());
    assert!(h.engine.get_agent(&agent.id).await.unwrap().is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_time_limit_cancels_with_partial_results() {
    let llm = MockLlmClient::new().with_delay(Duration::from_secs(40));
    let mut s = settings();
    s.max_execution_time = Duration::from_secs(100);
    let h = harness(s, llm);
    let agent = h.agent("a").await;
    let task = h.engine.create_task(Task::new(&agent.id, "slow")).await.unwrap();

    let steps: Vec<(&str, Option<&str>)> = (0..5).map(|_| ("think", None)).collect();
    h.llm.push_json(plan_json(&steps));
    h.llm.push_text("first");
    h.llm.push_text("second");
    h.llm.push_json(reflection_json(false));

    let done = h.engine.dispatch(&agent.id, &task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Cancelled);
    assert_eq!(done.error.as_deref(), Some(TIME_LIMIT_ERROR));
    assert_eq!(done.results.len(), 2);
    assert!(done.reflection.is_some());
}

#[tokio::test]
async fn test_failed_task_retried_until_limit() {
    let mut s = settings();
    s.max_retries = 1;
    let mut h = harness(s, MockLlmClient::new());
    let agent = h.agent("a").await;
    let task = h.engine.create_task(Task::new(&agent.id, "flaky")).await.unwrap();
    h.drain_jobs();

    h.llm.push_json(plan_json(&[("boom", Some("explode"))]));
    let failed = h.engine.dispatch(&agent.id, &task.id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.meta_data.retry_count, 0);

    assert_eq!(h.engine.retry_failed_tasks().await.unwrap(), 1);
    let requeued = h.engine.get_task(&task.id).await.unwrap();
    assert_eq!(requeued.status, TaskStatus::Pending);
    assert_eq!(requeued.meta_data.retry_count, 1);
    assert!(requeued.meta_data.last_retry.is_some());
    assert!(requeued.completed_at.is_none());
    assert!(requeued.error.is_none());
    assert_eq!(h.drain_jobs().len(), 1);

    h.llm.push_json(plan_json(&[("boom", Some("explode"))]));
    let failed = h.engine.dispatch(&agent.id, &task.id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);

    assert_eq!(h.engine.retry_failed_tasks().await.unwrap(), 0);
    assert_eq!(h.engine.get_task(&task.id).await.unwrap().status, TaskStatus::Failed);
    assert!(h.drain_jobs().is_empty());
}

#[tokio::test]
async fn test_scheduled_task_promoted_once() {
    let mut h = harness(settings(), MockLlmClient::new());
    let agent = h.agent("a").await;

    let later = h
        .engine
        .create_task(Task::new(&agent.id, "later").scheduled_at(Utc::now() + chrono::Duration::hours(1)))
        .await
        .unwrap();
    assert!(h.drain_jobs().is_empty());
    // 未到期的任务即使被投递也不会执行
    let untouched = h.engine.dispatch(&agent.id, &later.id).await.unwrap();
    assert_eq!(untouched.status, TaskStatus::Pending);

    let due = Task::new(&agent.id, "due").scheduled_at(Utc::now() - chrono::Duration::minutes(1));
    h.repo.insert_task(&due).await.unwrap();

    assert_eq!(h.engine.promote_scheduled_tasks().await.unwrap(), 1);
    let jobs = h.drain_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].task_id, due.id);
    assert!(h.engine.get_task(&due.id).await.unwrap().scheduled_for.is_none());

    assert_eq!(h.engine.promote_scheduled_tasks().await.unwrap(), 0);
    assert!(h.engine.get_task(&later.id).await.unwrap().scheduled_for.is_some());
}

#[tokio::test]
async fn test_cleanup_archives_before_delete() {
    let mut s = settings();
    s.retention = Duration::ZERO;
    let h = harness(s, MockLlmClient::new());
    let agent = h.agent("a").await;

    let done = h.engine.create_task(Task::new(&agent.id, "old")).await.unwrap();
    h.llm.push_json(plan_json(&[("one", Some("echo"))]));
    h.llm.push_json(reflection_json(true));
    h.engine.dispatch(&agent.id, &done.id).await.unwrap();

    let failed = h.engine.create_task(Task::new(&agent.id, "broken")).await.unwrap();
    h.llm.push_json(plan_json(&[("boom", Some("explode"))]));
    h.engine.dispatch(&agent.id, &failed.id).await.unwrap();

    let pending = h
        .engine
        .create_task(Task::new(&agent.id, "not yet").scheduled_at(Utc::now() + chrono::Duration::hours(1)))
        .await
        .unwrap();

    h.archive.set_failing(true);
    assert!(h.engine.cleanup_old_tasks().await.is_err());
    assert!(h.repo.get_task(&done.id).await.unwrap().is_some());

    h.archive.set_failing(false);
    let report = h.engine.cleanup_old_tasks().await.unwrap();
    assert_eq!(report.archived, 1);
    assert_eq!(report.deleted, 1);

    let records = h.archive.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].task.id, done.id);
    assert_eq!(records[0].steps.len(), 1);

    assert!(h.repo.get_task(&done.id).await.unwrap().is_none());
    assert!(h.engine.task_steps(&done.id).await.unwrap().is_empty());
    assert!(h.repo.get_task(&failed.id).await.unwrap().is_some());
    assert!(h.repo.get_task(&pending.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_recover_fails_orphans_and_resubmits_pending() {
    let mut h = harness(settings(), MockLlmClient::new());
    let agent = h.agent("a").await;
    let other = h.agent("b").await;

    let orphan = Task::new(&agent.id, "interrupted");
    h.repo.insert_task(&orphan).await.unwrap();
    assert!(h.repo.try_claim_agent(&agent.id, &orphan.id).await.unwrap());
    h.repo
        .transition_task(&orphan.id, TaskStatus::Running, Utc::now())
        .await
        .unwrap();

    let waiting = h.engine.create_task(Task::new(&other.id, "waiting")).await.unwrap();
    h.drain_jobs();

    assert_eq!(h.engine.recover().await.unwrap(), 1);

    let orphan = h.engine.get_task(&orphan.id).await.unwrap();
    assert_eq!(orphan.status, TaskStatus::Failed);
    assert!(orphan.error.is_some());
    assert!(h.engine.get_agent(&agent.id).await.unwrap().is_idle());

    let jobs = h.drain_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].task_id, waiting.id);
}

#[tokio::test]
async fn test_task_history_newest_first() {
    let h = harness(settings(), MockLlmClient::new());
    let agent = h.agent("a").await;

    let first = h.engine.create_task(Task::new(&agent.id, "first")).await.unwrap();
    h.llm.push_json(plan_json(&[("one", Some("echo"))]));
    h.llm.push_json(reflection_json(true));
    h.engine.dispatch(&agent.id, &first.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h.engine.create_task(Task::new(&agent.id, "second")).await.unwrap();

    let history = h.engine.task_history(&agent.id, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].task_id, second.id);
    assert_eq!(history[0].status, TaskStatus::Pending);
    assert_eq!(history[1].task_id, first.id);
    assert_eq!(history[1].success, Some(true));
    assert_eq!(history[1].steps, 1);

    assert_eq!(h.engine.task_history(&agent.id, 1).await.unwrap().len(), 1);
    assert!(matches!(
        h.engine.task_history("missing", 10).await,
        Err(EngineError::AgentNotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_agent_refused_while_busy() {
    let h = harness(settings(), MockLlmClient::new());
    let agent = h.agent("a").await;
    let task = h.engine.create_task(Task::new(&agent.id, "keep me")).await.unwrap();

    assert!(h.repo.try_claim_agent(&agent.id, &task.id).await.unwrap());
    assert!(matches!(
        h.engine.delete_agent(&agent.id).await,
        Err(EngineError::AgentActive(_))
    ));

    h.repo.release_agent(&agent.id).await.unwrap();
    assert!(h.engine.delete_agent(&agent.id).await.unwrap());
    assert!(h.repo.get_task(&task.id).await.unwrap().is_none());
    assert!(h.engine.agent_state(&agent.id).await.unwrap().is_none());
    assert!(!h.engine.delete_agent(&agent.id).await.unwrap());
}

#[tokio::test]
async fn test_health_report_counts_tasks() {
    let h = harness(settings(), MockLlmClient::new());
    let agent = h.agent("a").await;
    h.engine.create_task(Task::new(&agent.id, "one")).await.unwrap();
    h.engine.create_task(Task::new(&agent.id, "two")).await.unwrap();

    let report = HealthMonitor::new(h.engine.clone()).check().await;
    assert_eq!(report.status, HealthStatus::Healthy);
    assert!(report.repository.ok);
    assert!(report.memory.ok);
    assert_eq!(report.task_counts.get(&TaskStatus::Pending), Some(&2));
    assert_eq!(report.running_tasks, 0);
}

#[tokio::test]
async fn test_retried_task_continues_step_numbering() {
    let mut s = settings();
    s.max_retries = 2;
    let mut h = harness(s, MockLlmClient::new());
    let agent = h.agent("a").await;
    let task = h.engine.create_task(Task::new(&agent.id, "flaky")).await.unwrap();
    h.drain_jobs();

    h.llm.push_json(plan_json(&[("warm up", Some("echo")), ("boom", Some("explode"))]));
    let failed = h.engine.dispatch(&agent.id, &task.id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);

    assert_eq!(h.engine.retry_failed_tasks().await.unwrap(), 1);
    h.llm.push_json(plan_json(&[("warm up", Some("echo")), ("boom", Some("explode"))]));
    let failed = h.engine.dispatch(&agent.id, &task.id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);

    let numbers: Vec<u32> = h
        .repo
        .steps_for(&task.id)
        .await
        .unwrap()
        .iter()
        .map(|s| s.step_number)
        .collect();
    assert_eq!(numbers, vec![1, 2]);
}

#[tokio::test]
async fn test_retry_continues_past_submit_failure() {
    let mut h = harness(settings(), MockLlmClient::new());
    let agent = h.agent("a").await;
    let first = h.engine.create_task(Task::new(&agent.id, "first")).await.unwrap();
    let second = h.engine.create_task(Task::new(&agent.id, "second")).await.unwrap();
    h.drain_jobs();

    for task in [&first, &second] {
        h.llm.push_json(plan_json(&[("boom", Some("explode"))]));
        let failed = h.engine.dispatch(&agent.id, &task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
    }

    // 队列关闭后投递必然失败
    drop(h.jobs);
    assert_eq!(h.engine.retry_failed_tasks().await.unwrap(), 0);
    for task in [&first, &second] {
        let requeued = h.engine.get_task(&task.id).await.unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.meta_data.retry_count, 1);
    }
}

/// 迁移到 running 之后立刻收到取消请求
struct CancelOnStart {
    inner: Arc<InMemoryRepository>,
    engine: OnceLock<Weak<TaskEngine>>,
}

#[async_trait]
impl TaskRepository for CancelOnStart {
    async fn insert_agent(&self, agent: &Agent) -> Result<(), EngineError> {
        self.inner.insert_agent(agent).await
    }
    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, EngineError> {
        self.inner.get_agent(agent_id).await
    }
    async fn list_agents(&self) -> Result<Vec<Agent>, EngineError> {
        self.inner.list_agents().await
    }
    async fn delete_agent(&self, agent_id: &str) -> Result<bool, EngineError> {
        self.inner.delete_agent(agent_id).await
    }
    async fn try_claim_agent(&self, agent_id: &str, task_id: &str) -> Result<bool, EngineError> {
        self.inner.try_claim_agent(agent_id, task_id).await
    }
    async fn release_agent(&self, agent_id: &str) -> Result<Agent, EngineError> {
        self.inner.release_agent(agent_id).await
    }
    async fn insert_task(&self, task: &Task) -> Result<(), EngineError> {
        self.inner.insert_task(task).await
    }
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, EngineError> {
        self.inner.get_task(task_id).await
    }
    async fn transition_task(
        &self,
        task_id: &str,
        to: TaskStatus,
        at: DateTime<Utc>,
    ) -> Result<Task, EngineError> {
        let task = self.inner.transition_task(task_id, to, at).await?;
        if to == TaskStatus::Running {
            if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
                assert!(engine.cancel_task(task_id).await?);
            }
        }
        Ok(task)
    }
    async fn record_outcome(&self, task_id: &str, outcome: &TaskOutcome) -> Result<(), EngineError> {
        self.inner.record_outcome(task_id, outcome).await
    }
    async fn touch_heartbeat(&self, task_id: &str, at: DateTime<Utc>) -> Result<(), EngineError> {
        self.inner.touch_heartbeat(task_id, at).await
    }
    async fn request_cancel(&self, task_id: &str) -> Result<Task, EngineError> {
        self.inner.request_cancel(task_id).await
    }
    async fn requeue_failed(
        &self,
        task_id: &str,
        max_retries: u32,
        at: DateTime<Utc>,
    ) -> Result<Option<Task>, EngineError> {
        self.inner.requeue_failed(task_id, max_retries, at).await
    }
    async fn take_due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Task>, EngineError> {
        self.inner.take_due_scheduled(now).await
    }
    async fn failed_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, EngineError> {
        self.inner.failed_since(cutoff).await
    }
    async fn terminal_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Task>, EngineError> {
        self.inner.terminal_before(cutoff, limit).await
    }
    async fn dispatchable_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, EngineError> {
        self.inner.dispatchable_tasks(now).await
    }
    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>, EngineError> {
        self.inner.tasks_with_status(status).await
    }
    async fn tasks_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<Task>, EngineError> {
        self.inner.tasks_for_agent(agent_id, limit).await
    }
    async fn delete_task(&self, task_id: &str) -> Result<bool, EngineError> {
        self.inner.delete_task(task_id).await
    }
    async fn count_by_status(&self) -> Result<BTreeMap<TaskStatus, usize>, EngineError> {
        self.inner.count_by_status().await
    }
    async fn append_step(&self, step: &TaskStep) -> Result<(), EngineError> {
        self.inner.append_step(step).await
    }
    async fn steps_for(&self, task_id: &str) -> Result<Vec<TaskStep>, EngineError> {
        self.inner.steps_for(task_id).await
    }
}

#[tokio::test]
async fn test_cancel_right_after_start_is_honored() {
    let repo = Arc::new(InMemoryRepository::new());
    let wrapped = Arc::new(CancelOnStart {
        inner: repo.clone(),
        engine: OnceLock::new(),
    });
    let h = harness_with_repository(settings(), MockLlmClient::new(), repo, wrapped.clone());
    let _ = wrapped.engine.set(Arc::downgrade(&h.engine));

    let agent = h.agent("a").await;
    let task = h.engine.create_task(Task::new(&agent.id, "stop me")).await.unwrap();
    h.llm.push_json(plan_json(&[("never", Some("echo"))]));

    let done = h.engine.dispatch(&agent.id, &task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Cancelled);
    assert!(done.results.is_empty());
    assert_eq!(h.llm.call_count(), 0);
    assert_eq!(h.engine.get_agent(&agent.id).await.unwrap().status, AgentStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_worker_pool_redelivers_to_busy_agent() {
    let h = harness(settings(), MockLlmClient::new().with_delay(Duration::from_secs(5)));
    let agent = h.agent("a").await;
    for _ in 0..2 {
        h.llm.push_json(plan_json(&[("step", Some("echo"))]));
        h.llm.push_json(reflection_json(true));
    }
    let mut events = h.engine.subscribe();

    let first = h.engine.create_task(Task::new(&agent.id, "slow one")).await.unwrap();
    let second = h.engine.create_task(Task::new(&agent.id, "queued behind")).await.unwrap();

    let token = CancellationToken::new();
    let pool = WorkerPool::new(h.engine.clone(), h.scheduler.clone(), 2)
        .with_redelivery_delay(Duration::from_secs(1))
        .spawn(h.jobs, token.clone());

    let mut finished = false;
    for _ in 0..120 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let a = h.engine.get_task(&first.id).await.unwrap();
        let b = h.engine.get_task(&second.id).await.unwrap();
        if a.is_terminal() && b.is_terminal() {
            assert_eq!(a.status, TaskStatus::Completed);
            assert_eq!(b.status, TaskStatus::Completed);
            finished = true;
            break;
        }
    }
    assert!(finished);
    assert_eq!(h.llm.call_count(), 4);

    // 同一 Agent 上两个任务先后执行，没有重叠
    let mut lifecycle = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            TaskEvent::TaskStarted { task_id, .. } => lifecycle.push(("started", task_id)),
            TaskEvent::TaskFinished { task_id, .. } => lifecycle.push(("finished", task_id)),
            _ => {}
        }
    }
    assert_eq!(lifecycle.len(), 4);
    assert_eq!(lifecycle[0].0, "started");
    assert_eq!(lifecycle[1], ("finished", lifecycle[0].1.clone()));
    assert_eq!(lifecycle[2].0, "started");
    assert_ne!(lifecycle[2].1, lifecycle[0].1);
    assert_eq!(lifecycle[3], ("finished", lifecycle[2].1.clone()));

    token.cancel();
    pool.await.unwrap();
}
