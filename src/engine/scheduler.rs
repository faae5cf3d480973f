//! 调度与工作池
//!
//! [`Scheduler::submit`] 只负责投递 `(agent_id, task_id)`；投递至少一次，
//! 引擎对已终态任务的重复投递是幂等的。[`WorkerPool`] 从队列取作业，
//! 用 Semaphore 限制并发，Agent 忙碌导致派发失败时延迟后重新入队。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{EngineError, RecoveryAction, RecoveryEngine};
use crate::engine::TaskEngine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub agent_id: String,
    pub task_id: String,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn submit(&self, agent_id: &str, task_id: &str) -> Result<(), EngineError>;
}

/// 进程内队列
pub struct LocalScheduler {
    tx: mpsc::UnboundedSender<Job>,
}

impl LocalScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    async fn submit(&self, agent_id: &str, task_id: &str) -> Result<(), EngineError> {
        self.tx
            .send(Job {
                agent_id: agent_id.to_string(),
                task_id: task_id.to_string(),
            })
            .map_err(|_| EngineError::Scheduler("job queue closed".to_string()))?;
        tracing::debug!(agent_id, task_id, "job submitted");
        Ok(())
    }
}

pub struct WorkerPool {
    engine: Arc<TaskEngine>,
    scheduler: Arc<dyn Scheduler>,
    concurrency: usize,
    redelivery_delay: Duration,
}

impl WorkerPool {
    pub fn new(engine: Arc<TaskEngine>, scheduler: Arc<dyn Scheduler>, concurrency: usize) -> Self {
        Self {
            engine,
            scheduler,
            concurrency: concurrency.max(1),
            redelivery_delay: Duration::from_secs(5),
        }
    }

    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    pub fn spawn(self, rx: mpsc::UnboundedReceiver<Job>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(rx, token))
    }

    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Job>, token: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        tracing::info!(concurrency = self.concurrency, "worker pool started");

        loop {
            let job = tokio::select! {
                _ = token.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let engine = Arc::clone(&self.engine);
            let scheduler = Arc::clone(&self.scheduler);
            let delay = self.redelivery_delay;
            let token = token.clone();
            tokio::spawn(async move {
                let err = match engine.dispatch(&job.agent_id, &job.task_id).await {
                    Ok(task) => {
                        tracing::debug!(task_id = %task.id, status = %task.status, "job done");
                        return;
                    }
                    Err(e) => e,
                };
                if RecoveryEngine::new().classify(&err) != RecoveryAction::RetryDispatch {
                    tracing::error!(task_id = %job.task_id, error = %err, "dispatch failed");
                    return;
                }
                // Agent 仍忙：任务保持 pending，让出工作槽后稍后重新投递
                drop(permit);
                tracing::warn!(task_id = %job.task_id, error = %err, "agent busy, redelivering later");
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        if let Err(e) = scheduler.submit(&job.agent_id, &job.task_id).await {
                            tracing::error!(task_id = %job.task_id, error = %e, "redelivery failed");
                        }
                    }
                }
            });
        }
        tracing::info!("worker pool stopped");
    }
}
