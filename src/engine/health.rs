//! 健康报告
//!
//! 按固定周期汇总仓库、记忆后端与批量队列的状态，只写日志，不改任务或 Agent 状态。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::{TaskEngine, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub repository: ComponentHealth,
    pub memory: ComponentHealth,
    pub task_counts: BTreeMap<TaskStatus, usize>,
    pub running_tasks: usize,
    pub pending_batch_writes: usize,
    pub checked_at: DateTime<Utc>,
}

pub struct HealthMonitor {
    engine: Arc<TaskEngine>,
}

impl HealthMonitor {
    pub fn new(engine: Arc<TaskEngine>) -> Self {
        Self { engine }
    }

    pub async fn check(&self) -> HealthReport {
        let started = std::time::Instant::now();
        let counts = self.engine.repository().count_by_status().await;
        let repository = ComponentHealth {
            ok: counts.is_ok(),
            error: counts.as_ref().err().map(|e| e.to_string()),
            latency_ms: started.elapsed().as_millis() as u64,
        };

        let started = std::time::Instant::now();
        let namespaces = self.engine.memory().store().list_namespaces().await;
        let memory = ComponentHealth {
            ok: namespaces.is_ok(),
            error: namespaces.err().map(|e| e.to_string()),
            latency_ms: started.elapsed().as_millis() as u64,
        };

        let status = if repository.ok && memory.ok {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            repository,
            memory,
            task_counts: counts.unwrap_or_default(),
            running_tasks: self.engine.cancels().active_count(),
            pending_batch_writes: self.engine.memory().batch().pending_total(),
            checked_at: Utc::now(),
        }
    }

    pub fn spawn(self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.check().await;
                        let summary = serde_json::to_string(&report).unwrap_or_default();
                        match report.status {
                            HealthStatus::Healthy => tracing::info!(report = %summary, "health check"),
                            HealthStatus::Degraded => tracing::warn!(report = %summary, "health check degraded"),
                        }
                    }
                }
            }
        })
    }
}
