//! 周期性维护循环：定时任务提升、失败重试、过期清理
//!
//! 每个循环独立运行，出错只记日志；根 token 取消后在下一个 tick 退出。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineSection;
use crate::core::EngineError;
use crate::engine::TaskEngine;

#[derive(Debug, Clone, Copy)]
pub struct MaintenanceIntervals {
    pub scheduled_scan: Duration,
    pub retry_scan: Duration,
    pub cleanup_scan: Duration,
}

impl From<&EngineSection> for MaintenanceIntervals {
    fn from(cfg: &EngineSection) -> Self {
        Self {
            scheduled_scan: Duration::from_secs(cfg.scheduled_scan_secs.max(1)),
            retry_scan: Duration::from_secs(cfg.retry_scan_secs.max(1)),
            cleanup_scan: Duration::from_secs(cfg.cleanup_scan_secs.max(1)),
        }
    }
}

/// 启动三个维护循环，返回句柄供关闭时等待
pub fn spawn_maintenance(
    engine: Arc<TaskEngine>,
    intervals: MaintenanceIntervals,
    token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let promote = {
        let engine = engine.clone();
        spawn_periodic("scheduled_promotion", intervals.scheduled_scan, token.clone(), move || {
            let engine = engine.clone();
            async move { engine.promote_scheduled_tasks().await.map(|_| ()) }
        })
    };
    let retry = {
        let engine = engine.clone();
        spawn_periodic("failed_retry", intervals.retry_scan, token.clone(), move || {
            let engine = engine.clone();
            async move { engine.retry_failed_tasks().await.map(|_| ()) }
        })
    };
    let cleanup = spawn_periodic("task_cleanup", intervals.cleanup_scan, token, move || {
        let engine = engine.clone();
        async move { engine.cleanup_old_tasks().await.map(|_| ()) }
    });
    vec![promote, retry, cleanup]
}

pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        tracing::info!(job = name, period_secs = period.as_secs(), "maintenance loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = job().await {
                        tracing::warn!(job = name, error = %e, "maintenance pass failed");
                    }
                }
            }
        }
        tracing::info!(job = name, "maintenance loop stopped");
    })
}
