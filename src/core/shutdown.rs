//! 优雅关闭
//!
//! 收到 SIGINT / SIGTERM 后：
//! - 取消根 token，后台循环（批量写入、定时提升、失败重试、清理、健康检查）在下一个 tick 退出
//! - 按注册顺序执行清理任务（先停循环，再 flush 批量写入队列）
//! - 每个清理任务都有超时，超时只记日志，不阻塞退出

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::memory::BatchWriter;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    /// 根取消 token
    shutdown_token: CancellationToken,
    /// 关闭原因广播
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 致命错误
    FatalError(String),
}

impl ShutdownManager {
    /// 创建新的关闭管理器
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 根 token；后台循环与任务取消注册表都从它派生子 token
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 触发关闭：先广播原因，再取消根 token
    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    /// 是否已触发关闭
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// 订阅关闭原因
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    /// 等待关闭信号
    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    /// 执行清理；失败只记日志，不影响后续清理任务
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    /// 单个清理任务的超时时间（秒）
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    /// 创建新的关闭协调器，默认超时 10 秒
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout_secs: 10,
        }
    }

    /// 设置清理超时时间
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// 注册清理任务，按注册顺序执行
    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行所有清理任务
    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {}s", name, self.timeout_secs);
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
    }

    /// 获取关闭管理器
    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 等待后台循环退出（循环在根 token 取消后自行结束）
pub struct BackgroundLoopsCleanup {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundLoopsCleanup {
    pub fn new(handles: Vec<JoinHandle<()>>) -> Self {
        Self {
            handles: Mutex::new(handles),
        }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for BackgroundLoopsCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Background loop ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "BackgroundLoops"
    }
}

/// 退出前把批量写入队列中剩余的记忆落到向量索引
pub struct BatchFlushCleanup {
    writer: Arc<BatchWriter>,
}

impl BatchFlushCleanup {
    pub fn new(writer: Arc<BatchWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for BatchFlushCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let flushed = self.writer.flush_all().await?;
        tracing::info!("Flushed {} pending memory writes", flushed);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "BatchWriter"
    }
}
