//! 批量写入器
//!
//! 调用方用 `queue_for_batch` 代替同步写入；后台循环每个 tick 把各命名空间的待写队列
//! 通过向量索引的批量接口一次写入。每个命名空间有独立的 flush 锁，
//! 同一命名空间的 flush 串行，不同命名空间可并发。写入失败时条目放回队首，等下个 tick 重试。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::MemoryError;
use crate::memory::{MemoryEntry, MemoryStore, Metadata};

#[derive(Default)]
struct NamespaceQueue {
    pending: Mutex<Vec<MemoryEntry>>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl NamespaceQueue {
    fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

pub struct BatchWriter {
    store: Arc<MemoryStore>,
    queues: Mutex<HashMap<String, Arc<NamespaceQueue>>>,
    interval: Duration,
    /// 大于 0 时，单命名空间队列达到此长度立即 flush
    max_batch: usize,
}

impl BatchWriter {
    pub fn new(store: Arc<MemoryStore>, interval: Duration) -> Self {
        Self {
            store,
            queues: Mutex::new(HashMap::new()),
            interval,
            max_batch: 0,
        }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn queue(&self, namespace: &str) -> Arc<NamespaceQueue> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(namespace.to_string())
            .or_default()
            .clone()
    }

    /// 入队，返回条目 id（写入索引前即可引用）
    pub async fn queue_for_batch(
        &self,
        data: Value,
        metadata: Metadata,
        namespace: &str,
    ) -> Result<String, MemoryError> {
        let entry = MemoryEntry::new(namespace, data, metadata);
        let id = entry.id.clone();
        self.queue_entry(entry).await?;
        Ok(id)
    }

    pub async fn queue_entry(&self, entry: MemoryEntry) -> Result<(), MemoryError> {
        let namespace = entry.namespace.clone();
        let queue = self.queue(&namespace);
        let len = {
            let mut pending = queue.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.push(entry);
            pending.len()
        };
        if self.max_batch > 0 && len >= self.max_batch {
            self.flush_namespace(&namespace).await?;
        }
        Ok(())
    }

    pub fn pending(&self, namespace: &str) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(namespace)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn pending_total(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|q| q.len())
            .sum()
    }

    /// 丢弃命名空间中尚未写入的条目（删除 Agent 时使用，避免删除后又被写回）
    pub fn discard_where(&self, namespace: &str, pred: impl Fn(&MemoryEntry) -> bool) -> usize {
        let Some(queue) = self
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(namespace)
            .cloned()
        else {
            return 0;
        };
        let mut pending = queue.pending.lock().unwrap_or_else(|e| e.into_inner());
        let before = pending.len();
        pending.retain(|e| !pred(e));
        before - pending.len()
    }

    pub async fn flush_namespace(&self, namespace: &str) -> Result<usize, MemoryError> {
        let queue = self.queue(namespace);
        let _guard = queue.flush_lock.lock().await;

        let batch = std::mem::take(&mut *queue.pending.lock().unwrap_or_else(|e| e.into_inner()));
        if batch.is_empty() {
            return Ok(0);
        }

        match self.store.add_batch(namespace, &batch).await {
            Ok(written) => {
                tracing::debug!(namespace, written, "batch flushed");
                Ok(written)
            }
            Err(e) => {
                tracing::warn!(namespace, error = %e, count = batch.len(), "batch flush failed, requeued");
                let mut pending = queue.pending.lock().unwrap_or_else(|e| e.into_inner());
                let newer = std::mem::take(&mut *pending);
                *pending = batch;
                pending.extend(newer);
                Err(e)
            }
        }
    }

    /// flush 所有命名空间（并发），返回写入总数；任一失败时返回第一个错误
    pub async fn flush_all(&self) -> Result<usize, MemoryError> {
        let namespaces: Vec<String> = self
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, q)| q.len() > 0)
            .map(|(ns, _)| ns.clone())
            .collect();

        let results = join_all(namespaces.iter().map(|ns| self.flush_namespace(ns))).await;
        let mut total = 0;
        let mut first_err = None;
        for result in results {
            match result {
                Ok(n) => total += n,
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// 后台 flush 循环，token 取消后退出（剩余条目由关闭清理任务 flush）
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval 的第一个 tick 立即完成
        ticker.tick().await;
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "batch writer started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_all().await {
                        tracing::warn!("Batch flush tick failed: {}", e);
                    }
                }
            }
        }
        tracing::info!("batch writer stopped");
    }
}
