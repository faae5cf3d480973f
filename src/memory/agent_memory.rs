//! Agent 作用域的记忆
//!
//! 每个 Agent 两个命名空间：`conversation:{agent_id}`（对话）与 `task_memory:{agent_id}`（计划、步骤结果、反思）。
//! 步骤结果先同步写入短期层（KV），再排入批量写入器进入长期层。
//! 进程内的最近缓存以 `{agent_id}:{task_id}` 为键，仅用于加速，删除或重启后失效；
//! 未命中时退回到按元数据过滤的扫描并按时间戳排序。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::core::MemoryError;
use crate::llm::Role;
use crate::memory::{BatchWriter, Filters, MemoryEntry, MemoryStore, Metadata, SearchHit};

pub fn conversation_namespace(agent_id: &str) -> String {
    format!("conversation:{}", agent_id)
}

pub fn task_namespace(agent_id: &str) -> String {
    format!("task_memory:{}", agent_id)
}

pub fn agent_state_key(agent_id: &str) -> String {
    format!("agent:{}", agent_id)
}

fn recency_key(agent_id: &str, task_id: &str) -> String {
    format!("{}:{}", agent_id, task_id)
}

fn base_metadata(agent_id: &str, task_id: Option<&str>, kind: &str) -> Metadata {
    let mut md = Metadata::new();
    md.insert("agent_id".into(), json!(agent_id));
    if let Some(task_id) = task_id {
        md.insert("task_id".into(), json!(task_id));
    }
    md.insert("type".into(), json!(kind));
    md
}

pub struct AgentMemory {
    store: Arc<MemoryStore>,
    batch: Arc<BatchWriter>,
    short_term_ttl: Duration,
    recency: RwLock<HashMap<String, Vec<MemoryEntry>>>,
}

impl AgentMemory {
    pub fn new(store: Arc<MemoryStore>, batch: Arc<BatchWriter>) -> Self {
        let short_term_ttl = store.config().default_ttl;
        Self {
            store,
            batch,
            short_term_ttl,
            recency: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_short_term_ttl(mut self, ttl: Duration) -> Self {
        self.short_term_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn batch(&self) -> &Arc<BatchWriter> {
        &self.batch
    }

    /// 持久化一个步骤结果：短期层立即可见，长期层随下一次批量 flush
    pub async fn record_step_result(
        &self,
        agent_id: &str,
        task_id: &str,
        step_id: u32,
        payload: Value,
    ) -> Result<String, MemoryError> {
        let mut md = base_metadata(agent_id, Some(task_id), "step_result");
        md.insert("step_id".into(), json!(step_id));
        let entry = MemoryEntry::new(task_namespace(agent_id), payload, md);
        let id = entry.id.clone();

        self.store
            .add_short_term(&entry, Some(self.short_term_ttl))
            .await?;
        self.remember(agent_id, task_id, entry.clone()).await;
        self.batch.queue_entry(entry).await?;
        Ok(id)
    }

    /// 只进短期层的任务记忆（如 plan / refined_plan）
    pub async fn record_task_memory(
        &self,
        agent_id: &str,
        task_id: &str,
        kind: &str,
        payload: Value,
        extra: Metadata,
    ) -> Result<String, MemoryError> {
        let mut md = base_metadata(agent_id, Some(task_id), kind);
        md.extend(extra);
        let entry = MemoryEntry::new(task_namespace(agent_id), payload, md);
        self.store
            .add_short_term(&entry, Some(self.short_term_ttl))
            .await?;
        let id = entry.id.clone();
        self.remember(agent_id, task_id, entry).await;
        Ok(id)
    }

    /// 直接进长期层（如 reflection）
    pub async fn record_long_term(
        &self,
        agent_id: &str,
        task_id: Option<&str>,
        kind: &str,
        payload: Value,
        extra: Metadata,
    ) -> Result<String, MemoryError> {
        let mut md = base_metadata(agent_id, task_id, kind);
        md.extend(extra);
        let entry = MemoryEntry::new(task_namespace(agent_id), payload, md);
        self.store.add_entry(&entry).await?;
        let id = entry.id.clone();
        if let Some(task_id) = task_id {
            self.remember(agent_id, task_id, entry).await;
        }
        Ok(id)
    }

    /// 只追加到已预热的键；未预热的键由首次读取通过扫描建立，避免缓存只含部分历史
    async fn remember(&self, agent_id: &str, task_id: &str, entry: MemoryEntry) {
        if let Some(entries) = self
            .recency
            .write()
            .await
            .get_mut(&recency_key(agent_id, task_id))
        {
            entries.push(entry);
        }
    }

    /// 某个任务的记忆，按时间从旧到新，最多返回最近 limit 条
    pub async fn task_memories(
        &self,
        agent_id: &str,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        let key = recency_key(agent_id, task_id);
        if let Some(cached) = self.recency.read().await.get(&key) {
            let skip = cached.len().saturating_sub(limit);
            return Ok(cached[skip..].to_vec());
        }

        let namespace = task_namespace(agent_id);
        let mut filters = Filters::new();
        filters.insert("task_id".into(), json!(task_id));

        let mut by_id: HashMap<String, MemoryEntry> = HashMap::new();
        for entry in self.store.scan_short_term(&namespace, &filters).await? {
            by_id.insert(entry.id.clone(), entry);
        }
        for record in self.store.index().scan(&namespace, &filters, usize::MAX).await? {
            if by_id.contains_key(&record.id) {
                continue;
            }
            if let Some(entry) = self.store.get(&record.id, &namespace).await? {
                by_id.insert(entry.id.clone(), entry);
            }
        }

        let mut entries: Vec<MemoryEntry> = by_id.into_values().collect();
        entries.sort_by(|a, b| {
            a.timestamp_millis()
                .cmp(&b.timestamp_millis())
                .then_with(|| step_of(a).cmp(&step_of(b)))
        });
        self.recency.write().await.insert(key, entries.clone());

        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }

    pub async fn add_conversation_turn(
        &self,
        agent_id: &str,
        role: Role,
        content: &str,
    ) -> Result<String, MemoryError> {
        let role = serde_json::to_value(&role)?;
        let mut md = base_metadata(agent_id, None, "conversation");
        md.insert("role".into(), role.clone());
        let entry = MemoryEntry::new(
            conversation_namespace(agent_id),
            json!({ "role": role, "content": content }),
            md,
        );
        let id = entry.id.clone();
        self.store
            .add_short_term(&entry, Some(self.short_term_ttl))
            .await?;
        self.batch.queue_entry(entry).await?;
        Ok(id)
    }

    /// 最近的对话，按时间从旧到新
    pub async fn recent_conversation(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        let mut entries = self
            .store
            .recent(&conversation_namespace(agent_id), limit)
            .await?;
        entries.reverse();
        Ok(entries)
    }

    /// 两个命名空间中最近的短期条目，新的在前
    pub async fn recent_short_term(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        let mut entries = self.store.recent(&task_namespace(agent_id), limit).await?;
        entries.extend(
            self.store
                .recent(&conversation_namespace(agent_id), limit)
                .await?,
        );
        entries.sort_by_key(|e| std::cmp::Reverse(e.timestamp_millis()));
        entries.truncate(limit);
        Ok(entries)
    }

    pub async fn search_long_term(
        &self,
        agent_id: &str,
        query: &str,
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        let mut filters = Filters::new();
        filters.insert("agent_id".into(), json!(agent_id));
        self.store
            .search(query, &task_namespace(agent_id), &filters, limit, min_score)
            .await
    }

    /// 把任务记忆中的一条短期条目提升到长期层
    pub async fn promote(
        &self,
        agent_id: &str,
        entry_id: &str,
        extra: Metadata,
    ) -> Result<String, MemoryError> {
        let namespace = task_namespace(agent_id);
        self.store
            .promote_to_long_term(entry_id, &namespace, &namespace, extra)
            .await
    }

    pub async fn delete_task_memories(
        &self,
        agent_id: &str,
        task_id: &str,
    ) -> Result<usize, MemoryError> {
        let namespace = task_namespace(agent_id);
        let task_value = json!(task_id);
        self.batch
            .discard_where(&namespace, |e| e.metadata.get("task_id") == Some(&task_value));

        let mut filters = Filters::new();
        filters.insert("task_id".into(), task_value.clone());
        let deleted = self.store.delete_by_metadata(&filters, &namespace).await?;
        self.recency
            .write()
            .await
            .remove(&recency_key(agent_id, task_id));
        Ok(deleted)
    }

    /// 删除 Agent 的全部记忆（两个命名空间、两层、待写队列、最近缓存、状态快照）
    pub async fn delete_agent_memories(&self, agent_id: &str) -> Result<usize, MemoryError> {
        let agent_value = json!(agent_id);
        let mut filters = Filters::new();
        filters.insert("agent_id".into(), agent_value.clone());

        let mut deleted = 0;
        for namespace in [task_namespace(agent_id), conversation_namespace(agent_id)] {
            self.batch
                .discard_where(&namespace, |e| e.metadata.get("agent_id") == Some(&agent_value));
            deleted += self.store.delete_by_metadata(&filters, &namespace).await?;
        }

        let prefix = format!("{}:", agent_id);
        self.recency
            .write()
            .await
            .retain(|key, _| !key.starts_with(&prefix));
        self.store.delete_value(&agent_state_key(agent_id)).await?;
        tracing::info!(agent_id, deleted, "agent memories deleted");
        Ok(deleted)
    }

    pub async fn save_agent_state(&self, agent_id: &str, state: Value) -> Result<(), MemoryError> {
        self.store
            .put_value(&agent_state_key(agent_id), state, None)
            .await
    }

    pub async fn load_agent_state(&self, agent_id: &str) -> Result<Option<Value>, MemoryError> {
        self.store.get_value(&agent_state_key(agent_id)).await
    }

    /// 仅清空进程内最近缓存（模拟重启）
    pub async fn clear_recency_cache(&self) {
        self.recency.write().await.clear();
    }
}

fn step_of(entry: &MemoryEntry) -> u64 {
    entry
        .metadata
        .get("step_id")
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HashingEmbedder;
    use crate::memory::{InMemoryKvCache, InMemoryVectorIndex, MemoryStoreConfig};

    fn agent_memory() -> (AgentMemory, Arc<BatchWriter>) {
        let index = Arc::new(InMemoryVectorIndex::new(Arc::new(HashingEmbedder::new(128)), 1000));
        let store = Arc::new(MemoryStore::new(
            Arc::new(InMemoryKvCache::new()),
            index,
            MemoryStoreConfig::default(),
        ));
        let batch = Arc::new(BatchWriter::new(store.clone(), Duration::from_secs(5)));
        (AgentMemory::new(store, batch.clone()), batch)
    }

    #[tokio::test]
    async fn test_step_results_visible_before_flush() {
        let (mem, batch) = agent_memory();
        for step in 1..=3 {
            mem.record_step_result("a1", "t1", step, json!({"step_id": step}))
                .await
                .unwrap();
        }
        assert_eq!(batch.pending(&task_namespace("a1")), 3);
        let entries = mem.task_memories("a1", "t1", 10).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].metadata["step_id"], json!(3));
    }

    #[tokio::test]
    async fn test_warm_cache_tracks_new_writes() {
        let (mem, _) = agent_memory();
        mem.record_step_result("a1", "t1", 1, json!("first")).await.unwrap();
        assert_eq!(mem.task_memories("a1", "t1", 10).await.unwrap().len(), 1);
        mem.record_step_result("a1", "t1", 2, json!("second")).await.unwrap();
        let entries = mem.task_memories("a1", "t1", 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].data, json!("second"));
    }

    #[tokio::test]
    async fn test_fallback_scan_after_cache_loss() {
        let (mem, batch) = agent_memory();
        for step in 1..=3 {
            mem.record_step_result("a1", "t1", step, json!(format!("result {step}")))
                .await
                .unwrap();
        }
        mem.record_step_result("a1", "t2", 1, json!("other task"))
            .await
            .unwrap();
        batch.flush_all().await.unwrap();
        mem.clear_recency_cache().await;

        let entries = mem.task_memories("a1", "t1", 2).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].metadata["step_id"], json!(2));
        assert_eq!(entries[1].metadata["step_id"], json!(3));
    }

    #[tokio::test]
    async fn test_delete_task_invalidates_recency() {
        let (mem, batch) = agent_memory();
        mem.record_step_result("a1", "t1", 1, json!("r")).await.unwrap();
        mem.delete_task_memories("a1", "t1").await.unwrap();
        assert_eq!(batch.pending(&task_namespace("a1")), 0);
        assert!(mem.task_memories("a1", "t1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conversation_order() {
        let (mem, _) = agent_memory();
        mem.add_conversation_turn("a1", Role::User, "hello").await.unwrap();
        mem.add_conversation_turn("a1", Role::Assistant, "hi there").await.unwrap();
        let turns = mem.recent_conversation("a1", 10).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].data["content"], json!("hello"));
        assert_eq!(turns[1].data["role"], json!("assistant"));
    }

    #[tokio::test]
    async fn test_delete_agent_removes_everything() {
        let (mem, batch) = agent_memory();
        mem.record_step_result("a1", "t1", 1, json!("r")).await.unwrap();
        mem.record_long_term("a1", Some("t1"), "reflection", json!({"success": true}), Metadata::new())
            .await
            .unwrap();
        mem.add_conversation_turn("a1", Role::User, "hey").await.unwrap();
        mem.save_agent_state("a1", json!({"status": "idle"})).await.unwrap();

        mem.delete_agent_memories("a1").await.unwrap();
        assert_eq!(batch.pending_total(), 0);
        assert!(mem.task_memories("a1", "t1", 10).await.unwrap().is_empty());
        assert!(mem.recent_conversation("a1", 10).await.unwrap().is_empty());
        assert!(mem.load_agent_state("a1").await.unwrap().is_none());
        assert!(mem
            .search_long_term("a1", "success", 5, 0.0)
            .await
            .unwrap()
            .is_empty());
    }
}
