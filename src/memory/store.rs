//! 双层记忆存储
//!
//! 组合 KV 缓存（短期，TTL）与向量索引（长期，相似度检索）：
//! - 写：`add` 总是写向量索引；开启结构化缓存时同时镜像到 KV，键为 `memory:{namespace}:{id}`
//! - 短期写：`add_short_term` 只写 KV，并登记到命名空间的最近条目有序集合
//! - 读：`search` 先查短 TTL 的结果缓存，未命中再查向量索引，并从 KV 回填完整负载（保留向量分数）
//! - 删：按 id 或按元数据批量删除，两层同时删除
//!
//! 写入或删除某命名空间后，该命名空间的检索结果缓存立即失效。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::config::MemorySection;
use crate::core::MemoryError;
use crate::memory::{
    tokenizer, Filters, KvCache, MemoryEntry, Metadata, SearchHit, VectorIndex, VectorRecord,
};

const MEMORY_PREFIX: &str = "memory";
const RECENT_PREFIX: &str = "recent";
const SEARCH_PREFIX: &str = "search";

pub fn memory_key(namespace: &str, id: &str) -> String {
    format!("{}:{}:{}", MEMORY_PREFIX, namespace, id)
}

fn recent_key(namespace: &str) -> String {
    format!("{}:{}", RECENT_PREFIX, namespace)
}

fn search_prefix(namespace: &str) -> String {
    format!("{}:{}:", SEARCH_PREFIX, namespace)
}

/// 检索缓存键：归一化查询 + 命名空间 + 过滤条件（BTreeMap 序列化顺序稳定）+ 条数
fn search_key(namespace: &str, query: &str, filters: &Filters, limit: usize) -> String {
    let filters = serde_json::to_string(filters).unwrap_or_default();
    format!(
        "{}{}|{}|{}",
        search_prefix(namespace),
        tokenizer::normalize_query(query),
        filters,
        limit
    )
}

#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    pub structured_caching: bool,
    pub default_ttl: Duration,
    pub search_cache_ttl: Duration,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self::from(&MemorySection::default())
    }
}

impl From<&MemorySection> for MemoryStoreConfig {
    fn from(cfg: &MemorySection) -> Self {
        Self {
            structured_caching: cfg.structured_caching,
            default_ttl: cfg.default_ttl(),
            search_cache_ttl: cfg.search_cache_ttl(),
        }
    }
}

pub struct MemoryStore {
    kv: Arc<dyn KvCache>,
    index: Arc<dyn VectorIndex>,
    config: MemoryStoreConfig,
}

impl MemoryStore {
    pub fn new(kv: Arc<dyn KvCache>, index: Arc<dyn VectorIndex>, config: MemoryStoreConfig) -> Self {
        Self { kv, index, config }
    }

    pub fn kv(&self) -> &Arc<dyn KvCache> {
        &self.kv
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn config(&self) -> &MemoryStoreConfig {
        &self.config
    }

    /// 长期写入：向量索引 +（可选）KV 镜像
    pub async fn add(
        &self,
        data: Value,
        metadata: Metadata,
        namespace: &str,
    ) -> Result<String, MemoryError> {
        let entry = MemoryEntry::new(namespace, data, metadata);
        self.add_entry(&entry).await?;
        Ok(entry.id)
    }

    pub async fn add_entry(&self, entry: &MemoryEntry) -> Result<(), MemoryError> {
        self.index
            .add(&entry.namespace, VectorRecord::from(entry))
            .await?;
        if self.config.structured_caching {
            self.cache_entry(entry, self.config.default_ttl).await?;
        }
        self.invalidate_search_cache(&entry.namespace).await?;
        tracing::debug!(namespace = %entry.namespace, id = %entry.id, "memory added");
        Ok(())
    }

    /// 批量写入同一命名空间（批量写入器 flush 时调用）
    pub async fn add_batch(&self, namespace: &str, entries: &[MemoryEntry]) -> Result<usize, MemoryError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let records = entries.iter().map(VectorRecord::from).collect();
        let written = self.index.add_batch(namespace, records).await?;
        if self.config.structured_caching {
            for entry in entries {
                self.cache_entry(entry, self.config.default_ttl).await?;
            }
        }
        self.invalidate_search_cache(namespace).await?;
        Ok(written)
    }

    /// 短期写入：只写 KV（带 TTL），并登记到最近条目有序集合
    pub async fn add_short_term(
        &self,
        entry: &MemoryEntry,
        ttl: Option<Duration>,
    ) -> Result<(), MemoryError> {
        self.cache_entry(entry, ttl.unwrap_or(self.config.default_ttl))
            .await
    }

    async fn cache_entry(&self, entry: &MemoryEntry, ttl: Duration) -> Result<(), MemoryError> {
        let value = serde_json::to_value(entry)?;
        self.kv
            .set(&memory_key(&entry.namespace, &entry.id), value, Some(ttl))
            .await?;
        self.kv
            .zadd(
                &recent_key(&entry.namespace),
                &entry.id,
                entry.timestamp_millis() as f64,
                Some(ttl),
            )
            .await
    }

    async fn cached_entry(&self, namespace: &str, id: &str) -> Result<Option<MemoryEntry>, MemoryError> {
        match self.kv.get(&memory_key(namespace, id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// 先查 KV，再查向量索引
    pub async fn get(&self, id: &str, namespace: &str) -> Result<Option<MemoryEntry>, MemoryError> {
        if let Some(entry) = self.cached_entry(namespace, id).await? {
            return Ok(Some(entry));
        }
        Ok(self.index.get(namespace, id).await?.map(|record| {
            let created_at = record
                .metadata
                .get("timestamp")
                .and_then(Value::as_i64)
                .and_then(chrono::DateTime::from_timestamp_millis)
                .unwrap_or_else(Utc::now);
            MemoryEntry {
                id: record.id,
                namespace: namespace.to_string(),
                data: Value::String(record.text.clone()),
                metadata: record.metadata,
                text: record.text,
                created_at,
            }
        }))
    }

    pub async fn search(
        &self,
        query: &str,
        namespace: &str,
        filters: &Filters,
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        let cache_key = search_key(namespace, query, filters, limit);
        if let Some(cached) = self.kv.get(&cache_key).await? {
            let hits: Vec<SearchHit> = serde_json::from_value(cached)?;
            tracing::debug!(namespace, "search cache hit");
            return Ok(hits.into_iter().filter(|h| h.score >= min_score).collect());
        }

        let raw = self.index.query(namespace, query, filters, limit).await?;
        let mut hits = Vec::with_capacity(raw.len());
        for hit in raw {
            let full = if self.config.structured_caching {
                self.cached_entry(namespace, &hit.id).await?
            } else {
                None
            };
            hits.push(match full {
                Some(entry) => SearchHit {
                    id: hit.id,
                    namespace: namespace.to_string(),
                    text: entry.text,
                    data: entry.data,
                    metadata: entry.metadata,
                    score: hit.score,
                },
                None => SearchHit {
                    id: hit.id,
                    namespace: namespace.to_string(),
                    data: Value::String(hit.text.clone()),
                    text: hit.text,
                    metadata: hit.metadata,
                    score: hit.score,
                },
            });
        }

        self.kv
            .set(
                &cache_key,
                serde_json::to_value(&hits)?,
                Some(self.config.search_cache_ttl),
            )
            .await?;

        Ok(hits.into_iter().filter(|h| h.score >= min_score).collect())
    }

    /// 命名空间内最近的短期条目（新的在前）；已过期的成员顺带从有序集合移除
    pub async fn recent(&self, namespace: &str, limit: usize) -> Result<Vec<MemoryEntry>, MemoryError> {
        let key = recent_key(namespace);
        let mut out = Vec::with_capacity(limit);
        // 多取一些，抵消已过期的成员
        let ids = self.kv.zrange_desc(&key, limit.saturating_mul(2).max(limit + 8)).await?;
        for id in ids {
            if out.len() >= limit {
                break;
            }
            match self.cached_entry(namespace, &id).await? {
                Some(entry) => out.push(entry),
                None => self.kv.zrem(&key, &id).await?,
            }
        }
        Ok(out)
    }

    /// 命名空间内所有未过期的短期条目中满足过滤条件的部分
    pub async fn scan_short_term(
        &self,
        namespace: &str,
        filters: &Filters,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        let prefix = format!("{}:{}:", MEMORY_PREFIX, namespace);
        let mut out = Vec::new();
        for key in self.kv.scan_prefix(&prefix).await? {
            if let Some(value) = self.kv.get(&key).await? {
                let entry: MemoryEntry = serde_json::from_value(value)?;
                if entry.namespace == namespace && entry.matches(filters) {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    /// 按 id 删除（两层）
    pub async fn delete(&self, id: &str, namespace: &str) -> Result<bool, MemoryError> {
        let from_index = self.index.delete(namespace, id).await?;
        let from_cache = self.kv.delete(&memory_key(namespace, id)).await?;
        self.kv.zrem(&recent_key(namespace), id).await?;
        self.invalidate_search_cache(namespace).await?;
        Ok(from_index || from_cache)
    }

    /// 按元数据过滤批量删除（两层），返回删除条数
    pub async fn delete_by_metadata(
        &self,
        filters: &Filters,
        namespace: &str,
    ) -> Result<usize, MemoryError> {
        let mut ids = self.index.delete_by_metadata(namespace, filters).await?;
        for entry in self.scan_short_term(namespace, filters).await? {
            ids.push(entry.id);
        }
        ids.sort();
        ids.dedup();

        let recent = recent_key(namespace);
        for id in &ids {
            self.kv.delete(&memory_key(namespace, id)).await?;
            self.kv.zrem(&recent, id).await?;
        }
        self.invalidate_search_cache(namespace).await?;
        tracing::info!(namespace, deleted = ids.len(), "memories deleted by metadata");
        Ok(ids.len())
    }

    /// 元数据补丁：条目唯一允许的修改
    pub async fn patch_metadata(
        &self,
        id: &str,
        namespace: &str,
        patch: &Metadata,
    ) -> Result<bool, MemoryError> {
        // id / timestamp 不可改
        let patch: Metadata = patch
            .iter()
            .filter(|(k, _)| k.as_str() != "id" && k.as_str() != "timestamp")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let in_index = self.index.update_metadata(namespace, id, &patch).await?;
        let key = memory_key(namespace, id);
        let in_cache = match self.cached_entry(namespace, id).await? {
            Some(mut entry) => {
                entry.metadata.extend(patch);
                // 保持原有 TTL 语义：重新写入时使用默认 TTL
                self.kv
                    .set(&key, serde_json::to_value(&entry)?, Some(self.config.default_ttl))
                    .await?;
                true
            }
            None => false,
        };
        if in_index || in_cache {
            self.invalidate_search_cache(namespace).await?;
        }
        Ok(in_index || in_cache)
    }

    /// 把短期条目复制进长期层（target_namespace），打上 promoted_from / promoted_at 标签，
    /// 并在源条目上记录 promoted_to
    pub async fn promote_to_long_term(
        &self,
        id: &str,
        namespace: &str,
        target_namespace: &str,
        extra: Metadata,
    ) -> Result<String, MemoryError> {
        let source = self
            .cached_entry(namespace, id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(memory_key(namespace, id)))?;

        let mut metadata: Metadata = source
            .metadata
            .iter()
            .filter(|(k, _)| k.as_str() != "id" && k.as_str() != "timestamp")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        metadata.extend(extra);
        metadata.insert("promoted_from".into(), Value::String(id.to_string()));
        metadata.insert("promoted_at".into(), Value::String(Utc::now().to_rfc3339()));

        let new_id = self.add(source.data.clone(), metadata, target_namespace).await?;

        let mut patch = Metadata::new();
        patch.insert("promoted".into(), Value::Bool(true));
        patch.insert("promoted_to".into(), Value::String(new_id.clone()));
        self.patch_metadata(id, namespace, &patch).await?;

        tracing::info!(namespace, id, new_id = %new_id, "memory promoted to long-term");
        Ok(new_id)
    }

    pub async fn list_namespaces(&self) -> Result<Vec<String>, MemoryError> {
        self.index.list_namespaces().await
    }

    /// 非记忆类的 KV 读写（如 Agent 状态快照）
    pub async fn put_value(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), MemoryError> {
        self.kv.set(key, value, ttl).await
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<Value>, MemoryError> {
        self.kv.get(key).await
    }

    pub async fn delete_value(&self, key: &str) -> Result<bool, MemoryError> {
        self.kv.delete(key).await
    }

    async fn invalidate_search_cache(&self, namespace: &str) -> Result<(), MemoryError> {
        for key in self.kv.scan_prefix(&search_prefix(namespace)).await? {
            self.kv.delete(&key).await?;
        }
        Ok(())
    }
}
