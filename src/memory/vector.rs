//! 向量索引能力（长期记忆层）
//!
//! 按命名空间分区（collection），支持单条 / 批量写入、相似度检索（可按元数据过滤）、
//! 按 id 读删、按元数据批量删除、元数据补丁。
//! 内置实现为进程内存储 + 余弦相似度；分数换算为 [0, 1]：score = (1 + cos) / 2。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::MemoryError;
use crate::llm::EmbeddingProvider;
use crate::memory::{matches_filters, Filters, Metadata, VectorHit, VectorRecord};

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn add(&self, namespace: &str, record: VectorRecord) -> Result<(), MemoryError>;

    async fn add_batch(&self, namespace: &str, records: Vec<VectorRecord>)
        -> Result<usize, MemoryError>;

    async fn query(
        &self,
        namespace: &str,
        text: &str,
        filters: &Filters,
        k: usize,
    ) -> Result<Vec<VectorHit>, MemoryError>;

    async fn get(&self, namespace: &str, id: &str) -> Result<Option<VectorRecord>, MemoryError>;

    async fn delete(&self, namespace: &str, id: &str) -> Result<bool, MemoryError>;

    /// 返回被删除的 id
    async fn delete_by_metadata(
        &self,
        namespace: &str,
        filters: &Filters,
    ) -> Result<Vec<String>, MemoryError>;

    /// 不做相似度计算的元数据过滤扫描
    async fn scan(
        &self,
        namespace: &str,
        filters: &Filters,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, MemoryError>;

    /// 合并元数据补丁；记录不存在时返回 false
    async fn update_metadata(
        &self,
        namespace: &str,
        id: &str,
        patch: &Metadata,
    ) -> Result<bool, MemoryError>;

    async fn list_namespaces(&self) -> Result<Vec<String>, MemoryError>;
}

struct Stored {
    record: VectorRecord,
    embedding: Vec<f32>,
    seq: u64,
}

pub struct InMemoryVectorIndex {
    embedder: Arc<dyn EmbeddingProvider>,
    collections: RwLock<HashMap<String, HashMap<String, Stored>>>,
    /// 单个命名空间的条目上限，超出时淘汰最早写入的
    max_entries: usize,
    seq: AtomicUsize,
    query_calls: AtomicUsize,
    batch_calls: AtomicUsize,
}

impl InMemoryVectorIndex {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, max_entries: usize) -> Self {
        Self {
            embedder,
            collections: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
            seq: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
        }
    }

    /// query 被调用的次数（用于验证检索缓存命中）
    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub async fn len(&self, namespace: &str) -> usize {
        self.collections
            .read()
            .await
            .get(namespace)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) as u64
    }

    fn evict_oldest(&self, collection: &mut HashMap<String, Stored>) {
        while collection.len() > self.max_entries {
            let oldest = collection
                .iter()
                .min_by_key(|(_, s)| s.seq)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    collection.remove(&id);
                }
                None => break,
            }
        }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn add(&self, namespace: &str, record: VectorRecord) -> Result<(), MemoryError> {
        let embedding = self.embedder.embed(&record.text).await?;
        let mut collections = self.collections.write().await;
        let collection = collections.entry(namespace.to_string()).or_default();
        collection.insert(
            record.id.clone(),
            Stored {
                record,
                embedding,
                seq: self.next_seq(),
            },
        );
        self.evict_oldest(collection);
        Ok(())
    }

    async fn add_batch(
        &self,
        namespace: &str,
        records: Vec<VectorRecord>,
    ) -> Result<usize, MemoryError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if records.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = records.iter().map(|r| r.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        if embeddings.len() != records.len() {
            return Err(MemoryError::Backend(format!(
                "embedding count mismatch: {} records, {} embeddings",
                records.len(),
                embeddings.len()
            )));
        }

        let count = records.len();
        let mut collections = self.collections.write().await;
        let collection = collections.entry(namespace.to_string()).or_default();
        for (record, embedding) in records.into_iter().zip(embeddings) {
            collection.insert(
                record.id.clone(),
                Stored {
                    record,
                    embedding,
                    seq: self.next_seq(),
                },
            );
        }
        self.evict_oldest(collection);
        Ok(count)
    }

    async fn query(
        &self,
        namespace: &str,
        text: &str,
        filters: &Filters,
        k: usize,
    ) -> Result<Vec<VectorHit>, MemoryError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let query_embedding = self.embedder.embed(text).await?;

        let collections = self.collections.read().await;
        let Some(collection) = collections.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<VectorHit> = collection
            .values()
            .filter(|s| matches_filters(&s.record.metadata, filters))
            .map(|s| VectorHit {
                id: s.record.id.clone(),
                text: s.record.text.clone(),
                metadata: s.record.metadata.clone(),
                score: (1.0 + cosine_similarity(&query_embedding, &s.embedding)) / 2.0,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn get(&self, namespace: &str, id: &str) -> Result<Option<VectorRecord>, MemoryError> {
        Ok(self
            .collections
            .read()
            .await
            .get(namespace)
            .and_then(|c| c.get(id))
            .map(|s| s.record.clone()))
    }

    async fn delete(&self, namespace: &str, id: &str) -> Result<bool, MemoryError> {
        Ok(self
            .collections
            .write()
            .await
            .get_mut(namespace)
            .and_then(|c| c.remove(id))
            .is_some())
    }

    async fn delete_by_metadata(
        &self,
        namespace: &str,
        filters: &Filters,
    ) -> Result<Vec<String>, MemoryError> {
        let mut collections = self.collections.write().await;
        let Some(collection) = collections.get_mut(namespace) else {
            return Ok(Vec::new());
        };
        let ids: Vec<String> = collection
            .iter()
            .filter(|(_, s)| matches_filters(&s.record.metadata, filters))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            collection.remove(id);
        }
        Ok(ids)
    }

    async fn scan(
        &self,
        namespace: &str,
        filters: &Filters,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, MemoryError> {
        let collections = self.collections.read().await;
        let Some(collection) = collections.get(namespace) else {
            return Ok(Vec::new());
        };
        let mut matched: Vec<&Stored> = collection
            .values()
            .filter(|s| matches_filters(&s.record.metadata, filters))
            .collect();
        matched.sort_by_key(|s| s.seq);
        Ok(matched
            .into_iter()
            .take(limit)
            .map(|s| s.record.clone())
            .collect())
    }

    async fn update_metadata(
        &self,
        namespace: &str,
        id: &str,
        patch: &Metadata,
    ) -> Result<bool, MemoryError> {
        let mut collections = self.collections.write().await;
        match collections.get_mut(namespace).and_then(|c| c.get_mut(id)) {
            Some(stored) => {
                for (k, v) in patch {
                    stored.record.metadata.insert(k.clone(), v.clone());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, MemoryError> {
        let mut names: Vec<String> = self
            .collections
            .read()
            .await
            .iter()
            .filter(|(_, c)| !c.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HashingEmbedder;
    use serde_json::json;

    fn record(id: &str, text: &str, agent: &str) -> VectorRecord {
        let mut metadata = Metadata::new();
        metadata.insert("id".into(), json!(id));
        metadata.insert("agent_id".into(), json!(agent));
        VectorRecord {
            id: id.into(),
            text: text.into(),
            metadata,
        }
    }

    fn index(max: usize) -> InMemoryVectorIndex {
        InMemoryVectorIndex::new(Arc::new(HashingEmbedder::new(128)), max)
    }

    #[tokio::test]
    async fn test_query_ranks_by_similarity_and_filters() {
        let idx = index(100);
        idx.add("ns", record("1", "weather report sunny", "a")).await.unwrap();
        idx.add("ns", record("2", "kernel compile errors", "a")).await.unwrap();
        idx.add("ns", record("3", "weather forecast rain", "b")).await.unwrap();

        let hits = idx
            .query("ns", "weather report", &Filters::new(), 10)
            .await
            .unwrap();
        assert_eq!(hits[0].id, "1");
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));

        let mut f = Filters::new();
        f.insert("agent_id".into(), json!("b"));
        let hits = idx.query("ns", "weather", &f, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "3");
        assert_eq!(idx.query_calls(), 2);
    }

    #[tokio::test]
    async fn test_delete_by_metadata() {
        let idx = index(100);
        idx.add_batch(
            "ns",
            vec![record("1", "x one", "a"), record("2", "x two", "a"), record("3", "x three", "b")],
        )
        .await
        .unwrap();
        let mut f = Filters::new();
        f.insert("agent_id".into(), json!("a"));
        let mut deleted = idx.delete_by_metadata("ns", &f).await.unwrap();
        deleted.sort();
        assert_eq!(deleted, vec!["1", "2"]);
        assert_eq!(idx.len("ns").await, 1);
    }

    #[tokio::test]
    async fn test_eviction_keeps_newest() {
        let idx = index(2);
        for i in 0..3 {
            idx.add("ns", record(&i.to_string(), "text body", "a")).await.unwrap();
        }
        assert!(idx.get("ns", "0").await.unwrap().is_none());
        assert!(idx.get("ns", "2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_metadata_and_namespaces() {
        let idx = index(10);
        idx.add("b-ns", record("1", "hello world", "a")).await.unwrap();
        idx.add("a-ns", record("2", "hello there", "a")).await.unwrap();
        let mut patch = Metadata::new();
        patch.insert("promoted".into(), json!(true));
        assert!(idx.update_metadata("b-ns", "1", &patch).await.unwrap());
        assert!(!idx.update_metadata("b-ns", "missing", &patch).await.unwrap());
        let rec = idx.get("b-ns", "1").await.unwrap().unwrap();
        assert_eq!(rec.metadata["promoted"], json!(true));
        assert_eq!(idx.list_namespaces().await.unwrap(), vec!["a-ns", "b-ns"]);
    }
}
