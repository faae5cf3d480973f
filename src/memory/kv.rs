//! KV 缓存能力（短期记忆层）
//!
//! 按键精确读写、TTL 过期、前缀扫描，以及用于"最近条目"的有序集合。
//! 内置实现为进程内 HashMap；过期时间基于 tokio::time::Instant，测试可用 pause/advance 控制。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::core::MemoryError;

#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, MemoryError>;

    /// ttl 为 None 表示永不过期
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), MemoryError>;

    async fn delete(&self, key: &str) -> Result<bool, MemoryError>;

    /// 返回所有以 prefix 开头且未过期的键
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, MemoryError>;

    /// 有序集合：写入或更新成员分数；ttl 到期后成员不再返回
    async fn zadd(
        &self,
        key: &str,
        member: &str,
        score: f64,
        ttl: Option<Duration>,
    ) -> Result<(), MemoryError>;

    /// 按分数从高到低返回最多 limit 个成员
    async fn zrange_desc(&self, key: &str, limit: usize) -> Result<Vec<String>, MemoryError>;

    async fn zrem(&self, key: &str, member: &str) -> Result<(), MemoryError>;
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|t| t > now).unwrap_or(true)
    }
}

/// 有序集合成员：分数相同时后写入的排在前面
#[derive(Debug, Clone)]
struct ZMember {
    score: f64,
    seq: u64,
    expires_at: Option<Instant>,
}

impl ZMember {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|t| t > now).unwrap_or(true)
    }
}

#[derive(Default)]
pub struct InMemoryKvCache {
    slots: RwLock<HashMap<String, Slot>>,
    zsets: RwLock<HashMap<String, HashMap<String, ZMember>>>,
    seq: std::sync::atomic::AtomicU64,
}

impl InMemoryKvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 清除已过期的键和有序集合成员，返回清除数量
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = {
            let mut slots = self.slots.write().await;
            let before = slots.len();
            slots.retain(|_, s| s.is_live(now));
            before - slots.len()
        };

        let mut zsets = self.zsets.write().await;
        for set in zsets.values_mut() {
            let before = set.len();
            set.retain(|_, m| m.is_live(now));
            purged += before - set.len();
        }
        zsets.retain(|_, set| !set.is_empty());
        purged
    }

    /// 有序集合中的成员数（含尚未清除的过期成员）
    pub async fn zcard(&self, key: &str) -> usize {
        self.zsets.read().await.get(key).map_or(0, |set| set.len())
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.slots
            .read()
            .await
            .values()
            .filter(|s| s.is_live(now))
            .count()
    }
}

#[async_trait]
impl KvCache for InMemoryKvCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, MemoryError> {
        let now = Instant::now();
        let slots = self.slots.read().await;
        Ok(slots
            .get(key)
            .filter(|s| s.is_live(now))
            .map(|s| s.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), MemoryError> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.slots
            .write()
            .await
            .insert(key.to_string(), Slot { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, MemoryError> {
        Ok(self.slots.write().await.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, MemoryError> {
        let now = Instant::now();
        let slots = self.slots.read().await;
        let mut keys: Vec<String> = slots
            .iter()
            .filter(|(k, s)| k.starts_with(prefix) && s.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn zadd(
        &self,
        key: &str,
        member: &str,
        score: f64,
        ttl: Option<Duration>,
    ) -> Result<(), MemoryError> {
        let now = Instant::now();
        let seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut zsets = self.zsets.write().await;
        let set = zsets.entry(key.to_string()).or_default();
        // 写入时顺带清掉同一集合里已过期的成员
        set.retain(|_, m| m.is_live(now));
        set.insert(
            member.to_string(),
            ZMember {
                score,
                seq,
                expires_at: ttl.map(|d| now + d),
            },
        );
        Ok(())
    }

    async fn zrange_desc(&self, key: &str, limit: usize) -> Result<Vec<String>, MemoryError> {
        let zsets = self.zsets.read().await;
        let Some(set) = zsets.get(key) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let mut members: Vec<(&String, &ZMember)> =
            set.iter().filter(|(_, m)| m.is_live(now)).collect();
        members.sort_by(|a, b| {
            b.1.score
                .partial_cmp(&a.1.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.seq.cmp(&a.1.seq))
        });
        Ok(members
            .into_iter()
            .take(limit)
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), MemoryError> {
        let mut zsets = self.zsets.write().await;
        if let Some(set) = zsets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                zsets.remove(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_ttl_expiry() {
        tokio::time::pause();
        let kv = InMemoryKvCache::new();
        kv.set("a", json!(1), Some(Duration::from_secs(10))).await.unwrap();
        kv.set("b", json!(2), None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(json!(1)));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(kv.get("a").await.unwrap(), None);
        assert_eq!(kv.get("b").await.unwrap(), Some(json!(2)));
        assert_eq!(kv.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn test_scan_prefix() {
        let kv = InMemoryKvCache::new();
        kv.set("memory:ns:1", json!(1), None).await.unwrap();
        kv.set("memory:ns:2", json!(2), None).await.unwrap();
        kv.set("memory:other:3", json!(3), None).await.unwrap();
        let keys = kv.scan_prefix("memory:ns:").await.unwrap();
        assert_eq!(keys, vec!["memory:ns:1", "memory:ns:2"]);
    }

    #[tokio::test]
    async fn test_sorted_set_recency() {
        let kv = InMemoryKvCache::new();
        kv.zadd("recent", "old", 1.0, None).await.unwrap();
        kv.zadd("recent", "new", 3.0, None).await.unwrap();
        kv.zadd("recent", "tie", 3.0, None).await.unwrap();
        assert_eq!(
            kv.zrange_desc("recent", 2).await.unwrap(),
            vec!["tie".to_string(), "new".to_string()]
        );
        kv.zrem("recent", "tie").await.unwrap();
        assert_eq!(kv.zrange_desc("recent", 10).await.unwrap(), vec!["new", "old"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sorted_set_members_expire() {
        let kv = InMemoryKvCache::new();
        kv.zadd("recent", "short", 1.0, Some(Duration::from_secs(5))).await.unwrap();
        kv.zadd("recent", "keep", 2.0, None).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(kv.zrange_desc("recent", 10).await.unwrap(), vec!["keep"]);

        // 下一次写入会清掉过期成员，集合不会无限增长
        kv.zadd("recent", "fresh", 3.0, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(kv.zcard("recent").await, 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(kv.purge_expired().await, 1);
        assert_eq!(kv.zcard("recent").await, 1);
    }
}
