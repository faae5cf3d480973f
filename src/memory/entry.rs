//! 记忆条目与检索结果

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 扁平元数据；BTreeMap 保证序列化顺序稳定（检索缓存键依赖这一点）
pub type Metadata = BTreeMap<String, Value>;

/// 元数据过滤条件：所有键值都相等才算命中
pub type Filters = BTreeMap<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    pub id: String,
    pub namespace: String,
    pub data: Value,
    /// 始终包含 id 与 timestamp（毫秒）
    pub metadata: Metadata,
    /// 用于相似度索引的序列化文本
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(namespace: impl Into<String>, data: Value, metadata: Metadata) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), namespace, data, metadata)
    }

    pub fn with_id(
        id: impl Into<String>,
        namespace: impl Into<String>,
        data: Value,
        mut metadata: Metadata,
    ) -> Self {
        let id = id.into();
        let created_at = Utc::now();
        metadata.insert("id".to_string(), Value::String(id.clone()));
        metadata
            .entry("timestamp".to_string())
            .or_insert_with(|| Value::from(created_at.timestamp_millis()));
        let text = derive_text(&data);
        Self {
            id,
            namespace: namespace.into(),
            data,
            metadata,
            text,
            created_at,
        }
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.metadata
            .get("timestamp")
            .and_then(Value::as_i64)
            .unwrap_or_else(|| self.created_at.timestamp_millis())
    }

    pub fn matches(&self, filters: &Filters) -> bool {
        matches_filters(&self.metadata, filters)
    }
}

/// 字符串负载直接作为文本，其余序列化为 JSON
pub fn derive_text(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn matches_filters(metadata: &Metadata, filters: &Filters) -> bool {
    filters
        .iter()
        .all(|(k, v)| metadata.get(k).map(|m| m == v).unwrap_or(false))
}

/// 向量索引中的一条记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
}

impl From<&MemoryEntry> for VectorRecord {
    fn from(entry: &MemoryEntry) -> Self {
        Self {
            id: entry.id.clone(),
            text: entry.text.clone(),
            metadata: entry.metadata.clone(),
        }
    }
}

/// 向量索引 query 的命中
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorHit {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub score: f32,
}

/// MemoryStore::search 的结果：分数来自向量命中，负载来自 KV 缓存（若有）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub namespace: String,
    pub text: String,
    pub data: Value,
    pub metadata: Metadata,
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_stamps_id_and_timestamp() {
        let entry = MemoryEntry::new("ns", json!({"k": 1}), Metadata::new());
        assert_eq!(entry.metadata["id"], json!(entry.id));
        assert!(entry.metadata.contains_key("timestamp"));
        assert_eq!(entry.text, r#"{"k":1}"#);
    }

    #[test]
    fn test_string_payload_is_text() {
        let entry = MemoryEntry::new("ns", json!("hello"), Metadata::new());
        assert_eq!(entry.text, "hello");
    }

    #[test]
    fn test_filters() {
        let mut md = Metadata::new();
        md.insert("agent_id".into(), json!("a1"));
        md.insert("type".into(), json!("plan"));
        let mut f = Filters::new();
        assert!(matches_filters(&md, &f));
        f.insert("agent_id".into(), json!("a1"));
        assert!(matches_filters(&md, &f));
        f.insert("type".into(), json!("reflection"));
        assert!(!matches_filters(&md, &f));
    }
}
