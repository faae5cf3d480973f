//! 双层记忆：KV 缓存（短期，TTL）+ 向量索引（长期，相似度检索），批量写入与上下文组装

pub mod agent_memory;
pub mod batch;
pub mod context;
pub mod entry;
pub mod kv;
pub mod store;
pub mod tokenizer;
pub mod vector;

pub use agent_memory::{agent_state_key, conversation_namespace, task_namespace, AgentMemory};
pub use batch::BatchWriter;
pub use context::{AgentContext, ContextAssembler};
pub use entry::{
    derive_text, matches_filters, Filters, MemoryEntry, Metadata, SearchHit, VectorHit,
    VectorRecord,
};
pub use kv::{InMemoryKvCache, KvCache};
pub use store::{memory_key, MemoryStore, MemoryStoreConfig};
pub use vector::{InMemoryVectorIndex, VectorIndex};
