//! 上下文组装
//!
//! 给定 Agent 与查询，合并最近的短期条目、长期层 top-k 相似命中、Agent 状态快照与可用工具，
//! 作为规划器的输入。记忆读取失败只降级为空，不影响任务运行。

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::memory::{AgentMemory, MemoryEntry, SearchHit};
use crate::tools::{ToolRegistry, ToolSpec};

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentContext {
    pub agent_id: String,
    pub query: String,
    /// 新的在前
    pub short_term: Vec<MemoryEntry>,
    pub long_term: Vec<SearchHit>,
    pub state: Option<Value>,
    pub available_tools: Vec<ToolSpec>,
}

impl AgentContext {
    /// 规划提示词中的记忆段落
    pub fn memory_digest(&self) -> String {
        let mut out = String::new();
        if !self.short_term.is_empty() {
            out.push_str("Recent activity:\n");
            for entry in &self.short_term {
                out.push_str(&format!("- {}\n", truncate(&entry.text, 300)));
            }
        }
        if !self.long_term.is_empty() {
            out.push_str("\nRelevant memories:\n");
            for hit in &self.long_term {
                out.push_str(&format!("- ({:.2}) {}\n", hit.score, truncate(&hit.text, 300)));
            }
        }
        out
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

pub struct ContextAssembler {
    memory: Arc<AgentMemory>,
    tools: Arc<ToolRegistry>,
    max_short_term: usize,
    max_long_term: usize,
    min_score: f32,
}

impl ContextAssembler {
    pub fn new(memory: Arc<AgentMemory>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            memory,
            tools,
            max_short_term: 5,
            max_long_term: 3,
            min_score: 0.0,
        }
    }

    pub fn with_limits(mut self, max_short_term: usize, max_long_term: usize, min_score: f32) -> Self {
        self.max_short_term = max_short_term;
        self.max_long_term = max_long_term;
        self.min_score = min_score;
        self
    }

    pub async fn assemble(&self, agent_id: &str, query: &str) -> AgentContext {
        let short_term = self
            .memory
            .recent_short_term(agent_id, self.max_short_term)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(agent_id, error = %e, "short-term context unavailable");
                Vec::new()
            });

        let long_term = if query.trim().is_empty() || self.max_long_term == 0 {
            Vec::new()
        } else {
            self.memory
                .search_long_term(agent_id, query, self.max_long_term, self.min_score)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(agent_id, error = %e, "long-term context unavailable");
                    Vec::new()
                })
        };

        let state = self
            .memory
            .load_agent_state(agent_id)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(agent_id, error = %e, "agent state unavailable");
                None
            });

        AgentContext {
            agent_id: agent_id.to_string(),
            query: query.to_string(),
            short_term,
            long_term,
            state,
            available_tools: self.tools.list(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{HashingEmbedder, Role};
    use crate::memory::{BatchWriter, InMemoryKvCache, InMemoryVectorIndex, MemoryStore, MemoryStoreConfig, Metadata};
    use crate::tools::EchoTool;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_assemble_merges_tiers_and_state() {
        let index = Arc::new(InMemoryVectorIndex::new(Arc::new(HashingEmbedder::new(128)), 1000));
        let store = Arc::new(MemoryStore::new(
            Arc::new(InMemoryKvCache::new()),
            index,
            MemoryStoreConfig::default(),
        ));
        let batch = Arc::new(BatchWriter::new(store.clone(), Duration::from_secs(5)));
        let memory = Arc::new(AgentMemory::new(store, batch));

        memory.add_conversation_turn("a1", Role::User, "check the weather").await.unwrap();
        memory
            .record_long_term("a1", None, "reflection", json!("weather lookups need a city"), Metadata::new())
            .await
            .unwrap();
        memory.save_agent_state("a1", json!({"status": "idle"})).await.unwrap();

        let tools = Arc::new(ToolRegistry::new().with_tool(EchoTool));
        let assembler = ContextAssembler::new(memory, tools).with_limits(5, 3, 0.0);
        let ctx = assembler.assemble("a1", "weather").await;

        assert!(!ctx.short_term.is_empty());
        assert_eq!(ctx.long_term.len(), 1);
        assert_eq!(ctx.state, Some(json!({"status": "idle"})));
        assert_eq!(ctx.available_tools[0].name, "echo");
        assert!(ctx.memory_digest().contains("Relevant memories"));
    }
}
