//! 集成测试共用的装配：内存仓库、内存记忆后端、Mock 推理、内存归档

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive::engine::{
    Agent, EngineServices, EngineSettings, InMemoryRepository, Job, LocalScheduler,
    MemoryArchiveSink, TaskEngine, TaskRepository,
};
use hive::llm::{HashingEmbedder, MockLlmClient};
use hive::memory::{AgentMemory, BatchWriter, InMemoryKvCache, InMemoryVectorIndex, MemoryStore, MemoryStoreConfig};
use hive::tools::{EchoTool, Tool, ToolExecutor, ToolRegistry};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub struct Harness {
    pub engine: Arc<TaskEngine>,
    pub llm: Arc<MockLlmClient>,
    pub repo: Arc<InMemoryRepository>,
    pub archive: Arc<MemoryArchiveSink>,
    pub index: Arc<InMemoryVectorIndex>,
    pub store: Arc<MemoryStore>,
    pub batch: Arc<BatchWriter>,
    pub scheduler: Arc<LocalScheduler>,
    pub jobs: mpsc::UnboundedReceiver<Job>,
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        dispatch_backoff: Duration::from_millis(10),
        dispatch_max_attempts: 3,
        workspace_root: None,
        ..EngineSettings::default()
    }
}

pub fn harness(settings: EngineSettings, llm: MockLlmClient) -> Harness {
    harness_with_tools(settings, llm, ToolRegistry::new().with_tool(EchoTool).with_tool(PanicTool))
}

pub fn harness_with_tools(settings: EngineSettings, llm: MockLlmClient, registry: ToolRegistry) -> Harness {
    let repo = Arc::new(InMemoryRepository::new());
    assemble(settings, llm, registry, repo.clone(), repo)
}

/// 引擎使用 repository 访问持久化；repo 是它最终落到的内存仓库，供断言直接读取
pub fn harness_with_repository(
    settings: EngineSettings,
    llm: MockLlmClient,
    repo: Arc<InMemoryRepository>,
    repository: Arc<dyn TaskRepository>,
) -> Harness {
    let registry = ToolRegistry::new().with_tool(EchoTool).with_tool(PanicTool);
    assemble(settings, llm, registry, repo, repository)
}

fn assemble(
    settings: EngineSettings,
    llm: MockLlmClient,
    registry: ToolRegistry,
    repo: Arc<InMemoryRepository>,
    repository: Arc<dyn TaskRepository>,
) -> Harness {
    let index = Arc::new(InMemoryVectorIndex::new(Arc::new(HashingEmbedder::new(128)), 10_000));
    let store = Arc::new(MemoryStore::new(
        Arc::new(InMemoryKvCache::new()),
        index.clone(),
        MemoryStoreConfig::default(),
    ));
    let batch = Arc::new(BatchWriter::new(store.clone(), Duration::from_secs(5)));
    let memory = Arc::new(AgentMemory::new(store.clone(), batch.clone()));
    let llm = Arc::new(llm);
    let archive = Arc::new(MemoryArchiveSink::new());
    let (scheduler, jobs) = LocalScheduler::new();
    let scheduler = Arc::new(scheduler);

    let engine = Arc::new(TaskEngine::new(
        EngineServices {
            repository,
            memory,
            llm: llm.clone(),
            tools: Arc::new(ToolExecutor::new(Arc::new(registry), 5)),
            scheduler: scheduler.clone(),
            archive: archive.clone(),
        },
        settings,
    ));

    Harness {
        engine,
        llm,
        repo,
        archive,
        index,
        store,
        batch,
        scheduler,
        jobs,
    }
}

impl Harness {
    pub async fn agent(&self, name: &str) -> Agent {
        self.engine.create_agent(Agent::new(name)).await.unwrap()
    }

    /// 取出调度队列中已投递的作业
    pub fn drain_jobs(&mut self) -> Vec<Job> {
        let mut jobs = Vec::new();
        while let Ok(job) = self.jobs.try_recv() {
            jobs.push(job);
        }
        jobs
    }
}

/// 计划 JSON：每个元素为 (描述, 工具)
pub fn plan_json(steps: &[(&str, Option<&str>)]) -> Value {
    let steps: Vec<Value> = steps
        .iter()
        .enumerate()
        .map(|(i, (desc, tool))| match tool {
            Some(tool) => json!({"id": i + 1, "description": desc, "tool": tool, "tool_args": {"text": desc}}),
            None => json!({"id": i + 1, "description": desc}),
        })
        .collect();
    json!({"goal": "scripted", "thought": "scripted plan", "steps": steps})
}

pub fn reflection_json(success: bool) -> Value {
    json!({"success": success, "reasoning": "checked", "learning": "noted", "next_steps": []})
}

/// 执行时直接 panic 的工具
pub struct PanicTool;

#[async_trait]
impl Tool for PanicTool {
    fn name(&self) -> &str {
        "explode"
    }

    fn description(&self) -> &str {
        "Panics when executed"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _args: Value) -> Result<Value, String> {
        panic!("tool exploded");
    }
}
