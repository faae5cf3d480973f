//! Hive worker
//!
//! 入口：加载配置 → 初始化日志 → 构造记忆、推理、工具与引擎 → 启动工作池和后台循环 → 等待关闭信号。

use std::sync::Arc;

use anyhow::Context;
use hive::config::{load_config, AppConfig};
use hive::core::{BackgroundLoopsCleanup, BatchFlushCleanup, ShutdownCoordinator, ShutdownManager};
use hive::engine::{
    spawn_maintenance, EngineServices, EngineSettings, HealthMonitor, InMemoryRepository,
    JsonlArchiveSink, LocalScheduler, MaintenanceIntervals, TaskEngine, TaskRepository, WorkerPool,
};
use hive::llm::{
    EmbeddingProvider, HashingEmbedder, LlmClient, MockLlmClient, OpenAiClient, OpenAiEmbedder,
    RetryingLlmClient,
};
use hive::memory::{AgentMemory, BatchWriter, InMemoryKvCache, InMemoryVectorIndex, MemoryStore, MemoryStoreConfig};
use hive::observability;
use hive::tools::{EchoTool, ToolExecutor, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config = load_config(config_path).context("Failed to load configuration")?;
    observability::init();
    tracing::info!(app = config.app.name.as_deref().unwrap_or("hive"), "starting worker");

    let llm = build_llm(&config)?;
    let embedder = build_embedder(&config);

    let index = Arc::new(InMemoryVectorIndex::new(embedder, config.memory.max_vector_entries));
    let store = Arc::new(MemoryStore::new(
        Arc::new(InMemoryKvCache::new()),
        index,
        MemoryStoreConfig::from(&config.memory),
    ));
    let batch = Arc::new(
        BatchWriter::new(store.clone(), config.memory.batch_interval())
            .with_max_batch(config.memory.batch_max_size),
    );
    let memory = Arc::new(AgentMemory::new(store, batch.clone()));

    let registry = Arc::new(ToolRegistry::new().with_tool(EchoTool));
    let tools = Arc::new(ToolExecutor::new(registry, config.tools.tool_timeout_secs));

    let repository = build_repository(&config).await?;
    let (scheduler, jobs) = LocalScheduler::new();
    let scheduler = Arc::new(scheduler);

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let root = shutdown.token();

    let engine = Arc::new(
        TaskEngine::new(
            EngineServices {
                repository,
                memory,
                llm,
                tools,
                scheduler: scheduler.clone(),
                archive: Arc::new(JsonlArchiveSink::new(config.engine.archive_path.clone())),
            },
            EngineSettings::from_config(&config),
        )
        .with_cancel_root(root.child_token()),
    );

    let mut handles = vec![
        WorkerPool::new(engine.clone(), scheduler, config.engine.worker_concurrency)
            .spawn(jobs, root.child_token()),
        tokio::spawn(batch.clone().run(root.child_token())),
        HealthMonitor::new(engine.clone()).spawn(
            std::time::Duration::from_secs(config.engine.health_interval_secs.max(1)),
            root.child_token(),
        ),
    ];
    handles.extend(spawn_maintenance(
        engine.clone(),
        MaintenanceIntervals::from(&config.engine),
        root.child_token(),
    ));

    let resubmitted = engine.recover().await.context("Failed to recover tasks")?;
    tracing::info!(resubmitted, "worker ready");

    let mut coordinator = ShutdownCoordinator::new(shutdown.clone());
    coordinator.register(BackgroundLoopsCleanup::new(handles));
    coordinator.register(BatchFlushCleanup::new(batch));

    shutdown.wait_for_shutdown().await;
    coordinator.run_cleanup().await;
    tracing::info!("worker stopped");
    Ok(())
}

fn build_llm(config: &AppConfig) -> anyhow::Result<Arc<dyn LlmClient>> {
    let backoff = std::time::Duration::from_millis(config.llm.retry_backoff_ms);
    let inner: Arc<dyn LlmClient> = match config.llm.provider.as_str() {
        "openai" => Arc::new(
            OpenAiClient::from_config(&config.llm, None).context("Failed to configure LLM provider")?,
        ),
        "mock" => Arc::new(MockLlmClient::new()),
        other => anyhow::bail!("Unknown LLM provider: {}", other),
    };
    Ok(Arc::new(RetryingLlmClient::new(inner, backoff)))
}

fn build_embedder(config: &AppConfig) -> Arc<dyn EmbeddingProvider> {
    match (config.llm.provider.as_str(), std::env::var("OPENAI_API_KEY")) {
        ("openai", Ok(key)) if !key.is_empty() => Arc::new(OpenAiEmbedder::new(
            config.llm.base_url.as_deref(),
            "text-embedding-3-small",
            &key,
        )),
        _ => Arc::new(HashingEmbedder::new(config.memory.embedding_dim)),
    }
}

#[cfg(feature = "async-sqlite")]
async fn build_repository(config: &AppConfig) -> anyhow::Result<Arc<dyn TaskRepository>> {
    match &config.engine.database_url {
        Some(url) => {
            let repo = hive::engine::SqliteRepository::connect(url)
                .await
                .with_context(|| format!("Failed to open database {}", url))?;
            Ok(Arc::new(repo))
        }
        None => Ok(Arc::new(InMemoryRepository::new())),
    }
}

#[cfg(not(feature = "async-sqlite"))]
async fn build_repository(config: &AppConfig) -> anyhow::Result<Arc<dyn TaskRepository>> {
    if config.engine.database_url.is_some() {
        tracing::warn!("database_url is set but the async-sqlite feature is disabled; using in-memory repository");
    }
    Ok(Arc::new(InMemoryRepository::new()))
}
