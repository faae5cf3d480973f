//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ENGINE__MAX_RETRIES=5`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub tools: ToolsSection,
}

/// [app] 段：应用名、工作目录根
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// Agent 工作目录根，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

/// [llm] 段：后端选择、采样参数与重试退避
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// 供应商错误重试一次前的等待（毫秒）
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "mock".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_llm_timeout_secs() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

/// [memory] 段：短期 TTL、检索缓存、批量写入与上下文大小
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    /// 短期记忆（KV 缓存）默认 TTL（秒）
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// 检索结果缓存 TTL（秒）
    #[serde(default = "default_search_cache_ttl_secs")]
    pub search_cache_ttl_secs: u64,
    /// 写向量索引时是否同时镜像到 KV 缓存
    #[serde(default = "default_true")]
    pub structured_caching: bool,
    /// 批量写入 flush 间隔（毫秒）
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    /// 单命名空间待写队列达到此值时提前 flush；0 表示只按 tick flush
    #[serde(default)]
    pub batch_max_size: usize,
    #[serde(default = "default_max_short_term")]
    pub max_short_term: usize,
    #[serde(default = "default_max_long_term")]
    pub max_long_term: usize,
    #[serde(default)]
    pub min_score: f32,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    #[serde(default = "default_max_vector_entries")]
    pub max_vector_entries: usize,
}

fn default_true() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_search_cache_ttl_secs() -> u64 {
    60
}

fn default_batch_interval_ms() -> u64 {
    5000
}

fn default_max_short_term() -> usize {
    5
}

fn default_max_long_term() -> usize {
    3
}

fn default_embedding_dim() -> usize {
    256
}

fn default_max_vector_entries() -> usize {
    10_000
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            search_cache_ttl_secs: default_search_cache_ttl_secs(),
            structured_caching: true,
            batch_interval_ms: default_batch_interval_ms(),
            batch_max_size: 0,
            max_short_term: default_max_short_term(),
            max_long_term: default_max_long_term(),
            min_score: 0.0,
            embedding_dim: default_embedding_dim(),
            max_vector_entries: default_max_vector_entries(),
        }
    }
}

impl MemorySection {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn search_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.search_cache_ttl_secs)
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms.max(1))
    }
}

/// [engine] 段：执行预算、重试、保留期、忙碌退避与后台扫描周期
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// 单个任务的墙钟执行上限（秒），每步检查一次
    #[serde(default = "default_max_execution_secs")]
    pub max_execution_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 失败任务在此窗口内才会被自动重试（秒）
    #[serde(default = "default_retry_window_secs")]
    pub retry_window_secs: u64,
    /// 终态任务超过此时长后归档并删除（秒）
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Agent 忙碌时派发的最大尝试次数
    #[serde(default = "default_dispatch_max_attempts")]
    pub dispatch_max_attempts: u32,
    /// Agent 忙碌时两次派发间的固定退避（毫秒）
    #[serde(default = "default_dispatch_backoff_ms")]
    pub dispatch_backoff_ms: u64,
    #[serde(default = "default_scheduled_scan_secs")]
    pub scheduled_scan_secs: u64,
    #[serde(default = "default_retry_scan_secs")]
    pub retry_scan_secs: u64,
    #[serde(default = "default_cleanup_scan_secs")]
    pub cleanup_scan_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// 本地调度器的最大并发任务数（不同 Agent 之间）
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// 失败步骤后请求规划器细化剩余步骤
    #[serde(default)]
    pub adaptive_replanning: bool,
    #[serde(default = "default_archive_path")]
    pub archive_path: PathBuf,
    /// 启用 async-sqlite 时使用的数据库地址（如 sqlite:data/hive.db）
    pub database_url: Option<String>,
}

fn default_max_execution_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_window_secs() -> u64 {
    24 * 3600
}

fn default_retention_secs() -> u64 {
    7 * 24 * 3600
}

fn default_dispatch_max_attempts() -> u32 {
    5
}

fn default_dispatch_backoff_ms() -> u64 {
    1000
}

fn default_scheduled_scan_secs() -> u64 {
    30
}

fn default_retry_scan_secs() -> u64 {
    300
}

fn default_cleanup_scan_secs() -> u64 {
    3600
}

fn default_health_interval_secs() -> u64 {
    60
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_archive_path() -> PathBuf {
    PathBuf::from("data/archive.jsonl")
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_execution_secs: default_max_execution_secs(),
            max_retries: default_max_retries(),
            retry_window_secs: default_retry_window_secs(),
            retention_secs: default_retention_secs(),
            dispatch_max_attempts: default_dispatch_max_attempts(),
            dispatch_backoff_ms: default_dispatch_backoff_ms(),
            scheduled_scan_secs: default_scheduled_scan_secs(),
            retry_scan_secs: default_retry_scan_secs(),
            cleanup_scan_secs: default_cleanup_scan_secs(),
            health_interval_secs: default_health_interval_secs(),
            worker_concurrency: default_worker_concurrency(),
            adaptive_replanning: false,
            archive_path: default_archive_path(),
            database_url: None,
        }
    }
}

impl EngineSection {
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.max_execution_secs)
    }

    pub fn dispatch_backoff(&self) -> Duration {
        Duration::from_millis(self.dispatch_backoff_ms)
    }
}

/// [tools] 段：单次工具调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
