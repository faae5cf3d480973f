//! 任务生命周期引擎：数据模型、关系持久化、归档、调度与维护

pub mod archive;
pub mod health;
pub mod lifecycle;
pub mod maintenance;
pub mod model;
pub mod repository;
pub mod scheduler;

pub use archive::{ArchiveSink, JsonlArchiveSink, MemoryArchiveSink};
pub use health::{ComponentHealth, HealthMonitor, HealthReport, HealthStatus};
pub use lifecycle::{
    CleanupReport, EngineServices, EngineSettings, TaskEngine, TaskSummary, TIME_LIMIT_ERROR,
};
pub use maintenance::{spawn_maintenance, spawn_periodic, MaintenanceIntervals};
pub use model::{
    Agent, AgentStatus, ArchivedTask, Task, TaskMeta, TaskOutcome, TaskStatus, TaskStep,
};
#[cfg(feature = "async-sqlite")]
pub use repository::SqliteRepository;
pub use repository::{InMemoryRepository, TaskRepository};
pub use scheduler::{Job, LocalScheduler, Scheduler, WorkerPool};
