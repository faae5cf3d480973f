//! 关系型持久化
//!
//! [`TaskRepository`] 是 Agent / Task / TaskStep 的存取接口；
//! 每个改状态的操作在后端内部原子完成（单锁或单条 SQL），互斥只依赖这里的状态字段。
//! 默认 [`InMemoryRepository`]；启用 `async-sqlite` 时提供 [`SqliteRepository`]。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::core::EngineError;
use crate::engine::{Agent, AgentStatus, Task, TaskOutcome, TaskStatus, TaskStep};

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert_agent(&self, agent: &Agent) -> Result<(), EngineError>;
    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, EngineError>;
    async fn list_agents(&self) -> Result<Vec<Agent>, EngineError>;
    /// Agent 有进行中的任务时拒绝
    async fn delete_agent(&self, agent_id: &str) -> Result<bool, EngineError>;

    /// idle → running 的比较交换；Agent 已忙返回 false
    async fn try_claim_agent(&self, agent_id: &str, task_id: &str) -> Result<bool, EngineError>;
    async fn release_agent(&self, agent_id: &str) -> Result<Agent, EngineError>;

    async fn insert_task(&self, task: &Task) -> Result<(), EngineError>;
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, EngineError>;
    /// 校验并应用状态迁移，返回迁移后的记录
    async fn transition_task(
        &self,
        task_id: &str,
        to: TaskStatus,
        at: DateTime<Utc>,
    ) -> Result<Task, EngineError>;
    async fn record_outcome(&self, task_id: &str, outcome: &TaskOutcome) -> Result<(), EngineError>;
    async fn touch_heartbeat(&self, task_id: &str, at: DateTime<Utc>) -> Result<(), EngineError>;
    async fn request_cancel(&self, task_id: &str) -> Result<Task, EngineError>;
    /// 失败任务重试次数未满时 failed → pending；已满或状态不符返回 None
    async fn requeue_failed(
        &self,
        task_id: &str,
        max_retries: u32,
        at: DateTime<Utc>,
    ) -> Result<Option<Task>, EngineError>;

    /// status=pending 且 scheduled_for ≤ now；同时清空 scheduled_for，每个任务只会被取出一次
    async fn take_due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Task>, EngineError>;
    /// status=failed 且 updated_at ≥ cutoff
    async fn failed_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, EngineError>;
    /// status ∈ {completed, cancelled} 且 completed_at ≤ cutoff
    async fn terminal_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Task>, EngineError>;
    /// 立即可派发的 pending 任务，优先级高、创建早的在前
    async fn dispatchable_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, EngineError>;
    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>, EngineError>;
    /// 新的在前
    async fn tasks_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<Task>, EngineError>;
    async fn delete_task(&self, task_id: &str) -> Result<bool, EngineError>;
    async fn count_by_status(&self) -> Result<BTreeMap<TaskStatus, usize>, EngineError>;

    /// 仅在所属任务 running 时追加
    async fn append_step(&self, step: &TaskStep) -> Result<(), EngineError>;
    async fn steps_for(&self, task_id: &str) -> Result<Vec<TaskStep>, EngineError>;
}

#[derive(Default)]
struct Tables {
    agents: HashMap<String, Agent>,
    tasks: HashMap<String, Task>,
    steps: HashMap<String, Vec<TaskStep>>,
}

#[derive(Default)]
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn task_mut<'a>(tables: &'a mut Tables, task_id: &str) -> Result<&'a mut Task, EngineError> {
    tables
        .tasks
        .get_mut(task_id)
        .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
}

fn newest_first(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

#[async_trait]
impl TaskRepository for InMemoryRepository {
    async fn insert_agent(&self, agent: &Agent) -> Result<(), EngineError> {
        self.tables
            .write()
            .await
            .agents
            .insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, EngineError> {
        Ok(self.tables.read().await.agents.get(agent_id).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, EngineError> {
        let mut agents: Vec<Agent> = self.tables.read().await.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(agents)
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<bool, EngineError> {
        let mut tables = self.tables.write().await;
        match tables.agents.get(agent_id) {
            None => return Ok(false),
            Some(agent) if !agent.is_idle() => {
                return Err(EngineError::AgentActive(agent_id.to_string()))
            }
            Some(_) => {}
        }
        let task_ids: Vec<String> = tables
            .tasks
            .values()
            .filter(|t| t.agent_id == agent_id)
            .map(|t| t.id.clone())
            .collect();
        for id in &task_ids {
            tables.tasks.remove(id);
            tables.steps.remove(id);
        }
        tables.agents.remove(agent_id);
        Ok(true)
    }

    async fn try_claim_agent(&self, agent_id: &str, task_id: &str) -> Result<bool, EngineError> {
        let mut tables = self.tables.write().await;
        let agent = tables
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))?;
        if !agent.is_idle() {
            return Ok(false);
        }
        agent.status = AgentStatus::Running;
        agent.current_task_id = Some(task_id.to_string());
        agent.updated_at = Utc::now();
        Ok(true)
    }

    async fn release_agent(&self, agent_id: &str) -> Result<Agent, EngineError> {
        let mut tables = self.tables.write().await;
        let agent = tables
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))?;
        agent.status = AgentStatus::Idle;
        agent.current_task_id = None;
        agent.updated_at = Utc::now();
        Ok(agent.clone())
    }

    async fn insert_task(&self, task: &Task) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        if !tables.agents.contains_key(&task.agent_id) {
            return Err(EngineError::AgentNotFound(task.agent_id.clone()));
        }
        tables.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, EngineError> {
        Ok(self.tables.read().await.tasks.get(task_id).cloned())
    }

    async fn transition_task(
        &self,
        task_id: &str,
        to: TaskStatus,
        at: DateTime<Utc>,
    ) -> Result<Task, EngineError> {
        let mut tables = self.tables.write().await;
        let task = task_mut(&mut tables, task_id)?;
        task.apply_transition(to, at)?;
        Ok(task.clone())
    }

    async fn record_outcome(&self, task_id: &str, outcome: &TaskOutcome) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        let task = task_mut(&mut tables, task_id)?;
        task.plan = outcome.plan.clone();
        task.results = outcome.results.clone();
        task.reflection = outcome.reflection.clone();
        task.error = outcome.error.clone();
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn touch_heartbeat(&self, task_id: &str, at: DateTime<Utc>) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        let task = task_mut(&mut tables, task_id)?;
        task.meta_data.last_heartbeat = Some(at);
        Ok(())
    }

    async fn request_cancel(&self, task_id: &str) -> Result<Task, EngineError> {
        let mut tables = self.tables.write().await;
        let task = task_mut(&mut tables, task_id)?;
        if !task.is_terminal() {
            task.meta_data.cancel_requested = true;
            task.updated_at = Utc::now();
        }
        Ok(task.clone())
    }

    async fn requeue_failed(
        &self,
        task_id: &str,
        max_retries: u32,
        at: DateTime<Utc>,
    ) -> Result<Option<Task>, EngineError> {
        let mut tables = self.tables.write().await;
        let task = task_mut(&mut tables, task_id)?;
        if task.status != TaskStatus::Failed || task.meta_data.retry_count >= max_retries {
            return Ok(None);
        }
        task.requeue_for_retry(at)?;
        Ok(Some(task.clone()))
    }

    async fn take_due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Task>, EngineError> {
        let mut tables = self.tables.write().await;
        let mut due = Vec::new();
        for task in tables.tasks.values_mut() {
            if task.status == TaskStatus::Pending && task.scheduled_for.is_some_and(|at| at <= now) {
                task.scheduled_for = None;
                task.updated_at = now;
                due.push(task.clone());
            }
        }
        due.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(due)
    }

    async fn failed_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, EngineError> {
        Ok(self
            .tables
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed && t.updated_at >= cutoff)
            .cloned()
            .collect())
    }

    async fn terminal_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Task>, EngineError> {
        let mut tasks: Vec<Task> = self
            .tables
            .read()
            .await
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Cancelled))
            .filter(|t| t.completed_at.is_some_and(|at| at <= cutoff))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.completed_at.cmp(&b.completed_at));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn dispatchable_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, EngineError> {
        let mut tasks: Vec<Task> = self
            .tables
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.is_dispatchable(now))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(tasks)
    }

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>, EngineError> {
        let mut tasks: Vec<Task> = self
            .tables
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn tasks_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<Task>, EngineError> {
        let mut tasks: Vec<Task> = self
            .tables
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.agent_id == agent_id)
            .cloned()
            .collect();
        newest_first(&mut tasks);
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn delete_task(&self, task_id: &str) -> Result<bool, EngineError> {
        let mut tables = self.tables.write().await;
        tables.steps.remove(task_id);
        Ok(tables.tasks.remove(task_id).is_some())
    }

    async fn count_by_status(&self) -> Result<BTreeMap<TaskStatus, usize>, EngineError> {
        let mut counts = BTreeMap::new();
        for task in self.tables.read().await.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn append_step(&self, step: &TaskStep) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        let status = task_mut(&mut tables, &step.task_id)?.status;
        if status != TaskStatus::Running {
            return Err(EngineError::InvalidTransition {
                task_id: step.task_id.clone(),
                from: status,
                to: TaskStatus::Running,
            });
        }
        tables
            .steps
            .entry(step.task_id.clone())
            .or_default()
            .push(step.clone());
        Ok(())
    }

    async fn steps_for(&self, task_id: &str) -> Result<Vec<TaskStep>, EngineError> {
        let mut steps = self
            .tables
            .read()
            .await
            .steps
            .get(task_id)
            .cloned()
            .unwrap_or_default();
        steps.sort_by_key(|s| s.step_number);
        Ok(steps)
    }
}

#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteRepository;

#[cfg(feature = "async-sqlite")]
mod sqlite {
    //! sqlx + SQLite 后端。plan / results / reflection / meta_data 以 JSON 文本列保存，
    //! 时间戳为毫秒整数，状态为小写字符串。

    use std::collections::BTreeMap;
    use std::path::Path;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
    use sqlx::Row;

    use super::TaskRepository;
    use crate::core::EngineError;
    use crate::engine::{Agent, AgentStatus, Task, TaskOutcome, TaskStatus, TaskStep};

    const TASK_COLUMNS: &str = "id, agent_id, goal, status, priority, scheduled_for, plan, results, \
         reflection, error, meta_data, created_at, updated_at, started_at, completed_at";

    fn db_err(e: sqlx::Error) -> EngineError {
        EngineError::Repository(e.to_string())
    }

    fn json_err(e: serde_json::Error) -> EngineError {
        EngineError::Repository(format!("invalid stored json: {}", e))
    }

    fn millis(dt: DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn from_millis(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }

    fn to_json<T: serde::Serialize>(value: &T) -> Result<String, EngineError> {
        serde_json::to_string(value).map_err(json_err)
    }

    fn opt_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Result<Option<T>, EngineError> {
        raw.map(|s| serde_json::from_str(&s).map_err(json_err)).transpose()
    }

    fn agent_from_row(row: &SqliteRow) -> Result<Agent, EngineError> {
        Ok(Agent {
            id: row.try_get("id").map_err(db_err)?,
            name: row.try_get("name").map_err(db_err)?,
            description: row.try_get("description").map_err(db_err)?,
            model: row.try_get("model").map_err(db_err)?,
            workspace: row.try_get("workspace").map_err(db_err)?,
            max_iterations: row.try_get::<i64, _>("max_iterations").map_err(db_err)? as u32,
            temperature: row.try_get::<f64, _>("temperature").map_err(db_err)? as f32,
            status: row.try_get::<String, _>("status").map_err(db_err)?.parse::<AgentStatus>()?,
            current_task_id: row.try_get("current_task_id").map_err(db_err)?,
            created_at: from_millis(row.try_get("created_at").map_err(db_err)?),
            updated_at: from_millis(row.try_get("updated_at").map_err(db_err)?),
        })
    }

    fn task_from_row(row: &SqliteRow) -> Result<Task, EngineError> {
        let results: Option<String> = row.try_get("results").map_err(db_err)?;
        let meta: Option<String> = row.try_get("meta_data").map_err(db_err)?;
        Ok(Task {
            id: row.try_get("id").map_err(db_err)?,
            agent_id: row.try_get("agent_id").map_err(db_err)?,
            goal: row.try_get("goal").map_err(db_err)?,
            status: row.try_get::<String, _>("status").map_err(db_err)?.parse::<TaskStatus>()?,
            priority: row.try_get::<i64, _>("priority").map_err(db_err)? as i32,
            scheduled_for: row
                .try_get::<Option<i64>, _>("scheduled_for")
                .map_err(db_err)?
                .map(from_millis),
            plan: opt_json(row.try_get("plan").map_err(db_err)?)?,
            results: opt_json(results)?.unwrap_or_default(),
            reflection: opt_json(row.try_get("reflection").map_err(db_err)?)?,
            error: row.try_get("error").map_err(db_err)?,
            meta_data: opt_json(meta)?.unwrap_or_default(),
            created_at: from_millis(row.try_get("created_at").map_err(db_err)?),
            updated_at: from_millis(row.try_get("updated_at").map_err(db_err)?),
            started_at: row
                .try_get::<Option<i64>, _>("started_at")
                .map_err(db_err)?
                .map(from_millis),
            completed_at: row
                .try_get::<Option<i64>, _>("completed_at")
                .map_err(db_err)?
                .map(from_millis),
        })
    }

    fn step_from_row(row: &SqliteRow) -> Result<TaskStep, EngineError> {
        let input: String = row.try_get("input_data").map_err(db_err)?;
        let output: String = row.try_get("output_data").map_err(db_err)?;
        Ok(TaskStep {
            task_id: row.try_get("task_id").map_err(db_err)?,
            step_number: row.try_get::<i64, _>("step_number").map_err(db_err)? as u32,
            action: row.try_get("action").map_err(db_err)?,
            tool: row.try_get("tool").map_err(db_err)?,
            input_data: serde_json::from_str(&input).map_err(json_err)?,
            output_data: serde_json::from_str(&output).map_err(json_err)?,
            status: row.try_get::<String, _>("status").map_err(db_err)?.parse::<TaskStatus>()?,
            created_at: from_millis(row.try_get("created_at").map_err(db_err)?),
        })
    }

    pub struct SqliteRepository {
        pool: SqlitePool,
    }

    impl SqliteRepository {
        /// 打开（必要时创建）数据库文件并建表
        pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, EngineError> {
            let url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
            Self::connect(&url).await
        }

        pub async fn connect(url: &str) -> Result<Self, EngineError> {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect(url)
                .await
                .map_err(db_err)?;
            let repo = Self { pool };
            repo.migrate().await?;
            Ok(repo)
        }

        async fn migrate(&self) -> Result<(), EngineError> {
            let statements = [
                "CREATE TABLE IF NOT EXISTS agents (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT,
                    model TEXT NOT NULL,
                    workspace TEXT NOT NULL,
                    max_iterations INTEGER NOT NULL,
                    temperature REAL NOT NULL,
                    status TEXT NOT NULL,
                    current_task_id TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                )",
                "CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    agent_id TEXT NOT NULL REFERENCES agents(id),
                    goal TEXT NOT NULL,
                    status TEXT NOT NULL,
                    priority INTEGER NOT NULL DEFAULT 0,
                    scheduled_for INTEGER,
                    plan TEXT,
                    results TEXT,
                    reflection TEXT,
                    error TEXT,
                    meta_data TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    started_at INTEGER,
                    completed_at INTEGER
                )",
                "CREATE INDEX IF NOT EXISTS idx_tasks_agent ON tasks(agent_id)",
                "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
                "CREATE TABLE IF NOT EXISTS task_steps (
                    task_id TEXT NOT NULL REFERENCES tasks(id),
                    step_number INTEGER NOT NULL,
                    action TEXT NOT NULL,
                    tool TEXT,
                    input_data TEXT NOT NULL,
                    output_data TEXT NOT NULL,
                    status TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                )",
                "CREATE INDEX IF NOT EXISTS idx_steps_task ON task_steps(task_id, step_number)",
            ];
            for sql in statements {
                sqlx::query(sql).execute(&self.pool).await.map_err(db_err)?;
            }
            Ok(())
        }

        async fn load_task(&self, task_id: &str) -> Result<Task, EngineError> {
            self.get_task(task_id)
                .await?
                .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
        }

        async fn query_tasks(&self, sql: &str, binds: &[i64]) -> Result<Vec<Task>, EngineError> {
            let mut query = sqlx::query(sql);
            for b in binds {
                query = query.bind(*b);
            }
            let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
            rows.iter().map(task_from_row).collect()
        }
    }

    #[async_trait]
    impl TaskRepository for SqliteRepository {
        async fn insert_agent(&self, agent: &Agent) -> Result<(), EngineError> {
            sqlx::query(
                "INSERT OR REPLACE INTO agents
                 (id, name, description, model, workspace, max_iterations, temperature, status,
                  current_task_id, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&agent.id)
            .bind(&agent.name)
            .bind(&agent.description)
            .bind(&agent.model)
            .bind(&agent.workspace)
            .bind(agent.max_iterations as i64)
            .bind(agent.temperature as f64)
            .bind(agent.status.as_str())
            .bind(&agent.current_task_id)
            .bind(millis(agent.created_at))
            .bind(millis(agent.updated_at))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            Ok(())
        }

        async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, EngineError> {
            let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
                .bind(agent_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
            row.as_ref().map(agent_from_row).transpose()
        }

        async fn list_agents(&self) -> Result<Vec<Agent>, EngineError> {
            let rows = sqlx::query("SELECT * FROM agents ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
            rows.iter().map(agent_from_row).collect()
        }

        async fn delete_agent(&self, agent_id: &str) -> Result<bool, EngineError> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let status: Option<String> = sqlx::query_scalar("SELECT status FROM agents WHERE id = ?")
                .bind(agent_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            match status.as_deref() {
                None => return Ok(false),
                Some("idle") => {}
                Some(_) => return Err(EngineError::AgentActive(agent_id.to_string())),
            }
            sqlx::query("DELETE FROM task_steps WHERE task_id IN (SELECT id FROM tasks WHERE agent_id = ?)")
                .bind(agent_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query("DELETE FROM tasks WHERE agent_id = ?")
                .bind(agent_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query("DELETE FROM agents WHERE id = ?")
                .bind(agent_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            Ok(true)
        }

        async fn try_claim_agent(&self, agent_id: &str, task_id: &str) -> Result<bool, EngineError> {
            let updated = sqlx::query(
                "UPDATE agents SET status = 'running', current_task_id = ?, updated_at = ?
                 WHERE id = ? AND status = 'idle'",
            )
            .bind(task_id)
            .bind(millis(Utc::now()))
            .bind(agent_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();
            if updated == 1 {
                return Ok(true);
            }
            match self.get_agent(agent_id).await? {
                Some(_) => Ok(false),
                None => Err(EngineError::AgentNotFound(agent_id.to_string())),
            }
        }

        async fn release_agent(&self, agent_id: &str) -> Result<Agent, EngineError> {
            sqlx::query(
                "UPDATE agents SET status = 'idle', current_task_id = NULL, updated_at = ? WHERE id = ?",
            )
            .bind(millis(Utc::now()))
            .bind(agent_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            self.get_agent(agent_id)
                .await?
                .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))
        }

        async fn insert_task(&self, task: &Task) -> Result<(), EngineError> {
            if self.get_agent(&task.agent_id).await?.is_none() {
                return Err(EngineError::AgentNotFound(task.agent_id.clone()));
            }
            sqlx::query(&format!(
                "INSERT INTO tasks ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                TASK_COLUMNS
            ))
            .bind(&task.id)
            .bind(&task.agent_id)
            .bind(&task.goal)
            .bind(task.status.as_str())
            .bind(task.priority as i64)
            .bind(task.scheduled_for.map(millis))
            .bind(task.plan.as_ref().map(to_json).transpose()?)
            .bind(to_json(&task.results)?)
            .bind(task.reflection.as_ref().map(to_json).transpose()?)
            .bind(&task.error)
            .bind(to_json(&task.meta_data)?)
            .bind(millis(task.created_at))
            .bind(millis(task.updated_at))
            .bind(task.started_at.map(millis))
            .bind(task.completed_at.map(millis))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            Ok(())
        }

        async fn get_task(&self, task_id: &str) -> Result<Option<Task>, EngineError> {
            let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
            row.as_ref().map(task_from_row).transpose()
        }

        async fn transition_task(
            &self,
            task_id: &str,
            to: TaskStatus,
            at: DateTime<Utc>,
        ) -> Result<Task, EngineError> {
            let mut task = self.load_task(task_id).await?;
            let from = task.status;
            task.apply_transition(to, at)?;
            // 以旧状态为条件更新，并发迁移只有一个生效
            let updated = sqlx::query(
                "UPDATE tasks SET status = ?, updated_at = ?, started_at = ?, completed_at = ?
                 WHERE id = ? AND status = ?",
            )
            .bind(task.status.as_str())
            .bind(millis(task.updated_at))
            .bind(task.started_at.map(millis))
            .bind(task.completed_at.map(millis))
            .bind(task_id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();
            if updated == 0 {
                let current = self.load_task(task_id).await?;
                return Err(EngineError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: current.status,
                    to,
                });
            }
            Ok(task)
        }

        async fn record_outcome(&self, task_id: &str, outcome: &TaskOutcome) -> Result<(), EngineError> {
            sqlx::query("UPDATE tasks SET plan = ?, results = ?, reflection = ?, error = ?, updated_at = ? WHERE id = ?")
                .bind(outcome.plan.as_ref().map(to_json).transpose()?)
                .bind(to_json(&outcome.results)?)
                .bind(outcome.reflection.as_ref().map(to_json).transpose()?)
                .bind(&outcome.error)
                .bind(millis(Utc::now()))
                .bind(task_id)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
            Ok(())
        }

        async fn touch_heartbeat(&self, task_id: &str, at: DateTime<Utc>) -> Result<(), EngineError> {
            // 只改 meta_data 中的一个键，不覆盖并发写入的其他字段
            let updated = sqlx::query(
                "UPDATE tasks SET meta_data = json_set(COALESCE(meta_data, '{}'), '$.last_heartbeat', ?)
                 WHERE id = ?",
            )
            .bind(at.to_rfc3339())
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();
            if updated == 0 {
                return Err(EngineError::TaskNotFound(task_id.to_string()));
            }
            Ok(())
        }

        async fn request_cancel(&self, task_id: &str) -> Result<Task, EngineError> {
            sqlx::query(
                "UPDATE tasks SET meta_data = json_set(COALESCE(meta_data, '{}'), '$.cancel_requested', json('true')),
                    updated_at = ?
                 WHERE id = ? AND status IN ('pending', 'running')",
            )
            .bind(millis(Utc::now()))
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            self.load_task(task_id).await
        }

        async fn requeue_failed(
            &self,
            task_id: &str,
            max_retries: u32,
            at: DateTime<Utc>,
        ) -> Result<Option<Task>, EngineError> {
            let mut task = self.load_task(task_id).await?;
            if task.status != TaskStatus::Failed || task.meta_data.retry_count >= max_retries {
                return Ok(None);
            }
            task.requeue_for_retry(at)?;
            let updated = sqlx::query(
                "UPDATE tasks SET status = 'pending', meta_data = ?, error = NULL, completed_at = NULL, updated_at = ?
                 WHERE id = ? AND status = 'failed'",
            )
            .bind(to_json(&task.meta_data)?)
            .bind(millis(at))
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();
            Ok((updated == 1).then_some(task))
        }

        async fn take_due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Task>, EngineError> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let rows = sqlx::query(&format!(
                "SELECT {} FROM tasks WHERE status = 'pending' AND scheduled_for IS NOT NULL AND scheduled_for <= ?
                 ORDER BY priority DESC, created_at ASC",
                TASK_COLUMNS
            ))
            .bind(millis(now))
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;
            let mut due = Vec::with_capacity(rows.len());
            for row in &rows {
                let mut task = task_from_row(row)?;
                let cleared = sqlx::query(
                    "UPDATE tasks SET scheduled_for = NULL, updated_at = ? WHERE id = ? AND scheduled_for IS NOT NULL",
                )
                .bind(millis(now))
                .bind(&task.id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .rows_affected();
                if cleared == 1 {
                    task.scheduled_for = None;
                    task.updated_at = now;
                    due.push(task);
                }
            }
            tx.commit().await.map_err(db_err)?;
            Ok(due)
        }

        async fn failed_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, EngineError> {
            self.query_tasks(
                &format!("SELECT {} FROM tasks WHERE status = 'failed' AND updated_at >= ?", TASK_COLUMNS),
                &[millis(cutoff)],
            )
            .await
        }

        async fn terminal_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Task>, EngineError> {
            self.query_tasks(
                &format!(
                    "SELECT {} FROM tasks WHERE status IN ('completed', 'cancelled') AND completed_at <= ?
                     ORDER BY completed_at ASC LIMIT ?",
                    TASK_COLUMNS
                ),
                &[millis(cutoff), limit.min(i64::MAX as usize) as i64],
            )
            .await
        }

        async fn dispatchable_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, EngineError> {
            self.query_tasks(
                &format!(
                    "SELECT {} FROM tasks WHERE status = 'pending' AND (scheduled_for IS NULL OR scheduled_for <= ?)
                     ORDER BY priority DESC, created_at ASC",
                    TASK_COLUMNS
                ),
                &[millis(now)],
            )
            .await
        }

        async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>, EngineError> {
            let rows = sqlx::query(&format!(
                "SELECT {} FROM tasks WHERE status = ? ORDER BY created_at ASC",
                TASK_COLUMNS
            ))
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            rows.iter().map(task_from_row).collect()
        }

        async fn tasks_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<Task>, EngineError> {
            let rows = sqlx::query(&format!(
                "SELECT {} FROM tasks WHERE agent_id = ? ORDER BY created_at DESC LIMIT ?",
                TASK_COLUMNS
            ))
            .bind(agent_id)
            .bind(limit.min(i64::MAX as usize) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            rows.iter().map(task_from_row).collect()
        }

        async fn delete_task(&self, task_id: &str) -> Result<bool, EngineError> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            sqlx::query("DELETE FROM task_steps WHERE task_id = ?")
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            let deleted = sqlx::query("DELETE FROM tasks WHERE id = ?")
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .rows_affected();
            tx.commit().await.map_err(db_err)?;
            Ok(deleted == 1)
        }

        async fn count_by_status(&self) -> Result<BTreeMap<TaskStatus, usize>, EngineError> {
            let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
            let mut counts = BTreeMap::new();
            for row in rows {
                let status = row.try_get::<String, _>("status").map_err(db_err)?.parse::<TaskStatus>()?;
                let n: i64 = row.try_get("n").map_err(db_err)?;
                counts.insert(status, n as usize);
            }
            Ok(counts)
        }

        async fn append_step(&self, step: &TaskStep) -> Result<(), EngineError> {
            let inserted = sqlx::query(
                "INSERT INTO task_steps (task_id, step_number, action, tool, input_data, output_data, status, created_at)
                 SELECT ?, ?, ?, ?, ?, ?, ?, ? WHERE EXISTS (SELECT 1 FROM tasks WHERE id = ? AND status = 'running')",
            )
            .bind(&step.task_id)
            .bind(step.step_number as i64)
            .bind(&step.action)
            .bind(&step.tool)
            .bind(to_json(&step.input_data)?)
            .bind(to_json(&step.output_data)?)
            .bind(step.status.as_str())
            .bind(millis(step.created_at))
            .bind(&step.task_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();
            if inserted == 0 {
                let task = self.load_task(&step.task_id).await?;
                return Err(EngineError::InvalidTransition {
                    task_id: step.task_id.clone(),
                    from: task.status,
                    to: TaskStatus::Running,
                });
            }
            Ok(())
        }

        async fn steps_for(&self, task_id: &str) -> Result<Vec<TaskStep>, EngineError> {
            let rows = sqlx::query("SELECT * FROM task_steps WHERE task_id = ? ORDER BY step_number ASC")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
            rows.iter().map(step_from_row).collect()
        }
    }

}
