//! 归档出口
//!
//! 清理流程先写归档再删除；`write` 返回错误时本批次不删除。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::core::EngineError;
use crate::engine::ArchivedTask;

#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn write(&self, records: &[ArchivedTask]) -> Result<(), EngineError>;
}

/// 每条记录一行 JSON，追加写入
pub struct JsonlArchiveSink {
    path: PathBuf,
}

impl JsonlArchiveSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ArchiveSink for JsonlArchiveSink {
    async fn write(&self, records: &[ArchivedTask]) -> Result<(), EngineError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for record in records {
            let line = serde_json::to_string(record)
                .map_err(|e| EngineError::Archive(format!("serialize {}: {}", record.task.id, e)))?;
            buf.push_str(&line);
            buf.push('\n');
        }

        let io_err = |e: std::io::Error| EngineError::Archive(format!("{}: {}", self.path.display(), e));
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(buf.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}

/// 进程内归档，可切换为失败模式
#[derive(Default)]
pub struct MemoryArchiveSink {
    records: Mutex<Vec<ArchivedTask>>,
    failing: AtomicBool,
}

impl MemoryArchiveSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<ArchivedTask> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ArchiveSink for MemoryArchiveSink {
    async fn write(&self, records: &[ArchivedTask]) -> Result<(), EngineError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Archive("archive sink unavailable".to_string()));
        }
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Task;
    use chrono::Utc;

    fn record(goal: &str) -> ArchivedTask {
        ArchivedTask {
            task: Task::new("a1", goal),
            steps: Vec::new(),
            archived_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_jsonl_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlArchiveSink::new(dir.path().join("nested").join("archive.jsonl"));
        sink.write(&[record("one"), record("two")]).await.unwrap();
        sink.write(&[record("three")]).await.unwrap();

        let content = tokio::fs::read_to_string(sink.path()).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: ArchivedTask = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(parsed.task.goal, "three");
    }

    #[tokio::test]
    async fn test_memory_sink_failure_toggle() {
        let sink = MemoryArchiveSink::new();
        sink.set_failing(true);
        assert!(sink.write(&[record("x")]).await.is_err());
        assert!(sink.records().is_empty());
        sink.set_failing(false);
        sink.write(&[record("x")]).await.unwrap();
        assert_eq!(sink.records().len(), 1);
    }
}
