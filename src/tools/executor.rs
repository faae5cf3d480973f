//! 工具执行器
//!
//! 持有 ToolRegistry 与单次调用超时；超时记为失败结果（不中断后续步骤），
//! 每次调用输出结构化审计日志（JSON）。取消不会打断进行中的调用，需要硬超时的工具自行实现。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::tools::{ToolRegistry, ToolResult, ToolSpec};

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn list(&self) -> Vec<ToolSpec> {
        self.registry.list()
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub async fn execute(&self, tool_name: &str, args: serde_json::Value) -> ToolResult {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, self.registry.execute(tool_name, args)).await;

        let outcome = match &result {
            Ok(r) if r.success => "ok",
            Ok(_) => "error",
            Err(_) => "timeout",
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        let result = match result {
            Ok(r) => r,
            Err(_) => ToolResult::err(format!(
                "Tool '{}' timed out after {}s",
                tool_name,
                self.timeout.as_secs()
            )),
        };
        result.with_metadata("duration_ms", duration_ms)
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
