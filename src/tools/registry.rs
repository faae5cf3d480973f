//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找。
//! 调用结果统一为 [`ToolResult`]；未知工具不会报错中断，而是返回失败结果。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（计划步骤中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供规划提示词使用）
    fn description(&self) -> &str;

    /// 参数 JSON Schema，默认为无约束对象
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String>;
}

/// 单次工具调用的结构化结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ToolResult {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// list() 返回的工具描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

/// 按名称排序存储，list() 输出顺序稳定
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn list(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                schema: tool.parameters_schema(),
            })
            .collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub async fn execute(&self, name: &str, args: Value) -> ToolResult {
        let Some(tool) = self.get(name) else {
            return ToolResult::err(format!("Tool '{}' not found", name));
        };
        match tool.execute(args).await {
            Ok(value) => ToolResult::ok(value),
            Err(e) => ToolResult::err(e),
        }
    }

    /// 规划提示词中的工具清单（JSON）
    pub fn to_schema_json(&self) -> String {
        serde_json::to_string_pretty(&self.list()).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[tokio::test]
    async fn test_unknown_tool_returns_failed_result() {
        let registry = ToolRegistry::new();
        let res = registry.execute("nope", serde_json::json!({})).await;
        assert!(!res.success);
        assert_eq!(res.error.as_deref(), Some("Tool 'nope' not found"));
    }

    #[tokio::test]
    async fn test_list_and_execute() {
        let registry = ToolRegistry::new().with_tool(EchoTool);
        let specs = registry.list();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "echo");

        let res = registry
            .execute("echo", serde_json::json!({"text": "hi"}))
            .await;
        assert!(res.success);
        assert_eq!(res.result, Some(Value::String("hi".into())));
    }
}
