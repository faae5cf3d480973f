//! Echo 工具：原样返回 text 参数，用于本地运行与测试

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::Tool;

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back. Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        match args.get("text").and_then(|v| v.as_str()) {
            Some(text) => Ok(Value::String(text.to_string())),
            None => Err("missing required argument 'text'".to_string()),
        }
    }
}
