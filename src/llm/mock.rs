//! Mock LLM 客户端（用于测试与本地运行，无需 API）
//!
//! 按顺序弹出预置的回复或错误；队列为空时回显最后一条 User 消息。
//! 可设置固定延迟，用来模拟慢推理。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};

#[derive(Debug)]
enum Scripted {
    Text(String),
    Error(LlmError),
}

#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Scripted>>,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
        self
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Scripted::Text(text.into()));
    }

    /// 预置一个 JSON 回复（generate_json 会解析它）
    pub fn push_json(&self, value: serde_json::Value) {
        self.push_text(value.to_string());
    }

    pub fn push_error(&self, err: LlmError) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Scripted::Error(err));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate_text(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(Scripted::Text(text)) => Ok(text),
            Some(Scripted::Error(err)) => Err(err),
            None => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                Ok(format!("Mock response: {}", last_user))
            }
        }
    }
}
