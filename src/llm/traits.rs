//! 推理能力抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：generate_text 返回文本，generate_json 返回结构化对象。
//! 供应商错误由 [`RetryingLlmClient`] 统一处理：退避后重试恰好一次，仍失败则交给调用方降级。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::llm::Message;

/// 供应商级错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Invalid JSON in model output: {0}")]
    InvalidJson(String),
}

impl LlmError {
    /// 输出格式错误重试也无用，其余视为瞬时错误
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::InvalidJson(_))
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate_text(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 默认实现：取文本后从 ```json 代码块或首个 `{` 到末个 `}` 中解析对象
    async fn generate_json(&self, messages: &[Message]) -> Result<Value, LlmError> {
        let raw = self.generate_text(messages).await?;
        extract_json(&raw)
    }

    /// 累计 token 使用：(prompt, completion, total)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 从模型输出中提取 JSON 对象
pub fn extract_json(output: &str) -> Result<Value, LlmError> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start <= end {
            &trimmed[start..=end]
        } else {
            trimmed
        }
    } else {
        trimmed
    };

    let value: Value = serde_json::from_str(json_str)
        .map_err(|e| LlmError::InvalidJson(format!("{}: {}", e, json_str)))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(LlmError::InvalidJson(format!("expected object, got: {}", json_str)))
    }
}

/// 包装任意客户端：可重试错误在退避后再试一次
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    backoff: Duration,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, backoff: Duration) -> Self {
        Self { inner, backoff }
    }

    fn delay_for(&self, err: &LlmError) -> Duration {
        match err {
            LlmError::RateLimited { retry_after_ms } => {
                self.backoff.max(Duration::from_millis(*retry_after_ms))
            }
            _ => self.backoff,
        }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn generate_text(&self, messages: &[Message]) -> Result<String, LlmError> {
        match self.inner.generate_text(messages).await {
            Err(e) if e.is_retryable() => {
                let delay = self.delay_for(&e);
                tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "LLM call failed, retrying once");
                tokio::time::sleep(delay).await;
                self.inner.generate_text(messages).await
            }
            other => other,
        }
    }

    async fn generate_json(&self, messages: &[Message]) -> Result<Value, LlmError> {
        match self.inner.generate_json(messages).await {
            Err(e) if e.is_retryable() => {
                let delay = self.delay_for(&e);
                tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "LLM JSON call failed, retrying once");
                tokio::time::sleep(delay).await;
                self.inner.generate_json(messages).await
            }
            other => other,
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_extract_json_from_fence() {
        let raw = "Here you go:\n```json\n{\"goal\": \"x\", \"steps\": []}\n```";
        let v = extract_json(raw).unwrap();
        assert_eq!(v["goal"], "x");
    }

    #[test]
    fn test_extract_json_braces() {
        let v = extract_json("prefix {\"a\": 1} suffix").unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_extract_json_rejects_garbage() {
        assert!(matches!(
            extract_json("not json at all"),
            Err(LlmError::InvalidJson(_))
        ));
        assert!(extract_json("[1, 2]").is_err());
    }

    #[tokio::test]
    async fn test_retrying_client_retries_exactly_once() {
        tokio::time::pause();
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::Timeout);
        mock.push_text("recovered");
        let client = RetryingLlmClient::new(mock.clone(), Duration::from_millis(500));

        let out = client.generate_text(&[Message::user("hi")]).await.unwrap();
        assert_eq!(out, "recovered");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_retrying_client_gives_up_after_second_failure() {
        tokio::time::pause();
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::Timeout);
        mock.push_error(LlmError::ApiError("down".into()));
        mock.push_text("never reached");
        let client = RetryingLlmClient::new(mock.clone(), Duration::from_millis(10));

        let err = client.generate_text(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::ApiError(_)));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_json_is_not_retried() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_text("definitely not json");
        let client = RetryingLlmClient::new(mock.clone(), Duration::from_millis(10));

        assert!(client.generate_json(&[Message::user("plan")]).await.is_err());
        assert_eq!(mock.call_count(), 1);
    }
}
