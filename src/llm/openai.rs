//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。
//! generate_json 在 system 消息末尾要求只输出 JSON，再从文本中提取对象。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::Value;

use crate::config::LlmSection;
use crate::llm::{extract_json, LlmClient, LlmError, Message, Role};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
    pub usage: TokenUsage,
}

impl OpenAiClient {
    /// API key 取自参数或 OPENAI_API_KEY；均缺失时返回 ConfigError（启动期致命错误）
    pub fn from_config(cfg: &LlmSection, api_key: Option<&str>) -> Result<Self, crate::core::AgentError> {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                crate::core::AgentError::ConfigError("OPENAI_API_KEY is not set".to_string())
            })?;

        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = cfg.base_url.as_deref() {
            config = config.with_api_base(url);
        }

        Ok(Self {
            client: Client::with_config(config),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            timeout: Duration::from_secs(cfg.timeout_secs),
            usage: TokenUsage::default(),
        })
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| {
                let msg = match m.role {
                    Role::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::System),
                    Role::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::User),
                    Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::Assistant),
                };
                msg.map_err(map_openai_error)
            })
            .collect()
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(messages)?)
            .temperature(self.temperature)
            .max_completion_tokens(self.max_tokens)
            .build()
            .map_err(map_openai_error)?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(map_openai_error)?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        Ok(response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

fn map_openai_error(e: OpenAIError) -> LlmError {
    match &e {
        OpenAIError::ApiError(api) if api.message.to_lowercase().contains("rate limit") => {
            LlmError::RateLimited {
                retry_after_ms: 1000,
            }
        }
        OpenAIError::JSONDeserialize(..) => LlmError::InvalidJson(e.to_string()),
        _ => LlmError::ApiError(e.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate_text(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.complete(messages).await
    }

    async fn generate_json(&self, messages: &[Message]) -> Result<Value, LlmError> {
        let mut messages = messages.to_vec();
        messages.push(Message::system(
            "Respond with a single valid JSON object only, without markdown or commentary.",
        ));
        let raw = self.complete(&messages).await?;
        extract_json(&raw)
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}
