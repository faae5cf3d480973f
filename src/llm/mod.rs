//! 推理能力层：客户端抽象与实现（OpenAI 兼容 / Mock）、一次性重试包装、嵌入

pub mod embedding;
pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

pub use embedding::{EmbeddingProvider, HashingEmbedder, OpenAiEmbedder};
pub use message::{Message, Role};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{extract_json, LlmClient, LlmError, RetryingLlmClient};
