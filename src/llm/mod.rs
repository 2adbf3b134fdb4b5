//! LLM 层：Completion Provider 抽象与实现（OpenAI 兼容 / Gemini / Mock）

pub mod gemini;
pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

pub use gemini::{create_gemini_client, gemini_api_key, GEMINI_FLASH, GEMINI_PRO};
pub use message::{ImagePart, Message, Role, ToolInvocation, ToolResult};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{
    CompletionRequest, CompletionResponse, LlmClient, LlmError, ResponseSchema, RetryConfig,
    RetryingLlmClient, ToolSchema,
};
