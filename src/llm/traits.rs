//! Completion Provider 抽象
//!
//! 所有后端（OpenAI 兼容 / Gemini / Mock）实现 LlmClient：一次请求携带对话、可用工具与可选响应 Schema，
//! 返回文本或工具调用列表。RetryingLlmClient 为任意后端叠加指数退避重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::llm::{Message, ToolInvocation};

/// 提供给模型的工具声明
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 结构化输出约束（JSON Schema）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: Value,
}

/// 一次补全请求
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// None 时使用客户端默认模型
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub response_schema: Option<ResponseSchema>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_response_schema(mut self, schema: ResponseSchema) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// 补全结果：有工具调用时 text 通常为空
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolInvocation>,
}

impl CompletionResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(calls: Vec<ToolInvocation>) -> Self {
        Self {
            text: None,
            tool_calls: calls,
        }
    }

    pub fn wants_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn text_or_empty(&self) -> String {
        self.text.clone().unwrap_or_default()
    }
}

/// 提供方层面的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("provider API error: {0}")]
    Api(String),
}

impl LlmError {
    /// 限流与连接失败可重试；其余直接上抛
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. } | LlmError::Unavailable(_))
    }
}

/// Completion Provider trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// 默认模型名（日志用）
    fn model_name(&self) -> &str {
        "unknown"
    }

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 总尝试次数（含首次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次失败后的等待时间（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// 对瞬时错误做指数退避重试的包装客户端
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.complete(request).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let mut delay = self.config.delay_for(attempt);
                    if let LlmError::RateLimited { retry_after_ms } = &e {
                        delay = delay.max(Duration::from_millis(*retry_after_ms));
                    }
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "completion failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
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
    fn test_delay_doubles_and_caps() {
        let cfg = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(cfg.delay_for(1), Duration::from_secs(1));
        assert_eq!(cfg.delay_for(2), Duration::from_secs(2));
        assert_eq!(cfg.delay_for(3), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_rate_limit() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::RateLimited { retry_after_ms: 0 });
        mock.push_response(CompletionResponse::text("done"));
        let client = RetryingLlmClient::new(mock.clone(), RetryConfig::default());

        let resp = client.complete(&CompletionRequest::default()).await.unwrap();
        assert_eq!(resp.text.as_deref(), Some("done"));
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_does_not_retry_api_errors() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::Api("bad request".into()));
        let client = RetryingLlmClient::new(mock.clone(), RetryConfig::default());

        let err = client.complete(&CompletionRequest::default()).await.unwrap_err();
        assert_eq!(err, LlmError::Api("bad request".into()));
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let mock = Arc::new(MockLlmClient::new());
        for _ in 0..5 {
            mock.push_error(LlmError::Unavailable("down".into()));
        }
        let client = RetryingLlmClient::new(mock.clone(), RetryConfig::default());

        let err = client.complete(&CompletionRequest::default()).await.unwrap_err();
        assert!(matches!(err, LlmError::Unavailable(_)));
        assert_eq!(mock.requests().len(), 3);
    }
}
