//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 OpenAI、Gemini 兼容层、自建代理等。
//! 请求体按 Chat Completions 线格式直接构造（byot），以便携带 tools 与 response_format。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::Client;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{
    CompletionRequest, CompletionResponse, LlmClient, LlmError, Message, Role, ToolInvocation,
};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

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

/// OpenAI 兼容客户端：持有 Client 与默认 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url)
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: TokenUsage::new(),
        }
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let mut body = json!({
            "model": model,
            "messages": to_wire_messages(&request.messages),
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(schema) = &request.response_schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": schema.name,
                    "schema": schema.schema,
                }
            });
        }
        body
    }
}

/// 内部消息 -> Chat Completions 消息；一条 Tool 消息展开为每个结果一条 `tool` 消息
fn to_wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        match m.role {
            Role::System => out.push(json!({ "role": "system", "content": m.content })),
            Role::User if m.images.is_empty() => {
                out.push(json!({ "role": "user", "content": m.content }))
            }
            Role::User => {
                let mut parts = vec![json!({ "type": "text", "text": m.content })];
                parts.extend(m.images.iter().map(|img| {
                    json!({ "type": "image_url", "image_url": { "url": img.data_url() } })
                }));
                out.push(json!({ "role": "user", "content": parts }));
            }
            Role::Assistant => {
                let mut v = json!({ "role": "assistant", "content": m.content });
                if !m.tool_calls.is_empty() {
                    let calls: Vec<Value> = m
                        .tool_calls
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c.id,
                                "type": "function",
                                "function": { "name": c.name, "arguments": c.args.to_string() }
                            })
                        })
                        .collect();
                    v["tool_calls"] = Value::Array(calls);
                }
                out.push(v);
            }
            Role::Tool => {
                for r in &m.tool_results {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": r.invocation_id,
                        "content": r.payload.to_string(),
                    }));
                }
            }
        }
    }
    out
}

/// 解析 Chat Completions 响应：取首个 choice 的 content 与 tool_calls
pub(crate) fn parse_completion(response: &Value) -> Result<CompletionResponse, LlmError> {
    let message = response
        .pointer("/choices/0/message")
        .ok_or_else(|| LlmError::InvalidResponse("response has no choices".into()))?;

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from);

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for (i, call) in calls.iter().enumerate() {
            let name = call
                .pointer("/function/name")
                .and_then(Value::as_str)
                .ok_or_else(|| LlmError::InvalidResponse("tool call without name".into()))?;
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| format!("call_{i}"));
            // arguments 是 JSON 字符串；解析失败时原样交给工具，由工具报参数错误
            let args = match call.pointer("/function/arguments") {
                Some(Value::String(raw)) => {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
                }
                Some(other) => other.clone(),
                None => json!({}),
            };
            tool_calls.push(ToolInvocation::new(id, name, args));
        }
    }

    Ok(CompletionResponse { text, tool_calls })
}

/// 按错误文本归类：限流 / 不可达 / 其它 API 错误
pub(crate) fn classify_error_message(message: &str) -> LlmError {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || message.contains("RESOURCE_EXHAUSTED") {
        LlmError::RateLimited { retry_after_ms: 0 }
    } else if lower.contains("error sending request")
        || lower.contains("connection")
        || lower.contains("timed out")
        || lower.contains("503")
    {
        LlmError::Unavailable(message.to_string())
    } else {
        LlmError::Api(message.to_string())
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = self.build_body(request);
        let response: Value = self
            .client
            .chat()
            .create_byot(body)
            .await
            .map_err(|e| classify_error_message(&e.to_string()))?;

        // 提取 token 使用统计
        if let Some(usage) = response.get("usage") {
            let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
            let completion = usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            self.usage.add(prompt, completion);
        }

        parse_completion(&response)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ImagePart, ResponseSchema, ToolResult, ToolSchema};

    #[test]
    fn test_parse_tool_calls_with_string_arguments() {
        let resp = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_a",
                        "type": "function",
                        "function": { "name": "generate_image", "arguments": "{\"prompt\":\"x\"}" }
                    }]
                }
            }]
        });
        let parsed = parse_completion(&resp).unwrap();
        assert!(parsed.text.is_none());
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].args, json!({"prompt": "x"}));
    }

    #[test]
    fn test_parse_plain_text() {
        let resp = json!({"choices": [{"message": {"content": "NEW_PROJECT"}}]});
        let parsed = parse_completion(&resp).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("NEW_PROJECT"));
        assert!(!parsed.wants_tools());
    }

    #[test]
    fn test_parse_without_choices_is_invalid() {
        assert!(matches!(
            parse_completion(&json!({})),
            Err(LlmError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_classify_error_message() {
        assert!(matches!(
            classify_error_message("status 429 Too Many Requests"),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_error_message("RESOURCE_EXHAUSTED: quota"),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_error_message("error sending request for url"),
            LlmError::Unavailable(_)
        ));
        assert!(matches!(classify_error_message("invalid model"), LlmError::Api(_)));
    }

    #[test]
    fn test_body_expands_tool_results_and_schema() {
        let client = OpenAiClient::new(Some("http://localhost"), "gpt-test", Some("sk"));
        let call = ToolInvocation::new("c1", "save_scene_script", json!({"script": "s"}));
        let request = CompletionRequest::new(vec![
            Message::system("sys"),
            Message::user("go"),
            Message::assistant_with_tools("", vec![call.clone()]),
            Message::tool_results(vec![
                ToolResult::ok(&call, json!({"scene_id": "scene_1"})),
                ToolResult::error(&call, "second"),
            ]),
        ])
        .with_tools(vec![ToolSchema {
            name: "save_scene_script".into(),
            description: "d".into(),
            parameters: json!({"type": "object"}),
        }])
        .with_response_schema(ResponseSchema {
            name: "writer_outline".into(),
            schema: json!({"type": "object"}),
        });

        let body = client.build_body(&request);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], "{\"script\":\"s\"}");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "c1");
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["tools"][0]["function"]["name"], "save_scene_script");
        assert_eq!(body["response_format"]["type"], "json_schema");
    }

    #[test]
    fn test_user_images_become_content_parts() {
        let client = OpenAiClient::new(Some("http://localhost"), "gpt-test", Some("sk"));
        let request = CompletionRequest::new(vec![Message::user_with_images(
            "inspect",
            vec![ImagePart::from_bytes(b"png", "image/png")],
        )]);
        let body = client.build_body(&request);
        let content = &body["messages"][0]["content"];
        assert_eq!(content[0]["text"], "inspect");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,cG5n");
    }
}
