//! Mock Completion Provider（用于测试与无 API Key 的本地运行）
//!
//! - 脚本模式：按顺序弹出预置的响应或错误，并记录每次收到的请求；
//! - 离线演示模式（`offline()`）：脚本耗尽后根据请求里的工具 / Schema 生成合理的调用，
//!   使整条流水线不依赖网络也能跑通。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{
    CompletionRequest, CompletionResponse, LlmClient, LlmError, Role, ToolInvocation,
};

enum Scripted {
    Reply(CompletionResponse),
    Fail(LlmError),
}

/// Mock 客户端
pub struct MockLlmClient {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<CompletionRequest>>,
    /// 脚本耗尽后的固定回复；None 时走离线演示逻辑
    fallback: Option<CompletionResponse>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    /// 脚本耗尽后回复 "OK"
    pub fn new() -> Self {
        Self::repeating(CompletionResponse::text("OK"))
    }

    /// 脚本耗尽后始终返回同一响应（例如永远请求工具调用）
    pub fn repeating(response: CompletionResponse) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            fallback: Some(response),
        }
    }

    /// 离线演示模式
    pub fn offline() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            fallback: None,
        }
    }

    pub fn with_responses(responses: impl IntoIterator<Item = CompletionResponse>) -> Self {
        let mock = Self::new();
        for r in responses {
            mock.push_response(r);
        }
        mock
    }

    pub fn push_response(&self, response: CompletionResponse) {
        self.lock_script().push_back(Scripted::Reply(response));
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push_response(CompletionResponse::text(text));
    }

    pub fn push_tool_call(&self, name: &str, args: serde_json::Value) {
        let id = format!("call_{}", uuid::Uuid::new_v4().simple());
        self.push_response(CompletionResponse::tool_calls(vec![ToolInvocation::new(
            id, name, args,
        )]));
    }

    pub fn push_error(&self, error: LlmError) {
        self.lock_script().push_back(Scripted::Fail(error));
    }

    /// 已收到的全部请求（按时间顺序）
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Scripted>> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());

        let next = self.lock_script().pop_front();
        match next {
            Some(Scripted::Reply(r)) => Ok(r),
            Some(Scripted::Fail(e)) => Err(e),
            None => match &self.fallback {
                Some(r) => Ok(r.clone()),
                None => Ok(offline_reply(request)),
            },
        }
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

/// 离线演示：按请求形状给出一步合理响应
fn offline_reply(request: &CompletionRequest) -> CompletionResponse {
    let last = request.messages.last();
    let after_tools = last.map(|m| m.role == Role::Tool).unwrap_or(false);
    let user_text = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default();
    let has_tool = |name: &str| request.tools.iter().any(|t| t.name == name);

    if !request.tools.is_empty() {
        if after_tools {
            return CompletionResponse::text("Done. Waiting for human review.");
        }
        let call = |name: &str, args: serde_json::Value| {
            CompletionResponse::tool_calls(vec![ToolInvocation::new(
                format!("call_{}", uuid::Uuid::new_v4().simple()),
                name,
                args,
            )])
        };
        if has_tool("save_scene_script") {
            return call(
                "save_scene_script",
                json!({
                    "sequence_number": 1,
                    "script": format!("EXT. CITY - NIGHT. {user_text}"),
                    "visual_prompt": format!("Cinematic wide shot, neon rain. {user_text}"),
                    "rationale": "Opens on the world before the characters.",
                    "characters_involved": []
                }),
            );
        }
        if has_tool("update_scene_script") {
            return call(
                "update_scene_script",
                json!({
                    "script": format!("(revised) {user_text}"),
                    "visual_prompt": format!("Cinematic close-up. {user_text}"),
                }),
            );
        }
        if has_tool("generate_image") {
            return call("generate_image", json!({ "prompt": user_text }));
        }
    }

    if request
        .response_schema
        .as_ref()
        .is_some_and(|s| s.name == "image_inspection")
    {
        return CompletionResponse::text(
            json!({ "status": "PASS", "feedback": "Offline inspection: accepted." }).to_string(),
        );
    }

    if request.response_schema.is_some() {
        return CompletionResponse::text(
            json!({
                "scenes": [
                    {
                        "sequence_number": 1,
                        "script": format!("Act one. {user_text}"),
                        "visual_prompt": "Establishing shot, volumetric light",
                        "rationale": "Sets the tone.",
                        "characters_involved": []
                    },
                    {
                        "sequence_number": 2,
                        "script": format!("Act two. {user_text}"),
                        "visual_prompt": "Tracking shot through a crowded street",
                        "rationale": "Raises the stakes.",
                        "characters_involved": []
                    }
                ]
            })
            .to_string(),
        );
    }

    let system = request
        .messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .unwrap_or_default();
    if system.contains("NEW_PROJECT") {
        return CompletionResponse::text("NEW_PROJECT");
    }
    CompletionResponse::text("Slow dolly-in while rain streaks across the frame. The camera tilts up to reveal the skyline.")
}
