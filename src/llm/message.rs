//! 与 Completion Provider 交换的消息
//!
//! 一轮往返中模型可请求多个工具调用（ToolInvocation），执行结果（ToolResult）
//! 汇总为一条 Role::Tool 消息回送。

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 模型请求的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// 提供方分配的调用 ID（回送结果时对应）
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// 工具执行结果；失败时 payload 为 `{"error": "..."}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub invocation_id: String,
    pub name: String,
    pub payload: Value,
}

impl ToolResult {
    pub fn ok(invocation: &ToolInvocation, payload: Value) -> Self {
        Self {
            invocation_id: invocation.id.clone(),
            name: invocation.name.clone(),
            payload,
        }
    }

    pub fn error(invocation: &ToolInvocation, message: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation.id.clone(),
            name: invocation.name.clone(),
            payload: json!({ "error": message.into() }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.payload.get("error").is_some()
    }
}

/// 随用户消息发送的图片（base64 内联）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePart {
    pub mime_type: String,
    pub data: String,
}

impl ImagePart {
    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: BASE64.encode(bytes),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// 对话消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Assistant 消息上模型请求的工具调用
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
    /// Tool 消息携带的全部结果
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
    /// 仅 User 消息使用
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImagePart>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            images: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn user_with_images(content: impl Into<String>, images: Vec<ImagePart>) -> Self {
        Self {
            images,
            ..Self::plain(Role::User, content)
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolInvocation>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            tool_results: results,
            ..Self::plain(Role::Tool, "")
        }
    }
}
