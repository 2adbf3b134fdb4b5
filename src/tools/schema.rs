//! JSON Schema 生成（schemars）
//!
//! 工具参数与编剧结构化输出都由 Rust 类型派生 Schema，下发给 Completion Provider，
//! 保证模型看到的格式与反序列化用的类型一致。

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::ResponseSchema;

/// 类型 -> 可下发的 JSON Schema（去掉 `$schema` / `title` 等部分提供方不接受的元字段）
pub fn schema_value<T: JsonSchema>() -> Value {
    let mut value = serde_json::to_value(schema_for!(T))
        .unwrap_or_else(|_| serde_json::json!({ "type": "object" }));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// 编剧产出的单个场景
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SceneScript {
    /// 场景序号，从 1 开始
    pub sequence_number: u32,
    /// 场景剧本（动作与对白）
    pub script: String,
    /// 供画师生成图像的画面提示
    pub visual_prompt: String,
    /// 创作理由
    #[serde(default)]
    pub rationale: String,
    /// 出场角色
    #[serde(default)]
    pub characters_involved: Vec<String>,
}

/// 编剧的结构化大纲输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WriterOutline {
    pub scenes: Vec<SceneScript>,
}

/// 大纲的响应 Schema
pub fn writer_outline_schema() -> ResponseSchema {
    ResponseSchema {
        name: "writer_outline".to_string(),
        schema: schema_value::<WriterOutline>(),
    }
}

/// 去掉 ```json 代码块包裹
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim()
}

/// 解析模型返回的大纲文本；容忍 ```json 代码块包裹
pub fn parse_writer_outline(text: &str) -> Result<WriterOutline, String> {
    serde_json::from_str(strip_code_fence(text)).map_err(|e| format!("invalid writer outline: {e}"))
}
