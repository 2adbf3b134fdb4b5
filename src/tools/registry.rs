//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找，
//! ToolExecutor 在调用时加超时并把失败统一转为 `{error}` 结果。每个阶段持有自己的注册表。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::ToolSchema;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型 tool call 中的 name）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；Err 中的文本会作为 `{error}` 回送模型
    async fn execute(&self, args: Value) -> Result<Value, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>（有序，保证下发给模型的声明顺序稳定）
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 生成下发给 Completion Provider 的工具声明
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|(name, tool)| ToolSchema {
                name: name.clone(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }
        fn description(&self) -> &str {
            "Uppercase text"
        }
        async fn execute(&self, args: Value) -> Result<Value, String> {
            let text = args["text"].as_str().ok_or("missing text")?;
            Ok(json!(text.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ToolRegistry::new().with(Upper);
        assert!(registry.contains("upper"));
        assert_eq!(registry.len(), 1);
        let tool = registry.get("upper").unwrap();
        assert_eq!(tool.execute(json!({"text": "a"})).await.unwrap(), json!("A"));
        assert!(registry.get("lower").is_none());
    }

    #[test]
    fn test_schemas_include_parameters() {
        let registry = ToolRegistry::new().with(Upper);
        let schemas = registry.schemas();
        assert_eq!(schemas[0].name, "upper");
        assert_eq!(schemas[0].parameters["type"], "object");
    }
}
