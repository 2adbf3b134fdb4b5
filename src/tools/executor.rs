//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，invoke(invocation) 在超时内调用工具；
//! 未注册、执行失败、超时都转为 `{error}` 结果而不是错误返回；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::llm::{ToolInvocation, ToolResult, ToolSchema};
use crate::tools::{Tool, ToolRegistry};

/// 工具执行器：对每次调用施加超时
#[derive(Clone)]
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    /// 执行一次工具调用；永远返回结果，失败形如 `{"error": "..."}`
    pub async fn invoke(&self, invocation: &ToolInvocation) -> ToolResult {
        let start = Instant::now();
        let args_preview = args_preview(&invocation.args);

        let (result, outcome) = match self.registry.get(&invocation.name) {
            None => (ToolResult::error(invocation, "tool not found"), "not_found"),
            Some(tool) => match timeout(self.timeout, tool.execute(invocation.args.clone())).await {
                Ok(Ok(payload)) => (ToolResult::ok(invocation, payload), "ok"),
                Ok(Err(e)) => (ToolResult::error(invocation, e), "error"),
                Err(_) => (
                    ToolResult::error(
                        invocation,
                        format!("tool timed out after {}s", self.timeout.as_secs()),
                    ),
                    "timeout",
                ),
            },
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": invocation.name,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.registry.schemas()
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
