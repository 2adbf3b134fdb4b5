//! Agent 过程事件：用于日志 / 前端展示轮次、工具调用、观察与最终回复

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    /// 开始第几轮往返
    TurnStarted {
        agent: String,
        turn: usize,
        max_turns: usize,
    },
    /// 调用工具
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation { tool: String, preview: String },
    /// 工具执行失败（以 `{error}` 回送模型）
    ToolFailure { tool: String, reason: String },
    /// 最终文本回复
    FinalAnswer { text: String },
    /// 达到轮数上限
    Exhausted { max_turns: usize },
    /// 错误
    Error { text: String },
}
