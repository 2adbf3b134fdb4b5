//! 推理层：Agent 运行时（有界工具调用循环）与过程事件

pub mod events;
pub mod loop_;

pub use events::ReactEvent;
pub use loop_::{AgentConfig, AgentOutcome, AgentRuntime, ReasoningTurn, DEFAULT_MAX_TURNS};
