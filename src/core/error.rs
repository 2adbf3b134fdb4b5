//! 流水线错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 PipelineError 决定 RetryWithBackoff / Fallback / RecordError / Abort。
//! 兜底合成成功并不是错误：它以 GenerationOutcome::Degraded 的形式出现在产物上。

use std::time::Duration;

use thiserror::Error;

use crate::llm::LlmError;
use crate::store::StoreError;

/// 流水线运行中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// 工具执行失败（通常已在循环内转为 `{error}` 回送模型，这里用于循环外的直接调用）
    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Reasoning loop exhausted after {max_turns} turns")]
    RuntimeExhausted { max_turns: usize },

    /// Completion Provider 在自身重试策略之后仍失败
    #[error("Completion provider error: {0}")]
    Provider(#[from] LlmError),

    /// 媒体提供方限流 / 资源耗尽，可退避重试
    #[error("Transient provider failure: {0}")]
    ProviderTransient(String),

    #[error("Fatal provider failure: {0}")]
    ProviderFatal(String),

    #[error("Generation timed out after {0:?}")]
    GenerationTimedOut(Duration),

    /// 主路径与兜底合成都失败
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Work unit not found: {project_id}/{scene_id}")]
    NotFound { project_id: String, scene_id: String },

    #[error("Candidate not found: {0}")]
    CandidateNotFound(String),

    #[error("Invalid transition for {scene_id}: {from} -> {to}")]
    InvalidTransition {
        scene_id: String,
        from: String,
        to: String,
    },

    #[error("Stage already in progress for {key}")]
    StageInProgress { key: String },

    /// 阶段跑完但没有产生预期结果（例如编剧未保存任何场景）
    #[error("Stage failed: {0}")]
    Stage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { project_id, id } => PipelineError::NotFound {
                project_id,
                scene_id: id,
            },
            other => PipelineError::StoreUnavailable(other.to_string()),
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 退避后重新提交（仅限流类错误，且在提交阶段）
    RetryWithBackoff,
    /// 放弃主路径，走兜底合成
    Fallback,
    /// 在 WorkUnit 上记录 error 状态与详情
    RecordError,
    /// 不触碰 WorkUnit，直接把错误交还调用方
    Abort,
}
