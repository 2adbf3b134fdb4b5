//! 错误恢复引擎
//!
//! 根据 PipelineError 类型返回 RecoveryAction，供生成驱动决定重试或兜底，供编排器决定是否落库记录错误。

use crate::core::{PipelineError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &PipelineError) -> RecoveryAction {
        match err {
            PipelineError::ProviderTransient(_) => RecoveryAction::RetryWithBackoff,
            PipelineError::ProviderFatal(_)
            | PipelineError::GenerationTimedOut(_) => RecoveryAction::Fallback,
            PipelineError::RuntimeExhausted { .. }
            | PipelineError::Provider(_)
            | PipelineError::ToolExecution { .. }
            | PipelineError::GenerationFailed(_)
            | PipelineError::Stage(_)
            | PipelineError::Config(_) => RecoveryAction::RecordError,
            // 存储不可用时无法可靠落库；调用方错误不改变单元状态
            PipelineError::StoreUnavailable(_)
            | PipelineError::NotFound { .. }
            | PipelineError::CandidateNotFound(_)
            | PipelineError::InvalidTransition { .. }
            | PipelineError::StageInProgress { .. }
            | PipelineError::Cancelled => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use std::time::Duration;

    #[test]
    fn test_recovery_rate_limit_retries() {
        let engine = RecoveryEngine::new();
        let err = PipelineError::ProviderTransient("429".into());
        assert_eq!(engine.handle(&err), RecoveryAction::RetryWithBackoff);
    }

    #[test]
    fn test_recovery_fatal_and_timeout_fall_back() {
        let engine = RecoveryEngine::new();
        assert_eq!(
            engine.handle(&PipelineError::ProviderFatal("bad".into())),
            RecoveryAction::Fallback
        );
        assert_eq!(
            engine.handle(&PipelineError::GenerationTimedOut(Duration::from_secs(1))),
            RecoveryAction::Fallback
        );
    }

    #[test]
    fn test_recovery_records_stage_failures() {
        let engine = RecoveryEngine::new();
        assert_eq!(
            engine.handle(&PipelineError::RuntimeExhausted { max_turns: 10 }),
            RecoveryAction::RecordError
        );
        assert_eq!(
            engine.handle(&PipelineError::Provider(LlmError::Api("x".into()))),
            RecoveryAction::RecordError
        );
    }

    #[test]
    fn test_recovery_store_and_caller_errors_abort() {
        let engine = RecoveryEngine::new();
        assert_eq!(
            engine.handle(&PipelineError::StoreUnavailable("down".into())),
            RecoveryAction::Abort
        );
        assert_eq!(
            engine.handle(&PipelineError::CandidateNotFound("x".into())),
            RecoveryAction::Abort
        );
        assert_eq!(engine.handle(&PipelineError::Cancelled), RecoveryAction::Abort);
    }
}
