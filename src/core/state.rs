//! 状态投影：场景状态（WorkUnit.status）与编排阶段（StageState）
//!
//! 场景状态只能前进：draft < generating_image < image_selected < generating_video < completed；
//! 任意状态可进入 error，error 可重新进入 generating_*；回退只能通过显式的重新生成。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::PipelineError;

/// WorkUnit 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneStatus {
    Draft,
    GeneratingImage,
    ImageSelected,
    GeneratingVideo,
    Completed,
    Error,
}

impl SceneStatus {
    /// 前进序；Error 不在序中
    fn rank(self) -> Option<u8> {
        match self {
            SceneStatus::Draft => Some(0),
            SceneStatus::GeneratingImage => Some(1),
            SceneStatus::ImageSelected => Some(2),
            SceneStatus::GeneratingVideo => Some(3),
            SceneStatus::Completed => Some(4),
            SceneStatus::Error => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SceneStatus::Draft => "draft",
            SceneStatus::GeneratingImage => "generating_image",
            SceneStatus::ImageSelected => "image_selected",
            SceneStatus::GeneratingVideo => "generating_video",
            SceneStatus::Completed => "completed",
            SceneStatus::Error => "error",
        }
    }

    pub fn is_generating(self) -> bool {
        matches!(self, SceneStatus::GeneratingImage | SceneStatus::GeneratingVideo)
    }

    /// 是否允许 self -> next；regenerate 表示调用方显式要求重新生成
    pub fn can_transition(self, next: SceneStatus, regenerate: bool) -> bool {
        if next == SceneStatus::Error {
            return true;
        }
        match (self.rank(), next.rank()) {
            (None, _) => next.is_generating() || regenerate,
            (Some(from), Some(to)) => to >= from || regenerate,
            (Some(_), None) => true,
        }
    }

    pub fn check_transition(
        self,
        next: SceneStatus,
        regenerate: bool,
        scene_id: &str,
    ) -> Result<(), PipelineError> {
        if self.can_transition(next, regenerate) {
            Ok(())
        } else {
            Err(PipelineError::InvalidTransition {
                scene_id: scene_id.to_string(),
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for SceneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 编排阶段；两个 Awaiting* 为人工检查点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Routing,
    Drafting,
    AwaitingScriptConfirmation,
    Illustrating,
    AwaitingImageSelection,
    Directing,
    Completed,
}

impl StageState {
    pub fn as_str(self) -> &'static str {
        match self {
            StageState::Routing => "routing",
            StageState::Drafting => "drafting",
            StageState::AwaitingScriptConfirmation => "awaiting_script_confirmation",
            StageState::Illustrating => "illustrating",
            StageState::AwaitingImageSelection => "awaiting_image_selection",
            StageState::Directing => "directing",
            StageState::Completed => "completed",
        }
    }

    /// 是否为人工检查点（流水线在此停住等待外部调用）
    pub fn is_checkpoint(self) -> bool {
        matches!(
            self,
            StageState::AwaitingScriptConfirmation | StageState::AwaitingImageSelection
        )
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        assert!(SceneStatus::Draft.can_transition(SceneStatus::GeneratingImage, false));
        assert!(SceneStatus::GeneratingImage.can_transition(SceneStatus::ImageSelected, false));
        assert!(SceneStatus::ImageSelected.can_transition(SceneStatus::GeneratingVideo, false));
        assert!(SceneStatus::GeneratingVideo.can_transition(SceneStatus::Completed, false));
    }

    #[test]
    fn test_backward_requires_regenerate() {
        assert!(!SceneStatus::Completed.can_transition(SceneStatus::GeneratingImage, false));
        assert!(SceneStatus::Completed.can_transition(SceneStatus::GeneratingImage, true));
        assert!(!SceneStatus::ImageSelected.can_transition(SceneStatus::Draft, false));
    }

    #[test]
    fn test_error_is_reachable_and_retryable() {
        assert!(SceneStatus::GeneratingVideo.can_transition(SceneStatus::Error, false));
        assert!(SceneStatus::Error.can_transition(SceneStatus::GeneratingVideo, false));
        assert!(SceneStatus::Error.can_transition(SceneStatus::GeneratingImage, false));
        assert!(!SceneStatus::Error.can_transition(SceneStatus::Completed, false));
    }

    #[test]
    fn test_check_transition_error_names_states() {
        let err = SceneStatus::Completed
            .check_transition(SceneStatus::Draft, false, "scene_1")
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::InvalidTransition {
                scene_id: "scene_1".into(),
                from: "completed".into(),
                to: "draft".into(),
            }
        );
    }

    #[test]
    fn test_status_serde_snake_case() {
        let v = serde_json::to_value(SceneStatus::GeneratingImage).unwrap();
        assert_eq!(v, "generating_image");
        let s: StageState = serde_json::from_value("awaiting_image_selection".into()).unwrap();
        assert!(s.is_checkpoint());
    }
}
