//! 核心编排层：错误与恢复、状态投影、意图识别、阶段监管、任务调度、阶段编排

pub mod error;
pub mod intent;
pub mod orchestrator;
pub mod prompts;
pub mod recovery;
pub mod state;
pub mod supervisor;
pub mod task_scheduler;

pub use error::{PipelineError, RecoveryAction};
pub use intent::{Classification, Intent, IntentRecognizer};
pub use orchestrator::{
    resolve_candidate, OrchestratorSettings, PipelineServices, ReportStatus, SceneEdit,
    StageOrchestrator, StageReport, StageRequest,
};
pub use recovery::RecoveryEngine;
pub use state::{SceneStatus, StageState};
pub use supervisor::{StageLease, StageSupervisor};
pub use task_scheduler::{TaskId, TaskKind, TaskScheduler};
