//! 阶段编排器：意图路由 -> 编剧 -> [确认剧本] -> 画师 -> [人工选图] -> 导演
//!
//! 每个阶段在 (project_id, scene_id) 租约内顺序执行；阶段内部的错误不向外抛出，
//! 统一转换为 `StageReport { status: error, detail }`，需要落库的错误写入 WorkUnit.lastError。
//! 两个 Awaiting* 状态是硬检查点：编排器不会自动越过，只有外部调用能推进。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::prompts::{self, load_prompt};
use crate::core::{
    Intent, IntentRecognizer, PipelineError, RecoveryAction, RecoveryEngine, SceneStatus,
    StageLease, StageState, StageSupervisor, TaskId, TaskKind, TaskScheduler,
};
use crate::generation::{
    ArtifactPayload, DriverSettings, FallbackSynthesizer, GenerationDriver, MediaProvider,
    ReferenceMedia,
};
use crate::llm::{CompletionRequest, LlmClient, Message};
use crate::react::{AgentConfig, AgentRuntime, ReactEvent};
use crate::store::{BlobStore, NewWorkUnit, WorkRecordStore, WorkUnit, WorkUnitPatch};
use crate::tools::{
    artist_tools, drafting_tools, parse_writer_outline, revision_tools, writer_outline_schema,
    ImageInspector, ToolExecutor, ToolRegistry,
};

/// 质检时附带的前序场景定稿图上限
const INSPECTION_REFERENCES: usize = 2;

/// 编排参数
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// 画师每次产出的候选草图数
    pub draft_count: usize,
    /// 选图后是否直接进入导演阶段
    pub auto_direct: bool,
    pub max_turns: usize,
    pub tool_timeout_secs: u64,
    pub max_concurrent_runs: usize,
    /// None 时使用客户端默认模型
    pub writer_model: Option<String>,
    pub router_model: Option<String>,
    pub temperature: f32,
    pub genre: String,
    pub tone: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            draft_count: 2,
            auto_direct: true,
            max_turns: crate::react::DEFAULT_MAX_TURNS,
            tool_timeout_secs: 300,
            max_concurrent_runs: 4,
            writer_model: None,
            router_model: None,
            temperature: 0.7,
            genre: "Sci-Fi".to_string(),
            tone: "Dark, Cinematic".to_string(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let non_empty = |s: &str| (!s.trim().is_empty()).then(|| s.to_string());
        Self {
            draft_count: cfg.pipeline.draft_count.max(1),
            auto_direct: cfg.pipeline.auto_direct,
            max_turns: cfg.agent.max_turns,
            tool_timeout_secs: cfg.agent.tool_timeout_secs,
            max_concurrent_runs: cfg.pipeline.max_concurrent_runs,
            writer_model: non_empty(&cfg.llm.model),
            router_model: non_empty(&cfg.llm.router_model),
            temperature: cfg.llm.temperature,
            genre: cfg.pipeline.genre.clone(),
            tone: cfg.pipeline.tone.clone(),
        }
    }
}

/// 编排器依赖；生命周期由进程入口持有
pub struct PipelineServices {
    pub llm: Arc<dyn LlmClient>,
    pub media: Arc<dyn MediaProvider>,
    pub fallback: Box<dyn FallbackSynthesizer>,
    pub records: Arc<dyn WorkRecordStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub driver_settings: DriverSettings,
}

/// 阶段结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Ok,
    Error,
}

/// 阶段执行结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub status: ReportStatus,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_unit_id: Option<String>,
    /// 结束时所处阶段
    pub stage: StageState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    pub detail: String,
    /// 大纲一次创建的全部场景
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub created: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
    pub degraded: bool,
}

impl StageReport {
    fn ok(project_id: &str, stage: StageState, detail: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Ok,
            project_id: project_id.to_string(),
            work_unit_id: None,
            stage,
            intent: None,
            detail: detail.into(),
            created: Vec::new(),
            candidates: Vec::new(),
            degraded: false,
        }
    }

    fn error(project_id: &str, stage: StageState, err: &PipelineError) -> Self {
        Self {
            status: ReportStatus::Error,
            ..Self::ok(project_id, stage, err.to_string())
        }
    }

    fn with_unit(mut self, id: Option<&str>) -> Self {
        self.work_unit_id = id.map(str::to_string);
        self
    }

    fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReportStatus::Ok
    }
}

/// 人工修改的字段；None 不修改
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneEdit {
    pub script: Option<String>,
    pub visual_prompt: Option<String>,
    pub motion_prompt: Option<String>,
}

/// 外部触发的阶段请求
#[derive(Debug, Clone, PartialEq)]
pub enum StageRequest {
    Start {
        project_id: String,
        input: String,
    },
    Outline {
        project_id: String,
        topic: String,
    },
    ConfirmScript {
        project_id: String,
        scene_id: String,
    },
    SelectCandidate {
        project_id: String,
        scene_id: String,
        candidate: String,
    },
    Direct {
        project_id: String,
        scene_id: String,
        motion_prompt: Option<String>,
    },
}

impl StageRequest {
    fn kind(&self) -> TaskKind {
        match self {
            StageRequest::Start { .. } | StageRequest::Outline { .. } => TaskKind::Start,
            _ => TaskKind::Resume,
        }
    }
}

struct StagePrompts {
    writer: String,
    reviser: String,
    outliner: String,
    artist: String,
    inspector: String,
    motion: String,
}

impl StagePrompts {
    fn load() -> Self {
        Self {
            writer: load_prompt("writer", prompts::WRITER),
            reviser: load_prompt("reviser", prompts::REVISER),
            outliner: load_prompt("outliner", prompts::OUTLINER),
            artist: load_prompt("artist", prompts::ARTIST),
            inspector: load_prompt("inspector", prompts::INSPECTOR),
            motion: load_prompt("motion", prompts::MOTION),
        }
    }
}

/// 阶段编排器
pub struct StageOrchestrator {
    llm: Arc<dyn LlmClient>,
    driver: Arc<GenerationDriver>,
    records: Arc<dyn WorkRecordStore>,
    blobs: Arc<dyn BlobStore>,
    recognizer: IntentRecognizer,
    supervisor: StageSupervisor,
    scheduler: TaskScheduler,
    recovery: RecoveryEngine,
    prompts: StagePrompts,
    settings: OrchestratorSettings,
    event_tx: Option<UnboundedSender<ReactEvent>>,
}

impl StageOrchestrator {
    pub fn new(services: PipelineServices, settings: OrchestratorSettings) -> Self {
        let supervisor = StageSupervisor::new();
        let driver = GenerationDriver::new(
            services.media,
            services.fallback,
            services.driver_settings,
        )
        .with_cancel_token(supervisor.cancel_token());
        Self {
            recognizer: IntentRecognizer::new(services.llm.clone(), settings.router_model.clone()),
            llm: services.llm,
            driver: Arc::new(driver),
            records: services.records,
            blobs: services.blobs,
            supervisor,
            scheduler: TaskScheduler::new(settings.max_concurrent_runs),
            recovery: RecoveryEngine::new(),
            prompts: StagePrompts::load(),
            settings,
            event_tx: None,
        }
    }

    /// 转发各阶段 Agent 的推理事件
    pub fn with_event_tx(mut self, tx: UnboundedSender<ReactEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn supervisor(&self) -> &StageSupervisor {
        &self.supervisor
    }

    fn runtime(&self, name: &str, instruction: &str, tools: ToolRegistry) -> AgentRuntime {
        let config = AgentConfig::new(name, instruction)
            .with_model(self.settings.writer_model.clone())
            .with_temperature(self.settings.temperature)
            .with_max_turns(self.settings.max_turns);
        let runtime = AgentRuntime::new(
            self.llm.clone(),
            ToolExecutor::new(tools, self.settings.tool_timeout_secs),
            config,
        )
        .with_cancel_token(self.supervisor.child_token());
        match &self.event_tx {
            Some(tx) => runtime.with_event_tx(tx.clone()),
            None => runtime,
        }
    }

    async fn load_unit(&self, project_id: &str, scene_id: &str) -> Result<WorkUnit, PipelineError> {
        self.records
            .get_unit(project_id, scene_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound {
                project_id: project_id.to_string(),
                scene_id: scene_id.to_string(),
            })
    }

    async fn latest_unit(&self, project_id: &str) -> Result<Option<WorkUnit>, PipelineError> {
        let units = self.records.list_units(project_id).await?;
        Ok(crate::store::latest_unit(&units).cloned())
    }

    /// 把阶段结果转换为报告；需要落库的错误写入 WorkUnit
    async fn finish(
        &self,
        project_id: &str,
        scene_id: Option<&str>,
        stage: StageState,
        result: Result<StageReport, PipelineError>,
    ) -> StageReport {
        let err = match result {
            Ok(report) => return report,
            Err(err) => err,
        };
        let action = self.recovery.handle(&err);
        tracing::warn!(
            project_id,
            scene_id = scene_id.unwrap_or("-"),
            stage = %stage,
            action = ?action,
            error = %err,
            "stage failed"
        );
        if matches!(action, RecoveryAction::RecordError | RecoveryAction::Fallback) {
            if let Some(id) = scene_id {
                let patch = WorkUnitPatch::new().failed(err.to_string());
                if let Err(e) = self.records.update_unit(project_id, id, patch).await {
                    tracing::error!(project_id, scene_id = id, error = %e, "could not record stage error");
                }
            }
        }
        StageReport::error(project_id, stage, &err).with_unit(scene_id)
    }

    // ---------------------------------------------------------------- routing

    /// 入口：识别意图并执行对应阶段序列，停在下一个检查点
    pub async fn start(&self, project_id: &str, input: &str) -> StageReport {
        let classification = self.recognizer.recognize(input).await;
        tracing::info!(
            project_id,
            intent = %classification.intent,
            fell_back = classification.fell_back,
            "request routed"
        );
        let latest = match classification.intent {
            Intent::ReviseScene | Intent::RegenerateImage => {
                match self.latest_unit(project_id).await {
                    Ok(unit) => unit,
                    Err(err) => {
                        return StageReport::error(project_id, StageState::Routing, &err)
                            .with_intent(classification.intent)
                    }
                }
            }
            Intent::NewProject | Intent::Other => None,
        };
        let report = match (classification.intent, latest) {
            (Intent::ReviseScene, Some(unit)) => self.revise(unit, input).await,
            (Intent::RegenerateImage, Some(unit)) => {
                let scene_id = unit.id.clone();
                let result = self.illustrate_guarded(unit, true).await;
                self.finish(project_id, Some(scene_id.as_str()), StageState::Illustrating, result)
                    .await
            }
            // 没有可修改的场景时按默认序列起草
            _ => self.draft(project_id, input).await,
        };
        report.with_intent(classification.intent)
    }

    // --------------------------------------------------------------- drafting

    /// 编剧阶段：运行编剧 Agent，读回存储确认新场景已保存
    pub async fn draft(&self, project_id: &str, input: &str) -> StageReport {
        let result = self.try_draft(project_id, input).await;
        self.finish(project_id, None, StageState::Drafting, result).await
    }

    async fn try_draft(&self, project_id: &str, input: &str) -> Result<StageReport, PipelineError> {
        let _lease = self.supervisor.acquire_project(project_id)?;
        let before: HashSet<String> = self
            .records
            .list_units(project_id)
            .await?
            .into_iter()
            .map(|u| u.id)
            .collect();

        let tools = drafting_tools(
            self.records.clone(),
            project_id,
            &self.settings.genre,
            &self.settings.tone,
        );
        let outcome = self
            .runtime("writer", &self.prompts.writer, tools)
            .run(input)
            .await?;

        let created: Vec<WorkUnit> = self
            .records
            .list_units(project_id)
            .await?
            .into_iter()
            .filter(|u| !before.contains(&u.id))
            .collect();
        if created.is_empty() {
            return Err(PipelineError::Stage(
                "writer finished without saving a scene".into(),
            ));
        }
        let mut ids = Vec::with_capacity(created.len());
        for unit in &created {
            self.records
                .update_unit(
                    project_id,
                    &unit.id,
                    WorkUnitPatch::new().stage(StageState::AwaitingScriptConfirmation),
                )
                .await?;
            ids.push(unit.id.clone());
        }
        tracing::info!(project_id, scenes = ids.len(), turns = outcome.turn.turn_count, "draft saved, awaiting script confirmation");

        let mut report = StageReport::ok(
            project_id,
            StageState::AwaitingScriptConfirmation,
            outcome.response,
        )
        .with_unit(ids.last().map(String::as_str));
        if ids.len() > 1 {
            report.created = ids;
        }
        Ok(report)
    }

    /// 结构化大纲：一次调用产出多个场景，全部停在剧本确认检查点
    pub async fn draft_outline(&self, project_id: &str, topic: &str) -> StageReport {
        let result = self.try_draft_outline(project_id, topic).await;
        self.finish(project_id, None, StageState::Drafting, result).await
    }

    async fn try_draft_outline(
        &self,
        project_id: &str,
        topic: &str,
    ) -> Result<StageReport, PipelineError> {
        let _lease = self.supervisor.acquire_project(project_id)?;
        let request = CompletionRequest::new(vec![
            Message::system(self.prompts.outliner.clone()),
            Message::user(format!(
                "Topic: {topic}\nGenre: {}\nTone: {}",
                self.settings.genre, self.settings.tone
            )),
        ])
        .with_model(self.settings.writer_model.clone())
        .with_temperature(self.settings.temperature)
        .with_response_schema(writer_outline_schema());
        let response = self.llm.complete(&request).await?;
        let outline = parse_writer_outline(&response.text_or_empty()).map_err(PipelineError::Stage)?;
        if outline.scenes.is_empty() {
            return Err(PipelineError::Stage("outline contains no scenes".into()));
        }

        let mut ids = Vec::with_capacity(outline.scenes.len());
        for scene in outline.scenes {
            let id = self
                .records
                .create_unit(
                    project_id,
                    NewWorkUnit {
                        sequence_number: scene.sequence_number,
                        script: scene.script,
                        visual_prompt: scene.visual_prompt,
                        motion_prompt: String::new(),
                        rationale: scene.rationale,
                        characters: scene.characters_involved,
                    },
                )
                .await?;
            self.records
                .update_unit(
                    project_id,
                    &id,
                    WorkUnitPatch::new().stage(StageState::AwaitingScriptConfirmation),
                )
                .await?;
            ids.push(id);
        }
        tracing::info!(project_id, scenes = ids.len(), "outline drafted");
        let mut report = StageReport::ok(
            project_id,
            StageState::AwaitingScriptConfirmation,
            format!("{} scenes drafted", ids.len()),
        )
        .with_unit(ids.last().map(String::as_str));
        report.created = ids;
        Ok(report)
    }

    /// 改稿：在最新场景上运行编剧，回到剧本确认检查点
    async fn revise(&self, unit: WorkUnit, request: &str) -> StageReport {
        let project_id = unit.project_id.clone();
        let scene_id = unit.id.clone();
        let result = self.try_revise(unit, request).await;
        self.finish(&project_id, Some(scene_id.as_str()), StageState::Drafting, result)
            .await
    }

    async fn try_revise(&self, unit: WorkUnit, request: &str) -> Result<StageReport, PipelineError> {
        let _lease = self.supervisor.acquire(&unit.project_id, &unit.id)?;
        // 改稿是显式的重新生成，允许从任意状态回到 draft
        unit.status.check_transition(SceneStatus::Draft, true, &unit.id)?;

        let tools = revision_tools(
            self.records.clone(),
            &unit.project_id,
            &unit.id,
            &self.settings.genre,
            &self.settings.tone,
        );
        let input = format!(
            "Current script:\n{}\n\nCurrent visual prompt:\n{}\n\nRequested change: {}",
            unit.script, unit.visual_prompt, request
        );
        let outcome = self
            .runtime("reviser", &self.prompts.reviser, tools)
            .run(&input)
            .await?;

        let revised = self.load_unit(&unit.project_id, &unit.id).await?;
        if revised.script == unit.script {
            return Err(PipelineError::Stage("writer did not update the scene".into()));
        }
        self.records
            .update_unit(
                &unit.project_id,
                &unit.id,
                WorkUnitPatch::new()
                    .status(SceneStatus::Draft)
                    .stage(StageState::AwaitingScriptConfirmation)
                    // 旧成片属于旧剧本
                    .video_url(None)
                    .video_composition(None)
                    .degraded(false),
            )
            .await?;
        Ok(StageReport::ok(
            &unit.project_id,
            StageState::AwaitingScriptConfirmation,
            outcome.response,
        )
        .with_unit(Some(unit.id.as_str())))
    }

    // ------------------------------------------------------------ illustrating

    /// 检查点 1：人工确认剧本，进入画师阶段
    pub async fn confirm_script(&self, project_id: &str, scene_id: &str) -> StageReport {
        let result = self.try_confirm_script(project_id, scene_id).await;
        self.finish(project_id, Some(scene_id), StageState::Illustrating, result)
            .await
    }

    async fn try_confirm_script(
        &self,
        project_id: &str,
        scene_id: &str,
    ) -> Result<StageReport, PipelineError> {
        let lease = self.supervisor.acquire(project_id, scene_id)?;
        let unit = self.load_unit(project_id, scene_id).await?;
        let retry = unit.stage == StageState::Illustrating && unit.status == SceneStatus::Error;
        if unit.stage != StageState::AwaitingScriptConfirmation && !retry {
            return Err(PipelineError::InvalidTransition {
                scene_id: scene_id.to_string(),
                from: unit.stage.to_string(),
                to: StageState::Illustrating.to_string(),
            });
        }
        self.illustrate(unit, false, lease).await
    }

    async fn illustrate_guarded(
        &self,
        unit: WorkUnit,
        regenerate: bool,
    ) -> Result<StageReport, PipelineError> {
        let lease = self.supervisor.acquire(&unit.project_id, &unit.id)?;
        self.illustrate(unit, regenerate, lease).await
    }

    /// 重新生成候选草图（显式重新生成，可从任意阶段进入）
    pub async fn regenerate_image(&self, project_id: &str, scene_id: &str) -> StageReport {
        let result = match self.load_unit(project_id, scene_id).await {
            Ok(unit) => self.illustrate_guarded(unit, true).await,
            Err(e) => Err(e),
        };
        self.finish(project_id, Some(scene_id), StageState::Illustrating, result)
            .await
    }

    /// 画师阶段：产出 N 张候选草图，停在选图检查点
    async fn illustrate(
        &self,
        unit: WorkUnit,
        regenerate: bool,
        _lease: StageLease,
    ) -> Result<StageReport, PipelineError> {
        let (project_id, scene_id) = (unit.project_id.as_str(), unit.id.as_str());
        unit.status
            .check_transition(SceneStatus::GeneratingImage, regenerate, scene_id)?;
        self.records
            .update_unit(
                project_id,
                scene_id,
                WorkUnitPatch::new()
                    .status(SceneStatus::GeneratingImage)
                    .stage(StageState::Illustrating),
            )
            .await?;

        let inspector = ImageInspector {
            llm: self.llm.clone(),
            model: self.settings.writer_model.clone(),
            instruction: self.prompts.inspector.clone(),
            max_references: INSPECTION_REFERENCES,
        };
        let tools = artist_tools(
            self.driver.clone(),
            self.blobs.clone(),
            self.records.clone(),
            inspector,
            project_id,
            scene_id,
            self.settings.draft_count,
        );
        let input = format!(
            "Scene {} of project {}.\nVisual prompt:\n{}\nProduce {} draft images.",
            unit.sequence_number, project_id, unit.visual_prompt, self.settings.draft_count
        );
        let outcome = self
            .runtime("artist", &self.prompts.artist, tools)
            .run(&input)
            .await?;

        let drawn = self.load_unit(project_id, scene_id).await?;
        if drawn.candidates.is_empty() || drawn.candidates == unit.candidates {
            return Err(PipelineError::Stage("artist produced no draft images".into()));
        }
        self.records
            .update_unit(
                project_id,
                scene_id,
                WorkUnitPatch::new().stage(StageState::AwaitingImageSelection),
            )
            .await?;
        tracing::info!(project_id, scene_id, drafts = drawn.candidates.len(), "drafts ready, awaiting image selection");

        let mut report = StageReport::ok(project_id, StageState::AwaitingImageSelection, outcome.response)
            .with_unit(Some(scene_id));
        report.candidates = drawn.candidates;
        Ok(report)
    }

    // ------------------------------------------------------------- selection

    /// 检查点 2：人工选定一张候选图，其余删除；开启 auto_direct 时直接进入导演阶段
    pub async fn select_candidate(
        &self,
        project_id: &str,
        scene_id: &str,
        candidate: &str,
    ) -> StageReport {
        let result = self.try_select(project_id, scene_id, candidate).await;
        let report = self
            .finish(project_id, Some(scene_id), StageState::AwaitingImageSelection, result)
            .await;
        if report.is_ok() && self.settings.auto_direct {
            return self.direct(project_id, scene_id, None).await;
        }
        report
    }

    async fn try_select(
        &self,
        project_id: &str,
        scene_id: &str,
        candidate: &str,
    ) -> Result<StageReport, PipelineError> {
        let _lease = self.supervisor.acquire(project_id, scene_id)?;
        let unit = self.load_unit(project_id, scene_id).await?;
        if unit.stage != StageState::AwaitingImageSelection {
            return Err(PipelineError::InvalidTransition {
                scene_id: scene_id.to_string(),
                from: unit.stage.to_string(),
                to: SceneStatus::ImageSelected.to_string(),
            });
        }
        let chosen = resolve_candidate(&unit.candidates, candidate)
            .ok_or_else(|| PipelineError::CandidateNotFound(candidate.to_string()))?;
        unit.status
            .check_transition(SceneStatus::ImageSelected, false, scene_id)?;

        let bytes = self.blobs.load(&chosen).await?;
        let image_url = self
            .blobs
            .store(&bytes, &format!("{scene_id}.png"), Some(project_id))
            .await?;
        self.records
            .update_unit(
                project_id,
                scene_id,
                WorkUnitPatch::new()
                    .status(SceneStatus::ImageSelected)
                    .stage(StageState::Directing)
                    .image_url(image_url.clone())
                    .candidates(Vec::new()),
            )
            .await?;
        for draft in &unit.candidates {
            if let Err(e) = self.blobs.remove(draft).await {
                tracing::debug!(reference = %draft, error = %e, "draft not removed");
            }
        }
        tracing::info!(project_id, scene_id, image = %image_url, "candidate promoted");
        Ok(StageReport::ok(project_id, StageState::Directing, image_url).with_unit(Some(scene_id)))
    }

    // -------------------------------------------------------------- directing

    /// 导演阶段：以选定图为参考生成视频；主路径失败时兜底，结果始终是 completed 或 error
    pub async fn direct(
        &self,
        project_id: &str,
        scene_id: &str,
        motion_override: Option<String>,
    ) -> StageReport {
        let result = self.try_direct(project_id, scene_id, motion_override).await;
        self.finish(project_id, Some(scene_id), StageState::Directing, result)
            .await
    }

    async fn try_direct(
        &self,
        project_id: &str,
        scene_id: &str,
        motion_override: Option<String>,
    ) -> Result<StageReport, PipelineError> {
        let _lease = self.supervisor.acquire(project_id, scene_id)?;
        let unit = self.load_unit(project_id, scene_id).await?;
        let regenerate = match unit.stage {
            StageState::Directing => false,
            StageState::Completed => true,
            other => {
                return Err(PipelineError::InvalidTransition {
                    scene_id: scene_id.to_string(),
                    from: other.to_string(),
                    to: StageState::Directing.to_string(),
                })
            }
        };
        let image_url = unit
            .image_url
            .clone()
            .ok_or_else(|| PipelineError::Stage("scene has no selected image".into()))?;
        unit.status
            .check_transition(SceneStatus::GeneratingVideo, regenerate, scene_id)?;
        // 参考图在状态切换前读取，读不到时单元保持原状态
        let reference = ReferenceMedia::png(self.blobs.load(&image_url).await?, Some(image_url));

        let motion = match motion_override.filter(|m| !m.trim().is_empty()) {
            Some(m) => m,
            None if !unit.motion_prompt.trim().is_empty() => unit.motion_prompt.clone(),
            None => match self.motion_prompt_for(&unit).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(scene_id, error = %e, "motion prompt unavailable, using visual prompt");
                    unit.visual_prompt.clone()
                }
            },
        };
        self.records
            .update_unit(
                project_id,
                scene_id,
                WorkUnitPatch::new()
                    .status(SceneStatus::GeneratingVideo)
                    .stage(StageState::Directing)
                    .motion_prompt(motion.clone()),
            )
            .await?;

        let artifact = self.driver.run(&motion, Some(&reference)).await?;
        let degraded = artifact.is_degraded();
        let patch = WorkUnitPatch::new()
            .status(SceneStatus::Completed)
            .stage(StageState::Completed)
            .degraded(degraded);
        let (patch, detail) = match artifact.payload {
            ArtifactPayload::Media { bytes, mime_type } => {
                let name = format!("{scene_id}.{}", extension_for(&mime_type));
                let video_url = self.blobs.store(&bytes, &name, Some(project_id)).await?;
                (
                    patch.video_url(Some(video_url.clone())).video_composition(None),
                    video_url,
                )
            }
            ArtifactPayload::Composition(composition) => {
                let detail = format!("{} composition of {}", composition.kind, composition.source_image);
                (patch.video_url(None).video_composition(Some(composition)), detail)
            }
        };
        self.records.update_unit(project_id, scene_id, patch).await?;
        if degraded {
            tracing::warn!(project_id, scene_id, "scene completed with degraded fallback output");
        } else {
            tracing::info!(project_id, scene_id, "scene completed");
        }

        let mut report =
            StageReport::ok(project_id, StageState::Completed, detail).with_unit(Some(scene_id));
        report.degraded = degraded;
        Ok(report)
    }

    async fn motion_prompt_for(&self, unit: &WorkUnit) -> Result<String, PipelineError> {
        let request = CompletionRequest::new(vec![
            Message::system(self.prompts.motion.clone()),
            Message::user(format!(
                "Script:\n{}\n\nVisual description:\n{}",
                unit.script, unit.visual_prompt
            )),
        ])
        .with_model(self.settings.writer_model.clone())
        .with_temperature(self.settings.temperature);
        let text = self.llm.complete(&request).await?.text_or_empty();
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::Stage("empty motion prompt".into()));
        }
        Ok(text.to_string())
    }

    /// 生成并保存运动镜头提示
    pub async fn generate_motion_prompt(&self, project_id: &str, scene_id: &str) -> StageReport {
        let result = self.try_generate_motion_prompt(project_id, scene_id).await;
        let stage = match &result {
            Ok(r) => r.stage,
            Err(_) => StageState::Directing,
        };
        self.finish(project_id, Some(scene_id), stage, result).await
    }

    async fn try_generate_motion_prompt(
        &self,
        project_id: &str,
        scene_id: &str,
    ) -> Result<StageReport, PipelineError> {
        let _lease = self.supervisor.acquire(project_id, scene_id)?;
        let unit = self.load_unit(project_id, scene_id).await?;
        let motion = self.motion_prompt_for(&unit).await?;
        self.records
            .update_unit(project_id, scene_id, WorkUnitPatch::new().motion_prompt(motion.clone()))
            .await?;
        Ok(StageReport::ok(project_id, unit.stage, motion).with_unit(Some(scene_id)))
    }

    // ------------------------------------------------------------ human edits

    /// 人工修改剧本 / 提示；生成进行中的场景不可修改
    pub async fn edit_scene(
        &self,
        project_id: &str,
        scene_id: &str,
        edit: SceneEdit,
    ) -> Result<WorkUnit, PipelineError> {
        let lease = self.supervisor.acquire(project_id, scene_id)?;
        let unit = self.load_unit(project_id, scene_id).await?;
        if unit.status.is_generating() && !unit.stage.is_checkpoint() {
            return Err(PipelineError::StageInProgress {
                key: lease.key().to_string(),
            });
        }
        let mut patch = WorkUnitPatch::new();
        patch.script = edit.script;
        patch.visual_prompt = edit.visual_prompt;
        patch.motion_prompt = edit.motion_prompt;
        Ok(self.records.update_unit(project_id, scene_id, patch).await?)
    }

    // ----------------------------------------------------------------- status

    pub async fn scene_status(&self, project_id: &str, scene_id: &str) -> Result<WorkUnit, PipelineError> {
        self.load_unit(project_id, scene_id).await
    }

    pub async fn project_status(&self, project_id: &str) -> Result<Vec<WorkUnit>, PipelineError> {
        Ok(self.records.list_units(project_id).await?)
    }

    pub async fn list_projects(&self) -> Result<Vec<String>, PipelineError> {
        Ok(self.records.list_projects().await?)
    }

    // ------------------------------------------------------------- dispatching

    /// 执行一个阶段请求；任何失败都以 error 报告返回
    pub async fn dispatch(&self, request: StageRequest) -> StageReport {
        match request {
            StageRequest::Start { project_id, input } => self.start(&project_id, &input).await,
            StageRequest::Outline { project_id, topic } => {
                self.draft_outline(&project_id, &topic).await
            }
            StageRequest::ConfirmScript {
                project_id,
                scene_id,
            } => self.confirm_script(&project_id, &scene_id).await,
            StageRequest::SelectCandidate {
                project_id,
                scene_id,
                candidate,
            } => self.select_candidate(&project_id, &scene_id, &candidate).await,
            StageRequest::Direct {
                project_id,
                scene_id,
                motion_prompt,
            } => self.direct(&project_id, &scene_id, motion_prompt).await,
        }
    }

    /// 在后台运行一次流水线请求
    pub fn spawn(self: &Arc<Self>, request: StageRequest) -> (TaskId, JoinHandle<StageReport>) {
        let this = Arc::clone(self);
        self.scheduler
            .spawn(request.kind(), async move { this.dispatch(request).await })
    }

    pub fn active_runs(&self) -> usize {
        self.scheduler.active_tasks()
    }

    /// 取消全部运行中的阶段，并在 grace 内等待后台任务退出
    pub async fn shutdown(&self, grace: Duration) {
        self.supervisor.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        while self.scheduler.active_tasks() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tracing::info!(remaining = self.scheduler.active_tasks(), "orchestrator shut down");
    }
}

/// 解析选图参数：完整引用、从 1 开始的序号或文件名
pub fn resolve_candidate(candidates: &[String], choice: &str) -> Option<String> {
    let choice = choice.trim();
    if let Some(found) = candidates.iter().find(|c| c.as_str() == choice) {
        return Some(found.clone());
    }
    if let Ok(index) = choice.parse::<usize>() {
        return index
            .checked_sub(1)
            .and_then(|i| candidates.get(i))
            .cloned();
    }
    if choice.is_empty() {
        return None;
    }
    candidates
        .iter()
        .find(|c| c.rsplit('/').next() == Some(choice))
        .cloned()
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        _ => "mp4",
    }
}
