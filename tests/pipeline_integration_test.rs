//! 流水线集成测试：Mock Completion Provider + Mock 媒体提供方 + 内存记录存储 + 临时目录 Blob

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use dreamfactory::core::{
    Intent, OrchestratorSettings, PipelineServices, SceneEdit, SceneStatus, StageOrchestrator,
    StageRequest, StageState,
};
use dreamfactory::generation::{
    CompositionFallback, DriverSettings, FallbackSynthesizer, FfmpegFallback, MediaError,
    MockMediaProvider,
};
use dreamfactory::llm::{CompletionResponse, MockLlmClient, Role, ToolInvocation};
use dreamfactory::store::{
    BlobStore, FileRecordStore, LocalBlobStore, NewWorkUnit, WorkRecordStore, WorkUnitPatch,
};

struct Harness {
    dir: tempfile::TempDir,
    llm: Arc<MockLlmClient>,
    media: Arc<MockMediaProvider>,
    records: Arc<dyn WorkRecordStore>,
    orchestrator: Arc<StageOrchestrator>,
}

fn fast_driver() -> DriverSettings {
    DriverSettings {
        max_submit_retries: 3,
        backoff_base: Duration::from_millis(1),
        poll_interval: Duration::from_millis(1),
        poll_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
    }
}

fn build(
    llm: MockLlmClient,
    fallback: Box<dyn FallbackSynthesizer>,
    settings: OrchestratorSettings,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(llm);
    let media = Arc::new(MockMediaProvider::new());
    let records: Arc<dyn WorkRecordStore> = Arc::new(FileRecordStore::in_memory());
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir.path(), "/static/media"));
    let orchestrator = StageOrchestrator::new(
        PipelineServices {
            llm: llm.clone(),
            media: media.clone(),
            fallback,
            records: records.clone(),
            blobs,
            driver_settings: fast_driver(),
        },
        settings,
    );
    Harness {
        dir,
        llm,
        media,
        records,
        orchestrator: Arc::new(orchestrator),
    }
}

fn harness() -> Harness {
    build(
        MockLlmClient::offline(),
        Box::new(CompositionFallback::default()),
        OrchestratorSettings::default(),
    )
}

fn manual_harness() -> Harness {
    build(
        MockLlmClient::offline(),
        Box::new(CompositionFallback::default()),
        OrchestratorSettings {
            auto_direct: false,
            ..OrchestratorSettings::default()
        },
    )
}

impl Harness {
    /// 公开引用 -> 临时目录中的文件
    fn blob_path(&self, reference: &str) -> std::path::PathBuf {
        self.dir
            .path()
            .join(reference.trim_start_matches("/static/media/"))
    }

    async fn drafted_scene(&self, project_id: &str) -> String {
        let report = self.orchestrator.start(project_id, "Make a cyberpunk movie").await;
        assert!(report.is_ok(), "{}", report.detail);
        report.work_unit_id.unwrap()
    }

    async fn illustrated_scene(&self, project_id: &str) -> (String, Vec<String>) {
        let scene_id = self.drafted_scene(project_id).await;
        let report = self.orchestrator.confirm_script(project_id, &scene_id).await;
        assert!(report.is_ok(), "{}", report.detail);
        (scene_id, report.candidates)
    }
}

#[tokio::test]
async fn test_scenario_a_new_project_halts_at_script_confirmation() {
    let h = harness();
    let report = h.orchestrator.start("p1", "Make a cyberpunk movie").await;

    assert!(report.is_ok(), "{}", report.detail);
    assert_eq!(report.intent, Some(Intent::NewProject));
    assert_eq!(report.stage, StageState::AwaitingScriptConfirmation);

    let scene_id = report.work_unit_id.unwrap();
    let unit = h.records.get_unit("p1", &scene_id).await.unwrap().unwrap();
    assert_eq!(unit.status, SceneStatus::Draft);
    assert_eq!(unit.stage, StageState::AwaitingScriptConfirmation);
    assert!(!unit.script.is_empty());
    assert!(!unit.visual_prompt.is_empty());

    // 路由调用不带工具；检查点之后没有任何媒体调用
    let requests = h.llm.requests();
    assert!(requests[0].tools.is_empty());
    assert_eq!(h.media.image_calls(), 0);
}

#[tokio::test]
async fn test_scenario_b_two_candidates_pending_selection() {
    let h = harness();
    let (scene_id, candidates) = h.illustrated_scene("p1").await;

    assert_eq!(candidates.len(), 2);
    assert_eq!(h.media.image_calls(), 2);
    for c in &candidates {
        assert!(h.blob_path(c).exists());
    }

    let unit = h.records.get_unit("p1", &scene_id).await.unwrap().unwrap();
    assert_eq!(unit.stage, StageState::AwaitingImageSelection);
    assert_eq!(unit.status, SceneStatus::GeneratingImage);
    assert!(unit.image_url.is_none());
    assert_eq!(h.media.submit_calls(), 0);
}

#[tokio::test]
async fn test_selection_promotes_one_candidate_and_directs() {
    let h = harness();
    let (scene_id, candidates) = h.illustrated_scene("p1").await;

    let report = h.orchestrator.select_candidate("p1", &scene_id, "2").await;
    assert!(report.is_ok(), "{}", report.detail);
    assert_eq!(report.stage, StageState::Completed);
    assert!(!report.degraded);

    let unit = h.records.get_unit("p1", &scene_id).await.unwrap().unwrap();
    assert_eq!(unit.status, SceneStatus::Completed);
    assert!(unit.candidates.is_empty());
    assert!(!unit.motion_prompt.is_empty());
    let image_url = unit.image_url.unwrap();
    assert_eq!(image_url, format!("/static/media/p1/{scene_id}.png"));
    assert!(h.blob_path(&image_url).exists());
    assert!(h.blob_path(&unit.video_url.unwrap()).exists());
    for c in &candidates {
        assert!(!h.blob_path(c).exists());
    }
}

#[tokio::test]
async fn test_scenario_c_rate_limited_submission_completes_degraded() {
    let h = harness();
    let (scene_id, _) = h.illustrated_scene("p1").await;
    for _ in 0..3 {
        h.media
            .push_submission(Err(MediaError::RateLimited("429 RESOURCE_EXHAUSTED".into())));
    }

    let report = h.orchestrator.select_candidate("p1", &scene_id, "1").await;
    assert!(report.is_ok(), "{}", report.detail);
    assert!(report.degraded);
    assert_eq!(h.media.submit_calls(), 3);
    assert_eq!(h.media.poll_calls(), 0);

    let unit = h.records.get_unit("p1", &scene_id).await.unwrap().unwrap();
    assert_eq!(unit.status, SceneStatus::Completed);
    assert!(unit.degraded);
    assert!(unit.video_url.is_none());
    assert!(unit.last_error.is_none());
    let composition = unit.video_composition.unwrap();
    assert_eq!(composition.kind, "ken_burns");
    assert_eq!(Some(composition.source_image), unit.image_url);
}

#[tokio::test]
async fn test_scenario_d_unknown_tool_is_fed_back_and_loop_continues() {
    let llm = MockLlmClient::new();
    llm.push_text("NEW_PROJECT");
    llm.push_tool_call("summon_actor", json!({"name": "Neo"}));
    llm.push_tool_call(
        "save_scene_script",
        json!({"sequence_number": 1, "script": "INT. LAB", "visual_prompt": "green monitors"}),
    );
    llm.push_text("Scene saved.");
    let h = build(
        llm,
        Box::new(CompositionFallback::default()),
        OrchestratorSettings::default(),
    );

    let report = h.orchestrator.start("p1", "Make a hacker movie").await;
    assert!(report.is_ok(), "{}", report.detail);

    let requests = h.llm.requests();
    assert_eq!(requests.len(), 4);
    let feedback = requests[2].messages.last().unwrap();
    assert_eq!(feedback.role, Role::Tool);
    assert_eq!(feedback.tool_results.len(), 1);
    assert_eq!(feedback.tool_results[0].payload, json!({"error": "tool not found"}));
}

#[tokio::test]
async fn test_concurrent_double_selection_promotes_once() {
    let h = manual_harness();
    let (scene_id, _) = h.illustrated_scene("p1").await;

    let (a, b) = tokio::join!(
        h.orchestrator.select_candidate("p1", &scene_id, "1"),
        h.orchestrator.select_candidate("p1", &scene_id, "2"),
    );
    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);

    let again = h.orchestrator.select_candidate("p1", &scene_id, "1").await;
    assert!(!again.is_ok());
    assert!(again.detail.contains("Invalid transition"), "{}", again.detail);

    let unit = h.records.get_unit("p1", &scene_id).await.unwrap().unwrap();
    assert_eq!(unit.status, SceneStatus::ImageSelected);
    assert_eq!(unit.stage, StageState::Directing);
    assert!(unit.image_url.is_some());
    assert!(unit.last_error.is_none());
}

#[tokio::test]
async fn test_unknown_candidate_leaves_scene_untouched() {
    let h = manual_harness();
    let (scene_id, candidates) = h.illustrated_scene("p1").await;

    let report = h.orchestrator.select_candidate("p1", &scene_id, "7").await;
    assert!(!report.is_ok());
    assert!(report.detail.contains("Candidate not found"));

    let unit = h.records.get_unit("p1", &scene_id).await.unwrap().unwrap();
    assert_eq!(unit.stage, StageState::AwaitingImageSelection);
    assert_eq!(unit.status, SceneStatus::GeneratingImage);
    assert_eq!(unit.candidates, candidates);
}

#[tokio::test]
async fn test_confirm_twice_is_rejected() {
    let h = manual_harness();
    let (scene_id, _) = h.illustrated_scene("p1").await;
    let report = h.orchestrator.confirm_script("p1", &scene_id).await;
    assert!(!report.is_ok());
    assert_eq!(h.media.image_calls(), 2);
}

#[tokio::test]
async fn test_runtime_exhausted_is_recorded_on_scene() {
    let llm = MockLlmClient::repeating(CompletionResponse::tool_calls(vec![ToolInvocation::new(
        "call_1",
        "submit_final_scene",
        json!({}),
    )]));
    let h = build(
        llm,
        Box::new(CompositionFallback::default()),
        OrchestratorSettings {
            max_turns: 3,
            ..OrchestratorSettings::default()
        },
    );
    let scene_id = h
        .records
        .create_unit(
            "p1",
            NewWorkUnit {
                sequence_number: 1,
                script: "s".into(),
                visual_prompt: "v".into(),
                ..NewWorkUnit::default()
            },
        )
        .await
        .unwrap();
    h.records
        .update_unit(
            "p1",
            &scene_id,
            WorkUnitPatch::new().stage(StageState::AwaitingScriptConfirmation),
        )
        .await
        .unwrap();

    let report = h.orchestrator.confirm_script("p1", &scene_id).await;
    assert!(!report.is_ok());
    assert_eq!(h.llm.requests().len(), 3);

    let unit = h.records.get_unit("p1", &scene_id).await.unwrap().unwrap();
    assert_eq!(unit.status, SceneStatus::Error);
    assert!(unit.last_error.unwrap().contains("exhausted"));

    // error -> generating_image 重试
    assert_eq!(unit.stage, StageState::Illustrating);
}

#[tokio::test]
async fn test_failed_fallback_records_error_then_retry_completes() {
    let h = build(
        MockLlmClient::offline(),
        Box::new(FfmpegFallback::new("/nonexistent/ffmpeg", 1)),
        OrchestratorSettings {
            auto_direct: false,
            ..OrchestratorSettings::default()
        },
    );
    let (scene_id, _) = h.illustrated_scene("p1").await;
    let selected = h.orchestrator.select_candidate("p1", &scene_id, "1").await;
    assert_eq!(selected.stage, StageState::Directing);

    h.media
        .push_submission(Err(MediaError::Fatal("safety filter".into())));
    let report = h.orchestrator.direct("p1", &scene_id, Some("slow push in".into())).await;
    assert!(!report.is_ok());
    let unit = h.records.get_unit("p1", &scene_id).await.unwrap().unwrap();
    assert_eq!(unit.status, SceneStatus::Error);
    assert!(unit.last_error.unwrap().contains("Generation failed"));
    assert!(unit.video_url.is_none());

    let retry = h.orchestrator.direct("p1", &scene_id, None).await;
    assert!(retry.is_ok(), "{}", retry.detail);
    let unit = h.records.get_unit("p1", &scene_id).await.unwrap().unwrap();
    assert_eq!(unit.status, SceneStatus::Completed);
    assert_eq!(unit.motion_prompt, "slow push in");
    assert!(unit.last_error.is_none());
    assert!(!unit.degraded);
}

#[tokio::test]
async fn test_revise_intent_rewrites_latest_scene() {
    let h = manual_harness();
    let scene_id = h.drafted_scene("p1").await;

    h.llm.push_text("REVISE_SCENE");
    h.llm
        .push_tool_call("update_scene_script", json!({"script": "INT. LAB - the funny version"}));
    h.llm.push_text("Revised.");
    let report = h.orchestrator.start("p1", "Make it funnier").await;

    assert!(report.is_ok(), "{}", report.detail);
    assert_eq!(report.intent, Some(Intent::ReviseScene));
    assert_eq!(report.work_unit_id.as_deref(), Some(scene_id.as_str()));
    let unit = h.records.get_unit("p1", &scene_id).await.unwrap().unwrap();
    assert_eq!(unit.script, "INT. LAB - the funny version");
    assert_eq!(unit.status, SceneStatus::Draft);
    assert_eq!(unit.stage, StageState::AwaitingScriptConfirmation);
    assert_eq!(h.records.list_units("p1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_revising_completed_scene_clears_old_video() {
    let h = harness();
    let (scene_id, _) = h.illustrated_scene("p1").await;
    for _ in 0..3 {
        h.media
            .push_submission(Err(MediaError::RateLimited("429 RESOURCE_EXHAUSTED".into())));
    }
    let report = h.orchestrator.select_candidate("p1", &scene_id, "1").await;
    assert!(report.is_ok() && report.degraded, "{}", report.detail);

    h.llm.push_text("REVISE_SCENE");
    h.llm
        .push_tool_call("update_scene_script", json!({"script": "INT. LAB - darker ending"}));
    h.llm.push_text("Revised.");
    let report = h.orchestrator.start("p1", "Give it a darker ending").await;
    assert!(report.is_ok(), "{}", report.detail);

    let unit = h.records.get_unit("p1", &scene_id).await.unwrap().unwrap();
    assert_eq!(unit.status, SceneStatus::Draft);
    assert!(!unit.degraded);
    assert!(unit.video_url.is_none());
    assert!(unit.video_composition.is_none());
}

#[tokio::test]
async fn test_regenerate_intent_redraws_latest_scene() {
    let h = manual_harness();
    let (scene_id, first) = h.illustrated_scene("p1").await;

    h.llm.push_text("REGENERATE_IMAGE");
    let report = h.orchestrator.start("p1", "Redraw the background").await;
    assert!(report.is_ok(), "{}", report.detail);
    assert_eq!(report.intent, Some(Intent::RegenerateImage));
    assert_eq!(report.candidates.len(), 2);
    assert!(report.candidates.iter().all(|c| !first.contains(c)));
    assert_eq!(h.media.image_calls(), 4);

    let unit = h.records.get_unit("p1", &scene_id).await.unwrap().unwrap();
    assert_eq!(unit.stage, StageState::AwaitingImageSelection);
}

#[tokio::test]
async fn test_classification_failure_falls_through_to_drafting() {
    let llm = MockLlmClient::offline();
    llm.push_text("no idea");
    let h = build(
        llm,
        Box::new(CompositionFallback::default()),
        OrchestratorSettings::default(),
    );
    let report = h.orchestrator.start("p1", "something vague").await;
    assert!(report.is_ok(), "{}", report.detail);
    assert_eq!(report.intent, Some(Intent::Other));
    assert_eq!(report.stage, StageState::AwaitingScriptConfirmation);
}

#[tokio::test]
async fn test_outline_creates_scenes_at_checkpoint() {
    let h = harness();
    let report = h.orchestrator.draft_outline("p1", "A heist on Mars").await;
    assert!(report.is_ok(), "{}", report.detail);
    assert_eq!(report.created.len(), 2);

    let units = h.records.list_units("p1").await.unwrap();
    assert_eq!(units.len(), 2);
    assert!(units
        .iter()
        .all(|u| u.status == SceneStatus::Draft && u.stage == StageState::AwaitingScriptConfirmation));
    assert_eq!(h.orchestrator.list_projects().await.unwrap(), vec!["p1".to_string()]);
}

#[tokio::test]
async fn test_edit_and_motion_prompt() {
    let h = manual_harness();
    let scene_id = h.drafted_scene("p1").await;

    let unit = h
        .orchestrator
        .edit_scene(
            "p1",
            &scene_id,
            SceneEdit {
                script: Some("EXT. DESERT - DAY".into()),
                ..SceneEdit::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(unit.script, "EXT. DESERT - DAY");

    let report = h.orchestrator.generate_motion_prompt("p1", &scene_id).await;
    assert!(report.is_ok(), "{}", report.detail);
    let unit = h.orchestrator.scene_status("p1", &scene_id).await.unwrap();
    assert_eq!(unit.motion_prompt, report.detail);
    assert!(!unit.motion_prompt.is_empty());
}

#[tokio::test]
async fn test_background_run_through_scheduler() {
    let h = harness();
    let (_, handle) = h.orchestrator.spawn(StageRequest::Start {
        project_id: "p2".into(),
        input: "Make a cyberpunk movie".into(),
    });
    let report = handle.await.unwrap();
    assert!(report.is_ok(), "{}", report.detail);
    assert_eq!(h.orchestrator.active_runs(), 0);
    assert_eq!(h.orchestrator.project_status("p2").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_shutdown_rejects_new_stages() {
    let h = manual_harness();
    let scene_id = h.drafted_scene("p1").await;
    h.orchestrator.shutdown(Duration::from_millis(10)).await;

    let report = h.orchestrator.confirm_script("p1", &scene_id).await;
    assert!(!report.is_ok());
    assert_eq!(report.detail, "Cancelled");
    let unit = h.records.get_unit("p1", &scene_id).await.unwrap().unwrap();
    assert_eq!(unit.status, SceneStatus::Draft);
}
