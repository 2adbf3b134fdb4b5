//! 分镜画师工具：生成候选草图、检查草图质量；定稿工具存在但拒绝执行（定稿由人工选图完成）

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::resolve_candidate;
use crate::generation::GenerationDriver;
use crate::llm::{CompletionRequest, ImagePart, LlmClient, Message, ResponseSchema};
use crate::store::{BlobStore, WorkRecordStore, WorkUnitPatch};
use crate::tools::schema::{schema_value, strip_code_fence};
use crate::tools::{Tool, ToolRegistry};

/// generate_image 参数
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct GenerateImageArgs {
    /// 画面描述；省略时使用场景已保存的 visual_prompt
    #[serde(default)]
    pub prompt: Option<String>,
}

/// 候选草图的逻辑文件名
pub fn draft_name(scene_id: &str) -> String {
    format!("drafts/{}_{}.png", scene_id, uuid::Uuid::new_v4())
}

/// 已写入 Blob 存储、尚未记到 WorkUnit 上的草图。
/// 未 commit 就被丢弃（工具超时、取消、落库失败）时，后台删除这些 Blob。
struct PendingDrafts {
    blobs: Arc<dyn BlobStore>,
    references: Vec<String>,
}

impl PendingDrafts {
    fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            references: Vec::new(),
        }
    }

    fn commit(mut self) -> Vec<String> {
        std::mem::take(&mut self.references)
    }
}

impl Drop for PendingDrafts {
    fn drop(&mut self) {
        if self.references.is_empty() {
            return;
        }
        let references = std::mem::take(&mut self.references);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(count = references.len(), "no runtime to remove abandoned drafts");
            return;
        };
        let blobs = self.blobs.clone();
        tracing::debug!(count = references.len(), "removing abandoned drafts");
        handle.spawn(async move {
            for reference in references {
                if let Err(e) = blobs.remove(&reference).await {
                    tracing::warn!(reference = %reference, error = %e, "abandoned draft not removed");
                }
            }
        });
    }
}

/// 为一个场景生成一批候选草图，替换上一批
pub struct GenerateImageTool {
    driver: Arc<GenerationDriver>,
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn WorkRecordStore>,
    project_id: String,
    scene_id: String,
    count: usize,
}

impl GenerateImageTool {
    pub fn new(
        driver: Arc<GenerationDriver>,
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn WorkRecordStore>,
        project_id: &str,
        scene_id: &str,
        count: usize,
    ) -> Self {
        Self {
            driver,
            blobs,
            records,
            project_id: project_id.to_string(),
            scene_id: scene_id.to_string(),
            count: count.max(1),
        }
    }
}

#[async_trait]
impl Tool for GenerateImageTool {
    fn name(&self) -> &str {
        "generate_image"
    }

    fn description(&self) -> &str {
        "Generate the batch of draft storyboard images for the current scene. \
         Call it again with a refined prompt only if inspection failed."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<GenerateImageArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: GenerateImageArgs =
            serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))?;
        let unit = self
            .records
            .get_unit(&self.project_id, &self.scene_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("scene {} not found", self.scene_id))?;
        let prompt = args
            .prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| unit.visual_prompt.clone());
        if prompt.trim().is_empty() {
            return Err("no visual prompt to draw from".into());
        }

        let mut pending = PendingDrafts::new(self.blobs.clone());
        let mut failures = Vec::new();
        for i in 0..self.count {
            let stored = match self.driver.generate_image(&prompt).await {
                Ok(bytes) => self
                    .blobs
                    .store(&bytes, &draft_name(&self.scene_id), Some(self.project_id.as_str()))
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match stored {
                Ok(reference) => pending.references.push(reference),
                Err(e) => {
                    tracing::warn!(scene_id = %self.scene_id, draft = i + 1, error = %e, "draft image failed");
                    failures.push(e);
                }
            }
        }
        if pending.references.is_empty() {
            return Err(format!(
                "no images generated: {}",
                failures.first().map(String::as_str).unwrap_or("unknown error")
            ));
        }

        self.records
            .update_unit(
                &self.project_id,
                &self.scene_id,
                WorkUnitPatch::new().candidates(pending.references.clone()),
            )
            .await
            .map_err(|e| e.to_string())?;
        let candidates = pending.commit();
        for old in &unit.candidates {
            if let Err(e) = self.blobs.remove(old).await {
                tracing::debug!(reference = %old, error = %e, "stale draft not removed");
            }
        }

        Ok(json!({
            "status": "drafts_ready",
            "candidates": candidates,
            "failed": failures.len(),
        }))
    }
}

/// 质检结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum InspectionStatus {
    #[serde(alias = "pass", alias = "Pass")]
    Pass,
    #[serde(alias = "fail", alias = "Fail")]
    Fail,
}

/// 视觉模型返回的质检结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InspectionVerdict {
    pub status: InspectionStatus,
    /// 失败原因或通过说明
    #[serde(default)]
    pub feedback: String,
}

pub fn inspection_schema() -> ResponseSchema {
    ResponseSchema {
        name: "image_inspection".to_string(),
        schema: schema_value::<InspectionVerdict>(),
    }
}

pub fn parse_inspection(text: &str) -> Result<InspectionVerdict, String> {
    serde_json::from_str(strip_code_fence(text)).map_err(|e| format!("invalid inspection verdict: {e}"))
}

/// inspect_image_quality 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct InspectImageArgs {
    /// 候选草图引用（也接受 1 起的序号或文件名）
    pub image_ref: String,
    /// 验收标准；省略时以场景的 visual_prompt 为准
    #[serde(default)]
    pub acceptance_criteria: Option<String>,
}

/// 质检用的视觉模型与指令
#[derive(Clone)]
pub struct ImageInspector {
    pub llm: Arc<dyn LlmClient>,
    pub model: Option<String>,
    pub instruction: String,
    /// 附带的前序场景定稿图数量上限（保持视觉一致）
    pub max_references: usize,
}

/// 让视觉模型检查一张候选草图是否满足验收标准
pub struct InspectImageQualityTool {
    inspector: ImageInspector,
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn WorkRecordStore>,
    project_id: String,
    scene_id: String,
}

impl InspectImageQualityTool {
    pub fn new(
        inspector: ImageInspector,
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn WorkRecordStore>,
        project_id: &str,
        scene_id: &str,
    ) -> Self {
        Self {
            inspector,
            blobs,
            records,
            project_id: project_id.to_string(),
            scene_id: scene_id.to_string(),
        }
    }

    /// 本项目中排在当前场景之前、已有定稿图的场景（取最近的几张）
    async fn reference_images(&self, sequence_number: u32) -> Vec<ImagePart> {
        let units = match self.records.list_units(&self.project_id).await {
            Ok(units) => units,
            Err(e) => {
                tracing::debug!(error = %e, "reference scenes unavailable");
                return Vec::new();
            }
        };
        let mut earlier: Vec<_> = units
            .into_iter()
            .filter(|u| u.sequence_number < sequence_number)
            .filter_map(|u| u.image_url.map(|url| (u.sequence_number, url)))
            .collect();
        earlier.sort_by_key(|(seq, _)| *seq);
        let skip = earlier.len().saturating_sub(self.inspector.max_references);

        let mut images = Vec::new();
        for (_, url) in earlier.into_iter().skip(skip) {
            match self.blobs.load(&url).await {
                Ok(bytes) => images.push(ImagePart::from_bytes(&bytes, "image/png")),
                Err(e) => tracing::debug!(reference = %url, error = %e, "reference image skipped"),
            }
        }
        images
    }
}

#[async_trait]
impl Tool for InspectImageQualityTool {
    fn name(&self) -> &str {
        "inspect_image_quality"
    }

    fn description(&self) -> &str {
        "Check one draft image against acceptance criteria. Returns {status: PASS|FAIL, feedback}."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<InspectImageArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: InspectImageArgs =
            serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))?;
        let unit = self
            .records
            .get_unit(&self.project_id, &self.scene_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("scene {} not found", self.scene_id))?;
        let reference = resolve_candidate(&unit.candidates, &args.image_ref)
            .ok_or_else(|| format!("{} is not a draft of this scene", args.image_ref))?;
        let bytes = self
            .blobs
            .load(&reference)
            .await
            .map_err(|e| e.to_string())?;
        let criteria = args
            .acceptance_criteria
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| unit.visual_prompt.clone());

        let references = self.reference_images(unit.sequence_number).await;
        let mut text = format!(
            "Inspect the first image against these acceptance criteria:\n\"{criteria}\"\n\
             Answer with JSON: status (PASS or FAIL) and feedback."
        );
        if !references.is_empty() {
            text.push_str(&format!(
                "\nThe other {} image(s) are approved earlier scenes; FAIL the draft if characters or style are inconsistent with them.",
                references.len()
            ));
        }
        let reference_count = references.len();
        let mut images = vec![ImagePart::from_bytes(&bytes, "image/png")];
        images.extend(references);

        let request = CompletionRequest::new(vec![
            Message::system(self.inspector.instruction.clone()),
            Message::user_with_images(text, images),
        ])
        .with_model(self.inspector.model.clone())
        .with_response_schema(inspection_schema())
        .with_temperature(0.0);
        let response = self
            .inspector
            .llm
            .complete(&request)
            .await
            .map_err(|e| format!("inspection failed: {e}"))?;
        let verdict = parse_inspection(&response.text_or_empty())?;
        tracing::info!(
            scene_id = %self.scene_id,
            image = %reference,
            status = ?verdict.status,
            "draft inspected"
        );

        Ok(json!({
            "image_ref": reference,
            "status": verdict.status,
            "feedback": verdict.feedback,
            "references": reference_count,
        }))
    }
}

/// 定稿工具：始终拒绝，候选图必须由人工选择
pub struct SubmitFinalSceneTool;

#[async_trait]
impl Tool for SubmitFinalSceneTool {
    fn name(&self) -> &str {
        "submit_final_scene"
    }

    fn description(&self) -> &str {
        "Finalize the scene image. Not available to the artist: a human selects the final image."
    }

    async fn execute(&self, _args: Value) -> Result<Value, String> {
        Err("finalization is reserved for human image selection".into())
    }
}

/// 画师阶段工具集
pub fn artist_tools(
    driver: Arc<GenerationDriver>,
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn WorkRecordStore>,
    inspector: ImageInspector,
    project_id: &str,
    scene_id: &str,
    count: usize,
) -> ToolRegistry {
    ToolRegistry::new()
        .with(GenerateImageTool::new(
            driver,
            blobs.clone(),
            records.clone(),
            project_id,
            scene_id,
            count,
        ))
        .with(InspectImageQualityTool::new(
            inspector, blobs, records, project_id, scene_id,
        ))
        .with(SubmitFinalSceneTool)
}
