//! 编剧阶段工具：保存场景、改写场景、查询设定集
//!
//! 工具在构造时绑定 project_id（改写时还绑定 scene_id），模型只需给出内容字段。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::store::{NewWorkUnit, WorkRecordStore, WorkUnitPatch};
use crate::tools::schema::schema_value;
use crate::tools::{Tool, ToolRegistry};

/// save_scene_script 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SaveSceneArgs {
    /// 场景序号，从 1 开始
    pub sequence_number: u32,
    /// 完整剧本（动作与对白）
    pub script: String,
    /// 供图像模型使用的详细英文画面描述
    pub visual_prompt: String,
    /// 创作理由
    #[serde(default)]
    pub rationale: String,
    /// 出场角色名
    #[serde(default)]
    pub characters_involved: Vec<String>,
}

/// update_scene_script 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct UpdateSceneArgs {
    /// 改写后的完整剧本
    pub script: String,
    /// 更新后的画面描述（可选）
    #[serde(default)]
    pub visual_prompt: Option<String>,
}

/// 项目设定集
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductionBible {
    pub genre: String,
    pub tone: String,
    pub characters: Vec<String>,
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, String> {
    // 兼容把字段包在 scene_data 里的调用
    let args = match args.get("scene_data") {
        Some(inner) if inner.is_object() => inner.clone(),
        _ => args,
    };
    serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))
}

/// 保存新场景（status = draft）
pub struct SaveSceneScriptTool {
    records: Arc<dyn WorkRecordStore>,
    project_id: String,
}

impl SaveSceneScriptTool {
    pub fn new(records: Arc<dyn WorkRecordStore>, project_id: &str) -> Self {
        Self {
            records,
            project_id: project_id.to_string(),
        }
    }
}

#[async_trait]
impl Tool for SaveSceneScriptTool {
    fn name(&self) -> &str {
        "save_scene_script"
    }

    fn description(&self) -> &str {
        "Save a newly written scene (script, visual prompt, rationale, characters) as a draft for human review."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<SaveSceneArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: SaveSceneArgs = parse_args(args)?;
        if args.script.trim().is_empty() {
            return Err("script must not be empty".into());
        }
        if args.visual_prompt.trim().is_empty() {
            return Err("visual_prompt must not be empty".into());
        }
        let id = self
            .records
            .create_unit(
                &self.project_id,
                NewWorkUnit {
                    sequence_number: args.sequence_number.max(1),
                    script: args.script,
                    visual_prompt: args.visual_prompt,
                    motion_prompt: String::new(),
                    rationale: args.rationale,
                    characters: args.characters_involved,
                },
            )
            .await
            .map_err(|e| e.to_string())?;
        tracing::info!(project_id = %self.project_id, scene_id = %id, "scene script saved");
        Ok(json!({ "status": "saved", "scene_id": id }))
    }
}

/// 改写已有场景
pub struct UpdateSceneScriptTool {
    records: Arc<dyn WorkRecordStore>,
    project_id: String,
    scene_id: String,
}

impl UpdateSceneScriptTool {
    pub fn new(records: Arc<dyn WorkRecordStore>, project_id: &str, scene_id: &str) -> Self {
        Self {
            records,
            project_id: project_id.to_string(),
            scene_id: scene_id.to_string(),
        }
    }
}

#[async_trait]
impl Tool for UpdateSceneScriptTool {
    fn name(&self) -> &str {
        "update_scene_script"
    }

    fn description(&self) -> &str {
        "Replace the script (and optionally the visual prompt) of the scene under revision."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<UpdateSceneArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: UpdateSceneArgs = parse_args(args)?;
        if args.script.trim().is_empty() {
            return Err("script must not be empty".into());
        }
        let mut patch = WorkUnitPatch::new().script(args.script);
        if let Some(vp) = args.visual_prompt.filter(|v| !v.trim().is_empty()) {
            patch = patch.visual_prompt(vp);
        }
        self.records
            .update_unit(&self.project_id, &self.scene_id, patch)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "status": "updated", "scene_id": self.scene_id }))
    }
}

/// 设定集：默认题材 / 基调 + 项目内已出场角色
pub struct ProductionBibleTool {
    records: Arc<dyn WorkRecordStore>,
    project_id: String,
    genre: String,
    tone: String,
}

impl ProductionBibleTool {
    pub fn new(records: Arc<dyn WorkRecordStore>, project_id: &str, genre: &str, tone: &str) -> Self {
        Self {
            records,
            project_id: project_id.to_string(),
            genre: genre.to_string(),
            tone: tone.to_string(),
        }
    }

    pub async fn bible(&self) -> Result<ProductionBible, String> {
        let units = self
            .records
            .list_units(&self.project_id)
            .await
            .map_err(|e| e.to_string())?;
        let mut characters: Vec<String> = Vec::new();
        for name in units.iter().flat_map(|u| u.characters.iter()) {
            if !characters.contains(name) {
                characters.push(name.clone());
            }
        }
        Ok(ProductionBible {
            genre: self.genre.clone(),
            tone: self.tone.clone(),
            characters,
        })
    }
}

#[async_trait]
impl Tool for ProductionBibleTool {
    fn name(&self) -> &str {
        "get_production_bible"
    }

    fn description(&self) -> &str {
        "Get the project's genre, tone and the characters that already appear in earlier scenes."
    }

    async fn execute(&self, _args: Value) -> Result<Value, String> {
        let bible = self.bible().await?;
        serde_json::to_value(bible).map_err(|e| e.to_string())
    }
}

/// 起草新场景的工具集
pub fn drafting_tools(
    records: Arc<dyn WorkRecordStore>,
    project_id: &str,
    genre: &str,
    tone: &str,
) -> ToolRegistry {
    ToolRegistry::new()
        .with(SaveSceneScriptTool::new(records.clone(), project_id))
        .with(ProductionBibleTool::new(records, project_id, genre, tone))
}

/// 改写已有场景的工具集
pub fn revision_tools(
    records: Arc<dyn WorkRecordStore>,
    project_id: &str,
    scene_id: &str,
    genre: &str,
    tone: &str,
) -> ToolRegistry {
    ToolRegistry::new()
        .with(UpdateSceneScriptTool::new(records.clone(), project_id, scene_id))
        .with(ProductionBibleTool::new(records, project_id, genre, tone))
}
