//! WorkUnit 记录与字段补丁
//!
//! 一个 WorkUnit 对应一个场景：剧本、画面提示、候选图、选定图与成片引用。
//! 所有存储后端都通过 `WorkUnit::apply` 落补丁，保证 lastError 只在 status == error 时存在。

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{SceneStatus, StageState};

/// 兜底合成的运动镜头描述（无字节产物时记录在 WorkUnit 上）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionComposition {
    /// 目前只有 "ken_burns"
    #[serde(rename = "type")]
    pub kind: String,
    pub source_image: String,
    pub zoom_end: f32,
    pub duration: u32,
}

/// 场景工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkUnit {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub sequence_number: u32,
    pub status: SceneStatus,
    pub stage: StageState,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub visual_prompt: String,
    #[serde(default)]
    pub motion_prompt: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub characters: Vec<String>,
    /// 待选草图引用；选定后清空
    #[serde(default)]
    pub candidates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_composition: Option<MotionComposition>,
    /// 成片来自兜底合成
    #[serde(default)]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 创建 WorkUnit 时的初始字段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewWorkUnit {
    pub sequence_number: u32,
    pub script: String,
    pub visual_prompt: String,
    #[serde(default)]
    pub motion_prompt: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub characters: Vec<String>,
}

/// 字段级补丁；None 表示不修改。`Option<Option<_>>` 字段可显式清空
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkUnitPatch {
    pub status: Option<SceneStatus>,
    pub stage: Option<StageState>,
    pub script: Option<String>,
    pub visual_prompt: Option<String>,
    pub motion_prompt: Option<String>,
    pub rationale: Option<String>,
    pub characters: Option<Vec<String>>,
    pub candidates: Option<Vec<String>>,
    pub image_url: Option<Option<String>>,
    pub video_url: Option<Option<String>>,
    pub video_composition: Option<Option<MotionComposition>>,
    pub degraded: Option<bool>,
    /// 仅在 status 为 Error 时生效
    pub last_error: Option<String>,
}

impl WorkUnitPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: SceneStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn stage(mut self, stage: StageState) -> Self {
        self.stage = Some(stage);
        self
    }

    /// 标记 error 并记录详情
    pub fn failed(mut self, detail: impl Into<String>) -> Self {
        self.status = Some(SceneStatus::Error);
        self.last_error = Some(detail.into());
        self
    }

    pub fn script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn visual_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.visual_prompt = Some(prompt.into());
        self
    }

    pub fn motion_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.motion_prompt = Some(prompt.into());
        self
    }

    pub fn candidates(mut self, candidates: Vec<String>) -> Self {
        self.candidates = Some(candidates);
        self
    }

    pub fn image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(Some(url.into()));
        self
    }

    pub fn video_url(mut self, url: Option<String>) -> Self {
        self.video_url = Some(url);
        self
    }

    pub fn video_composition(mut self, composition: Option<MotionComposition>) -> Self {
        self.video_composition = Some(composition);
        self
    }

    pub fn degraded(mut self, degraded: bool) -> Self {
        self.degraded = Some(degraded);
        self
    }
}

impl WorkUnit {
    pub fn new(project_id: &str, id: String, fields: NewWorkUnit) -> Self {
        let now = Utc::now();
        Self {
            id,
            project_id: project_id.to_string(),
            sequence_number: fields.sequence_number,
            status: SceneStatus::Draft,
            stage: StageState::Drafting,
            script: fields.script,
            visual_prompt: fields.visual_prompt,
            motion_prompt: fields.motion_prompt,
            rationale: fields.rationale,
            characters: fields.characters,
            candidates: Vec::new(),
            image_url: None,
            video_url: None,
            video_composition: None,
            degraded: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 原子地应用补丁（由存储在持有自身锁时调用）
    pub fn apply(&mut self, patch: WorkUnitPatch) {
        if let Some(status) = patch.status {
            self.status = status;
            self.last_error = if status == SceneStatus::Error {
                patch.last_error.or_else(|| self.last_error.take())
            } else {
                None
            };
        }
        if let Some(v) = patch.stage {
            self.stage = v;
        }
        if let Some(v) = patch.script {
            self.script = v;
        }
        if let Some(v) = patch.visual_prompt {
            self.visual_prompt = v;
        }
        if let Some(v) = patch.motion_prompt {
            self.motion_prompt = v;
        }
        if let Some(v) = patch.rationale {
            self.rationale = v;
        }
        if let Some(v) = patch.characters {
            self.characters = v;
        }
        if let Some(v) = patch.candidates {
            self.candidates = v;
        }
        if let Some(v) = patch.image_url {
            self.image_url = v;
        }
        if let Some(v) = patch.video_url {
            self.video_url = v;
        }
        if let Some(v) = patch.video_composition {
            self.video_composition = v;
        }
        if let Some(v) = patch.degraded {
            self.degraded = v;
        }
        self.updated_at = Utc::now();
    }
}

static LAST_UNIT_MILLIS: AtomicI64 = AtomicI64::new(0);

/// 时间派生、进程内单调递增的场景 ID：`scene_{unix_millis}`
pub fn next_unit_id() -> String {
    let now = Utc::now().timestamp_millis();
    let prev = LAST_UNIT_MILLIS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
        .unwrap_or(now - 1);
    format!("scene_{}", now.max(prev + 1))
}
