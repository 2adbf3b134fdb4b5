//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DREAM__*` 覆盖（双下划线表示嵌套，如 `DREAM__GENERATION__POLL_TIMEOUT_SECS=600`）。
//! API Key 不进配置文件，只从环境变量读取（`OPENAI_API_KEY`、`GEMINI_API_KEY` / `GOOGLE_API_KEY`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub media: MediaSection,
    pub agent: AgentSection,
    pub generation: GenerationSection,
    pub pipeline: PipelineSection,
    pub store: StoreSection,
}

/// [app] 段：数据目录、媒体目录与公开前缀、日志格式
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// 媒体落盘目录，未设置时为 {data_dir}/media
    pub media_dir: Option<PathBuf>,
    #[serde(default = "default_public_media_prefix")]
    pub public_media_prefix: String,
    /// 输出 JSON 日志
    #[serde(default)]
    pub log_json: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_public_media_prefix() -> String {
    "/static/media".to_string()
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: default_data_dir(),
            media_dir: None,
            public_media_prefix: default_public_media_prefix(),
            log_json: false,
        }
    }
}

impl AppSection {
    pub fn media_dir(&self) -> PathBuf {
        self.media_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("media"))
    }
}

/// [llm] 段：Completion Provider 选择、模型与重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// gemini / openai / mock
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    /// 编剧等阶段使用的模型
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// 意图路由使用的轻量模型
    #[serde(default = "default_router_model")]
    pub router_model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// 单次请求总尝试次数
    #[serde(default = "default_llm_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_llm_retry_base_ms")]
    pub retry_base_ms: u64,
}

fn default_llm_provider() -> String {
    "gemini".to_string()
}

fn default_llm_model() -> String {
    "gemini-2.5-pro".to_string()
}

fn default_router_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_llm_max_attempts() -> u32 {
    3
}

fn default_llm_retry_base_ms() -> u64 {
    1000
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            router_model: default_router_model(),
            base_url: None,
            temperature: default_temperature(),
            max_attempts: default_llm_max_attempts(),
            retry_base_ms: default_llm_retry_base_ms(),
        }
    }
}

/// [media] 段：媒体提供方与模型
#[derive(Debug, Clone, Deserialize)]
pub struct MediaSection {
    /// gemini / mock
    #[serde(default = "default_media_provider")]
    pub provider: String,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_video_model")]
    pub video_model: String,
    pub api_base: Option<String>,
}

fn default_media_provider() -> String {
    "gemini".to_string()
}

fn default_image_model() -> String {
    crate::generation::gemini::DEFAULT_IMAGE_MODEL.to_string()
}

fn default_video_model() -> String {
    crate::generation::gemini::DEFAULT_VIDEO_MODEL.to_string()
}

impl Default for MediaSection {
    fn default() -> Self {
        Self {
            provider: default_media_provider(),
            image_model: default_image_model(),
            video_model: default_video_model(),
            api_base: None,
        }
    }
}

/// [agent] 段：推理循环上限与工具超时
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// 单次工具调用超时（秒）；generate_image 会连续生成多张图
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_max_turns() -> usize {
    10
}

fn default_tool_timeout_secs() -> u64 {
    300
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// [generation] 段：提交重试、轮询与兜底
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationSection {
    /// 提交总尝试次数（含首次）
    #[serde(default = "default_max_submit_retries")]
    pub max_submit_retries: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// 单次 HTTP 请求超时（秒），也约束远程产物取回
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// ffmpeg / composition
    #[serde(default = "default_fallback")]
    pub fallback: String,
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,
    #[serde(default = "default_fallback_clip_secs")]
    pub fallback_clip_secs: u32,
    #[serde(default = "default_composition_zoom_end")]
    pub composition_zoom_end: f32,
}

fn default_max_submit_retries() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    10
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_poll_timeout_secs() -> u64 {
    600
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_fallback() -> String {
    "ffmpeg".to_string()
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

fn default_fallback_clip_secs() -> u32 {
    5
}

fn default_composition_zoom_end() -> f32 {
    1.2
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            max_submit_retries: default_max_submit_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            fallback: default_fallback(),
            ffmpeg_binary: default_ffmpeg_binary(),
            fallback_clip_secs: default_fallback_clip_secs(),
            composition_zoom_end: default_composition_zoom_end(),
        }
    }
}

/// [pipeline] 段：草图数、并发运行数、是否自动进入导演阶段、默认设定集
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_draft_count")]
    pub draft_count: usize,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// 选图后自动生成视频
    #[serde(default = "default_auto_direct")]
    pub auto_direct: bool,
    #[serde(default = "default_genre")]
    pub genre: String,
    #[serde(default = "default_tone")]
    pub tone: String,
}

fn default_draft_count() -> usize {
    2
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_auto_direct() -> bool {
    true
}

fn default_genre() -> String {
    "Sci-Fi".to_string()
}

fn default_tone() -> String {
    "Dark, Cinematic".to_string()
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            draft_count: default_draft_count(),
            max_concurrent_runs: default_max_concurrent_runs(),
            auto_direct: default_auto_direct(),
            genre: default_genre(),
            tone: default_tone(),
        }
    }
}

/// [store] 段：记录存储后端
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// file / sqlite / memory
    #[serde(default = "default_store_backend")]
    pub backend: String,
    /// 未设置时放在 data_dir 下
    pub path: Option<PathBuf>,
}

fn default_store_backend() -> String {
    "file".to_string()
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
        }
    }
}

impl StoreSection {
    pub fn default_file_name(&self) -> &'static str {
        if self.backend == "sqlite" {
            "dreamfactory.db"
        } else {
            "dreamfactory.json"
        }
    }
}

impl AgentSection {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

/// 从 config 目录加载配置，环境变量 DREAM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DREAM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DREAM")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
