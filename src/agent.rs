//! 无头装配
//!
//! 按配置与环境变量构建 Completion Provider、媒体提供方、记录存储、Blob 存储，
//! 注入 StageOrchestrator。缺少 API Key 时退回 Mock 提供方并 warn，流水线仍可离线跑通。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{OrchestratorSettings, PipelineError, PipelineServices, StageOrchestrator};
use crate::generation::{
    fallback_from_config, DriverSettings, GeminiMediaProvider, MediaProvider, MockMediaProvider,
};
use crate::llm::{
    create_gemini_client, gemini_api_key, LlmClient, MockLlmClient, OpenAiClient, RetryConfig,
    RetryingLlmClient,
};
use crate::store::{open_record_store, BlobStore, LocalBlobStore};

/// 根据 [llm] 配置选择 Completion Provider，并包上重试策略
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let base_url = cfg.llm.base_url.as_deref();
    let inner: Arc<dyn LlmClient> = match provider.as_str() {
        "openai" => match std::env::var("OPENAI_API_KEY") {
            Ok(key) => {
                tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
                Arc::new(OpenAiClient::new(base_url, &cfg.llm.model, Some(key.as_str())))
            }
            Err(_) => {
                tracing::warn!("OPENAI_API_KEY not set, using offline mock LLM");
                return Arc::new(MockLlmClient::offline());
            }
        },
        "gemini" => match gemini_api_key() {
            Some(key) => {
                tracing::info!("Using Gemini LLM ({})", cfg.llm.model);
                Arc::new(create_gemini_client(Some(cfg.llm.model.as_str()), base_url, &key))
            }
            None => {
                tracing::warn!("GEMINI_API_KEY / GOOGLE_API_KEY not set, using offline mock LLM");
                return Arc::new(MockLlmClient::offline());
            }
        },
        "mock" => return Arc::new(MockLlmClient::offline()),
        other => {
            tracing::warn!("Unknown LLM provider '{}', using offline mock LLM", other);
            return Arc::new(MockLlmClient::offline());
        }
    };
    Arc::new(RetryingLlmClient::new(
        inner,
        RetryConfig {
            max_attempts: cfg.llm.max_attempts,
            base_delay: Duration::from_millis(cfg.llm.retry_base_ms),
            ..RetryConfig::default()
        },
    ))
}

/// 根据 [media] 配置选择媒体提供方
pub fn create_media_from_config(cfg: &AppConfig) -> Arc<dyn MediaProvider> {
    match cfg.media.provider.to_lowercase().as_str() {
        "gemini" => match gemini_api_key() {
            Some(key) => {
                let mut provider = GeminiMediaProvider::new(key)
                    .with_image_model(cfg.media.image_model.clone())
                    .with_video_model(cfg.media.video_model.clone())
                    .with_request_timeout(Duration::from_secs(
                        cfg.generation.request_timeout_secs.max(1),
                    ));
                if let Some(base) = &cfg.media.api_base {
                    provider = provider.with_api_base(base.clone());
                }
                tracing::info!(
                    image_model = %cfg.media.image_model,
                    video_model = %cfg.media.video_model,
                    "Using Gemini media provider"
                );
                Arc::new(provider)
            }
            None => {
                tracing::warn!("GEMINI_API_KEY / GOOGLE_API_KEY not set, using mock media provider");
                Arc::new(MockMediaProvider::new())
            }
        },
        "mock" => Arc::new(MockMediaProvider::new()),
        other => {
            tracing::warn!("Unknown media provider '{}', using mock media provider", other);
            Arc::new(MockMediaProvider::new())
        }
    }
}

/// 构建编排器：提供方、存储与生成驱动参数全部来自配置
pub async fn create_orchestrator(cfg: &AppConfig) -> Result<StageOrchestrator, PipelineError> {
    std::fs::create_dir_all(&cfg.app.data_dir)
        .map_err(|e| PipelineError::Config(format!("cannot create data dir: {e}")))?;
    let records = open_record_store(&cfg.store, &cfg.app.data_dir).await?;
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(
        cfg.app.media_dir(),
        &cfg.app.public_media_prefix,
    ));
    tracing::info!(
        store = %cfg.store.backend,
        media_dir = %cfg.app.media_dir().display(),
        fallback = %cfg.generation.fallback,
        "pipeline storage ready"
    );

    let services = PipelineServices {
        llm: create_llm_from_config(cfg),
        media: create_media_from_config(cfg),
        fallback: fallback_from_config(&cfg.generation),
        records,
        blobs,
        driver_settings: DriverSettings::from(&cfg.generation),
    };
    Ok(StageOrchestrator::new(
        services,
        OrchestratorSettings::from_config(cfg),
    ))
}
