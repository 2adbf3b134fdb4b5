//! Media Provider 抽象：图像同步生成、视频长任务提交 / 轮询 / 取回
//!
//! 适配器负责吸收提供方响应形状的差异，统一成 VideoSubmission / PollStatus / ArtifactSource。

use async_trait::async_trait;
use thiserror::Error;

use crate::core::PipelineError;

/// 参考媒体（图生视频的源图）
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceMedia {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    /// 公开引用（兜底合成记录运动镜头时使用）
    pub uri: Option<String>,
}

impl ReferenceMedia {
    pub fn png(bytes: Vec<u8>, uri: Option<String>) -> Self {
        Self {
            bytes,
            mime_type: "image/png".to_string(),
            uri,
        }
    }
}

/// 长任务句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHandle {
    pub name: String,
}

/// 产物来源：内联字节或远程引用（需要再取回）
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactSource {
    Bytes { data: Vec<u8>, mime_type: String },
    Uri(String),
}

/// 视频提交结果：有的提供方同步返回产物
#[derive(Debug, Clone, PartialEq)]
pub enum VideoSubmission {
    Ready(ArtifactSource),
    Pending(OperationHandle),
}

/// 轮询结果；Done(None) 表示提供方报告成功却没有产物
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Running,
    Done(Option<ArtifactSource>),
    Failed(String),
}

/// 媒体提供方错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    /// 429 / RESOURCE_EXHAUSTED
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("provider rejected request: {0}")]
    Fatal(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider returned no artifact")]
    EmptyResult,
}

impl From<MediaError> for PipelineError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::RateLimited(msg) => PipelineError::ProviderTransient(msg),
            other => PipelineError::ProviderFatal(other.to_string()),
        }
    }
}

/// Media Provider trait
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// 同步生成一张图，返回图像字节
    async fn generate_image(&self, prompt: &str) -> Result<Vec<u8>, MediaError>;

    /// 提交视频生成（可带源图）
    async fn submit_video(
        &self,
        prompt: &str,
        reference: Option<&ReferenceMedia>,
    ) -> Result<VideoSubmission, MediaError>;

    async fn poll_operation(&self, handle: &OperationHandle) -> Result<PollStatus, MediaError>;

    /// 取回远程产物
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, MediaError>;
}
