//! 生成任务驱动：提交 -> 轮询 -> 取回 -> 失败兜底
//!
//! - 提交阶段只对限流类错误（ProviderTransient）做指数退避重试，间隔 base, 2*base, 4*base ...；
//! - 轮询按固定间隔进行，超过 poll_timeout 视为 GenerationTimedOut；单次轮询调用同样受这个截止时间约束，
//!   卡住的请求不会让任务无限挂起；取回远程产物受 request_timeout 约束；
//! - 远程引用会被取回；「成功但没有字节」视为失败；
//! - 主路径不可恢复时交给兜底合成，产物标记为 Degraded；兜底也失败才返回 GenerationFailed。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::GenerationSection;
use crate::core::{PipelineError, RecoveryAction, RecoveryEngine};
use crate::generation::{
    ArtifactSource, FallbackSynthesizer, MediaError, MediaProvider, OperationHandle, PollStatus,
    ReferenceMedia, VideoSubmission,
};
use crate::store::MotionComposition;

/// 驱动参数
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// 提交总尝试次数（含首次）
    pub max_submit_retries: u32,
    pub backoff_base: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    /// 取回远程产物的单次超时
    pub request_timeout: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            max_submit_retries: 3,
            backoff_base: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(600),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl From<&GenerationSection> for DriverSettings {
    fn from(section: &GenerationSection) -> Self {
        Self {
            max_submit_retries: section.max_submit_retries.max(1),
            backoff_base: Duration::from_secs(section.backoff_base_secs),
            poll_interval: Duration::from_secs(section.poll_interval_secs.max(1)),
            poll_timeout: Duration::from_secs(section.poll_timeout_secs),
            request_timeout: Duration::from_secs(section.request_timeout_secs.max(1)),
        }
    }
}

/// 长任务状态：只能 Submitted -> Polling -> Done | Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Submitted,
    Polling,
    Done,
    Failed,
}

impl OperationState {
    fn rank(self) -> u8 {
        match self {
            OperationState::Submitted => 0,
            OperationState::Polling => 1,
            OperationState::Done | OperationState::Failed => 2,
        }
    }
}

/// 一次生成任务的可观测状态
#[derive(Debug, Clone)]
pub struct GenerationOperation {
    pub state: OperationState,
    /// 已进行的提交次数
    pub attempt: u32,
    pub handle: Option<OperationHandle>,
    pub result_ref: Option<ArtifactSource>,
    /// 每次重试前的等待时长
    pub backoffs: Vec<Duration>,
}

impl Default for GenerationOperation {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationOperation {
    pub fn new() -> Self {
        Self {
            state: OperationState::Submitted,
            attempt: 0,
            handle: None,
            result_ref: None,
            backoffs: Vec::new(),
        }
    }

    /// 只接受前进的状态变化
    fn advance(&mut self, next: OperationState) {
        if next.rank() > self.state.rank() {
            self.state = next;
        } else if next != self.state {
            tracing::warn!(from = ?self.state, to = ?next, "ignored backward operation transition");
        }
    }

    /// 产物已到手（提交即返回，或轮询完成）
    pub fn is_ready(&self) -> bool {
        self.state == OperationState::Done && self.result_ref.is_some()
    }
}

/// 产物是否来自主路径
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationOutcome {
    Primary,
    Degraded { reason: String },
}

/// 产物内容
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactPayload {
    Media { bytes: Vec<u8>, mime_type: String },
    Composition(MotionComposition),
}

/// 生成产物
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub payload: ArtifactPayload,
    pub outcome: GenerationOutcome,
}

impl Artifact {
    pub fn is_degraded(&self) -> bool {
        matches!(self.outcome, GenerationOutcome::Degraded { .. })
    }
}

/// 生成任务驱动
pub struct GenerationDriver {
    provider: Arc<dyn MediaProvider>,
    fallback: Box<dyn FallbackSynthesizer>,
    settings: DriverSettings,
    recovery: RecoveryEngine,
    cancel_token: CancellationToken,
}

impl GenerationDriver {
    pub fn new(
        provider: Arc<dyn MediaProvider>,
        fallback: Box<dyn FallbackSynthesizer>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            provider,
            fallback,
            settings,
            recovery: RecoveryEngine::new(),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    async fn pause(&self, delay: Duration) -> Result<(), PipelineError> {
        tokio::select! {
            _ = self.cancel_token.cancelled() => Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// 执行一次提交类调用，限流时按退避表重试
    async fn with_submit_retry<T, F, Fut>(
        &self,
        op: &mut GenerationOperation,
        mut call: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, MediaError>>,
    {
        loop {
            if self.cancel_token.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            op.attempt += 1;
            let err: PipelineError = match call().await {
                Ok(v) => return Ok(v),
                Err(e) => e.into(),
            };
            let retry = self.recovery.handle(&err) == RecoveryAction::RetryWithBackoff
                && op.attempt < self.settings.max_submit_retries;
            if !retry {
                return Err(err);
            }
            let delay = self
                .settings
                .backoff_base
                .saturating_mul(2u32.saturating_pow(op.attempt - 1));
            tracing::warn!(
                attempt = op.attempt,
                delay_secs = delay.as_secs(),
                error = %err,
                "submission rate limited, backing off"
            );
            op.backoffs.push(delay);
            self.pause(delay).await?;
        }
    }

    /// 同步生成一张图（与视频提交共用限流重试）
    pub async fn generate_image(&self, prompt: &str) -> Result<Vec<u8>, PipelineError> {
        let mut op = GenerationOperation::new();
        let bytes = self
            .with_submit_retry(&mut op, || self.provider.generate_image(prompt))
            .await?;
        if bytes.is_empty() {
            return Err(PipelineError::ProviderFatal("image provider returned no bytes".into()));
        }
        Ok(bytes)
    }

    /// 提交视频生成任务
    pub async fn submit(
        &self,
        prompt: &str,
        reference: Option<&ReferenceMedia>,
    ) -> Result<GenerationOperation, PipelineError> {
        let mut op = GenerationOperation::new();
        self.submit_into(&mut op, prompt, reference).await?;
        Ok(op)
    }

    async fn submit_into(
        &self,
        op: &mut GenerationOperation,
        prompt: &str,
        reference: Option<&ReferenceMedia>,
    ) -> Result<(), PipelineError> {
        let submission = self
            .with_submit_retry(op, || self.provider.submit_video(prompt, reference))
            .await?;
        match submission {
            VideoSubmission::Ready(source) => {
                op.result_ref = Some(source);
                op.advance(OperationState::Done);
            }
            VideoSubmission::Pending(handle) => {
                op.handle = Some(handle);
            }
        }
        Ok(())
    }

    /// 固定间隔轮询直到完成、失败或超时
    pub async fn poll(&self, op: &mut GenerationOperation) -> Result<ArtifactSource, PipelineError> {
        if op.is_ready() {
            if let Some(source) = op.result_ref.clone() {
                return Ok(source);
            }
        }
        let handle = op
            .handle
            .clone()
            .ok_or_else(|| PipelineError::ProviderFatal("operation has no handle to poll".into()))?;
        op.advance(OperationState::Polling);

        let deadline = Instant::now() + self.settings.poll_timeout;
        let timed_out = || PipelineError::GenerationTimedOut(self.settings.poll_timeout);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let polled = tokio::select! {
                _ = self.cancel_token.cancelled() => return Err(PipelineError::Cancelled),
                r = tokio::time::timeout(remaining, self.provider.poll_operation(&handle)) => r,
            };
            let Ok(polled) = polled else {
                tracing::warn!(operation = %handle.name, "poll call exceeded the operation deadline");
                return Err(timed_out());
            };
            match polled {
                Ok(PollStatus::Running) => {}
                Ok(PollStatus::Done(Some(source))) => {
                    op.result_ref = Some(source.clone());
                    op.advance(OperationState::Done);
                    return Ok(source);
                }
                Ok(PollStatus::Done(None)) => {
                    return Err(PipelineError::ProviderFatal(
                        "operation finished without an artifact".into(),
                    ))
                }
                Ok(PollStatus::Failed(msg)) => return Err(PipelineError::ProviderFatal(msg)),
                // 轮询期间的瞬时错误不终止任务，等到下一个间隔再问
                Err(e @ (MediaError::RateLimited(_) | MediaError::Transport(_))) => {
                    tracing::debug!(operation = %handle.name, error = %e, "poll failed, will retry");
                }
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out());
            }
            let wait = self.settings.poll_interval.min(deadline - now);
            self.pause(wait).await?;
        }
    }

    /// 产物来源 -> 字节；空字节视为失败
    async fn extract(&self, source: ArtifactSource) -> Result<(Vec<u8>, String), PipelineError> {
        let (bytes, mime_type) = match source {
            ArtifactSource::Bytes { data, mime_type } => (data, mime_type),
            ArtifactSource::Uri(uri) => {
                tracing::debug!(uri = %uri, "fetching remote artifact");
                let limit = self.settings.request_timeout;
                let fetched = tokio::select! {
                    _ = self.cancel_token.cancelled() => return Err(PipelineError::Cancelled),
                    r = tokio::time::timeout(limit, self.provider.fetch(&uri)) => r,
                };
                let bytes = fetched.map_err(|_| PipelineError::GenerationTimedOut(limit))??;
                (bytes, "video/mp4".to_string())
            }
        };
        if bytes.is_empty() {
            return Err(PipelineError::ProviderFatal("artifact is empty".into()));
        }
        Ok((bytes, mime_type))
    }

    async fn primary(
        &self,
        op: &mut GenerationOperation,
        prompt: &str,
        reference: Option<&ReferenceMedia>,
    ) -> Result<(Vec<u8>, String), PipelineError> {
        self.submit_into(op, prompt, reference).await?;
        let source = self.poll(op).await?;
        self.extract(source).await
    }

    /// 完整生成：主路径失败时兜底，产物标记 Degraded
    pub async fn run(
        &self,
        prompt: &str,
        reference: Option<&ReferenceMedia>,
    ) -> Result<Artifact, PipelineError> {
        let mut op = GenerationOperation::new();
        match self.primary(&mut op, prompt, reference).await {
            Ok((bytes, mime_type)) => {
                tracing::info!(attempts = op.attempt, "generation completed");
                Ok(Artifact {
                    payload: ArtifactPayload::Media { bytes, mime_type },
                    outcome: GenerationOutcome::Primary,
                })
            }
            Err(PipelineError::Cancelled) => Err(PipelineError::Cancelled),
            Err(err) => {
                op.advance(OperationState::Failed);
                tracing::warn!(
                    error = %err,
                    attempts = op.attempt,
                    fallback = self.fallback.kind(),
                    "primary generation failed, synthesizing fallback"
                );
                match self.fallback.synthesize(prompt, reference).await {
                    Ok(payload) => Ok(Artifact {
                        payload,
                        outcome: GenerationOutcome::Degraded {
                            reason: err.to_string(),
                        },
                    }),
                    Err(fallback_err) => Err(PipelineError::GenerationFailed(format!(
                        "{err}; fallback failed: {fallback_err}"
                    ))),
                }
            }
        }
    }
}
