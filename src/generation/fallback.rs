//! 兜底合成：主路径不可恢复时产出降级产物
//!
//! - FfmpegFallback：把源图循环编码成定长 mp4（libx264, 1280x720, yuv420p）；
//!   中间文件放在 tempfile 临时目录，任何退出路径都会随 TempDir drop 清理；
//! - CompositionFallback：不产字节，只记录一段 ken_burns 运动镜头，供前端播放。

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::GenerationSection;
use crate::core::PipelineError;
use crate::generation::{ArtifactPayload, ReferenceMedia};
use crate::store::MotionComposition;

/// 兜底合成器
#[async_trait]
pub trait FallbackSynthesizer: Send + Sync {
    fn kind(&self) -> &str;

    async fn synthesize(
        &self,
        prompt: &str,
        source: Option<&ReferenceMedia>,
    ) -> Result<ArtifactPayload, PipelineError>;
}

/// ffmpeg 静帧视频
#[derive(Debug, Clone)]
pub struct FfmpegFallback {
    binary: PathBuf,
    clip_secs: u32,
}

impl FfmpegFallback {
    pub fn new(binary: impl Into<PathBuf>, clip_secs: u32) -> Self {
        Self {
            binary: binary.into(),
            clip_secs: clip_secs.max(1),
        }
    }
}

#[async_trait]
impl FallbackSynthesizer for FfmpegFallback {
    fn kind(&self) -> &str {
        "ffmpeg"
    }

    async fn synthesize(
        &self,
        _prompt: &str,
        source: Option<&ReferenceMedia>,
    ) -> Result<ArtifactPayload, PipelineError> {
        let source = source.ok_or_else(|| {
            PipelineError::GenerationFailed("fallback needs a source image".to_string())
        })?;
        let fail = |e: std::io::Error| PipelineError::GenerationFailed(format!("fallback io: {e}"));

        let workdir = tempfile::tempdir().map_err(fail)?;
        let input = workdir.path().join("source.png");
        let output = workdir.path().join("fallback.mp4");
        tokio::fs::write(&input, &source.bytes).await.map_err(fail)?;

        let duration = self.clip_secs.to_string();
        let result = Command::new(&self.binary)
            .args(["-y", "-loop", "1", "-i"])
            .arg(&input)
            .args([
                "-c:v", "libx264",
                "-t", duration.as_str(),
                "-pix_fmt", "yuv420p",
                "-vf", "scale=1280:720",
            ])
            .arg(&output)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipelineError::GenerationFailed(format!("ffmpeg not runnable: {e}")))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let tail: String = stderr.chars().rev().take(300).collect::<Vec<_>>().into_iter().rev().collect();
            return Err(PipelineError::GenerationFailed(format!("ffmpeg failed: {tail}")));
        }

        let bytes = tokio::fs::read(&output).await.map_err(fail)?;
        if bytes.is_empty() {
            return Err(PipelineError::GenerationFailed("ffmpeg produced an empty file".into()));
        }
        Ok(ArtifactPayload::Media {
            bytes,
            mime_type: "video/mp4".to_string(),
        })
    }
}

/// ken_burns 运动镜头描述
#[derive(Debug, Clone)]
pub struct CompositionFallback {
    zoom_end: f32,
    duration_secs: u32,
}

impl CompositionFallback {
    pub fn new(zoom_end: f32, duration_secs: u32) -> Self {
        Self {
            zoom_end,
            duration_secs: duration_secs.max(1),
        }
    }
}

impl Default for CompositionFallback {
    fn default() -> Self {
        Self::new(1.2, 5)
    }
}

#[async_trait]
impl FallbackSynthesizer for CompositionFallback {
    fn kind(&self) -> &str {
        "composition"
    }

    async fn synthesize(
        &self,
        _prompt: &str,
        source: Option<&ReferenceMedia>,
    ) -> Result<ArtifactPayload, PipelineError> {
        let uri = source.and_then(|s| s.uri.clone()).ok_or_else(|| {
            PipelineError::GenerationFailed("composition fallback needs a source image reference".into())
        })?;
        Ok(ArtifactPayload::Composition(MotionComposition {
            kind: "ken_burns".to_string(),
            source_image: uri,
            zoom_end: self.zoom_end,
            duration: self.duration_secs,
        }))
    }
}

/// 按 [generation] 配置创建兜底合成器
pub fn fallback_from_config(section: &GenerationSection) -> Box<dyn FallbackSynthesizer> {
    match section.fallback.as_str() {
        "composition" => Box::new(CompositionFallback::new(
            section.composition_zoom_end,
            section.fallback_clip_secs,
        )),
        _ => Box::new(FfmpegFallback::new(
            section.ffmpeg_binary.clone(),
            section.fallback_clip_secs,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ffmpeg_requires_source() {
        let fallback = FfmpegFallback::new("ffmpeg", 5);
        let err = fallback.synthesize("p", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::GenerationFailed(_)));
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_binary_fails() {
        let fallback = FfmpegFallback::new("/nonexistent/ffmpeg-binary", 5);
        let source = ReferenceMedia::png(b"png".to_vec(), None);
        let err = fallback.synthesize("p", Some(&source)).await.unwrap_err();
        assert!(err.to_string().contains("ffmpeg not runnable"));
    }

    #[tokio::test]
    async fn test_composition_records_ken_burns() {
        let fallback = CompositionFallback::default();
        let source = ReferenceMedia::png(b"png".to_vec(), Some("/static/media/p/s.png".into()));
        match fallback.synthesize("p", Some(&source)).await.unwrap() {
            ArtifactPayload::Composition(c) => {
                assert_eq!(c.kind, "ken_burns");
                assert_eq!(c.zoom_end, 1.2);
                assert_eq!(c.duration, 5);
                assert_eq!(c.source_image, "/static/media/p/s.png");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_composition_without_reference_fails() {
        let fallback = CompositionFallback::default();
        let source = ReferenceMedia::png(b"png".to_vec(), None);
        assert!(fallback.synthesize("p", Some(&source)).await.is_err());
    }
}
