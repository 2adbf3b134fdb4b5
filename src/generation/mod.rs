//! 媒体生成层：提供方抽象（Gemini / Veo、Mock）、生成任务驱动与兜底合成

pub mod driver;
pub mod fallback;
pub mod gemini;
pub mod mock;
pub mod provider;

pub use driver::{
    Artifact, ArtifactPayload, DriverSettings, GenerationDriver, GenerationOperation,
    GenerationOutcome, OperationState,
};
pub use fallback::{fallback_from_config, CompositionFallback, FallbackSynthesizer, FfmpegFallback};
pub use gemini::GeminiMediaProvider;
pub use mock::{MockMediaProvider, MOCK_IMAGE_BYTES, MOCK_VIDEO_BYTES};
pub use provider::{
    ArtifactSource, MediaError, MediaProvider, OperationHandle, PollStatus, ReferenceMedia,
    VideoSubmission,
};
