//! Gemini / Veo 媒体适配器（REST）
//!
//! - 图像：`models/{image_model}:generateContent`，从 inlineData 取 base64 图像；
//! - 视频：`models/{video_model}:predictLongRunning` 返回长任务名，`GET {name}` 轮询，
//!   完成后产物可能是内联 base64，也可能是需要再下载的 URI。

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use crate::generation::{
    ArtifactSource, MediaError, MediaProvider, OperationHandle, PollStatus, ReferenceMedia,
    VideoSubmission,
};

pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.0-flash-preview-image-generation";
pub const DEFAULT_VIDEO_MODEL: &str = "veo-2.0-generate-001";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

fn http_client(timeout: Duration) -> Client {
    Client::builder().timeout(timeout).build().unwrap_or_default()
}

/// Gemini 媒体提供方
pub struct GeminiMediaProvider {
    client: Client,
    api_key: String,
    api_base: String,
    image_model: String,
    video_model: String,
}

impl GeminiMediaProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: http_client(DEFAULT_REQUEST_TIMEOUT),
            api_key: api_key.into(),
            api_base: GEMINI_API_BASE.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            video_model: DEFAULT_VIDEO_MODEL.to_string(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// 单次请求超时（含轮询与产物下载）
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    pub fn with_image_model(mut self, model: impl Into<String>) -> Self {
        self.image_model = model.into();
        self
    }

    pub fn with_video_model(mut self, model: impl Into<String>) -> Self {
        self.video_model = model.into();
        self
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, MediaError> {
        let response = request
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| MediaError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MediaError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| MediaError::Fatal(format!("invalid JSON: {e}")))
    }
}

/// HTTP 状态 -> MediaError；只有限流可重试
fn classify_status(status: StatusCode, body: &str) -> MediaError {
    let detail = format!("{status}: {}", body.chars().take(300).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || body.contains("RESOURCE_EXHAUSTED") {
        MediaError::RateLimited(detail)
    } else if status.is_server_error() {
        MediaError::Transport(detail)
    } else {
        MediaError::Fatal(detail)
    }
}

/// generateContent 响应中的第一张内联图
pub(crate) fn parse_image_response(body: &Value) -> Result<Vec<u8>, MediaError> {
    let parts = body
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or(MediaError::EmptyResult)?;
    let data = parts
        .iter()
        .find_map(|p| {
            p.get("inlineData")
                .or_else(|| p.get("inline_data"))
                .and_then(|d| d.get("data"))
                .and_then(Value::as_str)
        })
        .ok_or(MediaError::EmptyResult)?;
    BASE64
        .decode(data)
        .map_err(|e| MediaError::Fatal(format!("invalid base64 image: {e}")))
}

/// 长任务状态解析；兼容 generateVideoResponse.generatedSamples 与 predictions 两种形状
pub(crate) fn parse_operation(body: &Value) -> PollStatus {
    if let Some(err) = body.get("error") {
        let msg = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("operation failed")
            .to_string();
        return PollStatus::Failed(msg);
    }
    if !body.get("done").and_then(Value::as_bool).unwrap_or(false) {
        return PollStatus::Running;
    }
    let response = body.get("response").unwrap_or(&Value::Null);
    let sample = response
        .pointer("/generateVideoResponse/generatedSamples/0/video")
        .or_else(|| response.pointer("/generatedVideos/0/video"))
        .or_else(|| response.pointer("/predictions/0"));
    let Some(video) = sample else {
        return PollStatus::Done(None);
    };
    if let Some(encoded) = video.get("bytesBase64Encoded").and_then(Value::as_str) {
        return match BASE64.decode(encoded) {
            Ok(data) if !data.is_empty() => PollStatus::Done(Some(ArtifactSource::Bytes {
                data,
                mime_type: video
                    .get("mimeType")
                    .and_then(Value::as_str)
                    .unwrap_or("video/mp4")
                    .to_string(),
            })),
            _ => PollStatus::Done(None),
        };
    }
    match video.get("uri").and_then(Value::as_str) {
        Some(uri) if !uri.is_empty() => PollStatus::Done(Some(ArtifactSource::Uri(uri.to_string()))),
        _ => PollStatus::Done(None),
    }
}

#[async_trait]
impl MediaProvider for GeminiMediaProvider {
    async fn generate_image(&self, prompt: &str) -> Result<Vec<u8>, MediaError> {
        let url = format!("{}/models/{}:generateContent", self.api_base, self.image_model);
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] }
        });
        let response = self.send(self.client.post(url).json(&body)).await?;
        parse_image_response(&response)
    }

    async fn submit_video(
        &self,
        prompt: &str,
        reference: Option<&ReferenceMedia>,
    ) -> Result<VideoSubmission, MediaError> {
        let url = format!("{}/models/{}:predictLongRunning", self.api_base, self.video_model);
        let mut instance = json!({ "prompt": prompt });
        if let Some(media) = reference {
            instance["image"] = json!({
                "bytesBase64Encoded": BASE64.encode(&media.bytes),
                "mimeType": media.mime_type,
            });
        }
        let body = json!({
            "instances": [instance],
            "parameters": { "aspectRatio": "16:9", "sampleCount": 1 }
        });
        let response = self.send(self.client.post(url).json(&body)).await?;

        match parse_operation(&response) {
            PollStatus::Done(Some(source)) => Ok(VideoSubmission::Ready(source)),
            PollStatus::Failed(msg) => Err(MediaError::Fatal(msg)),
            _ => {
                let name = response
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| MediaError::Fatal("submission returned no operation name".into()))?;
                tracing::info!(operation = %name, "video generation submitted");
                Ok(VideoSubmission::Pending(OperationHandle {
                    name: name.to_string(),
                }))
            }
        }
    }

    async fn poll_operation(&self, handle: &OperationHandle) -> Result<PollStatus, MediaError> {
        let url = format!("{}/{}", self.api_base, handle.name.trim_start_matches('/'));
        let response = self.send(self.client.get(url)).await?;
        Ok(parse_operation(&response))
    }

    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, MediaError> {
        let response = self
            .client
            .get(uri)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| MediaError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| MediaError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_inline_data() {
        let body = json!({
            "candidates": [{ "content": { "parts": [
                { "text": "here you go" },
                { "inlineData": { "mimeType": "image/png", "data": BASE64.encode(b"png-bytes") } }
            ]}}]
        });
        assert_eq!(parse_image_response(&body).unwrap(), b"png-bytes");
    }

    #[test]
    fn test_parse_image_without_data() {
        let body = json!({ "candidates": [{ "content": { "parts": [{ "text": "no" }] } }] });
        assert_eq!(parse_image_response(&body), Err(MediaError::EmptyResult));
    }

    #[test]
    fn test_parse_operation_states() {
        assert_eq!(parse_operation(&json!({"name": "op", "done": false})), PollStatus::Running);
        assert_eq!(
            parse_operation(&json!({"done": true, "error": {"message": "blocked"}})),
            PollStatus::Failed("blocked".into())
        );
        assert_eq!(parse_operation(&json!({"done": true, "response": {}})), PollStatus::Done(None));
    }

    #[test]
    fn test_parse_operation_uri_and_bytes() {
        let uri = json!({"done": true, "response": {"generateVideoResponse": {"generatedSamples": [
            {"video": {"uri": "https://files/v.mp4"}}
        ]}}});
        assert_eq!(
            parse_operation(&uri),
            PollStatus::Done(Some(ArtifactSource::Uri("https://files/v.mp4".into())))
        );

        let inline = json!({"done": true, "response": {"predictions": [
            {"bytesBase64Encoded": BASE64.encode(b"mp4"), "mimeType": "video/mp4"}
        ]}});
        assert_eq!(
            parse_operation(&inline),
            PollStatus::Done(Some(ArtifactSource::Bytes {
                data: b"mp4".to_vec(),
                mime_type: "video/mp4".into()
            }))
        );
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            MediaError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "{\"status\":\"RESOURCE_EXHAUSTED\"}"),
            MediaError::RateLimited(_)
        ));
        assert!(matches!(classify_status(StatusCode::BAD_REQUEST, ""), MediaError::Fatal(_)));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            MediaError::Transport(_)
        ));
    }
}
