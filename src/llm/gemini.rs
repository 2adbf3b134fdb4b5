//! Gemini 补全客户端（OpenAI 兼容层）
//!
//! Gemini 提供 OpenAI 兼容的 Chat Completions 端点，支持 tools 与 response_format。
//! - Base URL: https://generativelanguage.googleapis.com/v1beta/openai/
//! - 模型: gemini-2.0-flash (路由 / 轻量), gemini-2.5-pro (编剧)

use crate::llm::OpenAiClient;

/// Gemini API 常量
pub const GEMINI_OPENAI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai/";
pub const GEMINI_FLASH: &str = "gemini-2.0-flash";
pub const GEMINI_PRO: &str = "gemini-2.5-pro";

/// 读取 Gemini API Key：`GEMINI_API_KEY` 优先，其次 `GOOGLE_API_KEY`
pub fn gemini_api_key() -> Option<String> {
    std::env::var("GEMINI_API_KEY")
        .ok()
        .or_else(|| std::env::var("GOOGLE_API_KEY").ok())
        .filter(|k| !k.trim().is_empty())
}

/// 创建 Gemini 客户端
///
/// - `base_url` 为空时使用官方兼容层地址
/// - 模型未指定时使用 `gemini-2.0-flash`
pub fn create_gemini_client(model: Option<&str>, base_url: Option<&str>, api_key: &str) -> OpenAiClient {
    let model = model.unwrap_or(GEMINI_FLASH);
    OpenAiClient::new(
        Some(base_url.unwrap_or(GEMINI_OPENAI_BASE_URL)),
        model,
        Some(api_key),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmClient;

    #[test]
    fn test_default_model() {
        let client = create_gemini_client(None, None, "key");
        assert_eq!(client.model_name(), GEMINI_FLASH);
    }
}
