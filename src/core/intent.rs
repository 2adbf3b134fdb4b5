//! 意图识别模块
//!
//! 一次无工具的补全调用把用户请求归为四类之一；调用失败或返回无法识别的标签时
//! 记为 Other 并标记 fell_back，由编排器走默认阶段序列。

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::prompts;
use crate::llm::{CompletionRequest, LlmClient, Message};

/// 识别出的意图类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    NewProject,
    ReviseScene,
    RegenerateImage,
    Other,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::NewProject => "NEW_PROJECT",
            Intent::ReviseScene => "REVISE_SCENE",
            Intent::RegenerateImage => "REGENERATE_IMAGE",
            Intent::Other => "OTHER",
        }
    }

    /// 解析模型输出；容忍空白、大小写、markdown 强调与句末标点
    pub fn parse(raw: &str) -> Option<Intent> {
        let label: String = raw
            .trim()
            .trim_matches(|c: char| c == '*' || c == '`' || c == '"' || c == '.' || c.is_whitespace())
            .to_uppercase()
            .replace([' ', '-'], "_");
        match label.as_str() {
            "NEW_PROJECT" => Some(Intent::NewProject),
            "REVISE_SCENE" => Some(Intent::ReviseScene),
            "REGENERATE_IMAGE" => Some(Intent::RegenerateImage),
            "OTHER" => Some(Intent::Other),
            _ => None,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 识别结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub intent: Intent,
    /// 调用失败或标签无法识别
    pub fell_back: bool,
}

/// 意图识别器
pub struct IntentRecognizer {
    llm: Arc<dyn LlmClient>,
    model: Option<String>,
    instruction: String,
}

impl IntentRecognizer {
    pub fn new(llm: Arc<dyn LlmClient>, model: Option<String>) -> Self {
        Self {
            llm,
            model,
            instruction: prompts::load_prompt("router", prompts::ROUTER),
        }
    }

    /// 识别用户意图
    pub async fn recognize(&self, user_input: &str) -> Classification {
        let request = CompletionRequest::new(vec![
            Message::system(self.instruction.clone()),
            Message::user(user_input),
        ])
        .with_model(self.model.clone())
        .with_temperature(0.0);

        match self.llm.complete(&request).await {
            Ok(resp) => {
                let raw = resp.text_or_empty();
                match Intent::parse(&raw) {
                    Some(intent) => Classification {
                        intent,
                        fell_back: false,
                    },
                    None => {
                        tracing::warn!(raw = %raw, "unrecognized intent label, using default sequence");
                        Classification {
                            intent: Intent::Other,
                            fell_back: true,
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "intent classification failed, using default sequence");
                Classification {
                    intent: Intent::Other,
                    fell_back: true,
                }
            }
        }
    }
}
