//! Agent 运行时：有界的 工具调用 -> 观察 -> 再请求 循环
//!
//! 每轮往返把完整对话与本阶段的工具声明发给 Completion Provider；
//! 模型请求的全部工具调用都会执行，结果汇总为一条 Tool 消息回送；
//! 模型只返回文本时结束；轮数达到 max_turns 仍在请求工具则返回 RuntimeExhausted。

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::PipelineError;
use crate::llm::{CompletionRequest, LlmClient, Message, ResponseSchema, ToolResult};
use crate::react::ReactEvent;
use crate::tools::ToolExecutor;

/// 单次运行默认最大往返轮数
pub const DEFAULT_MAX_TURNS: usize = 10;
/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 单个 Agent 的配置（模型、系统指令、温度、轮数上限）
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// 日志中的 Agent 名（writer / artist ...）
    pub name: String,
    /// None 时使用客户端默认模型
    pub model: Option<String>,
    pub system_instruction: String,
    pub temperature: f32,
    pub max_turns: usize,
    pub response_schema: Option<ResponseSchema>,
}

impl AgentConfig {
    pub fn new(name: &str, system_instruction: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            model: None,
            system_instruction: system_instruction.into(),
            temperature: 0.7,
            max_turns: DEFAULT_MAX_TURNS,
            response_schema: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }
}

/// 一次运行的推理状态；turn_count 每轮往返加一，且不超过 max_turns
#[derive(Debug, Clone)]
pub struct ReasoningTurn {
    pub input: String,
    pub history: Vec<Message>,
    pub turn_count: usize,
    pub max_turns: usize,
}

impl ReasoningTurn {
    fn new(system: &str, input: &str, max_turns: usize) -> Self {
        Self {
            input: input.to_string(),
            history: vec![Message::system(system), Message::user(input)],
            turn_count: 0,
            max_turns,
        }
    }

    fn exhausted(&self) -> bool {
        self.turn_count >= self.max_turns
    }
}

/// 运行结果：最终文本与完整推理状态
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub response: String,
    pub turn: ReasoningTurn,
}

/// Agent 运行时
#[derive(Clone)]
pub struct AgentRuntime {
    llm: Arc<dyn LlmClient>,
    executor: ToolExecutor,
    config: AgentConfig,
    cancel_token: CancellationToken,
    event_tx: Option<UnboundedSender<ReactEvent>>,
}

impl AgentRuntime {
    pub fn new(llm: Arc<dyn LlmClient>, executor: ToolExecutor, config: AgentConfig) -> Self {
        Self {
            llm,
            executor,
            config,
            cancel_token: CancellationToken::new(),
            event_tx: None,
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<ReactEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn send_event(&self, ev: ReactEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }

    /// 运行到模型给出最终文本
    pub async fn run(&self, input: &str) -> Result<AgentOutcome, PipelineError> {
        let mut turn = ReasoningTurn::new(&self.config.system_instruction, input, self.config.max_turns);
        let tools = self.executor.schemas();

        loop {
            if self.cancel_token.is_cancelled() {
                self.send_event(ReactEvent::Error {
                    text: "Cancelled".to_string(),
                });
                return Err(PipelineError::Cancelled);
            }
            if turn.exhausted() {
                tracing::warn!(agent = %self.config.name, max_turns = turn.max_turns, "reasoning loop exhausted");
                self.send_event(ReactEvent::Exhausted {
                    max_turns: turn.max_turns,
                });
                return Err(PipelineError::RuntimeExhausted {
                    max_turns: turn.max_turns,
                });
            }

            turn.turn_count += 1;
            self.send_event(ReactEvent::TurnStarted {
                agent: self.config.name.clone(),
                turn: turn.turn_count,
                max_turns: turn.max_turns,
            });

            let mut request = CompletionRequest::new(turn.history.clone())
                .with_model(self.config.model.clone())
                .with_tools(tools.clone())
                .with_temperature(self.config.temperature);
            if let Some(schema) = &self.config.response_schema {
                request = request.with_response_schema(schema.clone());
            }

            let response = tokio::select! {
                _ = self.cancel_token.cancelled() => return Err(PipelineError::Cancelled),
                r = self.llm.complete(&request) => r?,
            };

            if !response.wants_tools() {
                let text = response.text_or_empty();
                tracing::debug!(agent = %self.config.name, turns = turn.turn_count, "agent finished");
                turn.history.push(Message::assistant(text.clone()));
                self.send_event(ReactEvent::FinalAnswer { text: text.clone() });
                return Ok(AgentOutcome {
                    response: text,
                    turn,
                });
            }

            let mut results: Vec<ToolResult> = Vec::with_capacity(response.tool_calls.len());
            for call in &response.tool_calls {
                self.send_event(ReactEvent::ToolCall {
                    tool: call.name.clone(),
                    args: call.args.clone(),
                });
                let result = self.executor.invoke(call).await;
                if result.is_error() {
                    self.send_event(ReactEvent::ToolFailure {
                        tool: call.name.clone(),
                        reason: result.payload["error"].to_string(),
                    });
                } else {
                    self.send_event(ReactEvent::Observation {
                        tool: call.name.clone(),
                        preview: preview(&result.payload.to_string()),
                    });
                }
                results.push(result);
            }

            turn.history.push(Message::assistant_with_tools(
                response.text_or_empty(),
                response.tool_calls.clone(),
            ));
            turn.history.push(Message::tool_results(results));
        }
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!("{}...", s.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, LlmError, MockLlmClient, Role, ToolInvocation};
    use crate::tools::{Tool, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo"
        }
        async fn execute(&self, args: Value) -> Result<Value, String> {
            Ok(args)
        }
    }

    struct Explode;

    #[async_trait]
    impl Tool for Explode {
        fn name(&self) -> &str {
            "explode"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        async fn execute(&self, _args: Value) -> Result<Value, String> {
            Err("boom".into())
        }
    }

    fn runtime(mock: Arc<MockLlmClient>, max_turns: usize) -> AgentRuntime {
        let executor = ToolExecutor::new(ToolRegistry::new().with(Echo).with(Explode), 5);
        AgentRuntime::new(
            mock,
            executor,
            AgentConfig::new("test", "system").with_max_turns(max_turns),
        )
    }

    #[tokio::test]
    async fn test_text_response_ends_loop() {
        let mock = Arc::new(MockLlmClient::with_responses([CompletionResponse::text("done")]));
        let outcome = runtime(mock.clone(), 10).run("hi").await.unwrap();
        assert_eq!(outcome.response, "done");
        assert_eq!(outcome.turn.turn_count, 1);
        assert_eq!(mock.requests()[0].tools.len(), 2);
    }

    #[tokio::test]
    async fn test_all_tool_calls_executed_and_returned_together() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_response(CompletionResponse::tool_calls(vec![
            ToolInvocation::new("a", "echo", json!({"n": 1})),
            ToolInvocation::new("b", "missing_tool", json!({})),
            ToolInvocation::new("c", "echo", json!({"n": 3})),
        ]));
        mock.push_text("finished");

        let outcome = runtime(mock.clone(), 10).run("go").await.unwrap();
        assert_eq!(outcome.turn.turn_count, 2);

        let second = &mock.requests()[1];
        let tool_msg = second.messages.last().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(tool_msg.tool_results.len(), 3);
        assert_eq!(tool_msg.tool_results[0].payload, json!({"n": 1}));
        assert_eq!(tool_msg.tool_results[1].payload, json!({"error": "tool not found"}));
        assert_eq!(tool_msg.tool_results[2].payload, json!({"n": 3}));
    }

    #[tokio::test]
    async fn test_failing_tool_error_reaches_next_request() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_response(CompletionResponse::tool_calls(vec![ToolInvocation::new(
            "call_explode",
            "explode",
            json!({}),
        )]));
        mock.push_text("recovered");

        let outcome = runtime(mock.clone(), 10).run("go").await.unwrap();
        assert_eq!(outcome.response, "recovered");

        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        let assistant = &requests[1].messages[requests[1].messages.len() - 2];
        assert_eq!(assistant.tool_calls[0].id, "call_explode");
        let tool_msg = requests[1].messages.last().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(tool_msg.tool_results.len(), 1);
        assert_eq!(tool_msg.tool_results[0].invocation_id, "call_explode");
        assert_eq!(tool_msg.tool_results[0].name, "explode");
        assert_eq!(tool_msg.tool_results[0].payload, json!({"error": "boom"}));
    }

    #[tokio::test]
    async fn test_exhausted_at_exactly_max_turns() {
        let always_tool = CompletionResponse::tool_calls(vec![ToolInvocation::new(
            "x",
            "echo",
            json!({}),
        )]);
        let mock = Arc::new(MockLlmClient::repeating(always_tool));
        let err = runtime(mock.clone(), 4).run("loop").await.unwrap_err();
        assert_eq!(err, PipelineError::RuntimeExhausted { max_turns: 4 });
        assert_eq!(mock.requests().len(), 4);
    }

    #[tokio::test]
    async fn test_provider_error_propagates() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::Unavailable("down".into()));
        let err = runtime(mock, 10).run("hi").await.unwrap_err();
        assert!(matches!(err, PipelineError::Provider(LlmError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_turn() {
        let mock = Arc::new(MockLlmClient::new());
        let token = CancellationToken::new();
        token.cancel();
        let err = runtime(mock.clone(), 10)
            .with_cancel_token(token)
            .run("hi")
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::Cancelled);
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_tool_call("echo", json!({"a": 1}));
        mock.push_text("ok");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        runtime(mock, 10).with_event_tx(tx).run("hi").await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push(serde_json::to_value(&ev).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(
            kinds,
            vec!["turn_started", "tool_call", "observation", "turn_started", "final_answer"]
        );
    }
}
