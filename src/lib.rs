//! DreamFactory - AI 影片制作流水线编排
//!
//! 模块划分：
//! - **agent**: 无头装配（按配置构建提供方、存储与编排器）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 阶段编排、意图识别、状态、错误恢复、阶段监管、任务调度
//! - **generation**: 媒体提供方抽象（Gemini / Veo、Mock）、生成任务驱动与兜底合成
//! - **llm**: Completion Provider 抽象与实现（OpenAI 兼容 / Gemini / Mock）
//! - **observability**: 日志初始化
//! - **react**: 有界工具调用循环（Agent 运行时）
//! - **store**: WorkUnit 记录存储（JSON 文件 / SQLite / 内存）与 Blob 存储
//! - **tools**: 工具注册表、执行器与各阶段工具

pub mod agent;
pub mod config;
pub mod core;
pub mod generation;
pub mod llm;
pub mod observability;
pub mod react;
pub mod store;
pub mod tools;

pub use crate::core::{StageOrchestrator, StageReport, StageRequest};
