//! 可观测性：tracing 订阅器初始化
//!
//! 默认 info 级别，RUST_LOG 可覆盖；json = true 时输出 JSON 行日志（便于收集 tool_audit 记录）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 安装全局订阅器；重复调用时保持已安装的订阅器
pub fn init(json: bool) {
    let registry = tracing_subscriber::registry().with(env_filter());
    let result = if json {
        registry.with(fmt::layer().json().with_current_span(false)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
