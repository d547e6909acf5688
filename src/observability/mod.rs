//! 可观测性：tracing 订阅器初始化
//!
//! 默认 `info`，可通过 RUST_LOG 覆盖（如 `RUST_LOG=yur_agent=debug`）。
//! 生命周期与任务事件经 TracingSink 以结构化字段输出到同一订阅器。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_DIRECTIVE: &str = "info";

/// 安装全局订阅器；重复调用（如多个测试）时忽略后续调用
pub fn init() {
    init_with(DEFAULT_DIRECTIVE);
}

pub fn init_with(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
