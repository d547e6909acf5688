//! yur-agent - 受监管的计算 Agent 执行核心
//!
//! 模块划分：
//! - **backend**: 计算后端抽象、路由器、模拟后端与脚本化测试后端
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务模型、生命周期状态机、准入控制、取消、健康聚合、优雅关闭
//! - **events**: 生命周期与任务事件、事件出口
//! - **observability**: tracing 初始化
//! - **supervisor**: Agent 注册表

pub mod backend;
pub mod config;
pub mod core;
pub mod events;
pub mod observability;
pub mod supervisor;

pub use crate::core::{AgentBuilder, AgentConfig, AgentCore, AgentError, LifecycleState, Task};
pub use crate::supervisor::AgentRegistry;
