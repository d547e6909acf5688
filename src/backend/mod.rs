//! 计算后端抽象
//!
//! AgentCore 只负责调度、限流、取消与观测；实际计算由注入的 ComputationBackend 完成。
//! 后端必须观察 CancellationToken，收到取消后尽快返回 `BackendError::Cancelled`。

pub mod mock;
pub mod router;
pub mod simulation;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::TaskType;

pub use mock::{ScriptedBackend, ScriptedStep};
pub use router::BackendRouter;
pub use simulation::SimulationBackend;

/// 后端侧错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// 观察到取消信号后主动退出
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),

    /// 不可恢复错误：Agent 将进入 Failed
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("unsupported task type: {0}")]
    Unsupported(String),
}

/// 取消策略：等待后端确认，或发出信号后立即移除注册表条目
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortPolicy {
    #[default]
    AwaitAcknowledgement,
    Immediate,
}

/// 后端自报健康状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendHealth {
    pub healthy: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BackendHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            status: "ok".to_string(),
            reason: None,
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            status: "degraded".to_string(),
            reason: Some(reason.into()),
        }
    }
}

/// 计算后端 trait：一族任务类型对应一个实现，由 BackendRouter 组合
#[async_trait]
pub trait ComputationBackend: Send + Sync {
    /// 后端名称（用于日志与健康报告）
    fn name(&self) -> &str;

    /// 是否支持该任务类型；不支持的类型在准入阶段即被拒绝
    fn supports(&self, task_type: &TaskType) -> bool;

    /// 执行该任务类型所需的权限标签
    fn required_permissions(&self, _task_type: &TaskType) -> Vec<String> {
        Vec::new()
    }

    /// 该任务类型的取消策略
    fn abort_policy(&self, _task_type: &TaskType) -> AbortPolicy {
        AbortPolicy::AwaitAcknowledgement
    }

    /// start() 时调用一次
    async fn initialize(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// 资源访问校验（start() 中紧随 initialize）
    async fn verify_resources(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// 执行任务；必须观察 cancel
    async fn execute(
        &self,
        task_type: &TaskType,
        payload: Value,
        cancel: CancellationToken,
    ) -> Result<Value, BackendError>;

    fn health_status(&self) -> BackendHealth {
        BackendHealth::healthy()
    }

    /// stop() 排空后调用
    async fn shutdown(&self) {}
}
