//! Agent 错误类型
//!
//! 准入类错误（NotRunning / CapacityExceeded / UnsupportedTaskType / PermissionDenied / TaskAlreadyActive）
//! 同步返回且不触碰注册表；后端错误在派发边界捕获，清理注册表、发出事件后再原样抛给调用方。

use thiserror::Error;

use crate::backend::BackendError;
use crate::core::state::LifecycleState;

/// AgentCore 对调用方暴露的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Agent is not running (state: {0})")]
    NotRunning(LifecycleState),

    #[error("Capacity exceeded: {active}/{max} tasks in flight")]
    CapacityExceeded { active: usize, max: usize },

    #[error("Unsupported task type: {0}")]
    UnsupportedTaskType(String),

    #[error("Permission denied for task type {task_type}: missing {missing:?}")]
    PermissionDenied { task_type: String, missing: Vec<String> },

    #[error("Task already active: {0}")]
    TaskAlreadyActive(String),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// stop() 排空超时，执行被强制放弃
    #[error("Drain timeout: execution abandoned during shutdown")]
    DrainTimeout,

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),
}

impl AgentError {
    /// 准入阶段的拒绝（调用方可退避后重试）
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            Self::NotRunning(_)
                | Self::CapacityExceeded { .. }
                | Self::UnsupportedTaskType(_)
                | Self::PermissionDenied { .. }
                | Self::TaskAlreadyActive(_)
        )
    }
}

impl From<BackendError> for AgentError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Cancelled => Self::Cancelled,
            BackendError::Unsupported(t) => Self::UnsupportedTaskType(t),
            other => Self::BackendError(other.to_string()),
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_cancelled_maps_to_cancelled() {
        assert_eq!(AgentError::from(BackendError::Cancelled), AgentError::Cancelled);
    }

    #[test]
    fn test_backend_failure_keeps_cause() {
        let err = AgentError::from(BackendError::Failed("matrix not hermitian".into()));
        match err {
            AgentError::BackendError(msg) => assert!(msg.contains("matrix not hermitian")),
            other => panic!("Expected BackendError, got {other:?}"),
        }
    }

    #[test]
    fn test_admission_rejection_classification() {
        assert!(AgentError::CapacityExceeded { active: 1, max: 1 }.is_admission_rejection());
        assert!(AgentError::NotRunning(LifecycleState::Stopped).is_admission_rejection());
        assert!(!AgentError::Cancelled.is_admission_rejection());
        assert!(!AgentError::DrainTimeout.is_admission_rejection());
    }
}
