//! 后端路由器
//!
//! 每族任务类型一个后端实现，路由器按注册顺序选择第一个声明支持该类型的后端。
//! 对 AgentCore 而言它本身就是一个 ComputationBackend。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{AbortPolicy, BackendError, BackendHealth, ComputationBackend};
use crate::core::TaskType;

/// 组合多个后端
#[derive(Default, Clone)]
pub struct BackendRouter {
    backends: Vec<Arc<dyn ComputationBackend>>,
}

impl BackendRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: impl ComputationBackend + 'static) -> Self {
        self.backends.push(Arc::new(backend));
        self
    }

    fn route(&self, task_type: &TaskType) -> Option<&Arc<dyn ComputationBackend>> {
        self.backends.iter().find(|b| b.supports(task_type))
    }
}

#[async_trait]
impl ComputationBackend for BackendRouter {
    fn name(&self) -> &str {
        "router"
    }

    fn supports(&self, task_type: &TaskType) -> bool {
        self.route(task_type).is_some()
    }

    fn required_permissions(&self, task_type: &TaskType) -> Vec<String> {
        self.route(task_type)
            .map(|b| b.required_permissions(task_type))
            .unwrap_or_default()
    }

    fn abort_policy(&self, task_type: &TaskType) -> AbortPolicy {
        self.route(task_type)
            .map(|b| b.abort_policy(task_type))
            .unwrap_or_default()
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        for backend in &self.backends {
            backend.initialize().await.map_err(|e| prefix(backend.name(), e))?;
        }
        Ok(())
    }

    async fn verify_resources(&self) -> Result<(), BackendError> {
        for backend in &self.backends {
            backend.verify_resources().await.map_err(|e| prefix(backend.name(), e))?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        task_type: &TaskType,
        payload: Value,
        cancel: CancellationToken,
    ) -> Result<Value, BackendError> {
        match self.route(task_type) {
            Some(backend) => backend.execute(task_type, payload, cancel).await,
            None => Err(BackendError::Unsupported(task_type.to_string())),
        }
    }

    fn health_status(&self) -> BackendHealth {
        let problems: Vec<String> = self
            .backends
            .iter()
            .filter_map(|b| {
                let health = b.health_status();
                (!health.healthy).then(|| {
                    format!("{}: {}", b.name(), health.reason.unwrap_or(health.status))
                })
            })
            .collect();
        if problems.is_empty() {
            BackendHealth::healthy()
        } else {
            BackendHealth::unhealthy(problems.join("; "))
        }
    }

    async fn shutdown(&self) {
        for backend in &self.backends {
            backend.shutdown().await;
        }
    }
}

/// 在错误信息前加上后端名；取消保持原样
fn prefix(name: &str, err: BackendError) -> BackendError {
    match err {
        BackendError::Failed(msg) => BackendError::Failed(format!("{name}: {msg}")),
        BackendError::Unrecoverable(msg) => BackendError::Unrecoverable(format!("{name}: {msg}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ScriptedBackend, ScriptedStep};
    use serde_json::json;

    fn router() -> (BackendRouter, ScriptedBackend, ScriptedBackend) {
        let sim = ScriptedBackend::new(["run_simulation"])
            .with_step("run_simulation", ScriptedStep::Succeed(json!({"family": "sim"})))
            .with_required_permissions("run_simulation", ["simulation"]);
        let twin = ScriptedBackend::new(["system_status"])
            .with_step("system_status", ScriptedStep::Succeed(json!({"family": "twin"})))
            .with_abort_policy(AbortPolicy::Immediate);
        let router = BackendRouter::new().with_backend(sim.clone()).with_backend(twin.clone());
        (router, sim, twin)
    }

    #[tokio::test]
    async fn test_routes_by_task_type() {
        let (router, _, _) = router();
        let out = router
            .execute(&"system_status".into(), Value::Null, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out["family"], "twin");
        assert_eq!(router.abort_policy(&"system_status".into()), AbortPolicy::Immediate);
        assert_eq!(router.required_permissions(&"run_simulation".into()), vec!["simulation"]);
    }

    #[tokio::test]
    async fn test_unknown_type_unsupported() {
        let (router, _, _) = router();
        assert!(!router.supports(&"render_markdown".into()));
        let err = router
            .execute(&"render_markdown".into(), Value::Null, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Unsupported("render_markdown".into()));
    }

    #[tokio::test]
    async fn test_initialize_reports_failing_backend() {
        let router = BackendRouter::new()
            .with_backend(ScriptedBackend::new(["a"]))
            .with_backend(ScriptedBackend::new(["b"]).failing_initialization("no device"));
        let err = router.initialize().await.unwrap_err();
        assert_eq!(err, BackendError::Failed("scripted: no device".into()));
    }

    #[test]
    fn test_health_aggregates_members() {
        let (router, _, twin) = router();
        assert!(router.health_status().healthy);
        twin.set_health(BackendHealth::unhealthy("psutil unavailable"));
        let health = router.health_status();
        assert!(!health.healthy);
        assert!(health.reason.unwrap().contains("psutil unavailable"));
    }
}
