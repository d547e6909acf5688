//! 脚本化后端（用于测试与本地演示，无需真实计算）
//!
//! 每种任务类型绑定一个 ScriptedStep；克隆共享同一组计数器与闸门，测试可在 Agent 持有后端时继续操控它。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{AbortPolicy, BackendError, BackendHealth, ComputationBackend};
use crate::core::TaskType;

/// 单步脚本
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// 立即成功
    Succeed(Value),
    /// 延迟后成功；期间观察取消
    Delay(Duration, Value),
    Fail(String),
    Unrecoverable(String),
    /// 等待 `release()` 放行；期间观察取消
    Gated(Value),
    /// 直到取消才返回
    UntilCancelled,
    /// 不观察取消信号，睡满后成功
    IgnoreCancel(Duration),
}

#[derive(Debug)]
struct ScriptShared {
    gate: Semaphore,
    health: Mutex<BackendHealth>,
    initialize_calls: AtomicUsize,
    execute_calls: AtomicUsize,
    shutdown_calls: AtomicUsize,
}

/// 脚本化后端
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    supported: HashSet<String>,
    steps: HashMap<String, ScriptedStep>,
    permissions: HashMap<String, Vec<String>>,
    abort_policy: AbortPolicy,
    init_error: Option<String>,
    verify_error: Option<String>,
    shared: Arc<ScriptShared>,
}

impl ScriptedBackend {
    /// 支持给定任务类型，默认每个类型立即成功
    pub fn new<I, S>(task_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            supported: task_types.into_iter().map(Into::into).collect(),
            steps: HashMap::new(),
            permissions: HashMap::new(),
            abort_policy: AbortPolicy::AwaitAcknowledgement,
            init_error: None,
            verify_error: None,
            shared: Arc::new(ScriptShared {
                gate: Semaphore::new(0),
                health: Mutex::new(BackendHealth::healthy()),
                initialize_calls: AtomicUsize::new(0),
                execute_calls: AtomicUsize::new(0),
                shutdown_calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_step(mut self, task_type: impl Into<String>, step: ScriptedStep) -> Self {
        self.steps.insert(task_type.into(), step);
        self
    }

    pub fn with_required_permissions<I, S>(mut self, task_type: impl Into<String>, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions
            .insert(task_type.into(), permissions.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_abort_policy(mut self, policy: AbortPolicy) -> Self {
        self.abort_policy = policy;
        self
    }

    pub fn failing_initialization(mut self, reason: impl Into<String>) -> Self {
        self.init_error = Some(reason.into());
        self
    }

    pub fn failing_verification(mut self, reason: impl Into<String>) -> Self {
        self.verify_error = Some(reason.into());
        self
    }

    /// 放行 n 个 Gated 执行
    pub fn release(&self, n: usize) {
        self.shared.gate.add_permits(n);
    }

    pub fn set_health(&self, health: BackendHealth) {
        *self.shared.health.lock().unwrap_or_else(PoisonError::into_inner) = health;
    }

    pub fn initialize_calls(&self) -> usize {
        self.shared.initialize_calls.load(Ordering::SeqCst)
    }

    pub fn execute_calls(&self) -> usize {
        self.shared.execute_calls.load(Ordering::SeqCst)
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shared.shutdown_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputationBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports(&self, task_type: &TaskType) -> bool {
        self.supported.contains(task_type.as_str())
    }

    fn required_permissions(&self, task_type: &TaskType) -> Vec<String> {
        self.permissions.get(task_type.as_str()).cloned().unwrap_or_default()
    }

    fn abort_policy(&self, _task_type: &TaskType) -> AbortPolicy {
        self.abort_policy
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        self.shared.initialize_calls.fetch_add(1, Ordering::SeqCst);
        match &self.init_error {
            Some(reason) => Err(BackendError::Failed(reason.clone())),
            None => Ok(()),
        }
    }

    async fn verify_resources(&self) -> Result<(), BackendError> {
        match &self.verify_error {
            Some(reason) => Err(BackendError::Failed(reason.clone())),
            None => Ok(()),
        }
    }

    async fn execute(
        &self,
        task_type: &TaskType,
        payload: Value,
        cancel: CancellationToken,
    ) -> Result<Value, BackendError> {
        self.shared.execute_calls.fetch_add(1, Ordering::SeqCst);
        if !self.supports(task_type) {
            return Err(BackendError::Unsupported(task_type.to_string()));
        }

        let step = self
            .steps
            .get(task_type.as_str())
            .cloned()
            .unwrap_or_else(|| ScriptedStep::Succeed(json!({ "echo": payload })));

        match step {
            ScriptedStep::Succeed(value) => Ok(value),
            ScriptedStep::Delay(delay, value) => tokio::select! {
                _ = cancel.cancelled() => Err(BackendError::Cancelled),
                _ = tokio::time::sleep(delay) => Ok(value),
            },
            ScriptedStep::Fail(reason) => Err(BackendError::Failed(reason)),
            ScriptedStep::Unrecoverable(reason) => Err(BackendError::Unrecoverable(reason)),
            ScriptedStep::Gated(value) => tokio::select! {
                _ = cancel.cancelled() => Err(BackendError::Cancelled),
                permit = self.shared.gate.acquire() => match permit {
                    Ok(permit) => {
                        permit.forget();
                        Ok(value)
                    }
                    Err(_) => Err(BackendError::Failed("gate closed".to_string())),
                },
            },
            ScriptedStep::UntilCancelled => {
                cancel.cancelled().await;
                Err(BackendError::Cancelled)
            }
            ScriptedStep::IgnoreCancel(duration) => {
                tokio::time::sleep(duration).await;
                Ok(json!({ "ignored_cancel": true }))
            }
        }
    }

    fn health_status(&self) -> BackendHealth {
        self.shared
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn shutdown(&self) {
        self.shared.shutdown_calls.fetch_add(1, Ordering::SeqCst);
    }
}
