//! AgentCore：生命周期状态机、任务准入与派发、取消、排空关闭与健康查询
//!
//! 锁只保护簿记（状态迁移、注册表插入/移除），后端调用永远在锁外进行。
//! 每个被接纳的任务在独立的 tokio 任务中执行；注册表条目由「移除它的一方」负责结算，
//! 因此无论成功、失败、取消还是排空超时，每个执行恰好产生一个终态事件。

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backend::{AbortPolicy, BackendError, ComputationBackend};
use crate::core::error::{AgentError, AgentResult};
use crate::core::health::{HealthInputs, HealthPolicy, HealthReport, ResourceProbe};
use crate::core::registry::{ActiveTaskEntry, ActiveTaskRegistry, Admission};
use crate::core::state::LifecycleState;
use crate::core::task::{ExecutionId, Task, TaskOutput, TaskType};
use crate::events::{AgentEvent, EventSink};

/// 默认排空超时（秒）
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Agent 配置；构造后不可变
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub agent_type: String,
    pub max_concurrent_tasks: usize,
    /// 能力标签
    pub permissions: BTreeSet<String>,
    pub drain_timeout: Duration,
}

impl AgentConfig {
    pub fn new(agent_type: impl Into<String>, max_concurrent_tasks: usize) -> Self {
        Self {
            agent_type: agent_type.into(),
            max_concurrent_tasks,
            permissions: BTreeSet::new(),
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
        }
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn validate(&self) -> AgentResult<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(AgentError::InvalidConfig(
                "max_concurrent_tasks must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// stop() 的排空结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrainReport {
    pub state: LifecycleState,
    /// 在超时前正常结算的执行数
    pub drained: usize,
    /// 超时后被强制清除的执行
    pub abandoned: Vec<ExecutionId>,
    pub timed_out: bool,
}

impl DrainReport {
    fn idle(state: LifecycleState) -> Self {
        Self {
            state,
            drained: 0,
            abandoned: Vec::new(),
            timed_out: false,
        }
    }
}

struct Shared {
    state: LifecycleState,
    registry: ActiveTaskRegistry,
    last_drain: Option<DrainReport>,
}

struct Inner {
    id: String,
    config: AgentConfig,
    backend: Arc<dyn ComputationBackend>,
    sink: Arc<dyn EventSink>,
    probe: Arc<dyn ResourceProbe>,
    health_policy: HealthPolicy,
    /// 所有执行令牌的父令牌；进入 Failed 时取消
    root_token: CancellationToken,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<LifecycleState>,
}

enum StopPlan {
    Drain {
        signalled: Vec<(ExecutionId, TaskType)>,
        pending: Vec<CancellationToken>,
    },
    AwaitOther,
    Done(DrainReport),
}

/// 受监管的工作者；克隆代价低，所有克隆共享同一状态
#[derive(Clone)]
pub struct AgentCore {
    inner: Arc<Inner>,
}

impl AgentCore {
    pub(crate) fn new(
        id: String,
        config: AgentConfig,
        backend: Arc<dyn ComputationBackend>,
        sink: Arc<dyn EventSink>,
        probe: Arc<dyn ResourceProbe>,
        health_policy: HealthPolicy,
    ) -> AgentResult<Self> {
        config.validate()?;
        let (state_tx, _) = watch::channel(LifecycleState::Created);
        let registry = ActiveTaskRegistry::new(config.max_concurrent_tasks);
        Ok(Self {
            inner: Arc::new(Inner {
                id,
                config,
                backend,
                sink,
                probe,
                health_policy,
                root_token: CancellationToken::new(),
                shared: Mutex::new(Shared {
                    state: LifecycleState::Created,
                    registry,
                    last_drain: None,
                }),
                state_tx,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn current_state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().registry.len()
    }

    /// 订阅生命周期变化
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state_tx.subscribe()
    }

    /// Created → Starting → Running（或 Failed）。非 Created 状态调用为空操作，返回当前状态。
    pub async fn start(&self) -> AgentResult<LifecycleState> {
        let inner = &self.inner;
        let already = {
            let mut shared = inner.lock();
            if shared.state == LifecycleState::Created {
                inner.transition(&mut shared, LifecycleState::Starting);
                None
            } else {
                Some(shared.state)
            }
        };
        if let Some(state) = already {
            tracing::debug!(agent = %inner.id, state = %state, "start() ignored");
            return Ok(state);
        }

        inner.emit(AgentEvent::AgentStarting {
            agent_id: inner.id.clone(),
        });

        let init = match inner.backend.initialize().await {
            Ok(()) => inner.backend.verify_resources().await,
            Err(e) => Err(e),
        };

        match init {
            Ok(()) => {
                {
                    let mut shared = inner.lock();
                    inner.transition(&mut shared, LifecycleState::Running);
                }
                inner.emit(AgentEvent::AgentStarted {
                    agent_id: inner.id.clone(),
                });
                Ok(LifecycleState::Running)
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::error!(agent = %inner.id, error = %reason, "agent initialization failed");
                {
                    let mut shared = inner.lock();
                    inner.transition(&mut shared, LifecycleState::Failed);
                }
                inner.root_token.cancel();
                inner.emit(AgentEvent::AgentFailed {
                    agent_id: inner.id.clone(),
                    from: LifecycleState::Starting,
                    reason: reason.clone(),
                });
                Err(AgentError::InitializationFailed(reason))
            }
        }
    }

    /// 提交任务并等待其结果。
    ///
    /// 准入失败（NotRunning / UnsupportedTaskType / PermissionDenied / CapacityExceeded / TaskAlreadyActive）
    /// 立即返回且注册表不变；接纳后后端在独立任务中执行，调用方放弃等待不会影响清理。
    pub async fn submit(&self, task: Task) -> AgentResult<TaskOutput> {
        let inner = &self.inner;
        let type_check = inner.check_task(&task);
        let task_type = task.task_type.clone();
        let task_id = task.id.clone();
        let payload = task.payload.clone();

        let admission = {
            let mut shared = inner.lock();
            if !shared.state.accepts_tasks() {
                tracing::debug!(agent = %inner.id, task_id = %task_id, state = %shared.state, "task rejected: not running");
                return Err(AgentError::NotRunning(shared.state));
            }
            type_check?;
            shared
                .registry
                .admit(task, &inner.root_token)
                .inspect_err(|e| tracing::debug!(agent = %inner.id, task_id = %task_id, error = %e, "task rejected"))?
        };

        let Admission {
            execution_id,
            cancel_token,
            announced,
            outcome_rx,
        } = admission;

        // 锁外发布；announced 打开之前，其他路径不会为该执行发出终态事件
        inner.emit(AgentEvent::TaskStarted {
            agent_id: inner.id.clone(),
            task_id: task_id.clone(),
            execution_id,
            task_type: task_type.to_string(),
        });
        announced.cancel();

        let worker = Arc::clone(inner);
        tokio::spawn(async move {
            let guard = ExecutionGuard {
                inner: Arc::clone(&worker),
                execution_id,
                armed: true,
            };
            let result = worker.backend.execute(&task_type, payload, cancel_token).await;
            guard.finish(result);
        });

        outcome_rx.await.unwrap_or_else(|_| {
            Err(AgentError::BackendError(
                "execution ended without an outcome".to_string(),
            ))
        })
    }

    /// 取消 task id 对应的在途执行。
    ///
    /// 找不到或当前状态不接受取消时为空操作，返回 false；否则发出取消信号，
    /// 等待后端确认（AbortPolicy::Immediate 时立即释放条目）后返回 true。
    pub async fn cancel(&self, task_id: &str) -> bool {
        let inner = &self.inner;

        let found = {
            let shared = inner.lock();
            if shared.state.accepts_cancellation() {
                shared
                    .registry
                    .find_by_task_id(task_id)
                    .and_then(|id| shared.registry.get(id).map(|entry| (id, entry)))
                    .map(|(id, entry)| {
                        entry.cancel_token().cancel();
                        (id, entry.task.task_type.clone(), entry.settled_token())
                    })
            } else {
                None
            }
        };

        let Some((execution_id, task_type, settled)) = found else {
            tracing::debug!(agent = %inner.id, task_id = %task_id, "cancel ignored: no live execution");
            return false;
        };

        tracing::info!(agent = %inner.id, task_id = %task_id, execution = %execution_id, "cancellation requested");
        inner.release_immediate(&[(execution_id, task_type)]).await;
        settled.cancelled().await;
        true
    }

    /// Running → Stopping → Stopped。
    ///
    /// 停止接纳新任务，向所有在途执行发出取消并等待结算；超过排空超时后强制清空注册表，
    /// 被放弃的执行记录为泄漏工作，仍然进入 Stopped。Stopping 中的重复调用等待同一次排空完成。
    pub async fn stop(&self) -> DrainReport {
        let inner = &self.inner;

        let plan = {
            let mut shared = inner.lock();
            match shared.state {
                LifecycleState::Running => {
                    inner.transition(&mut shared, LifecycleState::Stopping);
                    let mut signalled = Vec::with_capacity(shared.registry.len());
                    let mut pending = Vec::with_capacity(shared.registry.len());
                    for id in shared.registry.execution_ids() {
                        if let Some(entry) = shared.registry.get(id) {
                            entry.cancel_token().cancel();
                            signalled.push((id, entry.task.task_type.clone()));
                            pending.push(entry.settled_token());
                        }
                    }
                    StopPlan::Drain { signalled, pending }
                }
                LifecycleState::Stopping => StopPlan::AwaitOther,
                other => StopPlan::Done(
                    shared
                        .last_drain
                        .clone()
                        .unwrap_or_else(|| DrainReport::idle(other)),
                ),
            }
        };

        let (signalled, pending) = match plan {
            StopPlan::Done(report) => {
                tracing::debug!(agent = %inner.id, state = %report.state, "stop() ignored");
                return report;
            }
            StopPlan::AwaitOther => return self.wait_for_stop().await,
            StopPlan::Drain { signalled, pending } => (signalled, pending),
        };

        let active = pending.len();
        tracing::info!(agent = %inner.id, active, "stopping agent, draining in-flight tasks");
        inner.emit(AgentEvent::AgentStopping {
            agent_id: inner.id.clone(),
            active,
        });
        inner.release_immediate(&signalled).await;

        let timeout = inner.config.drain_timeout;
        let settled_in_time = tokio::time::timeout(timeout, join_all(pending.iter().map(|t| t.cancelled())))
            .await
            .is_ok();
        let abandoned = if settled_in_time {
            Vec::new()
        } else {
            inner.force_drain(timeout).await
        };

        inner.backend.shutdown().await;

        let report = DrainReport {
            state: LifecycleState::Stopped,
            drained: active.saturating_sub(abandoned.len()),
            timed_out: !abandoned.is_empty(),
            abandoned,
        };
        {
            let mut shared = inner.lock();
            shared.last_drain = Some(report.clone());
            inner.transition(&mut shared, LifecycleState::Stopped);
        }
        inner.emit(AgentEvent::AgentStopped {
            agent_id: inner.id.clone(),
            drained: report.drained,
            abandoned: report.abandoned.len(),
        });
        report
    }

    /// 同步、只读，任何状态下都可调用
    pub fn health_check(&self) -> HealthReport {
        let inner = &self.inner;
        let (state, active_count) = {
            let shared = inner.lock();
            (shared.state, shared.registry.len())
        };
        HealthReport::aggregate(
            HealthInputs {
                state,
                active_count,
                max_concurrent: inner.config.max_concurrent_tasks,
                backend: inner.backend.health_status(),
                memory: inner.probe.memory_usage(),
            },
            &inner.health_policy,
        )
    }

    async fn wait_for_stop(&self) -> DrainReport {
        let mut rx = self.inner.state_tx.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
        let shared = self.inner.lock();
        shared
            .last_drain
            .clone()
            .unwrap_or_else(|| DrainReport::idle(shared.state))
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        // 被保护的数据只是簿记，中毒后照常使用
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, shared: &mut Shared, next: LifecycleState) -> bool {
        let from = shared.state;
        if !from.can_transition_to(next) {
            tracing::debug!(agent = %self.id, from = %from, to = %next, "illegal lifecycle transition ignored");
            return false;
        }
        shared.state = next;
        self.state_tx.send_replace(next);
        tracing::info!(agent = %self.id, from = %from, to = %next, "lifecycle transition");
        true
    }

    fn emit(&self, event: AgentEvent) {
        if let Err(e) = self.sink.publish(&event) {
            tracing::warn!(agent = %self.id, event = event.name(), error = %e, "failed to publish event");
        }
    }

    fn check_task(&self, task: &Task) -> AgentResult<()> {
        if !self.backend.supports(&task.task_type) {
            return Err(AgentError::UnsupportedTaskType(task.task_type.to_string()));
        }
        let missing: Vec<String> = self
            .backend
            .required_permissions(&task.task_type)
            .into_iter()
            .filter(|p| !self.config.permissions.contains(p))
            .collect();
        if !missing.is_empty() {
            return Err(AgentError::PermissionDenied {
                task_type: task.task_type.to_string(),
                missing,
            });
        }
        Ok(())
    }

    /// 后端返回后的结算；条目已被取消 / 排空释放时只记录日志
    fn settle(&self, execution_id: ExecutionId, result: Result<Value, BackendError>) {
        let unrecoverable = match &result {
            Err(BackendError::Unrecoverable(reason)) => Some(reason.clone()),
            _ => None,
        };

        let released = {
            let mut shared = self.lock();
            shared.registry.remove(execution_id).map(|entry| {
                let failed_from = if unrecoverable.is_some() {
                    let from = shared.state;
                    self.transition(&mut shared, LifecycleState::Failed)
                        .then_some(from)
                } else {
                    None
                };
                (entry, failed_from)
            })
        };

        let Some((entry, failed_from)) = released else {
            tracing::debug!(agent = %self.id, execution = %execution_id, "execution finished after its entry was released");
            return;
        };
        if failed_from.is_some() {
            self.root_token.cancel();
        }

        let elapsed_ms = entry.elapsed().as_millis() as u64;
        let task_id = entry.task.id.clone();
        let (event, outcome) = match result {
            Ok(value) => {
                let result_keys = value
                    .as_object()
                    .map(|o| o.keys().cloned().collect())
                    .unwrap_or_default();
                (
                    AgentEvent::TaskCompleted {
                        agent_id: self.id.clone(),
                        task_id: task_id.clone(),
                        execution_id,
                        elapsed_ms,
                        result_keys,
                    },
                    Ok(TaskOutput {
                        task_id,
                        execution_id,
                        value,
                        elapsed_ms,
                    }),
                )
            }
            Err(BackendError::Cancelled) => (
                AgentEvent::TaskCancelled {
                    agent_id: self.id.clone(),
                    task_id,
                    execution_id,
                    elapsed_ms,
                    abandoned: false,
                },
                Err(AgentError::Cancelled),
            ),
            Err(e) => {
                tracing::warn!(agent = %self.id, task_id = %task_id, execution = %execution_id, error = %e, "task failed");
                (
                    AgentEvent::TaskFailed {
                        agent_id: self.id.clone(),
                        task_id,
                        execution_id,
                        elapsed_ms,
                        error: e.to_string(),
                    },
                    Err(AgentError::from(e)),
                )
            }
        };

        self.emit(event);
        entry.settle(outcome);

        if let (Some(from), Some(reason)) = (failed_from, unrecoverable) {
            tracing::error!(agent = %self.id, error = %reason, "unrecoverable backend error, agent failed");
            self.emit(AgentEvent::AgentFailed {
                agent_id: self.id.clone(),
                from,
                reason,
            });
        }
    }

    /// 对 AbortPolicy::Immediate 的执行立即释放条目，不等待后端确认
    async fn release_immediate(&self, signalled: &[(ExecutionId, TaskType)]) {
        let immediate: Vec<ExecutionId> = signalled
            .iter()
            .filter(|(_, task_type)| self.backend.abort_policy(task_type) == AbortPolicy::Immediate)
            .map(|(id, _)| *id)
            .collect();
        if immediate.is_empty() {
            return;
        }
        let released: Vec<(ExecutionId, ActiveTaskEntry)> = {
            let mut shared = self.lock();
            immediate
                .into_iter()
                .filter_map(|id| shared.registry.remove(id).map(|entry| (id, entry)))
                .collect()
        };
        for (execution_id, entry) in released {
            self.release_cancelled(execution_id, entry, false).await;
        }
    }

    /// 释放一个未等待后端确认的条目（立即取消或排空放弃）
    async fn release_cancelled(&self, execution_id: ExecutionId, entry: ActiveTaskEntry, abandoned: bool) {
        entry.announced().await;
        self.emit(AgentEvent::TaskCancelled {
            agent_id: self.id.clone(),
            task_id: entry.task.id.clone(),
            execution_id,
            elapsed_ms: entry.elapsed().as_millis() as u64,
            abandoned,
        });
        let outcome = if abandoned {
            AgentError::DrainTimeout
        } else {
            AgentError::Cancelled
        };
        entry.settle(Err(outcome));
    }

    /// 排空超时：清空注册表，逐条记录被放弃的执行
    async fn force_drain(&self, timeout: Duration) -> Vec<ExecutionId> {
        let drained = self.lock().registry.drain_all();
        let abandoned: Vec<ExecutionId> = drained.iter().map(|(id, _)| *id).collect();
        if abandoned.is_empty() {
            return abandoned;
        }

        for (execution_id, entry) in &drained {
            tracing::warn!(
                agent = %self.id,
                execution = %execution_id,
                task_id = %entry.task.id,
                elapsed_ms = entry.elapsed().as_millis() as u64,
                "drain timeout: abandoning in-flight execution"
            );
        }
        self.emit(AgentEvent::DrainTimeout {
            agent_id: self.id.clone(),
            timeout_ms: timeout.as_millis() as u64,
            abandoned: abandoned.clone(),
        });
        for (execution_id, entry) in drained {
            self.release_cancelled(execution_id, entry, true).await;
        }
        abandoned
    }
}

/// 保证执行结束（含 panic 与运行时关闭）时条目一定被结算
struct ExecutionGuard {
    inner: Arc<Inner>,
    execution_id: ExecutionId,
    armed: bool,
}

impl ExecutionGuard {
    fn finish(mut self, result: Result<Value, BackendError>) {
        self.armed = false;
        self.inner.settle(self.execution_id, result);
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.settle(
                self.execution_id,
                Err(BackendError::Failed("execution aborted before completion".to_string())),
            );
        }
    }
}
