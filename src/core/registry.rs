//! 活跃任务注册表与准入控制
//!
//! 以 ExecutionId 为键保存在途执行；容量满时直接拒绝（不排队）。
//! 注册表只由 AgentCore 在锁内修改；条目被谁移除，谁就负责结算（发送结果、唤醒等待者）。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::core::error::{AgentError, AgentResult};
use crate::core::task::{ExecutionId, Task, TaskOutput};

/// 结算结果的发送端，提交者持有对应的接收端
pub(crate) type OutcomeSender = oneshot::Sender<AgentResult<TaskOutput>>;

/// 单个在途执行
#[derive(Debug)]
pub struct ActiveTaskEntry {
    pub task: Task,
    pub started_at: DateTime<Utc>,
    started: Instant,
    cancel_token: CancellationToken,
    /// task_started 发布后取消；终态事件须在其之后
    announced: CancellationToken,
    /// 条目移除后取消，用于唤醒等待确认的 cancel() / stop()
    settled: CancellationToken,
    outcome_tx: Option<OutcomeSender>,
}

impl ActiveTaskEntry {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub(crate) fn settled_token(&self) -> CancellationToken {
        self.settled.clone()
    }

    /// 等待该执行的 task_started 发布完成
    pub(crate) async fn announced(&self) {
        self.announced.cancelled().await;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// 把结果交给提交者并唤醒等待者；提交者已离开时结果被丢弃
    pub(crate) fn settle(mut self, outcome: AgentResult<TaskOutput>) {
        if let Some(tx) = self.outcome_tx.take() {
            let _ = tx.send(outcome);
        }
        self.settled.cancel();
    }
}

/// 准入成功后交给 AgentCore 的句柄
#[derive(Debug)]
pub(crate) struct Admission {
    pub execution_id: ExecutionId,
    pub cancel_token: CancellationToken,
    /// 发布 task_started 后由提交方取消
    pub announced: CancellationToken,
    pub outcome_rx: oneshot::Receiver<AgentResult<TaskOutput>>,
}

/// 活跃任务注册表
#[derive(Debug)]
pub struct ActiveTaskRegistry {
    max_concurrent: usize,
    entries: HashMap<ExecutionId, ActiveTaskEntry>,
    /// task id → 当前唯一的在途执行
    by_task: HashMap<String, ExecutionId>,
    next_execution: u64,
}

impl ActiveTaskRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            entries: HashMap::new(),
            by_task: HashMap::new(),
            next_execution: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_concurrent
    }

    /// 准入：容量与重复 task id 检查通过后分配新的 execution id 并插入条目。
    /// 取消令牌是 parent 的子令牌，parent 取消时所有执行一并收到信号。
    pub(crate) fn admit(&mut self, task: Task, parent: &CancellationToken) -> AgentResult<Admission> {
        if self.is_full() {
            return Err(AgentError::CapacityExceeded {
                active: self.entries.len(),
                max: self.max_concurrent,
            });
        }
        if self.by_task.contains_key(&task.id) {
            return Err(AgentError::TaskAlreadyActive(task.id));
        }

        let execution_id = ExecutionId::from_raw(self.next_execution);
        self.next_execution += 1;

        let cancel_token = parent.child_token();
        let announced = CancellationToken::new();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        self.by_task.insert(task.id.clone(), execution_id);
        self.entries.insert(
            execution_id,
            ActiveTaskEntry {
                task,
                started_at: Utc::now(),
                started: Instant::now(),
                cancel_token: cancel_token.clone(),
                announced: announced.clone(),
                settled: CancellationToken::new(),
                outcome_tx: Some(outcome_tx),
            },
        );

        Ok(Admission {
            execution_id,
            cancel_token,
            announced,
            outcome_rx,
        })
    }

    pub fn get(&self, execution_id: ExecutionId) -> Option<&ActiveTaskEntry> {
        self.entries.get(&execution_id)
    }

    pub fn find_by_task_id(&self, task_id: &str) -> Option<ExecutionId> {
        self.by_task.get(task_id).copied()
    }

    /// 移除条目；同一 execution id 至多成功一次
    pub fn remove(&mut self, execution_id: ExecutionId) -> Option<ActiveTaskEntry> {
        let entry = self.entries.remove(&execution_id)?;
        if self.by_task.get(&entry.task.id) == Some(&execution_id) {
            self.by_task.remove(&entry.task.id);
        }
        Some(entry)
    }

    pub fn execution_ids(&self) -> Vec<ExecutionId> {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort();
        ids
    }

    /// 清空注册表（排空超时的强制出口）
    pub fn drain_all(&mut self) -> Vec<(ExecutionId, ActiveTaskEntry)> {
        self.by_task.clear();
        let mut drained: Vec<_> = self.entries.drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Task {
        Task::new(id, "run_simulation", serde_json::json!({}))
    }

    #[test]
    fn test_admit_until_capacity() {
        let root = CancellationToken::new();
        let mut registry = ActiveTaskRegistry::new(2);
        assert!(registry.admit(task("a"), &root).is_ok());
        assert!(registry.admit(task("b"), &root).is_ok());
        let err = registry.admit(task("c"), &root).unwrap_err();
        assert_eq!(err, AgentError::CapacityExceeded { active: 2, max: 2 });
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_live_task_rejected() {
        let root = CancellationToken::new();
        let mut registry = ActiveTaskRegistry::new(4);
        registry.admit(task("a"), &root).unwrap();
        let err = registry.admit(task("a"), &root).unwrap_err();
        assert_eq!(err, AgentError::TaskAlreadyActive("a".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_execution_ids_never_reused() {
        let root = CancellationToken::new();
        let mut registry = ActiveTaskRegistry::new(1);
        let first = registry.admit(task("a"), &root).unwrap().execution_id;
        assert!(registry.remove(first).is_some());
        let second = registry.admit(task("a"), &root).unwrap().execution_id;
        assert_ne!(first, second);
        assert!(second > first);
    }

    #[test]
    fn test_remove_is_exactly_once() {
        let root = CancellationToken::new();
        let mut registry = ActiveTaskRegistry::new(1);
        let id = registry.admit(task("a"), &root).unwrap().execution_id;
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.find_by_task_id("a").is_none());
    }

    #[test]
    fn test_parent_cancellation_reaches_entries() {
        let root = CancellationToken::new();
        let mut registry = ActiveTaskRegistry::new(2);
        let admission = registry.admit(task("a"), &root).unwrap();
        root.cancel();
        assert!(admission.cancel_token.is_cancelled());
        assert!(registry.get(admission.execution_id).unwrap().cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_settle_delivers_outcome_and_wakes_waiters() {
        let root = CancellationToken::new();
        let mut registry = ActiveTaskRegistry::new(1);
        let admission = registry.admit(task("a"), &root).unwrap();
        let entry = registry.remove(admission.execution_id).unwrap();
        let settled = entry.settled_token();

        entry.settle(Err(AgentError::Cancelled));

        assert!(settled.is_cancelled());
        assert_eq!(admission.outcome_rx.await.unwrap().unwrap_err(), AgentError::Cancelled);
    }

    #[tokio::test]
    async fn test_announced_gate_opens_with_admission_token() {
        let root = CancellationToken::new();
        let mut registry = ActiveTaskRegistry::new(1);
        let admission = registry.admit(task("a"), &root).unwrap();
        let entry = registry.remove(admission.execution_id).unwrap();

        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), entry.announced()).await;
        assert!(pending.is_err());

        admission.announced.cancel();
        entry.announced().await;
    }

    #[test]
    fn test_drain_all_empties_registry() {
        let root = CancellationToken::new();
        let mut registry = ActiveTaskRegistry::new(3);
        registry.admit(task("a"), &root).unwrap();
        registry.admit(task("b"), &root).unwrap();
        let drained = registry.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.find_by_task_id("a").is_none());
    }
}
