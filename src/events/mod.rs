//! 生命周期 / 遥测事件与事件出口（EventSink）
//!
//! 事件由 AgentCore 发出，发布失败只记日志，不影响任务本身（尽力而为的遥测）。
//! 单个执行的事件顺序：task_started → 恰好一个终态事件（task_completed / task_failed / task_cancelled）。

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::{ExecutionId, LifecycleState};

/// 事件发布失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,
    #[error("publish failed: {0}")]
    Failed(String),
}

/// 事件级别（决定 TracingSink 的日志级别）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
}

/// Agent 事件（可序列化为 JSON，`event` 字段为事件名）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStarting {
        agent_id: String,
    },
    AgentStarted {
        agent_id: String,
    },
    AgentStopping {
        agent_id: String,
        active: usize,
    },
    AgentStopped {
        agent_id: String,
        drained: usize,
        abandoned: usize,
    },
    AgentFailed {
        agent_id: String,
        from: LifecycleState,
        reason: String,
    },
    /// 排空超时：列出被强制放弃的执行
    DrainTimeout {
        agent_id: String,
        timeout_ms: u64,
        abandoned: Vec<ExecutionId>,
    },
    TaskStarted {
        agent_id: String,
        task_id: String,
        execution_id: ExecutionId,
        task_type: String,
    },
    TaskCompleted {
        agent_id: String,
        task_id: String,
        execution_id: ExecutionId,
        elapsed_ms: u64,
        /// 结果元数据（顶层字段名），不含结果本身
        result_keys: Vec<String>,
    },
    TaskFailed {
        agent_id: String,
        task_id: String,
        execution_id: ExecutionId,
        elapsed_ms: u64,
        error: String,
    },
    TaskCancelled {
        agent_id: String,
        task_id: String,
        execution_id: ExecutionId,
        elapsed_ms: u64,
        /// 排空超时被强制清除
        abandoned: bool,
    },
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentStarting { .. } => "agent_starting",
            Self::AgentStarted { .. } => "agent_started",
            Self::AgentStopping { .. } => "agent_stopping",
            Self::AgentStopped { .. } => "agent_stopped",
            Self::AgentFailed { .. } => "agent_failed",
            Self::DrainTimeout { .. } => "drain_timeout",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskCancelled { .. } => "task_cancelled",
        }
    }

    pub fn level(&self) -> EventLevel {
        match self {
            Self::DrainTimeout { .. } | Self::AgentFailed { .. } => EventLevel::Warn,
            Self::TaskCancelled { abandoned: true, .. } => EventLevel::Warn,
            _ => EventLevel::Info,
        }
    }

    /// 单个执行的事件返回其 execution id
    pub fn execution_id(&self) -> Option<ExecutionId> {
        match self {
            Self::TaskStarted { execution_id, .. }
            | Self::TaskCompleted { execution_id, .. }
            | Self::TaskFailed { execution_id, .. }
            | Self::TaskCancelled { execution_id, .. } => Some(*execution_id),
            _ => None,
        }
    }

    pub fn is_task_terminal(&self) -> bool {
        matches!(
            self,
            Self::TaskCompleted { .. } | Self::TaskFailed { .. } | Self::TaskCancelled { .. }
        )
    }

    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// 事件出口；可被多个在途任务并发调用
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &AgentEvent) -> Result<(), SinkError>;
}

/// 以结构化 tracing 记录输出事件
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: &AgentEvent) -> Result<(), SinkError> {
        let payload = event.payload().to_string();
        match event.level() {
            EventLevel::Info => tracing::info!(event = event.name(), payload = %payload, "agent event"),
            EventLevel::Warn => tracing::warn!(event = event.name(), payload = %payload, "agent event"),
        }
        Ok(())
    }
}

/// 通过无界 mpsc 把事件交给订阅方（监控 / 测试）
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: &AgentEvent) -> Result<(), SinkError> {
        self.tx.send(event.clone()).map_err(|_| SinkError::Closed)
    }
}

/// 广播到多个出口；任一出口失败不影响其余出口
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: &AgentEvent) -> Result<(), SinkError> {
        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event) {
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SinkError::Failed(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> AgentEvent {
        AgentEvent::TaskStarted {
            agent_id: "agent_1".into(),
            task_id: "t1".into(),
            execution_id: ExecutionId::from_raw(0),
            task_type: "run_simulation".into(),
        }
    }

    #[test]
    fn test_event_payload_carries_name() {
        let payload = started().payload();
        assert_eq!(payload["event"], "task_started");
        assert_eq!(payload["task_id"], "t1");
    }

    #[test]
    fn test_drain_timeout_is_warning() {
        let event = AgentEvent::DrainTimeout {
            agent_id: "a".into(),
            timeout_ms: 10,
            abandoned: vec![],
        };
        assert_eq!(event.level(), EventLevel::Warn);
        assert_eq!(started().level(), EventLevel::Info);
    }

    #[test]
    fn test_channel_sink_reports_closed() {
        let (sink, rx) = ChannelSink::new();
        assert!(sink.publish(&started()).is_ok());
        drop(rx);
        assert_eq!(sink.publish(&started()), Err(SinkError::Closed));
    }

    #[test]
    fn test_fanout_continues_past_failed_sink() {
        let (closed, rx) = ChannelSink::new();
        drop(rx);
        let (open, mut open_rx) = ChannelSink::new();
        let fanout = FanoutSink::new().with(closed).with(open);

        assert!(fanout.publish(&started()).is_err());
        assert_eq!(open_rx.try_recv().unwrap().name(), "task_started");
    }
}
