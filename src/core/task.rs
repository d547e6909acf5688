//! 任务描述：Task（调用方提交的不可变工作单元）与 ExecutionId（单次执行的标识）
//!
//! task id 由调用方分配；execution id 由 AgentCore 在准入时生成，同一 Agent 生命周期内永不复用。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务类型（如 "run_simulation"），由后端声明是否支持
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// 一个工作单元；提交后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// 调用方分配的唯一 ID
    pub id: String,
    pub task_type: TaskType,
    /// 不透明的结构化负载，原样交给后端
    pub payload: serde_json::Value,
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, task_type: impl Into<TaskType>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            payload,
            submitted_at: Utc::now(),
        }
    }

    /// 自动生成 ID（`task_<uuid>`）
    pub fn with_generated_id(task_type: impl Into<TaskType>, payload: serde_json::Value) -> Self {
        Self::new(format!("task_{}", uuid::Uuid::new_v4()), task_type, payload)
    }
}

/// 单次执行 ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(u64);

impl ExecutionId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec-{}", self.0)
    }
}

/// 后端成功返回后交给提交者的结果
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutput {
    pub task_id: String,
    pub execution_id: ExecutionId,
    pub value: serde_json::Value,
    pub elapsed_ms: u64,
}
