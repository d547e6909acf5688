//! Agent 注册表（监管侧）
//!
//! 显式构造并按引用传递，不使用全局单例。注册表只做簿记与转发：
//! 生命周期、准入、取消都由各自的 AgentCore 负责。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::backend::ComputationBackend;
use crate::core::shutdown::ShutdownCleanup;
use crate::core::{
    AgentBuilder, AgentConfig, AgentCore, AgentError, AgentResult, DrainReport, HealthPolicy,
    HealthReport, LifecycleState, ResourceProbe, Task, TaskOutput,
};
use crate::events::EventSink;

/// 注册表中的一个 Agent
#[derive(Clone)]
pub struct AgentHandle {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub agent: AgentCore,
}

impl AgentHandle {
    pub fn id(&self) -> &str {
        self.agent.id()
    }

    pub fn summary(&self) -> AgentSummary {
        let config = self.agent.config();
        AgentSummary {
            id: self.agent.id().to_string(),
            name: self.name.clone(),
            agent_type: config.agent_type.clone(),
            state: self.agent.current_state(),
            active_tasks: self.agent.active_count(),
            max_concurrent_tasks: config.max_concurrent_tasks,
            capabilities: config.permissions.iter().cloned().collect(),
            created_at: self.created_at,
        }
    }
}

/// list() 返回的只读快照
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub state: LifecycleState,
    pub active_tasks: usize,
    pub max_concurrent_tasks: usize,
    pub capabilities: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Agent 注册表
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentHandle>>,
    probe: Option<Arc<dyn ResourceProbe>>,
    health_policy: HealthPolicy,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新建的 Agent 共用此资源探针（默认各自使用 SystemResourceProbe）
    pub fn with_probe(mut self, probe: impl ResourceProbe + 'static) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    pub fn with_health_policy(mut self, policy: HealthPolicy) -> Self {
        self.health_policy = policy;
        self
    }

    /// 构建并登记一个 Agent（处于 Created，由调用方决定何时 start）
    pub async fn create_agent(
        &self,
        name: impl Into<String>,
        config: AgentConfig,
        backend: Arc<dyn ComputationBackend>,
        sink: Arc<dyn EventSink>,
    ) -> AgentResult<AgentHandle> {
        let mut builder = AgentBuilder::new(config)
            .with_shared_backend(backend)
            .with_shared_sink(sink)
            .with_health_policy(self.health_policy);
        if let Some(probe) = &self.probe {
            builder = builder.with_shared_probe(Arc::clone(probe));
        }
        self.register(name, builder.build()?).await
    }

    /// 登记一个已构建的 Agent
    pub async fn register(&self, name: impl Into<String>, agent: AgentCore) -> AgentResult<AgentHandle> {
        let handle = AgentHandle {
            name: name.into(),
            created_at: Utc::now(),
            agent,
        };
        let mut agents = self.agents.write().await;
        if agents.contains_key(handle.id()) {
            return Err(AgentError::InvalidConfig(format!(
                "agent id already registered: {}",
                handle.id()
            )));
        }
        tracing::info!(agent = %handle.id(), name = %handle.name, "agent registered");
        agents.insert(handle.id().to_string(), handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentHandle> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// 按创建时间排序
    pub async fn list(&self) -> Vec<AgentSummary> {
        let mut summaries: Vec<AgentSummary> = self
            .agents
            .read()
            .await
            .values()
            .map(AgentHandle::summary)
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    /// 经注册表提交任务；未知 agent id 返回 AgentNotFound
    pub async fn assign_task(&self, agent_id: &str, task: Task) -> AgentResult<TaskOutput> {
        let agent = self
            .get(agent_id)
            .await
            .ok_or_else(|| AgentError::AgentNotFound(agent_id.to_string()))?
            .agent;
        agent.submit(task).await
    }

    pub async fn health(&self, agent_id: &str) -> AgentResult<HealthReport> {
        self.get(agent_id)
            .await
            .map(|h| h.agent.health_check())
            .ok_or_else(|| AgentError::AgentNotFound(agent_id.to_string()))
    }

    /// 停止并移除
    pub async fn remove(&self, agent_id: &str) -> AgentResult<DrainReport> {
        let handle = self
            .agents
            .write()
            .await
            .remove(agent_id)
            .ok_or_else(|| AgentError::AgentNotFound(agent_id.to_string()))?;
        let report = handle.agent.stop().await;
        tracing::info!(agent = %agent_id, "agent removed");
        Ok(report)
    }

    /// 并发停止所有 Agent；条目保留，状态为 Stopped（或原本的终态）
    pub async fn shutdown_all(&self) -> Vec<(String, DrainReport)> {
        let agents: Vec<AgentCore> = self
            .agents
            .read()
            .await
            .values()
            .map(|h| h.agent.clone())
            .collect();
        tracing::info!(count = agents.len(), "stopping all agents");
        join_all(agents.into_iter().map(|agent| async move {
            let report = agent.stop().await;
            (agent.id().to_string(), report)
        }))
        .await
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for AgentRegistry {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let reports = self.shutdown_all().await;
        let abandoned: usize = reports.iter().map(|(_, r)| r.abandoned.len()).sum();
        if abandoned > 0 {
            anyhow::bail!("{abandoned} executions abandoned after drain timeout");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "agent-registry"
    }
}
