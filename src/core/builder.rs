//! Agent 构建器：组装 AgentCore 的各个协作者
//!
//! 后端必须显式注入；事件出口默认 TracingSink，资源探针默认 SystemResourceProbe。

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendRouter, ComputationBackend, SimulationBackend};
use crate::config::AppConfig;
use crate::core::agent::{AgentConfig, AgentCore};
use crate::core::error::{AgentError, AgentResult};
use crate::core::health::{HealthPolicy, ResourceProbe, SystemResourceProbe};
use crate::events::{EventSink, TracingSink};

/// AgentCore 构建器
pub struct AgentBuilder {
    config: AgentConfig,
    id: Option<String>,
    backend: Option<Arc<dyn ComputationBackend>>,
    sink: Option<Arc<dyn EventSink>>,
    probe: Option<Arc<dyn ResourceProbe>>,
    health_policy: HealthPolicy,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            id: None,
            backend: None,
            sink: None,
            probe: None,
            health_policy: HealthPolicy::default(),
        }
    }

    /// 从应用配置创建：[agent] 段决定 AgentConfig，[health] 段决定阈值，后端为模拟后端
    pub fn from_app_config(app: &AppConfig) -> Self {
        let agent = &app.agent;
        let config = AgentConfig::new(agent.agent_type.clone(), agent.max_concurrent_tasks)
            .with_permissions(agent.permissions.iter().cloned())
            .with_drain_timeout(Duration::from_secs(agent.drain_timeout_secs));
        let router = BackendRouter::new().with_backend(SimulationBackend::from_config(&app.simulation));

        Self::new(config)
            .with_backend(router)
            .with_health_policy(HealthPolicy {
                memory_unhealthy_percent: app.health.memory_unhealthy_percent,
            })
    }

    /// 指定 Agent ID（默认 `agent_<uuid>`）
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_backend(self, backend: impl ComputationBackend + 'static) -> Self {
        self.with_shared_backend(Arc::new(backend))
    }

    pub fn with_shared_backend(mut self, backend: Arc<dyn ComputationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_sink(self, sink: impl EventSink + 'static) -> Self {
        self.with_shared_sink(Arc::new(sink))
    }

    pub fn with_shared_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_probe(self, probe: impl ResourceProbe + 'static) -> Self {
        self.with_shared_probe(Arc::new(probe))
    }

    pub fn with_shared_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_health_policy(mut self, policy: HealthPolicy) -> Self {
        self.health_policy = policy;
        self
    }

    pub fn build(self) -> AgentResult<AgentCore> {
        let backend = self
            .backend
            .ok_or_else(|| AgentError::InvalidConfig("no computation backend configured".to_string()))?;
        let id = self
            .id
            .unwrap_or_else(|| format!("agent_{}", uuid::Uuid::new_v4()));
        AgentCore::new(
            id,
            self.config,
            backend,
            self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
            self.probe.unwrap_or_else(|| Arc::new(SystemResourceProbe)),
            self.health_policy,
        )
    }
}
