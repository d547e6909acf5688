//! 核心层：任务模型、生命周期状态机、准入与活跃任务注册表、健康聚合、优雅关闭

pub mod agent;
pub mod builder;
pub mod error;
pub mod health;
pub mod registry;
pub mod shutdown;
pub mod state;
pub mod task;

pub use agent::{AgentConfig, AgentCore, DrainReport};
pub use builder::AgentBuilder;
pub use error::{AgentError, AgentResult};
pub use health::{
    HealthMetrics, HealthPolicy, HealthReport, MemoryUsage, ResourceProbe, StaticResourceProbe,
    SystemResourceProbe,
};
pub use shutdown::{ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use state::LifecycleState;
pub use task::{ExecutionId, Task, TaskOutput, TaskType};
