//! 健康聚合
//!
//! 每次查询实时计算，不持久化。优先级：后端不健康 / 内存压力 → healthy=false，并覆盖「满载」提示；
//! 两者都不存在时 healthy=true，满载只作为降级说明写入 reason。

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::BackendHealth;
use crate::core::state::LifecycleState;

/// 系统内存使用
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryUsage {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

/// 进程 / 系统资源探针
pub trait ResourceProbe: Send + Sync {
    /// 无法获取时返回 None（不视为不健康）
    fn memory_usage(&self) -> Option<MemoryUsage>;
}

/// 读取 /proc/meminfo（非 Linux 返回 None）
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResourceProbe;

impl ResourceProbe for SystemResourceProbe {
    fn memory_usage(&self) -> Option<MemoryUsage> {
        let content = std::fs::read_to_string(Path::new("/proc/meminfo")).ok()?;
        parse_meminfo(&content)
    }
}

/// 固定读数（测试或无探针环境）
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticResourceProbe(pub Option<MemoryUsage>);

impl ResourceProbe for StaticResourceProbe {
    fn memory_usage(&self) -> Option<MemoryUsage> {
        self.0
    }
}

fn parse_meminfo(content: &str) -> Option<MemoryUsage> {
    let field = |name: &str| -> Option<u64> {
        content
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    Some(MemoryUsage {
        used_bytes: total.saturating_sub(available),
        total_bytes: total,
    })
}

/// 健康判定阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthPolicy {
    /// 内存使用率达到该值即判定不健康
    pub memory_unhealthy_percent: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            memory_unhealthy_percent: 90.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthMetrics {
    pub active_count: usize,
    pub max_concurrent: usize,
    pub utilization: f64,
    pub backend_status: String,
    pub memory_percent: Option<f64>,
    pub lifecycle_state: LifecycleState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: HealthMetrics,
}

/// 聚合输入（由 AgentCore 在一次查询内采集）
#[derive(Debug, Clone)]
pub struct HealthInputs {
    pub state: LifecycleState,
    pub active_count: usize,
    pub max_concurrent: usize,
    pub backend: BackendHealth,
    pub memory: Option<MemoryUsage>,
}

impl HealthReport {
    pub fn aggregate(inputs: HealthInputs, policy: &HealthPolicy) -> Self {
        let utilization = if inputs.max_concurrent == 0 {
            0.0
        } else {
            inputs.active_count as f64 / inputs.max_concurrent as f64
        };
        let memory_percent = inputs.memory.map(|m| m.percent());

        let mut problems = Vec::new();
        if !inputs.backend.healthy {
            let detail = inputs
                .backend
                .reason
                .clone()
                .unwrap_or_else(|| inputs.backend.status.clone());
            problems.push(format!("backend unhealthy: {detail}"));
        }
        if let Some(pct) = memory_percent {
            if pct >= policy.memory_unhealthy_percent {
                problems.push(format!(
                    "memory pressure: {pct:.1}% >= {:.1}%",
                    policy.memory_unhealthy_percent
                ));
            }
        }

        let (healthy, reason) = if !problems.is_empty() {
            (false, problems.join("; "))
        } else if inputs.active_count >= inputs.max_concurrent {
            (
                true,
                format!("degraded: at capacity ({}/{})", inputs.active_count, inputs.max_concurrent),
            )
        } else if inputs.state != LifecycleState::Running {
            (true, format!("agent {}", inputs.state))
        } else {
            (true, "ok".to_string())
        };

        Self {
            healthy,
            reason,
            timestamp: Utc::now(),
            metrics: HealthMetrics {
                active_count: inputs.active_count,
                max_concurrent: inputs.max_concurrent,
                utilization,
                backend_status: inputs.backend.status,
                memory_percent,
                lifecycle_state: inputs.state,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(active: usize, backend: BackendHealth, memory_pct: Option<u64>) -> HealthInputs {
        HealthInputs {
            state: LifecycleState::Running,
            active_count: active,
            max_concurrent: 2,
            backend,
            memory: memory_pct.map(|p| MemoryUsage {
                used_bytes: p,
                total_bytes: 100,
            }),
        }
    }

    #[test]
    fn test_healthy_when_idle() {
        let report = HealthReport::aggregate(inputs(0, BackendHealth::healthy(), Some(40)), &HealthPolicy::default());
        assert!(report.healthy);
        assert_eq!(report.reason, "ok");
        assert_eq!(report.metrics.utilization, 0.0);
    }

    #[test]
    fn test_at_capacity_is_degraded_not_unhealthy() {
        let report = HealthReport::aggregate(inputs(2, BackendHealth::healthy(), None), &HealthPolicy::default());
        assert!(report.healthy);
        assert!(report.reason.contains("at capacity"));
        assert_eq!(report.metrics.utilization, 1.0);
    }

    #[test]
    fn test_backend_unhealthy_overrides_capacity_note() {
        let report = HealthReport::aggregate(
            inputs(2, BackendHealth::unhealthy("solver offline"), None),
            &HealthPolicy::default(),
        );
        assert!(!report.healthy);
        assert!(report.reason.contains("solver offline"));
        assert!(!report.reason.contains("capacity"));
    }

    #[test]
    fn test_memory_pressure_forces_unhealthy() {
        let report = HealthReport::aggregate(inputs(0, BackendHealth::healthy(), Some(95)), &HealthPolicy::default());
        assert!(!report.healthy);
        assert!(report.reason.contains("memory pressure"));
    }

    #[test]
    fn test_both_problems_reported() {
        let report = HealthReport::aggregate(
            inputs(1, BackendHealth::unhealthy("down"), Some(99)),
            &HealthPolicy::default(),
        );
        assert!(!report.healthy);
        assert!(report.reason.contains("backend unhealthy"));
        assert!(report.reason.contains("memory pressure"));
    }

    #[test]
    fn test_parse_meminfo() {
        let sample = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
        let usage = parse_meminfo(sample).unwrap();
        assert_eq!(usage.total_bytes, 16_000_000 * 1024);
        assert!((usage.percent() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_meminfo_missing_fields() {
        assert!(parse_meminfo("MemTotal: 100 kB\n").is_none());
    }
}
