//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `YUR__*` 覆盖（双下划线表示嵌套，如 `YUR__AGENT__MAX_CONCURRENT_TASKS=8`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub health: HealthSection,
    pub simulation: SimulationSection,
}

/// [agent] 段：身份、并发上限、权限与排空超时
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// 可读名称（仅用于日志）
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_permissions")]
    pub permissions: Vec<String>,
    /// stop() 等待在途任务的最长时间（秒）
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_agent_name() -> String {
    "yur-agent".to_string()
}

fn default_agent_type() -> String {
    "simulation".to_string()
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_permissions() -> Vec<String> {
    vec!["simulation".into(), "compute".into()]
}

fn default_drain_timeout_secs() -> u64 {
    crate::core::agent::DEFAULT_DRAIN_TIMEOUT_SECS
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            agent_type: default_agent_type(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            permissions: default_permissions(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// [health] 段
#[derive(Debug, Clone, Deserialize)]
pub struct HealthSection {
    /// 内存占用达到该百分比即判定不健康
    #[serde(default = "default_memory_unhealthy_percent")]
    pub memory_unhealthy_percent: f64,
}

fn default_memory_unhealthy_percent() -> f64 {
    90.0
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            memory_unhealthy_percent: default_memory_unhealthy_percent(),
        }
    }
}

/// [simulation] 段：模拟后端的人为延迟与矩阵维度上限
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationSection {
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default = "default_max_dimensions")]
    pub max_dimensions: usize,
}

fn default_max_dimensions() -> usize {
    1024
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            max_dimensions: default_max_dimensions(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 YUR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 YUR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("YUR")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("agent.permissions")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_concurrent_tasks, 4);
        assert_eq!(cfg.agent.drain_timeout_secs, 30);
        assert_eq!(cfg.agent.permissions, vec!["simulation", "compute"]);
        assert_eq!(cfg.health.memory_unhealthy_percent, 90.0);
        assert_eq!(cfg.simulation.max_dimensions, 1024);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[agent]
agent_type = "twin"
max_concurrent_tasks = 2
permissions = ["compute"]

[simulation]
latency_ms = 5
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.agent_type, "twin");
        assert_eq!(cfg.agent.max_concurrent_tasks, 2);
        assert_eq!(cfg.agent.permissions, vec!["compute"]);
        // 未写的键保留默认值
        assert_eq!(cfg.agent.drain_timeout_secs, 30);
        assert_eq!(cfg.simulation.latency_ms, 5);
        assert_eq!(cfg.simulation.max_dimensions, 1024);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let cfg = load_config(Some(PathBuf::from("/nonexistent/yur.toml"))).unwrap();
        assert_eq!(cfg.health.memory_unhealthy_percent, 90.0);
    }
}
