//! yur-agent 演示入口
//!
//! 加载配置、启动一个模拟 Agent，并发提交一批计算任务并打印健康报告；
//! 主流程结束或收到 Ctrl+C / SIGTERM 后经关闭协调器排空所有 Agent。
//!
//! 用法：`yur-agent [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::future::join_all;
use serde_json::json;
use yur_agent::config::load_config;
use yur_agent::core::shutdown::{run_with_graceful_shutdown, CleanupOutcome, ShutdownCoordinator, ShutdownManager};
use yur_agent::core::{AgentBuilder, Task};
use yur_agent::observability;
use yur_agent::supervisor::AgentRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let app = load_config(config_path).context("Failed to load configuration")?;
    tracing::info!(
        name = %app.agent.name,
        max_concurrent = app.agent.max_concurrent_tasks,
        "configuration loaded"
    );

    // from_app_config 已带上 [health] 策略
    let registry = Arc::new(AgentRegistry::new());
    let agent = AgentBuilder::from_app_config(&app)
        .build()
        .context("Failed to build agent")?;
    let handle = registry
        .register(app.agent.name.clone(), agent)
        .await
        .context("Failed to register agent")?;
    handle.agent.start().await.context("Agent failed to start")?;

    let manager = Arc::new(ShutdownManager::new());
    manager.watch_agent(&handle.agent);
    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&manager))
        .with_timeout(Duration::from_secs(app.agent.drain_timeout_secs + 5));
    coordinator.register_shared(registry.clone());

    let demo_registry = Arc::clone(&registry);
    let agent_id = handle.id().to_string();
    let outcomes = run_with_graceful_shutdown(&coordinator, async move {
        run_demo(&demo_registry, &agent_id).await;
    })
    .await;

    for (name, outcome) in outcomes {
        if outcome != CleanupOutcome::Completed {
            tracing::warn!(task = %name, ?outcome, "cleanup did not complete cleanly");
        }
    }
    for summary in registry.list().await {
        println!("{}", serde_json::to_string(&summary)?);
    }
    Ok(())
}

async fn run_demo(registry: &AgentRegistry, agent_id: &str) {
    let tasks = vec![
        Task::with_generated_id("run_simulation", json!({ "simulation_type": "DESI", "n_dimensions": 64 })),
        Task::with_generated_id("run_simulation", json!({ "simulation_type": "Tree", "n_dimensions": 32 })),
        Task::with_generated_id("run_simulation", json!({ "simulation_type": "Bell", "n_dimensions": 16 })),
        Task::with_generated_id("compute_eigenvalues", json!({ "operator_type": "momentum", "n_dimensions": 8 })),
        Task::with_generated_id("run_simulation", json!({ "simulation_type": "AI", "n_dimensions": 16 })),
        Task::with_generated_id("operator_visualization", json!({ "operator_type": "position", "n_dimensions": 128 })),
        Task::with_generated_id("run_simulation", json!({ "simulation_type": "Quantum" })),
    ];

    let results = join_all(tasks.into_iter().map(|task| async move {
        let task_id = task.id.clone();
        (task_id, registry.assign_task(agent_id, task).await)
    }))
    .await;

    for (task_id, result) in results {
        match result {
            Ok(output) => {
                let count = output.value["eigenvalues"].as_array().map_or(0, Vec::len);
                println!("{task_id}: ok ({count} eigenvalues, {} ms)", output.elapsed_ms);
            }
            Err(e) => println!("{task_id}: {e}"),
        }
    }

    match registry.health(agent_id).await {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(e) => tracing::warn!(error = %e, "failed to render health report"),
        },
        Err(e) => tracing::warn!(error = %e, "health check failed"),
    }
}
