//! 优雅关闭处理
//!
//! 进程级关闭信号（Ctrl+C、SIGTERM、Agent 进入 Failed）统一汇聚到 ShutdownManager；
//! ShutdownCoordinator 依次执行注册的清理任务（排空 Agent、flush 日志等），每个任务有独立超时。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::agent::AgentCore;
use crate::core::state::LifecycleState;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 被监视的 Agent 进入 Failed
    AgentFailed { agent_id: String },
    /// 主流程正常结束
    Completed,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(4);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 获取关闭 token
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 触发关闭；只有第一次调用的原因会被广播
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.shutdown_token.is_cancelled() {
            tracing::debug!(?reason, "shutdown already in progress");
            return;
        }
        tracing::info!(?reason, "shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }

    /// Agent 进入 Failed 时触发进程关闭；关闭先发生则监视任务退出
    pub fn watch_agent(self: &Arc<Self>, agent: &AgentCore) {
        let manager = Arc::clone(self);
        let agent_id = agent.id().to_string();
        let mut state_rx = agent.subscribe_state();
        tokio::spawn(async move {
            tokio::select! {
                _ = manager.wait_for_shutdown() => {}
                failed = async { state_rx.wait_for(|s| *s == LifecycleState::Failed).await.is_ok() } => {
                    if failed {
                        tracing::error!(agent = %agent_id, "agent failed, shutting down");
                        manager.shutdown(ShutdownReason::AgentFailed { agent_id });
                    }
                }
            }
        });
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &str;
}

/// 单个清理任务的结果
#[derive(Debug, Clone, PartialEq)]
pub enum CleanupOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

/// 关闭协调器：按注册顺序执行清理任务
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// 单个清理任务的超时；排空 Agent 时应大于 drain_timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    pub fn register_shared(&mut self, task: Arc<dyn ShutdownCleanup>) {
        self.cleanup_tasks.push(task);
    }

    /// 执行所有清理任务，返回 (名称, 结果)
    pub async fn run_cleanup(&self) -> Vec<(String, CleanupOutcome)> {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let mut outcomes = Vec::with_capacity(self.cleanup_tasks.len());
        for task in &self.cleanup_tasks {
            let name = task.name().to_string();
            let outcome = match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!(task = %name, "cleanup completed");
                    CleanupOutcome::Completed
                }
                Ok(Err(e)) => {
                    tracing::warn!(task = %name, error = %e, "cleanup failed");
                    CleanupOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    tracing::warn!(task = %name, timeout_ms = self.timeout.as_millis() as u64, "cleanup timed out");
                    CleanupOutcome::TimedOut
                }
            };
            outcomes.push((name, outcome));
        }

        tracing::info!("All cleanup tasks finished");
        outcomes
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 运行主流程直到其结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F>(
    coordinator: &ShutdownCoordinator,
    app: F,
) -> Vec<(String, CleanupOutcome)>
where
    F: Future<Output = ()>,
{
    let manager = coordinator.manager();
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Application finished normally");
            manager.shutdown(ShutdownReason::Completed);
        }
        _ = manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    coordinator.run_cleanup().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_shutdown_manager_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe();
        manager.shutdown(ShutdownReason::Signal);
        manager.shutdown(ShutdownReason::UserInitiated);
        assert_eq!(rx.recv().await.unwrap(), ShutdownReason::Signal);
        assert!(rx.try_recv().is_err());
    }

    struct FlagCleanup {
        called: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for FlagCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "flag"
        }
    }

    struct StuckCleanup;

    #[async_trait::async_trait]
    impl ShutdownCleanup for StuckCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &str {
            "stuck"
        }
    }

    #[tokio::test]
    async fn test_coordinator_runs_all_tasks_past_timeouts() {
        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()))
            .with_timeout(Duration::from_millis(20));
        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(StuckCleanup);
        coordinator.register(FlagCleanup { called: called.clone() });

        let outcomes = coordinator.run_cleanup().await;
        assert_eq!(outcomes[0], ("stuck".to_string(), CleanupOutcome::TimedOut));
        assert_eq!(outcomes[1], ("flag".to_string(), CleanupOutcome::Completed));
        assert!(called.load(Ordering::SeqCst));
    }
}
