//! Agent 生命周期状态机
//!
//! Created → Starting → Running → Stopping → Stopped；Starting / Running 可直接进入 Failed。
//! Stopped 与 Failed 为终态，不再迁移；Failed 的 Agent 只能丢弃重建。

use std::fmt;

use serde::Serialize;

/// Agent 生命周期状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl LifecycleState {
    /// 只有 Running 接受新任务
    pub fn accepts_tasks(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Running 与 Stopping 接受取消
    pub fn accepts_cancellation(self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// 迁移表；不在表内的迁移一律拒绝
    pub fn can_transition_to(self, next: Self) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleState::*;
    use super::*;

    const ALL: [LifecycleState; 6] = [Created, Starting, Running, Stopping, Stopped, Failed];

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in [Stopped, Failed] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} should be rejected");
            }
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        assert!(Created.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
    }

    #[test]
    fn test_no_resurrection_or_skips() {
        assert!(!Created.can_transition_to(Running));
        assert!(!Stopping.can_transition_to(Running));
        assert!(!Running.can_transition_to(Stopped));
        assert!(!Stopping.can_transition_to(Failed));
    }

    #[test]
    fn test_admission_predicates() {
        assert!(Running.accepts_tasks());
        assert!(!Stopping.accepts_tasks());
        assert!(Stopping.accepts_cancellation());
        assert!(!Created.accepts_cancellation());
        assert!(!Failed.accepts_cancellation());
    }
}
