//! 状态定义：后端生命周期状态机与对外投影
//!
//! 内部状态由 Supervisor 的控制循环独占维护，每次变化投影为 LifecycleSnapshot 推给 Gateway。

use serde::Serialize;

/// 后端生命周期
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl LifecycleState {
    /// 合法迁移。Stopping → Starting 只用于人工重启
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (NotStarted, Stopping)
                | (Starting, Running)
                | (Starting, Error)
                | (Starting, Stopping)
                | (Running, Error)
                | (Running, Stopping)
                | (Error, Starting)
                | (Error, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Starting)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::NotStarted => "not_started",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Error => "error",
        }
    }

    /// 是否还会有新的会话
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Stopped)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway 看到的「投影」状态
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LifecycleSnapshot {
    pub state: LifecycleState,
    /// 当前后端会话 ID
    pub session: Option<String>,
    /// 已消耗的自动重启次数
    pub restart_attempt: u32,
    pub max_attempts: u32,
    pub consecutive_failures: u32,
    pub last_probe_ok: Option<bool>,
    pub last_probe_latency_ms: Option<u64>,
    /// 最近一次探活成功（毫秒时间戳）
    pub last_success_at: Option<i64>,
    pub diagnostic: Option<String>,
    /// 重启预算耗尽，等待人工介入
    pub exhausted: bool,
}

impl LifecycleSnapshot {
    pub fn initial(max_attempts: u32) -> Self {
        Self {
            state: LifecycleState::NotStarted,
            session: None,
            restart_attempt: 0,
            max_attempts,
            consecutive_failures: 0,
            last_probe_ok: None,
            last_probe_latency_ms: None,
            last_success_at: None,
            diagnostic: None,
            exhausted: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == LifecycleState::Running
    }
}
