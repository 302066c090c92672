//! 错误分类：传输 / 超时 / 协议 / 后端 / 重启耗尽
//!
//! CallError 面向单次调用（解析为失败响应交给调用方），BackendFault 驱动监管状态机，
//! SupervisorError 用于启动进程等控制面操作。

use std::time::Duration;

use thiserror::Error;

use crate::protocol::CallId;

/// 故障大类，供 Gateway 决定如何展示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 通道关闭 / 不可达
    Transport,
    /// 截止时间内无最终响应
    Timeout,
    /// 报文格式错误、未知 ID
    Protocol,
    /// 后端进程退出、探活失败
    Backend,
    /// 自动重启次数耗尽，需要人工介入
    RestartExhausted,
    /// 调用方主动取消
    Cancelled,
}

/// 单次调用的失败原因（一次失败可能扇出给多个挂起调用，因此必须可 Clone）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Call {id} timed out after {}ms", .after.as_millis())]
    Timeout { id: CallId, after: Duration },

    #[error("Call cancelled")]
    Cancelled,

    /// 调用所属的后端会话已结束（重启或关闭），不会被转绑到新会话
    #[error("Backend session {0} ended")]
    SessionEnded(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 后端返回 success = false
    #[error("Backend error: {0}")]
    Remote(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend restart attempts exhausted: {0}")]
    RestartExhausted(String),
}

impl CallError {
    pub fn class(&self) -> FailureClass {
        match self {
            CallError::Transport(_) | CallError::SessionEnded(_) => FailureClass::Transport,
            CallError::Timeout { .. } => FailureClass::Timeout,
            CallError::Cancelled => FailureClass::Cancelled,
            CallError::Protocol(_) => FailureClass::Protocol,
            CallError::Remote(_) | CallError::BackendUnavailable(_) => FailureClass::Backend,
            CallError::RestartExhausted(_) => FailureClass::RestartExhausted,
        }
    }

    /// 面向编辑器用户的提示文案
    pub fn user_message(&self) -> String {
        match self {
            CallError::Transport(msg) => format!("Connection to the assistant backend failed: {msg}"),
            CallError::Timeout { after, .. } => {
                format!("The assistant did not answer within {}s", after.as_secs().max(1))
            }
            CallError::Cancelled => "Request cancelled".to_string(),
            CallError::SessionEnded(_) => "The assistant backend restarted; please retry".to_string(),
            CallError::Protocol(msg) => format!("Malformed message: {msg}"),
            CallError::Remote(msg) => format!("Assistant error: {msg}"),
            CallError::BackendUnavailable(msg) => format!("Assistant backend unavailable: {msg}"),
            CallError::RestartExhausted(msg) => {
                format!("Assistant backend keeps failing and needs attention: {msg}")
            }
        }
    }

    /// 重试同一请求是否有意义
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            CallError::Cancelled | CallError::Protocol(_) | CallError::RestartExhausted(_)
        )
    }
}

/// 驱动监管状态机进入 Error 的后端故障
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendFault {
    /// 启动命令本身失败（找不到程序、端口连不上等）
    #[error("launch failed: {0}")]
    LaunchFailed(String),
    /// 就绪前进程退出
    #[error("backend exited before ready (code {})", fmt_code(.code))]
    ExitedBeforeReady { code: Option<i32> },
    /// 宽限期内没有一次探活成功
    #[error("backend not ready within {}ms", .grace.as_millis())]
    ReadinessTimeout { grace: Duration },
    /// 运行中连续探活失败达到阈值
    #[error("{failures} consecutive health probes failed")]
    ProbeExhausted { failures: u32 },
    /// 运行中进程意外退出
    #[error("backend exited unexpectedly (code {})", fmt_code(.code))]
    Exited { code: Option<i32> },
    /// 链路断开（进程可能仍在）
    #[error("lost connection to backend: {0}")]
    LinkLost(String),
}

fn fmt_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
}

/// 监管控制面的错误
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to launch backend: {0}")]
    Launch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Supervisor stopped")]
    Stopped,
}
