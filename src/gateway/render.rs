//! 编辑器侧协作者接口
//!
//! 编辑器集成提供上下文快照（gather_context）并接收渲染指令（render）；两者都是同步调用，
//! 由 Gateway 在运行时任务里调用，编辑器事件循环不会被挂起调用阻塞。

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::error::FailureClass;
use crate::protocol::ContextBundle;

/// 编辑器动作编号（Gateway 内唯一）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ActionId(pub u64);

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "action-{}", self.0)
    }
}

/// 发给编辑器的渲染指令
#[derive(Debug, Clone, PartialEq)]
pub enum RenderUpdate {
    /// 流式中间块
    Chunk { action: ActionId, payload: Value },
    Completed { action: ActionId, payload: Value },
    Failed {
        action: ActionId,
        class: FailureClass,
        message: String,
        recoverable: bool,
    },
    /// 后端状态变化（重启中、不可用、重试 N/M）
    Status {
        topic: String,
        state: String,
        diagnostic: String,
    },
    /// 其他推送
    Notice { topic: String, payload: Value },
}

impl RenderUpdate {
    /// 是否为某个动作的终止指令
    pub fn is_terminal(&self) -> bool {
        matches!(self, RenderUpdate::Completed { .. } | RenderUpdate::Failed { .. })
    }

    pub fn action(&self) -> Option<ActionId> {
        match self {
            RenderUpdate::Chunk { action, .. }
            | RenderUpdate::Completed { action, .. }
            | RenderUpdate::Failed { action, .. } => Some(*action),
            RenderUpdate::Status { .. } | RenderUpdate::Notice { .. } => None,
        }
    }
}

pub trait ContextProvider: Send + Sync {
    fn gather_context(&self) -> ContextBundle;
}

pub trait Renderer: Send + Sync {
    fn render(&self, update: RenderUpdate);
}

/// 固定快照（没有编辑器状态时用空快照）
#[derive(Debug, Clone, Default)]
pub struct StaticContext(pub ContextBundle);

impl ContextProvider for StaticContext {
    fn gather_context(&self) -> ContextBundle {
        self.0.clone()
    }
}

/// 把渲染指令转发到通道，由编辑器事件循环自行取走
#[derive(Debug, Clone)]
pub struct ChannelRenderer {
    tx: mpsc::UnboundedSender<RenderUpdate>,
}

impl ChannelRenderer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RenderUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Renderer for ChannelRenderer {
    fn render(&self, update: RenderUpdate) {
        if self.tx.send(update).is_err() {
            tracing::debug!("Render channel closed, dropping update");
        }
    }
}
