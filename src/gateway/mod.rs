//! Gateway：把编辑器的同步调用点接到关联层
//!
//! ## 编辑器侧（session）
//! - 单次编辑器动作 → 异步关联请求，submit 立即返回
//! - 分块、最终结果、后端状态推送经 Renderer 回到编辑器
//! - 上下文快照由 ContextProvider 在提交时采集
//!
//! ## 监管侧（relay）
//! - 把编辑器请求转交 Supervisor 当前会话，结果原样回流
//! - 生命周期事件转为通知推给编辑器

mod relay;
mod render;
mod session;

use async_trait::async_trait;

use crate::correlation::{Call, CallHandle, Correlator};
use crate::supervisor::Supervisor;

pub use relay::{forward_events, RelayHandler};
pub use render::{ActionId, ChannelRenderer, ContextProvider, RenderUpdate, Renderer, StaticContext};
pub use session::GatewaySession;

/// 调用的去处：直接一条关联总线，或经由 Supervisor 的当前会话
#[async_trait]
pub trait CallDispatcher: Send + Sync {
    async fn dispatch(&self, call: Call) -> CallHandle;
}

#[async_trait]
impl CallDispatcher for Correlator {
    async fn dispatch(&self, call: Call) -> CallHandle {
        self.send(call)
    }
}

#[async_trait]
impl CallDispatcher for Supervisor {
    async fn dispatch(&self, call: Call) -> CallHandle {
        self.call(call).await
    }
}
