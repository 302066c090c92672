//! 编辑器侧 Gateway 会话
//!
//! 显式的会话对象（而非全局状态）：持有调度器、上下文提供者与渲染器，以及在途动作表。
//! submit 同步返回 ActionId，真正的调用在运行时任务里完成，结果经 Renderer 回到编辑器。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::render::{ActionId, ContextProvider, RenderUpdate, Renderer};
use super::CallDispatcher;
use crate::core::error::CallError;
use crate::correlation::{Call, CallEvent};
use crate::protocol::{Notification, RequestKind};
use crate::supervisor::SupervisorEventKind;

struct InFlight {
    kind: RequestKind,
    cancel: CancellationToken,
}

struct Shared {
    dispatcher: Arc<dyn CallDispatcher>,
    context: Arc<dyn ContextProvider>,
    renderer: Arc<dyn Renderer>,
    runtime: Handle,
    next_action: AtomicU64,
    actions: Mutex<HashMap<ActionId, InFlight>>,
}

impl Shared {
    fn actions(&self) -> MutexGuard<'_, HashMap<ActionId, InFlight>> {
        self.actions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct GatewaySession {
    shared: Arc<Shared>,
}

impl GatewaySession {
    /// 必须在 tokio 运行时内创建；之后可以从任意线程调用 submit
    pub fn new(
        dispatcher: Arc<dyn CallDispatcher>,
        context: Arc<dyn ContextProvider>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self::with_runtime(dispatcher, context, renderer, Handle::current())
    }

    pub fn with_runtime(
        dispatcher: Arc<dyn CallDispatcher>,
        context: Arc<dyn ContextProvider>,
        renderer: Arc<dyn Renderer>,
        runtime: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                dispatcher,
                context,
                renderer,
                runtime,
                next_action: AtomicU64::new(0),
                actions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// 提交一个编辑器动作，立即返回
    pub fn submit(&self, kind: RequestKind, payload: Value) -> ActionId {
        let mut call = Call::new(kind, payload);
        if kind.wants_context() {
            call = call.with_context(self.shared.context.gather_context());
        }
        self.submit_call(call)
    }

    pub fn submit_call(&self, call: Call) -> ActionId {
        let shared = &self.shared;
        let action = ActionId(shared.next_action.fetch_add(1, Ordering::Relaxed) + 1);
        let cancel = CancellationToken::new();
        shared.actions().insert(
            action,
            InFlight {
                kind: call.kind,
                cancel: cancel.clone(),
            },
        );
        tracing::debug!(%action, kind = %call.kind, "Editor action submitted");

        let shared = Arc::clone(shared);
        self.shared.runtime.spawn(async move {
            let result = drive(&shared, action, call, cancel).await;
            shared.actions().remove(&action);
            let update = match result {
                Ok(payload) => RenderUpdate::Completed { action, payload },
                Err(err) => RenderUpdate::Failed {
                    action,
                    class: err.class(),
                    message: err.user_message(),
                    recoverable: err.is_recoverable(),
                },
            };
            shared.renderer.render(update);
        });
        action
    }

    /// 取消在途动作（幂等）；编辑器随后收到一条 Failed(Cancelled)
    pub fn cancel(&self, action: ActionId) -> bool {
        match self.shared.actions().get(&action) {
            Some(in_flight) => {
                tracing::debug!(%action, kind = %in_flight.kind, "Editor action cancelled");
                in_flight.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.shared.actions().len()
    }

    /// 把对端推送路由给渲染器；后端生命周期话题转成 Status
    pub fn attach_notifications(&self, mut rx: broadcast::Receiver<Notification>) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        self.shared.runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => shared.renderer.render(route_notification(notification)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Gateway lagged behind notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// 驱动一次调用直到最终结果或被取消
async fn drive(
    shared: &Shared,
    action: ActionId,
    call: Call,
    cancel: CancellationToken,
) -> Result<Value, CallError> {
    let mut handle = tokio::select! {
        handle = shared.dispatcher.dispatch(call) => handle,
        _ = cancel.cancelled() => return Err(CallError::Cancelled),
    };
    loop {
        tokio::select! {
            event = handle.next() => match event {
                Some(CallEvent::Chunk(payload)) => {
                    shared.renderer.render(RenderUpdate::Chunk { action, payload });
                }
                Some(CallEvent::Final(result)) => return result,
                None => {
                    return Err(CallError::Transport("call ended without a result".to_string()))
                }
            },
            _ = cancel.cancelled() => {
                handle.cancel();
                return Err(CallError::Cancelled);
            }
        }
    }
}

fn route_notification(notification: Notification) -> RenderUpdate {
    let lifecycle = [
        SupervisorEventKind::LifecycleStateChanged,
        SupervisorEventKind::HealthDegraded,
        SupervisorEventKind::RestartExhausted,
    ];
    if lifecycle.iter().any(|k| k.as_str() == notification.topic) {
        let field = |name: &str| {
            notification
                .payload
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        return RenderUpdate::Status {
            state: field("state"),
            diagnostic: field("diagnostic"),
            topic: notification.topic,
        };
    }
    RenderUpdate::Notice {
        topic: notification.topic,
        payload: notification.payload,
    }
}
