//! 监管进程里的 Gateway：编辑器 ↔ 后端的中继
//!
//! 编辑器发来的请求转交 Supervisor（由它选择当前会话的关联总线），分块与最终结果原样回流；
//! 编辑器取消时同步取消后端调用。探活由监管进程自己回答，不经过后端。

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::correlation::{Call, CallEvent, Correlator, RequestHandler, Responder};
use crate::protocol::{Request, RequestKind};
use crate::supervisor::Supervisor;

pub struct RelayHandler {
    supervisor: Supervisor,
}

impl RelayHandler {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl RequestHandler for RelayHandler {
    async fn handle(&self, request: Request, responder: Responder) {
        if request.kind == RequestKind::LivenessProbe {
            let snapshot = self.supervisor.snapshot();
            responder.finish(Ok(serde_json::json!({
                "status": "ok",
                "backend": snapshot,
            })));
            return;
        }

        let mut call = Call::new(request.kind, request.payload);
        if let Some(context) = request.context {
            call = call.with_context(context);
        }
        let cancelled = responder.cancellation();

        let mut handle = tokio::select! {
            handle = self.supervisor.call(call) => handle,
            _ = cancelled.cancelled() => return,
        };
        tracing::debug!(editor_call = %request.id, backend_call = %handle.id(), "Relaying request");

        loop {
            tokio::select! {
                event = handle.next() => match event {
                    Some(CallEvent::Chunk(payload)) => {
                        responder.chunk(payload);
                    }
                    Some(CallEvent::Final(result)) => {
                        responder.finish(result.map_err(|e| e.to_string()));
                        return;
                    }
                    None => return,
                },
                _ = cancelled.cancelled() => {
                    handle.cancel();
                    return;
                }
            }
        }
    }
}

/// 把监管事件作为通知推给编辑器，直到任一端关闭
pub fn forward_events(supervisor: &Supervisor, editor: Correlator) -> JoinHandle<()> {
    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let notification = event.to_notification();
                    if !editor.notify(notification.topic, notification.payload) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Editor lagged behind supervisor events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
