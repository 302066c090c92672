//! 服务端：处理对端发来的请求
//!
//! 每个入站请求在独立任务里交给 [`RequestHandler`]，通过 [`Responder`] 回写零到多个分块与恰好一个最终响应。
//! Responder 被丢弃而未调用 finish 时自动回一个失败的最终响应，对端不必等到超时。

use std::sync::Weak;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::bus::Inner;
use crate::protocol::{CallId, Envelope, Request, Response};

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request, responder: Responder);
}

pub struct Responder {
    id: CallId,
    outbound: mpsc::UnboundedSender<Envelope>,
    cancelled: CancellationToken,
    bus: Weak<Inner>,
    finished: bool,
}

impl Responder {
    pub(crate) fn new(
        id: CallId,
        outbound: mpsc::UnboundedSender<Envelope>,
        cancelled: CancellationToken,
        bus: Weak<Inner>,
    ) -> Self {
        Self {
            id,
            outbound,
            cancelled,
            bus,
            finished: false,
        }
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    /// 对端取消或链路关闭时触发
    pub fn cancellation(&self) -> CancellationToken {
        self.cancelled.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// 发送中间块；链路已关闭时返回 false
    pub fn chunk(&self, payload: Value) -> bool {
        self.outbound
            .send(Envelope::Response(Response::chunk(self.id.clone(), payload)))
            .is_ok()
    }

    /// 发送最终响应
    pub fn finish(mut self, result: Result<Value, String>) {
        let response = match result {
            Ok(payload) => Response::ok(self.id.clone(), payload),
            Err(error) => Response::failure(self.id.clone(), error),
        };
        let _ = self.outbound.send(Envelope::Response(response));
        self.finished = true;
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(call_id = %self.id, "Responder dropped without final response");
            let _ = self.outbound.send(Envelope::Response(Response::failure(
                self.id.clone(),
                "request abandoned by handler",
            )));
        }
        if let Some(inner) = self.bus.upgrade() {
            inner.forget_serving(&self.id);
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}
