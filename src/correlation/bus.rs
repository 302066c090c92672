//! 关联总线
//!
//! 一条 [`Link`] 上的双向请求/响应总线：分配 ID、登记挂起调用、把响应匹配回调用方、
//! 清扫超时、在链路关闭时让所有挂起调用立即失败，并可选地服务对端发来的请求。

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::handle::{Call, CallHandle, TimeoutPolicy};
use super::handler::{RequestHandler, Responder};
use super::pending::{Delivery, PendingTable};
use crate::core::error::CallError;
use crate::protocol::envelope::now_millis;
use crate::protocol::{CallId, Envelope, Notification, Request};
use crate::transport::{Link, LinkCloser};

/// 通知广播的缓冲条数
const NOTIFICATION_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct CorrelatorOptions {
    /// ID 前缀；为空时随机生成
    pub tag: Option<String>,
    pub timeouts: TimeoutPolicy,
    pub max_frame_bytes: usize,
    pub max_context_bytes: usize,
}

impl Default for CorrelatorOptions {
    fn default() -> Self {
        Self {
            tag: None,
            timeouts: TimeoutPolicy::default(),
            max_frame_bytes: 8 * 1024 * 1024,
            max_context_bytes: 256 * 1024,
        }
    }
}

impl CorrelatorOptions {
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutPolicy) -> Self {
        self.timeouts = timeouts;
        self
    }
}

pub(crate) struct Inner {
    tag: String,
    label: String,
    seq: AtomicU64,
    table: PendingTable,
    outbound: mpsc::UnboundedSender<Envelope>,
    link: LinkCloser,
    options: CorrelatorOptions,
    closed: CancellationToken,
    close_reason: Mutex<Option<CallError>>,
    wake: Arc<Notify>,
    notifications: broadcast::Sender<Notification>,
    serving: Mutex<HashMap<CallId, CancellationToken>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    pub(crate) fn cancel(&self, id: &CallId) -> bool {
        let removed = self.table.cancel(id);
        if removed {
            tracing::debug!(call_id = %id, "Call cancelled");
            let _ = self.outbound.send(Envelope::Cancel { id: id.clone() });
        }
        removed
    }

    pub(crate) fn forget_serving(&self, id: &CallId) {
        lock(&self.serving).remove(id);
    }

    fn closed_error(&self) -> Option<CallError> {
        if !self.closed.is_cancelled() {
            return None;
        }
        Some(
            lock(&self.close_reason)
                .clone()
                .unwrap_or_else(|| CallError::Transport(format!("link {} closed", self.label))),
        )
    }

    fn shutdown(&self, err: CallError) {
        {
            let mut reason = lock(&self.close_reason);
            if reason.is_none() {
                *reason = Some(err.clone());
            }
        }
        self.closed.cancel();
        // 先让挂起调用失败，再拆链路
        let failed = self.table.fail_all(&err);
        for (_, token) in lock(&self.serving).drain() {
            token.cancel();
        }
        self.link.close();
        if failed > 0 {
            tracing::warn!(tag = %self.tag, failed, "Failed pending calls: {}", err);
        }
    }

    fn dispatch(
        &self,
        envelope: Envelope,
        bus: &Weak<Inner>,
        handler: Option<&Arc<dyn RequestHandler>>,
    ) {
        match envelope {
            Envelope::Response(response) => {
                let id = response.id.clone();
                if self.table.deliver(response) == Delivery::Unknown {
                    tracing::debug!(tag = %self.tag, call_id = %id, "Dropping response for unknown call");
                }
            }
            Envelope::Request(request) => self.serve(request, bus, handler),
            Envelope::Notification(notification) => {
                let _ = self.notifications.send(notification);
            }
            Envelope::Cancel { id } => {
                if let Some(token) = lock(&self.serving).remove(&id) {
                    tracing::debug!(call_id = %id, "Peer cancelled request");
                    token.cancel();
                }
            }
        }
    }

    fn serve(
        &self,
        request: Request,
        bus: &Weak<Inner>,
        handler: Option<&Arc<dyn RequestHandler>>,
    ) {
        let Some(handler) = handler else {
            tracing::warn!(call_id = %request.id, kind = %request.kind, "No handler for inbound request");
            let _ = self.outbound.send(Envelope::Response(crate::protocol::Response::failure(
                request.id,
                "this endpoint does not serve requests",
            )));
            return;
        };

        let token = self.closed.child_token();
        match lock(&self.serving).entry(request.id.clone()) {
            // 回失败响应会误结束对端那一个调用，只能丢弃
            Entry::Occupied(_) => {
                tracing::warn!(call_id = %request.id, kind = %request.kind, "Dropping request that reuses an in-progress ID");
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }
        let responder = Responder::new(request.id.clone(), self.outbound.clone(), token, bus.clone());
        let handler = Arc::clone(handler);
        tracing::debug!(call_id = %request.id, kind = %request.kind, "Serving inbound request");
        tokio::spawn(async move {
            handler.handle(request, responder).await;
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.closed.cancel();
        self.link.close();
        self.table
            .fail_all(&CallError::Transport("correlator dropped".to_string()));
    }
}

/// 关联总线句柄（可克隆，克隆共享同一挂起表）
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl Correlator {
    /// 只发起请求的一端
    pub fn new(link: Link, options: CorrelatorOptions) -> Self {
        Self::start(link, options, None)
    }

    /// 同时服务对端请求
    pub fn serve(link: Link, options: CorrelatorOptions, handler: Arc<dyn RequestHandler>) -> Self {
        Self::start(link, options, Some(handler))
    }

    fn start(link: Link, options: CorrelatorOptions, handler: Option<Arc<dyn RequestHandler>>) -> Self {
        let label = link.label().to_string();
        let (outbound, inbound, closer) = link.into_parts();
        let tag = options.tag.clone().unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("c{}", &id[..8])
        });
        let closed = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);

        let inner = Arc::new(Inner {
            tag,
            label,
            seq: AtomicU64::new(0),
            table: PendingTable::new(),
            outbound,
            link: closer,
            options,
            closed: closed.clone(),
            close_reason: Mutex::new(None),
            wake: Arc::clone(&wake),
            notifications,
            serving: Mutex::new(HashMap::new()),
        });

        tokio::spawn(read_loop(Arc::downgrade(&inner), inbound, closed.clone(), handler));
        tokio::spawn(sweep_loop(Arc::downgrade(&inner), closed, wake));

        Self { inner }
    }

    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    /// 发送请求，立即返回句柄（不阻塞、不等待链路）
    pub fn send(&self, call: Call) -> CallHandle {
        let inner = &self.inner;
        let seq = inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = CallId::new(format!("{}-{}", inner.tag, seq));
        let kind = call.kind;

        if let Some(err) = inner.closed_error() {
            return CallHandle::failed(id, kind, err);
        }

        let context = call
            .context
            .map(|bundle| bundle.bounded(inner.options.max_context_bytes));
        let envelope = Envelope::Request(Request {
            id: id.clone(),
            kind,
            payload: call.payload,
            context,
            timestamp: now_millis(),
        });

        match serde_json::to_vec(&envelope) {
            Ok(encoded) if encoded.len() > inner.options.max_frame_bytes => {
                return CallHandle::failed(
                    id,
                    kind,
                    CallError::Protocol(format!(
                        "request of {} bytes exceeds frame limit of {} bytes",
                        encoded.len(),
                        inner.options.max_frame_bytes
                    )),
                );
            }
            Err(e) => return CallHandle::failed(id, kind, CallError::Protocol(e.to_string())),
            Ok(_) => {}
        }

        let timeout = call.timeout.unwrap_or_else(|| inner.options.timeouts.for_kind(kind));
        let (tx, rx) = mpsc::unbounded_channel();
        if !inner.table.register(id.clone(), kind, timeout, tx) {
            return CallHandle::failed(id, kind, CallError::Protocol("duplicate call id".to_string()));
        }
        let handle = CallHandle::new(id.clone(), kind, rx, Arc::downgrade(inner));

        // 登记与关闭并发时，由这里补上失败
        if let Some(err) = inner.closed_error() {
            inner.table.fail(&id, err);
            return handle;
        }
        inner.wake.notify_one();

        tracing::debug!(call_id = %id, %kind, timeout_ms = timeout.as_millis() as u64, "Sending request");
        if inner.outbound.send(envelope).is_err() {
            inner
                .table
                .fail(&id, CallError::Transport(format!("link {} closed", inner.label)));
        }
        handle
    }

    /// 取消挂起调用（幂等），同时通知对端放弃处理
    pub fn cancel(&self, id: &CallId) -> bool {
        self.inner.cancel(id)
    }

    /// 单向推送
    pub fn notify(&self, topic: impl Into<String>, payload: serde_json::Value) -> bool {
        !self.inner.closed.is_cancelled()
            && self
                .inner
                .outbound
                .send(Envelope::Notification(Notification::new(topic, payload)))
                .is_ok()
    }

    /// 订阅对端推送
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// 关闭总线与链路，所有挂起调用以 `err` 失败
    pub fn close(&self, err: CallError) {
        self.inner.shutdown(err);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// 关闭时触发的令牌（只读）
    pub fn close_signal(&self) -> CancellationToken {
        self.inner.closed.child_token()
    }

    pub fn close_reason(&self) -> Option<CallError> {
        self.inner.closed_error()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.table.len()
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("tag", &self.inner.tag)
            .field("pending", &self.inner.table.len())
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

async fn read_loop(
    bus: Weak<Inner>,
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
    closed: CancellationToken,
    handler: Option<Arc<dyn RequestHandler>>,
) {
    loop {
        let envelope = tokio::select! {
            _ = closed.cancelled() => return,
            envelope = inbound.recv() => envelope,
        };
        let Some(inner) = bus.upgrade() else {
            return;
        };
        match envelope {
            Some(envelope) => inner.dispatch(envelope, &bus, handler.as_ref()),
            None => {
                tracing::info!(tag = %inner.tag, link = %inner.label, "Link closed by peer");
                inner.shutdown(CallError::Transport(format!("link {} closed", inner.label)));
                return;
            }
        }
    }
}

async fn sweep_loop(bus: Weak<Inner>, closed: CancellationToken, wake: Arc<Notify>) {
    loop {
        let next = match bus.upgrade() {
            Some(inner) => inner.table.next_deadline(),
            None => return,
        };
        tokio::select! {
            _ = closed.cancelled() => return,
            _ = wake.notified() => {}
            _ = sleep_until_deadline(next) => {
                let Some(inner) = bus.upgrade() else {
                    return;
                };
                for (id, kind) in inner.table.expire(Instant::now()) {
                    tracing::warn!(call_id = %id, %kind, "Call timed out");
                    let _ = inner.outbound.send(Envelope::Cancel { id });
                }
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
