//! 调用句柄、调用描述与按类型的超时策略

use std::sync::Weak;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use super::bus::Inner;
use crate::core::error::CallError;
use crate::protocol::{CallId, ContextBundle, RequestKind};

/// 续体收到的事件
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Chunk(Value),
    Final(Result<Value, CallError>),
}

/// 待发送的调用
#[derive(Debug, Clone)]
pub struct Call {
    pub kind: RequestKind,
    pub payload: Value,
    pub context: Option<ContextBundle>,
    /// 覆盖按类型的默认超时
    pub timeout: Option<Duration>,
}

impl Call {
    pub fn new(kind: RequestKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            context: None,
            timeout: None,
        }
    }

    /// 探活请求
    pub fn probe() -> Self {
        Self::new(RequestKind::LivenessProbe, Value::Object(Default::default()))
    }

    pub fn with_context(mut self, context: ContextBundle) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 各请求类型的默认截止时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub liveness_probe: Duration,
    pub interactive_message: Duration,
    pub structured_operation: Duration,
    pub privileged_command: Duration,
    pub file_operation: Duration,
    pub context_update: Duration,
}

impl TimeoutPolicy {
    pub fn for_kind(&self, kind: RequestKind) -> Duration {
        match kind {
            RequestKind::LivenessProbe => self.liveness_probe,
            RequestKind::InteractiveMessage => self.interactive_message,
            RequestKind::StructuredOperation => self.structured_operation,
            RequestKind::PrivilegedCommand => self.privileged_command,
            RequestKind::FileOperation => self.file_operation,
            RequestKind::ContextUpdate => self.context_update,
        }
    }

    /// 所有类型使用同一超时（测试用）
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            liveness_probe: timeout,
            interactive_message: timeout,
            structured_operation: timeout,
            privileged_command: timeout,
            file_operation: timeout,
            context_update: timeout,
        }
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            liveness_probe: Duration::from_secs(5),
            interactive_message: Duration::from_secs(300),
            structured_operation: Duration::from_secs(120),
            privileged_command: Duration::from_secs(120),
            file_operation: Duration::from_secs(30),
            context_update: Duration::from_secs(10),
        }
    }
}

/// 调用的最终汇总
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub chunks: Vec<Value>,
    pub result: Result<Value, CallError>,
}

/// 取消句柄，可脱离 CallHandle 单独持有
#[derive(Debug, Clone)]
pub struct CallCanceller {
    id: CallId,
    bus: Weak<Inner>,
}

impl CallCanceller {
    /// 取消调用（幂等）；返回本次是否真的移除了挂起条目
    pub fn cancel(&self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => inner.cancel(&self.id),
            None => false,
        }
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }
}

/// send 返回的句柄：依次产出零到多个 Chunk，最后恰好一个 Final
pub struct CallHandle {
    id: CallId,
    kind: RequestKind,
    events: mpsc::UnboundedReceiver<CallEvent>,
    canceller: CallCanceller,
    finished: bool,
}

impl CallHandle {
    pub(crate) fn new(
        id: CallId,
        kind: RequestKind,
        events: mpsc::UnboundedReceiver<CallEvent>,
        bus: Weak<Inner>,
    ) -> Self {
        Self {
            canceller: CallCanceller {
                id: id.clone(),
                bus,
            },
            id,
            kind,
            events,
            finished: false,
        }
    }

    /// 已经失败的句柄（未进入挂起表，例如链路已关闭或后端不可用）
    pub fn failed(id: CallId, kind: RequestKind, err: CallError) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(CallEvent::Final(Err(err)));
        Self::new(id, kind, rx, Weak::new())
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn canceller(&self) -> CallCanceller {
        self.canceller.clone()
    }

    pub fn cancel(&self) -> bool {
        self.canceller.cancel()
    }

    /// 下一个事件；Final 之后返回 None
    pub async fn next(&mut self) -> Option<CallEvent> {
        if self.finished {
            return None;
        }
        let event = match self.events.recv().await {
            Some(event) => event,
            // 续体发送端被丢弃却没有最终结果：关联层已不存在
            None => CallEvent::Final(Err(CallError::Transport(
                "correlation layer dropped".to_string(),
            ))),
        };
        if matches!(event, CallEvent::Final(_)) {
            self.finished = true;
        }
        Some(event)
    }

    /// 收集所有分块与最终结果
    pub async fn finish(mut self) -> CallOutcome {
        let mut chunks = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                CallEvent::Chunk(value) => chunks.push(value),
                CallEvent::Final(result) => return CallOutcome { chunks, result },
            }
        }
        CallOutcome {
            chunks,
            result: Err(CallError::Transport("call already finished".to_string())),
        }
    }

    /// 只关心最终结果
    pub async fn response(self) -> Result<Value, CallError> {
        self.finish().await.result
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("finished", &self.finished)
            .finish()
    }
}
