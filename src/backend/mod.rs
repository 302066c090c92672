//! 沙箱后端：按请求类型分派
//!
//! - liveness-probe：回答运行时长
//! - context-update：保存最新上下文快照，供后续对话使用
//! - interactive-message：交给 Provider 流式生成
//! - 其他类型：交给注册的 OperationHandler，未注册则失败（unsupported）

mod echo;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::correlation::{RequestHandler, Responder};
use crate::protocol::{ContextBundle, Request, RequestKind};

pub use echo::EchoProvider;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, String>> + Send>>;

/// 模型 Provider 策略（由配置选择，核心层只关心调用约定）
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete_stream(
        &self,
        prompt: &str,
        context: Option<&ContextBundle>,
    ) -> Result<ChunkStream, String>;
}

/// 非对话类请求的处理器（结构化文档、命令、文件操作等）
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn execute(&self, payload: Value, context: Option<ContextBundle>) -> Result<Value, String>;
}

pub struct BackendHandler {
    provider: Arc<dyn Provider>,
    operations: HashMap<RequestKind, Arc<dyn OperationHandler>>,
    session: Option<String>,
    started_at: Instant,
    last_context: RwLock<Option<ContextBundle>>,
}

impl BackendHandler {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            operations: HashMap::new(),
            session: None,
            started_at: Instant::now(),
            last_context: RwLock::new(None),
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_operation(mut self, kind: RequestKind, handler: Arc<dyn OperationHandler>) -> Self {
        self.operations.insert(kind, handler);
        self
    }

    pub async fn last_context(&self) -> Option<ContextBundle> {
        self.last_context.read().await.clone()
    }

    fn probe(&self) -> Value {
        json!({
            "status": "ok",
            "uptime_ms": self.started_at.elapsed().as_millis() as u64,
            "session": self.session,
            "provider": self.provider.name(),
        })
    }

    async fn update_context(&self, request: Request) -> Result<Value, String> {
        let bundle = match request.context {
            Some(bundle) => bundle,
            None => serde_json::from_value::<ContextBundle>(request.payload)
                .map_err(|e| format!("invalid context bundle: {e}"))?,
        };
        let truncated = bundle.truncated;
        *self.last_context.write().await = Some(bundle);
        Ok(json!({ "stored": true, "truncated": truncated }))
    }

    async fn interactive(&self, request: Request, responder: &Responder) -> Result<Value, String> {
        let prompt = match &request.payload {
            Value::String(text) => text.clone(),
            other => other
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };
        let context = match request.context {
            Some(bundle) => Some(bundle),
            None => self.last_context().await,
        };

        let mut stream = self.provider.complete_stream(&prompt, context.as_ref()).await?;
        let cancelled = responder.cancellation();
        let mut text = String::new();
        loop {
            let chunk = tokio::select! {
                _ = cancelled.cancelled() => return Err("cancelled".to_string()),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;
            text.push_str(&chunk);
            responder.chunk(json!({ "text": chunk }));
        }
        Ok(json!({ "text": text, "provider": self.provider.name() }))
    }
}

#[async_trait]
impl RequestHandler for BackendHandler {
    async fn handle(&self, request: Request, responder: Responder) {
        tracing::debug!(call_id = %request.id, kind = %request.kind, "Handling request");
        let result = match request.kind {
            RequestKind::LivenessProbe => Ok(self.probe()),
            RequestKind::ContextUpdate => self.update_context(request).await,
            RequestKind::InteractiveMessage => self.interactive(request, &responder).await,
            kind => match self.operations.get(&kind) {
                Some(handler) => handler.execute(request.payload, request.context).await,
                None => Err(format!("unsupported request kind: {kind}")),
            },
        };
        if let Err(e) = &result {
            tracing::debug!(call_id = %responder.id(), "Request failed: {}", e);
        }
        responder.finish(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::{Call, CallEvent, Correlator, CorrelatorOptions};
    use crate::transport::Link;

    struct Upper;

    #[async_trait]
    impl OperationHandler for Upper {
        async fn execute(&self, payload: Value, _context: Option<ContextBundle>) -> Result<Value, String> {
            let text = payload.as_str().ok_or("expected string")?;
            Ok(json!(text.to_uppercase()))
        }
    }

    fn pair(handler: BackendHandler) -> (Correlator, Correlator) {
        let (client, server) = Link::memory_pair(64 * 1024);
        let server = Correlator::serve(server, CorrelatorOptions::default(), Arc::new(handler));
        let client = Correlator::new(client, CorrelatorOptions::default().with_tag("t"));
        (client, server)
    }

    #[tokio::test]
    async fn test_probe_reports_provider() {
        let (client, _server) = pair(BackendHandler::new(Arc::new(EchoProvider::new())).with_session("s1"));
        let value = client.send(Call::probe()).response().await.unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["session"], "s1");
        assert_eq!(value["provider"], "echo");
    }

    #[tokio::test]
    async fn test_interactive_streams_chunks() {
        let (client, _server) = pair(BackendHandler::new(Arc::new(EchoProvider::new())));
        let outcome = client
            .send(Call::new(RequestKind::InteractiveMessage, json!({"message": "hi there"})))
            .finish()
            .await;
        let chunks: Vec<String> = outcome
            .chunks
            .iter()
            .map(|c| c["text"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(chunks, vec!["Echo: ", "hi ", "there"]);
        assert_eq!(outcome.result.unwrap()["text"], "Echo: hi there");
    }

    #[tokio::test]
    async fn test_context_update_used_by_later_message() {
        let (client, _server) = pair(BackendHandler::new(Arc::new(EchoProvider::new())));
        let bundle = ContextBundle {
            current_buffer: Some(crate::protocol::BufferSnapshot {
                path: "/notes.md".to_string(),
                content: "# todo".to_string(),
                filetype: "markdown".to_string(),
                modified: true,
            }),
            ..ContextBundle::default()
        };
        let stored = client
            .send(Call::new(RequestKind::ContextUpdate, serde_json::to_value(&bundle).unwrap()))
            .response()
            .await
            .unwrap();
        assert_eq!(stored["stored"], true);

        let reply = client
            .send(Call::new(RequestKind::InteractiveMessage, json!("status?")))
            .response()
            .await
            .unwrap();
        assert_eq!(reply["text"], "Echo: status? [/notes.md]");
    }

    #[tokio::test]
    async fn test_operations_and_unsupported_kinds() {
        let handler = BackendHandler::new(Arc::new(EchoProvider::new()))
            .with_operation(RequestKind::StructuredOperation, Arc::new(Upper));
        let (client, _server) = pair(handler);

        let ok = client
            .send(Call::new(RequestKind::StructuredOperation, json!("draft")))
            .response()
            .await;
        assert_eq!(ok, Ok(json!("DRAFT")));

        let mut unsupported = client.send(Call::new(RequestKind::PrivilegedCommand, json!({"cmd": "rm"})));
        match unsupported.next().await {
            Some(CallEvent::Final(Err(crate::core::error::CallError::Remote(msg)))) => {
                assert!(msg.contains("unsupported"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
