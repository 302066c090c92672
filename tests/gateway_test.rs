//! Gateway 集成测试：编辑器动作 → 关联请求 → 渲染指令

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use hive::backend::{BackendHandler, EchoProvider};
    use hive::core::error::{FailureClass, SupervisorError};
    use hive::core::session::SessionId;
    use hive::correlation::{Call, Correlator, CorrelatorOptions};
    use hive::gateway::{
        forward_events, ChannelRenderer, GatewaySession, RelayHandler, RenderUpdate, StaticContext,
    };
    use hive::protocol::{BufferSnapshot, ContextBundle, RequestKind};
    use hive::supervisor::{
        BackendLauncher, BackendProcess, ProcessControl, Supervisor, SupervisorConfig,
    };
    use hive::transport::Link;
    use serde_json::json;
    use tokio::sync::{mpsc, oneshot};

    const MAX_FRAME: usize = 64 * 1024;

    /// 返回 (客户端, 服务端)；服务端句柄须在测试期间保持存活
    fn backend(provider: EchoProvider) -> (Correlator, Correlator) {
        let (client, server) = Link::memory_pair(MAX_FRAME);
        let handler = Arc::new(BackendHandler::new(Arc::new(provider)));
        let server = Correlator::serve(server, CorrelatorOptions::default(), handler);
        (Correlator::new(client, CorrelatorOptions::default()), server)
    }

    fn editor_context() -> StaticContext {
        StaticContext(ContextBundle {
            current_buffer: Some(BufferSnapshot {
                path: "/project/src/main.rs".to_string(),
                content: "fn main() {}".to_string(),
                filetype: "rust".to_string(),
                modified: false,
            }),
            ..ContextBundle::default()
        })
    }

    async fn next_update(rx: &mut mpsc::UnboundedReceiver<RenderUpdate>) -> RenderUpdate {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no render update")
            .expect("render channel closed")
    }

    #[tokio::test]
    async fn test_submit_streams_chunks_then_completes() {
        let (renderer, mut rx) = ChannelRenderer::new();
        let (client, _server) = backend(EchoProvider::new());
        let gateway = GatewaySession::new(
            Arc::new(client),
            Arc::new(editor_context()),
            Arc::new(renderer),
        );

        let action = gateway.submit(RequestKind::InteractiveMessage, json!({ "message": "explain this" }));

        let mut text = String::new();
        loop {
            match next_update(&mut rx).await {
                RenderUpdate::Chunk { action: a, payload } => {
                    assert_eq!(a, action);
                    text.push_str(payload["text"].as_str().unwrap());
                }
                RenderUpdate::Completed { action: a, payload } => {
                    assert_eq!(a, action);
                    assert_eq!(payload["text"], text.as_str());
                    break;
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        // 上下文随请求附带
        assert_eq!(text, "Echo: explain this [/project/src/main.rs]");
        assert_eq!(gateway.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_submit_returns_before_backend_answers() {
        let (renderer, mut rx) = ChannelRenderer::new();
        let (client, _server) = backend(EchoProvider::new().with_delay(Duration::from_millis(200)));
        let gateway = GatewaySession::new(
            Arc::new(client),
            Arc::new(StaticContext::default()),
            Arc::new(renderer),
        );

        let first = gateway.submit(RequestKind::InteractiveMessage, json!("one"));
        let second = gateway.submit(RequestKind::InteractiveMessage, json!("two"));
        assert_ne!(first, second);
        assert_eq!(gateway.in_flight(), 2);
        assert!(rx.try_recv().is_err());

        let mut completed = Vec::new();
        while completed.len() < 2 {
            let update = next_update(&mut rx).await;
            if let RenderUpdate::Completed { action, .. } = update {
                completed.push(action);
            }
        }
        completed.sort();
        assert_eq!(completed, vec![first, second]);
    }

    #[tokio::test]
    async fn test_cancel_renders_cancelled_failure() {
        let (renderer, mut rx) = ChannelRenderer::new();
        let (client, _server) = backend(EchoProvider::new().with_delay(Duration::from_secs(30)));
        let gateway = GatewaySession::new(
            Arc::new(client),
            Arc::new(StaticContext::default()),
            Arc::new(renderer),
        );

        let action = gateway.submit(RequestKind::InteractiveMessage, json!("long"));
        assert!(gateway.cancel(action));

        match next_update(&mut rx).await {
            RenderUpdate::Failed { action: a, class, .. } => {
                assert_eq!(a, action);
                assert_eq!(class, FailureClass::Cancelled);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(gateway.in_flight(), 0);
        assert!(!gateway.cancel(action));
    }

    #[tokio::test]
    async fn test_remote_failure_is_rendered() {
        let (renderer, mut rx) = ChannelRenderer::new();
        let (client, _server) = backend(EchoProvider::new());
        let gateway = GatewaySession::new(
            Arc::new(client),
            Arc::new(StaticContext::default()),
            Arc::new(renderer),
        );

        let action = gateway.submit(RequestKind::PrivilegedCommand, json!({ "cmd": "ls" }));
        match next_update(&mut rx).await {
            RenderUpdate::Failed { action: a, class, message, .. } => {
                assert_eq!(a, action);
                assert_eq!(class, FailureClass::Backend);
                assert!(message.contains("unsupported"), "{message}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    struct Noop;

    impl ProcessControl for Noop {
        fn terminate(&mut self) {}
    }

    struct InProcessLauncher;

    #[async_trait]
    impl BackendLauncher for InProcessLauncher {
        async fn launch(&self, session: &SessionId) -> Result<BackendProcess, SupervisorError> {
            let (client, server) = Link::memory_pair(MAX_FRAME);
            let handler = BackendHandler::new(Arc::new(EchoProvider::new())).with_session(session.as_str());
            let server = Correlator::serve(server, CorrelatorOptions::default(), Arc::new(handler));
            let (exit_tx, exit_rx) = oneshot::channel();
            tokio::spawn(async move {
                server.close_signal().cancelled().await;
                let _ = exit_tx.send(Some(0));
            });
            Ok(BackendProcess {
                link: client,
                exit: exit_rx,
                control: Box::new(Noop),
            })
        }
    }

    /// 编辑器 → 中继 → 监管 → 后端，全部走真实协议
    #[tokio::test]
    async fn test_relay_end_to_end_with_status_updates() {
        let supervisor = Supervisor::spawn(Arc::new(InProcessLauncher), SupervisorConfig::default());

        let (editor_link, relay_link) = Link::memory_pair(MAX_FRAME);
        let relay = Correlator::serve(
            relay_link,
            CorrelatorOptions::default().with_tag("editor"),
            Arc::new(RelayHandler::new(supervisor.clone())),
        );
        let _events = forward_events(&supervisor, relay.clone());
        let editor = Correlator::new(editor_link, CorrelatorOptions::default());

        let (renderer, mut rx) = ChannelRenderer::new();
        let gateway = GatewaySession::new(
            Arc::new(editor.clone()),
            Arc::new(editor_context()),
            Arc::new(renderer),
        );
        let _notifications = gateway.attach_notifications(editor.notifications());

        let action = gateway.submit(RequestKind::InteractiveMessage, json!({ "message": "hi" }));

        let mut states = Vec::new();
        let mut chunks = 0;
        loop {
            match next_update(&mut rx).await {
                RenderUpdate::Status { state, .. } => states.push(state),
                RenderUpdate::Chunk { action: a, .. } => {
                    assert_eq!(a, action);
                    chunks += 1;
                }
                RenderUpdate::Completed { action: a, payload } => {
                    assert_eq!(a, action);
                    assert_eq!(payload["text"], "Echo: hi [/project/src/main.rs]");
                    break;
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(chunks, 3);

        // 状态推送可能晚于结果到达
        while !states.iter().any(|s| s == "running") {
            if let RenderUpdate::Status { state, .. } = next_update(&mut rx).await {
                states.push(state);
            }
        }
        assert!(states.iter().any(|s| s == "starting"), "{states:?}");

        // 探活由监管进程直接回答
        let probe = editor.send(Call::probe()).response().await.unwrap();
        assert_eq!(probe["status"], "ok");
        assert_eq!(probe["backend"]["state"], "running");

        supervisor.shutdown().await;
        let after = gateway.submit(RequestKind::InteractiveMessage, json!("bye"));
        loop {
            match next_update(&mut rx).await {
                RenderUpdate::Failed { action: a, class, .. } => {
                    assert_eq!(a, after);
                    assert_eq!(class, FailureClass::Backend);
                    break;
                }
                RenderUpdate::Status { .. } => {}
                other => panic!("unexpected: {other:?}"),
            }
        }
    }
}
