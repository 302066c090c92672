//! 关联层集成测试：流式顺序、超时、取消竞态、链路中断与会话隔离

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use hive::core::error::CallError;
    use hive::correlation::{
        Call, CallEvent, Correlator, CorrelatorOptions, RequestHandler, Responder,
    };
    use hive::protocol::{CallId, Envelope, Request, RequestKind, Response};
    use hive::transport::Link;
    use serde_json::{json, Value};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::Notify;

    const MAX_FRAME: usize = 64 * 1024;

    /// 先发 payload.chunks 个分块，再给最终结果
    struct Counter;

    #[async_trait]
    impl RequestHandler for Counter {
        async fn handle(&self, request: Request, responder: Responder) {
            let n = request.payload["chunks"].as_u64().unwrap_or(0);
            for i in 0..n {
                responder.chunk(json!(i));
                tokio::task::yield_now().await;
            }
            responder.finish(Ok(json!({ "total": n })));
        }
    }

    /// 永不回答，直到被对端取消
    #[derive(Default)]
    struct Stall {
        cancelled: AtomicBool,
        seen_cancel: Notify,
    }

    #[async_trait]
    impl RequestHandler for Stall {
        async fn handle(&self, _request: Request, responder: Responder) {
            responder.cancellation().cancelled().await;
            self.cancelled.store(true, Ordering::SeqCst);
            self.seen_cancel.notify_one();
        }
    }

    /// 记录被调用次数，直到被取消才回答
    #[derive(Default)]
    struct CountingStall {
        handled: AtomicUsize,
    }

    #[async_trait]
    impl RequestHandler for CountingStall {
        async fn handle(&self, _request: Request, responder: Responder) {
            self.handled.fetch_add(1, Ordering::SeqCst);
            responder.cancellation().cancelled().await;
            responder.finish(Err("cancelled".to_string()));
        }
    }

    fn served(handler: Arc<dyn RequestHandler>) -> (Correlator, Correlator) {
        let (client, server) = Link::memory_pair(MAX_FRAME);
        let server = Correlator::serve(server, CorrelatorOptions::default(), handler);
        let client = Correlator::new(client, CorrelatorOptions::default().with_tag("s1"));
        (client, server)
    }

    fn structured(payload: Value) -> Call {
        Call::new(RequestKind::StructuredOperation, payload)
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_order_before_final() {
        let (client, _server) = served(Arc::new(Counter));
        let mut handle = client.send(structured(json!({ "chunks": 10 })));

        let mut chunks = Vec::new();
        let result = loop {
            match handle.next().await {
                Some(CallEvent::Chunk(v)) => chunks.push(v.as_u64().unwrap()),
                Some(CallEvent::Final(result)) => break result,
                None => panic!("handle ended without a final event"),
            }
        };
        assert_eq!(chunks, (0..10).collect::<Vec<_>>());
        assert_eq!(result, Ok(json!({ "total": 10 })));
        assert!(handle.next().await.is_none());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_resolve_independently() {
        let (client, _server) = served(Arc::new(Counter));
        let handles: Vec<_> = (0..20u64)
            .map(|n| client.send(structured(json!({ "chunks": n % 4 }))))
            .collect();
        for (n, handle) in handles.into_iter().enumerate() {
            let outcome = handle.finish().await;
            let expected = (n % 4) as u64;
            assert_eq!(outcome.chunks.len() as u64, expected);
            assert_eq!(outcome.result, Ok(json!({ "total": expected })));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_call_and_cancels_peer() {
        let stall = Arc::new(Stall::default());
        let (client, _server) = served(stall.clone());

        let handle = client.send(structured(json!({})).with_timeout(Duration::from_secs(2)));
        let id = handle.id().clone();
        match handle.response().await {
            Err(CallError::Timeout { id: timed_out, after }) => {
                assert_eq!(timed_out, id);
                assert_eq!(after, Duration::from_secs(2));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(client.pending_count(), 0);

        tokio::time::timeout(Duration::from_secs(1), stall.seen_cancel.notified())
            .await
            .ok();
        assert!(stall.cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_explicit_cancel_reaches_serving_side() {
        let stall = Arc::new(Stall::default());
        let (client, _server) = served(stall.clone());

        let handle = client.send(structured(json!({})));

        // 等请求送达后再取消
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(handle.response().await, Err(CallError::Cancelled));

        tokio::time::timeout(Duration::from_secs(1), stall.seen_cancel.notified())
            .await
            .expect("serving side never saw the cancel");
        assert!(stall.cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_racing_completion_resolves_once() {
        let (client, _server) = served(Arc::new(Counter));
        for round in 0..50 {
            let mut handle = client.send(structured(json!({ "chunks": round % 3 })));
            if round % 2 == 0 {
                tokio::task::yield_now().await;
            }
            let canceller = handle.canceller();
            canceller.cancel();

            let mut finals = 0;
            while let Some(event) = handle.next().await {
                if let CallEvent::Final(result) = event {
                    finals += 1;
                    assert!(
                        matches!(result, Ok(_) | Err(CallError::Cancelled)),
                        "{result:?}"
                    );
                }
            }
            assert_eq!(finals, 1);
        }
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abrupt_close_fails_every_pending_call() {
        let (client, server) = served(Arc::new(Stall::default()));
        let handles: Vec<_> = (0..50).map(|_| client.send(Call::probe())).collect();
        assert_eq!(client.pending_count(), 50);

        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close(CallError::Transport("backend killed".to_string()));

        for handle in handles {
            let err = handle.response().await.unwrap_err();
            assert!(matches!(err, CallError::Transport(_)), "{err:?}");
        }
        assert_eq!(client.pending_count(), 0);
        assert!(client.is_closed());

        // 关闭之后的新调用立即失败
        let late = client.send(Call::probe()).response().await;
        assert!(matches!(late, Err(CallError::Transport(_))));
    }

    #[tokio::test]
    async fn test_responses_for_other_sessions_are_ignored() {
        let (client_link, mut backend) = Link::memory_pair(MAX_FRAME);
        let client = Correlator::new(client_link, CorrelatorOptions::default().with_tag("s2"));

        let handle = client.send(Call::probe());
        let request = match backend.recv().await {
            Some(Envelope::Request(request)) => request,
            other => panic!("unexpected: {other:?}"),
        };
        assert!(request.id.as_str().starts_with("s2-"));

        // 上一个会话的同号响应
        let stale = CallId::new(request.id.as_str().replacen("s2", "s1", 1));
        assert!(backend.send(Envelope::Response(Response::ok(stale, json!("stale")))));
        assert!(backend.send(Envelope::Response(Response::chunk(
            request.id.clone(),
            json!("progress"),
        ))));
        assert!(backend.send(Envelope::Response(Response::ok(request.id, json!("fresh")))));

        let outcome = handle.finish().await;
        assert_eq!(outcome.chunks, vec![json!("progress")]);
        assert_eq!(outcome.result, Ok(json!("fresh")));
    }

    #[tokio::test]
    async fn test_failure_response_terminates_even_without_final_flag() {
        let (client_link, mut backend) = Link::memory_pair(MAX_FRAME);
        let client = Correlator::new(client_link, CorrelatorOptions::default());

        let handle = client.send(structured(json!({})));
        let Some(Envelope::Request(request)) = backend.recv().await else {
            panic!("expected a request");
        };
        let mut failure = Response::failure(request.id, "disk full");
        failure.is_final = false;
        backend.send(Envelope::Response(failure));

        assert_eq!(
            handle.response().await,
            Err(CallError::Remote("disk full".to_string()))
        );
    }

    #[tokio::test]
    async fn test_malformed_frames_do_not_break_the_link() {
        let (near, mut far) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(near);
        let client = Correlator::new(
            Link::from_io("raw", read, write, MAX_FRAME),
            CorrelatorOptions::default().with_tag("s3"),
        );

        let handle = client.send(Call::probe());
        far.write_all(b"this is not json\n\n{\"type\":\"mystery\"}\n")
            .await
            .unwrap();
        let reply = Envelope::Response(Response::ok(CallId::new("s3-1"), json!({"status": "ok"})));
        let mut line = serde_json::to_vec(&reply).unwrap();
        line.push(b'\n');
        far.write_all(&line).await.unwrap();

        assert_eq!(handle.response().await, Ok(json!({"status": "ok"})));
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_notifications_flow_both_ways() {
        let (client, server) = served(Arc::new(Counter));
        let mut at_client = client.notifications();
        let mut at_server = server.notifications();

        assert!(server.notify("backend/progress", json!({ "step": 1 })));
        assert!(client.notify("editor/focus", json!({ "path": "/a.rs" })));

        let n = at_client.recv().await.unwrap();
        assert_eq!(n.topic, "backend/progress");
        assert_eq!(n.payload["step"], 1);
        let n = at_server.recv().await.unwrap();
        assert_eq!(n.topic, "editor/focus");
    }

    #[tokio::test]
    async fn test_oversized_request_rejected_locally() {
        let (client_link, _backend) = Link::memory_pair(MAX_FRAME);
        let options = CorrelatorOptions {
            max_frame_bytes: 1024,
            ..CorrelatorOptions::default()
        };
        let client = Correlator::new(client_link, options);

        let big = "x".repeat(4096);
        let err = client
            .send(structured(json!({ "blob": big })))
            .response()
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Protocol(_)), "{err:?}");
        assert_eq!(client.pending_count(), 0);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_inbound_request_reusing_live_id_is_dropped() {
        let handler = Arc::new(CountingStall::default());
        let (mut peer, server_link) = Link::memory_pair(MAX_FRAME);
        let _server = Correlator::serve(server_link, CorrelatorOptions::default(), handler.clone());

        let request = |id: &str| {
            Envelope::Request(Request {
                id: CallId::new(id),
                kind: RequestKind::StructuredOperation,
                payload: json!({}),
                context: None,
                timestamp: 0,
            })
        };
        assert!(peer.send(request("p-1")));
        assert!(peer.send(request("p-1")));
        assert!(peer.send(Envelope::Cancel { id: CallId::new("p-1") }));

        let first = tokio::time::timeout(Duration::from_secs(1), peer.recv())
            .await
            .expect("no response for the first request");
        match first {
            Some(Envelope::Response(response)) => {
                assert_eq!(response.id, CallId::new("p-1"));
                assert!(response.terminates());
            }
            other => panic!("unexpected: {other:?}"),
        }

        // 之后的请求照常服务，且之前没有多余的 p-1 响应
        assert!(peer.send(request("p-2")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(peer.send(Envelope::Cancel { id: CallId::new("p-2") }));
        match tokio::time::timeout(Duration::from_secs(1), peer.recv()).await {
            Ok(Some(Envelope::Response(response))) => assert_eq!(response.id, CallId::new("p-2")),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
    }
}
