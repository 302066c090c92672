//! 双工报文通道
//!
//! `Link` 把任意有序字节流（子进程管道、自身 stdio、TCP、内存 duplex）包装成报文收发两端：
//! 读任务解码入站帧，写任务编码出站帧。任一方向结束（EOF、写失败、主动关闭）都会关闭整条链路，
//! 入站通道随之结束，上层据此立即让挂起调用失败。

use std::io;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::protocol::{Envelope, EnvelopeCodec, Frame};

/// 内存管道的缓冲大小
const MEMORY_PIPE_BYTES: usize = 64 * 1024;

/// TCP 连接重试的初始 / 最大间隔
const CONNECT_RETRY_INITIAL: Duration = Duration::from_millis(50);
const CONNECT_RETRY_MAX: Duration = Duration::from_millis(200);

/// 一条已建立的链路
pub struct Link {
    label: String,
    outbound: mpsc::UnboundedSender<Envelope>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    closed: CancellationToken,
}

/// 可在任意位置关闭链路的句柄
#[derive(Debug, Clone)]
pub struct LinkCloser(CancellationToken);

impl LinkCloser {
    pub fn close(&self) {
        self.0.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }
}

impl Link {
    /// 在一对读写流上建立链路
    pub fn from_io<R, W>(label: impl Into<String>, reader: R, writer: W, max_frame: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let label = label.into();
        let closed = CancellationToken::new();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();

        let mut frames = FramedRead::new(reader, EnvelopeCodec::new(max_frame));
        let reader_closed = closed.clone();
        let reader_label = label.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    frame = frames.next() => frame,
                };
                match frame {
                    Some(Ok(Frame::Envelope(envelope))) => {
                        if in_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Frame::Malformed { error, preview })) => {
                        tracing::warn!(link = %reader_label, %error, %preview, "Dropping malformed frame");
                    }
                    Some(Ok(Frame::Oversized)) => {
                        tracing::warn!(link = %reader_label, max_frame, "Dropping oversized frame");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(link = %reader_label, "Link read failed: {}", e);
                        break;
                    }
                    None => {
                        tracing::debug!(link = %reader_label, "Link reached EOF");
                        break;
                    }
                }
            }
            reader_closed.cancel();
        });

        let mut sink = FramedWrite::new(writer, EnvelopeCodec::new(max_frame));
        let writer_closed = closed.clone();
        let writer_label = label.clone();
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    envelope = out_rx.recv() => envelope,
                };
                let Some(envelope) = envelope else {
                    break;
                };
                if let Err(e) = sink.send(envelope).await {
                    tracing::warn!(link = %writer_label, "Link write failed: {}", e);
                    break;
                }
            }
            writer_closed.cancel();
        });

        Self {
            label,
            outbound: out_tx,
            inbound: in_rx,
            closed,
        }
    }

    /// 当前进程自身的 stdin / stdout
    pub fn stdio(max_frame: usize) -> Self {
        Self::from_io("stdio", tokio::io::stdin(), tokio::io::stdout(), max_frame)
    }

    /// 连接 TCP 端点；失败时按 50ms 起步、翻倍、封顶 200ms 重试，直到 `within` 用完
    pub async fn connect_tcp(addr: &str, max_frame: usize, within: Duration) -> io::Result<Self> {
        let deadline = Instant::now() + within;
        let mut delay = CONNECT_RETRY_INITIAL;
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let (reader, writer) = stream.into_split();
                    return Ok(Self::from_io(format!("tcp:{addr}"), reader, writer, max_frame));
                }
                Err(e) => {
                    if Instant::now() + delay > deadline {
                        return Err(e);
                    }
                    tracing::debug!(%addr, delay_ms = delay.as_millis() as u64, "Connect failed, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(CONNECT_RETRY_MAX);
                }
            }
        }
    }

    /// 一对相互连通的内存链路（测试与进程内后端）
    pub fn memory_pair(max_frame: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(MEMORY_PIPE_BYTES);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            Self::from_io("memory:a", a_read, a_write, max_frame),
            Self::from_io("memory:b", b_read, b_write, max_frame),
        )
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn closer(&self) -> LinkCloser {
        LinkCloser(self.closed.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// 排队发送；链路已关闭时返回 false
    pub fn send(&self, envelope: Envelope) -> bool {
        !self.closed.is_cancelled() && self.outbound.send(envelope).is_ok()
    }

    /// 接收下一帧；链路关闭后返回 None
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    /// 拆成发送端、接收端与关闭句柄
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<Envelope>,
        mpsc::UnboundedReceiver<Envelope>,
        LinkCloser,
    ) {
        (self.outbound, self.inbound, LinkCloser(self.closed))
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("label", &self.label)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CallId, Notification};
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_pair_delivers_in_order() {
        let (a, mut b) = Link::memory_pair(1024);
        for i in 0..5 {
            assert!(a.send(Envelope::Notification(Notification::new("seq", json!(i)))));
        }
        for i in 0..5 {
            match b.recv().await {
                Some(Envelope::Notification(n)) => assert_eq!(n.payload, json!(i)),
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_close_propagates_to_peer() {
        let (a, mut b) = Link::memory_pair(1024);
        a.closer().close();
        assert!(b.recv().await.is_none());
        assert!(b.is_closed());
        assert!(!a.send(Envelope::Cancel { id: CallId::from("x") }));
    }

    #[tokio::test]
    async fn test_malformed_input_is_skipped() {
        let (client, server) = tokio::io::duplex(1024);
        let (read, write) = tokio::io::split(server);
        let mut link = Link::from_io("test", read, write, 1024);

        let (_client_read, mut client_write) = tokio::io::split(client);
        use tokio::io::AsyncWriteExt;
        client_write
            .write_all(b"{oops\n{\"type\":\"cancel\",\"id\":\"s1-1\"}\n")
            .await
            .unwrap();

        assert_eq!(
            link.recv().await,
            Some(Envelope::Cancel { id: CallId::from("s1-1") })
        );
    }

    #[tokio::test]
    async fn test_connect_tcp_gives_up_after_window() {
        // 绑定后立即释放，得到一个大概率无人监听的端口
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result =
            Link::connect_tcp(&format!("127.0.0.1:{port}"), 1024, Duration::from_millis(120)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_tcp_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, w) = stream.into_split();
            let mut link = Link::from_io("server", r, w, 1024);
            let got = link.recv().await;
            (link, got)
        });

        let client = Link::connect_tcp(&addr, 1024, Duration::from_secs(2)).await.unwrap();
        assert!(client.send(Envelope::Cancel { id: CallId::from("t-1") }));
        let (_link, got) = server.await.unwrap();
        assert_eq!(got, Some(Envelope::Cancel { id: CallId::from("t-1") }));
    }
}
