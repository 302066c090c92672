//! Hive 后端（沙箱内运行）
//!
//! stdin/stdout 连接监管进程，链路关闭即退出。

use std::sync::Arc;

use anyhow::Context;
use hive::backend::{BackendHandler, EchoProvider};
use hive::config::load_from_env;
use hive::correlation::Correlator;
use hive::observability;
use hive::supervisor::launcher::SESSION_ENV;
use hive::transport::Link;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config = load_from_env().context("Failed to load configuration")?;
    let mut handler = BackendHandler::new(Arc::new(EchoProvider::new()));
    if let Ok(session) = std::env::var(SESSION_ENV) {
        handler = handler.with_session(session);
    }

    let server = Correlator::serve(
        Link::stdio(config.transport.max_frame_bytes),
        config.correlator_options(),
        Arc::new(handler),
    );
    tracing::info!("Backend ready");

    server.close_signal().cancelled().await;
    tracing::info!(reason = ?server.close_reason(), "Link closed, backend exiting");
    Ok(())
}
