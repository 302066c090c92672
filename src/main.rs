//! Hive 监管进程
//!
//! stdin/stdout 连接编辑器：编辑器请求经中继转交后端会话，后端生命周期事件作为通知推回编辑器。
//! 编辑器断开、Ctrl+C 或 SIGTERM 时停止后端后退出。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive::config::load_from_env;
use hive::core::error::CallError;
use hive::core::shutdown::{
    run_with_graceful_shutdown, ShutdownCoordinator, ShutdownManager, ShutdownReason,
    SupervisorCleanup,
};
use hive::correlation::Correlator;
use hive::gateway::{forward_events, RelayHandler};
use hive::observability;
use hive::supervisor::{CommandLauncher, Supervisor, SupervisorConfig};
use hive::transport::Link;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config = load_from_env().context("Failed to load configuration")?;
    tracing::info!(
        command = %config.backend.command,
        transport = ?config.backend.transport,
        "Starting hive supervisor"
    );

    let launcher = Arc::new(CommandLauncher::new(
        config.backend.clone(),
        config.transport.max_frame_bytes,
    ));
    let supervisor = Supervisor::spawn(launcher, SupervisorConfig::from_app(&config));
    supervisor.ensure_started();

    let editor = Correlator::serve(
        Link::stdio(config.transport.max_frame_bytes),
        config.correlator_options().with_tag("editor"),
        Arc::new(RelayHandler::new(supervisor.clone())),
    );
    let events = forward_events(&supervisor, editor.clone());

    let shutdown = Arc::new(ShutdownManager::new());
    let mut coordinator =
        ShutdownCoordinator::new(Arc::clone(&shutdown)).with_timeout(Duration::from_secs(10));
    coordinator.register(SupervisorCleanup::new(supervisor));

    let editor_closed = editor.close_signal();
    let manager = Arc::clone(&shutdown);
    let app = async move {
        editor_closed.cancelled().await;
        manager.shutdown(ShutdownReason::EditorDisconnected);
    };

    run_with_graceful_shutdown(shutdown, app, move || async move {
        coordinator.run_cleanup().await;
        editor.close(CallError::Cancelled);
        events.abort();
    })
    .await;

    Ok(())
}
