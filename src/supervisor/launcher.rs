//! 后端启动器
//!
//! 每个后端会话调用一次 launch：拉起进程（或容器运行时），建立链路，并交出退出通知与终止句柄。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::config::{BackendSection, TransportKind};
use crate::core::error::SupervisorError;
use crate::core::session::SessionId;
use crate::transport::Link;

/// 后端进程收到的会话 ID 环境变量
pub const SESSION_ENV: &str = "HIVE_SESSION";

/// 终止后端进程
pub trait ProcessControl: Send {
    fn terminate(&mut self);
}

/// 一次启动的产物
pub struct BackendProcess {
    pub link: Link,
    /// 进程退出时送出退出码（被信号杀死时为 None）
    pub exit: oneshot::Receiver<Option<i32>>,
    pub control: Box<dyn ProcessControl>,
}

impl std::fmt::Debug for BackendProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendProcess").field("link", &self.link).finish()
    }
}

#[async_trait]
pub trait BackendLauncher: Send + Sync {
    async fn launch(&self, session: &SessionId) -> Result<BackendProcess, SupervisorError>;
}

/// 以子进程方式启动后端
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    backend: BackendSection,
    max_frame: usize,
}

impl CommandLauncher {
    pub fn new(backend: BackendSection, max_frame: usize) -> Self {
        Self { backend, max_frame }
    }

    fn command(&self, session: &SessionId) -> Command {
        let mut cmd = Command::new(&self.backend.command);
        cmd.args(&self.backend.args)
            .envs(&self.backend.env)
            .env(SESSION_ENV, session.as_str())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.backend.working_dir {
            cmd.current_dir(dir);
        }
        match self.backend.transport {
            TransportKind::Stdio => {
                cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
            }
            TransportKind::Tcp => {
                cmd.stdin(Stdio::null()).stdout(Stdio::null());
            }
        }
        cmd
    }
}

struct ChildControl {
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessControl for ChildControl {
    fn terminate(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// 监视子进程：自然退出或收到终止请求（包括终止句柄被丢弃）时结束
fn watch_child(mut child: Child, session: SessionId) -> (oneshot::Receiver<Option<i32>>, ChildControl) {
    let (exit_tx, exit_rx) = oneshot::channel();
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                tracing::debug!(session = %session, "Terminating backend process");
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(session = %session, "Failed to wait for backend process: {}", e);
                None
            }
        };
        tracing::info!(session = %session, code = ?code, "Backend process exited");
        let _ = exit_tx.send(code);
    });
    (exit_rx, ChildControl { kill: Some(kill_tx) })
}

#[async_trait]
impl BackendLauncher for CommandLauncher {
    async fn launch(&self, session: &SessionId) -> Result<BackendProcess, SupervisorError> {
        let mut child = self
            .command(session)
            .spawn()
            .map_err(|e| SupervisorError::Launch(format!("{}: {}", self.backend.command, e)))?;
        tracing::info!(
            session = %session,
            command = %self.backend.command,
            pid = ?child.id(),
            "Spawned backend process"
        );

        match self.backend.transport {
            TransportKind::Stdio => {
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| SupervisorError::Launch("backend stdin not captured".to_string()))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| SupervisorError::Launch("backend stdout not captured".to_string()))?;
                let link = Link::from_io(format!("backend:{session}"), stdout, stdin, self.max_frame);
                let (exit, control) = watch_child(child, session.clone());
                Ok(BackendProcess {
                    link,
                    exit,
                    control: Box::new(control),
                })
            }
            TransportKind::Tcp => {
                let endpoint = self
                    .backend
                    .endpoint
                    .clone()
                    .ok_or_else(|| SupervisorError::Config("backend.endpoint missing".to_string()))?;
                let (exit, mut control) = watch_child(child, session.clone());
                let within = self.backend.startup_grace().min(Duration::from_secs(30));
                match Link::connect_tcp(&endpoint, self.max_frame, within).await {
                    Ok(link) => Ok(BackendProcess {
                        link,
                        exit,
                        control: Box::new(control),
                    }),
                    Err(e) => {
                        control.terminate();
                        Err(SupervisorError::Launch(format!("connect {endpoint}: {e}")))
                    }
                }
            }
        }
    }
}
