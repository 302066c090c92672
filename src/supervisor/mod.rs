//! 后端监管
//!
//! 单个控制循环（actor）独占生命周期状态：启动、就绪探测、周期探活、退出监视、退避重启都在独立任务里运行，
//! 结果以消息回到控制循环，按会话代号（generation）过滤过期消息。
//! 状态迁移：NotStarted → Starting → Running → Stopping → Stopped，Starting/Running → Error → Starting。

pub mod health;
pub mod launcher;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::AppConfig;
use crate::core::error::{BackendFault, CallError, SupervisorError};
use crate::core::recovery::{RecoveryAction, RecoveryEngine, RestartPolicy};
use crate::core::session::BackendSession;
use crate::core::state::{LifecycleSnapshot, LifecycleState};
use crate::correlation::{Call, CallHandle, Correlator, CorrelatorOptions, TimeoutPolicy};
use crate::protocol::{CallId, Notification};

pub use health::{HealthMonitor, HealthStatus};
pub use launcher::{BackendLauncher, BackendProcess, CommandLauncher, ProcessControl};

/// 事件广播的缓冲条数
const EVENT_BUFFER: usize = 64;

/// 监管参数
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub timeouts: TimeoutPolicy,
    pub max_frame_bytes: usize,
    pub max_context_bytes: usize,
    /// 启动后必须在此时间内探活成功
    pub startup_grace: Duration,
    pub readiness_poll: Duration,
    pub probe_interval: Duration,
    pub failure_threshold: u32,
    pub restart: RestartPolicy,
}

impl SupervisorConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            timeouts: config.timeouts.policy(),
            max_frame_bytes: config.transport.max_frame_bytes,
            max_context_bytes: config.context.max_bytes,
            startup_grace: config.backend.startup_grace(),
            readiness_poll: config.backend.readiness_poll(),
            probe_interval: config.health.probe_interval(),
            failure_threshold: config.health.failure_threshold,
            restart: config.restart.policy(),
        }
    }

    fn correlator_options(&self, session: &BackendSession) -> CorrelatorOptions {
        CorrelatorOptions {
            tag: Some(session.id().to_string()),
            timeouts: self.timeouts,
            max_frame_bytes: self.max_frame_bytes,
            max_context_bytes: self.max_context_bytes,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

/// 推给 Gateway 的事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SupervisorEventKind {
    LifecycleStateChanged,
    HealthDegraded,
    RestartExhausted,
}

impl SupervisorEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorEventKind::LifecycleStateChanged => "lifecycle-state-changed",
            SupervisorEventKind::HealthDegraded => "health-degraded",
            SupervisorEventKind::RestartExhausted => "restart-exhausted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorEvent {
    pub kind: SupervisorEventKind,
    pub snapshot: LifecycleSnapshot,
    /// 给用户看的说明
    pub diagnostic: String,
}

impl SupervisorEvent {
    pub fn topic(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn to_notification(&self) -> Notification {
        Notification::new(
            self.topic(),
            serde_json::json!({
                "state": self.snapshot.state,
                "diagnostic": self.diagnostic,
                "snapshot": self.snapshot,
            }),
        )
    }
}

#[derive(Clone)]
struct View {
    snapshot: LifecycleSnapshot,
    /// 仅在 Running 时存在
    correlator: Option<Correlator>,
}

enum Message {
    Start,
    Restart,
    Shutdown(oneshot::Sender<()>),
    Launched {
        generation: u64,
        result: Result<BackendProcess, SupervisorError>,
    },
    Ready {
        generation: u64,
        latency: Duration,
    },
    ReadinessFailed {
        generation: u64,
        fault: BackendFault,
    },
    ProbeResult {
        generation: u64,
        outcome: Result<Duration, CallError>,
    },
    Exited {
        generation: u64,
        code: Option<i32>,
    },
    LinkLost {
        generation: u64,
        reason: String,
    },
    RestartDue {
        generation: u64,
    },
}

/// 监管句柄（可克隆；最后一个句柄丢弃时后端随之停止）
#[derive(Clone)]
pub struct Supervisor {
    tx: mpsc::UnboundedSender<Message>,
    view: watch::Receiver<View>,
    events: broadcast::Sender<SupervisorEvent>,
    startup_grace: Duration,
    _owner: Arc<DropGuard>,
}

impl Supervisor {
    /// 启动控制循环；后端在第一次使用（call / ensure_started）时才拉起
    pub fn spawn(launcher: Arc<dyn BackendLauncher>, config: SupervisorConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let initial = View {
            snapshot: LifecycleSnapshot::initial(config.restart.max_attempts),
            correlator: None,
        };
        let (view_tx, view_rx) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let owner = CancellationToken::new();
        let startup_grace = config.startup_grace;

        let actor = Actor {
            launcher,
            health: HealthMonitor::new(config.failure_threshold),
            recovery: RecoveryEngine::new(config.restart),
            config,
            tx: tx.clone(),
            view_tx,
            events: events.clone(),
            state: LifecycleState::NotStarted,
            generation: 0,
            active: None,
            diagnostic: None,
            exhausted: false,
        };
        tokio::spawn(actor.run(rx, owner.clone()));

        Self {
            tx,
            view: view_rx,
            events,
            startup_grace,
            _owner: Arc::new(owner.drop_guard()),
        }
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        self.view.borrow().snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// 等到快照满足条件；控制循环已结束且最后状态不满足时返回 None
    pub async fn wait_for<F>(&self, mut predicate: F) -> Option<LifecycleSnapshot>
    where
        F: FnMut(&LifecycleSnapshot) -> bool,
    {
        let mut view = self.view.clone();
        loop {
            {
                let current = view.borrow_and_update();
                if predicate(&current.snapshot) {
                    return Some(current.snapshot.clone());
                }
            }
            if view.changed().await.is_err() {
                return None;
            }
        }
    }

    /// 触发首次启动（已启动时无操作）
    pub fn ensure_started(&self) {
        let _ = self.tx.send(Message::Start);
    }

    /// 人工重启：恢复重试预算并开始新会话
    pub fn restart(&self) {
        let _ = self.tx.send(Message::Restart);
    }

    /// 停止后端；所有挂起调用以取消失败
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Message::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// 当前 Running 会话的关联总线
    pub fn current(&self) -> Option<Correlator> {
        self.view.borrow().correlator.clone()
    }

    /// 发起调用。首次使用会拉起后端，并在启动宽限期内等待就绪
    pub async fn call(&self, call: Call) -> CallHandle {
        let kind = call.kind;
        match self.ready_correlator().await {
            Ok(correlator) => correlator.send(call),
            Err(err) => CallHandle::failed(CallId::new(format!("unbound-{kind}")), kind, err),
        }
    }

    async fn ready_correlator(&self) -> Result<Correlator, CallError> {
        self.ensure_started();
        let mut view = self.view.clone();
        let wait = async move {
            loop {
                {
                    let current = view.borrow_and_update();
                    let snapshot = &current.snapshot;
                    match snapshot.state {
                        LifecycleState::Running => {
                            if let Some(correlator) = &current.correlator {
                                return Ok(correlator.clone());
                            }
                        }
                        LifecycleState::Error if snapshot.exhausted => {
                            return Err(CallError::RestartExhausted(
                                snapshot.diagnostic.clone().unwrap_or_default(),
                            ));
                        }
                        LifecycleState::Stopped => {
                            return Err(CallError::BackendUnavailable(
                                "supervisor has shut down".to_string(),
                            ));
                        }
                        _ => {}
                    }
                }
                if view.changed().await.is_err() {
                    return Err(CallError::BackendUnavailable("supervisor stopped".to_string()));
                }
            }
        };
        match tokio::time::timeout(self.startup_grace, wait).await {
            Ok(result) => result,
            Err(_) => Err(CallError::BackendUnavailable(format!(
                "backend not ready within {}ms",
                self.startup_grace.as_millis()
            ))),
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.view.borrow().snapshot.state)
            .finish()
    }
}

struct ActiveSession {
    session: BackendSession,
    correlator: Option<Correlator>,
    control: Option<Box<dyn ProcessControl>>,
}

struct Actor {
    launcher: Arc<dyn BackendLauncher>,
    config: SupervisorConfig,
    tx: mpsc::UnboundedSender<Message>,
    view_tx: watch::Sender<View>,
    events: broadcast::Sender<SupervisorEvent>,
    state: LifecycleState,
    /// 每开始一个会话加一
    generation: u64,
    active: Option<ActiveSession>,
    health: HealthMonitor,
    recovery: RecoveryEngine,
    diagnostic: Option<String>,
    exhausted: bool,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>, owner: CancellationToken) {
        loop {
            let message = tokio::select! {
                message = rx.recv() => message,
                _ = owner.cancelled() => None,
            };
            match message {
                Some(Message::Shutdown(ack)) => {
                    self.stop();
                    let _ = ack.send(());
                    break;
                }
                Some(message) => self.handle(message),
                None => {
                    tracing::debug!("All supervisor handles dropped");
                    self.stop();
                    break;
                }
            }
        }
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Start => {
                if self.state == LifecycleState::NotStarted {
                    self.begin_session();
                }
            }
            Message::Restart => self.manual_restart(),
            Message::Shutdown(_) => {}
            Message::Launched { generation, result } => {
                if generation != self.generation || self.state != LifecycleState::Starting {
                    if let Ok(mut process) = result {
                        process.control.terminate();
                    }
                    return;
                }
                match result {
                    Ok(process) => self.attach(process),
                    Err(e) => self.fail(BackendFault::LaunchFailed(e.to_string())),
                }
            }
            Message::Ready { generation, latency } => {
                if generation != self.generation || self.state != LifecycleState::Starting {
                    return;
                }
                self.health.record_success(latency);
                self.recovery.on_healthy();
                self.diagnostic = None;
                self.transition(LifecycleState::Running);
                self.start_probing();
            }
            Message::ReadinessFailed { generation, fault } => {
                if generation == self.generation && self.state == LifecycleState::Starting {
                    self.fail(fault);
                }
            }
            Message::ProbeResult {
                generation,
                outcome,
            } => {
                if generation != self.generation || self.state != LifecycleState::Running {
                    return;
                }
                match outcome {
                    Ok(latency) => {
                        self.health.record_success(latency);
                        self.publish();
                    }
                    Err(e) => {
                        self.health.record_failure(e.to_string());
                        if self.health.is_unhealthy() {
                            self.fail(BackendFault::ProbeExhausted {
                                failures: self.health.consecutive_failures(),
                            });
                        } else {
                            self.publish();
                            self.emit(
                                SupervisorEventKind::HealthDegraded,
                                format!(
                                    "health probe failed ({}/{}): {}",
                                    self.health.consecutive_failures(),
                                    self.health.failure_threshold(),
                                    e
                                ),
                            );
                        }
                    }
                }
            }
            Message::Exited { generation, code } => {
                if generation != self.generation {
                    return;
                }
                match self.state {
                    LifecycleState::Starting => self.fail(BackendFault::ExitedBeforeReady { code }),
                    LifecycleState::Running => self.fail(BackendFault::Exited { code }),
                    _ => {}
                }
            }
            Message::LinkLost { generation, reason } => {
                if generation == self.generation
                    && matches!(self.state, LifecycleState::Starting | LifecycleState::Running)
                {
                    self.fail(BackendFault::LinkLost(reason));
                }
            }
            Message::RestartDue { generation } => {
                if generation == self.generation
                    && self.state == LifecycleState::Error
                    && !self.exhausted
                {
                    self.begin_session();
                }
            }
        }
    }

    fn begin_session(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let session = BackendSession::new();
        let session_id = session.id().clone();
        self.health.reset();
        self.diagnostic = match self.recovery.attempts() {
            0 => None,
            n => Some(format!(
                "backend restarting, retry {}/{}",
                n,
                self.recovery.policy().max_attempts
            )),
        };
        self.active = Some(ActiveSession {
            session,
            correlator: None,
            control: None,
        });
        tracing::info!(session = %session_id, generation, "Starting backend session");
        self.transition(LifecycleState::Starting);

        let launcher = Arc::clone(&self.launcher);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = launcher.launch(&session_id).await;
            let _ = tx.send(Message::Launched { generation, result });
        });
    }

    fn attach(&mut self, process: BackendProcess) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let generation = self.generation;
        let BackendProcess {
            link,
            exit,
            control,
        } = process;
        let correlator = Correlator::new(link, self.config.correlator_options(&active.session));

        let tx = self.tx.clone();
        let token = active.session.child_token();
        tokio::spawn(async move {
            tokio::select! {
                code = exit => {
                    let _ = tx.send(Message::Exited { generation, code: code.unwrap_or(None) });
                }
                _ = token.cancelled() => {}
            }
        });

        let tx = self.tx.clone();
        let token = active.session.child_token();
        let watched = correlator.clone();
        let signal = correlator.close_signal();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal.cancelled() => {
                    let reason = watched
                        .close_reason()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "link closed".to_string());
                    let _ = tx.send(Message::LinkLost { generation, reason });
                }
                _ = token.cancelled() => {}
            }
        });

        tokio::spawn(await_readiness(
            correlator.clone(),
            self.config.startup_grace,
            self.config.readiness_poll,
            active.session.child_token(),
            self.tx.clone(),
            generation,
        ));

        active.correlator = Some(correlator);
        active.control = Some(control);
        self.publish();
    }

    fn start_probing(&self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let Some(correlator) = active.correlator.clone() else {
            return;
        };
        let interval = self.config.probe_interval;
        let token = active.session.child_token();
        let tx = self.tx.clone();
        let generation = self.generation;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let sent = Instant::now();
                        let probe = correlator.send(Call::probe());
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let outcome = probe.response().await.map(|_| sent.elapsed());
                            let _ = tx.send(Message::ProbeResult { generation, outcome });
                        });
                    }
                }
            }
        });
    }

    /// 结束当前会话并按恢复策略决定是否安排重启
    fn fail(&mut self, fault: BackendFault) {
        let session = self.session_label();
        self.teardown(CallError::SessionEnded(session.clone()));
        tracing::warn!(session = %session, fault = %fault, "Backend session failed");

        match self.recovery.on_failure(&fault) {
            RecoveryAction::Restart {
                attempt,
                max,
                delay,
            } => {
                self.diagnostic = Some(format!(
                    "{fault}; restarting in {}ms (retry {attempt}/{max})",
                    delay.as_millis()
                ));
                self.transition(LifecycleState::Error);
                tracing::info!(
                    attempt,
                    max,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling backend restart"
                );
                let tx = self.tx.clone();
                let generation = self.generation;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Message::RestartDue { generation });
                });
            }
            RecoveryAction::Exhausted { attempts } => {
                self.exhausted = true;
                let diagnostic = format!(
                    "{fault}; gave up after {attempts} restart attempts, manual restart required"
                );
                self.diagnostic = Some(diagnostic.clone());
                self.transition(LifecycleState::Error);
                tracing::error!(attempts, "Backend restart attempts exhausted: {}", fault);
                self.emit(SupervisorEventKind::RestartExhausted, diagnostic);
            }
        }
    }

    fn manual_restart(&mut self) {
        if self.state == LifecycleState::Stopped {
            return;
        }
        tracing::info!(state = %self.state, "Manual backend restart requested");
        if matches!(self.state, LifecycleState::Starting | LifecycleState::Running) {
            self.transition(LifecycleState::Stopping);
            let session = self.session_label();
            self.teardown(CallError::SessionEnded(session));
        }
        self.recovery.reset_manual();
        self.exhausted = false;
        self.begin_session();
    }

    fn stop(&mut self) {
        if self.state == LifecycleState::Stopped {
            return;
        }
        self.transition(LifecycleState::Stopping);
        self.teardown(CallError::Cancelled);
        self.diagnostic = None;
        self.transition(LifecycleState::Stopped);
    }

    /// 挂起调用先全部失败，然后终止进程；之后才可能开始新会话
    fn teardown(&mut self, err: CallError) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.session.end();
        if let Some(correlator) = active.correlator.take() {
            correlator.close(err);
        }
        if let Some(mut control) = active.control.take() {
            control.terminate();
        }
    }

    fn session_label(&self) -> String {
        self.active
            .as_ref()
            .map(|a| a.session.id().to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    fn transition(&mut self, next: LifecycleState) {
        if self.state == next {
            self.publish();
            return;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!(from = %self.state, to = %next, "Ignoring invalid lifecycle transition");
            return;
        }
        tracing::info!(from = %self.state, to = %next, session = %self.session_label(), "Backend lifecycle changed");
        self.state = next;
        self.publish();
        let diagnostic = self
            .diagnostic
            .clone()
            .unwrap_or_else(|| default_diagnostic(next).to_string());
        self.emit(SupervisorEventKind::LifecycleStateChanged, diagnostic);
    }

    fn snapshot(&self) -> LifecycleSnapshot {
        LifecycleSnapshot {
            state: self.state,
            session: self.active.as_ref().map(|a| a.session.id().to_string()),
            restart_attempt: self.recovery.attempts(),
            max_attempts: self.recovery.policy().max_attempts,
            consecutive_failures: self.health.consecutive_failures(),
            last_probe_ok: self.health.last_probe_ok(),
            last_probe_latency_ms: self.health.last_latency().map(|d| d.as_millis() as u64),
            last_success_at: self.health.last_success_at().map(|t| t.timestamp_millis()),
            diagnostic: self.diagnostic.clone(),
            exhausted: self.exhausted,
        }
    }

    fn publish(&self) {
        let correlator = match self.state {
            LifecycleState::Running => self.active.as_ref().and_then(|a| a.correlator.clone()),
            _ => None,
        };
        self.view_tx.send_replace(View {
            snapshot: self.snapshot(),
            correlator,
        });
    }

    fn emit(&self, kind: SupervisorEventKind, diagnostic: String) {
        let _ = self.events.send(SupervisorEvent {
            kind,
            snapshot: self.snapshot(),
            diagnostic,
        });
    }
}

fn default_diagnostic(state: LifecycleState) -> &'static str {
    match state {
        LifecycleState::NotStarted => "backend not started",
        LifecycleState::Starting => "backend starting",
        LifecycleState::Running => "backend ready",
        LifecycleState::Stopping => "backend stopping",
        LifecycleState::Stopped => "backend stopped",
        LifecycleState::Error => "backend unavailable",
    }
}

/// 宽限期内反复探活，第一次成功即就绪
async fn await_readiness(
    correlator: Correlator,
    grace: Duration,
    poll: Duration,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<Message>,
    generation: u64,
) {
    let deadline = Instant::now() + grace;
    let probing = async {
        loop {
            let sent = Instant::now();
            match correlator.send(Call::probe()).response().await {
                Ok(_) => {
                    return Message::Ready {
                        generation,
                        latency: sent.elapsed(),
                    }
                }
                Err(e) => tracing::debug!(tag = %correlator.tag(), "Readiness probe failed: {}", e),
            }
            let next = Instant::now() + poll;
            if next >= deadline {
                return Message::ReadinessFailed {
                    generation,
                    fault: BackendFault::ReadinessTimeout { grace },
                };
            }
            tokio::time::sleep_until(next).await;
        }
    };

    tokio::select! {
        _ = token.cancelled() => {}
        outcome = tokio::time::timeout_at(deadline, probing) => {
            let message = outcome.unwrap_or(Message::ReadinessFailed {
                generation,
                fault: BackendFault::ReadinessTimeout { grace },
            });
            let _ = tx.send(message);
        }
    }
}
