//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__RESTART__MAX_ATTEMPTS=5`）。
//! 所有字段都有默认值，空文件即合法配置。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::error::SupervisorError;
use crate::core::recovery::RestartPolicy;
use crate::correlation::{CorrelatorOptions, TimeoutPolicy};
use crate::protocol::ContextBundle;

/// 指定配置文件路径的环境变量
pub const CONFIG_PATH_ENV: &str = "HIVE_CONFIG";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendSection,
    pub timeouts: TimeoutsSection,
    pub health: HealthSection,
    pub restart: RestartSection,
    pub context: ContextSection,
    pub transport: TransportSection,
}

/// 与后端之间的传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// 子进程 stdin/stdout
    Stdio,
    /// 子进程启动后连接 endpoint
    Tcp,
}

/// [backend] 段：后端启动命令、传输方式与就绪等待
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    /// 可执行程序（也可以是 docker 等容器运行时）
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub transport: TransportKind,
    /// transport = "tcp" 时使用
    pub endpoint: Option<String>,
    /// 启动后必须在此时间内探活成功
    pub startup_grace_ms: u64,
    /// 就绪等待期间的探活间隔
    pub readiness_poll_ms: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            command: "hive-backend".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            transport: TransportKind::Stdio,
            endpoint: None,
            startup_grace_ms: 60_000,
            readiness_poll_ms: 500,
        }
    }
}

impl BackendSection {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }
}

/// [timeouts] 段：各请求类型的截止时间（毫秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub liveness_probe: u64,
    pub interactive_message: u64,
    pub structured_operation: u64,
    pub privileged_command: u64,
    pub file_operation: u64,
    pub context_update: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            liveness_probe: 5_000,
            interactive_message: 300_000,
            structured_operation: 120_000,
            privileged_command: 120_000,
            file_operation: 30_000,
            context_update: 10_000,
        }
    }
}

impl TimeoutsSection {
    pub fn policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            liveness_probe: Duration::from_millis(self.liveness_probe),
            interactive_message: Duration::from_millis(self.interactive_message),
            structured_operation: Duration::from_millis(self.structured_operation),
            privileged_command: Duration::from_millis(self.privileged_command),
            file_operation: Duration::from_millis(self.file_operation),
            context_update: Duration::from_millis(self.context_update),
        }
    }

    fn all(&self) -> [(&'static str, u64); 6] {
        [
            ("liveness_probe", self.liveness_probe),
            ("interactive_message", self.interactive_message),
            ("structured_operation", self.structured_operation),
            ("privileged_command", self.privileged_command),
            ("file_operation", self.file_operation),
            ("context_update", self.context_update),
        ]
    }
}

/// [health] 段：周期探活
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub probe_interval_ms: u64,
    /// 连续失败多少次判定不健康
    pub failure_threshold: u32,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
            failure_threshold: 3,
        }
    }
}

impl HealthSection {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// [restart] 段：自动重启预算与退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestartSection {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for RestartSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
        }
    }
}

impl RestartSection {
    pub fn policy(&self) -> RestartPolicy {
        RestartPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
            max_attempts: self.max_attempts,
        }
    }
}

/// [context] 段：上下文快照大小上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub max_bytes: usize,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self { max_bytes: 256 * 1024 }
    }
}

/// [transport] 段：单帧大小上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub max_frame_bytes: usize,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

impl AppConfig {
    /// 拒绝会让监管逻辑失效的取值
    pub fn validate(&self) -> Result<(), SupervisorError> {
        let invalid = |msg: String| Err(SupervisorError::Config(msg));

        if self.backend.command.trim().is_empty() {
            return invalid("backend.command must not be empty".to_string());
        }
        if self.backend.transport == TransportKind::Tcp
            && self.backend.endpoint.as_deref().map_or(true, |e| e.trim().is_empty())
        {
            return invalid("backend.endpoint is required when transport = \"tcp\"".to_string());
        }
        if self.backend.startup_grace_ms == 0 || self.backend.readiness_poll_ms == 0 {
            return invalid("backend.startup_grace_ms and readiness_poll_ms must be > 0".to_string());
        }
        for (name, value) in self.timeouts.all() {
            if value == 0 {
                return invalid(format!("timeouts.{name} must be > 0"));
            }
        }
        if self.health.probe_interval_ms == 0 {
            return invalid("health.probe_interval_ms must be > 0".to_string());
        }
        if self.health.failure_threshold == 0 {
            return invalid("health.failure_threshold must be > 0".to_string());
        }
        if self.restart.backoff_base_ms == 0 {
            return invalid("restart.backoff_base_ms must be > 0".to_string());
        }
        if self.restart.backoff_cap_ms < self.restart.backoff_base_ms {
            return invalid("restart.backoff_cap_ms must be >= backoff_base_ms".to_string());
        }
        if self.transport.max_frame_bytes == 0 {
            return invalid("transport.max_frame_bytes must be > 0".to_string());
        }
        let floor = ContextBundle::minimal().encoded_len();
        if self.context.max_bytes < floor {
            return invalid(format!("context.max_bytes must be >= {floor} (an empty truncated bundle)"));
        }
        if self.context.max_bytes > self.transport.max_frame_bytes {
            return invalid("context.max_bytes must not exceed transport.max_frame_bytes".to_string());
        }
        Ok(())
    }

    /// 关联层参数（tag 由调用方决定）
    pub fn correlator_options(&self) -> CorrelatorOptions {
        CorrelatorOptions {
            tag: None,
            timeouts: self.timeouts.policy(),
            max_frame_bytes: self.transport.max_frame_bytes,
            max_context_bytes: self.context.max_bytes,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 读取 HIVE_CONFIG 指定的文件并校验
pub fn load_from_env() -> anyhow::Result<AppConfig> {
    let path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
    let config = load_config(path)?;
    config.validate()?;
    Ok(config)
}
