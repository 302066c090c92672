//! 健康监测：周期探活结果的连续失败计数
//!
//! 只在 Running 状态下喂入探活结果；任一次成功清零，连续失败达到阈值即判定不健康。

use std::time::Duration;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// 尚未探活
    Unknown,
    Healthy,
    /// 有失败但未达阈值
    Degraded { failures: u32 },
    Unhealthy { failures: u32 },
}

#[derive(Debug)]
pub struct HealthMonitor {
    failure_threshold: u32,
    consecutive_failures: u32,
    last_probe_ok: Option<bool>,
    last_latency: Option<Duration>,
    last_success_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl HealthMonitor {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            consecutive_failures: 0,
            last_probe_ok: None,
            last_latency: None,
            last_success_at: None,
            last_error: None,
        }
    }

    pub fn record_success(&mut self, latency: Duration) {
        self.consecutive_failures = 0;
        self.last_probe_ok = Some(true);
        self.last_latency = Some(latency);
        self.last_success_at = Some(Utc::now());
        self.last_error = None;
        tracing::debug!(latency_ms = latency.as_millis() as u64, "Health probe succeeded");
    }

    /// 记录一次失败，返回当前状态
    pub fn record_failure(&mut self, error: impl Into<String>) -> HealthStatus {
        let error = error.into();
        self.consecutive_failures += 1;
        self.last_probe_ok = Some(false);
        tracing::warn!(
            failures = self.consecutive_failures,
            threshold = self.failure_threshold,
            "Health probe failed: {}",
            error
        );
        self.last_error = Some(error);
        self.status()
    }

    pub fn status(&self) -> HealthStatus {
        match (self.last_probe_ok, self.consecutive_failures) {
            (None, _) => HealthStatus::Unknown,
            (_, 0) => HealthStatus::Healthy,
            (_, n) if n >= self.failure_threshold => HealthStatus::Unhealthy { failures: n },
            (_, n) => HealthStatus::Degraded { failures: n },
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self.status(), HealthStatus::Unhealthy { .. })
    }

    /// 新会话开始时清空
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.last_probe_ok = None;
        self.last_latency = None;
        self.last_error = None;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn last_probe_ok(&self) -> Option<bool> {
        self.last_probe_ok
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.last_latency
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.last_success_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}
