//! 错误恢复引擎
//!
//! 根据后端故障返回 RecoveryAction：在重试预算内按指数退避安排重启，预算耗尽后停在 Error 等待人工介入。

use std::time::Duration;

use crate::core::error::BackendFault;

/// 重启退避策略：第 n 次重启前等待 min(base · 2^(n-1), cap)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RestartPolicy {
    /// attempt 从 1 开始
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base.checked_mul(factor).unwrap_or(self.cap).min(self.cap)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

/// 恢复动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待 delay 后发起第 attempt 次重启
    Restart {
        attempt: u32,
        max: u32,
        delay: Duration,
    },
    /// 重试预算耗尽
    Exhausted { attempts: u32 },
}

/// 连续故障计数与退避决策
#[derive(Debug)]
pub struct RecoveryEngine {
    policy: RestartPolicy,
    attempts: u32,
    last_fault: Option<BackendFault>,
}

impl RecoveryEngine {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            last_fault: None,
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// 已消耗的重启次数
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_fault(&self) -> Option<&BackendFault> {
        self.last_fault.as_ref()
    }

    /// 记录一次故障并决定下一步
    pub fn on_failure(&mut self, fault: &BackendFault) -> RecoveryAction {
        self.last_fault = Some(fault.clone());
        if self.attempts >= self.policy.max_attempts {
            return RecoveryAction::Exhausted {
                attempts: self.attempts,
            };
        }
        self.attempts += 1;
        RecoveryAction::Restart {
            attempt: self.attempts,
            max: self.policy.max_attempts,
            delay: self.policy.delay_for(self.attempts),
        }
    }

    /// 后端进入 Running：连续故障清零
    pub fn on_healthy(&mut self) {
        self.attempts = 0;
        self.last_fault = None;
    }

    /// 人工重启：恢复完整的重试预算
    pub fn reset_manual(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, cap_ms: u64, max: u32) -> RestartPolicy {
        RestartPolicy {
            base: Duration::from_millis(base_ms),
            cap: Duration::from_millis(cap_ms),
            max_attempts: max,
        }
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let p = policy(100, 1000, 10);
        let delays: Vec<u64> = (1..=6).map(|n| p.delay_for(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(p.delay_for(200), Duration::from_millis(1000));
    }

    #[test]
    fn test_exhausted_after_max_attempts() {
        let mut engine = RecoveryEngine::new(policy(1000, 30_000, 3));
        let fault = BackendFault::ExitedBeforeReady { code: Some(1) };

        let mut delays = Vec::new();
        for _ in 0..3 {
            match engine.on_failure(&fault) {
                RecoveryAction::Restart { delay, .. } => delays.push(delay),
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(
            engine.on_failure(&fault),
            RecoveryAction::Exhausted { attempts: 3 }
        );
        // 耗尽后保持耗尽
        assert_eq!(
            engine.on_failure(&fault),
            RecoveryAction::Exhausted { attempts: 3 }
        );
    }

    #[test]
    fn test_healthy_resets_budget() {
        let mut engine = RecoveryEngine::new(policy(10, 100, 2));
        let fault = BackendFault::ProbeExhausted { failures: 3 };
        engine.on_failure(&fault);
        engine.on_failure(&fault);
        engine.on_healthy();
        assert_eq!(engine.attempts(), 0);
        assert!(matches!(
            engine.on_failure(&fault),
            RecoveryAction::Restart { attempt: 1, .. }
        ));
    }

    #[test]
    fn test_manual_reset_after_exhaustion() {
        let mut engine = RecoveryEngine::new(policy(10, 100, 1));
        let fault = BackendFault::LaunchFailed("no such file".into());
        engine.on_failure(&fault);
        assert!(matches!(engine.on_failure(&fault), RecoveryAction::Exhausted { .. }));
        engine.reset_manual();
        assert!(matches!(
            engine.on_failure(&fault),
            RecoveryAction::Restart { attempt: 1, .. }
        ));
        assert_eq!(engine.last_fault(), Some(&fault));
    }
}
