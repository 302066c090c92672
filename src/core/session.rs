//! 后端会话：一次后端进程生命周期
//!
//! 持有 CancellationToken，会话结束时取消；就绪等待、周期探活、退出监视等任务都用子 token，随会话一起结束。

use std::fmt;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// 会话 ID：`s` + 8 位十六进制
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("s{}", &id[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub struct BackendSession {
    id: SessionId,
    started_at: DateTime<Utc>,
    cancel_token: CancellationToken,
}

impl BackendSession {
    pub fn new() -> Self {
        Self {
            id: SessionId::generate(),
            started_at: Utc::now(),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// 结束会话
    pub fn end(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_ended(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 创建子 token（用于会话内的单个任务）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

impl Default for BackendSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_distinct() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with('s'));
        assert_eq!(a.as_str().len(), 9);
    }

    #[test]
    fn test_end_cancels_children() {
        let session = BackendSession::new();
        let child = session.child_token();
        assert!(!session.is_ended());
        session.end();
        assert!(child.is_cancelled());
        assert!(session.is_ended());
    }
}
