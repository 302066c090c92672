//! 线路报文定义
//!
//! 两跳（编辑器 ↔ 监管进程、监管进程 ↔ 后端）共用同一组报文：
//! Request / Response / Notification / Cancel，以 `type` 字段区分。

use std::fmt;

use serde::{Deserialize, Serialize};

use super::context::ContextBundle;

/// 关联 ID：`<会话标签>-<序号>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// 请求类型（可扩展）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    /// 对话消息（通常流式返回）
    InteractiveMessage,
    /// 结构化文档操作
    StructuredOperation,
    /// 需要用户批准的命令
    PrivilegedCommand,
    FileOperation,
    /// 探活（只用于确认后端可响应）
    LivenessProbe,
    /// 推送最新编辑器上下文
    ContextUpdate,
}

impl RequestKind {
    pub const ALL: [RequestKind; 6] = [
        RequestKind::InteractiveMessage,
        RequestKind::StructuredOperation,
        RequestKind::PrivilegedCommand,
        RequestKind::FileOperation,
        RequestKind::LivenessProbe,
        RequestKind::ContextUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::InteractiveMessage => "interactive-message",
            RequestKind::StructuredOperation => "structured-operation",
            RequestKind::PrivilegedCommand => "privileged-command",
            RequestKind::FileOperation => "file-operation",
            RequestKind::LivenessProbe => "liveness-probe",
            RequestKind::ContextUpdate => "context-update",
        }
    }

    /// Gateway 发起该类请求时是否附带上下文快照
    pub fn wants_context(&self) -> bool {
        matches!(
            self,
            RequestKind::InteractiveMessage | RequestKind::StructuredOperation
        )
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 出站请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: CallId,
    pub kind: RequestKind,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextBundle>,
    /// 创建时间（毫秒时间戳）
    pub timestamp: i64,
}

/// 响应；一个请求可以有零到多个中间块，再加恰好一个最终响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: CallId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl Response {
    pub fn chunk(id: CallId, payload: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            payload: Some(payload),
            error: None,
            is_final: false,
        }
    }

    pub fn ok(id: CallId, payload: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            payload: Some(payload),
            error: None,
            is_final: true,
        }
    }

    pub fn failure(id: CallId, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            payload: None,
            error: Some(error.into()),
            is_final: true,
        }
    }

    /// 失败响应一律视为终止，即使 final = false
    pub fn terminates(&self) -> bool {
        self.is_final || !self.success
    }
}

/// 单向推送（无需响应）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

impl Notification {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: now_millis(),
        }
    }
}

/// 线路上的一帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Notification(Notification),
    /// 通知对端放弃该请求的处理
    Cancel { id: CallId },
}

impl Envelope {
    pub fn label(&self) -> &'static str {
        match self {
            Envelope::Request(_) => "request",
            Envelope::Response(_) => "response",
            Envelope::Notification(_) => "notification",
            Envelope::Cancel { .. } => "cancel",
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
