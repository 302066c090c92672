//! 挂起调用表
//!
//! 请求 ID → 等待中的续体 + 截止时间。响应投递、超时清扫、主动取消、链路关闭四条路径
//! 共用同一把锁，并在锁内完成「查找-移除-发送」，保证每个 ID 恰好收到一次最终结果，
//! 且同一 ID 的分块按到达顺序送达。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::handle::CallEvent;
use crate::core::error::CallError;
use crate::protocol::{CallId, RequestKind, Response};

struct PendingCall {
    kind: RequestKind,
    timeout: Duration,
    deadline: Instant,
    tx: mpsc::UnboundedSender<CallEvent>,
}

/// 一次响应投递的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// 中间块，调用仍挂起
    Chunk,
    /// 最终响应，已移除
    Final,
    /// 表中没有该 ID（已完成、已取消、已超时或来自旧会话）
    Unknown,
}

#[derive(Default)]
pub struct PendingTable {
    calls: Mutex<HashMap<CallId, PendingCall>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallId, PendingCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 登记新调用；ID 已存在时拒绝
    pub fn register(
        &self,
        id: CallId,
        kind: RequestKind,
        timeout: Duration,
        tx: mpsc::UnboundedSender<CallEvent>,
    ) -> bool {
        let mut calls = self.lock();
        if calls.contains_key(&id) {
            return false;
        }
        calls.insert(
            id,
            PendingCall {
                kind,
                timeout,
                deadline: Instant::now() + timeout,
                tx,
            },
        );
        true
    }

    /// 投递一条响应。中间块刷新截止时间；最终响应（或失败响应）移除条目
    pub fn deliver(&self, response: Response) -> Delivery {
        let mut calls = self.lock();
        if !response.terminates() {
            let Some(call) = calls.get_mut(&response.id) else {
                return Delivery::Unknown;
            };
            call.deadline = Instant::now() + call.timeout;
            let _ = call
                .tx
                .send(CallEvent::Chunk(response.payload.unwrap_or_default()));
            return Delivery::Chunk;
        }

        let Some(call) = calls.remove(&response.id) else {
            return Delivery::Unknown;
        };
        let result = if response.success {
            Ok(response.payload.unwrap_or_default())
        } else {
            Err(CallError::Remote(
                response.error.unwrap_or_else(|| "unknown backend error".to_string()),
            ))
        };
        let _ = call.tx.send(CallEvent::Final(result));
        Delivery::Final
    }

    /// 以给定错误结束单个调用；不存在时返回 false
    pub fn fail(&self, id: &CallId, err: CallError) -> bool {
        let mut calls = self.lock();
        match calls.remove(id) {
            Some(call) => {
                let _ = call.tx.send(CallEvent::Final(Err(err)));
                true
            }
            None => false,
        }
    }

    /// 取消（幂等）
    pub fn cancel(&self, id: &CallId) -> bool {
        self.fail(id, CallError::Cancelled)
    }

    /// 结束所有截止时间不晚于 `now` 的调用，返回被超时的 ID 与类型
    pub fn expire(&self, now: Instant) -> Vec<(CallId, RequestKind)> {
        let mut calls = self.lock();
        let due: Vec<CallId> = calls
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for id in due {
            if let Some(call) = calls.remove(&id) {
                let err = CallError::Timeout {
                    id: id.clone(),
                    after: call.timeout,
                };
                let _ = call.tx.send(CallEvent::Final(Err(err)));
                expired.push((id, call.kind));
            }
        }
        expired
    }

    /// 以同一错误结束全部调用（链路关闭、会话结束）
    pub fn fail_all(&self, err: &CallError) -> usize {
        let mut calls = self.lock();
        let count = calls.len();
        for (_, call) in calls.drain() {
            let _ = call.tx.send(CallEvent::Final(Err(err.clone())));
        }
        count
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().values().map(|call| call.deadline).min()
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
