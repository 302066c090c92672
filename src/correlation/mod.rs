//! 关联层：请求/响应匹配、流式分块、超时与取消
//!
//! - **pending**: 挂起调用表（唯一持有续体的结构）
//! - **handle**: 调用描述、按类型的超时策略、CallHandle
//! - **bus**: Correlator，链路之上的收发循环与超时清扫
//! - **handler**: 服务对端请求的 RequestHandler / Responder

mod bus;
mod handle;
mod handler;
pub mod pending;

pub use bus::{Correlator, CorrelatorOptions};
pub use handle::{Call, CallCanceller, CallEvent, CallHandle, CallOutcome, TimeoutPolicy};
pub use handler::{RequestHandler, Responder};
pub use pending::{Delivery, PendingTable};
