//! 线路协议：报文、上下文快照、JSON Lines 编解码

pub mod codec;
pub mod context;
pub mod envelope;

pub use codec::{CodecError, EnvelopeCodec, Frame};
pub use context::{BufferSnapshot, ContextBundle, CursorPosition, Diagnostic, OpenFile, RecentEdit};
pub use envelope::{CallId, Envelope, Notification, Request, RequestKind, Response};
