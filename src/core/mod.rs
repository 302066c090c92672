//! 核心层：错误分类与恢复、生命周期状态、后端会话、优雅关闭

pub mod error;
pub mod recovery;
pub mod session;
pub mod shutdown;
pub mod state;

pub use error::{BackendFault, CallError, FailureClass, SupervisorError};
pub use recovery::{RecoveryAction, RecoveryEngine, RestartPolicy};
pub use session::{BackendSession, SessionId};
pub use shutdown::{ShutdownCoordinator, ShutdownManager, ShutdownReason, SupervisorCleanup};
pub use state::{LifecycleSnapshot, LifecycleState};
