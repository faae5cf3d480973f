//! 核心层：错误分类与恢复、任务取消、优雅关闭

pub mod cancel;
pub mod error;
pub mod recovery;
pub mod shutdown;

pub use cancel::CancelRegistry;
pub use error::{AgentError, EngineError, MemoryError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use shutdown::{
    BackgroundLoopsCleanup, BatchFlushCleanup, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
