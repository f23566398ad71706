//! Error taxonomy for crash-monitor setup.
//!
//! Only setup can fail loudly. Once a fault is being handled nothing is
//! reported back to the application.

use nix::errno;
use thiserror::Error;

/// Unified result type across the crashlog core.
pub type CrashLogResult<T> = Result<T, CrashLogError>;

/// Error cases
#[derive(Debug, Error)]
pub enum CrashLogError {
    /// `begin_monitoring` was already called in this process.
    #[error("crash monitoring has already begun")]
    AlreadyMonitoring,

    #[error("system call failed: {0}")]
    SysCall(#[from] errno::Errno),

    #[error("failed to start the monitor thread: {0}")]
    Io(#[from] std::io::Error),

    #[error("alternate signal stack: {0}")]
    AltStack(&'static str),

    #[error("failed to register the normal-exit hook")]
    ExitHook,
}
