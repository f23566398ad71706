//! Core library facade for crashlog.
//!
//! Call [`begin_monitoring`] once at startup. From then on any fatal signal
//! (`SIGABRT`, `SIGSEGV`, `SIGILL` by default), stack overflow or uncaught
//! panic leaves a timestamped text file holding a stack trace before the
//! process dies:
//!
//! ```no_run
//! libcrashlog::set_crashlog_folder("./crash_logs");
//! libcrashlog::set_crashlog_header_message("my-app 1.0.0");
//! libcrashlog::begin_monitoring()?;
//! # Ok::<(), libcrashlog::CrashLogError>(())
//! ```

pub mod config;
pub mod context;
pub mod errors;
pub mod hooks;
pub mod report;
pub mod status;
pub mod trace;

use std::path::{Path, PathBuf};
use std::sync::PoisonError;

pub use config::{CrashLogConfig, OnWriteCallback};
pub use errors::{CrashLogError, CrashLogResult};
pub use hooks::{begin_monitoring_with, install_alt_stack};
pub use status::ProgramStatus;

use hooks::{CONTEXT, PENDING_CONFIG};

/// Starts monitoring with the settings made through the `set_crashlog_*`
/// functions. Call those first; changes made afterwards are not seen.
///
/// Panics are captured by default, so a panic caught with `catch_unwind` or
/// surfacing through `JoinHandle::join` still ends the process. Use
/// [`begin_monitoring_with`] and [`CrashLogConfig::with_capture_panics`] to
/// opt out.
pub fn begin_monitoring() -> CrashLogResult<()> {
    let config = PENDING_CONFIG
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .unwrap_or_default();
    begin_monitoring_with(config)
}

fn update_pending(update: impl FnOnce(&mut CrashLogConfig)) {
    let mut pending = PENDING_CONFIG.lock().unwrap_or_else(PoisonError::into_inner);
    update(pending.get_or_insert_with(CrashLogConfig::new));
}

/// Folder crash logs are saved in, created on demand when a crash happens.
pub fn set_crashlog_folder(folder: impl Into<PathBuf>) {
    let folder = folder.into();
    update_pending(|config| config.folder = folder);
}

/// Filename template, default `crash_{timestamp}.txt`.
pub fn set_crashlog_filename(template: impl Into<String>) {
    let template = template.into();
    update_pending(|config| config.filename = template);
}

/// Called with the full path of the crash log right after it is written.
pub fn set_on_write_crashlog_callback(callback: impl Fn(&Path) + Send + Sync + 'static) {
    update_pending(|config| config.on_write = Some(Box::new(callback)));
}

/// The most recent header is printed on the first line of the crash log.
/// Ignored once a crash is being handled.
pub fn set_crashlog_header_message(message: impl Into<String>) {
    CONTEXT.set_header_message(message);
}

/// The header that would go into a crash log written now.
pub fn get_crashlog_header_message() -> String {
    CONTEXT.header_message()
}

/// Where the process is in the crash state machine.
pub fn program_status() -> ProgramStatus {
    CONTEXT.status()
}

/// Exposes the crate version for CLI reporting.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
