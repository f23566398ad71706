//! Where crash logs go and what happens after one is written.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use nix::sys::signal::Signal;

/// Placeholder replaced by the crash time in filename templates.
pub const TIMESTAMP_PLACEHOLDER: &str = "{timestamp}";

pub const DEFAULT_FILENAME: &str = "crash_{timestamp}.txt";

/// Signals hooked unless configured otherwise.
pub const DEFAULT_SIGNALS: [Signal; 3] = [Signal::SIGABRT, Signal::SIGSEGV, Signal::SIGILL];

/// Called once with the path of a freshly written crash log.
pub type OnWriteCallback = Box<dyn Fn(&Path) + Send + Sync>;

/// Settings frozen when monitoring begins.
pub struct CrashLogConfig {
    /// Output directory. Empty means the working directory.
    pub folder: PathBuf,
    /// Filename template, see [`TIMESTAMP_PLACEHOLDER`].
    pub filename: String,
    pub on_write: Option<OnWriteCallback>,
    pub signals: Vec<Signal>,
    /// Treat every panic as fatal and log it.
    ///
    /// The hook cannot tell whether a panic would have been caught, so with
    /// this on a panic inside `catch_unwind`, a thread whose `join` would have
    /// returned `Err`, or an async task also ends the process. Turn it off in
    /// hosts that recover from panics.
    pub capture_panics: bool,
    /// Give the thread calling `begin_monitoring` a dedicated signal stack.
    pub alt_stack: bool,
}

impl CrashLogConfig {
    pub fn new() -> Self {
        Self {
            folder: PathBuf::new(),
            filename: DEFAULT_FILENAME.to_string(),
            on_write: None,
            signals: DEFAULT_SIGNALS.to_vec(),
            capture_panics: true,
            alt_stack: true,
        }
    }

    pub fn with_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.folder = folder.into();
        self
    }

    pub fn with_filename(mut self, template: impl Into<String>) -> Self {
        self.filename = template.into();
        self
    }

    pub fn with_on_write(mut self, callback: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.on_write = Some(Box::new(callback));
        self
    }

    pub fn with_signals(mut self, signals: impl IntoIterator<Item = Signal>) -> Self {
        self.signals = signals.into_iter().collect();
        self
    }

    pub fn with_capture_panics(mut self, capture_panics: bool) -> Self {
        self.capture_panics = capture_panics;
        self
    }

    pub fn with_alt_stack(mut self, alt_stack: bool) -> Self {
        self.alt_stack = alt_stack;
        self
    }

    /// Full path of the log for a crash at `now`.
    pub fn log_path(&self, now: DateTime<Local>) -> PathBuf {
        self.folder
            .join(expand_filename(&self.filename, &format_timestamp(now)))
    }
}

impl Default for CrashLogConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CrashLogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrashLogConfig")
            .field("folder", &self.folder)
            .field("filename", &self.filename)
            .field("on_write", &self.on_write.is_some())
            .field("signals", &self.signals)
            .field("capture_panics", &self.capture_panics)
            .field("alt_stack", &self.alt_stack)
            .finish()
    }
}

/// Local time as `YYYY-MM-DD-HH-MM-SS`.
pub fn format_timestamp(now: DateTime<Local>) -> String {
    now.format("%Y-%m-%d-%H-%M-%S").to_string()
}

/// Replaces every occurrence of [`TIMESTAMP_PLACEHOLDER`] in `template`.
pub fn expand_filename(template: &str, timestamp: &str) -> String {
    template.replace(TIMESTAMP_PLACEHOLDER, timestamp)
}
