//! Crash log layout and the file write.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use chrono::Local;

use crate::config::CrashLogConfig;
use crate::trace::ResolvedTrace;

/// Everything that goes into one crash log.
#[derive(Debug, Clone, Default)]
pub struct CrashReport {
    pub header: String,
    /// Signal number, `0` when the crash did not come from a signal.
    pub fault_id: i32,
    pub panic_message: Option<String>,
    pub trace: ResolvedTrace,
}

/// Name of a standard C signal, or `""` for anything else.
pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGTERM => "SIGTERM",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGINT => "SIGINT",
        libc::SIGILL => "SIGILL",
        libc::SIGABRT => "SIGABRT",
        libc::SIGFPE => "SIGFPE",
        _ => "",
    }
}

/// Writes `report` in crash log layout.
pub fn write_report<W: Write>(out: &mut W, report: &CrashReport) -> io::Result<()> {
    if !report.header.is_empty() {
        writeln!(out, "{}", report.header)?;
    }
    if report.fault_id != 0 {
        writeln!(
            out,
            "Received signal {} {}",
            report.fault_id,
            signal_name(report.fault_id)
        )?;
    }
    if let Some(message) = &report.panic_message {
        writeln!(out, "Panicked at {message}")?;
    }
    write!(out, "{}", report.trace)?;
    out.flush()
}

/// Writes the crash log for `report` and returns its path.
///
/// A missing output folder is created first; failure to do so is ignored and
/// surfaces as a failed file create instead.
pub fn write_crash_log(config: &CrashLogConfig, report: &CrashReport) -> io::Result<PathBuf> {
    let path = config.log_path(Local::now());
    if !config.folder.as_os_str().is_empty() {
        let _ = fs::create_dir_all(&config.folder);
    }
    let mut log = BufWriter::new(File::create(&path)?);
    write_report(&mut log, report)?;
    log.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(path)
}
