//! Runs the driver binary once per fault class and inspects what it leaves
//! behind.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn trigger(fault: &str, folder: &Path, extra: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_crashlog"))
        .arg("trigger")
        .arg(fault)
        .arg("--folder")
        .arg(folder)
        .args(extra)
        .output()
        .expect("failed to spawn crashlog")
}

fn files_in(folder: &Path) -> Vec<PathBuf> {
    match fs::read_dir(folder) {
        Ok(entries) => entries.map(|entry| entry.unwrap().path()).collect(),
        Err(_) => vec![],
    }
}

/// `YYYY-MM-DD-HH-MM-SS`
fn is_timestamp(s: &str) -> bool {
    s.len() == 19
        && s.char_indices().all(|(i, c)| match i {
            4 | 7 | 10 | 13 | 16 => c == '-',
            _ => c.is_ascii_digit(),
        })
}

/// Asserts the process died from a hook and left exactly one default-named
/// log, and returns that log's contents.
fn single_crash_log(output: &Output, folder: &Path) -> String {
    assert_eq!(
        output.status.code(),
        Some(1),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let logs = files_in(folder);
    assert_eq!(logs.len(), 1, "{logs:?}");

    let name = logs[0].file_name().unwrap().to_str().unwrap();
    let stamp = name
        .strip_prefix("crash_")
        .and_then(|rest| rest.strip_suffix(".txt"))
        .unwrap_or_else(|| panic!("unexpected log name {name}"));
    assert!(is_timestamp(stamp), "{name}");

    let text = fs::read_to_string(&logs[0]).unwrap();
    assert!(text.lines().count() > 1, "{text}");
    text
}

fn signal_line(signal: libc::c_int, name: &str) -> String {
    format!("Received signal {signal} {name}")
}

#[test]
fn abort_names_sigabrt() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("test_logs");
    let text = single_crash_log(&trigger("abort", &folder, &[]), &folder);
    assert_eq!(text.lines().next().unwrap(), signal_line(libc::SIGABRT, "SIGABRT"));
}

#[test]
fn segfault_names_sigsegv() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("test_logs");
    let text = single_crash_log(&trigger("segfault", &folder, &[]), &folder);
    assert!(text.contains(&signal_line(libc::SIGSEGV, "SIGSEGV")), "{text}");
}

#[test]
fn illegal_instruction_names_sigill() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("test_logs");
    let text = single_crash_log(&trigger("illegalinstruction", &folder, &[]), &folder);
    assert!(text.contains(&signal_line(libc::SIGILL, "SIGILL")), "{text}");
}

#[test]
fn fault_names_ignore_case() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("test_logs");
    let text = single_crash_log(&trigger("Abort", &folder, &[]), &folder);
    assert!(text.contains("SIGABRT"), "{text}");
}

#[test]
fn uncaught_panic_has_no_signal_line() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("test_logs");
    let text = single_crash_log(&trigger("unhandledexception", &folder, &[]), &folder);
    assert!(!text.contains("Received signal"), "{text}");
    let first = text.lines().next().unwrap();
    assert!(first.starts_with("Panicked at "), "{first}");
    assert!(first.ends_with(": Whoops"), "{first}");
}

#[test]
fn terminate_is_logged_as_a_panic() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("test_logs");
    let text = single_crash_log(&trigger("terminate", &folder, &[]), &folder);
    assert!(!text.contains("Received signal"), "{text}");
    let first = text.lines().next().unwrap();
    assert!(first.starts_with("Panicked at "), "{first}");
    assert!(first.contains("main.rs:"), "{first}");
    assert!(first.ends_with(": terminate-path"), "{first}");
    assert!(!text.contains("Whoops"), "{text}");
}

#[test]
fn stack_overflow_still_gets_a_trace() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("test_logs");
    let text = single_crash_log(&trigger("stackoverflow", &folder, &[]), &folder);
    assert!(text.contains(&signal_line(libc::SIGSEGV, "SIGSEGV")), "{text}");
    assert!(text.contains("overflow_stack"), "{text}");
}

#[test]
fn header_is_the_first_line() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("test_logs");
    let output = trigger("abort", &folder, &["--header", "crashlog self-test 1.0"]);
    let text = single_crash_log(&output, &folder);
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("crashlog self-test 1.0"));
    assert_eq!(lines.next().unwrap(), signal_line(libc::SIGABRT, "SIGABRT"));
}

#[test]
fn callback_reports_the_written_path() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("test_logs");
    let output = trigger("abort", &folder, &[]);
    single_crash_log(&output, &folder);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let logs = files_in(&folder);
    assert!(
        stderr.contains(&format!("Crash log written to {}", logs[0].display())),
        "{stderr}"
    );
}

#[test]
fn custom_template_replaces_every_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("test_logs");
    let output = trigger(
        "abort",
        &folder,
        &["--filename", "{timestamp}_app_{timestamp}.log"],
    );
    assert_eq!(output.status.code(), Some(1));

    let logs = files_in(&folder);
    assert_eq!(logs.len(), 1);
    let name = logs[0].file_name().unwrap().to_str().unwrap();
    let (first, second) = name
        .strip_suffix(".log")
        .and_then(|stem| stem.split_once("_app_"))
        .unwrap_or_else(|| panic!("unexpected log name {name}"));
    assert!(is_timestamp(first) && is_timestamp(second), "{name}");
}

#[test]
fn normal_exit_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("test_logs");
    let output = trigger("none", &folder, &[]);
    assert!(output.status.success(), "{output:?}");
    assert!(files_in(&folder).is_empty());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Exiting normally"));
}

#[test]
fn unknown_fault_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let output = trigger("meltdown", dir.path(), &[]);
    assert_eq!(output.status.code(), Some(2));
    assert!(files_in(dir.path()).is_empty());
}

#[test]
fn version_subcommand() {
    let output = Command::new(env!("CARGO_BIN_EXE_crashlog"))
        .arg("version")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        format!("crashlog {}", libcrashlog::version())
    );
}
