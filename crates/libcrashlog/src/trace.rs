//! Stack trace capture and formatting.
//!
//! Capturing and resolving run on different threads. The faulting thread only
//! records raw instruction pointers into a fixed buffer
//! (no allocation, no locks, little stack), and the monitor thread later turns
//! them into symbol names on its own healthy stack.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Frames kept from a single capture. Deeper stacks are truncated.
pub const MAX_FRAMES: usize = 256;

/// In-place storage for one captured trace.
pub struct TraceSlot {
    ips: UnsafeCell<[usize; MAX_FRAMES]>,
    len: AtomicUsize,
}

// SAFETY: the buffer is written once by the crashing thread before the status
// handoff and read by the monitor thread after it; `capture` and `frames`
// document that contract.
unsafe impl Sync for TraceSlot {}

impl TraceSlot {
    pub const fn new() -> Self {
        Self {
            ips: UnsafeCell::new([0; MAX_FRAMES]),
            len: AtomicUsize::new(0),
        }
    }

    /// Records the calling thread's stack.
    ///
    /// Async-signal-safe as far as the platform unwinder is: nothing here
    /// allocates or takes a lock.
    ///
    /// # Safety
    ///
    /// No other thread may call `capture` or read `frames` concurrently.
    #[inline(never)]
    pub unsafe fn capture(&self) {
        // SAFETY: exclusive access is the caller's obligation.
        let ips = unsafe { &mut *self.ips.get() };
        let mut len = 0;
        // SAFETY: the unsynchronized tracer is fine while only one thread
        // ever walks through this slot.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                // the outermost frame of a thread reports a null ip
                if frame.ip().is_null() {
                    return false;
                }
                ips[len] = frame.ip() as usize;
                len += 1;
                len < MAX_FRAMES
            });
        }
        self.len.store(len, Ordering::Release);
    }

    /// The instruction pointers recorded by the last `capture`.
    ///
    /// # Safety
    ///
    /// Must not overlap with a `capture` on another thread.
    pub unsafe fn frames(&self) -> &[usize] {
        let len = self.len.load(Ordering::Acquire);
        // SAFETY: no writer is active, per the caller.
        let ips: &[usize; MAX_FRAMES] = unsafe { &*self.ips.get() };
        &ips[..len]
    }
}

impl Default for TraceSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// One symbol found at a frame address. Inlined frames produce several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub name: Option<String>,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub ip: usize,
    pub symbols: Vec<ResolvedSymbol>,
}

/// A symbolized stack trace, printable one frame per line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTrace {
    pub frames: Vec<ResolvedFrame>,
}

/// Symbolizes raw instruction pointers. Allocates; never call from a hook.
pub fn resolve(ips: &[usize]) -> ResolvedTrace {
    let frames = ips
        .iter()
        .map(|&ip| {
            let mut symbols = Vec::new();
            backtrace::resolve(ip as *mut c_void, |symbol| {
                symbols.push(ResolvedSymbol {
                    name: symbol.name().map(|name| name.to_string()),
                    file: symbol.filename().map(PathBuf::from),
                    line: symbol.lineno(),
                    column: symbol.colno(),
                });
            });
            ResolvedFrame { ip, symbols }
        })
        .collect();
    ResolvedTrace { frames }
}

impl fmt::Display for ResolvedTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, frame) in self.frames.iter().enumerate() {
            if frame.symbols.is_empty() {
                writeln!(f, "{index:4}: {:#018x} - <unknown>", frame.ip)?;
                continue;
            }
            for (nth, symbol) in frame.symbols.iter().enumerate() {
                let name = symbol.name.as_deref().unwrap_or("<unknown>");
                if nth == 0 {
                    writeln!(f, "{index:4}: {:#018x} - {name}", frame.ip)?;
                } else {
                    // inlined into the frame above
                    writeln!(f, "      {:18}   {name}", "")?;
                }
                if let Some(file) = &symbol.file {
                    write!(f, "             at {}", file.display())?;
                    if let Some(line) = symbol.line {
                        write!(f, ":{line}")?;
                        if let Some(column) = symbol.column {
                            write!(f, ":{column}")?;
                        }
                    }
                    writeln!(f)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[inline(never)]
    fn capture_here(slot: &TraceSlot) {
        unsafe { slot.capture() };
    }

    #[test]
    fn capture_records_frames() {
        let slot = TraceSlot::new();
        capture_here(&slot);
        let frames = unsafe { slot.frames() };
        assert!(frames.len() > 1);
        assert!(frames.len() <= MAX_FRAMES);
        assert!(frames.iter().all(|&ip| ip != 0));
    }

    #[test]
    fn spawned_thread_trace_has_no_null_frame() {
        let text = thread::spawn(|| {
            let slot = TraceSlot::new();
            capture_here(&slot);
            let frames = unsafe { slot.frames() };
            assert!(!frames.is_empty());
            assert!(frames.iter().all(|&ip| ip != 0));
            resolve(frames).to_string()
        })
        .join()
        .unwrap();
        assert!(!text.is_empty());
        assert!(
            text.lines().all(|line| !line.contains("0x0000000000000000")),
            "{text}"
        );
    }

    #[test]
    fn empty_slot_has_no_frames() {
        let slot = TraceSlot::new();
        assert!(unsafe { slot.frames() }.is_empty());
        assert_eq!(resolve(&[]).to_string(), "");
    }

    #[test]
    fn resolved_trace_names_this_crate() {
        let slot = TraceSlot::new();
        capture_here(&slot);
        let trace = resolve(unsafe { slot.frames() });
        assert_eq!(trace.frames.len(), unsafe { slot.frames() }.len());
        let text = trace.to_string();
        assert!(text.starts_with("   0: 0x"), "{text}");
        assert!(text.contains("capture"), "{text}");
    }

    #[test]
    fn unknown_frames_are_printed() {
        let trace = ResolvedTrace {
            frames: vec![
                ResolvedFrame {
                    ip: 0x1234,
                    symbols: vec![],
                },
                ResolvedFrame {
                    ip: 0x5678,
                    symbols: vec![ResolvedSymbol {
                        name: Some("app::main".into()),
                        file: Some(PathBuf::from("src/main.rs")),
                        line: Some(7),
                        column: Some(5),
                    }],
                },
            ],
        };
        let text = trace.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "   0: 0x0000000000001234 - <unknown>");
        assert_eq!(lines[1], "   1: 0x0000000000005678 - app::main");
        assert_eq!(lines[2], "             at src/main.rs:7:5");
    }
}
