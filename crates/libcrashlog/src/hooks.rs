//! Fault hook registration.
//!
//! Every hook does the same three things: note the fault id, run the shared
//! crash routine, then `_exit` without unwinding or running destructors.
//! Hooks never allocate or log before the crash routine returns.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, PanicHookInfo};
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::{cmp, ptr};

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::config::CrashLogConfig;
use crate::context::CrashContext;
use crate::errors::{CrashLogError, CrashLogResult};

/// The crash state every hook reports into.
pub(crate) static CONTEXT: CrashContext = CrashContext::new();

/// Configuration collected by the `set_*` functions until monitoring begins.
pub(crate) static PENDING_CONFIG: Mutex<Option<CrashLogConfig>> = Mutex::new(None);

static MONITOR: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);
static STARTED: AtomicBool = AtomicBool::new(false);

/// Signal stack size in pages, unless `SIGSTKSZ` is larger.
const ALT_STACK_PAGES: usize = 16;

/// Exit status of a process torn down by a fault hook.
const CRASH_EXIT_CODE: libc::c_int = 1;

/// Starts the monitor thread and installs every fault hook.
///
/// Single use: later calls fail with [`CrashLogError::AlreadyMonitoring`].
/// Unless [`CrashLogConfig::capture_panics`] is off, any panic from then on,
/// even one that `catch_unwind` would catch, writes a log and exits.
/// When some signals cannot be hooked the rest are still installed and the
/// first failure is returned.
pub fn begin_monitoring_with(config: CrashLogConfig) -> CrashLogResult<()> {
    if STARTED.swap(true, SeqCst) {
        return Err(CrashLogError::AlreadyMonitoring);
    }
    info!("Crash monitoring begins, logs go to {:?}", config.folder);

    let signals = config.signals.clone();
    let capture_panics = config.capture_panics;
    let alt_stack = config.alt_stack;

    let monitor = thread::Builder::new()
        .name("crashlog-monitor".into())
        .spawn(move || CONTEXT.run_monitor(config))?;
    *MONITOR.lock().unwrap_or_else(PoisonError::into_inner) = Some(monitor);

    if alt_stack {
        install_alt_stack()?;
    }

    let mut first_error = None;
    for signal in signals {
        match register_signal(signal) {
            Ok(()) => debug!("Hooked {signal}"),
            Err(e) => {
                warn!("Unable to hook {signal}: {e}");
                first_error.get_or_insert(e);
            }
        }
    }

    if capture_panics {
        install_panic_hook();
        debug!("Hooked panics");
    }

    // SAFETY: `on_normal_exit` is a plain `extern "C" fn()`.
    if unsafe { libc::atexit(on_normal_exit) } != 0 {
        return Err(CrashLogError::ExitHook);
    }
    debug!("Hooked normal exit");

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn register_signal(signal: Signal) -> CrashLogResult<()> {
    // SA_ONSTACK lets the handler run after a stack overflow, SA_NODEFER lets a
    // fault inside the handler re-enter it and hit the re-entry guard.
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_ONSTACK | SaFlags::SA_NODEFER,
        SigSet::empty(),
    );
    // SAFETY: `on_signal` only calls async-signal-safe code before `_exit`.
    unsafe { signal::sigaction(signal, &action) }?;
    Ok(())
}

extern "C" fn on_signal(signum: libc::c_int) {
    CONTEXT.handle_crash(signum);
    terminate()
}

extern "C" fn on_normal_exit() {
    if !CONTEXT.request_normal_exit() {
        return;
    }
    let monitor = MONITOR.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(monitor) = monitor {
        let _ = monitor.join();
    }
}

/// Uncaught panics, including those that cannot unwind across an
/// `extern "C"` boundary, become crashes. The previous hook still runs first
/// so the usual panic message reaches stderr.
fn install_panic_hook() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        previous(info);
        CONTEXT.set_panic_message(describe_panic(info));
        CONTEXT.handle_crash(0);
        terminate()
    }));
}

fn describe_panic(info: &PanicHookInfo<'_>) -> String {
    let location = info
        .location()
        .map(|location| location.to_string())
        .unwrap_or_else(|| "<unknown>".to_string());
    format!("{location}: {}", payload_text(info.payload()))
}

fn payload_text(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "Box<dyn Any>"
    }
}

/// Ends the process at once, skipping atexit handlers and destructors.
fn terminate() -> ! {
    // SAFETY: `_exit` is async-signal-safe and never returns.
    unsafe { libc::_exit(CRASH_EXIT_CODE) }
}

thread_local! {
    static ALT_STACK_INSTALLED: Cell<bool> = const { Cell::new(false) };
}

/// Gives the calling thread its own signal stack, with a guard page below it.
///
/// Without one a stack overflow on this thread kills the process before any
/// hook can run. `begin_monitoring` does this for its caller; threads spawned
/// through `std` already have one. Idempotent per thread. The mapping is never
/// freed.
pub fn install_alt_stack() -> CrashLogResult<()> {
    if ALT_STACK_INSTALLED.get() {
        return Ok(());
    }

    // SAFETY: sysconf has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return Err(CrashLogError::AltStack("unable to query the page size"));
    }
    let page_size = page_size as usize;
    let stack_size = cmp::max(libc::SIGSTKSZ, ALT_STACK_PAGES * page_size);

    // SAFETY: fresh anonymous mapping, no aliasing with existing memory.
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            stack_size + page_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(Errno::last().into());
    }

    // SAFETY: `base` is the start of the mapping created above.
    if unsafe { libc::mprotect(base, page_size, libc::PROT_NONE) } != 0 {
        let errno = Errno::last();
        // SAFETY: unmapping exactly what was mapped above.
        unsafe { libc::munmap(base, stack_size + page_size) };
        return Err(errno.into());
    }

    let stack = libc::stack_t {
        // SAFETY: one page into a mapping of `stack_size + page_size` bytes.
        ss_sp: unsafe { base.add(page_size) },
        ss_flags: 0,
        ss_size: stack_size,
    };
    // SAFETY: `stack` describes memory that stays mapped for the process.
    if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
        let errno = Errno::last();
        // SAFETY: not installed, so nothing refers to it.
        unsafe { libc::munmap(base, stack_size + page_size) };
        return Err(errno.into());
    }

    ALT_STACK_INSTALLED.set(true);
    Ok(())
}
