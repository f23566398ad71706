//! Process-wide crash state and the handoff between the faulting thread and
//! the monitor thread.
//!
//! The faulting thread records the trace and fault id, flips the status to
//! `Crashed` and sleeps on the rendezvous. The monitor thread, running on its
//! own stack, writes the log, flips the status to `Ending` and wakes it back
//! up. Trace and fault id are written once before the flip and read once after
//! it, which is what makes reading them without a lock sound.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering::SeqCst};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::config::CrashLogConfig;
use crate::report::{CrashReport, write_crash_log};
use crate::status::{ProgramStatus, StatusCell};
use crate::trace::{self, TraceSlot};

/// How long the monitor waits for a lock that the crashed thread may own.
const LOCK_ATTEMPTS: u32 = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(2);

/// No thread has claimed the crash yet.
const NO_THREAD: usize = 0;

pub struct CrashContext {
    status: StatusCell,
    // rendezvous; the guarded state is `status`
    lock: Mutex<()>,
    cvar: Condvar,
    trace: TraceSlot,
    fault_id: AtomicI32,
    header: Mutex<String>,
    panic_message: Mutex<Option<String>>,
    crashing_thread: AtomicUsize,
    monitor_thread: AtomicUsize,
}

impl CrashContext {
    pub const fn new() -> Self {
        Self {
            status: StatusCell::new(),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
            trace: TraceSlot::new(),
            fault_id: AtomicI32::new(0),
            header: Mutex::new(String::new()),
            panic_message: Mutex::new(None),
            crashing_thread: AtomicUsize::new(NO_THREAD),
            monitor_thread: AtomicUsize::new(NO_THREAD),
        }
    }

    pub fn status(&self) -> ProgramStatus {
        self.status.get()
    }

    /// Replaces the header line. Ignored once a crash has begun.
    pub fn set_header_message(&self, message: impl Into<String>) {
        let message = message.into();
        let mut header = lock(&self.header);
        if self.status.get() != ProgramStatus::Running {
            return;
        }
        *header = message;
    }

    pub fn header_message(&self) -> String {
        lock(&self.header).clone()
    }

    /// Stores the message of the panic about to be handled as a crash.
    pub(crate) fn set_panic_message(&self, message: String) {
        let mut slot = lock(&self.panic_message);
        if self.status.get() != ProgramStatus::Running {
            return;
        }
        *slot = Some(message);
    }

    /// The shared crash routine every fault hook funnels into.
    ///
    /// Returns once the crash log has been written, or at once when a crash
    /// is already being handled by this thread (or this is the monitor).
    /// Another thread faulting at the same time waits for the first crash to
    /// finish instead, so it cannot tear the process down mid-write.
    ///
    /// Allocation-free on this thread; the monitor does the heavy lifting.
    #[inline(never)]
    pub fn handle_crash(&self, fault_id: i32) {
        let me = current_thread();
        if self.monitor_thread.load(SeqCst) == me {
            return;
        }
        if let Err(owner) = self
            .crashing_thread
            .compare_exchange(NO_THREAD, me, SeqCst, SeqCst)
        {
            if owner != me {
                self.wait_until_terminal();
            }
            return;
        }

        // The monitor may wake spuriously, so the slots are filled before the
        // status says there is something to read.
        self.fault_id.store(fault_id, SeqCst);
        // SAFETY: this thread won `crashing_thread`, so nobody else captures,
        // and the monitor reads only once the status is `Crashed`.
        unsafe { self.trace.capture() };

        if self
            .status
            .transition(ProgramStatus::Running, ProgramStatus::Crashed)
            .is_err()
        {
            // already shutting down normally, the monitor is gone
            return;
        }

        let guard = lock(&self.lock);
        self.cvar.notify_all();
        let _guard = self
            .cvar
            .wait_while(guard, |_| self.status.get() == ProgramStatus::Crashed)
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn wait_until_terminal(&self) {
        let guard = lock(&self.lock);
        let _guard = self
            .cvar
            .wait_while(guard, |_| !self.status.get().is_terminal())
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Body of the monitor thread. Handles exactly one crash or one normal
    /// exit, then returns.
    pub fn run_monitor(&self, config: CrashLogConfig) {
        self.monitor_thread.store(current_thread(), SeqCst);

        let guard = lock(&self.lock);
        let guard = self
            .cvar
            .wait_while(guard, |_| self.status.get() == ProgramStatus::Running)
            .unwrap_or_else(PoisonError::into_inner);
        drop(guard);

        if self.status.get() != ProgramStatus::Crashed {
            debug!("process exiting normally, crash monitor stopping");
            return;
        }

        let report = self.collect_report();
        if let Ok(path) = write_crash_log(&config, &report) {
            if let Some(on_write) = &config.on_write {
                on_write(&path);
            }
        }

        let ended = self
            .status
            .transition(ProgramStatus::Crashed, ProgramStatus::Ending);
        debug_assert!(ended.is_ok(), "only the monitor leaves Crashed");
        let _guard = lock(&self.lock);
        self.cvar.notify_all();
    }

    /// Moves `Running -> NormalExit` and wakes the monitor so it can be joined.
    ///
    /// Returns `false` when a crash got there first.
    pub fn request_normal_exit(&self) -> bool {
        if self
            .status
            .transition(ProgramStatus::Running, ProgramStatus::NormalExit)
            .is_err()
        {
            return false;
        }
        let _guard = lock(&self.lock);
        self.cvar.notify_all();
        true
    }

    fn collect_report(&self) -> CrashReport {
        // SAFETY: called by the monitor after the crashing thread finished its
        // capture and before it is released.
        let frames = unsafe { self.trace.frames() };
        CrashReport {
            header: read_patiently(&self.header).unwrap_or_default(),
            fault_id: self.fault_id.load(SeqCst),
            panic_message: read_patiently(&self.panic_message).flatten(),
            trace: trace::resolve(frames),
        }
    }
}

impl Default for CrashContext {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clones the value behind `mutex`, giving up if the lock stays held.
///
/// The holder may be the crashed thread, which will never release it.
fn read_patiently<T: Clone>(mutex: &Mutex<T>) -> Option<T> {
    for _ in 0..LOCK_ATTEMPTS {
        match mutex.try_lock() {
            Ok(guard) => return Some(guard.clone()),
            Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner().clone()),
            Err(TryLockError::WouldBlock) => thread::sleep(LOCK_RETRY_DELAY),
        }
    }
    None
}

/// Identity of the calling thread, never [`NO_THREAD`].
fn current_thread() -> usize {
    // SAFETY: pthread_self has no preconditions and is async-signal-safe.
    unsafe { libc::pthread_self() as usize }
}
