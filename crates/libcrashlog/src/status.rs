//! Program status shared by the faulting thread and the monitor thread.

use std::sync::atomic::{AtomicU8, Ordering::SeqCst};

/// Where the process is in its lifetime.
///
/// Valid paths are `Running -> Crashed -> Ending` and `Running -> NormalExit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProgramStatus {
    Running = 0,
    Crashed = 1,
    Ending = 2,
    NormalExit = 3,
}

impl ProgramStatus {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Crashed,
            2 => Self::Ending,
            _ => Self::NormalExit,
        }
    }

    /// `Ending` and `NormalExit` are never left.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ending | Self::NormalExit)
    }
}

/// Lock-free cell holding a [`ProgramStatus`].
///
/// Safe to read and write from a signal handler.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub const fn new() -> Self {
        Self(AtomicU8::new(ProgramStatus::Running as u8))
    }

    pub fn get(&self) -> ProgramStatus {
        ProgramStatus::from_u8(self.0.load(SeqCst))
    }

    /// Moves from `from` to `to` if the cell currently holds `from`.
    ///
    /// Returns the status observed before the attempt on failure.
    pub fn transition(&self, from: ProgramStatus, to: ProgramStatus) -> Result<(), ProgramStatus> {
        debug_assert!(!from.is_terminal());
        self.0
            .compare_exchange(from as u8, to as u8, SeqCst, SeqCst)
            .map(|_| ())
            .map_err(ProgramStatus::from_u8)
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}
