//! Debug events surfaced by the engine and the decisions handlers make about them.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

/// Process breakpoint
pub const TRAP_BRKPT: i32 = 0x1;
/// Process trace trap
pub const TRAP_TRACE: i32 = 0x2;
/// Hardware breakpoint or watchpoint
pub const TRAP_HWBKPT: i32 = 0x4;
/// Sent by the kernel from somewhere (`int3` on x86)
pub const SI_KERNEL: i32 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReason {
    Stopped,
    Signaled,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapReason {
    /// A software breakpoint may have been executed.
    Breakpoint,
    SingleStep,
    Other,
}

impl TrapReason {
    pub fn from_si_code(code: i32) -> Self {
        match code {
            TRAP_BRKPT | SI_KERNEL => TrapReason::Breakpoint,
            TRAP_TRACE => TrapReason::SingleStep,
            _ => TrapReason::Other,
        }
    }
}

/// What a handler wants to happen after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Leave the target stopped and hand control to the user.
    Stop,
    /// Resume silently.
    Continue,
    /// Single-step once more.
    ContinueStep,
    /// Resume and deliver the signal that stopped the target.
    ExceptionNotHandled,
}

/// One status change of the target, produced once per dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugEvent {
    pid: Pid,
    tid: Pid,
    status: WaitStatus,
    trap: TrapReason,
}

impl DebugEvent {
    pub fn new(pid: Pid, tid: Pid, status: WaitStatus, trap: TrapReason) -> Self {
        DebugEvent {
            pid,
            tid,
            status,
            trap,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn tid(&self) -> Pid {
        self.tid
    }

    /// The raw status as reported by `wait`.
    pub fn status(&self) -> WaitStatus {
        self.status
    }

    pub fn reason(&self) -> EventReason {
        match self.status {
            WaitStatus::Exited(..) => EventReason::Exited,
            WaitStatus::Signaled(..) => EventReason::Signaled,
            _ => EventReason::Stopped,
        }
    }

    pub fn trap_reason(&self) -> TrapReason {
        match self.stop_signal() {
            Some(Signal::SIGTRAP) => self.trap,
            _ => TrapReason::Other,
        }
    }

    /// The signal that stopped the thread.
    pub fn stop_signal(&self) -> Option<Signal> {
        match self.status {
            WaitStatus::Stopped(_, sig) | WaitStatus::PtraceEvent(_, sig, _) => Some(sig),
            WaitStatus::PtraceSyscall(_) => Some(Signal::SIGTRAP),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            WaitStatus::Exited(_, code) => Some(code),
            _ => None,
        }
    }

    /// The signal that terminated the process.
    pub fn terminating_signal(&self) -> Option<Signal> {
        match self.status {
            WaitStatus::Signaled(_, sig, _) => Some(sig),
            _ => None,
        }
    }

    pub fn is_trap(&self) -> bool {
        self.stop_signal() == Some(Signal::SIGTRAP)
    }

    pub fn is_stop(&self) -> bool {
        self.stop_signal() == Some(Signal::SIGSTOP)
    }

    /// Whether the target stopped on a fault it can't continue from without help.
    pub fn is_error(&self) -> bool {
        matches!(
            self.stop_signal(),
            Some(Signal::SIGSEGV)
                | Some(Signal::SIGILL)
                | Some(Signal::SIGFPE)
                | Some(Signal::SIGBUS)
                | Some(Signal::SIGABRT)
        )
    }
}

/// The signal a thread should receive when resumed after reporting `status`.
///
/// Our own `SIGSTOP`s are swallowed; everything else is delivered as it was reported.
pub fn resume_signal(status: &WaitStatus) -> Option<Signal> {
    match *status {
        WaitStatus::Stopped(_, Signal::SIGSTOP) => None,
        WaitStatus::Signaled(_, sig, _) => Some(sig),
        WaitStatus::Stopped(_, sig) => Some(sig),
        _ => None,
    }
}
