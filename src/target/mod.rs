use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::path::PathBuf;

use crate::config::LaunchOptions;
use crate::region::MemoryRegion;
use crate::{CoreError, CoreResult};

#[cfg(unix)]
mod unix;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxPlatform;

mod registers;
pub use registers::{CpuState, Registers};

mod thread;
pub use thread::ThreadRecord;

/// One entry of the system process list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub uid: u32,
    pub user: String,
    pub name: String,
}

/// Primitive tracing operations of one operating system.
///
/// Everything stateful (thread bookkeeping, breakpoints, event classification) lives in
/// [`ProcessControlEngine`](crate::engine::ProcessControlEngine); implementors only wrap
/// the system calls. Thread ids and process ids share the [`Pid`] type.
pub trait Platform {
    /// Starts a new process that is traced from birth. The first stop is *not* consumed.
    fn launch(&mut self, options: &LaunchOptions) -> CoreResult<Pid>;

    /// Thread ids of `pid` currently visible to the operating system.
    fn thread_ids(&self, pid: Pid) -> CoreResult<Vec<Pid>>;

    fn attach_thread(&mut self, tid: Pid) -> CoreResult<()>;

    fn detach_thread(&mut self, tid: Pid) -> CoreResult<()>;

    /// Reports new threads of `tid` as clone events.
    fn trace_clones(&mut self, tid: Pid) -> CoreResult<()>;

    /// Collects a status change of `tid`. With `block == false` returns `Ok(None)` when the
    /// thread has nothing to report.
    fn wait_thread(&mut self, tid: Pid, block: bool) -> CoreResult<Option<WaitStatus>>;

    /// The message attached to the last ptrace event of `tid` (e.g. a new thread id).
    fn event_message(&self, tid: Pid) -> CoreResult<u64>;

    /// `si_code` of the signal that stopped `tid`.
    fn trap_code(&self, tid: Pid) -> CoreResult<i32>;

    fn cont(&mut self, tid: Pid, signal: Option<Signal>) -> CoreResult<()>;

    fn step(&mut self, tid: Pid, signal: Option<Signal>) -> CoreResult<()>;

    /// Sends a thread-directed stop signal.
    fn stop_thread(&mut self, pid: Pid, tid: Pid) -> CoreResult<()>;

    /// Sends a stop signal to the whole process.
    fn stop_process(&mut self, pid: Pid) -> CoreResult<()>;

    fn kill_process(&mut self, pid: Pid) -> CoreResult<()>;

    /// Fills `buf` from the target or fails without a partial result.
    fn read_memory(&self, tid: Pid, address: u64, buf: &mut [u8]) -> CoreResult<()>;

    /// Writes `data` to the target; on failure the target memory is left unchanged.
    fn write_memory(&mut self, tid: Pid, address: u64, data: &[u8]) -> CoreResult<()>;

    fn read_state(&self, tid: Pid) -> CoreResult<CpuState>;

    fn write_state(&mut self, tid: Pid, state: &CpuState) -> CoreResult<()>;

    fn memory_regions(&self, pid: Pid) -> CoreResult<Vec<MemoryRegion>>;

    fn page_size(&self) -> u64 {
        4096
    }

    fn process_exe(&self, _pid: Pid) -> CoreResult<PathBuf> {
        Err(CoreError::Unsupported("executable path lookup"))
    }

    fn process_cwd(&self, _pid: Pid) -> CoreResult<PathBuf> {
        Err(CoreError::Unsupported("working directory lookup"))
    }

    fn process_args(&self, _pid: Pid) -> CoreResult<Vec<String>> {
        Err(CoreError::Unsupported("command line lookup"))
    }

    fn parent_pid(&self, _pid: Pid) -> CoreResult<Pid> {
        Err(CoreError::Unsupported("parent process lookup"))
    }

    fn processes(&self) -> CoreResult<Vec<ProcessInfo>> {
        Err(CoreError::Unsupported("process enumeration"))
    }
}

/// Byte-level access to some address space.
pub trait MemoryAccess {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> CoreResult<()>;

    fn write_bytes(&mut self, address: u64, data: &[u8]) -> CoreResult<()>;
}

/// Memory of a traced process, accessed through one of its stopped threads.
pub struct ThreadMemory<'a, P: Platform> {
    platform: &'a mut P,
    tid: Pid,
}

impl<'a, P: Platform> ThreadMemory<'a, P> {
    pub fn new(platform: &'a mut P, tid: Pid) -> Self {
        ThreadMemory { platform, tid }
    }
}

impl<P: Platform> MemoryAccess for ThreadMemory<'_, P> {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> CoreResult<()> {
        self.platform.read_memory(self.tid, address, buf)
    }

    fn write_bytes(&mut self, address: u64, data: &[u8]) -> CoreResult<()> {
        self.platform.write_memory(self.tid, address, data)
    }
}
