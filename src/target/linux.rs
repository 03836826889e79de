mod memory;
mod readmem;
mod writemem;

use log::trace;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{Pid, Uid, User};
use procfs::process::{MMPermissions, MMapPath, Process};
use std::mem;
use std::path::PathBuf;

use super::{unix, CpuState, Platform, ProcessInfo};
use crate::config::LaunchOptions;
use crate::region::{MemoryRegion, Permissions};
use crate::CoreResult;

pub(crate) use memory::PAGE_SIZE;

/// Debug registers that can be written; `dr4` and `dr5` are aliases the kernel rejects.
const WRITABLE_DEBUG_REGISTERS: [usize; 6] = [0, 1, 2, 3, 6, 7];

fn debug_register_offset(n: usize) -> usize {
    mem::offset_of!(libc::user, u_debugreg) + n * mem::size_of::<u64>()
}

/// Native tracing with `ptrace(2)` and `/proc`.
#[derive(Debug, Default)]
pub struct LinuxPlatform {
    _private: (),
}

impl LinuxPlatform {
    pub fn new() -> Self {
        LinuxPlatform::default()
    }

    fn read_fpregs(&self, tid: Pid) -> CoreResult<libc::user_fpregs_struct> {
        let mut fpregs = mem::MaybeUninit::<libc::user_fpregs_struct>::uninit();
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_GETFPREGS,
                tid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                fpregs.as_mut_ptr() as *mut libc::c_void,
            )
        };
        Errno::result(res)?;
        // SAFETY: PTRACE_GETFPREGS filled the whole structure.
        Ok(unsafe { fpregs.assume_init() })
    }

    fn write_fpregs(&self, tid: Pid, fpregs: &libc::user_fpregs_struct) -> CoreResult<()> {
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_SETFPREGS,
                tid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                fpregs as *const _ as *mut libc::c_void,
            )
        };
        Errno::result(res)?;
        Ok(())
    }

    fn read_debug_register(&self, tid: Pid, n: usize) -> CoreResult<u64> {
        if n == 4 || n == 5 {
            return Ok(0);
        }
        // PEEKUSER returns the value itself, so -1 is only an error when errno says so.
        Errno::clear();
        let value = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKUSER,
                tid.as_raw(),
                debug_register_offset(n) as *mut libc::c_void,
                std::ptr::null_mut::<libc::c_void>(),
            )
        };
        if value == -1 && Errno::last() != Errno::UnknownErrno {
            return Err(Errno::last().into());
        }
        Ok(value as u64)
    }

    fn write_debug_register(&self, tid: Pid, n: usize, value: u64) -> CoreResult<()> {
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEUSER,
                tid.as_raw(),
                debug_register_offset(n) as *mut libc::c_void,
                value as *mut libc::c_void,
            )
        };
        Errno::result(res)?;
        Ok(())
    }
}

fn region_name(path: MMapPath) -> String {
    match path {
        MMapPath::Path(path) => path.to_string_lossy().into_owned(),
        MMapPath::Heap => "[heap]".to_owned(),
        MMapPath::Stack => "[stack]".to_owned(),
        MMapPath::TStack(tid) => format!("[stack:{}]", tid),
        MMapPath::Vdso => "[vdso]".to_owned(),
        MMapPath::Vvar => "[vvar]".to_owned(),
        MMapPath::Vsyscall => "[vsyscall]".to_owned(),
        MMapPath::Other(name) => name,
        _ => String::new(),
    }
}

impl Platform for LinuxPlatform {
    fn launch(&mut self, options: &LaunchOptions) -> CoreResult<Pid> {
        let pid = unix::launch(options)?;
        trace!("launched {:?} as {}", options.path, pid);
        Ok(pid)
    }

    fn thread_ids(&self, pid: Pid) -> CoreResult<Vec<Pid>> {
        Ok(Process::new(pid.as_raw())?
            .tasks()?
            .filter_map(|task| task.ok())
            .map(|task| Pid::from_raw(task.tid))
            .collect())
    }

    fn attach_thread(&mut self, tid: Pid) -> CoreResult<()> {
        ptrace::attach(tid)?;
        Ok(())
    }

    fn detach_thread(&mut self, tid: Pid) -> CoreResult<()> {
        ptrace::detach(tid, None)?;
        Ok(())
    }

    fn trace_clones(&mut self, tid: Pid) -> CoreResult<()> {
        ptrace::setoptions(tid, ptrace::Options::PTRACE_O_TRACECLONE)?;
        Ok(())
    }

    fn wait_thread(&mut self, tid: Pid, block: bool) -> CoreResult<Option<WaitStatus>> {
        let mut flags = WaitPidFlag::__WALL;
        if !block {
            flags |= WaitPidFlag::WNOHANG;
        }
        match waitpid(tid, Some(flags))? {
            WaitStatus::StillAlive => Ok(None),
            status => Ok(Some(status)),
        }
    }

    fn event_message(&self, tid: Pid) -> CoreResult<u64> {
        Ok(ptrace::getevent(tid)? as u64)
    }

    fn trap_code(&self, tid: Pid) -> CoreResult<i32> {
        Ok(ptrace::getsiginfo(tid)?.si_code)
    }

    fn cont(&mut self, tid: Pid, signal: Option<Signal>) -> CoreResult<()> {
        ptrace::cont(tid, signal)?;
        Ok(())
    }

    fn step(&mut self, tid: Pid, signal: Option<Signal>) -> CoreResult<()> {
        ptrace::step(tid, signal)?;
        Ok(())
    }

    fn stop_thread(&mut self, pid: Pid, tid: Pid) -> CoreResult<()> {
        let res = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                pid.as_raw(),
                tid.as_raw(),
                libc::SIGSTOP,
            )
        };
        Errno::result(res)?;
        Ok(())
    }

    fn stop_process(&mut self, pid: Pid) -> CoreResult<()> {
        signal::kill(pid, Signal::SIGSTOP)?;
        Ok(())
    }

    fn kill_process(&mut self, pid: Pid) -> CoreResult<()> {
        signal::kill(pid, Signal::SIGKILL)?;
        Ok(())
    }

    fn read_memory(&self, tid: Pid, address: u64, buf: &mut [u8]) -> CoreResult<()> {
        readmem::read(tid, address, buf)
    }

    fn write_memory(&mut self, tid: Pid, address: u64, data: &[u8]) -> CoreResult<()> {
        writemem::write(tid, address, data)
    }

    fn read_state(&self, tid: Pid) -> CoreResult<CpuState> {
        let regs = ptrace::getregs(tid)?;
        let fpregs = self.read_fpregs(tid)?;
        let mut debug = [0u64; 8];
        for (n, value) in debug.iter_mut().enumerate() {
            *value = self.read_debug_register(tid, n)?;
        }
        Ok(CpuState::from_parts(regs, fpregs, debug))
    }

    fn write_state(&mut self, tid: Pid, state: &CpuState) -> CoreResult<()> {
        ptrace::setregs(tid, *state.regs())?;
        self.write_fpregs(tid, state.fpregs())?;

        // Rewriting an unchanged `dr7` can fail while the address registers are being
        // replaced, so only changed registers are written, addresses first.
        for &n in WRITABLE_DEBUG_REGISTERS.iter() {
            let value = state.debug_registers()[n];
            if self.read_debug_register(tid, n)? != value {
                self.write_debug_register(tid, n, value)?;
            }
        }
        Ok(())
    }

    fn memory_regions(&self, pid: Pid) -> CoreResult<Vec<MemoryRegion>> {
        Ok(Process::new(pid.as_raw())?
            .maps()?
            .into_iter()
            .filter(|map| map.address.0 < map.address.1)
            .map(|map| {
                let permissions = Permissions::from_flags(
                    map.perms.contains(MMPermissions::READ),
                    map.perms.contains(MMPermissions::WRITE),
                    map.perms.contains(MMPermissions::EXECUTE),
                );
                MemoryRegion::new(
                    map.address.0,
                    map.address.1,
                    map.offset,
                    region_name(map.pathname),
                    permissions,
                )
            })
            .collect())
    }

    fn page_size(&self) -> u64 {
        *PAGE_SIZE as u64
    }

    fn process_exe(&self, pid: Pid) -> CoreResult<PathBuf> {
        Ok(Process::new(pid.as_raw())?.exe()?)
    }

    fn process_cwd(&self, pid: Pid) -> CoreResult<PathBuf> {
        Ok(Process::new(pid.as_raw())?.cwd()?)
    }

    fn process_args(&self, pid: Pid) -> CoreResult<Vec<String>> {
        Ok(Process::new(pid.as_raw())?.cmdline()?)
    }

    fn parent_pid(&self, pid: Pid) -> CoreResult<Pid> {
        Ok(Pid::from_raw(Process::new(pid.as_raw())?.stat()?.ppid))
    }

    fn processes(&self) -> CoreResult<Vec<ProcessInfo>> {
        let mut processes = Vec::new();
        // Processes may exit while we walk the list.
        for process in procfs::process::all_processes()?.filter_map(|p| p.ok()) {
            let (stat, uid) = match (process.stat(), process.uid()) {
                (Ok(stat), Ok(uid)) => (stat, uid),
                _ => continue,
            };
            let user = User::from_uid(Uid::from_raw(uid))
                .ok()
                .flatten()
                .map(|user| user.name)
                .unwrap_or_else(|| uid.to_string());
            processes.push(ProcessInfo {
                pid: Pid::from_raw(process.pid),
                uid,
                user,
                name: stat.comm,
            });
        }
        Ok(processes)
    }
}
