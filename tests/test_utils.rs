//! A scripted stand-in for the operating system, so that the tracing logic can be tested
//! without real child processes.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Once;

use debugcore::event::{TRAP_BRKPT, TRAP_TRACE};
use debugcore::region::{MemoryRegion, Permissions};
use debugcore::symbol::source::DisassemblySource;
use debugcore::target::{CpuState, Platform, Registers};
use debugcore::{Config, CoreError, CoreResult, Debugger, LaunchOptions};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

pub const PID: i32 = 4000;
pub const CODE_START: u64 = 0x401000;
pub const CODE_END: u64 = 0x402000;
pub const DATA_START: u64 = 0x600000;
pub const DATA_END: u64 = 0x601000;

static LOGGER: Once = Once::new();

pub fn init_logger() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn pid() -> Pid {
    Pid::from_raw(PID)
}

pub fn tid(n: i32) -> Pid {
    Pid::from_raw(n)
}

/// A primitive the engine asked the platform to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Attach(Pid),
    Detach(Pid),
    Cont(Pid, Option<Signal>),
    Step(Pid, Option<Signal>),
    StopThread(Pid),
    StopProcess,
    Kill,
}

/// An injected system call: number and the first three arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Syscall {
    pub number: u64,
    pub args: [u64; 3],
}

#[derive(Debug, Default)]
pub struct MockPlatform {
    /// Threads the "kernel" reports for the process.
    pub threads: BTreeSet<i32>,
    /// Threads that appear the first time anything attaches.
    pub spawn_on_attach: Vec<i32>,
    pub refuse_attach: HashSet<i32>,
    pub unreachable: bool,
    /// Status changes not collected yet.
    pub pending: BTreeMap<i32, VecDeque<WaitStatus>>,
    pub running: BTreeSet<i32>,
    pub trap_codes: HashMap<i32, i32>,
    pub event_messages: HashMap<i32, u64>,
    pub memory: BTreeMap<u64, u8>,
    /// Addresses whose bytes can be read but not written.
    pub read_only: BTreeSet<u64>,
    pub states: HashMap<i32, CpuState>,
    pub fail_state_writes: bool,
    pub regions: Vec<MemoryRegion>,
    /// Where a thread continued at some address stops next.
    pub run_targets: HashMap<u64, u64>,
    /// Where a single step at some address lands, when not the next byte.
    pub step_targets: HashMap<u64, u64>,
    /// Value left in `rax` by injected system calls.
    pub syscall_result: i64,
    pub syscalls: Vec<Syscall>,
    pub launch_status: Option<WaitStatus>,
    pub killed: bool,
    pub actions: Vec<Action>,
}

impl MockPlatform {
    /// A stopped-looking process with the given threads, one code and one data region.
    pub fn new(threads: &[i32]) -> Self {
        let mut mock = MockPlatform {
            threads: threads.iter().copied().collect(),
            ..MockPlatform::default()
        };
        mock.regions = vec![
            MemoryRegion::new(
                CODE_START,
                CODE_END,
                0,
                "/usr/bin/testee",
                Permissions::READ | Permissions::EXECUTE,
            ),
            MemoryRegion::new(
                DATA_START,
                DATA_END,
                0x1000,
                "/usr/bin/testee",
                Permissions::READ | Permissions::WRITE,
            ),
        ];
        // `nop` everywhere unless a test places code.
        for address in CODE_START..CODE_START + 0x100 {
            mock.memory.insert(address, 0x90);
        }
        for address in DATA_START..DATA_START + 0x100 {
            mock.memory.insert(address, 0);
        }
        for &tid in threads {
            let mut state = CpuState::new();
            state.set_ip(CODE_START);
            mock.states.insert(tid, state);
        }
        mock
    }

    pub fn place(&mut self, address: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.memory.insert(address + i as u64, *byte);
        }
    }

    pub fn byte(&self, address: u64) -> Option<u8> {
        self.memory.get(&address).copied()
    }

    pub fn ip(&self, tid: i32) -> u64 {
        self.states.get(&tid).map(|s| s.ip()).unwrap_or(0)
    }

    pub fn set_ip(&mut self, tid: i32, ip: u64) {
        self.states.entry(tid).or_insert_with(CpuState::new).set_ip(ip);
    }

    pub fn queue(&mut self, tid: i32, status: WaitStatus) {
        self.pending.entry(tid).or_default().push_back(status);
    }

    /// Queues a trap of `tid` with the given `si_code`.
    pub fn queue_trap(&mut self, tid: i32, code: i32) {
        self.trap_codes.insert(tid, code);
        self.queue(tid, WaitStatus::Stopped(Pid::from_raw(tid), Signal::SIGTRAP));
    }

    /// `tid` executes the trap instruction at `address`.
    pub fn hit(&mut self, tid: i32, address: u64) {
        self.set_ip(tid, address + 1);
        self.queue_trap(tid, TRAP_BRKPT);
    }

    /// Queues a new thread `child` created by `parent`.
    pub fn clone_thread(&mut self, parent: i32, child: i32) {
        self.threads.insert(child);
        self.states.entry(child).or_insert_with(CpuState::new);
        self.event_messages.insert(parent, child as u64);
        self.queue(
            parent,
            WaitStatus::PtraceEvent(
                Pid::from_raw(parent),
                Signal::SIGTRAP,
                libc::PTRACE_EVENT_CLONE,
            ),
        );
    }

    pub fn exit_thread(&mut self, tid: i32, code: i32) {
        self.threads.remove(&tid);
        self.queue(tid, WaitStatus::Exited(Pid::from_raw(tid), code));
    }

    pub fn conts(&self) -> Vec<Action> {
        self.actions
            .iter()
            .copied()
            .filter(|a| matches!(a, Action::Cont(..) | Action::Step(..)))
            .collect()
    }

    fn ensure_thread(&self, tid: Pid) -> CoreResult<()> {
        if self.threads.contains(&tid.as_raw()) {
            Ok(())
        } else {
            Err(CoreError::Nix(Errno::ESRCH))
        }
    }

    /// What a continued thread does next: run the injected syscall, reach the next stop,
    /// or keep running.
    fn run(&mut self, tid: Pid) {
        let raw = tid.as_raw();
        let ip = self.ip(raw);
        if self.byte(ip) == Some(0x0f) && self.byte(ip + 1) == Some(0x05) {
            let state = self.states.entry(raw).or_insert_with(CpuState::new);
            let regs = *state.regs();
            self.syscalls.push(Syscall {
                number: regs.rax,
                args: [regs.rdi, regs.rsi, regs.rdx],
            });
            state
                .set_value("rax", self.syscall_result as u64)
                .expect("rax is a register");
            // `hlt` faults without advancing.
            state.set_ip(ip + 2);
            self.queue(raw, WaitStatus::Stopped(tid, Signal::SIGSEGV));
            return;
        }

        if let Some(&target) = self.run_targets.get(&ip) {
            if self.byte(target) == Some(0xcc) {
                self.hit(raw, target);
            } else {
                self.set_ip(raw, target);
                self.queue(raw, WaitStatus::Stopped(tid, Signal::SIGSTOP));
            }
        }
    }
}

impl Platform for MockPlatform {
    fn launch(&mut self, _options: &LaunchOptions) -> CoreResult<Pid> {
        if self.unreachable {
            return Err(CoreError::Nix(Errno::ENOENT));
        }
        self.threads.insert(PID);
        self.states.entry(PID).or_insert_with(CpuState::new);
        let status = self
            .launch_status
            .unwrap_or(WaitStatus::Stopped(pid(), Signal::SIGTRAP));
        self.queue(PID, status);
        Ok(pid())
    }

    fn thread_ids(&self, _pid: Pid) -> CoreResult<Vec<Pid>> {
        if self.unreachable {
            return Err(CoreError::Nix(Errno::ESRCH));
        }
        Ok(self.threads.iter().map(|&t| Pid::from_raw(t)).collect())
    }

    fn attach_thread(&mut self, tid: Pid) -> CoreResult<()> {
        if self.refuse_attach.contains(&tid.as_raw()) {
            return Err(CoreError::Nix(Errno::EPERM));
        }
        self.ensure_thread(tid)?;
        self.actions.push(Action::Attach(tid));
        for spawned in self.spawn_on_attach.drain(..) {
            self.threads.insert(spawned);
            self.states.entry(spawned).or_insert_with(CpuState::new);
        }
        Ok(())
    }

    fn detach_thread(&mut self, tid: Pid) -> CoreResult<()> {
        self.actions.push(Action::Detach(tid));
        Ok(())
    }

    fn trace_clones(&mut self, tid: Pid) -> CoreResult<()> {
        self.ensure_thread(tid)
    }

    fn wait_thread(&mut self, tid: Pid, block: bool) -> CoreResult<Option<WaitStatus>> {
        let raw = tid.as_raw();
        if !block && !self.running.contains(&raw) {
            return Ok(None);
        }
        if let Some(status) = self.pending.get_mut(&raw).and_then(|q| q.pop_front()) {
            self.running.remove(&raw);
            return Ok(Some(status));
        }
        if !block {
            return Ok(None);
        }
        self.running.remove(&raw);
        if self.killed {
            Ok(Some(WaitStatus::Signaled(tid, Signal::SIGKILL, false)))
        } else if self.threads.contains(&raw) {
            // The stop requested by attach or tgkill.
            Ok(Some(WaitStatus::Stopped(tid, Signal::SIGSTOP)))
        } else {
            Err(CoreError::Nix(Errno::ECHILD))
        }
    }

    fn event_message(&self, tid: Pid) -> CoreResult<u64> {
        self.event_messages
            .get(&tid.as_raw())
            .copied()
            .ok_or(CoreError::Nix(Errno::EINVAL))
    }

    fn trap_code(&self, tid: Pid) -> CoreResult<i32> {
        Ok(self
            .trap_codes
            .get(&tid.as_raw())
            .copied()
            .unwrap_or(TRAP_BRKPT))
    }

    fn cont(&mut self, tid: Pid, signal: Option<Signal>) -> CoreResult<()> {
        self.ensure_thread(tid)?;
        self.actions.push(Action::Cont(tid, signal));
        self.running.insert(tid.as_raw());
        self.run(tid);
        Ok(())
    }

    fn step(&mut self, tid: Pid, signal: Option<Signal>) -> CoreResult<()> {
        self.ensure_thread(tid)?;
        self.actions.push(Action::Step(tid, signal));
        self.running.insert(tid.as_raw());
        let raw = tid.as_raw();
        let ip = self.ip(raw);
        let next = self.step_targets.get(&ip).copied().unwrap_or(ip + 1);
        self.set_ip(raw, next);
        self.queue_trap(raw, TRAP_TRACE);
        Ok(())
    }

    fn stop_thread(&mut self, _pid: Pid, tid: Pid) -> CoreResult<()> {
        self.actions.push(Action::StopThread(tid));
        self.ensure_thread(tid)
    }

    fn stop_process(&mut self, _pid: Pid) -> CoreResult<()> {
        self.actions.push(Action::StopProcess);
        let first = self.threads.iter().next().copied();
        if let Some(first) = first {
            self.queue(first, WaitStatus::Stopped(Pid::from_raw(first), Signal::SIGSTOP));
        }
        Ok(())
    }

    fn kill_process(&mut self, _pid: Pid) -> CoreResult<()> {
        self.actions.push(Action::Kill);
        self.killed = true;
        self.threads.clear();
        self.pending.clear();
        Ok(())
    }

    fn read_memory(&self, _tid: Pid, address: u64, buf: &mut [u8]) -> CoreResult<()> {
        let len = buf.len();
        for (i, out) in buf.iter_mut().enumerate() {
            *out = self
                .byte(address + i as u64)
                .ok_or(CoreError::MemoryAccess { address, len })?;
        }
        Ok(())
    }

    fn write_memory(&mut self, _tid: Pid, address: u64, data: &[u8]) -> CoreResult<()> {
        let writable = (0..data.len() as u64).all(|i| {
            self.memory.contains_key(&(address + i)) && !self.read_only.contains(&(address + i))
        });
        if !writable {
            return Err(CoreError::MemoryAccess {
                address,
                len: data.len(),
            });
        }
        self.place(address, data);
        Ok(())
    }

    fn read_state(&self, tid: Pid) -> CoreResult<CpuState> {
        self.states
            .get(&tid.as_raw())
            .copied()
            .ok_or(CoreError::Nix(Errno::ESRCH))
    }

    fn write_state(&mut self, tid: Pid, state: &CpuState) -> CoreResult<()> {
        if self.fail_state_writes {
            return Err(CoreError::Nix(Errno::EIO));
        }
        self.states.insert(tid.as_raw(), *state);
        Ok(())
    }

    fn memory_regions(&self, _pid: Pid) -> CoreResult<Vec<MemoryRegion>> {
        Ok(self.regions.clone())
    }
}

/// A debugger attached to a mocked process with the given threads.
pub fn attached(threads: &[i32]) -> Debugger<MockPlatform> {
    attached_with(MockPlatform::new(threads), Config::default())
}

pub fn attached_with(mock: MockPlatform, config: Config) -> Debugger<MockPlatform> {
    init_logger();
    let decoder = DisassemblySource::new().expect("capstone is available");
    let mut dbg = Debugger::new(mock, Box::new(decoder), config);
    dbg.attach(pid()).expect("attach succeeds");
    dbg
}

pub fn mock(dbg: &mut Debugger<MockPlatform>) -> &mut MockPlatform {
    dbg.engine_mut().platform_mut()
}
