//! Ownership of the tracing relationship with one process and all of its threads.

use log::{debug, info, log_enabled, warn, Level};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::breakpoint::{Breakpoint, BreakpointStore, BREAKPOINT_SIZE};
use crate::config::{Config, LaunchOptions};
use crate::event::{resume_signal, DebugEvent, EventStatus, TrapReason};
use crate::region::MemoryRegion;
use crate::target::{CpuState, Platform, ProcessInfo, Registers, ThreadMemory, ThreadRecord};
use crate::{CoreError, CoreResult};

/// Controls one traced process.
///
/// Whenever a thread reports a genuine stop, every other thread is stopped before the event
/// is returned, so callers never observe a partially running process. Memory, register
/// and breakpoint operations are rejected with [`CoreError::InvalidState`] while the
/// target runs.
pub struct ProcessControlEngine<P: Platform> {
    platform: P,
    config: Config,
    pid: Option<Pid>,
    threads: BTreeMap<i32, ThreadRecord>,
    active_thread: Option<Pid>,
    event_thread: Option<Pid>,
    breakpoints: BreakpointStore,
    launched: bool,
}

impl<P: Platform> ProcessControlEngine<P> {
    pub fn new(platform: P, config: Config) -> Self {
        ProcessControlEngine {
            platform,
            config,
            pid: None,
            threads: BTreeMap::new(),
            active_thread: None,
            event_thread: None,
            breakpoints: BreakpointStore::new(),
            launched: false,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn is_attached(&self) -> bool {
        self.pid.is_some()
    }

    /// Whether every known thread has been waited on.
    pub fn is_stopped(&self) -> bool {
        self.is_attached() && self.threads.values().all(|t| t.waited)
    }

    pub fn thread_ids(&self) -> Vec<Pid> {
        self.threads.values().map(|t| t.tid).collect()
    }

    pub fn threads(&self) -> impl Iterator<Item = &ThreadRecord> {
        self.threads.values()
    }

    pub fn thread(&self, tid: Pid) -> Option<&ThreadRecord> {
        self.threads.get(&tid.as_raw())
    }

    /// The thread that register and memory operations act on.
    pub fn active_thread(&self) -> Option<Pid> {
        self.active_thread
    }

    /// The thread that reported the last event.
    pub fn event_thread(&self) -> Option<Pid> {
        self.event_thread
    }

    pub fn set_active_thread(&mut self, tid: Pid) -> CoreResult<()> {
        match self.thread(tid) {
            Some(record) if record.waited => {
                self.active_thread = Some(tid);
                Ok(())
            }
            Some(_) => Err(CoreError::InvalidState("thread is running")),
            None => Err(CoreError::InvalidState("unknown thread")),
        }
    }

    pub fn page_size(&self) -> u64 {
        self.platform.page_size()
    }

    pub fn pointer_size(&self) -> usize {
        std::mem::size_of::<u64>()
    }

    /// Places every thread of `pid` under trace.
    ///
    /// Threads may be created while we attach, so the thread list is rescanned until a pass
    /// attaches nothing new.
    pub fn attach(&mut self, pid: Pid) -> CoreResult<()> {
        if let Err(err) = self.detach() {
            warn!("previous target was not released cleanly: {}", err);
        }

        let mut first_scan = true;
        loop {
            let tids = match self.platform.thread_ids(pid) {
                Ok(tids) => tids,
                Err(err) if first_scan => {
                    return Err(CoreError::TargetUnreachable(format!(
                        "can't list threads of {}: {}",
                        pid, err
                    )))
                }
                Err(_) => break,
            };
            first_scan = false;

            let mut attached_any = false;
            for tid in tids {
                if !self.threads.contains_key(&tid.as_raw()) && self.attach_thread(tid) {
                    attached_any = true;
                }
            }
            if !attached_any {
                break;
            }
        }

        let primary = if self.threads.contains_key(&pid.as_raw()) {
            pid
        } else {
            match self.threads.values().next() {
                Some(record) => record.tid,
                None => {
                    return Err(CoreError::TargetUnreachable(format!(
                        "no thread of {} could be attached",
                        pid
                    )))
                }
            }
        };

        self.pid = Some(pid);
        self.active_thread = Some(primary);
        self.event_thread = Some(primary);
        self.launched = false;
        info!("attached to {} ({} threads)", pid, self.threads.len());
        Ok(())
    }

    fn attach_thread(&mut self, tid: Pid) -> bool {
        if let Err(err) = self.platform.attach_thread(tid) {
            debug!(target: "tracer", "can't attach to thread {}: {}", tid, err);
            return false;
        }

        match self.platform.wait_thread(tid, true) {
            Ok(Some(WaitStatus::Exited(..))) | Ok(Some(WaitStatus::Signaled(..))) => false,
            Ok(Some(status)) => {
                self.threads
                    .insert(tid.as_raw(), ThreadRecord::stopped(tid, status));
                if let Err(err) = self.platform.trace_clones(tid) {
                    warn!("new threads of {} won't be traced: {}", tid, err);
                }
                true
            }
            Ok(None) | Err(_) => {
                warn!("thread {} didn't stop after attaching", tid);
                false
            }
        }
    }

    /// Launches a new process traced from birth and waits for its initial trap.
    pub fn open(&mut self, options: &LaunchOptions) -> CoreResult<()> {
        if let Err(err) = self.detach() {
            warn!("previous target was not released cleanly: {}", err);
        }

        let pid = self.platform.launch(options).map_err(|err| {
            CoreError::TargetUnreachable(format!("can't launch {:?}: {}", options.path, err))
        })?;
        let status = self
            .platform
            .wait_thread(pid, true)?
            .ok_or_else(|| CoreError::TargetUnreachable(format!("{} never stopped", pid)))?;

        match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                return Err(CoreError::TargetUnreachable(format!(
                    "{:?} terminated before its first instruction: {:?}",
                    options.path, status
                )))
            }
            _ => {
                self.register_primary(pid, status);
                if let Err(err) = self.detach() {
                    warn!("failed to release {}: {}", pid, err);
                }
                return Err(CoreError::TargetUnreachable(format!(
                    "unexpected first event of {:?}: {:?}",
                    options.path, status
                )));
            }
        }

        self.register_primary(pid, status);
        self.launched = true;
        if let Err(err) = self.platform.trace_clones(pid) {
            if let Err(err) = self.detach() {
                warn!("failed to release {}: {}", pid, err);
            }
            return Err(CoreError::TargetUnreachable(format!(
                "can't trace threads of {}: {}",
                pid, err
            )));
        }

        info!("launched {:?} as {}", options.path, pid);
        Ok(())
    }

    fn register_primary(&mut self, pid: Pid, status: WaitStatus) {
        self.threads
            .insert(pid.as_raw(), ThreadRecord::stopped(pid, status));
        self.pid = Some(pid);
        self.active_thread = Some(pid);
        self.event_thread = Some(pid);
    }

    /// Stops every thread, restores all breakpoints and releases the target.
    ///
    /// Does nothing when not attached. If some breakpoints couldn't be restored the detach
    /// still completes and [`CoreError::BreakpointRestore`] is returned afterwards.
    pub fn detach(&mut self) -> CoreResult<()> {
        let pid = match self.pid {
            Some(pid) => pid,
            None => return Ok(()),
        };

        self.stop_threads();
        let restored = self.clear_breakpoints();

        for tid in self.thread_ids() {
            if let Err(err) = self.platform.detach_thread(tid) {
                warn!("failed to detach from thread {}: {}", tid, err);
            }
        }

        info!("detached from {}", pid);
        self.reset();
        restored
    }

    /// Forcibly terminates the target and waits for it to go away.
    pub fn kill(&mut self) -> CoreResult<()> {
        let pid = match self.pid {
            Some(pid) => pid,
            None => return Ok(()),
        };

        // The address space dies with the process.
        self.breakpoints.forget();
        let result = self.platform.kill_process(pid);
        if result.is_ok() {
            loop {
                match self.platform.wait_thread(pid, true) {
                    Ok(Some(WaitStatus::Exited(..))) | Ok(Some(WaitStatus::Signaled(..))) => {
                        break
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
        }

        info!("killed {}", pid);
        self.reset();
        result
    }

    /// Asks the process to stop. The resulting event stops the remaining threads.
    pub fn pause(&mut self) -> CoreResult<()> {
        match self.pid {
            Some(pid) => self.platform.stop_process(pid),
            None => Ok(()),
        }
    }

    /// Continues the active thread, then every other stopped thread with the signal it
    /// last reported.
    pub fn resume(&mut self, status: EventStatus) -> CoreResult<()> {
        if status == EventStatus::Stop {
            return Ok(());
        }
        let tid = self.require_stopped()?;
        let signal = self.forwarded_signal(tid, status);
        self.cont_thread(tid, signal)?;
        self.resume_others(tid);
        Ok(())
    }

    /// Single-steps the active thread. Other stopped threads are continued unless
    /// [`Config::lock_scheduler_on_step`] is set.
    pub fn step(&mut self, status: EventStatus) -> CoreResult<()> {
        if status == EventStatus::Stop {
            return Ok(());
        }
        self.step_active(status)?;
        if !self.config.lock_scheduler_on_step {
            if let Some(tid) = self.active_thread {
                self.resume_others(tid);
            }
        }
        Ok(())
    }

    /// Single-steps only the active thread, leaving the rest of the process frozen.
    pub fn step_active(&mut self, status: EventStatus) -> CoreResult<()> {
        if status == EventStatus::Stop {
            return Ok(());
        }
        let tid = self.require_stopped()?;
        let signal = self.forwarded_signal(tid, status);
        self.platform.step(tid, signal)?;
        self.mark_running(tid);
        Ok(())
    }

    /// Continues only the active thread, leaving the rest of the process frozen.
    pub fn resume_active(&mut self, status: EventStatus) -> CoreResult<()> {
        if status == EventStatus::Stop {
            return Ok(());
        }
        let tid = self.require_stopped()?;
        let signal = self.forwarded_signal(tid, status);
        self.cont_thread(tid, signal)
    }

    fn forwarded_signal(&self, tid: Pid, status: EventStatus) -> Option<Signal> {
        match (status, self.thread(tid)) {
            (EventStatus::ExceptionNotHandled, Some(record)) => resume_signal(&record.status),
            _ => None,
        }
    }

    fn resume_others(&mut self, active: Pid) {
        let waiting = self
            .threads
            .values()
            .filter(|record| record.waited && record.tid != active)
            .map(|record| (record.tid, resume_signal(&record.status)))
            .collect::<Vec<_>>();

        for (tid, signal) in waiting {
            if let Err(err) = self.cont_thread(tid, signal) {
                warn!("failed to resume thread {}: {}", tid, err);
            }
        }
    }

    fn cont_thread(&mut self, tid: Pid, signal: Option<Signal>) -> CoreResult<()> {
        self.platform.cont(tid, signal)?;
        self.mark_running(tid);
        Ok(())
    }

    fn mark_running(&mut self, tid: Pid) {
        if let Some(record) = self.threads.get_mut(&tid.as_raw()) {
            record.waited = false;
        }
    }

    /// Polls every thread for a status change for at most `timeout`.
    ///
    /// Exits of non-last threads and thread creations are absorbed; `Ok(None)` means that
    /// nothing the caller needs to see happened in time.
    pub fn wait_debug_event(&mut self, timeout: Duration) -> CoreResult<Option<DebugEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_attached() {
                return Ok(None);
            }

            for tid in self.thread_ids() {
                if self.thread(tid).is_none() {
                    continue;
                }
                let status = match self.platform.wait_thread(tid, false) {
                    Ok(Some(status)) => status,
                    Ok(None) => continue,
                    Err(err) => {
                        debug!(target: "tracer", "waiting for {} failed: {}", tid, err);
                        continue;
                    }
                };
                if let Some(event) = self.handle_event(tid, status)? {
                    return Ok(Some(event));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(self.config.poll_interval.min(deadline - now));
        }
    }

    fn handle_event(&mut self, tid: Pid, status: WaitStatus) -> CoreResult<Option<DebugEvent>> {
        let pid = self.pid.ok_or(CoreError::InvalidState("not attached"))?;
        if let Some(record) = self.threads.get_mut(&tid.as_raw()) {
            record.waited = true;
            record.status = status;
        }

        match status {
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                self.threads.remove(&tid.as_raw());
                if !self.threads.is_empty() {
                    debug!(target: "tracer", "thread {} exited: {:?}", tid, status);
                    if self.active_thread == Some(tid) {
                        self.active_thread = self.threads.values().next().map(|t| t.tid);
                    }
                    return Ok(None);
                }

                info!("process {} terminated: {:?}", pid, status);
                let event = DebugEvent::new(pid, tid, status, TrapReason::Other);
                self.breakpoints.forget();
                self.reset();
                Ok(Some(event))
            }
            WaitStatus::PtraceEvent(_, Signal::SIGTRAP, libc::PTRACE_EVENT_CLONE) => {
                self.handle_clone(tid);
                Ok(None)
            }
            _ => {
                let trap = match status {
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => self
                        .platform
                        .trap_code(tid)
                        .map(TrapReason::from_si_code)
                        .unwrap_or(TrapReason::Other),
                    _ => TrapReason::Other,
                };
                self.event_thread = Some(tid);
                self.active_thread = Some(tid);
                self.stop_threads();
                Ok(Some(DebugEvent::new(pid, tid, status, trap)))
            }
        }
    }

    fn handle_clone(&mut self, tid: Pid) {
        if let Some((new_tid, status)) = self.register_clone(tid) {
            if let Err(err) = self.cont_thread(new_tid, resume_signal(&status)) {
                warn!("failed to start thread {}: {}", new_tid, err);
            }
        }
        if let Err(err) = self.cont_thread(tid, None) {
            warn!("failed to resume thread {}: {}", tid, err);
        }
    }

    /// Records the thread `tid` just created and collects its initial stop. The new
    /// thread is left stopped.
    fn register_clone(&mut self, tid: Pid) -> Option<(Pid, WaitStatus)> {
        let new_tid = match self.platform.event_message(tid) {
            Ok(message) => Pid::from_raw(message as i32),
            Err(err) => {
                warn!("can't read the id of a new thread of {}: {}", tid, err);
                return None;
            }
        };

        // A new thread starts with a SIGSTOP we have to collect.
        match self.platform.wait_thread(new_tid, true) {
            Ok(Some(WaitStatus::Exited(..))) | Ok(Some(WaitStatus::Signaled(..))) => {
                debug!(target: "tracer", "new thread {} exited immediately", new_tid);
                None
            }
            Ok(Some(status)) => {
                if status != WaitStatus::Stopped(new_tid, Signal::SIGSTOP) {
                    warn!("new thread {} started with {:?}", new_tid, status);
                }
                let record = ThreadRecord::stopped(new_tid, status);
                if log_enabled!(Level::Debug) {
                    debug!(target: "tracer", "new thread {} {:?}", new_tid, record.name());
                }
                self.threads.insert(new_tid.as_raw(), record);
                Some((new_tid, status))
            }
            Ok(None) | Err(_) => {
                warn!("new thread {} vanished", new_tid);
                None
            }
        }
    }

    /// Stops every thread that hasn't been waited on yet.
    fn stop_threads(&mut self) {
        let pid = match self.pid {
            Some(pid) => pid,
            None => return,
        };

        let running = self
            .threads
            .values()
            .filter(|record| !record.waited)
            .map(|record| record.tid)
            .collect::<Vec<_>>();

        for tid in running {
            if let Err(err) = self.platform.stop_thread(pid, tid) {
                warn!("failed to stop thread {}: {}", tid, err);
            }
            self.collect_stop(tid);
        }
    }

    /// Waits until `tid` reports the `SIGSTOP` sent by [`Self::stop_threads`].
    ///
    /// Whatever the thread reports first is settled here: new threads are registered and
    /// left stopped, a trap on one of our breakpoints is rewound so that it hits again
    /// once resumed, and any other signal is held back and delivered on resume.
    fn collect_stop(&mut self, tid: Pid) {
        let mut held = None;
        loop {
            let status = match self.platform.wait_thread(tid, true) {
                Ok(Some(WaitStatus::Exited(..))) | Ok(Some(WaitStatus::Signaled(..))) => {
                    debug!(target: "tracer", "thread {} exited while stopping", tid);
                    self.threads.remove(&tid.as_raw());
                    return;
                }
                Ok(Some(status)) => status,
                Ok(None) | Err(_) => {
                    warn!("lost thread {} while stopping the process", tid);
                    self.threads.remove(&tid.as_raw());
                    return;
                }
            };

            match status {
                WaitStatus::Stopped(_, Signal::SIGSTOP) => {
                    let status = held.unwrap_or(status);
                    self.threads
                        .insert(tid.as_raw(), ThreadRecord::stopped(tid, status));
                    return;
                }
                WaitStatus::PtraceEvent(_, Signal::SIGTRAP, libc::PTRACE_EVENT_CLONE) => {
                    self.register_clone(tid);
                }
                WaitStatus::Stopped(_, Signal::SIGTRAP) if self.rewind_breakpoint(tid) => {}
                WaitStatus::Stopped(_, sig) => {
                    debug!(target: "tracer", "holding back {} of thread {}", sig, tid);
                    if held.is_none() {
                        held = Some(status);
                    } else {
                        warn!("thread {} lost {} while stopping", tid, sig);
                    }
                }
                _ => debug!(target: "tracer", "thread {} reported {:?} while stopping", tid, status),
            }

            // Let the pending SIGSTOP arrive.
            if let Err(err) = self.platform.cont(tid, None) {
                warn!("failed to resume thread {} towards its stop: {}", tid, err);
                let status = held.unwrap_or(status);
                self.threads
                    .insert(tid.as_raw(), ThreadRecord::stopped(tid, status));
                return;
            }
        }
    }

    /// Moves `tid` back onto the enabled breakpoint it just executed, so that it traps
    /// again once resumed.
    fn rewind_breakpoint(&mut self, tid: Pid) -> bool {
        let code = self.platform.trap_code(tid).map(TrapReason::from_si_code);
        if !matches!(code, Ok(TrapReason::Breakpoint)) {
            return false;
        }
        let mut state = match self.platform.read_state(tid) {
            Ok(state) => state,
            Err(_) => return false,
        };
        let address = state.ip().wrapping_sub(BREAKPOINT_SIZE as u64);
        if !self.breakpoints.find(address).map_or(false, |bp| bp.is_enabled()) {
            return false;
        }

        state.set_ip(address);
        match self.platform.write_state(tid, &state) {
            Ok(()) => {
                debug!(target: "tracer", "thread {} will hit {:#x} again", tid, address);
                true
            }
            Err(err) => {
                warn!("failed to rewind thread {} onto {:#x}: {}", tid, address, err);
                false
            }
        }
    }

    fn reset(&mut self) {
        self.pid = None;
        self.threads.clear();
        self.active_thread = None;
        self.event_thread = None;
        self.launched = false;
    }

    /// The active thread, provided it is stopped.
    fn require_stopped(&self) -> CoreResult<Pid> {
        let tid = self
            .active_thread
            .ok_or(CoreError::InvalidState("not attached"))?;
        match self.thread(tid) {
            Some(record) if record.waited => Ok(tid),
            Some(_) => Err(CoreError::InvalidState("target is running")),
            None => Err(CoreError::InvalidState("active thread is gone")),
        }
    }

    /// Reads the registers of the active thread.
    pub fn get_state(&self) -> CoreResult<CpuState> {
        let tid = self.require_stopped()?;
        self.platform.read_state(tid)
    }

    /// Writes the registers of the active thread. A failed write puts the previous
    /// registers back before returning the error.
    pub fn set_state(&mut self, state: &CpuState) -> CoreResult<()> {
        let tid = self.require_stopped()?;
        let previous = self.platform.read_state(tid)?;
        if let Err(err) = self.platform.write_state(tid, state) {
            if let Err(restore) = self.platform.write_state(tid, &previous) {
                warn!("registers of {} may be inconsistent: {}", tid, restore);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Reads target memory as it is, trap instructions included.
    pub fn read_bytes(&self, address: u64, buf: &mut [u8]) -> CoreResult<()> {
        let tid = self.require_stopped()?;
        self.platform.read_memory(tid, address, buf)
    }

    pub fn write_bytes(&mut self, address: u64, data: &[u8]) -> CoreResult<()> {
        let tid = self.require_stopped()?;
        self.platform.write_memory(tid, address, data)
    }

    /// Reads up to `max` bytes of code at `address`, shrinking the request until a read
    /// succeeds. Breakpoints are replaced by the bytes they cover.
    pub fn read_instruction_bytes(&self, address: u64, max: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0; max];
        for len in (1..=max).rev() {
            if self.read_bytes(address, &mut buf[..len]).is_ok() {
                buf.truncate(len);
                self.breakpoints.shadow(address, &mut buf);
                return Some(buf);
            }
        }
        None
    }

    pub fn memory_regions(&self) -> CoreResult<Vec<MemoryRegion>> {
        let pid = self.pid.ok_or(CoreError::InvalidState("not attached"))?;
        self.platform.memory_regions(pid)
    }

    pub fn add_breakpoint(&mut self, address: u64) -> CoreResult<&mut Breakpoint> {
        let tid = self.require_stopped()?;
        let mut memory = ThreadMemory::new(&mut self.platform, tid);
        self.breakpoints.add(address, &mut memory)
    }

    pub fn remove_breakpoint(&mut self, address: u64) -> CoreResult<()> {
        let tid = self.require_stopped()?;
        let mut memory = ThreadMemory::new(&mut self.platform, tid);
        self.breakpoints.remove(address, &mut memory)
    }

    pub fn enable_breakpoint(&mut self, address: u64) -> CoreResult<bool> {
        let tid = self.require_stopped()?;
        let mut memory = ThreadMemory::new(&mut self.platform, tid);
        self.breakpoints.enable(address, &mut memory)
    }

    pub fn disable_breakpoint(&mut self, address: u64) -> CoreResult<bool> {
        let tid = self.require_stopped()?;
        let mut memory = ThreadMemory::new(&mut self.platform, tid);
        self.breakpoints.disable(address, &mut memory)
    }

    pub fn find_breakpoint(&self, address: u64) -> Option<&Breakpoint> {
        self.breakpoints.find(address)
    }

    /// Access to the flags, condition and hit count of a breakpoint.
    pub fn breakpoint_mut(&mut self, address: u64) -> Option<&mut Breakpoint> {
        self.breakpoints.find_mut(address)
    }

    /// Removes every breakpoint, restoring the original bytes where possible.
    pub fn clear_breakpoints(&mut self) -> CoreResult<()> {
        if self.breakpoints.is_empty() {
            return Ok(());
        }
        match self.require_stopped() {
            Ok(tid) => {
                let mut memory = ThreadMemory::new(&mut self.platform, tid);
                self.breakpoints.clear(&mut memory)
            }
            Err(err) if self.threads.is_empty() => {
                debug!("dropping breakpoints of a target without threads: {}", err);
                self.breakpoints.forget();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub fn breakpoints(&self) -> &BreakpointStore {
        &self.breakpoints
    }

    /// A copy of the breakpoint table.
    pub fn backup_breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.iter().cloned().collect()
    }

    pub fn process_exe(&self, pid: Pid) -> CoreResult<PathBuf> {
        self.platform.process_exe(pid)
    }

    pub fn process_cwd(&self, pid: Pid) -> CoreResult<PathBuf> {
        self.platform.process_cwd(pid)
    }

    pub fn process_args(&self, pid: Pid) -> CoreResult<Vec<String>> {
        self.platform.process_args(pid)
    }

    pub fn parent_pid(&self, pid: Pid) -> CoreResult<Pid> {
        self.platform.parent_pid(pid)
    }

    pub fn enumerate_processes(&self) -> CoreResult<Vec<ProcessInfo>> {
        self.platform.processes()
    }
}

impl<P: Platform> Drop for ProcessControlEngine<P> {
    fn drop(&mut self) {
        if !self.is_attached() {
            return;
        }
        let result = if self.launched && self.config.kill_on_drop {
            self.kill()
        } else {
            self.detach()
        };
        if let Err(err) = result {
            warn!("target was not released cleanly: {}", err);
        }
    }
}
