//! Run-loop policy: what to do with each event, stepping over calls and off breakpoints.

use log::{debug, info, warn};
use nix::sys::signal::Signal;
use std::time::Duration;

use crate::breakpoint::BREAKPOINT_SIZE;
use crate::debugger::Debugger;
use crate::event::{DebugEvent, EventReason, EventStatus, TrapReason};
use crate::handler::DebugEventHandler;
use crate::symbol::source::{Instruction, InstructionKind, MAX_INSTRUCTION_SIZE};
use crate::target::{Platform, Registers};
use crate::CoreResult;

/// Whether a signal that stopped the target is delivered on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionResume {
    Pass,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugMode {
    Run,
    Step,
}

/// The bottom of the handler stack: user breakpoints and signal policy.
pub struct DefaultEventHandler;

impl DefaultEventHandler {
    fn handle_stopped<P: Platform>(&self, dbg: &mut Debugger<P>, event: &DebugEvent) -> EventStatus {
        match event.stop_signal() {
            Some(Signal::SIGTRAP) => self.handle_trap(dbg, event),
            Some(Signal::SIGSTOP) => EventStatus::Stop,
            Some(Signal::SIGCHLD) | Some(Signal::SIGPROF) => EventStatus::ExceptionNotHandled,
            Some(sig) => {
                if event.is_error() {
                    warn!("thread {} faulted with {}", event.tid(), sig);
                } else {
                    info!("thread {} stopped by {}", event.tid(), sig);
                }
                EventStatus::Stop
            }
            None => EventStatus::Stop,
        }
    }

    fn handle_trap<P: Platform>(&self, dbg: &mut Debugger<P>, event: &DebugEvent) -> EventStatus {
        if event.trap_reason() != TrapReason::SingleStep {
            match check_breakpoint(dbg) {
                Ok(Some(status)) => return status,
                Ok(None) => {}
                Err(err) => {
                    warn!("failed to process a breakpoint hit: {}", err);
                    return EventStatus::Stop;
                }
            }
        }

        if dbg.step_run {
            EventStatus::Continue
        } else {
            EventStatus::Stop
        }
    }
}

/// Handles a trap just after an enabled breakpoint: counts the hit, rewinds the
/// instruction pointer onto it and applies its condition and one-time flag.
fn check_breakpoint<P: Platform>(dbg: &mut Debugger<P>) -> CoreResult<Option<EventStatus>> {
    let mut state = dbg.engine().get_state()?;
    let previous_ip = state.ip().wrapping_sub(BREAKPOINT_SIZE as u64);

    let (one_time, condition) = match dbg.engine_mut().breakpoint_mut(previous_ip) {
        Some(bp) if bp.is_enabled() => {
            bp.hit();
            (bp.is_one_time(), bp.condition().map(str::to_owned))
        }
        _ => return Ok(None),
    };

    state.set_ip(previous_ip);
    dbg.engine_mut().set_state(&state)?;
    debug!("breakpoint hit at {}", dbg.describe_address(previous_ip));

    if let Some(condition) = condition {
        if !dbg.condition_holds(&condition, &state) {
            return Ok(Some(EventStatus::Continue));
        }
    }

    if one_time {
        dbg.engine_mut().remove_breakpoint(previous_ip)?;
    }

    Ok(Some(if dbg.step_run {
        EventStatus::Continue
    } else {
        EventStatus::Stop
    }))
}

impl<P: Platform> DebugEventHandler<P> for DefaultEventHandler {
    fn handle_event(&mut self, dbg: &mut Debugger<P>, event: &DebugEvent) -> EventStatus {
        match event.reason() {
            EventReason::Stopped => self.handle_stopped(dbg, event),
            EventReason::Signaled => {
                info!(
                    "process {} was terminated by {:?}",
                    event.pid(),
                    event.terminating_signal()
                );
                EventStatus::Stop
            }
            EventReason::Exited => {
                info!(
                    "process {} exited with code {:?}",
                    event.pid(),
                    event.exit_code()
                );
                EventStatus::Stop
            }
        }
    }
}

/// Single-steps until the current function returns, stepping through the calls it makes.
#[derive(Debug, Default)]
pub struct RunUntilReturn {
    /// Where the call we are stepping through returns to.
    last_call_return: Option<u64>,
    finished: bool,
}

impl RunUntilReturn {
    pub fn new() -> Self {
        RunUntilReturn::default()
    }

    fn forward<P: Platform>(&mut self, dbg: &mut Debugger<P>, event: &DebugEvent) -> EventStatus {
        self.finished = true;
        dbg.dispatch_event(event)
    }
}

impl<P: Platform> DebugEventHandler<P> for RunUntilReturn {
    fn handle_event(&mut self, dbg: &mut Debugger<P>, event: &DebugEvent) -> EventStatus {
        if event.trap_reason() != TrapReason::SingleStep {
            let status = dbg.dispatch_event(event);
            if status == EventStatus::Continue {
                return EventStatus::ContinueStep;
            }
            self.finished = true;
            return status;
        }

        let ip = match dbg.engine().get_state() {
            Ok(state) => state.ip(),
            Err(err) => {
                warn!("lost the instruction pointer while running to return: {}", err);
                return self.forward(dbg, event);
            }
        };

        if self.last_call_return == Some(ip) {
            self.last_call_return = None;
        }

        match dbg.decode_at(ip) {
            Some(insn) if insn.kind == InstructionKind::Return => {
                if self.last_call_return.is_none() {
                    self.forward(dbg, event)
                } else {
                    EventStatus::ContinueStep
                }
            }
            Some(insn) => {
                if self.last_call_return.is_none() && insn.kind == InstructionKind::Call {
                    self.last_call_return = Some(ip + insn.size as u64);
                }
                EventStatus::ContinueStep
            }
            None => {
                warn!("can't decode the instruction at {:#x}", ip);
                self.forward(dbg, event)
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

impl<P: Platform> Debugger<P> {
    /// Waits up to `timeout` for an event and processes it.
    pub fn poll(&mut self, timeout: Duration) -> CoreResult<Option<EventStatus>> {
        match self.engine_mut().wait_debug_event(timeout)? {
            Some(event) => self.process_event(event).map(Some),
            None => Ok(None),
        }
    }

    /// Keeps processing events until one of them stops the target or it goes away.
    pub fn run_until_stop(&mut self, poll_interval: Duration) -> CoreResult<DebugEvent> {
        loop {
            if let Some(EventStatus::Stop) = self.poll(poll_interval)? {
                if let Some(event) = self.last_event {
                    return Ok(event);
                }
            }
            if !self.engine().is_attached() {
                return Err(crate::CoreError::InvalidState("not attached"));
            }
        }
    }

    /// Dispatches `event` and carries out the handler's decision.
    pub fn process_event(&mut self, event: DebugEvent) -> CoreResult<EventStatus> {
        self.last_event = Some(event);
        let status = self.dispatch_event(&event);

        if let Some(address) = self.reenable_breakpoint.take() {
            if self.engine().is_attached() {
                if let Err(err) = self.engine_mut().enable_breakpoint(address) {
                    warn!("failed to re-enable breakpoint at {:#x}: {}", address, err);
                }
            }
        }

        match status {
            EventStatus::Stop => {
                self.step_run = false;
                if self.engine().is_attached() {
                    self.sync_regions();
                    if let Ok(state) = self.engine().get_state() {
                        debug!("stopped at {}", self.describe_address(state.ip()));
                    }
                } else {
                    self.regions_mut().clear();
                }
            }
            EventStatus::Continue => {
                self.resume_execution(ExceptionResume::Ignore, DebugMode::Run)?
            }
            EventStatus::ContinueStep => {
                self.resume_execution(ExceptionResume::Ignore, DebugMode::Step)?
            }
            EventStatus::ExceptionNotHandled => {
                self.resume_execution(ExceptionResume::Pass, DebugMode::Run)?
            }
        }
        Ok(status)
    }

    /// Resumes the target, stepping off a breakpoint under the instruction pointer first.
    pub fn resume_execution(&mut self, pass: ExceptionResume, mode: DebugMode) -> CoreResult<()> {
        if self.step_run {
            self.step_run = false;
            return self.engine_mut().resume(EventStatus::Continue);
        }

        let status = match (pass, self.last_event) {
            (ExceptionResume::Pass, Some(event))
                if event.reason() == EventReason::Stopped && !event.is_trap() =>
            {
                EventStatus::ExceptionNotHandled
            }
            _ => EventStatus::Continue,
        };

        let ip = self.engine().get_state()?.ip();
        let on_breakpoint = self
            .engine()
            .find_breakpoint(ip)
            .map_or(false, |bp| bp.is_enabled());

        if on_breakpoint {
            self.engine_mut().disable_breakpoint(ip)?;
            self.reenable_breakpoint = Some(ip);
            self.step_run = mode == DebugMode::Run;
            // Other threads stay put while the trap is out of the code.
            return self.engine_mut().step_active(status);
        }

        match mode {
            DebugMode::Run => self.engine_mut().resume(status),
            DebugMode::Step => self.engine_mut().step(status),
        }
    }

    pub fn run(&mut self) -> CoreResult<()> {
        self.resume_execution(ExceptionResume::Ignore, DebugMode::Run)
    }

    /// Resumes and delivers the signal that stopped the target.
    pub fn pass_signal_and_run(&mut self) -> CoreResult<()> {
        self.resume_execution(ExceptionResume::Pass, DebugMode::Run)
    }

    pub fn step_into(&mut self) -> CoreResult<()> {
        self.resume_execution(ExceptionResume::Ignore, DebugMode::Step)
    }

    /// Steps one instruction, running through calls with a one-time breakpoint after them.
    pub fn step_over(&mut self) -> CoreResult<()> {
        let ip = self.engine().get_state()?.ip();

        if let Some(insn) = self.decode_at(ip) {
            if insn.is_step_over_target() {
                let return_address = ip + insn.size as u64;
                if self.engine().find_breakpoint(return_address).is_none() {
                    let bp = self.engine_mut().add_breakpoint(return_address)?;
                    bp.set_internal(true);
                    bp.set_one_time(true);
                }
                return self.resume_execution(ExceptionResume::Ignore, DebugMode::Run);
            }
        }

        self.resume_execution(ExceptionResume::Ignore, DebugMode::Step)
    }

    /// Steps until the current function is about to return.
    pub fn run_until_return(&mut self) -> CoreResult<()> {
        self.push_handler(Box::new(RunUntilReturn::new()));
        self.resume_execution(ExceptionResume::Pass, DebugMode::Step)
    }

    /// Decodes the instruction at `address` from the target's code.
    pub fn decode_at(&self, address: u64) -> Option<Instruction> {
        let bytes = self
            .engine()
            .read_instruction_bytes(address, MAX_INSTRUCTION_SIZE)?;
        self.decoder().decode(&bytes, address)
    }
}
