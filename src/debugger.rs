//! The debugging session: engine, address space, handlers and collaborators in one place.

use log::{debug, info, warn};
use nix::unistd::Pid;
use std::path::Path;

use crate::breakpoint::{Breakpoint, ConditionEvaluator};
use crate::config::{Config, InitialBreakpoint, LaunchOptions};
use crate::engine::ProcessControlEngine;
use crate::event::DebugEvent;
use crate::handler::HandlerStack;
use crate::region::MemoryRegions;
use crate::run::DefaultEventHandler;
use crate::symbol::binary::{BinaryInfo, ElfBinary};
use crate::symbol::source::InstructionDecoder;
use crate::symbol::SymbolManager;
use crate::target::Platform;
use crate::{CoreError, CoreResult};

#[cfg(target_os = "linux")]
use crate::target::LinuxPlatform;

/// Owns everything a debugging session needs. All core operations go through it.
pub struct Debugger<P: Platform> {
    engine: ProcessControlEngine<P>,
    regions: MemoryRegions,
    pub(crate) handlers: HandlerStack<P>,
    decoder: Box<dyn InstructionDecoder>,
    symbols: Option<Box<dyn SymbolManager>>,
    evaluator: Option<Box<dyn ConditionEvaluator>>,
    config: Config,
    /// Set while stepping off a breakpoint on the way to a plain run.
    pub(crate) step_run: bool,
    /// Breakpoint disabled to step off it, enabled again after the next event.
    pub(crate) reenable_breakpoint: Option<u64>,
    pub(crate) last_event: Option<DebugEvent>,
}

#[cfg(target_os = "linux")]
impl Debugger<LinuxPlatform> {
    /// A debugger for local processes using the capstone decoder.
    pub fn native(config: Config) -> CoreResult<Self> {
        let decoder = crate::symbol::source::DisassemblySource::new()?;
        Ok(Debugger::new(LinuxPlatform::new(), Box::new(decoder), config))
    }
}

impl<P: Platform> Debugger<P> {
    pub fn new(platform: P, decoder: Box<dyn InstructionDecoder>, config: Config) -> Self {
        let mut handlers = HandlerStack::new();
        handlers.push(Box::new(DefaultEventHandler));
        Debugger {
            engine: ProcessControlEngine::new(platform, config.clone()),
            regions: MemoryRegions::new(),
            handlers,
            decoder,
            symbols: None,
            evaluator: None,
            config,
            step_run: false,
            reenable_breakpoint: None,
            last_event: None,
        }
    }

    pub fn with_symbols(mut self, symbols: Box<dyn SymbolManager>) -> Self {
        self.symbols = Some(symbols);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Box<dyn ConditionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn engine(&self) -> &ProcessControlEngine<P> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ProcessControlEngine<P> {
        &mut self.engine
    }

    pub fn regions(&self) -> &MemoryRegions {
        &self.regions
    }

    pub(crate) fn regions_mut(&mut self) -> &mut MemoryRegions {
        &mut self.regions
    }

    pub fn decoder(&self) -> &dyn InstructionDecoder {
        self.decoder.as_ref()
    }

    pub fn symbols(&self) -> Option<&dyn SymbolManager> {
        self.symbols.as_deref()
    }

    pub fn evaluator(&self) -> Option<&dyn ConditionEvaluator> {
        self.evaluator.as_deref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn last_event(&self) -> Option<&DebugEvent> {
        self.last_event.as_ref()
    }

    pub fn attach(&mut self, pid: Pid) -> CoreResult<()> {
        self.reset_run_state();
        self.engine.attach(pid)?;
        self.sync_regions();
        Ok(())
    }

    /// Launches a target, loads its memory map and places the initial breakpoint.
    pub fn open(&mut self, options: &LaunchOptions) -> CoreResult<()> {
        self.reset_run_state();
        self.engine.open(options)?;
        self.sync_regions();
        if let Err(err) = self.set_initial_breakpoint(&options.path) {
            warn!("no initial breakpoint for {:?}: {}", options.path, err);
        }
        Ok(())
    }

    pub fn detach(&mut self) -> CoreResult<()> {
        self.reset_run_state();
        self.regions.clear();
        self.engine.detach()
    }

    pub fn kill(&mut self) -> CoreResult<()> {
        self.reset_run_state();
        self.regions.clear();
        self.engine.kill()
    }

    fn reset_run_state(&mut self) {
        self.step_run = false;
        self.reenable_breakpoint = None;
        self.last_event = None;
    }

    /// Reloads the memory map, asking the symbol manager to load every module it sees.
    pub fn sync_regions(&mut self) {
        let symbols = &mut self.symbols;
        let result = self.regions.sync(&self.engine, |region| {
            if let Some(symbols) = symbols.as_mut() {
                if let Err(err) = symbols.load_symbol_file(Path::new(&region.name), region.start) {
                    debug!("no symbols for {}: {}", region.name, err);
                }
            }
        });
        if let Err(err) = result {
            warn!("failed to read the memory map: {}", err);
        }
    }

    fn set_initial_breakpoint(&mut self, path: &Path) -> CoreResult<()> {
        if self.config.initial_breakpoint == InitialBreakpoint::None {
            return Ok(());
        }

        // The map names the file the kernel resolved, so `path` may be a symlink to it.
        let exe = self
            .engine
            .pid()
            .and_then(|pid| self.engine.process_exe(pid).ok())
            .or_else(|| std::fs::canonicalize(path).ok())
            .unwrap_or_else(|| path.to_path_buf());
        let module = self
            .regions
            .main_module(&exe)
            .or_else(|| self.regions.modules().next())
            .cloned()
            .ok_or(CoreError::InvalidState("main module is not mapped"))?;
        debug!("main module {}", module);
        let binary = ElfBinary::from_region(&module)?;
        if !binary.validate_header() || !binary.native() {
            return Err(CoreError::Unsupported("not a native executable"));
        }

        let mut address = None;
        if self.config.initial_breakpoint == InitialBreakpoint::MainSymbol {
            address = self.symbols.as_ref().and_then(|symbols| symbols.find("main"));
            if address.is_none() && self.config.find_main {
                address = binary.calculate_main();
            }
        }
        let address = address.unwrap_or_else(|| binary.entry_point());

        let bp = self.engine.add_breakpoint(address)?;
        bp.set_one_time(true);
        bp.set_internal(true);
        info!("initial breakpoint at {}", self.describe_address(address));
        Ok(())
    }

    /// Adds a user breakpoint after checking that `address` is mapped.
    pub fn create_breakpoint(&mut self, address: u64) -> CoreResult<&mut Breakpoint> {
        let region = self
            .regions
            .find_region(address)
            .ok_or(CoreError::memory(address, 0))?;
        if !region.executable() {
            warn!(
                "breakpoint at {:#x} is in non-executable region {}",
                address, region
            );
        }
        self.engine.add_breakpoint(address)
    }

    /// Removes the breakpoint at `address` if there is one, otherwise creates it.
    pub fn toggle_breakpoint(&mut self, address: u64) -> CoreResult<()> {
        if self.engine.find_breakpoint(address).is_some() {
            self.engine.remove_breakpoint(address)
        } else {
            self.create_breakpoint(address).map(|_| ())
        }
    }

    pub fn set_breakpoint_condition(
        &mut self,
        address: u64,
        condition: Option<String>,
    ) -> CoreResult<()> {
        self.engine
            .breakpoint_mut(address)
            .ok_or(CoreError::InvalidState("no breakpoint at this address"))?
            .set_condition(condition);
        Ok(())
    }

    pub fn user_breakpoints(&self) -> Vec<Breakpoint> {
        self.engine
            .breakpoints()
            .user_breakpoints()
            .cloned()
            .collect()
    }

    /// Whether a breakpoint condition holds for `state`. Conditions that can't be evaluated
    /// count as true so the user gets to look at them.
    pub(crate) fn condition_holds(&self, condition: &str, state: &crate::target::CpuState) -> bool {
        match &self.evaluator {
            Some(evaluator) => match evaluator.evaluate(condition, state) {
                Some(value) => value != 0,
                None => {
                    warn!("can't evaluate breakpoint condition `{}`", condition);
                    true
                }
            },
            None => {
                warn!("no evaluator for breakpoint condition `{}`", condition);
                true
            }
        }
    }

    /// Writes to target memory, first removing the breakpoints in the written range.
    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> CoreResult<()> {
        for bp in self.engine.breakpoints().overlapping(address, data.len()) {
            self.engine.remove_breakpoint(bp)?;
        }
        self.engine.write_bytes(address, data)
    }

    /// `symbol+0xoff` when the symbol manager knows `address`, hex otherwise.
    pub fn describe_address(&self, address: u64) -> String {
        match self.symbols.as_ref().and_then(|s| s.find_near(address)) {
            Some(symbol) if symbol.offset == 0 => format!("{:#x} <{}>", address, symbol.name),
            Some(symbol) => format!("{:#x} <{}+{:#x}>", address, symbol.name, symbol.offset),
            None => format!("{:#x}", address),
        }
    }
}
