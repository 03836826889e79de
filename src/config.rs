//! Options for launching targets and tuning the run loop.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Where a one-time breakpoint is placed right after a target is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialBreakpoint {
    None,
    EntryPoint,
    MainSymbol,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub initial_breakpoint: InitialBreakpoint,
    /// Ask the binary collaborator for `main` when the symbol manager doesn't know it.
    pub find_main: bool,
    /// Granularity of the bounded wait in `wait_debug_event`.
    pub poll_interval: Duration,
    /// Single-step only the active thread and keep the others frozen.
    pub lock_scheduler_on_step: bool,
    /// Kill a launched target instead of detaching when the engine is dropped.
    pub kill_on_drop: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            initial_breakpoint: InitialBreakpoint::MainSymbol,
            find_main: true,
            poll_interval: Duration::from_millis(1),
            lock_scheduler_on_step: false,
            kill_on_drop: true,
        }
    }
}

/// Describes how a new debuggee is started.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub path: PathBuf,
    pub cwd: Option<PathBuf>,
    /// Arguments after `argv[0]`, which is always `path`.
    pub args: Vec<OsString>,
    /// Terminal device to reopen the standard streams on.
    pub tty: Option<PathBuf>,
    pub disable_aslr: bool,
}

impl LaunchOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LaunchOptions {
            path: path.into(),
            disable_aslr: true,
            ..Default::default()
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn tty(mut self, tty: impl Into<PathBuf>) -> Self {
        self.tty = Some(tty.into());
        self
    }
}
