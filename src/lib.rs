//! Debugcore, the process-control core of a native-code debugger.
//!
//! The crate is layered leaves first: [`target`] holds the platform primitives and the CPU
//! state, [`breakpoint`] and [`region`] model the target's code patches and address space,
//! [`engine`] owns the tracing relationship, and [`debugger`] with [`handler`] and [`run`]
//! turns raw events into run-loop decisions.

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("debugcore currently supports only Linux on x86-64");

mod error;
pub use error::CoreError;

pub type CoreResult<T> = Result<T, CoreError>;

pub mod config;

/// Functions to work with target processes: tracing primitives, memory, registers.
pub mod target;

pub mod breakpoint;
pub mod event;
pub mod engine;
pub mod handler;
pub mod region;
pub mod debugger;
pub mod run;

/// Collaborator contracts: instruction decoding, binary introspection, symbols.
pub mod symbol;

pub use config::{Config, InitialBreakpoint, LaunchOptions};
pub use debugger::Debugger;
pub use engine::ProcessControlEngine;
pub use event::{DebugEvent, EventReason, EventStatus, TrapReason};
