use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Unable to reach target process: {0}")]
    TargetUnreachable(String),

    #[error("Failed to access {len} bytes of target memory at {address:#x}")]
    MemoryAccess { address: u64, len: usize },

    #[error("Breakpoint conflict at {0:#x}: {1}")]
    BreakpointConflict(u64, String),

    /// Breakpoints were dropped but their original bytes could not be written back.
    #[error("Target memory may be left patched at {0:x?}")]
    BreakpointRestore(Vec<u64>),

    #[error("Invalid state transition: {0}")]
    InvalidState(&'static str),

    #[error("Unsupported capability: {0}")]
    Unsupported(&'static str),

    #[error("System call {name} failed inside the target with code {code}")]
    Syscall { name: &'static str, code: i64 },

    #[error("Disassembler error: {0}")]
    Disassembler(String),

    #[error("Error occurred while reading object file: {0}")]
    Object(#[from] object::read::Error),

    #[error("Error occurred while tracing process: {0}")]
    Nix(#[from] nix::Error),

    #[cfg(target_os = "linux")]
    #[error("Error occurred while reading /proc: {0}")]
    // NOTE: If a `ProcError::InternalError` is found this is a bug in the `procfs` crate.
    ProcFs(#[from] procfs::ProcError),

    #[error("{0}")]
    StdIo(#[from] std::io::Error),

    #[error("{0}")]
    FfiNull(#[from] std::ffi::NulError),
}

impl CoreError {
    pub(crate) fn memory(address: u64, len: usize) -> Self {
        CoreError::MemoryAccess { address, len }
    }
}

impl From<capstone::Error> for CoreError {
    fn from(err: capstone::Error) -> Self {
        CoreError::Disassembler(err.to_string())
    }
}
