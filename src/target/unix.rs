use nix::{
    sys::ptrace,
    unistd::{execv, fork, ForkResult, Pid},
};
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;

use crate::config::LaunchOptions;
use crate::CoreResult;

const ADDR_NO_RANDOMIZE: libc::c_ulong = 0x0040000;

fn c_string(s: &OsStr) -> CoreResult<CString> {
    Ok(CString::new(s.as_bytes())?)
}

/// Launch a new debuggee process. It stops with `SIGTRAP` right after `execv`; the caller
/// collects that stop.
pub(in crate::target) fn launch(options: &LaunchOptions) -> CoreResult<Pid> {
    // Everything the child needs is allocated up front; after `fork` it only makes raw
    // system calls.
    let path = c_string(options.path.as_os_str())?;
    let mut argv = vec![path.clone()];
    for arg in &options.args {
        argv.push(c_string(arg)?);
    }
    let cwd = options
        .cwd
        .as_ref()
        .map(|cwd| c_string(cwd.as_os_str()))
        .transpose()?;
    let tty = options
        .tty
        .as_ref()
        .map(|tty| c_string(tty.as_os_str()))
        .transpose()?;

    // The child invokes `ptrace(2)` with `PTRACE_TRACEME` so that the parent becomes its
    // tracer. This requires the `CAP_SYS_PTRACE` capability or a permissive
    // `ptrace_scope`, see `man capabilities(7)`.
    match unsafe { fork() }? {
        ForkResult::Parent { child, .. } => Ok(child),
        ForkResult::Child => {
            if ptrace::traceme().is_err() {
                unsafe { libc::_exit(127) };
            }

            unsafe {
                if options.disable_aslr {
                    libc::personality(ADDR_NO_RANDOMIZE);
                }

                if let Some(cwd) = &cwd {
                    if libc::chdir(cwd.as_ptr()) != 0 {
                        libc::_exit(127);
                    }
                }

                if let Some(tty) = &tty {
                    let fd = libc::open(tty.as_ptr(), libc::O_RDWR);
                    if fd < 0 {
                        libc::_exit(127);
                    }
                    for std_fd in 0..3 {
                        libc::dup2(fd, std_fd);
                    }
                    if fd > 2 {
                        libc::close(fd);
                    }
                }
            }

            let _ = execv(&path, &argv);

            // Only reached if `execv` failed.
            unsafe { libc::_exit(127) }
        }
    }
}
