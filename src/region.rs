//! The target's address space: regions, lookups and permission changes.

use log::{debug, warn};
use nix::sys::signal::Signal;
use std::cell::Cell;
use std::fmt;
use std::path::Path;
use std::rc::Rc;

use crate::debugger::Debugger;
use crate::engine::ProcessControlEngine;
use crate::event::{DebugEvent, EventReason, EventStatus};
use crate::handler::DebugEventHandler;
use crate::target::{CpuState, Platform, Registers};
use crate::{CoreError, CoreResult};

bitflags::bitflags! {
    /// Page protection bits, valued like `PROT_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u32 {
        const READ = libc::PROT_READ as u32;
        const WRITE = libc::PROT_WRITE as u32;
        const EXECUTE = libc::PROT_EXEC as u32;
    }
}

impl Permissions {
    pub fn from_flags(read: bool, write: bool, execute: bool) -> Self {
        let mut perms = Permissions::empty();
        perms.set(Permissions::READ, read);
        perms.set(Permissions::WRITE, write);
        perms.set(Permissions::EXECUTE, execute);
        perms
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |perm, c| if self.contains(perm) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(Permissions::READ, 'r'),
            flag(Permissions::WRITE, 'w'),
            flag(Permissions::EXECUTE, 'x')
        )
    }
}

/// A contiguous mapping of the target with uniform permissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    /// Exclusive end.
    pub end: u64,
    /// Offset of the mapping in its backing file.
    pub base: u64,
    /// Backing file path or a synthetic label like `[heap]`; empty for anonymous memory.
    pub name: String,
    pub permissions: Permissions,
}

impl MemoryRegion {
    pub fn new(
        start: u64,
        end: u64,
        base: u64,
        name: impl Into<String>,
        permissions: Permissions,
    ) -> Self {
        debug_assert!(start < end, "empty region {:#x}-{:#x}", start, end);
        MemoryRegion {
            start,
            end,
            base,
            name: name.into(),
            permissions,
        }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }

    pub fn readable(&self) -> bool {
        self.permissions.contains(Permissions::READ)
    }

    pub fn writable(&self) -> bool {
        self.permissions.contains(Permissions::WRITE)
    }

    pub fn executable(&self) -> bool {
        self.permissions.contains(Permissions::EXECUTE)
    }

    pub fn accessible(&self) -> bool {
        !self.permissions.is_empty()
    }

    /// Whether this maps a real file rather than anonymous memory or a kernel label
    /// like `[vdso]`.
    pub fn is_file_backed(&self) -> bool {
        !self.name.is_empty() && !self.name.starts_with('[')
    }

    /// Whether this is the first mapping of a file. Linkers often map the headers
    /// read-only and the code at a later offset, so permissions don't matter here.
    pub fn is_module(&self) -> bool {
        self.is_file_backed() && self.base == 0
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}-{:016x} {} {:08x} {}",
            self.start, self.end, self.permissions, self.base, self.name
        )
    }
}

/// The ordered list of regions of the current target.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegions {
    regions: Vec<MemoryRegion>,
}

impl MemoryRegions {
    pub fn new() -> Self {
        MemoryRegions::default()
    }

    /// Replaces the whole list with the operating system's current view.
    /// `on_module` is called for every region that looks like a loadable module.
    pub fn sync<P: Platform>(
        &mut self,
        engine: &ProcessControlEngine<P>,
        mut on_module: impl FnMut(&MemoryRegion),
    ) -> CoreResult<()> {
        let regions = match engine.pid() {
            Some(_) => engine.memory_regions()?,
            None => Vec::new(),
        };

        for region in modules(&regions) {
            on_module(region);
        }

        if regions.is_empty() && engine.is_attached() {
            warn!("the target reported an empty memory map");
        }

        self.regions = regions;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// The first region containing `address`.
    pub fn find_region(&self, address: u64) -> Option<&MemoryRegion> {
        self.regions.iter().find(|region| region.contains(address))
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// First mappings of the files that have code mapped somewhere.
    pub fn modules(&self) -> impl Iterator<Item = &MemoryRegion> {
        modules(&self.regions)
    }

    /// The first mapping of the executable at `exe`.
    pub fn main_module(&self, exe: &Path) -> Option<&MemoryRegion> {
        self.modules().find(|region| Path::new(&region.name) == exe)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    fn set_cached_permissions(&mut self, start: u64, permissions: Permissions) {
        if let Some(region) = self.regions.iter_mut().find(|r| r.start == start) {
            region.permissions = permissions;
        }
    }
}

fn modules(regions: &[MemoryRegion]) -> impl Iterator<Item = &MemoryRegion> {
    regions.iter().filter(move |region| {
        region.is_module()
            && regions
                .iter()
                .any(|other| other.executable() && other.name == region.name)
    })
}

impl From<Vec<MemoryRegion>> for MemoryRegions {
    fn from(regions: Vec<MemoryRegion>) -> Self {
        MemoryRegions { regions }
    }
}

/// `syscall; hlt`. The `hlt` faults in user mode and hands control back to us.
pub const SYSCALL_STUB: [u8; 3] = [0x0f, 0x05, 0xf4];

/// Temporary handler that waits for the injected `mprotect` to fault on `hlt`.
struct PermissionChange {
    tid: nix::unistd::Pid,
    site: u64,
    saved_state: CpuState,
    saved_code: [u8; SYSCALL_STUB.len()],
    region_start: u64,
    permissions: Permissions,
    outcome: Rc<Cell<Option<Result<(), i64>>>>,
    finished: bool,
}

impl PermissionChange {
    fn restore<P: Platform>(&self, engine: &mut ProcessControlEngine<P>) -> CoreResult<()> {
        engine.write_bytes(self.site, &self.saved_code)?;
        engine.set_state(&self.saved_state)
    }
}

impl<P: Platform> DebugEventHandler<P> for PermissionChange {
    fn handle_event(&mut self, dbg: &mut Debugger<P>, event: &DebugEvent) -> EventStatus {
        if event.tid() != self.tid {
            return dbg.dispatch_event(event);
        }

        self.finished = true;
        if event.reason() != EventReason::Stopped {
            warn!("target terminated while changing page permissions");
            self.outcome.set(Some(Err(-i64::from(libc::ESRCH))));
            return EventStatus::Stop;
        }

        let result = match dbg.engine().get_state() {
            Ok(state) if event.stop_signal() == Some(Signal::SIGSEGV) => {
                let ip = state.ip();
                if ip < self.site || ip > self.site + SYSCALL_STUB.len() as u64 {
                    warn!("unexpected fault at {:#x} while changing page permissions", ip);
                }
                match state.regs().rax as i64 {
                    0 => Ok(()),
                    code => Err(code),
                }
            }
            Ok(_) => {
                warn!("unexpected {:?} while changing page permissions", event.status());
                Err(-i64::from(libc::EINTR))
            }
            Err(err) => {
                warn!("failed to read the result of mprotect: {}", err);
                Err(-i64::from(libc::EIO))
            }
        };

        if let Err(err) = self.restore(dbg.engine_mut()) {
            warn!("failed to restore the injection site at {:#x}: {}", self.site, err);
        }

        if result.is_ok() {
            dbg.regions_mut()
                .set_cached_permissions(self.region_start, self.permissions);
        }
        self.outcome.set(Some(result));
        EventStatus::Stop
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

impl<P: Platform> Debugger<P> {
    /// Changes the protection of the region containing `address` by making the target run
    /// `mprotect` on itself. Blocks until the injected code has faulted back.
    pub fn set_region_permissions(
        &mut self,
        address: u64,
        read: bool,
        write: bool,
        execute: bool,
    ) -> CoreResult<()> {
        let region = self
            .regions()
            .find_region(address)
            .cloned()
            .ok_or(CoreError::memory(address, 0))?;
        let permissions = Permissions::from_flags(read, write, execute);

        let executable = self
            .regions()
            .regions()
            .iter()
            .filter(|r| r.executable())
            .collect::<Vec<_>>();
        if region.executable() && !execute && executable.len() == 1 {
            return Err(CoreError::Unsupported(
                "removing execute permission from the last executable region",
            ));
        }
        let site = executable
            .first()
            .map(|r| r.start)
            .ok_or(CoreError::Unsupported("no executable region to host injected code"))?;

        let tid = self
            .engine()
            .active_thread()
            .ok_or(CoreError::InvalidState("not attached"))?;
        let saved_state = self.engine().get_state()?;
        let mut saved_code = [0; SYSCALL_STUB.len()];
        self.engine().read_bytes(site, &mut saved_code)?;

        let mut state = saved_state;
        state.set_ip(site);
        let args = [
            ("rax", libc::SYS_mprotect as u64),
            ("rdi", region.start),
            ("rsi", region.size()),
            ("rdx", u64::from(permissions.bits())),
        ];
        for (name, value) in args {
            state
                .set_value(name, value)
                .ok_or(CoreError::Unsupported("syscall argument register"))?;
        }

        self.engine_mut().write_bytes(site, &SYSCALL_STUB)?;
        if let Err(err) = self.engine_mut().set_state(&state) {
            self.engine_mut().write_bytes(site, &saved_code)?;
            return Err(err);
        }

        debug!(
            "changing {:#x}-{:#x} to {} through code injected at {:#x}",
            region.start, region.end, permissions, site
        );

        let outcome = Rc::new(Cell::new(None));
        self.push_handler(Box::new(PermissionChange {
            tid,
            site,
            saved_state,
            saved_code,
            region_start: region.start,
            permissions,
            outcome: outcome.clone(),
            finished: false,
        }));

        self.engine_mut().resume_active(EventStatus::Continue)?;
        loop {
            if let Some(result) = outcome.get() {
                return result.map_err(|code| CoreError::Syscall {
                    name: "mprotect",
                    code,
                });
            }
            if !self.engine().is_attached() {
                return Err(CoreError::TargetUnreachable(
                    "target exited while changing page permissions".into(),
                ));
            }
            let poll_interval = self.config().poll_interval;
            if let Some(event) = self.engine_mut().wait_debug_event(poll_interval)? {
                self.dispatch_event(&event);
                if outcome.get().is_none() {
                    self.engine_mut().resume_active(EventStatus::Continue)?;
                }
            }
        }
    }
}
