//! Software breakpoints.
//! A software breakpoint overwrites the target's code with an instruction that makes the
//! cpu raise a trap, keeping the replaced bytes so they can be put back.

use log::{debug, warn};
use std::collections::BTreeMap;

use crate::target::{CpuState, MemoryAccess};
use crate::{CoreError, CoreResult};

/// Length of the trap instruction.
pub const BREAKPOINT_SIZE: usize = 1;

/// `int3`
pub const TRAP_ENCODING: [u8; BREAKPOINT_SIZE] = [0xcc];

/// Evaluates breakpoint conditions. Implemented outside of the core.
pub trait ConditionEvaluator {
    /// Returns `None` when `expression` can't be evaluated.
    fn evaluate(&self, expression: &str, state: &CpuState) -> Option<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    address: u64,
    /// The bytes overwritten by the trap instruction.
    original_bytes: [u8; BREAKPOINT_SIZE],
    hit_count: u64,
    enabled: bool,
    one_time: bool,
    internal: bool,
    condition: Option<String>,
}

impl Breakpoint {
    fn new(address: u64) -> Self {
        Breakpoint {
            address,
            original_bytes: [0; BREAKPOINT_SIZE],
            hit_count: 0,
            enabled: false,
            one_time: false,
            internal: false,
            condition: None,
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn original_bytes(&self) -> &[u8; BREAKPOINT_SIZE] {
        &self.original_bytes
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    pub fn hit(&mut self) {
        self.hit_count += 1;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_one_time(&self) -> bool {
        self.one_time
    }

    pub fn set_one_time(&mut self, one_time: bool) {
        self.one_time = one_time;
    }

    /// Internal breakpoints are placed by run-loop policies and hidden from users.
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn set_internal(&mut self, internal: bool) {
        self.internal = internal;
    }

    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    pub fn set_condition(&mut self, condition: Option<String>) {
        self.condition = condition.filter(|c| !c.trim().is_empty());
    }

    /// Put in place the trap instruction.
    pub(crate) fn enable<M: MemoryAccess + ?Sized>(&mut self, memory: &mut M) -> CoreResult<()> {
        // Enabling twice would back up our own trap instruction.
        if self.enabled {
            return Ok(());
        }
        let mut original = [0; BREAKPOINT_SIZE];
        memory.read_bytes(self.address, &mut original)?;
        memory.write_bytes(self.address, &TRAP_ENCODING)?;
        self.original_bytes = original;
        self.enabled = true;
        Ok(())
    }

    /// Restore the instruction replaced by the trap.
    pub(crate) fn disable<M: MemoryAccess + ?Sized>(&mut self, memory: &mut M) -> CoreResult<()> {
        if !self.enabled {
            return Ok(());
        }
        memory.write_bytes(self.address, &self.original_bytes)?;
        self.enabled = false;
        Ok(())
    }

    /// Overlays the original bytes on `buf`, a copy of target memory starting at `address`.
    fn shadow(&self, address: u64, buf: &mut [u8]) {
        if !self.enabled {
            return;
        }
        for (i, byte) in self.original_bytes.iter().enumerate() {
            let at = self.address + i as u64;
            if at >= address && at - address < buf.len() as u64 {
                buf[(at - address) as usize] = *byte;
            }
        }
    }
}

/// Installed breakpoints, at most one per address.
#[derive(Debug, Default)]
pub struct BreakpointStore {
    breakpoints: BTreeMap<u64, Breakpoint>,
}

impl BreakpointStore {
    pub fn new() -> Self {
        BreakpointStore::default()
    }

    /// Installs an enabled breakpoint at `address`, or returns the one already there.
    /// Nothing is registered when target memory can't be patched.
    pub fn add<M: MemoryAccess + ?Sized>(
        &mut self,
        address: u64,
        memory: &mut M,
    ) -> CoreResult<&mut Breakpoint> {
        if !self.breakpoints.contains_key(&address) {
            let mut bp = Breakpoint::new(address);
            bp.enable(memory).map_err(|err| {
                debug!("failed to patch {:#x}: {}", address, err);
                CoreError::BreakpointConflict(address, "memory is not writable".into())
            })?;
            self.breakpoints.insert(address, bp);
        }
        self.breakpoints
            .get_mut(&address)
            .ok_or(CoreError::InvalidState("breakpoint vanished"))
    }

    /// Drops the breakpoint at `address`, restoring the original bytes first.
    /// The entry is removed even when the bytes can't be restored.
    pub fn remove<M: MemoryAccess + ?Sized>(
        &mut self,
        address: u64,
        memory: &mut M,
    ) -> CoreResult<()> {
        if let Some(mut bp) = self.breakpoints.remove(&address) {
            if let Err(err) = bp.disable(memory) {
                warn!("breakpoint at {:#x} removed but not restored: {}", address, err);
                return Err(CoreError::BreakpointRestore(vec![address]));
            }
        }
        Ok(())
    }

    /// Returns `Ok(false)` if there is no breakpoint at `address`.
    pub fn enable<M: MemoryAccess + ?Sized>(
        &mut self,
        address: u64,
        memory: &mut M,
    ) -> CoreResult<bool> {
        match self.breakpoints.get_mut(&address) {
            Some(bp) => bp.enable(memory).map(|_| true),
            None => Ok(false),
        }
    }

    /// Returns `Ok(false)` if there is no breakpoint at `address`.
    pub fn disable<M: MemoryAccess + ?Sized>(
        &mut self,
        address: u64,
        memory: &mut M,
    ) -> CoreResult<bool> {
        match self.breakpoints.get_mut(&address) {
            Some(bp) => bp.disable(memory).map(|_| true),
            None => Ok(false),
        }
    }

    pub fn find(&self, address: u64) -> Option<&Breakpoint> {
        self.breakpoints.get(&address)
    }

    pub fn find_mut(&mut self, address: u64) -> Option<&mut Breakpoint> {
        self.breakpoints.get_mut(&address)
    }

    /// Removes every breakpoint. All entries are dropped; addresses whose bytes couldn't be
    /// restored are reported together.
    pub fn clear<M: MemoryAccess + ?Sized>(&mut self, memory: &mut M) -> CoreResult<()> {
        let mut patched = Vec::new();
        for (address, mut bp) in std::mem::take(&mut self.breakpoints) {
            if let Err(err) = bp.disable(memory) {
                warn!("breakpoint at {:#x} removed but not restored: {}", address, err);
                patched.push(address);
            }
        }
        if patched.is_empty() {
            Ok(())
        } else {
            Err(CoreError::BreakpointRestore(patched))
        }
    }

    /// Drops every entry without touching memory, for when the address space is gone.
    pub fn forget(&mut self) {
        self.breakpoints.clear();
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn user_breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.iter().filter(|bp| !bp.internal)
    }

    /// Breakpoints overlapping `[address, address + len)`.
    pub fn overlapping(&self, address: u64, len: usize) -> Vec<u64> {
        let start = address.saturating_sub(BREAKPOINT_SIZE as u64 - 1);
        self.breakpoints
            .range(start..address.saturating_add(len as u64))
            .map(|(address, _)| *address)
            .collect()
    }

    /// Replaces trap bytes in `buf`, read from `address`, with the original code.
    pub fn shadow(&self, address: u64, buf: &mut [u8]) {
        for bp in self.overlapping(address, buf.len()) {
            if let Some(bp) = self.breakpoints.get(&bp) {
                bp.shadow(address, buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// A flat address space starting at `BASE`, with optionally read-only bytes.
    struct FakeMemory {
        bytes: Vec<u8>,
        read_only: HashSet<u64>,
    }

    const BASE: u64 = 0x401000;

    impl FakeMemory {
        fn new() -> Self {
            FakeMemory {
                bytes: (0..0x100).map(|i| i as u8).collect(),
                read_only: HashSet::new(),
            }
        }

        fn byte(&self, address: u64) -> u8 {
            self.bytes[(address - BASE) as usize]
        }
    }

    impl MemoryAccess for FakeMemory {
        fn read_bytes(&self, address: u64, buf: &mut [u8]) -> CoreResult<()> {
            let start = address
                .checked_sub(BASE)
                .filter(|off| *off as usize + buf.len() <= self.bytes.len())
                .ok_or(CoreError::memory(address, buf.len()))? as usize;
            buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
            Ok(())
        }

        fn write_bytes(&mut self, address: u64, data: &[u8]) -> CoreResult<()> {
            let blocked = (0..data.len() as u64).any(|i| self.read_only.contains(&(address + i)));
            let start = address
                .checked_sub(BASE)
                .filter(|off| !blocked && *off as usize + data.len() <= self.bytes.len())
                .ok_or(CoreError::memory(address, data.len()))? as usize;
            self.bytes[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    #[test]
    fn add_and_remove_restore_memory() {
        let mut memory = FakeMemory::new();
        let mut store = BreakpointStore::new();
        let address = BASE + 0x55;

        let bp = store.add(address, &mut memory).unwrap();
        assert!(bp.is_enabled());
        assert_eq!(bp.original_bytes(), &[0x55]);
        assert_eq!(memory.byte(address), 0xcc);

        store.remove(address, &mut memory).unwrap();
        assert_eq!(memory.byte(address), 0x55);
        assert!(store.is_empty());
    }

    #[test]
    fn enable_disable_round_trip() {
        let mut memory = FakeMemory::new();
        let mut store = BreakpointStore::new();
        let address = BASE + 0x10;
        store.add(address, &mut memory).unwrap();

        assert!(store.disable(address, &mut memory).unwrap());
        assert_eq!(memory.byte(address), 0x10);
        assert!(store.enable(address, &mut memory).unwrap());
        assert_eq!(memory.byte(address), 0xcc);
        // Enabling an enabled breakpoint must not back up the trap instruction.
        assert!(store.enable(address, &mut memory).unwrap());
        assert_eq!(store.find(address).unwrap().original_bytes(), &[0x10]);

        assert!(!store.enable(BASE + 0x11, &mut memory).unwrap());
    }

    #[test]
    fn add_twice_keeps_one_entry() {
        let mut memory = FakeMemory::new();
        let mut store = BreakpointStore::new();
        store.add(BASE, &mut memory).unwrap().hit();
        let bp = store.add(BASE, &mut memory).unwrap();
        assert_eq!(bp.hit_count(), 1);
        assert_eq!(bp.original_bytes(), &[0x00]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn failed_install_leaves_nothing() {
        let mut memory = FakeMemory::new();
        memory.read_only.insert(BASE + 1);
        let mut store = BreakpointStore::new();

        assert!(matches!(
            store.add(BASE + 1, &mut memory),
            Err(CoreError::BreakpointConflict(..))
        ));
        assert!(store.is_empty());
        assert_eq!(memory.byte(BASE + 1), 0x01);

        assert!(store.add(BASE - 1, &mut memory).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn failed_restore_still_drops_entry() {
        let mut memory = FakeMemory::new();
        let mut store = BreakpointStore::new();
        store.add(BASE + 2, &mut memory).unwrap();
        store.add(BASE + 3, &mut memory).unwrap();
        memory.read_only.insert(BASE + 2);

        match store.clear(&mut memory) {
            Err(CoreError::BreakpointRestore(addresses)) => assert_eq!(addresses, vec![BASE + 2]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(store.is_empty());
        assert_eq!(memory.byte(BASE + 3), 0x03);
        assert_eq!(memory.byte(BASE + 2), 0xcc);

        // Clearing an empty store is a no-op.
        store.clear(&mut memory).unwrap();
    }

    #[test]
    fn shadow_hides_enabled_traps() {
        let mut memory = FakeMemory::new();
        let mut store = BreakpointStore::new();
        store.add(BASE + 4, &mut memory).unwrap();
        store.add(BASE + 6, &mut memory).unwrap();
        store.disable(BASE + 6, &mut memory).unwrap();

        let mut buf = [0; 4];
        memory.read_bytes(BASE + 3, &mut buf).unwrap();
        assert_eq!(buf, [0x03, 0xcc, 0x05, 0x06]);
        store.shadow(BASE + 3, &mut buf);
        assert_eq!(buf, [0x03, 0x04, 0x05, 0x06]);
    }

    #[test]
    fn internal_breakpoints_are_hidden() {
        let mut memory = FakeMemory::new();
        let mut store = BreakpointStore::new();
        store.add(BASE, &mut memory).unwrap();
        store.add(BASE + 8, &mut memory).unwrap().set_internal(true);

        let user = store.user_breakpoints().map(|bp| bp.address()).collect::<Vec<_>>();
        assert_eq!(user, vec![BASE]);
        assert_eq!(store.overlapping(BASE + 8, 1), vec![BASE + 8]);
        assert!(store.overlapping(BASE + 1, 7).is_empty());
    }
}
