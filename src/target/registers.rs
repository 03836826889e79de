//! CPU state snapshots and register access.

use std::fmt::{self, Debug};

/// Trait that can be used to read & write the target's registers.
pub trait Registers: Debug {
    /// Returns a current instruction pointer.
    fn ip(&self) -> u64;

    /// Sets an instruction pointer to the provided value.
    fn set_ip(&mut self, ip: u64);

    /// Returns a current stack pointer.
    fn sp(&self) -> u64;

    /// Sets a stack pointer to the provided value.
    fn set_sp(&mut self, sp: u64);

    /// Returns a frame pointer.
    /// Returns `None` if the standard ABI on the platform has no frame pointer.
    fn bp(&self) -> Option<u64>;

    /// Sets a frame pointer to the provided value.
    #[must_use]
    fn set_bp(&mut self, bp: u64) -> Option<()>;

    /// Translates a DWARF register into a value.
    /// Returns `None` when a specified register doesn't exist or is wider than 64 bits.
    fn reg_for_dwarf(&self, reg: gimli::Register) -> Option<u64>;

    /// Sets a DWARF register to the provided value.
    #[must_use]
    fn set_reg_for_dwarf(&mut self, reg: gimli::Register, val: u64) -> Option<()>;

    /// Converts a DWARF register into its name.
    fn name_for_dwarf(reg: gimli::Register) -> Option<&'static str>
    where
        Self: Sized;

    /// Converts a register name into a DWARF register.
    fn dwarf_for_name(name: &str) -> Option<gimli::Register>
    where
        Self: Sized;
}

const FLAG_NAMES: [(u32, &str); 9] = [
    (0, "CF"),
    (2, "PF"),
    (4, "AF"),
    (6, "ZF"),
    (7, "SF"),
    (8, "TF"),
    (9, "IF"),
    (10, "DF"),
    (11, "OF"),
];

// Highest DWARF register number known on x86-64.
const DWARF_REGISTER_LIMIT: u16 = 130;

/// Number of debug registers (`dr0`..`dr7`).
pub const DEBUG_REGISTERS: usize = 8;

/// A snapshot of one thread's general purpose, floating point and debug registers.
///
/// Snapshots are plain values: mutate a copy and commit it with
/// [`ProcessControlEngine::set_state`](crate::engine::ProcessControlEngine::set_state).
#[derive(Copy, Clone)]
pub struct CpuState {
    regs: libc::user_regs_struct,
    fpregs: libc::user_fpregs_struct,
    debug: [u64; DEBUG_REGISTERS],
}

impl CpuState {
    /// An all-zero snapshot.
    pub fn new() -> Self {
        // SAFETY: the register structures are plain integers and arrays.
        unsafe { std::mem::zeroed() }
    }

    pub fn from_parts(
        regs: libc::user_regs_struct,
        fpregs: libc::user_fpregs_struct,
        debug: [u64; DEBUG_REGISTERS],
    ) -> Self {
        CpuState {
            regs,
            fpregs,
            debug,
        }
    }

    pub fn clear(&mut self) {
        *self = CpuState::new();
    }

    pub fn regs(&self) -> &libc::user_regs_struct {
        &self.regs
    }

    pub fn fpregs(&self) -> &libc::user_fpregs_struct {
        &self.fpregs
    }

    pub fn flags(&self) -> u64 {
        self.regs.eflags
    }

    pub fn set_flags(&mut self, flags: u64) {
        self.regs.eflags = flags;
    }

    /// Names of the set status and control flags, e.g. `"ZF IF"`.
    pub fn flags_to_string(&self) -> String {
        FLAG_NAMES
            .iter()
            .filter(|(bit, _)| self.regs.eflags & (1u64 << *bit) != 0)
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn debug_registers(&self) -> &[u64; DEBUG_REGISTERS] {
        &self.debug
    }

    pub fn debug_register(&self, n: usize) -> Option<u64> {
        self.debug.get(n).copied()
    }

    #[must_use]
    pub fn set_debug_register(&mut self, n: usize, value: u64) -> Option<()> {
        *self.debug.get_mut(n)? = value;
        Some(())
    }

    /// Moves the stack pointer by `bytes`.
    pub fn adjust_stack(&mut self, bytes: i64) {
        self.regs.rsp = self.regs.rsp.wrapping_add(bytes as u64);
    }

    /// The 80-bit x87 register `st(n)`.
    pub fn fpu_register(&self, n: usize) -> Option<[u8; 10]> {
        let words = self.fpregs.st_space.get(n * 4..n * 4 + 4)?;
        let bytes = words_to_bytes(words);
        let mut st = [0; 10];
        st.copy_from_slice(&bytes[..10]);
        Some(st)
    }

    /// The MMX register `mm(n)`, aliased on the mantissa of `st(n)`.
    pub fn mmx_register(&self, n: usize) -> Option<u64> {
        let words = self.fpregs.st_space.get(n * 4..n * 4 + 2)?;
        Some(u64::from(words[0]) | (u64::from(words[1]) << 32))
    }

    pub fn xmm_register(&self, n: usize) -> Option<[u8; 16]> {
        let words = self.fpregs.xmm_space.get(n * 4..n * 4 + 4)?;
        Some(words_to_bytes(words))
    }

    /// Looks a 64-bit register up by its name.
    pub fn value(&self, name: &str) -> Option<u64> {
        match name {
            "rip" => Some(self.regs.rip),
            "rflags" | "eflags" => Some(self.regs.eflags),
            "orig_rax" => Some(self.regs.orig_rax),
            _ => self.reg_for_dwarf(Self::dwarf_for_name(name)?),
        }
    }

    #[must_use]
    pub fn set_value(&mut self, name: &str, value: u64) -> Option<()> {
        match name {
            "rip" => self.regs.rip = value,
            "rflags" | "eflags" => self.regs.eflags = value,
            "orig_rax" => self.regs.orig_rax = value,
            _ => return self.set_reg_for_dwarf(Self::dwarf_for_name(name)?, value),
        }
        Some(())
    }
}

impl Default for CpuState {
    fn default() -> Self {
        CpuState::new()
    }
}

impl Debug for CpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuState")
            .field("rip", &format_args!("{:#x}", self.regs.rip))
            .field("rsp", &format_args!("{:#x}", self.regs.rsp))
            .field("rbp", &format_args!("{:#x}", self.regs.rbp))
            .field("rax", &format_args!("{:#x}", self.regs.rax))
            .field("flags", &self.flags_to_string())
            .field("dr7", &format_args!("{:#x}", self.debug[7]))
            .finish()
    }
}

impl From<libc::user_regs_struct> for CpuState {
    fn from(regs: libc::user_regs_struct) -> CpuState {
        let mut state = CpuState::new();
        state.regs = regs;
        state
    }
}

fn words_to_bytes(words: &[u32]) -> [u8; 16] {
    let mut bytes = [0; 16];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    bytes
}

impl Registers for CpuState {
    fn ip(&self) -> u64 {
        self.regs.rip
    }

    fn set_ip(&mut self, ip: u64) {
        self.regs.rip = ip;
    }

    fn sp(&self) -> u64 {
        self.regs.rsp
    }

    fn set_sp(&mut self, sp: u64) {
        self.regs.rsp = sp;
    }

    fn bp(&self) -> Option<u64> {
        Some(self.regs.rbp)
    }

    fn set_bp(&mut self, bp: u64) -> Option<()> {
        self.regs.rbp = bp;
        Some(())
    }

    fn reg_for_dwarf(&self, register: gimli::Register) -> Option<u64> {
        use gimli::X86_64;
        let value = match register {
            X86_64::RAX => self.regs.rax,
            X86_64::RBX => self.regs.rbx,
            X86_64::RCX => self.regs.rcx,
            X86_64::RDX => self.regs.rdx,
            X86_64::RSI => self.regs.rsi,
            X86_64::RDI => self.regs.rdi,
            X86_64::RSP => self.regs.rsp,
            X86_64::RBP => self.regs.rbp,
            X86_64::R8 => self.regs.r8,
            X86_64::R9 => self.regs.r9,
            X86_64::R10 => self.regs.r10,
            X86_64::R11 => self.regs.r11,
            X86_64::R12 => self.regs.r12,
            X86_64::R13 => self.regs.r13,
            X86_64::R14 => self.regs.r14,
            X86_64::R15 => self.regs.r15,
            X86_64::RA => self.regs.rip,
            X86_64::CS => self.regs.cs,
            X86_64::SS => self.regs.ss,
            X86_64::DS => self.regs.ds,
            X86_64::GS => self.regs.gs,
            X86_64::ES => self.regs.es,
            X86_64::FS => self.regs.fs,
            X86_64::FS_BASE => self.regs.fs_base,
            X86_64::GS_BASE => self.regs.gs_base,
            X86_64::RFLAGS => self.regs.eflags,
            _ => return None,
        };
        Some(value)
    }

    fn set_reg_for_dwarf(&mut self, register: gimli::Register, val: u64) -> Option<()> {
        use gimli::X86_64;
        match register {
            X86_64::RAX => self.regs.rax = val,
            X86_64::RBX => self.regs.rbx = val,
            X86_64::RCX => self.regs.rcx = val,
            X86_64::RDX => self.regs.rdx = val,
            X86_64::RSI => self.regs.rsi = val,
            X86_64::RDI => self.regs.rdi = val,
            X86_64::RSP => self.regs.rsp = val,
            X86_64::RBP => self.regs.rbp = val,
            X86_64::R8 => self.regs.r8 = val,
            X86_64::R9 => self.regs.r9 = val,
            X86_64::R10 => self.regs.r10 = val,
            X86_64::R11 => self.regs.r11 = val,
            X86_64::R12 => self.regs.r12 = val,
            X86_64::R13 => self.regs.r13 = val,
            X86_64::R14 => self.regs.r14 = val,
            X86_64::R15 => self.regs.r15 = val,
            X86_64::RA => self.regs.rip = val,
            X86_64::CS => self.regs.cs = val,
            X86_64::SS => self.regs.ss = val,
            X86_64::DS => self.regs.ds = val,
            X86_64::GS => self.regs.gs = val,
            X86_64::ES => self.regs.es = val,
            X86_64::FS => self.regs.fs = val,
            X86_64::FS_BASE => self.regs.fs_base = val,
            X86_64::GS_BASE => self.regs.gs_base = val,
            X86_64::RFLAGS => self.regs.eflags = val,
            _ => return None,
        }
        Some(())
    }

    fn name_for_dwarf(register: gimli::Register) -> Option<&'static str> {
        gimli::X86_64::register_name(register)
    }

    fn dwarf_for_name(name: &str) -> Option<gimli::Register> {
        (0..=DWARF_REGISTER_LIMIT)
            .map(gimli::Register)
            .find(|&reg| gimli::X86_64::register_name(reg) == Some(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_registers() {
        let mut state = CpuState::new();
        state.set_value("rip", 0x401000).unwrap();
        state.set_value("rax", 10).unwrap();
        state.set_value("r15", 7).unwrap();

        assert_eq!(state.ip(), 0x401000);
        assert_eq!(state.value("rax"), Some(10));
        assert_eq!(state.value("r15"), Some(7));
        assert_eq!(state.value("xyz"), None);
        assert!(state.set_value("xyz", 1).is_none());
    }

    #[test]
    fn debug_registers_are_bounded() {
        let mut state = CpuState::new();
        state.set_debug_register(7, 0x1).unwrap();
        assert_eq!(state.debug_register(7), Some(0x1));
        assert!(state.set_debug_register(8, 0x1).is_none());
        assert_eq!(state.debug_register(8), None);
    }

    #[test]
    fn flags_string() {
        let mut state = CpuState::new();
        state.set_flags((1 << 6) | (1 << 9) | 1);
        assert_eq!(state.flags_to_string(), "CF ZF IF");
    }

    #[test]
    fn stack_adjustment_wraps() {
        let mut state = CpuState::new();
        state.set_sp(0x1000);
        state.adjust_stack(-8);
        assert_eq!(state.sp(), 0xff8);
        state.adjust_stack(16);
        assert_eq!(state.sp(), 0x1008);
    }

    #[test]
    fn vector_registers() {
        let mut regs = *CpuState::new().regs();
        regs.rip = 1;
        let mut fpregs = *CpuState::new().fpregs();
        fpregs.st_space[4] = 0xdead_beef;
        fpregs.st_space[5] = 0x1;
        fpregs.xmm_space[4] = 0x0403_0201;

        let state = CpuState::from_parts(regs, fpregs, [0; DEBUG_REGISTERS]);
        assert_eq!(state.mmx_register(1), Some(0x1_dead_beef));
        assert_eq!(&state.xmm_register(1).unwrap()[..4], &[1, 2, 3, 4]);
        assert_eq!(state.fpu_register(1).unwrap()[..4], [0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(state.fpu_register(8), None);
    }
}
