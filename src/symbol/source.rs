//! Instruction decoding for stepping decisions and disassembly listings.

use capstone::arch::{BuildsCapstone, BuildsCapstoneSyntax};
use capstone::Capstone;

use crate::CoreResult;

/// Longest x86-64 instruction.
pub const MAX_INSTRUCTION_SIZE: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    Call,
    Return,
    Jump,
    Other,
}

/// Shape of the first operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Immediate,
    Register,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub size: usize,
    pub kind: InstructionKind,
    pub operand: OperandKind,
    pub text: String,
}

impl Instruction {
    /// Instructions that `step_over` runs through instead of entering.
    pub fn is_step_over_target(&self) -> bool {
        self.kind == InstructionKind::Call
    }
}

pub trait InstructionDecoder {
    /// Decodes the first instruction in `bytes`, located at `address`.
    fn decode(&self, bytes: &[u8], address: u64) -> Option<Instruction>;
}

pub struct DisassemblySource(Capstone);

impl DisassemblySource {
    pub fn new() -> CoreResult<Self> {
        let cs = Capstone::new()
            .x86()
            .mode(capstone::arch::x86::ArchMode::Mode64)
            .syntax(capstone::arch::x86::ArchSyntax::Att)
            .detail(true)
            .build()?;

        Ok(DisassemblySource(cs))
    }

    /// A listing of every instruction in `bytes`, one per line.
    pub fn source_snippet(&self, bytes: &[u8], addr: u64, show_address: bool) -> CoreResult<String> {
        let mut fmt = String::new();

        for insn in self.0.disasm_all(bytes, addr)?.iter() {
            if show_address {
                fmt.push_str(&format!("0x{:016x}: ", insn.address()));
            }
            if let Some(mnemonic) = insn.mnemonic() {
                fmt.push_str(mnemonic);
                if let Some(op_str) = insn.op_str().filter(|ops| !ops.is_empty()) {
                    fmt.push(' ');
                    fmt.push_str(op_str);
                }
                fmt.push('\n');
            }
        }

        Ok(fmt)
    }
}

fn classify(mnemonic: &str) -> InstructionKind {
    if mnemonic.starts_with("call") {
        InstructionKind::Call
    } else if mnemonic.starts_with("ret") {
        InstructionKind::Return
    } else if mnemonic.starts_with('j') {
        InstructionKind::Jump
    } else {
        InstructionKind::Other
    }
}

// AT&T operands: `$imm`, `%reg`, indirect `*...` and `off(%base)`.
fn operand_kind(op_str: &str) -> OperandKind {
    let first = op_str.split(',').next().unwrap_or("").trim();
    if first.is_empty() {
        OperandKind::None
    } else if first.starts_with('$') {
        OperandKind::Immediate
    } else if first.starts_with('%') || first.starts_with("*%") {
        OperandKind::Register
    } else if first.contains('(') || first.starts_with('*') {
        OperandKind::Memory
    } else {
        // Direct branch targets are encoded as immediates.
        OperandKind::Immediate
    }
}

impl InstructionDecoder for DisassemblySource {
    fn decode(&self, bytes: &[u8], address: u64) -> Option<Instruction> {
        let insns = self.0.disasm_count(bytes, address, 1).ok()?;
        let insn = insns.iter().next()?;

        let mnemonic = insn.mnemonic().unwrap_or("");
        let op_str = insn.op_str().unwrap_or("");
        let text = if op_str.is_empty() {
            mnemonic.to_owned()
        } else {
            format!("{} {}", mnemonic, op_str)
        };

        Some(Instruction {
            address: insn.address(),
            size: insn.bytes().len(),
            kind: classify(mnemonic),
            operand: operand_kind(op_str),
            text,
        })
    }
}
