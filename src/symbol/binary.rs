//! Header facts about the main executable: entry point, `main` and the dynamic debug pointer.

use object::{
    Architecture, BinaryFormat, Object, ObjectKind, ObjectSection, ObjectSymbol, SymbolKind,
};
use std::fs::File;

use crate::region::MemoryRegion;
use crate::CoreResult;

const DT_NULL: u64 = 0;
const DT_DEBUG: u64 = 21;

/// How far past the entry point to look for the address of `main`.
const START_SCAN_LENGTH: usize = 64;

pub trait BinaryInfo {
    fn validate_header(&self) -> bool;

    /// Runtime address of the entry point.
    fn entry_point(&self) -> u64;

    /// Runtime address of `main`, from the symbol table or the startup code.
    fn calculate_main(&self) -> Option<u64>;

    /// Whether the binary can run under this debugger.
    fn native(&self) -> bool;

    fn header_size(&self) -> usize;

    /// Runtime address of the `DT_DEBUG` slot in the dynamic section.
    fn debug_pointer(&self) -> Option<u64> {
        None
    }
}

/// An ELF image read from the file backing a mapped region.
#[derive(Debug, Clone)]
pub struct ElfBinary {
    valid: bool,
    native: bool,
    is_64: bool,
    bias: u64,
    entry: u64,
    main_symbol: Option<u64>,
    start_code: Vec<u8>,
    debug_slot: Option<u64>,
}

impl ElfBinary {
    pub fn from_region(region: &MemoryRegion) -> CoreResult<Self> {
        let file = File::open(&region.name)?;
        // Safety: the mapping only lives for the duration of this call.
        let mmap = unsafe { memmap::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;

        let bias = match object.kind() {
            ObjectKind::Dynamic => region.start.wrapping_sub(region.base),
            _ => 0,
        };

        let main_symbol = object
            .symbols()
            .chain(object.dynamic_symbols())
            .find(|sym| {
                sym.kind() == SymbolKind::Text
                    && !sym.is_undefined()
                    && sym.name().map_or(false, |name| name == "main")
            })
            .map(|sym| sym.address().wrapping_add(bias));

        let entry = object.entry();
        let start_code = object
            .sections()
            .find(|s| s.address() <= entry && entry < s.address() + s.size())
            .and_then(|section| {
                let data = section.data().ok()?;
                let offset = (entry - section.address()) as usize;
                data.get(offset..(offset + START_SCAN_LENGTH).min(data.len()))
                    .map(<[u8]>::to_vec)
            })
            .unwrap_or_default();

        let debug_slot = object
            .section_by_name(".dynamic")
            .and_then(|section| {
                let data = section.data().ok()?;
                let index = data
                    .chunks_exact(16)
                    .map(|entry| read_u64(&entry[..8]))
                    .take_while(|&tag| tag != DT_NULL)
                    .position(|tag| tag == DT_DEBUG)?;
                Some(section.address() + (index * 16 + 8) as u64)
            })
            .map(|address| address.wrapping_add(bias));

        Ok(ElfBinary {
            valid: object.format() == BinaryFormat::Elf,
            native: object.architecture() == Architecture::X86_64,
            is_64: object.is_64(),
            bias,
            entry: entry.wrapping_add(bias),
            main_symbol,
            start_code,
            debug_slot,
        })
    }

    pub fn load_bias(&self) -> u64 {
        self.bias
    }

    /// Looks for the `main` argument glibc's `_start` hands to `__libc_start_main`:
    /// `mov $imm32, %rdi` in static executables, `lea disp(%rip), %rdi` in PIE.
    fn main_from_start_code(&self) -> Option<u64> {
        let code = &self.start_code;
        for i in 0..code.len().saturating_sub(6) {
            match &code[i..i + 3] {
                [0x48, 0xc7, 0xc7] => {
                    return Some(read_u32(&code[i + 3..i + 7]) as u64);
                }
                [0x48, 0x8d, 0x3d] => {
                    let disp = read_u32(&code[i + 3..i + 7]) as i32 as i64;
                    let next = self.entry + (i + 7) as u64;
                    return Some(next.wrapping_add(disp as u64));
                }
                _ => {}
            }
        }
        None
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

impl BinaryInfo for ElfBinary {
    fn validate_header(&self) -> bool {
        self.valid
    }

    fn entry_point(&self) -> u64 {
        self.entry
    }

    fn calculate_main(&self) -> Option<u64> {
        self.main_symbol.or_else(|| self.main_from_start_code())
    }

    fn native(&self) -> bool {
        self.native
    }

    fn header_size(&self) -> usize {
        if self.is_64 {
            64
        } else {
            52
        }
    }

    fn debug_pointer(&self) -> Option<u64> {
        self.debug_slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Permissions;

    fn own_binary(start: u64) -> ElfBinary {
        let exe = std::env::current_exe().unwrap();
        let region = MemoryRegion::new(
            start,
            start + 0x1000,
            0,
            exe.to_string_lossy(),
            Permissions::READ,
        );
        ElfBinary::from_region(&region).unwrap()
    }

    #[test]
    fn test_binary_header() {
        let binary = own_binary(0x5555_5555_4000);
        assert!(binary.validate_header());
        assert!(binary.native());
        assert_eq!(binary.header_size(), 64);
        assert!(binary.calculate_main().is_some());
        assert_ne!(binary.entry_point(), 0);
    }

    #[test]
    fn bias_moves_the_entry_point() {
        let low = own_binary(0x1000_0000);
        let high = own_binary(0x2000_0000);
        if low.load_bias() != 0 {
            assert_eq!(high.entry_point() - low.entry_point(), 0x1000_0000);
        } else {
            assert_eq!(high.entry_point(), low.entry_point());
        }
    }

    #[test]
    fn main_from_lea_rdi() {
        let binary = ElfBinary {
            valid: true,
            native: true,
            is_64: true,
            bias: 0,
            entry: 0x1000,
            main_symbol: None,
            // xor %ebp,%ebp; lea 0x100(%rip),%rdi
            start_code: vec![0x31, 0xed, 0x48, 0x8d, 0x3d, 0x00, 0x01, 0x00, 0x00, 0x90],
            debug_slot: None,
        };
        assert_eq!(binary.calculate_main(), Some(0x1000 + 9 + 0x100));
    }

    #[test]
    fn main_from_mov_rdi() {
        let binary = ElfBinary {
            valid: true,
            native: true,
            is_64: true,
            bias: 0,
            entry: 0x401000,
            main_symbol: None,
            start_code: vec![0x48, 0xc7, 0xc7, 0x30, 0x12, 0x40, 0x00, 0xc3],
            debug_slot: None,
        };
        assert_eq!(binary.calculate_main(), Some(0x401230));
    }
}
