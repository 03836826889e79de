//! Symbol tables of the modules mapped into the target.
//! The core only needs "load this module" and "what is near this address"; `ModuleSymbols`
//! answers both from ELF symbol tables.

use addr2line::demangle_auto;
use log::debug;
use object::{Object, ObjectKind, ObjectSymbol, SymbolKind, SymbolSection};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::CoreResult;

pub mod binary;
pub mod source;

/// The symbol closest below an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NearSymbol {
    pub name: String,
    pub offset: u64,
}

pub trait SymbolManager {
    /// Loads the symbols of the module at `path`, mapped at `base`.
    fn load_symbol_file(&mut self, path: &Path, base: u64) -> CoreResult<()>;

    fn find_near(&self, address: u64) -> Option<NearSymbol>;

    /// Address of a symbol, either plain (`main`) or module qualified (`hello::main`).
    fn find(&self, name: &str) -> Option<u64>;
}

#[derive(Debug, Clone)]
struct SymbolEntry {
    name: String,
    size: u64,
}

/// Symbols read from the ELF symbol tables of loaded modules.
#[derive(Debug, Default)]
pub struct ModuleSymbols {
    by_address: BTreeMap<u64, SymbolEntry>,
    by_name: HashMap<String, u64>,
    loaded: HashSet<(PathBuf, u64)>,
}

impl ModuleSymbols {
    pub fn new() -> Self {
        ModuleSymbols::default()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

impl SymbolManager for ModuleSymbols {
    fn load_symbol_file(&mut self, path: &Path, base: u64) -> CoreResult<()> {
        if !self.loaded.insert((path.to_owned(), base)) {
            return Ok(());
        }

        let file = File::open(path)?;
        // Safety: Not really, this assumes that the backing file will not be truncated or
        // written to while it is used by us.
        let mmap = unsafe { memmap::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;

        // Position independent code is linked at zero and relocated as a whole.
        let bias = match object.kind() {
            ObjectKind::Dynamic => base,
            _ => 0,
        };
        let module = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut count = 0;
        for symbol in object.symbols().chain(object.dynamic_symbols()) {
            if !matches!(
                symbol.kind(),
                SymbolKind::Unknown | SymbolKind::Text | SymbolKind::Data
            ) || symbol.is_undefined()
                || symbol.section() == SymbolSection::Common
            {
                continue;
            }
            let name = match symbol.name() {
                Ok(name) if !name.is_empty() => demangle_auto(Cow::Borrowed(name), None).to_string(),
                _ => continue,
            };
            let address = symbol.address().wrapping_add(bias);

            self.by_name.entry(name.clone()).or_insert(address);
            self.by_name
                .entry(format!("{}::{}", module, name))
                .or_insert(address);
            self.by_address.entry(address).or_insert(SymbolEntry {
                name,
                size: symbol.size(),
            });
            count += 1;
        }

        debug!("loaded {} symbols from {} at {:#x}", count, path.display(), base);
        Ok(())
    }

    fn find_near(&self, address: u64) -> Option<NearSymbol> {
        let (start, entry) = self.by_address.range(..=address).next_back()?;
        let offset = address - start;
        if entry.size != 0 && offset >= entry.size {
            return None;
        }
        Some(NearSymbol {
            name: entry.name.clone(),
            offset,
        })
    }

    fn find(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }
}
