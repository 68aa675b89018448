//! Routine lookup by name
//!
//! Phase boundaries and silenced routines are configured by symbol name and resolved
//! once per loaded image. The instrumentation layer can supply its own resolver through
//! [`SymbolLookup`]; [`ElfSymbols`] reads an ELF symbol table directly.

use crate::error::{Result, TraceError};
use object::{Object, ObjectSymbol, SymbolKind};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Resolve a routine name to its entry address within one image
pub trait SymbolLookup {
    fn find_routine(&self, name: &str) -> Option<u64>;
}

impl SymbolLookup for HashMap<String, u64> {
    fn find_routine(&self, name: &str) -> Option<u64> {
        self.get(name).copied()
    }
}

impl SymbolLookup for BTreeMap<String, u64> {
    fn find_routine(&self, name: &str) -> Option<u64> {
        self.get(name).copied()
    }
}

/// Function symbols of one ELF image
#[derive(Debug, Clone)]
pub struct ElfSymbols {
    path: PathBuf,
    routines: HashMap<String, u64>,
}

impl ElfSymbols {
    /// Parse the static and dynamic symbol tables of `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| TraceError::io("Failed to open image", path, e))?;

        // SAFETY: read-only mapping of a file we do not modify.
        let mmap = unsafe { memmap2::Mmap::map(&file) }
            .map_err(|e| TraceError::io("Failed to memory-map image", path, e))?;

        let object = object::File::parse(&*mmap).map_err(|e| {
            TraceError::Symbols(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        let mut routines = HashMap::new();
        for symbol in object.symbols().chain(object.dynamic_symbols()) {
            if symbol.kind() != SymbolKind::Text || symbol.address() == 0 {
                continue;
            }
            if let Ok(name) = symbol.name() {
                routines
                    .entry(name.to_string())
                    .or_insert_with(|| symbol.address());
            }
        }

        tracing::debug!(
            image = %path.display(),
            routines = routines.len(),
            "loaded image symbols"
        );
        Ok(ElfSymbols {
            path: path.to_path_buf(),
            routines,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }
}

impl SymbolLookup for ElfSymbols {
    fn find_routine(&self, name: &str) -> Option<u64> {
        self.routines.get(name).copied()
    }
}
