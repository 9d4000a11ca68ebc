//! The parsed-image collaborator.
//!
//! The core consumes the host binary through [ImageModel]: executable
//! sections, symbol addresses, the real PLT, and the mapping from virtual
//! addresses to output-file offsets (including the extension region where
//! the injected code lands). [ElfImage] is the production implementation,
//! an eager parse of an `object`-readable ELF over a memory mapping.

use crate::{addr::next_aligned, errors::RewriteError};
use fxhash::FxHashMap;
use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSymbol, RelocationTarget, SectionKind};
use std::{fs, path::Path};

/// One executable section of the host image.
#[derive(Debug, Clone)]
pub struct ExecSection {
    pub name: String,
    pub vaddr: u64,
    pub size: u64,
    pub file_off: u64,
}

/// What the core needs to know about the parsed image.
pub trait ImageModel {
    /// Pointer width in bytes (4 or 8); selects the ISA.
    fn word_bytes(&self) -> usize;

    /// The executable sections, ascending by address.
    fn exec_sections(&self) -> &[ExecSection];

    /// Address of a defined symbol (statically linked callees).
    fn symbol_addr(&self, name: &str) -> Option<u64>;

    /// Address of the host's PLT entry for an imported function.
    fn plt_entry(&self, name: &str) -> Option<u64>;

    /// Base of the host's PLT (the resolver stub), if it has one.
    fn plt_base(&self) -> Option<u64>;

    /// Virtual address where injected code is placed.
    fn extension_code_base(&self) -> u64;

    /// Virtual address where injected data is placed.
    fn extension_data_base(&self) -> u64;

    /// Output-file offset backing `vaddr`, for both original sections and
    /// the extension region.
    fn file_offset(&self, vaddr: u64) -> Option<u64>;

    fn is_executable_addr(&self, addr: u64) -> bool {
        self.exec_sections()
            .iter()
            .any(|s| addr >= s.vaddr && addr < s.vaddr + s.size)
    }
}

#[derive(Debug, Clone, Copy)]
struct SectionRange {
    vaddr: u64,
    size: u64,
    file_off: u64,
}

/// Eagerly parsed ELF image. Holds the mapping so section bytes stay
/// borrowable for the lifetime of the rewrite.
pub struct ElfImage {
    mmap: Mmap,
    word: usize,
    exec: Vec<ExecSection>,
    ranges: Vec<SectionRange>,
    symbols: FxHashMap<String, u64>,
    plt_entries: FxHashMap<String, u64>,
    plt_base: Option<u64>,
    ext_base: u64,
    ext_file_off: u64,
}

/// Size of one PLT entry on both word sizes.
const PLT_ENTRY_SIZE: u64 = 16;

impl ElfImage {
    pub fn open(path: &Path) -> Result<Self, RewriteError> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let obj = object::File::parse(&*mmap)
            .map_err(|e| RewriteError::Image(format!("{}: {e}", path.display())))?;
        let word = if obj.is_64() { 8 } else { 4 };

        let mut exec = Vec::new();
        let mut ranges = Vec::new();
        let mut max_vaddr_end = 0u64;
        for sec in obj.sections() {
            let vaddr = sec.address();
            let size = sec.size();
            if let Some((file_off, _)) = sec.file_range() {
                ranges.push(SectionRange {
                    vaddr,
                    size,
                    file_off,
                });
            }
            if vaddr != 0 {
                max_vaddr_end = max_vaddr_end.max(vaddr + size);
            }
            if sec.kind() == SectionKind::Text {
                if let Some((file_off, _)) = sec.file_range() {
                    exec.push(ExecSection {
                        name: sec.name().unwrap_or("").to_owned(),
                        vaddr,
                        size,
                        file_off,
                    });
                }
            }
        }
        exec.sort_by_key(|s| s.vaddr);

        let mut symbols = FxHashMap::default();
        for sym in obj.symbols().chain(obj.dynamic_symbols()) {
            if let Ok(name) = sym.name() {
                if sym.address() != 0 && !name.is_empty() {
                    symbols.entry(name.to_owned()).or_insert(sym.address());
                }
            }
        }

        let plt_base = obj.section_by_name(".plt").map(|s| s.address());

        // PLT entries follow the resolver stub in the order of the jump-slot
        // relocations applied to .got.plt.
        let mut plt_entries = FxHashMap::default();
        if let (Some(base), Some(gotplt)) = (plt_base, obj.section_by_name(".got.plt")) {
            for (i, (_, reloc)) in gotplt.relocations().enumerate() {
                if let RelocationTarget::Symbol(symidx) = reloc.target() {
                    if let Ok(sym) = obj.symbol_by_index(symidx) {
                        if let Ok(name) = sym.name() {
                            plt_entries
                                .insert(name.to_owned(), base + PLT_ENTRY_SIZE * (i as u64 + 1));
                        }
                    }
                }
            }
        }

        let ext_base = next_aligned(max_vaddr_end, 0x1000);
        let ext_file_off = next_aligned(mmap.len() as u64, 0x1000);

        Ok(Self {
            mmap,
            word,
            exec,
            ranges,
            symbols,
            plt_entries,
            plt_base,
            ext_base,
            ext_file_off,
        })
    }

    /// Bytes of an executable section.
    pub fn section_bytes(&self, sec: &ExecSection) -> &[u8] {
        let off = usize::try_from(sec.file_off).unwrap();
        let size = usize::try_from(sec.size).unwrap();
        &self.mmap[off..off + size]
    }
}

impl ImageModel for ElfImage {
    fn word_bytes(&self) -> usize {
        self.word
    }

    fn exec_sections(&self) -> &[ExecSection] {
        &self.exec
    }

    fn symbol_addr(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    fn plt_entry(&self, name: &str) -> Option<u64> {
        self.plt_entries.get(name).copied()
    }

    fn plt_base(&self) -> Option<u64> {
        self.plt_base
    }

    fn extension_code_base(&self) -> u64 {
        self.ext_base
    }

    fn extension_data_base(&self) -> u64 {
        // Data follows the injected code; layout orders the sub-arenas.
        self.ext_base
    }

    fn file_offset(&self, vaddr: u64) -> Option<u64> {
        if vaddr >= self.ext_base {
            return Some(self.ext_file_off + (vaddr - self.ext_base));
        }
        self.ranges
            .iter()
            .find(|r| vaddr >= r.vaddr && vaddr < r.vaddr + r.size)
            .map(|r| r.file_off + (vaddr - r.vaddr))
    }
}
