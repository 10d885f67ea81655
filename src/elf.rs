use goblin::elf::{header, program_header, Elf as GoblinElf};
use std::{collections::BTreeMap, fs, ops::Range, path::Path};

use crate::diag::Result;

/// A loadable, executable segment of an ELF file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub file_range: Range<usize>,
}

#[derive(Debug, Clone)]
struct Symbol {
    name: String,
    size: u64,
}

/// The parts of an ELF executable needed to map its code and name its
/// functions.
pub struct Elf {
    buffer: Vec<u8>,
    pie: bool,
    segments: Vec<Segment>,
    symbols: BTreeMap<u64, Symbol>,
}

impl Elf {
    /// Reads and parses the ELF file at `path`.
    ///
    /// # Errors
    ///
    /// Will return `Err` upon any failure to read or parse the file.
    pub fn build(path: &Path) -> Result<Self> {
        Self::parse(fs::read(path)?)
    }

    /// Parses an in-memory ELF file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if `buffer` is not a valid ELF file.
    pub fn parse(buffer: Vec<u8>) -> Result<Self> {
        let (pie, segments, symbols) = {
            let elf = GoblinElf::parse(&buffer)?;
            let pie = elf.header.e_type == header::ET_DYN;

            let segments = elf
                .program_headers
                .iter()
                .filter(|ph| ph.p_type == program_header::PT_LOAD && ph.is_executable())
                .map(|ph| Segment {
                    vaddr: ph.p_vaddr,
                    file_range: ph.file_range(),
                })
                .collect::<Vec<_>>();

            let mut symbols = BTreeMap::new();
            let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];
            for (syms, strtab) in tables {
                for sym in syms.iter().filter(|sym| sym.is_function() && sym.st_value != 0) {
                    if let Some(name) = strtab.get_at(sym.st_name) {
                        symbols.entry(sym.st_value).or_insert_with(|| Symbol {
                            name: name.to_string(),
                            size: sym.st_size,
                        });
                    }
                }
            }

            (pie, segments, symbols)
        };

        Ok(Self {
            buffer,
            pie,
            segments,
            symbols,
        })
    }

    #[must_use]
    pub fn is_pie(&self) -> bool {
        self.pie
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// File bytes backing `segment`, if the file is long enough.
    #[must_use]
    pub fn segment_data(&self, segment: &Segment) -> Option<&[u8]> {
        self.buffer.get(segment.file_range.clone())
    }

    /// Name the function containing `addr` (an unrelocated address), with
    /// the offset of `addr` into it.
    #[must_use]
    pub fn symbolize(&self, addr: u64) -> Option<(&str, u64)> {
        let (start, symbol) = self.symbols.range(..=addr).next_back()?;
        let offset = addr - start;
        if offset < symbol.size.max(1) {
            Some((symbol.name.as_str(), offset))
        } else {
            None
        }
    }
}
