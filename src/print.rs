use std::fmt::Write;

use crate::{
    asm::Parsers,
    elf::Elf,
    insn::{Block, Insn},
};

/// Renders decoded instructions and blocks as text lines.
///
/// Instructions are disassembled with capstone in their own execution mode.
/// When ELF files are registered through [`Printer::add_symbols`], addresses
/// are annotated with `function+offset`.
#[derive(Default)]
pub struct Printer {
    parsers: Parsers,
    symbols: Vec<(u64, Elf)>,
    raw: bool,
}

impl Printer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also print the instruction bytes.
    #[must_use]
    pub fn with_raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    /// Symbolizes addresses with the functions of `elf`, loaded at `bias`.
    pub fn add_symbols(&mut self, elf: Elf, bias: u64) {
        self.symbols.push((bias, elf));
    }

    fn symbol(&self, addr: u64) -> Option<String> {
        self.symbols.iter().rev().find_map(|(bias, elf)| {
            let (name, offset) = elf.symbolize(addr.checked_sub(*bias)?)?;
            Some(format!("{name}+{offset:#x}"))
        })
    }

    fn annotate(&self, line: &mut String, addr: u64) {
        if let Some(symbol) = self.symbol(addr) {
            let _ = write!(line, " <{symbol}>");
        }
    }

    /// One line for `insn`, decoded right before trace `offset`.
    pub fn insn(&mut self, offset: u64, insn: &Insn) -> String {
        let text = self
            .parsers
            .get(insn.mode)
            .and_then(|parser| parser.get_instruction_from(insn.bytes(), insn.ip))
            .map_or_else(|_| "(bad)".to_string(), |instruction| instruction.to_string());

        let mut line = format!("{offset:08x}: {:016x}", insn.ip);
        self.annotate(&mut line, insn.ip);
        line.push_str(": ");
        if self.raw {
            for byte in insn.bytes() {
                let _ = write!(line, "{byte:02x} ");
            }
            line.push('\t');
        }
        line.push_str(&text);
        line
    }

    #[must_use]
    pub fn block(&self, block: &Block) -> String {
        let mut line = format!(
            "block.ip: {:016x} ~ {:016x} ({:x})",
            block.ip, block.end_ip, block.ninsn
        );
        self.annotate(&mut line, block.ip);
        line
    }
}
