//! ELF image loading (§4.1).
//!
//! Grounded on `symbolic-debuginfo`'s `elf.rs`: same `ElfError` shape (a
//! `thiserror` wrapper around an optional boxed source), same idea of
//! collecting DWARF section bytes by name out of the section header table.
//! Unlike the teacher, which supports relocatable objects, split debug
//! files, and multiple architectures, this loader targets exactly one
//! shape of input: a single statically-linked 32-bit RISC-V executable, so
//! the manual `return_partial_on_err!` section-by-section walk is dropped in
//! favor of `goblin::elf::Elf::parse`'s one-shot API (see DESIGN.md).

use std::error::Error as StdError;
use std::fmt;

use gimli::{EndianSlice, RunTimeEndian};
use goblin::elf::Elf;

use crate::instr_memory::InstrMemory;

/// Failure opening or parsing an ELF image.
#[derive(Debug)]
pub struct ElfError {
    message: String,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl ElfError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    fn wrap(message: impl Into<String>, source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for ElfError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn StdError + 'static))
    }
}

/// A loaded RISC-V executable: its raw bytes plus enough of the section
/// table to answer `InstrMemory` queries and hand DWARF sections to
/// [`crate::dwarf::DwarfReader`].
pub struct ElfImage {
    data: Vec<u8>,
    little_endian: bool,
    /// `(vaddr, file_offset, size)` for every loadable, executable segment.
    exec_segments: Vec<(u64, u64, u64)>,
    dwarf_sections: Vec<(String, std::ops::Range<usize>)>,
}

impl ElfImage {
    /// Parses `data` as an ELF image, retaining the section/segment layout
    /// needed to serve instruction fetches and locate DWARF sections.
    pub fn parse(data: Vec<u8>) -> Result<Self, ElfError> {
        let elf = Elf::parse(&data).map_err(|e| ElfError::wrap("malformed ELF header", e))?;

        let little_endian = elf.little_endian;

        let mut exec_segments = Vec::new();
        for ph in &elf.program_headers {
            const PT_LOAD: u32 = 1;
            const PF_X: u32 = 1;
            if ph.p_type == PT_LOAD && ph.p_flags & PF_X != 0 {
                exec_segments.push((ph.p_vaddr, ph.p_offset, ph.p_filesz));
            }
        }

        let mut dwarf_sections = Vec::new();
        for section in &elf.section_headers {
            let Some(name) = elf.shdr_strtab.get_at(section.sh_name) else {
                continue;
            };
            if let Some(stripped) = name.strip_prefix(".debug_") {
                let start = section.sh_offset as usize;
                let end = start + section.sh_size as usize;
                if end <= data.len() {
                    dwarf_sections.push((format!(".debug_{stripped}"), start..end));
                }
            }
        }

        Ok(Self {
            data,
            little_endian,
            exec_segments,
            dwarf_sections,
        })
    }

    /// Returns the bytes of a `.debug_*` section, if present.
    pub fn section_data(&self, name: &str) -> &[u8] {
        self.dwarf_sections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, range)| &self.data[range.clone()])
            .unwrap_or(&[])
    }

    /// Builds a `gimli::Dwarf` borrowing this image's section bytes.
    pub fn dwarf_sections(&self) -> gimli::Dwarf<EndianSlice<'_, RunTimeEndian>> {
        let endian = if self.little_endian {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };
        let load = |name: &str| -> Result<EndianSlice<'_, RunTimeEndian>, gimli::Error> {
            Ok(EndianSlice::new(self.section_data(name), endian))
        };
        gimli::Dwarf::load(load).unwrap_or_else(|_: gimli::Error| gimli::Dwarf::default())
    }

    fn file_offset(&self, addr: u64) -> Option<usize> {
        self.exec_segments.iter().find_map(|&(vaddr, offset, size)| {
            (addr >= vaddr && addr < vaddr + size).then(|| (offset + (addr - vaddr)) as usize)
        })
    }
}

impl InstrMemory for ElfImage {
    fn load_instr(&self, addr: u64) -> u32 {
        let Some(off) = self.file_offset(addr) else {
            return 0;
        };
        let b0 = self.data.get(off).copied().unwrap_or(0) as u32;
        let b1 = self.data.get(off + 1).copied().unwrap_or(0) as u32;
        let b2 = self.data.get(off + 2).copied().unwrap_or(0) as u32;
        let b3 = self.data.get(off + 3).copied().unwrap_or(0) as u32;
        b0 | (b1 << 8) | (b2 << 16) | (b3 << 24)
    }
}
