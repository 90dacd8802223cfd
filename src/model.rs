//! The in-memory coverage model: files → functions → lines → blocks (§3, §4.4, §4.5).
//!
//! `BasicBlock` storage is a single owning arena on [`Coverage`] (DESIGN
//! NOTES, "Ownership of BasicBlock"); `Function` and `SourceLine` hold
//! indices into it rather than references or smart pointers, sidestepping
//! the dangling-handle problem the original implementation's several
//! refactors were chasing.

use std::collections::{BTreeMap, BTreeSet};

use crate::dwarf::{DebugInfoReader, SourceInfo};
use crate::elf::ElfImage;
use crate::error::CoverageError;
use crate::instr_memory::InstrMemory;
use crate::{blocks, decoder};

/// Index into [`Coverage::blocks`].
pub type BlockRef = usize;

/// `{ line, column }`, DWARF-numbered: lines start at 1, columns at 0
/// ("Column-zero quirk", §9 — taken verbatim, never adjusted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

/// One maximal straight-line instruction range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicBlock {
    pub start: u64,
    pub end: u64,
    pub visited: bool,
}

/// One DWARF subprogram, attributed with source coverage counters.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub definition: (SourceLocation, SourceLocation),
    pub first_instr: u64,
    pub blocks: Vec<BlockRef>,
    pub exec_count: u64,
}

/// One source line, possibly spanning instructions from more than one block.
#[derive(Debug, Clone)]
pub struct SourceLine {
    pub func_name: String,
    pub definition: SourceLocation,
    pub first_instr: u64,
    pub blocks: Vec<BlockRef>,
    pub exec_count: u64,
    pub symbolic_once: bool,
    pub tainted_once: bool,
    pub initial_conc: bool,
}

/// One source file's worth of attributed functions and lines.
#[derive(Debug, Clone, Default)]
pub struct SourceFile {
    pub name: String,
    pub lines: BTreeMap<u32, SourceLine>,
    pub funcs: BTreeMap<String, Function>,
}

impl SourceFile {
    fn new(name: String) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoverageState {
    Opened,
    Initialized,
}

/// The top-level coverage container (§3 "Coverage").
///
/// Lifecycle: `Opened` immediately after [`Coverage::open`], `Initialized`
/// after [`Coverage::init`] (at most once); `cover` and `marshal` require
/// `Initialized`. See DESIGN.md for why this is a runtime-checked state
/// field rather than a type-state split across two struct types.
pub struct Coverage<R: DebugInfoReader = crate::dwarf::DwarfReader, M: InstrMemory = ElfImage> {
    image: M,
    reader: R,
    files: BTreeMap<String, SourceFile>,
    blocks: Vec<BasicBlock>,
    block_leaders: BTreeSet<u64>,
    state: CoverageState,
}

impl Coverage<crate::dwarf::DwarfReader, ElfImage> {
    /// Opens an ELF image at `path` and parses its DWARF debug information.
    /// The model itself is empty until [`Coverage::init`] runs.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, CoverageError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| CoverageError::BinaryOpenFailure {
            path: path.to_path_buf(),
            source: Box::new(e),
        })?;

        let image = ElfImage::parse(data).map_err(|e| CoverageError::BinaryOpenFailure {
            path: path.to_path_buf(),
            source: Box::new(e),
        })?;

        let dwarf_sections = image.dwarf_sections();
        let reader = crate::dwarf::DwarfReader::new(&dwarf_sections, 0)?;

        Ok(Self::with_reader(reader, image))
    }
}

impl<R: DebugInfoReader, M: InstrMemory> Coverage<R, M> {
    /// Builds a coverage model from an already-loaded debug-info reader and
    /// instruction-memory view. Both `R` and `M` are generic seams (§2a
    /// "Public API surface"): a simulator can plug in its own memory view
    /// instead of reading through an [`ElfImage`], and tests can supply a
    /// mock [`DebugInfoReader`] without parsing real DWARF.
    pub fn with_reader(reader: R, image: M) -> Self {
        Self {
            image,
            reader,
            files: BTreeMap::new(),
            blocks: Vec::new(),
            block_leaders: BTreeSet::new(),
            state: CoverageState::Opened,
        }
    }

    /// Populates files, functions, lines, and blocks in two passes over
    /// every function the debug-info reader enumerates (§4.4). Idempotent
    /// to call at most once; a second call returns
    /// [`CoverageError::InvalidState`].
    pub fn init(&mut self) -> Result<(), CoverageError> {
        if self.state != CoverageState::Opened {
            return Err(CoverageError::InvalidState { expected: "Opened" });
        }

        let mut ranges = Vec::new();
        self.reader.for_each_function(&mut |lo, hi| ranges.push((lo, hi)));

        // Pass 1: block leaders, unioned into the global set.
        for &(lo, hi) in &ranges {
            let leaders = blocks::leaders(lo, hi, &self.image);
            self.block_leaders.extend(leaders);
        }

        // Pass 2: attribute every instruction address to file/func/line and
        // close out basic blocks as leader boundaries are crossed.
        for &(func_start, func_end) in &ranges {
            self.attribute_function(func_start, func_end);
        }

        self.state = CoverageState::Initialized;
        Ok(())
    }

    fn attribute_function(&mut self, func_start: u64, func_end: u64) {
        let owner = self
            .reader
            .resolve(func_start)
            .into_iter()
            .find(|s| !s.symbol_name.is_empty() && !s.source_path.is_empty())
            .map(|s| (s.source_path, s.symbol_name));

        let mut pc = func_start;
        let mut block_start = func_start;
        let mut block_lines: BTreeSet<(String, u32)> = BTreeSet::new();

        while pc < func_end {
            let word = self.image.load_instr(pc);
            let len = decoder::decode(pc, word).len;
            let next_pc = pc + len;

            for info in self.reader.resolve(pc) {
                if info.symbol_name.is_empty() || info.source_path.is_empty() {
                    // Compiler-generated scaffolding DIE; un-attributable (§2b).
                    continue;
                }
                self.attribute_address(&info, pc);
                block_lines.insert((info.source_path.clone(), info.line));
            }

            let next_is_boundary = self.block_leaders.contains(&next_pc) || next_pc >= func_end;
            if next_is_boundary {
                let block_ref = self.blocks.len();
                self.blocks.push(BasicBlock {
                    start: block_start,
                    end: next_pc,
                    visited: false,
                });
                for (path, line) in block_lines.drain() {
                    if let Some(file) = self.files.get_mut(&path) {
                        if let Some(sl) = file.lines.get_mut(&line) {
                            sl.blocks.push(block_ref);
                        }
                    }
                }
                if let Some((path, name)) = &owner {
                    if let Some(file) = self.files.get_mut(path) {
                        if let Some(f) = file.funcs.get_mut(name) {
                            f.blocks.push(block_ref);
                        }
                    }
                }
                block_start = next_pc;
            }

            pc = next_pc;
        }
    }

    fn attribute_address(&mut self, info: &SourceInfo, addr: u64) {
        let file = self
            .files
            .entry(info.source_path.clone())
            .or_insert_with(|| SourceFile::new(info.source_path.clone()));

        let loc = SourceLocation {
            line: info.line,
            column: info.column,
        };

        let func = file
            .funcs
            .entry(info.symbol_name.clone())
            .or_insert_with(|| Function {
                name: info.symbol_name.clone(),
                definition: (loc, loc),
                first_instr: addr,
                blocks: Vec::new(),
                exec_count: 0,
            });
        if loc.line > func.definition.1.line {
            func.definition.1 = loc;
        }

        file.lines.entry(info.line).or_insert_with(|| SourceLine {
            func_name: info.symbol_name.clone(),
            definition: loc,
            first_instr: addr,
            blocks: Vec::new(),
            exec_count: 0,
            symbolic_once: false,
            tainted_once: false,
            initial_conc: false,
        });
    }

    /// Live update on every retired instruction (§4.5).
    pub fn cover(&mut self, addr: u64, tainted: bool, symbolic: bool, initial: bool) -> Result<(), CoverageError> {
        if self.state != CoverageState::Initialized {
            return Err(CoverageError::InvalidState {
                expected: "Initialized",
            });
        }

        let infos = self.reader.resolve(addr);
        if infos.is_empty() {
            return Ok(());
        }

        for info in &infos {
            self.cover_one(info, addr, tainted, symbolic, initial);
        }

        Ok(())
    }

    fn cover_one(&mut self, info: &SourceInfo, addr: u64, tainted: bool, symbolic: bool, initial: bool) {
        let Some(file) = self.files.get_mut(&info.source_path) else {
            tracing::debug!(source_path = %info.source_path, "cover: unknown source file, skipping");
            return;
        };

        if let Some(func) = file.funcs.get_mut(&info.symbol_name) {
            if addr == func.first_instr {
                func.exec_count += 1;
            }
        } else {
            tracing::debug!(
                symbol = %info.symbol_name,
                source_path = %info.source_path,
                "cover: unknown symbol in known file, skipping"
            );
        }

        let block_ref = self
            .blocks
            .iter()
            .position(|b| addr >= b.start && addr < b.end);
        match block_ref {
            Some(idx) => self.blocks[idx].visited = true,
            None => tracing::debug!(addr = format_args!("{addr:#x}"), "cover: unknown block at address"),
        }

        if let Some(line) = file.lines.get_mut(&info.line) {
            if addr == line.first_instr {
                line.exec_count += 1;
            }
            line.symbolic_once |= symbolic;
            line.tainted_once |= tainted;
            line.initial_conc |= initial;
        }
    }

    /// Read-only access to the interned files, for the report serializer and tests.
    pub fn files(&self) -> &BTreeMap<String, SourceFile> {
        &self.files
    }

    /// Read-only access to the block arena, for the report serializer and tests.
    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    /// Whether `init()` has completed.
    pub fn is_initialized(&self) -> bool {
        self.state == CoverageState::Initialized
    }
}
