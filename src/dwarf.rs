//! DWARF debug information reader (§4.2).
//!
//! Ground truth for the walk below is `symbolic-debuginfo`'s `dwarf.rs` and
//! `function_builder.rs`: a single-pass DFS over each compilation unit's DIE
//! tree builds a tree of [`FuncNode`]s (one per `DW_TAG_subprogram`, with
//! `DW_TAG_inlined_subroutine` children nested inside), each carrying its own
//! leaf line-table rows. `resolve` then does the same recursive descent
//! `addr2line`-style to find the deepest scope enclosing an address, and
//! assembles the inline chain the way `coverage-vp`'s `get_inlines` did:
//! each inlined scope credits its *parent's* source line at the call site,
//! with the truly-innermost body location credited last, under the name of
//! the enclosing non-inlined function (see DESIGN.md, "inline chain order").

use fallible_iterator::FallibleIterator;
use gimli::read::AttributeValue;
use gimli::{constants, RunTimeEndian};

use crate::error::{DwarfError, DwarfErrorKind};

type Endian = RunTimeEndian;
type Slice<'a> = gimli::EndianSlice<'a, Endian>;
type GimliDwarf<'a> = gimli::Dwarf<Slice<'a>>;
type Unit<'a> = gimli::Unit<Slice<'a>>;
type Die<'a, 'u> = gimli::DebuggingInformationEntry<'u, 'u, Slice<'a>, usize>;

/// One (symbol, file, line, column) tuple as returned by [`DebugInfoReader::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub symbol_name: String,
    pub source_path: String,
    pub line: u32,
    pub column: u32,
}

/// The seam between the coverage model and the underlying debug-info
/// library. Modeled as an opaque reader object (DESIGN NOTES, "Global DWARF
/// callbacks") so the model and its tests never touch gimli directly.
pub trait DebugInfoReader {
    /// Resolves an address to its full inline chain, innermost scope first,
    /// terminated by the enclosing non-inlined function. Empty if `addr` has
    /// no line-table entry at all (§4.2 "Failures").
    fn resolve(&self, addr: u64) -> Vec<SourceInfo>;

    /// Invokes `visitor(low_pc, high_pc)` once per top-level (non-inlined)
    /// function in the image.
    fn for_each_function(&self, visitor: &mut dyn FnMut(u64, u64));
}

/// A single line-table row attributed to one scope: `[address, address+size)`
/// maps to `(file, line)`.
#[derive(Debug, Clone)]
struct LineEntry {
    address: u64,
    size: u64,
    file: String,
    line: u32,
    column: u32,
}

/// The call-site location of an inlined scope, i.e. where it was invoked
/// from within its immediate parent.
#[derive(Debug, Clone)]
struct CallLocation {
    file: String,
    line: u32,
    column: u32,
}

/// A node in the per-compilation-unit function tree: either a top-level
/// `DW_TAG_subprogram` (`call_site: None`) or a nested
/// `DW_TAG_inlined_subroutine` (`call_site: Some(..)`, recording where *it*
/// was called from within its parent).
#[derive(Debug, Clone)]
struct FuncNode {
    name: String,
    address: u64,
    size: u64,
    lines: Vec<LineEntry>,
    inlinees: Vec<FuncNode>,
    call_site: Option<CallLocation>,
}

impl FuncNode {
    fn end_address(&self) -> u64 {
        self.address + self.size
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.address && addr < self.end_address()
    }

    /// Finds the line entry covering `addr` among this node's own leaf lines.
    fn own_line(&self, addr: u64) -> Option<&LineEntry> {
        // Lines are sorted and non-overlapping by construction (`assign_lines`).
        match self.lines.binary_search_by_key(&addr, |l| l.address) {
            Ok(idx) => Some(&self.lines[idx]),
            Err(0) => None,
            Err(next) => {
                let candidate = &self.lines[next - 1];
                let end = candidate.address + candidate.size.max(1);
                (addr < end).then_some(candidate)
            }
        }
    }

    /// Recursively finds the deepest scope enclosing `addr`, returning the
    /// chain from this node down to that scope (inclusive) plus the leaf
    /// line entry at that scope, if any.
    fn descend<'a>(&'a self, addr: u64) -> Option<(Vec<&'a FuncNode>, Option<&'a LineEntry>)> {
        if !self.contains(addr) {
            return None;
        }

        for child in &self.inlinees {
            if let Some((mut chain, leaf)) = child.descend(addr) {
                chain.insert(0, self);
                return Some((chain, leaf));
            }
        }

        Some((vec![self], self.own_line(addr)))
    }
}

/// Parses and indexes DWARF debug information for one ELF image.
///
/// Holds no borrow on the underlying section bytes: every name parsed out of
/// DWARF is copied into an owned `String` while walking the DIE tree, so the
/// reader can outlive (and sit alongside, with no lifetime entanglement) the
/// `ElfImage` it was built from.
pub struct DwarfReader {
    functions: Vec<FuncNode>,
}

impl DwarfReader {
    /// Builds the reader from gimli's parsed DWARF sections.
    ///
    /// `address_bias` is added to every `DW_AT_low_pc`/`DW_AT_high_pc` /
    /// line-table address, mirroring the `bias` a real loader would apply;
    /// for a statically-linked RV32 executable it is normally zero.
    pub fn new(dwarf: &GimliDwarf<'_>, address_bias: i64) -> Result<Self, DwarfError> {
        let mut functions = Vec::new();
        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            parse_unit_functions(dwarf, &unit, address_bias, &mut functions)?;
        }
        functions.sort_by_key(|f| f.address);

        Ok(Self { functions })
    }

    fn find_top_level(&self, addr: u64) -> Option<&FuncNode> {
        let idx = match self.functions.binary_search_by_key(&addr, |f| f.address) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(next) => next - 1,
        };
        let candidate = &self.functions[idx];
        candidate.contains(addr).then_some(candidate)
    }
}

impl DebugInfoReader for DwarfReader {
    fn resolve(&self, addr: u64) -> Vec<SourceInfo> {
        let Some(top) = self.find_top_level(addr) else {
            return Vec::new();
        };

        let Some((chain, leaf)) = top.descend(addr) else {
            return Vec::new();
        };

        let Some(leaf) = leaf else {
            // No line-table entry for this address: assembler stub or
            // padding inside an otherwise-known function range.
            return Vec::new();
        };

        if chain.len() == 1 {
            return vec![SourceInfo {
                symbol_name: top.name.clone(),
                source_path: leaf.file.clone(),
                line: leaf.line,
                column: leaf.column,
            }];
        }

        // `chain` is [top, inline_1, .., inline_k], outermost to innermost.
        // Each inline_p credits its parent (chain[p-1]) at its own call site.
        let mut out = Vec::with_capacity(chain.len());
        for p in (1..chain.len()).rev() {
            let inline_p = chain[p];
            let Some(call_site) = &inline_p.call_site else {
                continue;
            };
            out.push(SourceInfo {
                symbol_name: chain[p - 1].name.clone(),
                source_path: call_site.file.clone(),
                line: call_site.line,
                column: call_site.column,
            });
        }

        // The non-inlined containing function, credited with the true leaf
        // body location (§4.2 rationale: the inlined source text itself).
        out.push(SourceInfo {
            symbol_name: top.name.clone(),
            source_path: leaf.file.clone(),
            line: leaf.line,
            column: leaf.column,
        });

        out
    }

    fn for_each_function(&self, visitor: &mut dyn FnMut(u64, u64)) {
        for f in &self.functions {
            visitor(f.address, f.end_address());
        }
    }
}

/// Parses every `DW_TAG_subprogram` in a compilation unit into a [`FuncNode`]
/// tree and appends the top-level ones to `out`.
fn parse_unit_functions(
    dwarf: &GimliDwarf<'_>,
    unit: &Unit<'_>,
    address_bias: i64,
    out: &mut Vec<FuncNode>,
) -> Result<(), DwarfError> {
    let mut entries = unit.entries();
    while let Some((_, entry)) = entries.next_dfs()? {
        if entry.tag() != constants::DW_TAG_subprogram {
            continue;
        }
        if let Some(node) = parse_function(dwarf, unit, entry, address_bias)? {
            out.push(node);
        }
    }
    Ok(())
}

/// Parses one `DW_TAG_subprogram` DIE (and its nested inlinees) into a
/// [`FuncNode`]. Returns `None` for declaration-only DIEs (no `low_pc`).
fn parse_function(
    dwarf: &GimliDwarf<'_>,
    unit: &Unit<'_>,
    entry: &Die<'_, '_>,
    address_bias: i64,
) -> Result<Option<FuncNode>, DwarfError> {
    let Some((low_pc, high_pc)) = pc_range(dwarf, unit, entry)? else {
        return Ok(None);
    };

    let name = function_name(dwarf, unit, entry)?.unwrap_or_default();
    let address = apply_bias(low_pc, address_bias);
    let size = high_pc.saturating_sub(low_pc);

    let mut node = FuncNode {
        name,
        address,
        size,
        lines: Vec::new(),
        inlinees: Vec::new(),
        call_site: None,
    };

    collect_children(dwarf, unit, entry, address_bias, &mut node)?;
    collect_lines(dwarf, unit, address, size, &mut node)?;
    assign_lines(&mut node);

    Ok(Some(node))
}

/// Walks the immediate (and deeper, via recursion) children of a DIE looking
/// for nested `DW_TAG_inlined_subroutine`s, appending each as a child
/// [`FuncNode`] of `parent`.
fn collect_children(
    dwarf: &GimliDwarf<'_>,
    unit: &Unit<'_>,
    entry: &Die<'_, '_>,
    address_bias: i64,
    parent: &mut FuncNode,
) -> Result<(), DwarfError> {
    let mut tree = unit.entries_tree(Some(entry.offset()))?;
    let root = tree.root()?;
    walk_children(dwarf, unit, root, address_bias, parent)
}

fn walk_children(
    dwarf: &GimliDwarf<'_>,
    unit: &Unit<'_>,
    mut node: gimli::EntriesTreeNode<'_, '_, '_, Slice<'_>>,
    address_bias: i64,
    parent: &mut FuncNode,
) -> Result<(), DwarfError> {
    let mut children = node.children();
    while let Some(child) = children.next()? {
        let entry = child.entry();
        match entry.tag() {
            constants::DW_TAG_inlined_subroutine => {
                if let Some(inlinee) = parse_inlinee(dwarf, unit, entry, address_bias)? {
                    let mut inlinee = inlinee;
                    walk_children(dwarf, unit, child, address_bias, &mut inlinee)?;
                    parent.inlinees.push(inlinee);
                }
            }
            constants::DW_TAG_subprogram => {
                // Nested, separately-emitted subprogram (e.g. a local
                // struct's member function): not part of this function's
                // own coverage, it is enumerated independently as its own
                // top-level entry by `parse_unit_functions`'s DFS.
            }
            _ => {
                walk_children(dwarf, unit, child, address_bias, parent)?;
            }
        }
    }
    Ok(())
}

fn parse_inlinee(
    dwarf: &GimliDwarf<'_>,
    unit: &Unit<'_>,
    entry: &Die<'_, '_>,
    address_bias: i64,
) -> Result<Option<FuncNode>, DwarfError> {
    let Some((low_pc, high_pc)) = pc_range(dwarf, unit, entry)? else {
        return Ok(None);
    };

    let name = function_name(dwarf, unit, entry)?.unwrap_or_default();
    let call_file = string_attr(dwarf, unit, entry, constants::DW_AT_call_file)?;
    let call_line = udata_attr(entry, constants::DW_AT_call_line)?;
    let call_column = udata_attr(entry, constants::DW_AT_call_column)?;

    let (Some(call_file), Some(call_line)) = (call_file, call_line) else {
        // Missing call-site attributes: omit this element rather than fault (§4.2).
        return Ok(None);
    };

    Ok(Some(FuncNode {
        name,
        address: apply_bias(low_pc, address_bias),
        size: high_pc.saturating_sub(low_pc),
        lines: Vec::new(),
        inlinees: Vec::new(),
        call_site: Some(CallLocation {
            file: call_file,
            line: call_line as u32,
            column: call_column.unwrap_or(0) as u32,
        }),
    }))
}

/// Collects the line-table rows for `[address, address+size)` into `node`'s
/// own leaf lines. Rows whose address falls inside a nested inlinee's range
/// are reassigned to that inlinee afterward (see `assign_lines`), since this
/// is only ever called once, on the enclosing top-level function.
fn collect_lines(
    dwarf: &GimliDwarf<'_>,
    unit: &Unit<'_>,
    address: u64,
    size: u64,
    node: &mut FuncNode,
) -> Result<(), DwarfError> {
    let Some(program) = unit.line_program.clone() else {
        return Ok(());
    };

    let header = program.header().clone();
    let mut rows = program.rows();
    let mut prior: Option<(u64, u64, u32, u32)> = None; // (addr, file_idx, line, col)

    while let Some((_, row)) = rows.next_row()? {
        let addr = row.address();
        if addr < address || addr >= address + size {
            if row.end_sequence() {
                prior = None;
            }
            continue;
        }

        if let Some((paddr, pfile, pline, pcol)) = prior.take() {
            let file = file_name(dwarf, unit, &header, pfile)?;
            node.lines.push(LineEntry {
                address: paddr,
                size: addr - paddr,
                file,
                line: pline,
                column: pcol,
            });
        }

        if row.end_sequence() {
            continue;
        }

        let line = row.line().map(|v| v.get() as u32).unwrap_or(0);
        let column = match row.column() {
            gimli::ColumnType::Column(c) => c.get() as u32,
            gimli::ColumnType::LeftEdge => 0,
        };
        prior = Some((addr, row.file_index(), line, column));
    }

    if let Some((paddr, pfile, pline, pcol)) = prior {
        let file = file_name(dwarf, unit, &header, pfile)?;
        node.lines.push(LineEntry {
            address: paddr,
            size: (address + size).saturating_sub(paddr),
            file,
            line: pline,
            column: pcol,
        });
    }

    Ok(())
}

/// Sorts a node's lines by address and pushes each row whose address falls
/// inside a nested inlinee's range down into that inlinee instead of
/// discarding it, recursively, so the innermost scope enclosing an address
/// ends up with its own leaf line entry (own_line/descend rely on this).
///
/// Only the root call carries a populated `node.lines` (collected once over
/// the whole top-level function's range by `collect_lines`); every inlinee
/// starts with `lines: Vec::new()` and receives its rows here before being
/// recursed into, so lines belonging to doubly-nested inlines cascade all
/// the way down.
fn assign_lines(node: &mut FuncNode) {
    if node.inlinees.is_empty() {
        node.lines.sort_by_key(|l| l.address);
        return;
    }

    let mut remaining = Vec::with_capacity(node.lines.len());
    for line in node.lines.drain(..) {
        match node
            .inlinees
            .iter_mut()
            .find(|child| line.address >= child.address && line.address < child.end_address())
        {
            Some(child) => child.lines.push(line),
            None => remaining.push(line),
        }
    }
    node.lines = remaining;
    node.lines.sort_by_key(|l| l.address);

    for child in &mut node.inlinees {
        assign_lines(child);
    }
}

fn apply_bias(addr: u64, bias: i64) -> u64 {
    (addr as i64).wrapping_add(bias) as u64
}

fn pc_range(
    dwarf: &GimliDwarf<'_>,
    unit: &Unit<'_>,
    entry: &Die<'_, '_>,
) -> Result<Option<(u64, u64)>, DwarfError> {
    let low_pc = match entry.attr_value(constants::DW_AT_low_pc)? {
        Some(AttributeValue::Addr(addr)) => addr,
        _ => return Ok(None),
    };

    let high_pc = match entry.attr_value(constants::DW_AT_high_pc)? {
        Some(AttributeValue::Addr(addr)) => addr,
        Some(AttributeValue::Udata(offset)) => low_pc + offset,
        _ => return Ok(None),
    };

    if low_pc == 0 || high_pc <= low_pc {
        return Ok(None);
    }

    let _ = dwarf; // kept for symmetry with sibling helpers that need it
    let _ = unit;
    Ok(Some((low_pc, high_pc)))
}

fn function_name(
    dwarf: &GimliDwarf<'_>,
    unit: &Unit<'_>,
    entry: &Die<'_, '_>,
) -> Result<Option<String>, DwarfError> {
    if let Some(name) = string_attr(dwarf, unit, entry, constants::DW_AT_linkage_name)? {
        return Ok(Some(name));
    }
    string_attr(dwarf, unit, entry, constants::DW_AT_name)
}

fn string_attr(
    dwarf: &GimliDwarf<'_>,
    unit: &Unit<'_>,
    entry: &Die<'_, '_>,
    attr: gimli::DwAt,
) -> Result<Option<String>, DwarfError> {
    let Some(value) = entry.attr_value(attr)? else {
        return Ok(None);
    };

    match value {
        AttributeValue::FileIndex(idx) => {
            let Some(program) = &unit.line_program else {
                return Ok(None);
            };
            Ok(Some(file_name(dwarf, unit, program.header(), idx)?))
        }
        other => {
            let slice = dwarf.attr_string(unit, other)?;
            Ok(Some(String::from_utf8_lossy(&slice.to_slice()?).into_owned()))
        }
    }
}

fn udata_attr(entry: &Die<'_, '_>, attr: gimli::DwAt) -> Result<Option<u64>, DwarfError> {
    match entry.attr_value(attr)? {
        Some(AttributeValue::Udata(v)) => Ok(Some(v)),
        Some(AttributeValue::Data1(v)) => Ok(Some(v as u64)),
        Some(AttributeValue::Data2(v)) => Ok(Some(v as u64)),
        Some(AttributeValue::Data4(v)) => Ok(Some(v as u64)),
        Some(AttributeValue::Data8(v)) => Ok(Some(v)),
        _ => Ok(None),
    }
}

fn file_name(
    dwarf: &GimliDwarf<'_>,
    unit: &Unit<'_>,
    header: &gimli::LineProgramHeader<Slice<'_>>,
    file_index: u64,
) -> Result<String, DwarfError> {
    let Some(file) = header.file(file_index) else {
        return Ok(String::new());
    };

    let name = dwarf.attr_string(unit, file.path_name())?;
    let name = String::from_utf8_lossy(&name.to_slice()?).into_owned();

    let dir = file
        .directory(header)
        .and_then(|d| dwarf.attr_string(unit, d).ok())
        .map(|s| String::from_utf8_lossy(&s.to_slice().unwrap_or_default()).into_owned())
        .unwrap_or_default();

    if name.starts_with('/') || dir.is_empty() {
        Ok(name)
    } else {
        Ok(format!("{dir}/{name}"))
    }
}
