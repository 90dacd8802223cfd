//! End-to-end exercise of the public `Coverage` API against an in-memory
//! mock debug-info reader and instruction memory — no real ELF/DWARF
//! fixtures, per SPEC_FULL.md §2a "Test tooling".

use std::collections::{BTreeMap, HashMap};

use symex_coverage::dwarf::{DebugInfoReader, SourceInfo};
use symex_coverage::instr_memory::InstrMemory;
use symex_coverage::report::{marshal, CoverageConfig};
use symex_coverage::Coverage;

const NOP: u32 = 0x0000_0013; // addi x0, x0, 0

/// A little-endian word store, standing in for the simulator's memory.
#[derive(Default)]
struct Memory(BTreeMap<u64, u32>);

impl Memory {
    fn put32(&mut self, addr: u64, word: u32) -> &mut Self {
        self.0.insert(addr, word);
        self.0.insert(addr + 2, word >> 16);
        self
    }
}

impl InstrMemory for Memory {
    fn load_instr(&self, addr: u64) -> u32 {
        *self.0.get(&addr).unwrap_or(&0)
    }
}

fn beq(imm: i32) -> u32 {
    let imm = imm as u32 & 0x1fff;
    let imm12 = (imm >> 12) & 0x1;
    let imm11 = (imm >> 11) & 0x1;
    let imm10_5 = (imm >> 5) & 0x3f;
    let imm4_1 = (imm >> 1) & 0xf;
    (imm12 << 31) | (imm10_5 << 25) | (imm4_1 << 8) | (imm11 << 7) | 0b110_0011
}

fn info(symbol: &str, path: &str, line: u32, column: u32) -> SourceInfo {
    SourceInfo {
        symbol_name: symbol.into(),
        source_path: path.into(),
        line,
        column,
    }
}

/// A scripted [`DebugInfoReader`]: one or more function ranges, plus a fixed
/// answer table keyed by address.
#[derive(Default)]
struct ScriptedReader {
    functions: Vec<(u64, u64)>,
    answers: HashMap<u64, Vec<SourceInfo>>,
}

impl ScriptedReader {
    fn function(mut self, start: u64, end: u64) -> Self {
        self.functions.push((start, end));
        self
    }

    fn at(mut self, addr: u64, infos: Vec<SourceInfo>) -> Self {
        self.answers.insert(addr, infos);
        self
    }
}

impl DebugInfoReader for ScriptedReader {
    fn resolve(&self, addr: u64) -> Vec<SourceInfo> {
        self.answers.get(&addr).cloned().unwrap_or_default()
    }

    fn for_each_function(&self, visitor: &mut dyn FnMut(u64, u64)) {
        for &(start, end) in &self.functions {
            visitor(start, end);
        }
    }
}

#[test]
fn single_block_function_reaches_full_coverage() {
    let mut mem = Memory::default();
    mem.put32(0x100, NOP).put32(0x104, NOP);

    let reader = ScriptedReader::default()
        .function(0x100, 0x108)
        .at(0x100, vec![info("f", "a.c", 10, 1)])
        .at(0x104, vec![info("f", "a.c", 11, 1)]);

    let mut coverage = Coverage::with_reader(reader, mem);
    coverage.init().unwrap();

    assert_eq!(coverage.files()["a.c"].funcs["f"].blocks.len(), 1);
    let block = coverage.blocks()[coverage.files()["a.c"].funcs["f"].blocks[0]];
    assert_eq!((block.start, block.end), (0x100, 0x108));
    assert!(!block.visited);

    coverage.cover(0x100, false, false, false).unwrap();
    coverage.cover(0x104, false, false, false).unwrap();

    let file = &coverage.files()["a.c"];
    assert_eq!(file.funcs["f"].exec_count, 1);
    assert!(coverage.blocks()[file.funcs["f"].blocks[0]].visited);
}

#[test]
fn forward_branch_splits_function_into_three_blocks() {
    // f @ [0x200, 0x220): BEQ at 0x208 targets 0x218.
    let mut mem = Memory::default();
    mem.put32(0x200, NOP)
        .put32(0x204, NOP)
        .put32(0x208, beq(0x218 - 0x208))
        .put32(0x20c, NOP)
        .put32(0x210, NOP)
        .put32(0x214, NOP)
        .put32(0x218, NOP)
        .put32(0x21c, NOP);

    let mut reader = ScriptedReader::default().function(0x200, 0x220);
    for addr in [0x200u64, 0x204, 0x208, 0x20c, 0x210, 0x214, 0x218, 0x21c] {
        reader = reader.at(addr, vec![info("g", "b.c", 20 + (addr - 0x200) / 4, 0)]);
    }

    let mut coverage = Coverage::with_reader(reader, mem);
    coverage.init().unwrap();

    let func = &coverage.files()["b.c"].funcs["g"];
    let mut ranges: Vec<(u64, u64)> = func
        .blocks
        .iter()
        .map(|&b| {
            let blk = coverage.blocks()[b];
            (blk.start, blk.end)
        })
        .collect();
    ranges.sort();
    assert_eq!(ranges, vec![(0x200, 0x20c), (0x20c, 0x218), (0x218, 0x220)]);
}

#[test]
fn inlined_call_credits_both_caller_and_callee() {
    // A single retired address inside an inlined callee resolves to two
    // SourceInfos: the inlined body, and the call site in the caller.
    let mut mem = Memory::default();
    mem.put32(0x400, NOP);

    let reader = ScriptedReader::default().function(0x400, 0x404).at(
        0x400,
        vec![
            info("callee", "inlined.c", 5, 3),
            info("caller", "outer.c", 42, 7),
        ],
    );

    let mut coverage = Coverage::with_reader(reader, mem);
    coverage.init().unwrap();
    coverage.cover(0x400, false, false, false).unwrap();

    assert_eq!(coverage.files()["inlined.c"].funcs["callee"].exec_count, 1);
    assert_eq!(coverage.files()["outer.c"].funcs["caller"].exec_count, 1);
    assert_eq!(coverage.files()["inlined.c"].lines[&5].exec_count, 1);
    assert_eq!(coverage.files()["outer.c"].lines[&42].exec_count, 1);
}

#[test]
fn taint_and_symbolic_flags_are_sticky_across_calls() {
    let mut mem = Memory::default();
    mem.put32(0x500, NOP);

    let reader = ScriptedReader::default()
        .function(0x500, 0x504)
        .at(0x500, vec![info("h", "c.c", 1, 0)]);

    let mut coverage = Coverage::with_reader(reader, mem);
    coverage.init().unwrap();

    coverage.cover(0x500, true, false, false).unwrap();
    coverage.cover(0x500, false, true, false).unwrap();
    coverage.cover(0x500, false, false, true).unwrap();
    coverage.cover(0x500, false, false, false).unwrap();

    let line = &coverage.files()["c.c"].lines[&1];
    assert!(line.tainted_once);
    assert!(line.symbolic_once);
    assert!(line.initial_conc);
    assert_eq!(line.exec_count, 4);
}

#[test]
fn cover_on_unresolved_address_is_a_silent_no_op() {
    let mem = Memory::default();
    let reader = ScriptedReader::default().function(0x600, 0x604);
    let mut coverage = Coverage::with_reader(reader, mem);
    coverage.init().unwrap();

    // 0x600 never appears in the reader's answer table (e.g. padding with
    // no line-table entry): this must not panic or error.
    assert!(coverage.cover(0x600, true, true, true).is_ok());
}

#[test]
fn cover_before_init_returns_invalid_state() {
    let mem = Memory::default();
    let reader = ScriptedReader::default();
    let mut coverage = Coverage::with_reader(reader, mem);
    assert!(coverage.cover(0x0, false, false, false).is_err());
}

#[test]
fn marshal_emits_one_gzip_report_per_retained_source_filtered_by_path() {
    use std::io::Read;

    let mut mem = Memory::default();
    mem.put32(0x700, NOP);

    let dir = tempfile::tempdir().unwrap();
    let kept_path = dir.path().join("proj").join("src").join("a.c");
    std::fs::create_dir_all(kept_path.parent().unwrap()).unwrap();
    std::fs::write(&kept_path, "int f(void) { return 0; }\n").unwrap();
    let kept_path = kept_path.to_string_lossy().into_owned();

    let dropped_path = dir.path().join("usr").join("include").join("x.h");
    std::fs::create_dir_all(dropped_path.parent().unwrap()).unwrap();
    std::fs::write(&dropped_path, "\n").unwrap();
    let dropped_path = dropped_path.to_string_lossy().into_owned();

    let mut mem2 = Memory::default();
    mem2.put32(0x800, NOP);

    let reader = ScriptedReader::default()
        .function(0x700, 0x704)
        .function(0x800, 0x804)
        .at(0x700, vec![info("f", &kept_path, 1, 1)])
        .at(0x800, vec![info("g", &dropped_path, 1, 1)]);

    // Combine both functions' instructions into one memory view.
    mem.put32(0x800, NOP);
    let _ = mem2;

    let mut coverage = Coverage::with_reader(reader, mem);
    coverage.init().unwrap();
    coverage.cover(0x700, false, false, false).unwrap();
    coverage.cover(0x800, false, false, false).unwrap();

    let config = CoverageConfig {
        path_filter: Some(Some(dir.path().join("proj").to_string_lossy().into_owned())),
        output_suffix: ".gcov.json.gz".into(),
    };
    marshal(&coverage, &config).unwrap();

    let kept_out = format!("{kept_path}.gcov.json.gz");
    assert!(std::path::Path::new(&kept_out).exists());
    let dropped_out = format!("{dropped_path}.gcov.json.gz");
    assert!(!std::path::Path::new(&dropped_out).exists());

    let bytes = std::fs::read(&kept_out).unwrap();
    let mut decoder = flate2::read::GzDecoder::new(bytes.as_slice());
    let mut text = String::new();
    decoder.read_to_string(&mut text).unwrap();
    assert!(text.contains("\"execution_count\": 1"));
    assert!(text.contains("\"symex/tainted_once\""));
}
