//! gcov-compatible JSON report serialization (§4.6, §6).
//!
//! Grounded on the original `coverage-vp`'s `json.cpp` for field names and
//! nesting, and on the teacher's general `serde`-derive idiom for the
//! `Serialize` types themselves.

use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};

use crate::error::CoverageError;
use crate::instr_memory::InstrMemory;
use crate::model::{Coverage, SourceFile};

/// Suffix appended (never substituted) to an absolute source path to form
/// its output path — `FILE_EXT` in the original implementation.
const OUTPUT_SUFFIX: &str = ".gcov.json.gz";

/// gcc version string reported by the original `coverage-vp` tool; fixed
/// rather than detected, since nothing downstream actually parses it.
const GCC_VERSION: &str = "10.3.1 20210424";

/// Knobs for [`marshal`] that don't belong in the environment, so tests can
/// redirect output without mutating process-global state (§2a).
#[derive(Debug, Clone)]
pub struct CoverageConfig {
    /// Overrides `SYMEX_COVERAGE_PATH`. `None` means "read the environment".
    pub path_filter: Option<Option<String>>,
    /// Overrides [`OUTPUT_SUFFIX`]. Exists purely for tests that want to
    /// write into a scratch directory without colliding on real paths.
    pub output_suffix: String,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            path_filter: None,
            output_suffix: OUTPUT_SUFFIX.to_string(),
        }
    }
}

impl CoverageConfig {
    fn resolved_filter(&self) -> Option<String> {
        match &self.path_filter {
            Some(inner) => inner.clone(),
            None => std::env::var("SYMEX_COVERAGE_PATH").ok(),
        }
    }
}

#[derive(Serialize)]
struct ReportDocument {
    format_version: &'static str,
    gcc_version: &'static str,
    data_file: String,
    current_working_directory: String,
    files: Vec<ReportFile>,
}

#[derive(Serialize)]
struct ReportFile {
    file: String,
    lines: Vec<ReportLine>,
    functions: Vec<ReportFunction>,
}

#[derive(Serialize)]
struct ReportLine {
    branches: [(); 0],
    count: u64,
    line_number: u32,
    unexecuted_block: bool,
    function_name: String,
    #[serde(rename = "symex/tainted_once")]
    tainted_once: bool,
    #[serde(rename = "symex/symbolic_once")]
    symbolic_once: bool,
    #[serde(rename = "symex/initial_concretization")]
    initial_concretization: bool,
}

#[derive(Serialize)]
struct ReportFunction {
    blocks: usize,
    blocks_executed: usize,
    demangled_name: String,
    name: String,
    start_line: u32,
    start_column: u32,
    end_line: u32,
    end_column: u32,
    execution_count: u64,
}

/// Writes one gzip-compressed gcov-JSON document per retained source file
/// (§4.6). A failure opening any single output aborts that file only; the
/// first such failure is returned to the caller after every other file has
/// still been attempted.
pub fn marshal<R: crate::dwarf::DebugInfoReader, M: InstrMemory>(
    coverage: &Coverage<R, M>,
    config: &CoverageConfig,
) -> Result<(), CoverageError> {
    let filter = config.resolved_filter();
    let mut first_error = None;

    for (path, file) in coverage.files() {
        if let Some(prefix) = &filter {
            if !path.starts_with(prefix.as_str()) {
                continue;
            }
        }

        if let Err(e) = write_one(coverage, path, file, &config.output_suffix) {
            tracing::warn!(source_path = %path, error = %e, "marshal: failed to write coverage output");
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Serializes `doc` pretty-printed at 4-space indentation, matching the
/// original tool's `std::setw(4)` (§6). `serde_json::to_vec_pretty`'s
/// built-in formatter is fixed at two spaces, so this goes through
/// `PrettyFormatter::with_indent` directly instead.
fn to_json_indent4(doc: &ReportDocument) -> serde_json::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut ser = Serializer::with_formatter(&mut buf, formatter);
    doc.serialize(&mut ser)?;
    Ok(buf)
}

fn write_one<R: crate::dwarf::DebugInfoReader, M: InstrMemory>(
    coverage: &Coverage<R, M>,
    path: &str,
    file: &SourceFile,
    suffix: &str,
) -> Result<(), CoverageError> {
    let doc = build_document(coverage, path, file);
    let json = to_json_indent4(&doc).expect("report document is always serializable");

    let output_path = PathBuf::from(format!("{path}{suffix}"));
    let out = std::fs::File::create(&output_path).map_err(|e| CoverageError::OutputOpenFailure {
        path: output_path.clone(),
        source: e,
    })?;

    let mut encoder = GzEncoder::new(out, Compression::default());
    encoder
        .write_all(&json)
        .and_then(|_| encoder.finish().map(|_| ()))
        .map_err(|e| CoverageError::OutputOpenFailure {
            path: output_path,
            source: e,
        })
}

fn build_document<R: crate::dwarf::DebugInfoReader, M: InstrMemory>(
    _coverage: &Coverage<R, M>,
    path: &str,
    file: &SourceFile,
) -> ReportDocument {
    let source_path = Path::new(path);
    let basename = source_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    let dirname = source_path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut lines: Vec<ReportLine> = file
        .lines
        .iter()
        .map(|(&line_number, sl)| {
            let unexecuted_block = sl.exec_count == 0
                || sl.blocks.iter().any(|&b| !_coverage.blocks()[b].visited);
            ReportLine {
                branches: [],
                count: sl.exec_count,
                line_number,
                unexecuted_block,
                function_name: sl.func_name.clone(),
                tainted_once: sl.tainted_once,
                symbolic_once: sl.symbolic_once,
                initial_concretization: sl.initial_conc,
            }
        })
        .collect();
    lines.sort_by_key(|l| l.line_number);

    let mut functions: Vec<ReportFunction> = file
        .funcs
        .iter()
        .map(|(name, func)| {
            let blocks_executed = func
                .blocks
                .iter()
                .filter(|&&b| _coverage.blocks()[b].visited)
                .count();
            ReportFunction {
                blocks: func.blocks.len(),
                blocks_executed,
                demangled_name: name.clone(),
                name: name.clone(),
                start_line: func.definition.0.line,
                start_column: func.definition.0.column,
                end_line: func.definition.1.line,
                end_column: func.definition.1.column,
                execution_count: func.exec_count,
            }
        })
        .collect();
    functions.sort_by(|a, b| a.name.cmp(&b.name));

    ReportDocument {
        format_version: "1",
        gcc_version: GCC_VERSION,
        data_file: basename.clone(),
        current_working_directory: dirname,
        files: vec![ReportFile {
            file: basename,
            lines,
            functions,
        }],
    }
}
