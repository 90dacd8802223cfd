//! Source-level coverage and taint tracking for 32-bit RISC-V programs
//! executed on a symbolic-execution virtual platform.
//!
//! While the host simulator retires instructions, this crate watches each
//! program counter and accumulates which source lines, functions, and basic
//! blocks were reached, how often, and whether the simulator's data state
//! ever carried symbolic or tainted bits at that point. On teardown it
//! writes one gzip-compressed, gcov-compatible JSON report per source file.
//!
//! The public surface is deliberately small: open an ELF image with
//! [`Coverage::open`], call [`Coverage::init`] once, feed every retired
//! address through [`Coverage::cover`], and call [`report::marshal`] on
//! shutdown.

mod blocks;
mod decoder;
pub mod dwarf;
pub mod elf;
pub mod error;
pub mod instr_memory;
pub mod model;
pub mod report;

pub use dwarf::{DebugInfoReader, SourceInfo};
pub use elf::ElfImage;
pub use error::{CoverageError, DwarfError, DwarfErrorKind};
pub use instr_memory::InstrMemory;
pub use model::Coverage;
pub use report::{marshal, CoverageConfig};
