//! Error types for the coverage subsystem.
//!
//! Mirrors the shape used throughout `symbolic-debuginfo`: a small
//! `#[non_exhaustive]` `*ErrorKind` enum describing *what* went wrong, paired
//! with a wrapper struct that additionally carries an optional boxed
//! `source`. Recoverable conditions (missing line info, an address that maps
//! to a source file or symbol `init` never saw) are deliberately **not**
//! represented here: per the error handling policy, those are absorbed
//! internally as empty results or no-ops and only ever surface as a
//! `tracing` event.

use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// The kinds of failure that can occur while opening or walking the DWARF
/// debug information of a loaded ELF image.
#[non_exhaustive]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DwarfErrorKind {
    /// The `.debug_info`/`.debug_line` sections could not be parsed.
    CorruptedData,
    /// A compilation unit referenced by index does not exist.
    InvalidUnitRef(usize),
    /// A function DIE had an inverted or otherwise nonsensical address range.
    InvertedFunctionRange,
    /// An inlined-subroutine DIE had no enclosing function or inline scope.
    UnexpectedInline,
}

impl fmt::Display for DwarfErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CorruptedData => write!(f, "corrupted dwarf debug data"),
            Self::InvalidUnitRef(offset) => {
                write!(f, "compilation unit for offset {offset} does not exist")
            }
            Self::InvertedFunctionRange => write!(f, "function with inverted address range"),
            Self::UnexpectedInline => write!(f, "unexpected inline function without parent"),
        }
    }
}

/// An error encountered while reading DWARF debug information.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct DwarfError {
    kind: DwarfErrorKind,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl DwarfError {
    /// Creates a new DWARF error from a known kind plus an arbitrary source payload.
    pub(crate) fn new<E>(kind: DwarfErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self {
            kind,
            source: Some(source.into()),
        }
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> DwarfErrorKind {
        self.kind
    }
}

impl From<DwarfErrorKind> for DwarfError {
    fn from(kind: DwarfErrorKind) -> Self {
        Self { kind, source: None }
    }
}

impl From<gimli::Error> for DwarfError {
    fn from(e: gimli::Error) -> Self {
        Self::new(DwarfErrorKind::CorruptedData, e)
    }
}

/// Top-level error returned by the fatal, non-recoverable entry points of
/// [`crate::Coverage`]: construction, `init`, and per-file serialization.
#[derive(Debug, Error)]
pub enum CoverageError {
    /// The ELF path could not be opened or does not contain a valid ELF/DWARF image.
    #[error("failed to open binary at {path}")]
    BinaryOpenFailure {
        path: PathBuf,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    /// A non-recoverable DWARF error occurred during construction or `init`.
    #[error("dwarf error: {0}")]
    Dwarf(#[from] DwarfError),

    /// A per-file coverage report could not be written.
    #[error("failed to open coverage output at {path}")]
    OutputOpenFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `init()` was called more than once, or `cover`/`marshal` were called
    /// before `init()` completed. See the `Coverage` state machine.
    #[error("coverage model used out of its {expected} state")]
    InvalidState { expected: &'static str },
}
