//! # Error Types
//!
//! Defines error types and a result alias used throughout the [crate].
//!
//! Every fallible operation in the library returns [`Result`]. Kernel-level
//! failures carry the name of the operation that failed together with the
//! decoded errno, so the embedding shell can report "could not resume: ..."
//! style messages without further context plumbing.

use thiserror::Error;

/// Type alias for Results returned by galena functions
pub type Result<T> = std::result::Result<T, DebuggerError>;

/// Comprehensive error type for the galena debugger library
///
/// [`DebuggerError`] encapsulates all potential errors that can occur during
/// debugging operations: OS failures, bad arguments, malformed ELF/DWARF
/// images, hardware-resource exhaustion, and state-machine violations.
#[derive(Error, Debug)]
pub enum DebuggerError {
    /// A kernel call failed. `op` names the operation, e.g. "resume".
    #[error("{op}: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: nix::Error,
    },
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not convert to CString: {0}")]
    CStringConv(#[from] std::ffi::NulError),
    #[error("Could not launch inferior: {0}")]
    Launch(String),
    #[error("Invalid PID")]
    InvalidPid,
    #[error("Inferior reached a terminal state, cannot resume")]
    ResumeAfterTerminal,
    #[error("Inferior died while stepping over a breakpoint")]
    ExitedDuringStep,
    #[error("Auxiliary vector has no AT_ENTRY")]
    NoEntryPoint,
    #[error("Stoppoint already exists at address {0:#x}")]
    StoppointExists(u64),
    #[error("No stoppoint with id {0}")]
    UnknownStoppointId(i32),
    #[error("No stoppoint at address {0:#x}")]
    NoStoppointAtAddress(u64),
    #[error("Watchpoints must be aligned to their size")]
    MisalignedWatchpoint,
    #[error("Invalid stoppoint size: {0}")]
    InvalidStoppointSize(usize),
    #[error("No remaining hardware debug registers")]
    NoFreeDebugRegister,
    #[error("No hardware stoppoint is currently triggered")]
    NoTriggeredStoppoint,
    #[error("Register not found: {0}")]
    UnknownRegister(String),
    #[error("Register value does not fit in register {0}")]
    RegisterValueTooLarge(&'static str),
    #[error("Could not parse integer: {0}")]
    ParseInt(#[from] std::num::ParseIntError),
    #[error("Not an ELF-64 image: {0}")]
    NotElf(String),
    #[error("ELF image is truncated")]
    TruncatedElf,
    #[error("Only DWARF32 is supported")]
    Dwarf64NotSupported,
    #[error("Only DWARF version 4 is supported, found version {0}")]
    UnsupportedDwarfVersion(u16),
    #[error("Invalid DWARF address size: {0}")]
    InvalidDwarfAddressSize(u8),
    #[error("Unrecognized DWARF form: {0:#x}")]
    UnrecognizedForm(u64),
    #[error("DWARF data ended unexpectedly")]
    UnexpectedEndOfDwarf,
    #[error("Unknown DWARF abbreviation code: {0}")]
    UnknownAbbrevCode(u64),
    #[error("A required attribute does not exist: {0}")]
    AttributeDoesNotExist(gimli::DwAt),
    #[error("Attribute has an invalid form for this accessor: {0}")]
    WrongAttributeForm(gimli::DwAt),
    #[error("DIE has no PC bounds")]
    NoPcBounds,
    #[error("File address belongs to a different ELF image")]
    ForeignFileAddress,
}

impl DebuggerError {
    pub(crate) fn os(op: &'static str, source: nix::Error) -> Self {
        DebuggerError::Os { op, source }
    }
}

/// Shorthand to map a `nix::Result` into a [`DebuggerError::Os`] with an
/// operation name attached.
pub(crate) trait OsErrorExt<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> OsErrorExt<T> for std::result::Result<T, nix::Error> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|e| DebuggerError::os(op, e))
    }
}
