//! # galena
//!
//! A ptrace-based debugger library for x86-64 Linux.
//!
//! galena launches or attaches to an inferior process, drives it at
//! instruction granularity, reads and writes its registers and memory,
//! plants software and hardware breakpoints and data watchpoints,
//! intercepts system calls, and resolves addresses to symbols and functions
//! through its own ELF-64 and DWARF-4 readers.
//!
//! The entry point for most embedders is [`Target`], which binds a
//! [`Process`](process::Process) to the [`Elf`](elf::Elf) image it runs and
//! the [`Dwarf`](dwarf::Dwarf) debug information inside it:
//!
//! ```no_run
//! use galena::{Target, Result};
//!
//! fn main() -> Result<()> {
//!     let mut target = Target::launch("/bin/true", None)?;
//!     let entry = target.process().entry_point()?;
//!
//!     let id = target
//!         .process_mut()
//!         .create_breakpoint_site(entry, false, false)?
//!         .id();
//!     target.process_mut().enable_breakpoint_site(id)?;
//!     target.process_mut().resume()?;
//!
//!     let stop = target.process_mut().wait_on_signal()?;
//!     println!("stopped: {stop:?} at {}", target.process().get_pc());
//!     Ok(())
//! }
//! ```
//!
//! The library is single-threaded and blocking: the only suspension point
//! is [`Process::wait_on_signal`](process::Process::wait_on_signal), and all
//! kernel debugging calls serialize through the owning
//! [`Process`](process::Process).

pub mod addr;
pub mod consts;
pub mod dwarf;
pub mod elf;
pub mod errors;
pub mod pipe;
pub mod process;
pub mod register_info;
pub mod registers;
pub mod stoppoint;
pub mod target;

pub use addr::{FileAddr, FileOffset, VirtAddr};
pub use errors::{DebuggerError, Result};
pub use process::{
    HardwareStoppoint, Process, ProcessState, StopReason, SyscallCatchPolicy, SyscallData,
    SyscallInfo, TrapType,
};
pub use register_info::{RegisterId, RegisterInfo};
pub use registers::RegisterValue;
pub use stoppoint::{BreakpointSite, StoppointId, StoppointMode, Watchpoint};
pub use target::Target;
