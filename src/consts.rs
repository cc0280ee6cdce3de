//! Constants that are deeply nested in the kernel uapi headers and not
//! available from nix or the rust bindings of the libc.
//!
//! Source: <https://elixir.bootlin.com/linux/v6.13.1/source/include/uapi/asm-generic/siginfo.h#L227>

#![allow(unused)]

/// Sent by the kernel. On x86-64 the kernel reports int3 stops with this
/// si_code instead of TRAP_BRKPT; enough tools depend on the quirk that it
/// will never change.
pub const SI_KERNEL: i32 = 0x80;

// ---------------- SIGTRAP si_codes ----------------

/// Process breakpoint
pub const TRAP_BRKPT: i32 = 0x1;
/// Process trace trap (single stepping)
pub const TRAP_TRACE: i32 = 0x2;
/// Hardware breakpoint/watchpoint
pub const TRAP_HWBKPT: i32 = 0x4;

// ---------------- auxiliary vector ----------------

/// Entry point of the executable, as reported in /proc/<pid>/auxv
pub const AT_ENTRY: u64 = 9;

/// The int3 opcode, one byte
pub const INT3: u8 = 0xcc;

/// Page size assumed when splitting remote reads on page boundaries
pub const PAGE_SIZE: u64 = 0x1000;
