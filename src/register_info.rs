//! Metadata for every user-visible x86-64 register.
//!
//! Each entry records where the register lives inside the kernel's
//! `user` area (the layout ptrace's PEEKUSER/POKEUSER and GETREGS/GETFPREGS
//! calls operate on), how wide it is, its DWARF register number, and how its
//! bytes are to be interpreted. Sub-registers (`eax`, `ax`, `ah`, `al`, ...)
//! alias the low bytes of their parent GPR, so they share its offset.

use std::mem::offset_of;

use nix::libc::{user, user_fpregs_struct, user_regs_struct};

use crate::errors::{DebuggerError, Result};

/// Register class: full GPR, aliased sub-register, floating point / vector
/// state, or debug register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    Gpr,
    SubGpr,
    Fpr,
    Dr,
}

/// How the raw register bytes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterFormat {
    Uint,
    DoubleFloat,
    LongDouble,
    Vector,
}

/// Static description of one register.
#[derive(Debug, Clone, Copy)]
pub struct RegisterInfo {
    pub id: RegisterId,
    pub name: &'static str,
    pub dwarf_id: i32,
    pub size: usize,
    pub offset: usize,
    pub kind: RegisterKind,
    pub format: RegisterFormat,
}

macro_rules! gpr_offset {
    ($reg:ident) => {
        offset_of!(user, regs) + offset_of!(user_regs_struct, $reg)
    };
}

macro_rules! fpr_offset {
    ($field:ident) => {
        offset_of!(user, i387) + offset_of!(user_fpregs_struct, $field)
    };
}

macro_rules! dr_offset {
    ($n:expr) => {
        offset_of!(user, u_debugreg) + 8 * $n
    };
}

/// Declares [`RegisterId`] and [`REGISTER_INFOS`] from a single table, the
/// way the kernel headers declare the user area itself: one line per
/// register.
macro_rules! define_registers {
    ($($name:ident => $dwarf:expr, $size:expr, $offset:expr, $kind:ident, $format:ident;)*) => {
        /// Identifies a register by name.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(non_camel_case_types)]
        pub enum RegisterId {
            $($name,)*
        }

        /// Information for every register in the system.
        pub static REGISTER_INFOS: &[RegisterInfo] = &[
            $(RegisterInfo {
                id: RegisterId::$name,
                name: stringify!($name),
                dwarf_id: $dwarf,
                size: $size,
                offset: $offset,
                kind: RegisterKind::$kind,
                format: RegisterFormat::$format,
            },)*
        ];
    };
}

define_registers! {
    // 64-bit general purpose registers
    rax      => 0,  8, gpr_offset!(rax),      Gpr, Uint;
    rdx      => 1,  8, gpr_offset!(rdx),      Gpr, Uint;
    rcx      => 2,  8, gpr_offset!(rcx),      Gpr, Uint;
    rbx      => 3,  8, gpr_offset!(rbx),      Gpr, Uint;
    rsi      => 4,  8, gpr_offset!(rsi),      Gpr, Uint;
    rdi      => 5,  8, gpr_offset!(rdi),      Gpr, Uint;
    rbp      => 6,  8, gpr_offset!(rbp),      Gpr, Uint;
    rsp      => 7,  8, gpr_offset!(rsp),      Gpr, Uint;
    r8       => 8,  8, gpr_offset!(r8),       Gpr, Uint;
    r9       => 9,  8, gpr_offset!(r9),       Gpr, Uint;
    r10      => 10, 8, gpr_offset!(r10),      Gpr, Uint;
    r11      => 11, 8, gpr_offset!(r11),      Gpr, Uint;
    r12      => 12, 8, gpr_offset!(r12),      Gpr, Uint;
    r13      => 13, 8, gpr_offset!(r13),      Gpr, Uint;
    r14      => 14, 8, gpr_offset!(r14),      Gpr, Uint;
    r15      => 15, 8, gpr_offset!(r15),      Gpr, Uint;
    rip      => 16, 8, gpr_offset!(rip),      Gpr, Uint;
    eflags   => 49, 8, gpr_offset!(eflags),   Gpr, Uint;
    es       => 50, 8, gpr_offset!(es),       Gpr, Uint;
    cs       => 51, 8, gpr_offset!(cs),       Gpr, Uint;
    ss       => 52, 8, gpr_offset!(ss),       Gpr, Uint;
    ds       => 53, 8, gpr_offset!(ds),       Gpr, Uint;
    fs       => 54, 8, gpr_offset!(fs),       Gpr, Uint;
    gs       => 55, 8, gpr_offset!(gs),       Gpr, Uint;
    fs_base  => 58, 8, gpr_offset!(fs_base),  Gpr, Uint;
    gs_base  => 59, 8, gpr_offset!(gs_base),  Gpr, Uint;
    orig_rax => -1, 8, gpr_offset!(orig_rax), Gpr, Uint;

    // 32-bit sub-registers
    eax  => -1, 4, gpr_offset!(rax), SubGpr, Uint;
    edx  => -1, 4, gpr_offset!(rdx), SubGpr, Uint;
    ecx  => -1, 4, gpr_offset!(rcx), SubGpr, Uint;
    ebx  => -1, 4, gpr_offset!(rbx), SubGpr, Uint;
    esi  => -1, 4, gpr_offset!(rsi), SubGpr, Uint;
    edi  => -1, 4, gpr_offset!(rdi), SubGpr, Uint;
    ebp  => -1, 4, gpr_offset!(rbp), SubGpr, Uint;
    esp  => -1, 4, gpr_offset!(rsp), SubGpr, Uint;
    r8d  => -1, 4, gpr_offset!(r8),  SubGpr, Uint;
    r9d  => -1, 4, gpr_offset!(r9),  SubGpr, Uint;
    r10d => -1, 4, gpr_offset!(r10), SubGpr, Uint;
    r11d => -1, 4, gpr_offset!(r11), SubGpr, Uint;
    r12d => -1, 4, gpr_offset!(r12), SubGpr, Uint;
    r13d => -1, 4, gpr_offset!(r13), SubGpr, Uint;
    r14d => -1, 4, gpr_offset!(r14), SubGpr, Uint;
    r15d => -1, 4, gpr_offset!(r15), SubGpr, Uint;

    // 16-bit sub-registers
    ax   => -1, 2, gpr_offset!(rax), SubGpr, Uint;
    dx   => -1, 2, gpr_offset!(rdx), SubGpr, Uint;
    cx   => -1, 2, gpr_offset!(rcx), SubGpr, Uint;
    bx   => -1, 2, gpr_offset!(rbx), SubGpr, Uint;
    si   => -1, 2, gpr_offset!(rsi), SubGpr, Uint;
    di   => -1, 2, gpr_offset!(rdi), SubGpr, Uint;
    bp   => -1, 2, gpr_offset!(rbp), SubGpr, Uint;
    sp   => -1, 2, gpr_offset!(rsp), SubGpr, Uint;
    r8w  => -1, 2, gpr_offset!(r8),  SubGpr, Uint;
    r9w  => -1, 2, gpr_offset!(r9),  SubGpr, Uint;
    r10w => -1, 2, gpr_offset!(r10), SubGpr, Uint;
    r11w => -1, 2, gpr_offset!(r11), SubGpr, Uint;
    r12w => -1, 2, gpr_offset!(r12), SubGpr, Uint;
    r13w => -1, 2, gpr_offset!(r13), SubGpr, Uint;
    r14w => -1, 2, gpr_offset!(r14), SubGpr, Uint;
    r15w => -1, 2, gpr_offset!(r15), SubGpr, Uint;

    // high-byte sub-registers
    ah => -1, 1, gpr_offset!(rax) + 1, SubGpr, Uint;
    dh => -1, 1, gpr_offset!(rdx) + 1, SubGpr, Uint;
    ch => -1, 1, gpr_offset!(rcx) + 1, SubGpr, Uint;
    bh => -1, 1, gpr_offset!(rbx) + 1, SubGpr, Uint;

    // low-byte sub-registers
    al   => -1, 1, gpr_offset!(rax), SubGpr, Uint;
    dl   => -1, 1, gpr_offset!(rdx), SubGpr, Uint;
    cl   => -1, 1, gpr_offset!(rcx), SubGpr, Uint;
    bl   => -1, 1, gpr_offset!(rbx), SubGpr, Uint;
    sil  => -1, 1, gpr_offset!(rsi), SubGpr, Uint;
    dil  => -1, 1, gpr_offset!(rdi), SubGpr, Uint;
    bpl  => -1, 1, gpr_offset!(rbp), SubGpr, Uint;
    spl  => -1, 1, gpr_offset!(rsp), SubGpr, Uint;
    r8b  => -1, 1, gpr_offset!(r8),  SubGpr, Uint;
    r9b  => -1, 1, gpr_offset!(r9),  SubGpr, Uint;
    r10b => -1, 1, gpr_offset!(r10), SubGpr, Uint;
    r11b => -1, 1, gpr_offset!(r11), SubGpr, Uint;
    r12b => -1, 1, gpr_offset!(r12), SubGpr, Uint;
    r13b => -1, 1, gpr_offset!(r13), SubGpr, Uint;
    r14b => -1, 1, gpr_offset!(r14), SubGpr, Uint;
    r15b => -1, 1, gpr_offset!(r15), SubGpr, Uint;

    // x87 / SSE control and status
    fcw       => 65, 2, fpr_offset!(cwd),       Fpr, Uint;
    fsw       => 66, 2, fpr_offset!(swd),       Fpr, Uint;
    ftw       => -1, 2, fpr_offset!(ftw),       Fpr, Uint;
    fop       => -1, 2, fpr_offset!(fop),       Fpr, Uint;
    frip      => -1, 8, fpr_offset!(rip),       Fpr, Uint;
    frdp      => -1, 8, fpr_offset!(rdp),       Fpr, Uint;
    mxcsr     => 64, 4, fpr_offset!(mxcsr),     Fpr, Uint;
    mxcsrmask => -1, 4, fpr_offset!(mxcr_mask), Fpr, Uint;

    // x87 data registers (80-bit values in 16-byte slots)
    st0 => 33, 16, fpr_offset!(st_space),            Fpr, LongDouble;
    st1 => 34, 16, fpr_offset!(st_space) + 16,       Fpr, LongDouble;
    st2 => 35, 16, fpr_offset!(st_space) + 16 * 2,   Fpr, LongDouble;
    st3 => 36, 16, fpr_offset!(st_space) + 16 * 3,   Fpr, LongDouble;
    st4 => 37, 16, fpr_offset!(st_space) + 16 * 4,   Fpr, LongDouble;
    st5 => 38, 16, fpr_offset!(st_space) + 16 * 5,   Fpr, LongDouble;
    st6 => 39, 16, fpr_offset!(st_space) + 16 * 6,   Fpr, LongDouble;
    st7 => 40, 16, fpr_offset!(st_space) + 16 * 7,   Fpr, LongDouble;

    // MMX registers alias the low 8 bytes of the st slots
    mm0 => 41, 8, fpr_offset!(st_space),             Fpr, Vector;
    mm1 => 42, 8, fpr_offset!(st_space) + 16,        Fpr, Vector;
    mm2 => 43, 8, fpr_offset!(st_space) + 16 * 2,    Fpr, Vector;
    mm3 => 44, 8, fpr_offset!(st_space) + 16 * 3,    Fpr, Vector;
    mm4 => 45, 8, fpr_offset!(st_space) + 16 * 4,    Fpr, Vector;
    mm5 => 46, 8, fpr_offset!(st_space) + 16 * 5,    Fpr, Vector;
    mm6 => 47, 8, fpr_offset!(st_space) + 16 * 6,    Fpr, Vector;
    mm7 => 48, 8, fpr_offset!(st_space) + 16 * 7,    Fpr, Vector;

    // SSE registers
    xmm0  => 17, 16, fpr_offset!(xmm_space),           Fpr, Vector;
    xmm1  => 18, 16, fpr_offset!(xmm_space) + 16,      Fpr, Vector;
    xmm2  => 19, 16, fpr_offset!(xmm_space) + 16 * 2,  Fpr, Vector;
    xmm3  => 20, 16, fpr_offset!(xmm_space) + 16 * 3,  Fpr, Vector;
    xmm4  => 21, 16, fpr_offset!(xmm_space) + 16 * 4,  Fpr, Vector;
    xmm5  => 22, 16, fpr_offset!(xmm_space) + 16 * 5,  Fpr, Vector;
    xmm6  => 23, 16, fpr_offset!(xmm_space) + 16 * 6,  Fpr, Vector;
    xmm7  => 24, 16, fpr_offset!(xmm_space) + 16 * 7,  Fpr, Vector;
    xmm8  => 25, 16, fpr_offset!(xmm_space) + 16 * 8,  Fpr, Vector;
    xmm9  => 26, 16, fpr_offset!(xmm_space) + 16 * 9,  Fpr, Vector;
    xmm10 => 27, 16, fpr_offset!(xmm_space) + 16 * 10, Fpr, Vector;
    xmm11 => 28, 16, fpr_offset!(xmm_space) + 16 * 11, Fpr, Vector;
    xmm12 => 29, 16, fpr_offset!(xmm_space) + 16 * 12, Fpr, Vector;
    xmm13 => 30, 16, fpr_offset!(xmm_space) + 16 * 13, Fpr, Vector;
    xmm14 => 31, 16, fpr_offset!(xmm_space) + 16 * 14, Fpr, Vector;
    xmm15 => 32, 16, fpr_offset!(xmm_space) + 16 * 15, Fpr, Vector;

    // debug registers
    dr0 => -1, 8, dr_offset!(0), Dr, Uint;
    dr1 => -1, 8, dr_offset!(1), Dr, Uint;
    dr2 => -1, 8, dr_offset!(2), Dr, Uint;
    dr3 => -1, 8, dr_offset!(3), Dr, Uint;
    dr4 => -1, 8, dr_offset!(4), Dr, Uint;
    dr5 => -1, 8, dr_offset!(5), Dr, Uint;
    dr6 => -1, 8, dr_offset!(6), Dr, Uint;
    dr7 => -1, 8, dr_offset!(7), Dr, Uint;
}

/// The four address debug registers, indexable by hardware slot.
pub const DR_IDS: [RegisterId; 8] = [
    RegisterId::dr0,
    RegisterId::dr1,
    RegisterId::dr2,
    RegisterId::dr3,
    RegisterId::dr4,
    RegisterId::dr5,
    RegisterId::dr6,
    RegisterId::dr7,
];

pub fn register_info_by_id(id: RegisterId) -> &'static RegisterInfo {
    REGISTER_INFOS
        .iter()
        .find(|info| info.id == id)
        .expect("every RegisterId has a table entry")
}

pub fn register_info_by_name(name: &str) -> Result<&'static RegisterInfo> {
    REGISTER_INFOS
        .iter()
        .find(|info| info.name == name)
        .ok_or_else(|| DebuggerError::UnknownRegister(name.to_string()))
}

pub fn register_info_by_dwarf_id(dwarf_id: i32) -> Result<&'static RegisterInfo> {
    REGISTER_INFOS
        .iter()
        .find(|info| info.dwarf_id == dwarf_id && info.dwarf_id != -1)
        .ok_or_else(|| DebuggerError::UnknownRegister(format!("dwarf:{dwarf_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        let info = register_info_by_name("rip").unwrap();
        assert_eq!(info.id, RegisterId::rip);
        assert_eq!(info.size, 8);
        assert_eq!(info.kind, RegisterKind::Gpr);
        assert!(register_info_by_name("zmm0").is_err());
    }

    #[test]
    fn lookup_by_dwarf_id() {
        assert_eq!(register_info_by_dwarf_id(0).unwrap().id, RegisterId::rax);
        assert_eq!(register_info_by_dwarf_id(16).unwrap().id, RegisterId::rip);
        assert_eq!(register_info_by_dwarf_id(17).unwrap().id, RegisterId::xmm0);
    }

    #[test]
    fn sub_registers_alias_their_parent() {
        let rax = register_info_by_id(RegisterId::rax);
        let eax = register_info_by_id(RegisterId::eax);
        let ah = register_info_by_id(RegisterId::ah);
        assert_eq!(rax.offset, eax.offset);
        assert_eq!(rax.offset + 1, ah.offset);
        assert_eq!(eax.size, 4);
    }

    #[test]
    fn debug_register_offsets_are_contiguous() {
        let dr0 = register_info_by_id(RegisterId::dr0);
        for i in 1..8 {
            let dri = register_info_by_id(DR_IDS[i]);
            assert_eq!(dri.offset, dr0.offset + 8 * i);
        }
    }

    #[test]
    fn table_has_unique_names_and_ids() {
        use std::collections::HashSet;
        let names: HashSet<_> = REGISTER_INFOS.iter().map(|i| i.name).collect();
        assert_eq!(names.len(), REGISTER_INFOS.len());
    }
}
