//! Address types for the debugger.
//!
//! The debugger deals with two address spaces that must never be mixed up:
//! addresses as recorded inside an ELF image ([`FileAddr`], [`FileOffset`])
//! and addresses in the running inferior ([`VirtAddr`]). File addresses carry
//! a back-reference to the image they belong to, so cross-image comparisons
//! can be rejected, and conversion between the two spaces goes through the
//! image's load bias.

use std::fmt::Display;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::rc::{Rc, Weak};

use crate::elf::Elf;

/// An address in the inferior's virtual address space.
#[derive(Hash, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct VirtAddr(u64);

impl VirtAddr {
    pub const fn new(addr: u64) -> Self {
        VirtAddr(addr)
    }

    pub fn addr(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Translates to the address the given image records for this location,
    /// by subtracting the image's load bias. Yields the null address if no
    /// section of the image contains this address.
    pub fn to_file_addr(self, elf: &Rc<Elf>) -> FileAddr {
        if elf.section_containing_virt_addr(self).is_none() {
            return FileAddr::default();
        }
        FileAddr::new(elf, self.0 - elf.load_bias().addr())
    }
}

impl Display for VirtAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl std::fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl Add<u64> for VirtAddr {
    type Output = Self;
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for VirtAddr {
    type Output = Self;
    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl Sub for VirtAddr {
    type Output = u64;
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl AddAssign<u64> for VirtAddr {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl SubAssign<u64> for VirtAddr {
    fn sub_assign(&mut self, rhs: u64) {
        self.0 = self.0.wrapping_sub(rhs);
    }
}

impl From<u64> for VirtAddr {
    fn from(value: u64) -> Self {
        VirtAddr(value)
    }
}

impl From<VirtAddr> for u64 {
    fn from(value: VirtAddr) -> Self {
        value.0
    }
}

/// An address as recorded in a specific ELF image.
///
/// Carries a weak back-reference to the image so that comparisons and
/// conversions can check image identity. The default value is the null
/// address, which belongs to no image.
#[derive(Clone, Default)]
pub struct FileAddr {
    elf: Weak<Elf>,
    addr: u64,
}

impl FileAddr {
    pub fn new(elf: &Rc<Elf>, addr: u64) -> Self {
        FileAddr {
            elf: Rc::downgrade(elf),
            addr,
        }
    }

    pub(crate) fn from_weak(elf: Weak<Elf>, addr: u64) -> Self {
        FileAddr { elf, addr }
    }

    pub(crate) fn elf_ptr_eq(&self, elf: &Weak<Elf>) -> bool {
        self.elf.ptr_eq(elf)
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// The image this address belongs to, if any.
    pub fn elf(&self) -> Option<Rc<Elf>> {
        self.elf.upgrade()
    }

    pub fn is_null(&self) -> bool {
        self.elf.upgrade().is_none()
    }

    /// True when both addresses refer into the same ELF image.
    pub fn same_image(&self, other: &FileAddr) -> bool {
        self.elf.ptr_eq(&other.elf) && !self.is_null()
    }

    /// True when the address refers into the given image.
    pub fn belongs_to(&self, elf: &Rc<Elf>) -> bool {
        self.elf
            .upgrade()
            .is_some_and(|own| Rc::ptr_eq(&own, elf))
    }

    /// Translates to the runtime address by adding the image's load bias.
    /// Yields the null address if the address falls outside every section.
    pub fn to_virt(&self) -> VirtAddr {
        let Some(elf) = self.elf.upgrade() else {
            return VirtAddr::default();
        };
        if elf.section_containing_file_addr(self).is_none() {
            return VirtAddr::default();
        }
        VirtAddr::new(self.addr + elf.load_bias().addr())
    }
}

impl PartialEq for FileAddr {
    fn eq(&self, other: &Self) -> bool {
        self.same_image(other) && self.addr == other.addr
    }
}

impl PartialOrd for FileAddr {
    /// Addresses from different images are unordered.
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if !self.same_image(other) {
            return None;
        }
        Some(self.addr.cmp(&other.addr))
    }
}

impl Add<u64> for FileAddr {
    type Output = Self;
    fn add(self, rhs: u64) -> Self::Output {
        FileAddr {
            elf: self.elf,
            addr: self.addr.wrapping_add(rhs),
        }
    }
}

impl Sub<u64> for FileAddr {
    type Output = Self;
    fn sub(self, rhs: u64) -> Self::Output {
        FileAddr {
            elf: self.elf,
            addr: self.addr.wrapping_sub(rhs),
        }
    }
}

impl AddAssign<u64> for FileAddr {
    fn add_assign(&mut self, rhs: u64) {
        self.addr = self.addr.wrapping_add(rhs);
    }
}

impl std::fmt::Debug for FileAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "FileAddr(null)")
        } else {
            write!(f, "FileAddr({:#018x})", self.addr)
        }
    }
}

/// A byte offset from the start of an ELF image on disk.
#[derive(Clone, Default)]
pub struct FileOffset {
    elf: Weak<Elf>,
    off: u64,
}

impl FileOffset {
    pub fn new(elf: &Rc<Elf>, off: u64) -> Self {
        FileOffset {
            elf: Rc::downgrade(elf),
            off,
        }
    }

    pub(crate) fn from_weak(elf: Weak<Elf>, off: u64) -> Self {
        FileOffset { elf, off }
    }

    pub fn off(&self) -> u64 {
        self.off
    }

    pub fn elf(&self) -> Option<Rc<Elf>> {
        self.elf.upgrade()
    }
}
