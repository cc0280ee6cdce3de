//! The ELF-64 loader.
//!
//! An [`Elf`] memory-maps an image from disk, copies the header, section
//! header table, and symbol table out of the mapping, and builds three
//! indices: section name to header, symbol name to symbol (keyed under both
//! the mangled and, where demangling succeeds, the demangled name), and an
//! ordered `[st_value, st_value + st_size)` range map for
//! containing-address queries.
//!
//! The image is immutable after construction except for the load bias, which
//! the target sets once the inferior is observed running; the bias is what
//! translates between [`FileAddr`] and [`VirtAddr`].

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::mem::{self, MaybeUninit};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use memmap2::Mmap;
use object::elf::{FileHeader64, SectionHeader64, Sym64, ELFMAG, STT_TLS};
use object::pod::Pod;
use object::LittleEndian;
use tracing::debug;

use crate::addr::{FileAddr, FileOffset, VirtAddr};
use crate::errors::{DebuggerError, Result};

type Le = LittleEndian;
const LE: Le = LittleEndian;

/// Copies a plain-old-data value out of a byte buffer, without alignment
/// requirements on the source.
fn from_bytes<T: Pod>(data: &[u8], offset: usize) -> Result<T> {
    let size = mem::size_of::<T>();
    let bytes = data
        .get(offset..offset + size)
        .ok_or(DebuggerError::TruncatedElf)?;
    let mut value = MaybeUninit::<T>::uninit();
    // Pod types permit any bit pattern
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), value.as_mut_ptr().cast::<u8>(), size);
        Ok(value.assume_init())
    }
}

fn c_str_at(data: &[u8], offset: usize) -> &str {
    let Some(tail) = data.get(offset..) else {
        return "";
    };
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    std::str::from_utf8(&tail[..end]).unwrap_or("")
}

pub struct Elf {
    weak_self: Weak<Elf>,
    path: PathBuf,
    map: Mmap,
    header: FileHeader64<Le>,
    section_headers: Vec<SectionHeader64<Le>>,
    symbol_table: Vec<Sym64<Le>>,
    load_bias: Cell<VirtAddr>,
    section_map: HashMap<String, usize>,
    symbol_name_map: HashMap<String, Vec<usize>>,
    symbol_addr_map: BTreeMap<(u64, u64), usize>,
}

impl Elf {
    /// Maps and parses the image at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Rc<Elf>> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // the mapping stays read-only and private for the life of the Elf
        let map = unsafe { Mmap::map(&file) }?;

        let header: FileHeader64<Le> = from_bytes(&map, 0)?;
        if header.e_ident.magic != ELFMAG || header.e_ident.class != 2 {
            return Err(DebuggerError::NotElf(path.display().to_string()));
        }

        let section_headers = Self::parse_section_headers(&map, &header)?;
        let section_map = Self::build_section_map(&map, &header, &section_headers);
        let symbol_table = Self::parse_symbol_table(&map, &section_headers, &section_map)?;

        debug!(
            "loaded {}: {} sections, {} symbols",
            path.display(),
            section_headers.len(),
            symbol_table.len()
        );

        let mut elf = Elf {
            weak_self: Weak::new(),
            path,
            map,
            header,
            section_headers,
            symbol_table,
            load_bias: Cell::new(VirtAddr::default()),
            section_map,
            symbol_name_map: HashMap::new(),
            symbol_addr_map: BTreeMap::new(),
        };
        elf.build_symbol_maps();

        Ok(Rc::new_cyclic(|weak| {
            elf.weak_self = weak.clone();
            elf
        }))
    }

    fn parse_section_headers(
        map: &Mmap,
        header: &FileHeader64<Le>,
    ) -> Result<Vec<SectionHeader64<Le>>> {
        let shoff = header.e_shoff.get(LE) as usize;
        if shoff == 0 {
            return Ok(Vec::new());
        }

        // files with 0xff00 sections or more store the real count in the
        // sh_size of section zero and set e_shnum to zero
        let mut count = header.e_shnum.get(LE) as u64;
        if count == 0 && header.e_shentsize.get(LE) != 0 {
            let first: SectionHeader64<Le> = from_bytes(map, shoff)?;
            count = first.sh_size.get(LE);
        }

        let entry_size = mem::size_of::<SectionHeader64<Le>>();
        (0..count as usize)
            .map(|i| from_bytes(map, shoff + i * entry_size))
            .collect()
    }

    fn build_section_map(
        map: &Mmap,
        header: &FileHeader64<Le>,
        sections: &[SectionHeader64<Le>],
    ) -> HashMap<String, usize> {
        let mut section_map = HashMap::new();
        for (index, section) in sections.iter().enumerate() {
            let name = Self::section_name_impl(map, header, sections, section.sh_name.get(LE));
            section_map.insert(name.to_string(), index);
        }
        section_map
    }

    fn section_name_impl<'a>(
        map: &'a Mmap,
        header: &FileHeader64<Le>,
        sections: &[SectionHeader64<Le>],
        index: u32,
    ) -> &'a str {
        let strndx = header.e_shstrndx.get(LE) as usize;
        let Some(strtab) = sections.get(strndx) else {
            return "";
        };
        c_str_at(map, strtab.sh_offset.get(LE) as usize + index as usize)
    }

    fn parse_symbol_table(
        map: &Mmap,
        sections: &[SectionHeader64<Le>],
        section_map: &HashMap<String, usize>,
    ) -> Result<Vec<Sym64<Le>>> {
        let symtab = section_map
            .get(".symtab")
            .or_else(|| section_map.get(".dynsym"))
            .map(|&i| &sections[i]);
        let Some(symtab) = symtab else {
            return Ok(Vec::new());
        };

        let entry_size = symtab.sh_entsize.get(LE) as usize;
        if entry_size == 0 {
            return Ok(Vec::new());
        }
        let count = symtab.sh_size.get(LE) as usize / entry_size;
        let offset = symtab.sh_offset.get(LE) as usize;
        (0..count)
            .map(|i| from_bytes(map, offset + i * entry_size))
            .collect()
    }

    fn build_symbol_maps(&mut self) {
        let Some(strtab_offset) = self.string_table_offset() else {
            return;
        };
        for (index, symbol) in self.symbol_table.iter().enumerate() {
            let mangled = c_str_at(&self.map, strtab_offset + symbol.st_name.get(LE) as usize);

            if let Ok(demangled) = cpp_demangle::Symbol::new(mangled) {
                if let Ok(demangled) = demangled.demangle(&Default::default()) {
                    self.symbol_name_map
                        .entry(demangled)
                        .or_default()
                        .push(index);
                }
            } else if let Ok(demangled) = rustc_demangle::try_demangle(mangled) {
                self.symbol_name_map
                    .entry(demangled.to_string())
                    .or_default()
                    .push(index);
            }

            self.symbol_name_map
                .entry(mangled.to_string())
                .or_default()
                .push(index);

            let value = symbol.st_value.get(LE);
            if value != 0 && symbol.st_name.get(LE) != 0 && symbol.st_info & 0xf != STT_TLS {
                let range = (value, value + symbol.st_size.get(LE));
                self.symbol_addr_map.insert(range, index);
            }
        }
    }

    fn string_table_offset(&self) -> Option<usize> {
        self.section_map
            .get(".strtab")
            .or_else(|| self.section_map.get(".dynstr"))
            .map(|&i| self.section_headers[i].sh_offset.get(LE) as usize)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader64<Le> {
        &self.header
    }

    /// The file address of the image's entry point.
    pub fn entry_point(&self) -> u64 {
        self.header.e_entry.get(LE)
    }

    /// Records where the image got loaded. Called once by the target after
    /// the inferior is observed running.
    pub fn notify_loaded(&self, address: VirtAddr) {
        self.load_bias.set(address);
    }

    pub fn load_bias(&self) -> VirtAddr {
        self.load_bias.get()
    }

    /// A string from `.strtab` (or `.dynstr` if absent) at the given offset.
    pub fn get_string(&self, index: usize) -> &str {
        let Some(offset) = self.string_table_offset() else {
            return "";
        };
        c_str_at(&self.map, offset + index)
    }

    /// The name a symbol table entry carries.
    pub fn symbol_name(&self, symbol: &Sym64<Le>) -> &str {
        self.get_string(symbol.st_name.get(LE) as usize)
    }

    pub fn get_section_name(&self, index: usize) -> &str {
        Self::section_name_impl(&self.map, &self.header, &self.section_headers, index as u32)
    }

    pub fn get_section(&self, name: &str) -> Option<&SectionHeader64<Le>> {
        self.section_map.get(name).map(|&i| &self.section_headers[i])
    }

    /// The bytes of a named section, or an empty span if the section does
    /// not exist.
    pub fn get_section_contents(&self, name: &str) -> &[u8] {
        let Some(section) = self.get_section(name) else {
            return &[];
        };
        let offset = section.sh_offset.get(LE) as usize;
        let size = section.sh_size.get(LE) as usize;
        self.map.get(offset..offset + size).unwrap_or(&[])
    }

    pub fn get_section_start_address(&self, name: &str) -> Option<FileAddr> {
        self.get_section(name)
            .map(|s| FileAddr::from_weak(self.weak_self.clone(), s.sh_addr.get(LE)))
    }

    /// A [`FileOffset`] into this image.
    pub fn file_offset(&self, off: u64) -> FileOffset {
        FileOffset::from_weak(self.weak_self.clone(), off)
    }

    pub fn section_containing_file_addr(&self, addr: &FileAddr) -> Option<&SectionHeader64<Le>> {
        if !addr.elf_ptr_eq(&self.weak_self) {
            return None;
        }
        self.section_headers.iter().find(|s| {
            let start = s.sh_addr.get(LE);
            start <= addr.addr() && addr.addr() < start + s.sh_size.get(LE)
        })
    }

    pub fn section_containing_virt_addr(&self, addr: VirtAddr) -> Option<&SectionHeader64<Le>> {
        let bias = self.load_bias.get().addr();
        self.section_headers.iter().find(|s| {
            let start = s.sh_addr.get(LE).wrapping_add(bias);
            start <= addr.addr() && addr.addr() < start + s.sh_size.get(LE)
        })
    }

    /// All symbol table entries carrying the given (mangled or demangled)
    /// name.
    pub fn get_symbols_by_name(&self, name: &str) -> Vec<&Sym64<Le>> {
        self.symbol_name_map
            .get(name)
            .map(|indices| indices.iter().map(|&i| &self.symbol_table[i]).collect())
            .unwrap_or_default()
    }

    /// The symbol whose value is exactly the given file address.
    pub fn get_symbol_at_file_addr(&self, addr: &FileAddr) -> Option<&Sym64<Le>> {
        if !addr.elf_ptr_eq(&self.weak_self) {
            return None;
        }
        self.symbol_addr_map
            .range((addr.addr(), 0)..=(addr.addr(), u64::MAX))
            .next()
            .map(|(_, &i)| &self.symbol_table[i])
    }

    pub fn get_symbol_at_virt_addr(&self, addr: VirtAddr) -> Option<&Sym64<Le>> {
        let rc = self.weak_self.upgrade()?;
        self.get_symbol_at_file_addr(&addr.to_file_addr(&rc))
    }

    /// The symbol whose `[st_value, st_value + st_size)` range contains the
    /// given file address.
    pub fn get_symbol_containing_file_addr(&self, addr: &FileAddr) -> Option<&Sym64<Le>> {
        if !addr.elf_ptr_eq(&self.weak_self) || self.symbol_addr_map.is_empty() {
            return None;
        }
        let a = addr.addr();
        if let Some(((low, _), &i)) = self.symbol_addr_map.range((a, 0)..).next() {
            if *low == a {
                return Some(&self.symbol_table[i]);
            }
        }
        // back up one range and test containment
        let ((low, high), &i) = self.symbol_addr_map.range(..(a, 0)).next_back()?;
        (*low < a && a < *high).then(|| &self.symbol_table[i])
    }

    pub fn get_symbol_containing_virt_addr(&self, addr: VirtAddr) -> Option<&Sym64<Le>> {
        let rc = self.weak_self.upgrade()?;
        self.get_symbol_containing_file_addr(&addr.to_file_addr(&rc))
    }
}

impl std::fmt::Debug for Elf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Elf")
            .field("path", &self.path)
            .field("sections", &self.section_headers.len())
            .field("symbols", &self.symbol_table.len())
            .field("load_bias", &self.load_bias.get())
            .finish()
    }
}

/// Builds small ELF images byte by byte for tests.
#[cfg(test)]
pub(crate) mod test_image {
    use super::*;

    pub(crate) struct SectionSpec {
        pub name: &'static str,
        pub sh_type: u32,
        pub addr: u64,
        pub data: Vec<u8>,
        pub link: u32,
        pub entsize: u64,
    }

    pub(crate) struct ImageBuilder {
        pub entry: u64,
        pub sections: Vec<SectionSpec>,
    }

    pub(crate) fn symbol(name_offset: u32, info: u8, value: u64, size: u64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&name_offset.to_le_bytes());
        out.push(info);
        out.push(0); // st_other
        out.extend_from_slice(&1u16.to_le_bytes()); // st_shndx
        out.extend_from_slice(&value.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out
    }

    /// A string table from a list of names; returns (bytes, offsets).
    pub(crate) fn string_table(names: &[&str]) -> (Vec<u8>, Vec<u32>) {
        let mut bytes = vec![0u8];
        let mut offsets = Vec::new();
        for name in names {
            offsets.push(bytes.len() as u32);
            bytes.extend_from_slice(name.as_bytes());
            bytes.push(0);
        }
        (bytes, offsets)
    }

    impl ImageBuilder {
        pub(crate) fn build(mut self) -> Vec<u8> {
            const EHDR_SIZE: usize = 64;
            const SHDR_SIZE: usize = 64;

            // assemble .shstrtab from the section names
            let mut shstrtab = vec![0u8];
            let mut name_offsets = vec![0u32]; // null section
            for s in &self.sections {
                name_offsets.push(shstrtab.len() as u32);
                shstrtab.extend_from_slice(s.name.as_bytes());
                shstrtab.push(0);
            }
            let shstrtab_name = shstrtab.len() as u32;
            shstrtab.extend_from_slice(b".shstrtab\0");
            self.sections.push(SectionSpec {
                name: ".shstrtab",
                sh_type: 3,
                addr: 0,
                data: shstrtab,
                link: 0,
                entsize: 0,
            });
            name_offsets.push(shstrtab_name);

            // lay the section data out after the header
            let mut offsets = Vec::new();
            let mut pos = EHDR_SIZE;
            for s in &self.sections {
                pos = (pos + 7) & !7;
                offsets.push(pos);
                pos += s.data.len();
            }
            let shoff = (pos + 7) & !7;
            let shnum = self.sections.len() + 1;

            let mut out = Vec::new();
            out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
            out.extend_from_slice(&[0u8; 8]);
            out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
            out.extend_from_slice(&0x3eu16.to_le_bytes()); // EM_X86_64
            out.extend_from_slice(&1u32.to_le_bytes());
            out.extend_from_slice(&self.entry.to_le_bytes());
            out.extend_from_slice(&0u64.to_le_bytes()); // e_phoff
            out.extend_from_slice(&(shoff as u64).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
            out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes()); // e_phentsize
            out.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
            out.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
            out.extend_from_slice(&(shnum as u16).to_le_bytes());
            out.extend_from_slice(&((shnum - 1) as u16).to_le_bytes()); // e_shstrndx

            for (s, &off) in self.sections.iter().zip(&offsets) {
                while out.len() < off {
                    out.push(0);
                }
                out.extend_from_slice(&s.data);
            }
            while out.len() < shoff {
                out.push(0);
            }

            // null section header
            out.extend_from_slice(&[0u8; SHDR_SIZE]);
            for (i, (s, &off)) in self.sections.iter().zip(&offsets).enumerate() {
                out.extend_from_slice(&name_offsets[i + 1].to_le_bytes());
                out.extend_from_slice(&s.sh_type.to_le_bytes());
                out.extend_from_slice(&0u64.to_le_bytes()); // sh_flags
                out.extend_from_slice(&s.addr.to_le_bytes());
                out.extend_from_slice(&(off as u64).to_le_bytes());
                out.extend_from_slice(&(s.data.len() as u64).to_le_bytes());
                out.extend_from_slice(&s.link.to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes()); // sh_info
                out.extend_from_slice(&0u64.to_le_bytes()); // sh_addralign
                out.extend_from_slice(&s.entsize.to_le_bytes());
            }
            out
        }
    }

    pub(crate) fn write_image(tag: &str, bytes: &[u8]) -> PathBuf {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "galena-test-{}-{}-{}.elf",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    /// An image with a .text section at 0x1000 and three symbols: `main`,
    /// the mangled C++ name `_Z3foov`, and `bar` nested inside `main`'s
    /// range.
    pub(crate) fn sample_image() -> Vec<u8> {
        let (strtab, offs) = string_table(&["main", "_Z3foov", "bar"]);
        let mut symtab = symbol(0, 0, 0, 0); // null symbol
        symtab.extend_from_slice(&symbol(offs[0], 0x12, 0x1000, 0x40));
        symtab.extend_from_slice(&symbol(offs[1], 0x12, 0x1040, 0x10));
        symtab.extend_from_slice(&symbol(offs[2], 0x12, 0x1010, 0x8));

        ImageBuilder {
            entry: 0x1000,
            sections: vec![
                SectionSpec {
                    name: ".text",
                    sh_type: 1,
                    addr: 0x1000,
                    data: vec![0x90; 0x100],
                    link: 0,
                    entsize: 0,
                },
                SectionSpec {
                    name: ".symtab",
                    sh_type: 2,
                    addr: 0,
                    data: symtab,
                    link: 3,
                    entsize: 24,
                },
                SectionSpec {
                    name: ".strtab",
                    sh_type: 3,
                    addr: 0,
                    data: strtab,
                    link: 0,
                    entsize: 0,
                },
            ],
        }
        .build()
    }
}
