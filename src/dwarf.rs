//! The DWARF-4 reader.
//!
//! A random-access decoder for the DWARF32 debug information embedded in the
//! ELF image: `.debug_info`, `.debug_abbrev`, `.debug_str`, and
//! `.debug_ranges`. Parsing is cursor-based over the mapped sections; DIEs,
//! attributes, and range lists are lightweight views carrying byte positions
//! into `.debug_info` rather than pointers. Abbreviation tables and the
//! function index are parsed lazily and cached for the life of the [`Dwarf`].
//!
//! The tag/attribute/form vocabulary comes from [`gimli::constants`]; only
//! DWARF version 4 with 8-byte addresses is accepted.

use std::cell::{OnceCell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use gimli::constants::*;
use gimli::{DwAt, DwForm, DwTag};
use tracing::trace;

use crate::addr::FileAddr;
use crate::elf::Elf;
use crate::errors::{DebuggerError, Result};

/// Size of a DWARF32 v4 compile-unit header: 4-byte length, 2-byte version,
/// 4-byte abbrev offset, 1-byte address size.
const CU_HEADER_SIZE: usize = 11;

/// A cursor over a byte span of DWARF data.
pub(crate) struct Cursor<'data> {
    data: &'data [u8],
    pos: usize,
}

impl<'data> Cursor<'data> {
    pub(crate) fn new(data: &'data [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    pub(crate) fn at(data: &'data [u8], pos: usize) -> Self {
        Cursor { data, pos }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'data [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(DebuggerError::UnexpectedEndOfDwarf)?;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(DebuggerError::UnexpectedEndOfDwarf)?;
        self.pos = end;
        Ok(bytes)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(DebuggerError::UnexpectedEndOfDwarf)?;
        if end > self.data.len() {
            return Err(DebuggerError::UnexpectedEndOfDwarf);
        }
        self.pos = end;
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// A null-terminated string starting at the current position.
    pub(crate) fn string(&mut self) -> Result<&'data str> {
        let tail = self
            .data
            .get(self.pos..)
            .ok_or(DebuggerError::UnexpectedEndOfDwarf)?;
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(DebuggerError::UnexpectedEndOfDwarf)?;
        self.pos += len + 1;
        Ok(std::str::from_utf8(&tail[..len]).unwrap_or(""))
    }

    pub(crate) fn uleb128(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            result |= u64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    pub(crate) fn sleb128(&mut self) -> Result<i64> {
        let mut result = 0u64;
        let mut shift = 0;
        let mut byte;
        loop {
            byte = self.u8()?;
            result |= u64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        // sign-extend when the stop byte's 0x40 bit is set and the shift has
        // not already filled the destination
        if shift < 64 && byte & 0x40 != 0 {
            result |= !0u64 << shift;
        }
        Ok(result as i64)
    }

    /// Steps over one attribute value of the given form.
    pub(crate) fn skip_form(&mut self, form: u64) -> Result<()> {
        if form > u64::from(u16::MAX) {
            return Err(DebuggerError::UnrecognizedForm(form));
        }
        match DwForm(form as u16) {
            // presence is the value; nothing stored
            DW_FORM_flag_present => Ok(()),

            DW_FORM_data1 | DW_FORM_ref1 | DW_FORM_flag => self.skip(1),
            DW_FORM_data2 | DW_FORM_ref2 => self.skip(2),
            DW_FORM_data4 | DW_FORM_ref4 | DW_FORM_ref_addr | DW_FORM_sec_offset
            | DW_FORM_strp => self.skip(4),
            DW_FORM_data8 | DW_FORM_ref8 | DW_FORM_addr => self.skip(8),

            DW_FORM_sdata => self.sleb128().map(drop),
            DW_FORM_udata | DW_FORM_ref_udata => self.uleb128().map(drop),

            // blocks carry their size up front
            DW_FORM_block1 => {
                let n = self.u8()?;
                self.skip(n as usize)
            }
            DW_FORM_block2 => {
                let n = self.u16()?;
                self.skip(n as usize)
            }
            DW_FORM_block4 => {
                let n = self.u32()?;
                self.skip(n as usize)
            }
            DW_FORM_block | DW_FORM_exprloc => {
                let n = self.uleb128()?;
                self.skip(n as usize)
            }

            DW_FORM_string => self.string().map(drop),

            // a uleb128 giving the real form, then a value in that form
            DW_FORM_indirect => {
                let real = self.uleb128()?;
                self.skip_form(real)
            }

            other => Err(DebuggerError::UnrecognizedForm(u64::from(other.0))),
        }
    }
}

/// One `(attribute, form)` pair of an abbreviation declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrSpec {
    pub attr: u64,
    pub form: u64,
}

/// An abbreviation table entry: the shape shared by every DIE that names its
/// code.
#[derive(Debug)]
pub struct Abbrev {
    pub code: u64,
    pub tag: u64,
    pub has_children: bool,
    pub attr_specs: Vec<AttrSpec>,
}

pub(crate) type AbbrevTable = HashMap<u64, Rc<Abbrev>>;

/// Parses the abbreviation table starting at `offset` into `.debug_abbrev`.
/// The table ends at an entry with code zero; each entry's attribute list
/// ends at an `(0, 0)` pair.
fn parse_abbrev_table(section: &[u8], offset: usize) -> Result<AbbrevTable> {
    let mut cursor = Cursor::at(section, offset);
    let mut table = AbbrevTable::new();

    loop {
        let code = cursor.uleb128()?;
        if code == 0 {
            return Ok(table);
        }
        let tag = cursor.uleb128()?;
        let has_children = cursor.u8()? != 0;

        let mut attr_specs = Vec::new();
        loop {
            let attr = cursor.uleb128()?;
            let form = cursor.uleb128()?;
            if attr == 0 {
                break;
            }
            attr_specs.push(AttrSpec { attr, form });
        }

        table.insert(
            code,
            Rc::new(Abbrev {
                code,
                tag,
                has_children,
                attr_specs,
            }),
        );
    }
}

/// One compile unit: a byte range of `.debug_info` starting at the length
/// field, plus the offset of its abbreviation table.
#[derive(Debug)]
pub struct CompileUnit {
    offset: usize,
    len: usize,
    abbrev_offset: usize,
}

impl CompileUnit {
    /// Start of the unit within `.debug_info`.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the unit including the length field itself.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn end(&self) -> usize {
        self.offset + self.len
    }

    fn contains_pos(&self, pos: usize) -> bool {
        self.offset <= pos && pos < self.end()
    }
}

struct IndexEntry {
    cu: usize,
    pos: usize,
}

/// The debug information of one ELF image.
pub struct Dwarf {
    elf: Rc<Elf>,
    compile_units: Vec<CompileUnit>,
    abbrev_tables: RefCell<HashMap<usize, Rc<AbbrevTable>>>,
    function_index: OnceCell<HashMap<String, Vec<IndexEntry>>>,
}

impl Dwarf {
    /// Walks `.debug_info` and records every compile unit. An image without
    /// debug information yields a `Dwarf` with no units.
    pub fn new(elf: Rc<Elf>) -> Result<Self> {
        let compile_units = {
            let debug_info = elf.get_section_contents(".debug_info");
            let mut cursor = Cursor::new(debug_info);
            let mut units = Vec::new();
            while !cursor.is_finished() {
                units.push(Self::parse_compile_unit(&mut cursor)?);
            }
            units
        };
        trace!("parsed {} compile units", compile_units.len());

        Ok(Dwarf {
            elf,
            compile_units,
            abbrev_tables: RefCell::new(HashMap::new()),
            function_index: OnceCell::new(),
        })
    }

    fn parse_compile_unit(cursor: &mut Cursor) -> Result<CompileUnit> {
        let offset = cursor.position();
        let size = cursor.u32()?;
        let version = cursor.u16()?;
        let abbrev_offset = cursor.u32()?;
        let addr_size = cursor.u8()?;

        if size == 0xffff_ffff {
            return Err(DebuggerError::Dwarf64NotSupported);
        }
        if version != 4 {
            return Err(DebuggerError::UnsupportedDwarfVersion(version));
        }
        if addr_size != 8 {
            return Err(DebuggerError::InvalidDwarfAddressSize(addr_size));
        }

        // the unit spans the length field plus `size` bytes
        let len = size as usize + 4;
        cursor.skip(len - CU_HEADER_SIZE)?;
        Ok(CompileUnit {
            offset,
            len,
            abbrev_offset: abbrev_offset as usize,
        })
    }

    pub fn elf(&self) -> &Rc<Elf> {
        &self.elf
    }

    pub fn compile_units(&self) -> &[CompileUnit] {
        &self.compile_units
    }

    fn debug_info(&self) -> &[u8] {
        self.elf.get_section_contents(".debug_info")
    }

    /// The abbreviation table at the given `.debug_abbrev` offset, parsed on
    /// first use and cached.
    pub(crate) fn abbrev_table_at(&self, offset: usize) -> Result<Rc<AbbrevTable>> {
        if let Some(table) = self.abbrev_tables.borrow().get(&offset) {
            return Ok(table.clone());
        }
        let table = Rc::new(parse_abbrev_table(
            self.elf.get_section_contents(".debug_abbrev"),
            offset,
        )?);
        self.abbrev_tables
            .borrow_mut()
            .insert(offset, table.clone());
        Ok(table)
    }

    /// The root DIE of a compile unit.
    pub fn root_die<'dw>(&'dw self, cu: &'dw CompileUnit) -> Result<Die<'dw>> {
        self.parse_die_at(cu, cu.offset + CU_HEADER_SIZE)
    }

    fn parse_die_at<'dw>(&'dw self, cu: &'dw CompileUnit, pos: usize) -> Result<Die<'dw>> {
        let data = &self.debug_info()[..cu.end()];
        let mut cursor = Cursor::at(data, pos);

        let code = cursor.uleb128()?;
        if code == 0 {
            return Ok(Die {
                dwarf: self,
                cu,
                pos,
                abbrev: None,
                attr_locs: Vec::new(),
                next: cursor.position(),
            });
        }

        let table = self.abbrev_table_at(cu.abbrev_offset)?;
        let abbrev = table
            .get(&code)
            .ok_or(DebuggerError::UnknownAbbrevCode(code))?
            .clone();

        let mut attr_locs = Vec::with_capacity(abbrev.attr_specs.len());
        for spec in &abbrev.attr_specs {
            attr_locs.push(cursor.position());
            cursor.skip_form(spec.form)?;
        }

        Ok(Die {
            dwarf: self,
            cu,
            pos,
            abbrev: Some(abbrev),
            attr_locs,
            next: cursor.position(),
        })
    }

    /// The DIE following `die`'s entire subtree.
    fn die_after_subtree<'dw>(&'dw self, die: &Die<'dw>) -> Result<Die<'dw>> {
        if !die.has_children() {
            return self.parse_die_at(die.cu, die.next);
        }
        // a sibling attribute lets us skip the subtree in one hop
        if die.contains(DW_AT_sibling) {
            return die.attr(DW_AT_sibling)?.as_reference();
        }
        // otherwise walk the children until their terminating null DIE; the
        // sibling starts right after it
        let mut child = self.parse_die_at(die.cu, die.next)?;
        while !child.is_null() {
            child = self.die_after_subtree(&child)?;
        }
        self.parse_die_at(die.cu, child.next)
    }

    /// The compile unit whose root DIE covers the given address.
    pub fn compile_unit_containing_address(
        &self,
        address: &FileAddr,
    ) -> Result<Option<&CompileUnit>> {
        for cu in &self.compile_units {
            if self.root_die(cu)?.contains_address(address)? {
                return Ok(Some(cu));
            }
        }
        Ok(None)
    }

    /// The `DW_TAG_subprogram` DIE whose range covers the given address.
    /// Inlined copies are not returned; the address may also belong to code
    /// with no debug information at all.
    pub fn function_containing_address(&self, address: &FileAddr) -> Result<Option<Die<'_>>> {
        let index = self.ensure_index()?;
        for entries in index.values() {
            for entry in entries {
                let cu = &self.compile_units[entry.cu];
                let die = self.parse_die_at(cu, entry.pos)?;
                if die.tag() == Some(DW_TAG_subprogram) && die.contains_address(address)? {
                    return Ok(Some(die));
                }
            }
        }
        Ok(None)
    }

    /// Every function DIE indexed under the given name. Inlined copies of
    /// the same function collide on their shared name and are all returned.
    pub fn find_functions(&self, name: &str) -> Result<Vec<Die<'_>>> {
        let index = self.ensure_index()?;
        let Some(entries) = index.get(name) else {
            return Ok(Vec::new());
        };
        entries
            .iter()
            .map(|entry| self.parse_die_at(&self.compile_units[entry.cu], entry.pos))
            .collect()
    }

    fn ensure_index(&self) -> Result<&HashMap<String, Vec<IndexEntry>>> {
        if let Some(index) = self.function_index.get() {
            return Ok(index);
        }
        let mut index = HashMap::new();
        for (cu_idx, cu) in self.compile_units.iter().enumerate() {
            let root = self.root_die(cu)?;
            self.index_die(&mut index, cu_idx, &root)?;
        }
        trace!("function index built: {} names", index.len());
        Ok(self.function_index.get_or_init(|| index))
    }

    fn index_die(
        &self,
        index: &mut HashMap<String, Vec<IndexEntry>>,
        cu_idx: usize,
        die: &Die<'_>,
    ) -> Result<()> {
        let has_range = die.contains(DW_AT_low_pc) || die.contains(DW_AT_ranges);
        let is_function =
            die.tag() == Some(DW_TAG_subprogram) || die.tag() == Some(DW_TAG_inlined_subroutine);

        if has_range && is_function {
            if let Some(name) = die.name()? {
                index.entry(name.to_string()).or_default().push(IndexEntry {
                    cu: cu_idx,
                    pos: die.pos,
                });
            }
        }

        for child in die.children() {
            self.index_die(index, cu_idx, &child?)?;
        }
        Ok(())
    }
}

/// A Debugging Information Entry: one node of the DWARF tree.
///
/// A null DIE (abbreviation code zero) terminates a sibling list and carries
/// only the position of the byte after it.
#[derive(Clone)]
pub struct Die<'dw> {
    dwarf: &'dw Dwarf,
    cu: &'dw CompileUnit,
    pos: usize,
    abbrev: Option<Rc<Abbrev>>,
    attr_locs: Vec<usize>,
    next: usize,
}

impl<'dw> Die<'dw> {
    pub fn is_null(&self) -> bool {
        self.abbrev.is_none()
    }

    pub fn abbrev(&self) -> Option<&Abbrev> {
        self.abbrev.as_deref()
    }

    pub fn tag(&self) -> Option<DwTag> {
        self.abbrev.as_ref().map(|a| DwTag(a.tag as u16))
    }

    pub fn has_children(&self) -> bool {
        self.abbrev.as_ref().is_some_and(|a| a.has_children)
    }

    pub fn compile_unit(&self) -> &'dw CompileUnit {
        self.cu
    }

    /// Offset of this DIE within `.debug_info`.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Whether the DIE declares an attribute of the given type. A DIE holds
    /// at most one attribute per type.
    pub fn contains(&self, attribute: DwAt) -> bool {
        self.abbrev.as_ref().is_some_and(|a| {
            a.attr_specs
                .iter()
                .any(|spec| spec.attr == u64::from(attribute.0))
        })
    }

    /// The attribute of the given type.
    pub fn attr(&self, attribute: DwAt) -> Result<Attr<'dw>> {
        let abbrev = self
            .abbrev
            .as_ref()
            .ok_or(DebuggerError::AttributeDoesNotExist(attribute))?;
        for (spec, &location) in abbrev.attr_specs.iter().zip(&self.attr_locs) {
            if spec.attr == u64::from(attribute.0) {
                return Ok(Attr {
                    dwarf: self.dwarf,
                    cu: self.cu,
                    attr: spec.attr,
                    form: spec.form,
                    location,
                });
            }
        }
        Err(DebuggerError::AttributeDoesNotExist(attribute))
    }

    /// Iterates the DIE's direct children, ending at the null DIE.
    pub fn children(&self) -> ChildrenIter<'dw> {
        if !self.has_children() {
            return ChildrenIter { current: None };
        }
        let first = self.dwarf.parse_die_at(self.cu, self.next);
        match first {
            Ok(die) if die.is_null() => ChildrenIter { current: None },
            Ok(die) => ChildrenIter {
                current: Some(Ok(die)),
            },
            Err(e) => ChildrenIter {
                current: Some(Err(e)),
            },
        }
    }

    /// The DIE's name, chasing `DW_AT_specification` and
    /// `DW_AT_abstract_origin` references when the DIE carries no name of
    /// its own.
    pub fn name(&self) -> Result<Option<&'dw str>> {
        if self.contains(DW_AT_name) {
            return self.attr(DW_AT_name)?.as_string().map(Some);
        }
        if self.contains(DW_AT_specification) {
            return self.attr(DW_AT_specification)?.as_reference()?.name();
        }
        if self.contains(DW_AT_abstract_origin) {
            return self.attr(DW_AT_abstract_origin)?.as_reference()?.name();
        }
        Ok(None)
    }

    /// The lowest address covered by this DIE.
    pub fn low_pc(&self) -> Result<FileAddr> {
        if self.contains(DW_AT_ranges) {
            let ranges = self.attr(DW_AT_ranges)?.as_range_list()?;
            let first = ranges
                .iter()
                .next()
                .ok_or(DebuggerError::NoPcBounds)??;
            return Ok(first.low);
        }
        if self.contains(DW_AT_low_pc) {
            return self.attr(DW_AT_low_pc)?.as_address();
        }
        Err(DebuggerError::NoPcBounds)
    }

    /// One past the highest address covered by this DIE.
    pub fn high_pc(&self) -> Result<FileAddr> {
        if self.contains(DW_AT_ranges) {
            let ranges = self.attr(DW_AT_ranges)?.as_range_list()?;
            let mut last = None;
            for entry in ranges.iter() {
                last = Some(entry?);
            }
            return last.map(|e| e.high).ok_or(DebuggerError::NoPcBounds);
        }
        if self.contains(DW_AT_high_pc) {
            let attr = self.attr(DW_AT_high_pc)?;
            // the attribute is either an address or an offset from low_pc
            if attr.form() == DW_FORM_addr {
                return attr.as_address();
            }
            return Ok(self.low_pc()? + attr.as_int()?);
        }
        Err(DebuggerError::NoPcBounds)
    }

    /// Whether the given file address lies within this DIE's ranges.
    /// Addresses belonging to a different ELF image are never contained.
    pub fn contains_address(&self, address: &FileAddr) -> Result<bool> {
        if !address.belongs_to(self.dwarf.elf()) {
            return Ok(false);
        }
        if self.contains(DW_AT_ranges) {
            return self.attr(DW_AT_ranges)?.as_range_list()?.contains(address);
        }
        if self.contains(DW_AT_low_pc) {
            return Ok(self.low_pc()? <= *address && *address < self.high_pc()?);
        }
        Ok(false)
    }
}

impl std::fmt::Debug for Die<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Die")
            .field("pos", &self.pos)
            .field("tag", &self.tag())
            .field("next", &self.next)
            .finish()
    }
}

/// Iterator over a DIE's direct children.
pub struct ChildrenIter<'dw> {
    current: Option<Result<Die<'dw>>>,
}

impl<'dw> Iterator for ChildrenIter<'dw> {
    type Item = Result<Die<'dw>>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current.take()?;
        let die = match current {
            Ok(die) => die,
            // yield the error once, then stop
            Err(e) => return Some(Err(e)),
        };

        match die.dwarf.die_after_subtree(&die) {
            Ok(successor) if successor.is_null() => self.current = None,
            Ok(successor) => self.current = Some(Ok(successor)),
            Err(e) => self.current = Some(Err(e)),
        }
        Some(Ok(die))
    }
}

/// A typed view of one DIE attribute.
pub struct Attr<'dw> {
    dwarf: &'dw Dwarf,
    cu: &'dw CompileUnit,
    attr: u64,
    form: u64,
    location: usize,
}

impl<'dw> Attr<'dw> {
    pub fn name(&self) -> DwAt {
        DwAt(self.attr as u16)
    }

    pub fn form(&self) -> DwForm {
        DwForm(self.form as u16)
    }

    fn wrong_form(&self) -> DebuggerError {
        DebuggerError::WrongAttributeForm(self.name())
    }

    fn cursor(&self) -> Cursor<'dw> {
        Cursor::at(&self.dwarf.debug_info()[..self.cu.end()], self.location)
    }

    /// The value as a file address bound to the image the debug information
    /// belongs to. The form must be `DW_FORM_addr`.
    pub fn as_address(&self) -> Result<FileAddr> {
        if self.form() != DW_FORM_addr {
            return Err(self.wrong_form());
        }
        let addr = self.cursor().u64()?;
        Ok(FileAddr::new(self.dwarf.elf(), addr))
    }

    /// The value as a 4-byte offset into some debug section.
    pub fn as_section_offset(&self) -> Result<u32> {
        if self.form() != DW_FORM_sec_offset {
            return Err(self.wrong_form());
        }
        self.cursor().u32()
    }

    /// The value as a sized block of bytes.
    pub fn as_block(&self) -> Result<&'dw [u8]> {
        let mut cursor = self.cursor();
        let size = match self.form() {
            DW_FORM_block1 => cursor.u8()? as usize,
            DW_FORM_block2 => cursor.u16()? as usize,
            DW_FORM_block4 => cursor.u32()? as usize,
            DW_FORM_block | DW_FORM_exprloc => cursor.uleb128()? as usize,
            _ => return Err(self.wrong_form()),
        };
        let start = cursor.position();
        self.dwarf
            .debug_info()
            .get(start..start + size)
            .ok_or(DebuggerError::UnexpectedEndOfDwarf)
    }

    /// The value as an unsigned integer of the declared width.
    pub fn as_int(&self) -> Result<u64> {
        let mut cursor = self.cursor();
        match self.form() {
            DW_FORM_data1 => Ok(u64::from(cursor.u8()?)),
            DW_FORM_data2 => Ok(u64::from(cursor.u16()?)),
            DW_FORM_data4 => Ok(u64::from(cursor.u32()?)),
            DW_FORM_data8 => cursor.u64(),
            DW_FORM_udata => cursor.uleb128(),
            _ => Err(self.wrong_form()),
        }
    }

    /// The value as a string: either inline in the DIE or an offset into
    /// `.debug_str`.
    pub fn as_string(&self) -> Result<&'dw str> {
        let mut cursor = self.cursor();
        match self.form() {
            DW_FORM_string => cursor.string(),
            DW_FORM_strp => {
                let offset = cursor.u32()? as usize;
                let strtab = self.dwarf.elf().get_section_contents(".debug_str");
                Cursor::at(strtab, offset).string()
            }
            _ => Err(self.wrong_form()),
        }
    }

    /// The value as a reference to another DIE.
    pub fn as_reference(&self) -> Result<Die<'dw>> {
        let mut cursor = self.cursor();
        let (pos, cu) = match self.form() {
            // offsets from the start of the owning compile unit
            DW_FORM_ref1 => (self.cu.offset + cursor.u8()? as usize, self.cu),
            DW_FORM_ref2 => (self.cu.offset + cursor.u16()? as usize, self.cu),
            DW_FORM_ref4 => (self.cu.offset + cursor.u32()? as usize, self.cu),
            DW_FORM_ref8 => (self.cu.offset + cursor.u64()? as usize, self.cu),
            DW_FORM_ref_udata => (self.cu.offset + cursor.uleb128()? as usize, self.cu),
            // an offset into .debug_info; the owning unit must be located
            DW_FORM_ref_addr => {
                let pos = cursor.u32()? as usize;
                let cu = self
                    .dwarf
                    .compile_units()
                    .iter()
                    .find(|cu| cu.contains_pos(pos))
                    .ok_or(DebuggerError::UnexpectedEndOfDwarf)?;
                (pos, cu)
            }
            _ => return Err(self.wrong_form()),
        };
        self.dwarf.parse_die_at(cu, pos)
    }

    /// The value as a range list in `.debug_ranges`, anchored at the
    /// compile unit's base address (its root DIE's `DW_AT_low_pc`, if any).
    pub fn as_range_list(&self) -> Result<RangeList<'dw>> {
        let offset = self.as_section_offset()? as usize;
        let root = self.dwarf.root_die(self.cu)?;
        let base_address = if root.contains(DW_AT_low_pc) {
            root.attr(DW_AT_low_pc)?.as_address()?
        } else {
            FileAddr::default()
        };
        Ok(RangeList {
            dwarf: self.dwarf,
            offset,
            base_address,
        })
    }
}

/// A non-contiguous set of address ranges from `.debug_ranges`.
pub struct RangeList<'dw> {
    dwarf: &'dw Dwarf,
    offset: usize,
    base_address: FileAddr,
}

/// One `[low, high)` entry of a range list.
#[derive(Debug, Clone)]
pub struct RangeEntry {
    pub low: FileAddr,
    pub high: FileAddr,
}

impl RangeEntry {
    pub fn contains(&self, address: &FileAddr) -> bool {
        self.low <= *address && *address < self.high
    }
}

impl<'dw> RangeList<'dw> {
    pub fn iter(&self) -> RangeIter<'dw> {
        RangeIter {
            dwarf: self.dwarf,
            pos: Some(self.offset),
            base: self.base_address.addr(),
        }
    }

    pub fn contains(&self, address: &FileAddr) -> Result<bool> {
        for entry in self.iter() {
            if entry?.contains(address) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Iterator over range list entries. Base-address entries update the base
/// and produce nothing; `(0, 0)` terminates the list.
pub struct RangeIter<'dw> {
    dwarf: &'dw Dwarf,
    pos: Option<usize>,
    base: u64,
}

impl<'dw> Iterator for RangeIter<'dw> {
    type Item = Result<RangeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let pos = self.pos?;
        let data = self.dwarf.elf().get_section_contents(".debug_ranges");
        let mut cursor = Cursor::at(data, pos);

        loop {
            let low = match cursor.u64() {
                Ok(v) => v,
                Err(e) => {
                    self.pos = None;
                    return Some(Err(e));
                }
            };
            let high = match cursor.u64() {
                Ok(v) => v,
                Err(e) => {
                    self.pos = None;
                    return Some(Err(e));
                }
            };

            if low == u64::MAX {
                // base address selector
                self.base = high;
            } else if low == 0 && high == 0 {
                self.pos = None;
                return None;
            } else {
                self.pos = Some(cursor.position());
                let elf = self.dwarf.elf();
                return Some(Ok(RangeEntry {
                    low: FileAddr::new(elf, self.base + low),
                    high: FileAddr::new(elf, self.base + high),
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::test_image::*;

    #[test]
    fn cursor_fixed_ints_and_strings() {
        let data = [0x01, 0x02, 0x03, 0x04, b'h', b'i', 0x00, 0xff];
        let mut cursor = Cursor::new(&data);
        assert_eq!(cursor.u8().unwrap(), 1);
        assert_eq!(cursor.u16().unwrap(), 0x0302);
        assert_eq!(cursor.u8().unwrap(), 4);
        assert_eq!(cursor.string().unwrap(), "hi");
        assert_eq!(cursor.u8().unwrap(), 0xff);
        assert!(cursor.is_finished());
        assert!(cursor.u8().is_err());
    }

    #[test]
    fn cursor_uleb128() {
        let mut cursor = Cursor::new(&[0xe5, 0x8e, 0x26]);
        assert_eq!(cursor.uleb128().unwrap(), 624485);
        let mut cursor = Cursor::new(&[0x7f]);
        assert_eq!(cursor.uleb128().unwrap(), 127);
        let mut cursor = Cursor::new(&[0x80, 0x01]);
        assert_eq!(cursor.uleb128().unwrap(), 128);
    }

    #[test]
    fn cursor_sleb128_sign_extends() {
        let mut cursor = Cursor::new(&[0xc0, 0xbb, 0x78]);
        assert_eq!(cursor.sleb128().unwrap(), -123456);
        let mut cursor = Cursor::new(&[0x7f]);
        assert_eq!(cursor.sleb128().unwrap(), -1);
        let mut cursor = Cursor::new(&[0x3f]);
        assert_eq!(cursor.sleb128().unwrap(), 63);
    }

    #[test]
    fn skip_form_covers_variable_and_indirect_forms() {
        // block2 of length 3
        let data = [0x03, 0x00, 0xaa, 0xbb, 0xcc, 0x42];
        let mut cursor = Cursor::new(&data);
        cursor.skip_form(u64::from(DW_FORM_block2.0)).unwrap();
        assert_eq!(cursor.u8().unwrap(), 0x42);

        // indirect: uleb form code (data2), then the two data bytes
        let data = [DW_FORM_data2.0 as u8, 0x11, 0x22, 0x99];
        let mut cursor = Cursor::new(&data);
        cursor.skip_form(u64::from(DW_FORM_indirect.0)).unwrap();
        assert_eq!(cursor.u8().unwrap(), 0x99);

        let mut cursor = Cursor::new(&[0x00]);
        assert!(cursor.skip_form(0xdead).is_err());
    }

    #[test]
    fn abbrev_table_parses_until_zero_code() {
        let mut bytes = Vec::new();
        // code 1, tag compile_unit, has children, one (low_pc, addr) spec
        bytes.extend_from_slice(&[0x01, 0x11, 0x01, 0x11, 0x01, 0x00, 0x00]);
        // code 2, tag subprogram, no children, (name, string)
        bytes.extend_from_slice(&[0x02, 0x2e, 0x00, 0x03, 0x08, 0x00, 0x00]);
        bytes.push(0x00);

        let table = parse_abbrev_table(&bytes, 0).unwrap();
        assert_eq!(table.len(), 2);
        let cu = &table[&1];
        assert_eq!(cu.tag, 0x11);
        assert!(cu.has_children);
        assert_eq!(cu.attr_specs.len(), 1);
        let func = &table[&2];
        assert!(!func.has_children);
        assert_eq!(
            func.attr_specs[0],
            AttrSpec {
                attr: u64::from(DW_AT_name.0),
                form: u64::from(DW_FORM_string.0)
            }
        );
    }

    // assembles an image with one compile unit:
    //   root (low_pc 0x1000)
    //     alpha: subprogram, inline name, [0x1000, 0x1020)
    //     beta:  subprogram, strp name, ranges at 0 (explicit base 0x2000)
    //     gamma: subprogram, strp name, ranges at 48 (inherits root base)
    fn dwarf_image() -> Vec<u8> {
        let mut abbrev = Vec::new();
        // 1: compile_unit, children, low_pc/addr
        abbrev.extend_from_slice(&[0x01, 0x11, 0x01, 0x11, 0x01, 0x00, 0x00]);
        // 2: subprogram, no children, name/string low_pc/addr high_pc/data8
        abbrev.extend_from_slice(&[
            0x02, 0x2e, 0x00, 0x03, 0x08, 0x11, 0x01, 0x12, 0x07, 0x00, 0x00,
        ]);
        // 3: subprogram, no children, name/strp ranges/sec_offset
        abbrev.extend_from_slice(&[0x03, 0x2e, 0x00, 0x03, 0x0e, 0x55, 0x17, 0x00, 0x00]);
        abbrev.push(0x00);

        let mut info_body = Vec::new();
        // root DIE
        info_body.push(0x01);
        info_body.extend_from_slice(&0x1000u64.to_le_bytes());
        // alpha
        info_body.push(0x02);
        info_body.extend_from_slice(b"alpha\0");
        info_body.extend_from_slice(&0x1000u64.to_le_bytes());
        info_body.extend_from_slice(&0x20u64.to_le_bytes());
        // beta
        info_body.push(0x03);
        info_body.extend_from_slice(&0u32.to_le_bytes());
        info_body.extend_from_slice(&0u32.to_le_bytes());
        // gamma
        info_body.push(0x03);
        info_body.extend_from_slice(&5u32.to_le_bytes());
        info_body.extend_from_slice(&48u32.to_le_bytes());
        // null DIE terminating the root's children
        info_body.push(0x00);

        let mut info = Vec::new();
        info.extend_from_slice(&((info_body.len() + 7) as u32).to_le_bytes());
        info.extend_from_slice(&4u16.to_le_bytes());
        info.extend_from_slice(&0u32.to_le_bytes());
        info.push(8);
        info.extend_from_slice(&info_body);

        let mut ranges = Vec::new();
        // list 0: explicit base 0x2000, then [0x10, 0x20)
        ranges.extend_from_slice(&u64::MAX.to_le_bytes());
        ranges.extend_from_slice(&0x2000u64.to_le_bytes());
        ranges.extend_from_slice(&0x10u64.to_le_bytes());
        ranges.extend_from_slice(&0x20u64.to_le_bytes());
        ranges.extend_from_slice(&[0u8; 16]);
        // list 48: [0x10, 0x18) against the root low_pc base
        ranges.extend_from_slice(&0x10u64.to_le_bytes());
        ranges.extend_from_slice(&0x18u64.to_le_bytes());
        ranges.extend_from_slice(&[0u8; 16]);

        ImageBuilder {
            entry: 0x1000,
            sections: vec![
                SectionSpec {
                    name: ".text",
                    sh_type: 1,
                    addr: 0x1000,
                    data: vec![0x90; 0x1100],
                    link: 0,
                    entsize: 0,
                },
                SectionSpec {
                    name: ".debug_abbrev",
                    sh_type: 1,
                    addr: 0,
                    data: abbrev,
                    link: 0,
                    entsize: 0,
                },
                SectionSpec {
                    name: ".debug_info",
                    sh_type: 1,
                    addr: 0,
                    data: info,
                    link: 0,
                    entsize: 0,
                },
                SectionSpec {
                    name: ".debug_str",
                    sh_type: 1,
                    addr: 0,
                    data: b"beta\0gamma\0".to_vec(),
                    link: 0,
                    entsize: 0,
                },
                SectionSpec {
                    name: ".debug_ranges",
                    sh_type: 1,
                    addr: 0,
                    data: ranges,
                    link: 0,
                    entsize: 0,
                },
            ],
        }
        .build()
    }

    fn open_dwarf() -> (std::rc::Rc<Elf>, Dwarf) {
        let path = write_image("dwarf", &dwarf_image());
        let elf = Elf::open(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        let dwarf = Dwarf::new(elf.clone()).unwrap();
        (elf, dwarf)
    }

    #[test]
    fn parses_compile_units() {
        let (_elf, dwarf) = open_dwarf();
        assert_eq!(dwarf.compile_units().len(), 1);
    }

    #[test]
    fn root_die_and_children() {
        let (_elf, dwarf) = open_dwarf();
        let cu = &dwarf.compile_units()[0];
        let root = dwarf.root_die(cu).unwrap();
        assert_eq!(root.tag(), Some(DW_TAG_compile_unit));
        assert!(root.contains(DW_AT_low_pc));
        // attr_locations match the abbrev's attr_specs
        assert_eq!(root.attr_locs.len(), root.abbrev().unwrap().attr_specs.len());

        let names: Vec<_> = root
            .children()
            .map(|c| c.unwrap().name().unwrap().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn low_and_high_pc_from_attrs() {
        let (_elf, dwarf) = open_dwarf();
        let alpha = &dwarf.find_functions("alpha").unwrap()[0];
        assert_eq!(alpha.low_pc().unwrap().addr(), 0x1000);
        assert_eq!(alpha.high_pc().unwrap().addr(), 0x1020);
    }

    #[test]
    fn range_list_with_explicit_base() {
        let (elf, dwarf) = open_dwarf();
        let beta = &dwarf.find_functions("beta").unwrap()[0];
        assert_eq!(beta.low_pc().unwrap().addr(), 0x2010);
        assert_eq!(beta.high_pc().unwrap().addr(), 0x2020);
        assert!(beta
            .contains_address(&FileAddr::new(&elf, 0x2010))
            .unwrap());
        assert!(!beta
            .contains_address(&FileAddr::new(&elf, 0x2020))
            .unwrap());
    }

    #[test]
    fn range_list_inherits_root_base() {
        let (elf, dwarf) = open_dwarf();
        let gamma = &dwarf.find_functions("gamma").unwrap()[0];
        assert_eq!(gamma.low_pc().unwrap().addr(), 0x1010);
        assert_eq!(gamma.high_pc().unwrap().addr(), 0x1018);
        assert!(gamma
            .contains_address(&FileAddr::new(&elf, 0x1012))
            .unwrap());
    }

    #[test]
    fn function_and_compile_unit_queries() {
        let (elf, dwarf) = open_dwarf();
        let addr = FileAddr::new(&elf, 0x1008);
        let found = dwarf.function_containing_address(&addr).unwrap().unwrap();
        assert_eq!(found.name().unwrap(), Some("alpha"));

        assert!(dwarf
            .compile_unit_containing_address(&addr)
            .unwrap()
            .is_some());

        // addresses from a foreign image match nothing
        let other_path = write_image("dwarf2", &dwarf_image());
        let other = Elf::open(&other_path).unwrap();
        let _ = std::fs::remove_file(&other_path);
        let foreign = FileAddr::new(&other, 0x1008);
        assert!(dwarf
            .function_containing_address(&foreign)
            .unwrap()
            .is_none());
    }

    #[test]
    fn rejects_unsupported_dwarf_shapes() {
        let mut info = Vec::new();
        info.extend_from_slice(&7u32.to_le_bytes());
        info.extend_from_slice(&5u16.to_le_bytes()); // version 5
        info.extend_from_slice(&0u32.to_le_bytes());
        info.push(8);

        let image = ImageBuilder {
            entry: 0,
            sections: vec![SectionSpec {
                name: ".debug_info",
                sh_type: 1,
                addr: 0,
                data: info,
                link: 0,
                entsize: 0,
            }],
        }
        .build();
        let path = write_image("dwarf-v5", &image);
        let elf = Elf::open(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert!(matches!(
            Dwarf::new(elf),
            Err(DebuggerError::UnsupportedDwarfVersion(5))
        ));
    }

    #[test]
    fn image_without_debug_info_has_no_units() {
        let path = write_image("no-dwarf", &sample_image());
        let elf = Elf::open(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        let dwarf = Dwarf::new(elf).unwrap();
        assert!(dwarf.compile_units().is_empty());
        assert!(dwarf.find_functions("anything").unwrap().is_empty());
    }
}
