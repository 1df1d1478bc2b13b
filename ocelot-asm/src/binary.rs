//! The consumer contract towards the binary file loader.
//!
//! Object-format parsing is not this crate's business: an external loader
//! abstracts ELF, COFF or Mach-O into a [`BinaryImage`] made of sections,
//! labels, relocations and external library names. The engine never
//! touches raw file offsets. Tests build images in memory through the
//! same interface.
//!
//! [`BinaryImage`]: struct.BinaryImage.html

use crate::arch::ArchCode;
use crate::operand::Pointer;
use crate::{DataId, InsnId, LabelId, SectionId};

/// Whether a section holds code or data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionKind {
    /// The section holds machine code.
    Code,
    /// The section holds data.
    Data,
}

/// Attribute bits of a section.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SectionAttrs(u16);

impl SectionAttrs {
    /// The section holds standard program code.
    pub const STD_CODE: SectionAttrs = SectionAttrs(1 << 0);
    /// The section holds external function stubs.
    pub const EXT_FCT_STUBS: SectionAttrs = SectionAttrs(1 << 1);
    /// The section was produced by a patching session.
    pub const PATCHED: SectionAttrs = SectionAttrs(1 << 2);

    /// The empty attribute set.
    pub const NONE: SectionAttrs = SectionAttrs(0);

    /// Adds `other` to the set.
    pub fn with(self, other: SectionAttrs) -> Self {
        SectionAttrs(self.0 | other.0)
    }

    /// Whether `other` is part of the set.
    pub fn has(&self, other: SectionAttrs) -> bool {
        self.0 & other.0 != 0
    }
}

/// One section of a binary image.
#[derive(Clone, Debug)]
pub struct Section {
    /// The section name.
    pub name: String,
    /// Whether the section holds code or data.
    pub kind: SectionKind,
    /// Attribute bits.
    pub attrs: SectionAttrs,
    /// The address the section is mapped at.
    pub addr: u64,
    /// The section contents.
    pub bytes: Vec<u8>,
}

impl Section {
    /// The size of the section in bytes.
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Whether `addr` falls inside the section.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.addr + self.size()
    }
}

/// The kinds of label a binary image may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelKind {
    /// The label names a function entry point.
    Function,
    /// The label names a variable.
    Variable,
    /// The label explicitly does not name a function.
    NoFunction,
    /// A placeholder label created by the engine.
    Dummy,
    /// The label names an external function.
    ExtFunction,
    /// The label names a patched section.
    PatchScn,
    /// Any other label.
    Generic,
}

/// What a label points at once analysis has run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelTarget {
    /// The label points at an instruction.
    Insn(InsnId),
    /// The label points at a data entry.
    Data(DataId),
}

/// A named address of the binary.
#[derive(Clone, Debug)]
pub struct Label {
    /// The label name.
    pub name: String,
    /// The labelled address.
    pub addr: u64,
    /// The kind of object the label names.
    pub kind: LabelKind,
    /// The section owning the address, if known.
    pub section: Option<SectionId>,
    /// The object the label resolves to, filled during analysis.
    pub target: Option<LabelTarget>,
}

impl Label {
    /// Builds an unresolved label.
    pub fn new(name: impl Into<String>, addr: u64, kind: LabelKind) -> Self {
        Label {
            name: name.into(),
            addr,
            kind,
            section: None,
            target: None,
        }
    }

    /// Whether the label participates in the function sweep of the
    /// disassembler.
    pub fn is_function(&self) -> bool {
        matches!(self.kind, LabelKind::Function)
    }
}

/// A variable-sized chunk inside a non-code section.
#[derive(Clone, Debug)]
pub struct DataEntry {
    /// The address of the entry.
    pub addr: u64,
    /// The size of the entry in bytes. Entries created on demand for
    /// variable labels start with size zero.
    pub size: u64,
    /// The owning section, if known.
    pub section: Option<SectionId>,
    /// A pointer payload, when the entry holds an address.
    pub pointer: Option<Pointer>,
    /// The label naming the entry, if any.
    pub label: Option<LabelId>,
}

/// A relocation site: an address in the image holding a pointer whose
/// destination is not materialised yet.
#[derive(Clone, Copy, Debug)]
pub struct Relocation {
    /// Where the pointer lives.
    pub addr: u64,
    /// The address the pointer designates.
    pub dest: u64,
}

/// The type of a binary file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    /// A standalone executable.
    Executable,
    /// A shared library.
    Shared,
    /// A relocatable object.
    Relocatable,
}

/// Everything the engine needs to know about a loaded binary.
#[derive(Clone, Debug)]
pub struct BinaryImage {
    /// The file name, for diagnostics.
    pub name: String,
    /// The architecture code of the file.
    pub arch_code: ArchCode,
    /// The type of the file.
    pub file_type: FileType,
    /// All sections.
    pub sections: Vec<Section>,
    /// All labels.
    pub labels: Vec<Label>,
    /// Names of the external libraries the file depends on.
    pub ext_libs: Vec<String>,
    /// Pointer sites whose destinations await linking.
    pub relocations: Vec<Relocation>,
}

impl BinaryImage {
    /// Starts an empty image for architecture `arch_code`.
    pub fn new(name: impl Into<String>, arch_code: ArchCode, file_type: FileType) -> Self {
        BinaryImage {
            name: name.into(),
            arch_code,
            file_type,
            sections: Vec::new(),
            labels: Vec::new(),
            ext_libs: Vec::new(),
            relocations: Vec::new(),
        }
    }

    /// Adds a code section and returns its identifier.
    pub fn add_code_section(
        &mut self,
        name: impl Into<String>,
        addr: u64,
        bytes: Vec<u8>,
        attrs: SectionAttrs,
    ) -> SectionId {
        self.sections.push(Section {
            name: name.into(),
            kind: SectionKind::Code,
            attrs,
            addr,
            bytes,
        });
        SectionId((self.sections.len() - 1) as u16)
    }

    /// Adds a data section and returns its identifier.
    pub fn add_data_section(
        &mut self,
        name: impl Into<String>,
        addr: u64,
        bytes: Vec<u8>,
    ) -> SectionId {
        self.sections.push(Section {
            name: name.into(),
            kind: SectionKind::Data,
            attrs: SectionAttrs::NONE,
            addr,
            bytes,
        });
        SectionId((self.sections.len() - 1) as u16)
    }

    /// Adds a label.
    pub fn add_label(&mut self, name: impl Into<String>, addr: u64, kind: LabelKind) {
        let mut label = Label::new(name, addr, kind);
        label.section = self.section_at(addr);
        self.labels.push(label);
    }

    /// Adds an external library dependency.
    pub fn add_ext_lib(&mut self, name: impl Into<String>) {
        self.ext_libs.push(name.into());
    }

    /// Adds a relocation site.
    pub fn add_relocation(&mut self, addr: u64, dest: u64) {
        self.relocations.push(Relocation { addr, dest });
    }

    /// Finds a section by name.
    pub fn find_section(&self, name: &str) -> Option<SectionId> {
        self.sections
            .iter()
            .position(|s| s.name == name)
            .map(|i| SectionId(i as u16))
    }

    /// Finds the section containing `addr`.
    pub fn section_at(&self, addr: u64) -> Option<SectionId> {
        self.sections
            .iter()
            .position(|s| s.contains(addr))
            .map(|i| SectionId(i as u16))
    }

    /// Immutable access to a section.
    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.0 as usize]
    }
}
