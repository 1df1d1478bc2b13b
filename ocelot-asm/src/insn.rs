//! The architecture-agnostic instruction model.

use std::fmt;

use crate::arch::{ArchCode, ArchDescriptor};
use crate::operand::{Operand, OperandFlags, OperandKind, Pointer};
use crate::{LabelId, SectionId};

/// The reserved opcode identifier marking an un-decodable instruction.
pub const BAD_OPCODE: u16 = u16::max_value();

/// The binary coding of a decoded instruction.
///
/// Bytes are stored in memory order, as they appear in the binary image,
/// so that the coding can be printed and re-emitted without knowledge of
/// the architecture's code byte ordering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Coding {
    bytes: Vec<u8>,
    bit_len: u32,
}

impl Coding {
    /// Wraps coding bytes spanning `bit_len` bits.
    pub fn new(bytes: Vec<u8>, bit_len: u32) -> Self {
        Coding { bytes, bit_len }
    }

    /// The coding bytes in memory order.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The length of the coding in bits.
    pub fn bit_len(&self) -> u32 {
        self.bit_len
    }

    /// The length of the coding in bytes, rounded up.
    pub fn byte_len(&self) -> usize {
        ((self.bit_len + 7) / 8) as usize
    }

    /// Truncates the coding to its first `bit_len` bits.
    pub fn truncate(&mut self, bit_len: u32) {
        if bit_len < self.bit_len {
            self.bit_len = bit_len;
            self.bytes.truncate(((bit_len + 7) / 8) as usize);
        }
    }

    /// Formats the coding as space-separated hex bytes.
    pub fn hex(&self) -> String {
        self.bytes
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A bitset of analysis and patching annotations attached to an
/// instruction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Annotations(u32);

impl Annotations {
    /// The instruction belongs to a standard code section.
    pub const STD_CODE: Annotations = Annotations(1 << 0);
    /// The instruction belongs to an external function stub section.
    pub const EXT_STUB: Annotations = Annotations(1 << 1);
    /// The instruction belongs to a patched section.
    pub const PATCHED: Annotations = Annotations(1 << 2);
    /// The instruction was inserted by a patching session.
    pub const PATCH_NEW: Annotations = Annotations(1 << 3);
    /// The instruction was deleted by a patching session.
    pub const PATCH_DELETED: Annotations = Annotations(1 << 4);
    /// The instruction was displaced by a patching session.
    pub const PATCH_MOVED: Annotations = Annotations(1 << 5);
    /// The instruction follows a parsing error and may itself be wrong.
    pub const SUSPICIOUS: Annotations = Annotations(1 << 6);
    /// The instruction starts an instruction list.
    pub const BEGIN_LIST: Annotations = Annotations(1 << 7);
    /// The instruction ends an instruction list.
    pub const END_LIST: Annotations = Annotations(1 << 8);
    /// A modification request is attached to the instruction.
    pub const HAS_MODIF: Annotations = Annotations(1 << 9);
    /// The instruction belongs to the false path of a condition.
    pub const ELSE_BRANCH: Annotations = Annotations(1 << 10);

    /// The empty annotation set.
    pub const NONE: Annotations = Annotations(0);

    /// Builds an empty annotation set.
    pub fn empty() -> Self {
        Annotations(0)
    }

    /// Adds `other` to the set.
    pub fn add(&mut self, other: Annotations) {
        self.0 |= other.0;
    }

    /// Removes `other` from the set.
    pub fn remove(&mut self, other: Annotations) {
        self.0 &= !other.0;
    }

    /// Whether every flag of `other` is present in the set.
    pub fn has(&self, other: Annotations) -> bool {
        self.0 & other.0 == other.0
    }

    /// Merges two sets.
    pub fn union(self, other: Annotations) -> Self {
        Annotations(self.0 | other.0)
    }
}

/// Architecture-specific payload attached to an instruction.
///
/// Holds whatever decoded detail the architecture wants to carry outside
/// of the operand vector; the condition field is used by conditionally
/// executed branches.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InsnExt {
    /// Condition code of a conditionally executed instruction.
    pub cond: Option<u8>,
}

/// A decoded machine instruction.
///
/// Objects are normally produced by the disassembler or by the text
/// front end; the patch planner also builds them through the
/// architecture's code generation primitives.
#[derive(Clone, Debug)]
pub struct Instruction {
    opcode: u16,
    operands: Vec<Operand>,
    coding: Option<Coding>,
    address: u64,
    section: Option<SectionId>,
    fct_label: Option<LabelId>,
    isa: ArchCode,
    annotations: Annotations,
    ext: Option<Box<InsnExt>>,
}

impl Instruction {
    /// Constructs a new instruction from its opcode identifier and
    /// operand vector.
    pub fn new(opcode: u16, operands: Vec<Operand>, isa: ArchCode) -> Self {
        Instruction {
            opcode,
            operands,
            coding: None,
            address: 0,
            section: None,
            fct_label: None,
            isa,
            annotations: Annotations::empty(),
            ext: None,
        }
    }

    /// Constructs the `Bad` instruction used to mark un-decodable words.
    pub fn bad(isa: ArchCode) -> Self {
        Instruction::new(BAD_OPCODE, Vec::new(), isa)
    }

    /// Whether the instruction marks an un-decodable word.
    pub fn is_bad(&self) -> bool {
        self.opcode == BAD_OPCODE
    }

    /// The opcode identifier, an index in the architecture's sorted
    /// opcode table.
    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    /// Overwrites the opcode identifier.
    pub fn set_opcode(&mut self, opcode: u16) {
        self.opcode = opcode;
    }

    /// The ordered operand vector.
    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    /// Mutable access to the operand vector.
    pub fn operands_mut(&mut self) -> &mut Vec<Operand> {
        &mut self.operands
    }

    /// The absolute address of the instruction.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Stamps the absolute address of the instruction.
    pub fn set_address(&mut self, address: u64) {
        self.address = address;
    }

    /// The binary coding, if it has been materialised.
    pub fn coding(&self) -> Option<&Coding> {
        self.coding.as_ref()
    }

    /// Stamps the binary coding.
    pub fn set_coding(&mut self, coding: Coding) {
        self.coding = Some(coding);
    }

    /// Mutable access to the binary coding.
    pub fn coding_mut(&mut self) -> Option<&mut Coding> {
        self.coding.as_mut()
    }

    /// The size of the instruction in bytes, derived from its coding.
    pub fn byte_size(&self) -> usize {
        self.coding.as_ref().map(|c| c.byte_len()).unwrap_or(0)
    }

    /// The section the instruction belongs to.
    pub fn section(&self) -> Option<SectionId> {
        self.section
    }

    /// Records the owning section.
    pub fn set_section(&mut self, section: SectionId) {
        self.section = Some(section);
    }

    /// The function label the instruction falls under.
    pub fn fct_label(&self) -> Option<LabelId> {
        self.fct_label
    }

    /// Records the function label the instruction falls under.
    pub fn set_fct_label(&mut self, label: Option<LabelId>) {
        self.fct_label = label;
    }

    /// The instruction set the instruction was decoded under.
    pub fn isa(&self) -> ArchCode {
        self.isa
    }

    /// Records the instruction set.
    pub fn set_isa(&mut self, isa: ArchCode) {
        self.isa = isa;
    }

    /// The annotation set.
    pub fn annotations(&self) -> Annotations {
        self.annotations
    }

    /// Mutable access to the annotation set.
    pub fn annotations_mut(&mut self) -> &mut Annotations {
        &mut self.annotations
    }

    /// The architecture-specific payload, if any.
    pub fn ext(&self) -> Option<&InsnExt> {
        self.ext.as_deref()
    }

    /// Attaches an architecture-specific payload.
    pub fn set_ext(&mut self, ext: InsnExt) {
        self.ext = Some(Box::new(ext));
    }

    /// Finds the operand referencing another address, if any.
    ///
    /// Branch pointers take precedence over memory-relative accesses.
    pub fn ref_operand(&self) -> Option<(usize, &Operand)> {
        self.operands
            .iter()
            .enumerate()
            .find(|(_, op)| matches!(op.kind, OperandKind::Pointer(_)))
            .or_else(|| {
                self.operands
                    .iter()
                    .enumerate()
                    .find(|(_, op)| matches!(op.kind, OperandKind::MemRelative(..)))
            })
    }

    /// The branch pointer of the instruction, if it has one.
    pub fn branch_pointer(&self) -> Option<&Pointer> {
        self.operands.iter().find_map(|op| match &op.kind {
            OperandKind::Pointer(p) => Some(p),
            _ => None,
        })
    }

    /// Mutable access to the branch pointer.
    pub fn branch_pointer_mut(&mut self) -> Option<&mut Pointer> {
        self.operands.iter_mut().find_map(|op| match &mut op.kind {
            OperandKind::Pointer(p) => Some(p),
            _ => None,
        })
    }

    /// Compares the natures of two instructions: opcode identifier and
    /// operand-wise equivalence. Extensions are compared structurally;
    /// addresses, codings and annotations are ignored, except that
    /// pointer operands compare by destination address.
    pub fn equal(&self, other: &Instruction) -> bool {
        self.opcode == other.opcode
            && self.operands.len() == other.operands.len()
            && self.ext == other.ext
            && self
                .operands
                .iter()
                .zip(other.operands.iter())
                .all(|(a, b)| a.equivalent(b, self.address, other.address))
    }

    /// Renders the instruction as assembly text: mnemonic followed by its
    /// comma-separated operands.
    pub fn display<'a>(&'a self, desc: &'a ArchDescriptor) -> InsnDisplay<'a> {
        InsnDisplay { insn: self, desc }
    }
}

/// Helper rendering an [`Instruction`] against an architecture
/// descriptor.
///
/// [`Instruction`]: struct.Instruction.html
pub struct InsnDisplay<'a> {
    insn: &'a Instruction,
    desc: &'a ArchDescriptor,
}

impl fmt::Display for InsnDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let insn = self.insn;
        write!(f, "{}", self.desc.opcode_name(insn.opcode()))?;
        if let Some(ext) = insn.ext() {
            if let Some(cond) = ext.cond {
                write!(f, ".{}", self.desc.cond_name(cond))?;
            }
        }
        for (i, op) in insn.operands().iter().enumerate() {
            if i == 0 {
                write!(f, " ")?;
            } else {
                write!(f, ", ")?;
            }
            write_operand(f, insn, op, self.desc)?;
        }
        Ok(())
    }
}

fn write_operand(
    f: &mut fmt::Formatter<'_>,
    insn: &Instruction,
    op: &Operand,
    desc: &ArchDescriptor,
) -> fmt::Result {
    match &op.kind {
        OperandKind::Register(r) => write!(f, "{}", desc.reg_name(*r))?,
        OperandKind::Immediate(v) => {
            if *v < 0 {
                write!(f, "#-{:#x}", -v)?
            } else {
                write!(f, "#{:#x}", v)?
            }
        }
        OperandKind::Memory(mem) => {
            write!(f, "[")?;
            if let Some(base) = mem.base {
                write!(f, "{}", desc.reg_name(base))?;
            }
            if let Some(index) = mem.index {
                write!(f, ", {}", desc.reg_name(index))?;
                if mem.scale > 1 {
                    write!(f, ", lsl #{}", mem.scale.trailing_zeros())?;
                }
            }
            if op.flags.has(OperandFlags::POST_INDEXED) {
                write!(f, "], #{}", mem.offset)?;
                return Ok(());
            }
            if mem.offset != 0 {
                write!(f, ", #{}", mem.offset)?;
            }
            write!(f, "]")?;
            if op.flags.has(OperandFlags::WRITE_BACK) {
                write!(f, "!")?;
            }
        }
        OperandKind::Pointer(p) => write!(f, "{:#x}", p.get_addr(insn.address()))?,
        OperandKind::MemRelative(offset, _) => {
            let dest = insn.address() as i64 + insn.byte_size() as i64 + offset;
            write!(f, "{:#x}", dest)?;
        }
    }
    if let Some(ext) = &op.ext {
        write!(f, "{}", ext)?;
    }
    Ok(())
}
