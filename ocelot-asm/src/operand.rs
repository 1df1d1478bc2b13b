//! Abstractions over instruction operands.

use std::fmt;

use crate::{DataId, InsnId};

/// The direction in which an operand is used by its instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The operand is read by the operation.
    Source,
    /// The operand is written by the operation.
    Destination,
    /// The operand is both read and written.
    SourceDestination,
    /// The operand does not carry a data flow direction.
    None,
}

impl Role {
    /// Whether the operand is read by its instruction.
    pub fn is_source(&self) -> bool {
        matches!(self, Role::Source | Role::SourceDestination)
    }

    /// Whether the operand is written by its instruction.
    pub fn is_destination(&self) -> bool {
        matches!(self, Role::Destination | Role::SourceDestination)
    }
}

/// Additional per-operand flags.
///
/// The flags qualify how memory operands interact with their base
/// register and which register slot of the encoding an operand came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperandFlags(u8);

impl OperandFlags {
    /// The base register is updated with the computed address.
    pub const WRITE_BACK: OperandFlags = OperandFlags(1 << 0);
    /// The offset is applied after the memory access.
    pub const POST_INDEXED: OperandFlags = OperandFlags(1 << 1);
    /// The base register doubles as the destination of the operation.
    pub const BASE_IS_DEST: OperandFlags = OperandFlags(1 << 2);
    /// The operand was decoded from an indexed register slot.
    pub const INDEXED_REG: OperandFlags = OperandFlags(1 << 3);

    /// Builds an empty flag set.
    pub fn empty() -> Self {
        OperandFlags(0)
    }

    /// Adds `flag` to the set.
    pub fn with(self, flag: OperandFlags) -> Self {
        OperandFlags(self.0 | flag.0)
    }

    /// Whether `flag` is part of the set.
    pub fn has(&self, flag: OperandFlags) -> bool {
        self.0 & flag.0 != 0
    }
}

/// The kinds of extension an operand may carry.
///
/// Extensions qualify how a register operand is adjusted before the
/// operation uses it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtMode {
    /// No adjustment.
    Empty,
    /// The register is zero- or sign-extended from a narrower width.
    Extend(ExtendKind, u8),
    /// The register is shifted by a constant amount.
    Shift(ShiftKind, u8),
}

/// Register extension operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ExtendKind {
    Uxtb,
    Uxth,
    Uxtw,
    Uxtx,
    Sxtb,
    Sxth,
    Sxtw,
    Sxtx,
}

/// Register shift operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

/// The element layout of a vector register operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Arrangement {
    None,
    B8,
    B16,
    H4,
    H8,
    S2,
    S4,
    D1,
    D2,
}

/// Architecture-specific payload attached to an operand.
///
/// The extension is exclusively owned by its operand and deep-copied
/// whenever the operand is copied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperandExt {
    /// The adjustment applied to the operand value.
    pub mode: ExtMode,
    /// The vector element layout, if any.
    pub arrangement: Arrangement,
}

impl OperandExt {
    /// Builds an extension from its adjustment mode, with no vector
    /// layout.
    pub fn new(mode: ExtMode) -> Self {
        OperandExt {
            mode,
            arrangement: Arrangement::None,
        }
    }
}

impl fmt::Display for OperandExt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            ExtMode::Empty => Ok(()),
            ExtMode::Extend(kind, amount) => {
                let name = match kind {
                    ExtendKind::Uxtb => "uxtb",
                    ExtendKind::Uxth => "uxth",
                    ExtendKind::Uxtw => "uxtw",
                    ExtendKind::Uxtx => "uxtx",
                    ExtendKind::Sxtb => "sxtb",
                    ExtendKind::Sxth => "sxth",
                    ExtendKind::Sxtw => "sxtw",
                    ExtendKind::Sxtx => "sxtx",
                };
                if amount > 0 {
                    write!(f, ", {} #{}", name, amount)
                } else {
                    write!(f, ", {}", name)
                }
            }
            ExtMode::Shift(kind, amount) => {
                let name = match kind {
                    ShiftKind::Lsl => "lsl",
                    ShiftKind::Lsr => "lsr",
                    ShiftKind::Asr => "asr",
                    ShiftKind::Ror => "ror",
                };
                write!(f, ", {} #{}", name, amount)
            }
        }
    }
}

/// Whether a pointer stores an absolute destination or an offset from its
/// owning instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerKind {
    /// The pointer stores the absolute destination address.
    Absolute,
    /// The pointer stores a signed offset from its owning instruction's
    /// address.
    Relative,
}

/// What a pointer resolves to once the destination has been materialised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerTarget {
    /// The destination is not materialised yet.
    None,
    /// The destination is an instruction.
    Insn(InsnId),
    /// The destination is a data entry.
    Data(DataId),
}

/// A reference to another address, used by branch and data-access
/// operands.
///
/// A pointer either knows its destination address (absolute or relative
/// to its owning instruction) or holds a weak index to the target object
/// plus an offset inside it. After structural mutations, relative
/// pointers are re-derived from their target's address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pointer {
    /// How the stored address value is interpreted.
    pub kind: PointerKind,
    /// Absolute address or relative offset, depending on `kind`.
    pub addr: i64,
    /// The object the pointer resolves to, if materialised.
    pub target: PointerTarget,
    /// Offset of the destination inside the target object.
    pub offset_in_target: i64,
}

impl Pointer {
    /// Builds an absolute pointer to `addr`.
    pub fn absolute(addr: u64) -> Self {
        Pointer {
            kind: PointerKind::Absolute,
            addr: addr as i64,
            target: PointerTarget::None,
            offset_in_target: 0,
        }
    }

    /// Builds a pointer relative to its owning instruction.
    pub fn relative(offset: i64) -> Self {
        Pointer {
            kind: PointerKind::Relative,
            addr: offset,
            target: PointerTarget::None,
            offset_in_target: 0,
        }
    }

    /// Computes the absolute destination address of the pointer, given
    /// the address of the instruction owning it.
    pub fn get_addr(&self, origin: u64) -> u64 {
        match self.kind {
            PointerKind::Absolute => self.addr as u64,
            PointerKind::Relative => (origin as i64 + self.addr) as u64,
        }
    }

    /// Updates the pointer so that `get_addr` returns `dest` again.
    pub fn set_addr(&mut self, origin: u64, dest: u64) {
        match self.kind {
            PointerKind::Absolute => self.addr = dest as i64,
            PointerKind::Relative => self.addr = dest as i64 - origin as i64,
        }
    }

    /// Whether the pointer has a materialised target.
    pub fn has_target(&self) -> bool {
        self.target != PointerTarget::None
    }
}

/// A memory access operand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemAccess {
    /// The base register, as an index in the architecture's register
    /// table.
    pub base: Option<u16>,
    /// The index register, if any.
    pub index: Option<u16>,
    /// The constant displacement.
    pub offset: i64,
    /// The scale applied to the index register.
    pub scale: u8,
    /// Architecture-specific extension of the access.
    pub ext: Option<Box<OperandExt>>,
}

/// The value of an operand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperandKind {
    /// A register, as an index in the architecture's register table.
    Register(u16),
    /// A constant embedded in the coding.
    Immediate(i64),
    /// A memory access through registers.
    Memory(MemAccess),
    /// A code reference, used by branches.
    Pointer(Pointer),
    /// A memory access relative to the instruction's own address.
    ///
    /// Carries the raw displacement and the pointer the resolver binds to
    /// the referenced data entry.
    MemRelative(i64, Pointer),
}

/// An operand of an instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operand {
    /// The value of the operand.
    pub kind: OperandKind,
    /// The size in bits of the accessed quantity.
    pub size: u8,
    /// The data flow direction of the operand.
    pub role: Role,
    /// Additional flags.
    pub flags: OperandFlags,
    /// Architecture-specific extension, exclusively owned.
    pub ext: Option<Box<OperandExt>>,
}

impl Operand {
    /// Builds a register operand.
    pub fn reg(reg: u16, size: u8, role: Role) -> Self {
        Operand {
            kind: OperandKind::Register(reg),
            size,
            role,
            flags: OperandFlags::empty(),
            ext: None,
        }
    }

    /// Builds an immediate operand.
    pub fn imm(value: i64) -> Self {
        Operand {
            kind: OperandKind::Immediate(value),
            size: 64,
            role: Role::Source,
            flags: OperandFlags::empty(),
            ext: None,
        }
    }

    /// Builds a memory operand.
    pub fn mem(mem: MemAccess, size: u8, role: Role) -> Self {
        Operand {
            kind: OperandKind::Memory(mem),
            size,
            role,
            flags: OperandFlags::empty(),
            ext: None,
        }
    }

    /// Builds a pointer operand.
    pub fn ptr(ptr: Pointer) -> Self {
        Operand {
            kind: OperandKind::Pointer(ptr),
            size: 64,
            role: Role::Source,
            flags: OperandFlags::empty(),
            ext: None,
        }
    }

    /// Builds a memory-relative operand from its raw displacement.
    pub fn mem_relative(offset: i64, size: u8, role: Role) -> Self {
        Operand {
            kind: OperandKind::MemRelative(offset, Pointer::relative(offset)),
            size,
            role,
            flags: OperandFlags::empty(),
            ext: None,
        }
    }

    /// Attaches an extension to the operand.
    pub fn with_ext(mut self, ext: OperandExt) -> Self {
        self.ext = Some(Box::new(ext));
        self
    }

    /// Returns the pointer carried by the operand, if any.
    pub fn pointer(&self) -> Option<&Pointer> {
        match &self.kind {
            OperandKind::Pointer(p) => Some(p),
            OperandKind::MemRelative(_, p) => Some(p),
            _ => None,
        }
    }

    /// Returns a mutable reference to the pointer carried by the operand,
    /// if any.
    pub fn pointer_mut(&mut self) -> Option<&mut Pointer> {
        match &mut self.kind {
            OperandKind::Pointer(p) => Some(p),
            OperandKind::MemRelative(_, p) => Some(p),
            _ => None,
        }
    }

    /// Compares two operands owned by instructions at `self_addr` and
    /// `other_addr`.
    ///
    /// Pointer operands compare by destination address so that a decoded
    /// relative branch and its reparsed absolute form are considered
    /// equivalent; every other kind compares structurally.
    pub fn equivalent(&self, other: &Operand, self_addr: u64, other_addr: u64) -> bool {
        match (&self.kind, &other.kind) {
            (OperandKind::Pointer(a), OperandKind::Pointer(b)) => {
                a.get_addr(self_addr) == b.get_addr(other_addr) && self.ext == other.ext
            }
            (OperandKind::MemRelative(a, _), OperandKind::MemRelative(b, _)) => {
                a == b && self.ext == other.ext
            }
            _ => self.kind == other.kind && self.ext == other.ext,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_addr_round_trips() {
        let origin = 0x4000;
        let mut rel = Pointer::relative(0x20);
        let dest = rel.get_addr(origin);
        assert_eq!(dest, 0x4020);
        rel.set_addr(origin, dest);
        assert_eq!(rel, Pointer::relative(0x20));

        let mut abs = Pointer::absolute(0x5000);
        let dest = abs.get_addr(origin);
        abs.set_addr(origin, dest);
        assert_eq!(abs, Pointer::absolute(0x5000));
    }

    #[test]
    fn pointer_operands_compare_by_destination() {
        let rel = Operand::ptr(Pointer::relative(0x8));
        let abs = Operand::ptr(Pointer::absolute(0x2008));
        assert!(rel.equivalent(&abs, 0x2000, 0x2000));
        assert!(!rel.equivalent(&abs, 0x3000, 0x2000));
    }

    #[test]
    fn extension_is_deep_copied() {
        let op = Operand::reg(3, 64, Role::Source)
            .with_ext(OperandExt::new(ExtMode::Shift(ShiftKind::Lsl, 12)));
        let copy = op.clone();
        assert_eq!(op, copy);
        // The boxes are distinct allocations.
        assert!(!std::ptr::eq(
            op.ext.as_deref().unwrap(),
            copy.ext.as_deref().unwrap()
        ));
    }
}
