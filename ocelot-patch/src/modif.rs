//! Modification requests and their bookkeeping.

use ocelot_asm::insn::Instruction;
use ocelot_asm::operand::Operand;
use ocelot_asm::InsnId;

use crate::cond::CondId;

/// Identifier of a modification inside its session. Identifiers are
/// handed out sequentially and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModifId(pub u32);

/// Where a modification applies relative to its anchor instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModifPos {
    /// The body goes before the anchor.
    Before,
    /// The body goes after the anchor.
    After,
    /// The body replaces the anchor.
    Replace,
    /// The anchor stays untouched; the modification only annotates it.
    Keep,
    /// The modification has no anchor; it is reached through explicit
    /// chaining only.
    Floating,
}

/// What a branch redirection points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedirectDest {
    /// Another instruction.
    Insn(InsnId),
    /// The body of another modification.
    Modif(ModifId),
}

/// Where control flows after a modification's body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModifNext {
    /// Into the body of another modification.
    Modif(ModifId),
    /// To an instruction.
    Insn(InsnId),
}

/// The operation a modification performs.
#[derive(Clone, Debug)]
pub enum ModifKind {
    /// Emit an instruction list around the anchor.
    Insert {
        /// The instructions to emit.
        insns: Vec<Instruction>,
    },
    /// Replace the anchor with padding of identical byte length.
    Delete,
    /// Replace the anchor with new instructions; inbound branches are
    /// rerouted to the anchor's successor.
    Replace {
        /// The replacement instructions.
        insns: Vec<Instruction>,
    },
    /// Rewrite the anchor's mnemonic and/or operands in place.
    Modify {
        /// The new opcode identifier, if it changes.
        opcode: Option<u16>,
        /// The new operand vector, if it changes.
        operands: Option<Vec<Operand>>,
        /// Whether a shrunken rewrite is padded.
        pad: bool,
    },
    /// Mark the block around the anchor as movable into the displaced
    /// code section.
    Relocate,
    /// Point a branch instruction somewhere else.
    Redirect {
        /// The new destination.
        dest: RedirectDest,
        /// Whether a later insertion before the destination diverts the
        /// branch into the inserted code.
        update_if_patched: bool,
    },
}

impl ModifKind {
    /// Whether two kinds may target the same anchor.
    pub fn conflicts_with(&self, other: &ModifKind) -> bool {
        let exclusive = |k: &ModifKind| {
            matches!(
                k,
                ModifKind::Delete | ModifKind::Replace { .. } | ModifKind::Modify { .. }
            )
        };
        exclusive(self) && exclusive(other)
    }
}

/// One modification request.
#[derive(Clone, Debug)]
pub struct Modif {
    /// The session-unique identifier.
    pub id: ModifId,
    /// The operation to perform.
    pub kind: ModifKind,
    /// The anchor instruction, absent for floating modifications.
    pub anchor: Option<InsnId>,
    /// The anchor address, used for ordering.
    pub addr: u64,
    /// Where the modification applies relative to its anchor.
    pub pos: ModifPos,
    /// The condition guarding the body, if any.
    pub cond: Option<CondId>,
    /// The modification executed when the condition is false.
    pub else_modif: Option<ModifId>,
    /// Where control flows after the body, when overridden.
    pub next: Option<ModifNext>,
    /// A padding instruction overriding the session default.
    pub padding: Option<Instruction>,
    /// Whether the modification has been committed.
    pub processed: bool,
    /// A fixed modification must not move once processed.
    pub fixed: bool,
}

impl Modif {
    pub(crate) fn new(id: ModifId, kind: ModifKind, anchor: Option<InsnId>, addr: u64, pos: ModifPos) -> Self {
        Modif {
            id,
            kind,
            anchor,
            addr,
            pos,
            cond: None,
            else_modif: None,
            next: None,
            padding: None,
            processed: false,
            fixed: false,
        }
    }

    /// Whether the modification floats free of any anchor.
    pub fn is_floating(&self) -> bool {
        self.pos == ModifPos::Floating
    }

    /// The ordering key of the modification: anchor address, position,
    /// insertion identifier.
    pub fn sort_key(&self) -> (u64, ModifPos, ModifId) {
        (self.addr, self.pos, self.id)
    }
}
