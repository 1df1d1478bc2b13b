//! Runtime conditions guarding inserted code.

use ocelot_asm::arch::Comparison;
use ocelot_asm::operand::Operand;

/// Identifier of a condition inside its session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CondId(pub u32);

/// A node of a condition tree.
#[derive(Clone, Debug)]
pub enum CondExpr {
    /// Both sub-conditions must hold.
    And(CondId, CondId),
    /// At least one sub-condition must hold.
    Or(CondId, CondId),
    /// Compare an operand against a constant.
    Comp {
        /// The comparison operator.
        op: Comparison,
        /// The operand under test.
        oprnd: Operand,
        /// The constant to compare against.
        value: i64,
    },
}

/// A condition registered on a session.
#[derive(Clone, Debug)]
pub struct Cond {
    /// The session-unique identifier.
    pub id: CondId,
    /// The expression tree node.
    pub expr: CondExpr,
}
