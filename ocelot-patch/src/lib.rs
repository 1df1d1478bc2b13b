//! Rust library for planning and applying binary code modifications.
//!
//! # About the patcher
//!
//! Patching starts from a disassembled [`AsmFile`] and a list of
//! *modification requests*: insertions, deletions, replacements,
//! relocations, in-place rewrites and branch redirections, optionally
//! guarded by runtime conditions. Requests accumulate in a
//! [`PatchFile`] without touching the instruction graph; only a commit
//! materialises them, in a fixed order, and emits the patched byte
//! streams.
//!
//! The planner preserves control-flow correctness: displaced code is
//! reached through trampolines, inbound branches are rerouted according
//! to each request's contract, and after a commit every relative branch
//! pointer re-derives its address from its target. An optional address
//! tracking map records where every original instruction ended up.
//!
//! [`AsmFile`]: ../ocelot_asm/asmfile/struct.AsmFile.html
//! [`PatchFile`]: planner/struct.PatchFile.html

use thiserror::Error;

pub mod cond;
pub mod globvar;
pub mod modif;
pub mod planner;
pub mod writer;

pub use cond::{Cond, CondExpr, CondId};
pub use globvar::{GlobVar, GlobVarId, VarLife};
pub use modif::{Modif, ModifId, ModifKind, ModifNext, ModifPos, RedirectDest};
pub use planner::{PatchFile, StackPolicy};
pub use writer::{PatchedBinary, PatchedSection};

/// Error kinds raised by the patch planner.
///
/// Planner errors surface before any mutation of the instruction graph:
/// a failed request leaves the session exactly as it was.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    /// No modification session has been initialised.
    #[error("the file is not prepared for modification")]
    NotInitialised,
    /// No instruction lives at the requested address.
    #[error("no instruction at address {0:#x}")]
    InstructionNotFound(u64),
    /// Two incompatible modifications target the same instruction.
    #[error("conflicting modification at address {0:#x}")]
    ModificationConflict(u64),
    /// A padding candidate is longer than the architecture's default.
    #[error("padding instruction is larger than the default")]
    PaddingTooLarge,
    /// The modification already carries its own padding instruction.
    #[error("modification already has a custom padding instruction")]
    ModifHasCustomPadding,
    /// Address tracking was not enabled before the commit.
    #[error("addresses were not tracked by this session")]
    AddressesNotTracked,
    /// The named library is not part of the session.
    #[error("library {0:?} not found")]
    LibraryNotFound(String),
    /// The new name is already taken.
    #[error("rename collides with existing name {0:?}")]
    RenameCollision(String),
    /// The modification was committed and can no longer move.
    #[error("modification {0} is fixed")]
    ModifFixed(u32),
    /// A floating modification is not reached by any chain.
    #[error("floating modification {0} is never reached")]
    UnreachedFloating(u32),
    /// The session was already committed.
    #[error("modifications have already been committed")]
    AlreadyCommitted,
    /// An operand does not fit the requested operation.
    #[error("operand type mismatch")]
    OperandTypeMismatch,
    /// Encoding an instruction failed.
    #[error("encoding failed: {0}")]
    Encode(#[from] ocelot_asm::EncodeError),
}
