//! The session-level error and warning taxonomy.
//!
//! Every API call stores its outcome on the session: a single
//! read-and-reset slot where warnings overwrite earlier warnings but
//! never earlier errors. Numeric codes live in disjoint ranges so that
//! callers can tell the severity from the code alone: 0 is success,
//! warnings occupy `0x100..0x1000` and errors start at `0x1000`.

use thiserror::Error;

use ocelot_asm::assembler::ParseError;
use ocelot_asm::{DecodeError, DisassError, EncodeError};
use ocelot_patch::PatchError;

/// Errors raised by the session API. The operation was not performed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OcelotError {
    /// Decoding machine code failed.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// Driving the disassembler failed.
    #[error(transparent)]
    Disass(#[from] DisassError),
    /// Encoding an instruction failed.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// Parsing instruction text failed.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The patch planner refused the operation.
    #[error(transparent)]
    Patch(#[from] PatchError),
    /// No instruction lives at the requested location.
    #[error("no instruction at address {0:#x}")]
    InstructionNotFound(u64),
    /// The requested section does not exist.
    #[error("section {0:?} not found")]
    SectionNotFound(String),
    /// The requested label does not exist.
    #[error("label {0:?} not found")]
    LabelNotFound(String),
    /// No modification session has been initialised.
    #[error("the file is not prepared for modification")]
    PatchNotInitialised,
    /// The operand does not have the requested shape.
    #[error("operand type mismatch")]
    OperandTypeMismatch,
    /// The file was not disassembled yet.
    #[error("the file has not been disassembled")]
    NotDisassembled,
    /// No debug information is available for the file.
    #[error("no debug data available")]
    NoDebugData,
    /// The cursor does not point at an instruction.
    #[error("the cursor is not positioned")]
    CursorNotSet,
}

impl OcelotError {
    /// The numeric code of the error. Errors all live at `0x1000` and
    /// above.
    pub fn code(&self) -> u32 {
        match self {
            OcelotError::Decode(DecodeError::EndOfStream) => 0x1101,
            OcelotError::Decode(DecodeError::NoTransitionMatch) => 0x1102,
            OcelotError::Decode(DecodeError::AddressOutOfRange(_)) => 0x1103,
            OcelotError::Disass(DisassError::UnsupportedArchitecture(_)) => 0x1201,
            OcelotError::Disass(DisassError::MissingSection(_)) => 0x1202,
            OcelotError::Disass(DisassError::NoCode) => 0x1203,
            OcelotError::Disass(DisassError::ResetFailed(_)) => 0x1204,
            OcelotError::Encode(_) => 0x1301,
            OcelotError::Parse(_) => 0x1401,
            OcelotError::Patch(PatchError::NotInitialised) => 0x1501,
            OcelotError::Patch(PatchError::InstructionNotFound(_)) => 0x1502,
            OcelotError::Patch(PatchError::ModificationConflict(_)) => 0x1503,
            OcelotError::Patch(PatchError::PaddingTooLarge) => 0x1504,
            OcelotError::Patch(PatchError::ModifHasCustomPadding) => 0x1505,
            OcelotError::Patch(PatchError::AddressesNotTracked) => 0x1506,
            OcelotError::Patch(PatchError::LibraryNotFound(_)) => 0x1507,
            OcelotError::Patch(PatchError::RenameCollision(_)) => 0x1508,
            OcelotError::Patch(PatchError::ModifFixed(_)) => 0x1509,
            OcelotError::Patch(PatchError::UnreachedFloating(_)) => 0x150A,
            OcelotError::Patch(PatchError::AlreadyCommitted) => 0x150B,
            OcelotError::Patch(PatchError::OperandTypeMismatch) => 0x150C,
            OcelotError::Patch(PatchError::Encode(_)) => 0x150D,
            OcelotError::InstructionNotFound(_) => 0x1601,
            OcelotError::SectionNotFound(_) => 0x1602,
            OcelotError::LabelNotFound(_) => 0x1603,
            OcelotError::PatchNotInitialised => 0x1604,
            OcelotError::OperandTypeMismatch => 0x1605,
            OcelotError::NotDisassembled => 0x1606,
            OcelotError::NoDebugData => 0x1607,
            OcelotError::CursorNotSet => 0x1608,
        }
    }
}

/// Warnings raised by the session API. The operation was performed, but
/// with caveats.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Warning {
    /// Some words could not be decoded; the listing carries markers.
    #[error("disassembly is incomplete")]
    IncompleteDisassembly,
    /// The returned branch tests the opposite condition of the one it
    /// was derived from.
    #[error("branch with opposite condition returned")]
    BranchOppositeCondition,
    /// The stack-shift policy was selected with a shift of zero.
    #[error("stack shift policy used with a null shift")]
    StackShiftNull,
    /// The file was already prepared for modification.
    #[error("modifications already initialised")]
    ModifsAlreadyInit,
    /// A redirection combines the update flag with an explicit chain;
    /// the update flag wins.
    #[error("redirection combines the update flag with an explicit chain")]
    AmbiguousRedirect,
}

impl Warning {
    /// The numeric code of the warning. Warnings all live in
    /// `0x100..0x1000`.
    pub fn code(&self) -> u32 {
        match self {
            Warning::IncompleteDisassembly => 0x101,
            Warning::BranchOppositeCondition => 0x102,
            Warning::StackShiftNull => 0x103,
            Warning::ModifsAlreadyInit => 0x104,
            Warning::AmbiguousRedirect => 0x105,
        }
    }
}

/// The outcome recorded on the session by the last API call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// The call failed.
    Error(OcelotError),
    /// The call succeeded with caveats.
    Warning(Warning),
}

impl Status {
    /// The numeric code of the recorded outcome.
    pub fn code(&self) -> u32 {
        match self {
            Status::Error(e) => e.code(),
            Status::Warning(w) => w.code(),
        }
    }
}

/// The single deferred-status slot of a session.
#[derive(Debug, Default)]
pub struct LastStatus {
    slot: Option<Status>,
}

impl LastStatus {
    /// Records an error. Errors overwrite whatever was there.
    pub fn set_error(&mut self, error: OcelotError) {
        self.slot = Some(Status::Error(error));
    }

    /// Records a warning, unless an unread error is already stored.
    pub fn set_warning(&mut self, warning: Warning) {
        match self.slot {
            Some(Status::Error(_)) => {}
            _ => self.slot = Some(Status::Warning(warning)),
        }
    }

    /// Reads and clears the slot.
    pub fn take(&mut self) -> Option<Status> {
        self.slot.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_ranges_are_disjoint() {
        let errors = [
            OcelotError::Decode(DecodeError::EndOfStream).code(),
            OcelotError::Patch(PatchError::PaddingTooLarge).code(),
            OcelotError::SectionNotFound(String::new()).code(),
        ];
        let warnings = [
            Warning::IncompleteDisassembly.code(),
            Warning::BranchOppositeCondition.code(),
        ];
        for e in &errors {
            assert!(*e >= 0x1000);
        }
        for w in &warnings {
            assert!(*w >= 0x100 && *w < 0x1000);
        }
    }

    #[test]
    fn warnings_never_overwrite_errors() {
        let mut status = LastStatus::default();
        status.set_error(OcelotError::PatchNotInitialised);
        status.set_warning(Warning::IncompleteDisassembly);
        assert_eq!(
            status.take(),
            Some(Status::Error(OcelotError::PatchNotInitialised))
        );
        // The slot resets on read.
        assert_eq!(status.take(), None);

        status.set_warning(Warning::IncompleteDisassembly);
        status.set_warning(Warning::BranchOppositeCondition);
        assert_eq!(
            status.take(),
            Some(Status::Warning(Warning::BranchOppositeCondition))
        );
    }
}
