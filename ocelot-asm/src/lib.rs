//! Rust library for representing, disassembling and assembling machine code.
//!
//! # About the engine
//!
//! The heart of this crate is a table-driven, bit-level LR(0) disassembly
//! engine. An architecture is described by a [`GrammarTables`] blob (states,
//! transition subtables and reduction rules produced ahead of time by a
//! grammar compiler) together with an [`ArchDescriptor`] carrying its
//! register and opcode tables and an [`ArchOps`] capability object. The
//! [`Parser`] drives the automaton over a [`BitStream`] and produces one
//! [`Instruction`] per word.
//!
//! On top of the parser, the [`disassembler`] module orchestrates whole
//! code sections: it applies the architecture's code byte ordering, follows
//! function labels to resynchronise on mis-decoded regions, switches
//! instruction sets mid-stream when the architecture requests it and feeds
//! every decoded instruction through the [`resolver`] so that branch and
//! data references are linked incrementally.
//!
//! # The instruction model
//!
//! Decoded instructions live in an [`AsmFile`]: an arena-backed, doubly
//! linked instruction list with stable identifiers, the label and data
//! tables of the underlying [`BinaryImage`] and the reference indexes
//! maintained by the resolver. Instructions reference each other through
//! weak [`InsnId`]/[`DataId`] indices so that rollbacks and patching can
//! never leave dangling pointers behind.
//!
//! ## Pretty-printing instructions
//!
//! [`AsmFile::print_insn`] emits an objdump-style line for a decoded
//! instruction, including the trailing `# 0xADDR <label>` comment when a
//! memory-relative operand resolves to a known data entry.
//!
//! # Assembling instructions
//!
//! The [`assembler`] module is a text front end only: it parses printed
//! instruction lines back into [`Instruction`] objects for patch
//! composition. Encoding an instruction back into bytes is the business of
//! the architecture's [`ArchOps::encode_insn`] implementation.
//!
//! [`GrammarTables`]: grammar/struct.GrammarTables.html
//! [`ArchDescriptor`]: arch/struct.ArchDescriptor.html
//! [`ArchOps`]: arch/trait.ArchOps.html
//! [`Parser`]: fsm/struct.Parser.html
//! [`BitStream`]: bitstream/struct.BitStream.html
//! [`Instruction`]: insn/struct.Instruction.html
//! [`AsmFile`]: asmfile/struct.AsmFile.html
//! [`AsmFile::print_insn`]: asmfile/struct.AsmFile.html#method.print_insn
//! [`BinaryImage`]: binary/struct.BinaryImage.html
//! [`InsnId`]: struct.InsnId.html
//! [`DataId`]: struct.DataId.html
//! [`disassembler`]: disassembler/index.html
//! [`resolver`]: resolver/index.html
//! [`assembler`]: assembler/index.html
//! [`ArchOps::encode_insn`]: arch/trait.ArchOps.html#tymethod.encode_insn

use thiserror::Error;

pub mod a64;
pub mod arch;
pub mod asmfile;
pub mod assembler;
pub mod binary;
pub mod bitstream;
pub mod disassembler;
pub mod fsm;
pub mod grammar;
pub mod insn;
pub mod operand;
pub mod resolver;

pub use arch::{ArchCode, ArchDescriptor, ArchOps, CodeEndianness};
pub use asmfile::AsmFile;
pub use binary::{BinaryImage, DataEntry, Label, LabelKind, Section, SectionKind};
pub use bitstream::{BitPos, BitStream, ValueEndianness};
pub use fsm::Parser;
pub use grammar::{GrammarBuilder, GrammarTables};
pub use insn::{Annotations, Coding, Instruction};
pub use operand::{Operand, Pointer, PointerKind, PointerTarget};

/// Stable identifier of an instruction inside an [`AsmFile`] arena.
///
/// [`AsmFile`]: asmfile/struct.AsmFile.html
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InsnId(pub u32);

/// Stable identifier of a data entry inside an [`AsmFile`].
///
/// [`AsmFile`]: asmfile/struct.AsmFile.html
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataId(pub u32);

/// Stable identifier of a label inside an [`AsmFile`].
///
/// [`AsmFile`]: asmfile/struct.AsmFile.html
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LabelId(pub u32);

/// Identifier of a section inside a [`BinaryImage`].
///
/// [`BinaryImage`]: binary/struct.BinaryImage.html
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionId(pub u16);

/// Error kinds that may occur while decoding machine code.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The end of the parsed stream was reached in the middle of a word.
    #[error("end of stream reached while matching a word")]
    EndOfStream,
    /// No automaton transition matches the bits under the cursor.
    #[error("no transition matches the input")]
    NoTransitionMatch,
    /// An address outside of the parsed stream was requested.
    #[error("address {0:#x} is out of the parsed range")]
    AddressOutOfRange(u64),
}

/// Error kinds that may occur while driving whole sections through the
/// disassembler.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DisassError {
    /// No driver is registered for the requested architecture.
    #[error("unsupported architecture code {0:#x}")]
    UnsupportedArchitecture(u16),
    /// The requested section does not exist in the binary image.
    #[error("section {0:?} not found")]
    MissingSection(String),
    /// The binary image does not contain any code section.
    #[error("no code section to disassemble")]
    NoCode,
    /// Resynchronising the parser to an address failed.
    #[error("parsing reset to {0:#x} failed")]
    ResetFailed(u64),
}

/// Error kinds raised when encoding an instruction back into bytes.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    /// The instruction's opcode is unknown to the encoder.
    #[error("opcode {0} cannot be encoded")]
    UnknownOpcode(u16),
    /// An operand does not fit the encoding of the instruction.
    #[error("operand {0} does not fit the instruction encoding")]
    OperandTypeMismatch(usize),
    /// A pointer operand has neither a target nor a resolved address.
    #[error("pointer operand has no destination")]
    UnresolvedPointer,
}
