//! Architecture descriptors and the capability interface engine code
//! programs against.

use crate::assembler::ParseError;
use crate::binary::Label;
use crate::grammar::GrammarTables;
use crate::insn::{Annotations, Coding, Instruction, BAD_OPCODE};
use crate::operand::{Operand, Pointer};
use crate::EncodeError;

/// Identifiers of the supported instruction sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ArchCode {
    /// The 64-bit fixed-width instruction set.
    A64 = 1,
    /// The compact 16-bit companion instruction set.
    A64c = 2,
}

impl ArchCode {
    /// The numeric code of the instruction set.
    pub fn code(&self) -> u16 {
        *self as u16
    }
}

/// The byte ordering of code in memory, as seen by the bit-level parser.
///
/// Architectures whose code is stored least significant byte first need
/// their bytes reordered in 16- or 32-bit groups before the grammar can
/// match them most significant bit first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeEndianness {
    /// Bits are stored in matching order; nothing to do.
    BigBit,
    /// Bits are stored in reverse order inside each byte.
    LittleBit,
    /// Bytes are stored little endian in 16-bit groups.
    LittleSwap16,
    /// Bytes are stored little endian in 32-bit groups.
    LittleSwap32,
}

impl CodeEndianness {
    /// The size in bytes of the groups that need reordering, if any.
    pub fn group_size(&self) -> Option<usize> {
        match self {
            CodeEndianness::LittleSwap16 => Some(2),
            CodeEndianness::LittleSwap32 => Some(4),
            _ => None,
        }
    }
}

/// The immutable description of one architecture.
pub struct ArchDescriptor {
    /// Human-readable name of the architecture.
    pub name: &'static str,
    /// The instruction set identifier.
    pub code: ArchCode,
    /// The byte ordering of code sections.
    pub endianness: CodeEndianness,
    /// Register names, indexed by the register identifiers operands
    /// carry.
    pub reg_names: &'static [&'static str],
    /// Opcode mnemonics, sorted lexicographically. Opcode identifiers
    /// index this table.
    pub opcode_names: &'static [&'static str],
    /// Default annotations per opcode, aligned with `opcode_names`.
    pub opcode_annotations: &'static [Annotations],
    /// Condition names used as mnemonic suffixes.
    pub cond_names: &'static [&'static str],
    /// The minimum instruction length in bits.
    pub insn_minlen: u16,
    /// The maximum instruction length in bits.
    pub insn_maxlen: u16,
}

impl ArchDescriptor {
    /// The name of register `reg`.
    pub fn reg_name(&self, reg: u16) -> &'static str {
        self.reg_names.get(reg as usize).copied().unwrap_or("?reg")
    }

    /// The mnemonic of opcode `opcode`.
    pub fn opcode_name(&self, opcode: u16) -> &'static str {
        if opcode == BAD_OPCODE {
            return "(bad)";
        }
        self.opcode_names
            .get(opcode as usize)
            .copied()
            .unwrap_or("(bad)")
    }

    /// Looks an opcode identifier up by mnemonic. The table is sorted,
    /// so this is a binary search.
    pub fn opcode_lookup(&self, mnemonic: &str) -> Option<u16> {
        self.opcode_names
            .binary_search_by(|probe| (*probe).cmp(mnemonic))
            .ok()
            .map(|i| i as u16)
    }

    /// The default annotations of opcode `opcode`.
    pub fn default_annotations(&self, opcode: u16) -> Annotations {
        self.opcode_annotations
            .get(opcode as usize)
            .copied()
            .unwrap_or_else(Annotations::empty)
    }

    /// The name of condition code `cond`.
    pub fn cond_name(&self, cond: u8) -> &'static str {
        self.cond_names.get(cond as usize).copied().unwrap_or("?")
    }

    /// The maximum instruction length in bytes, rounded up.
    pub fn insn_maxlen_bytes(&self) -> usize {
        ((self.insn_maxlen + 7) / 8) as usize
    }
}

/// The context handed to the interworking probe before each word.
pub struct SwitchProbe<'a> {
    /// The address about to be parsed.
    pub addr: u64,
    /// The instruction set currently driving the parser.
    pub current: ArchCode,
    /// The labels of the section being parsed, sorted by address.
    pub labels: &'a [Label],
}

/// The outcome of an interworking probe requesting an instruction set
/// switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IsaSwitch {
    /// The instruction set to switch to.
    pub code: ArchCode,
    /// The address parsing must resume from. When it differs from the
    /// probed address, instructions emitted after it are rolled back.
    pub reset_addr: u64,
}

/// Comparison operators usable in patch conditions and condition test
/// generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Comparison {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
}

impl Comparison {
    /// The operator testing the opposite outcome.
    pub fn negated(&self) -> Comparison {
        match self {
            Comparison::Equal => Comparison::NotEqual,
            Comparison::NotEqual => Comparison::Equal,
            Comparison::Less => Comparison::GreaterOrEqual,
            Comparison::Greater => Comparison::LessOrEqual,
            Comparison::LessOrEqual => Comparison::Greater,
            Comparison::GreaterOrEqual => Comparison::Less,
        }
    }
}

/// The capability interface of one architecture.
///
/// The engine never calls into architecture-specific code except through
/// this trait, surfaced by the drivers the [`driver_for`] registry
/// hands out.
///
/// [`driver_for`]: fn.driver_for.html
pub trait ArchOps {
    /// The immutable architecture description.
    fn descriptor(&self) -> &ArchDescriptor;

    /// Builds the grammar tables driving the parser for this
    /// architecture.
    fn load_grammar(&self) -> GrammarTables;

    /// Probes for an instruction set switch before parsing at an
    /// address.
    fn switch_isa(&self, probe: &SwitchProbe<'_>) -> Option<IsaSwitch>;

    /// Parses one instruction from its text representation.
    fn parse_insn(&self, text: &str) -> Result<Instruction, ParseError>;

    /// Encodes an instruction back into its binary coding.
    fn encode_insn(&self, insn: &Instruction) -> Result<Coding, EncodeError>;

    /// Generates the architecture's canonical no-operation instruction.
    fn gen_nop(&self) -> Instruction;

    /// Generates the instruction sequence saving the arithmetic flags
    /// around an injected code body.
    fn gen_save_flags(&self) -> Vec<Instruction>;

    /// Generates the counterpart of [`gen_save_flags`].
    ///
    /// [`gen_save_flags`]: #tymethod.gen_save_flags
    fn gen_restore_flags(&self) -> Vec<Instruction>;

    /// Generates a compare-then-branch sequence whose final instruction
    /// branches when `oprnd compare value` is *false*.
    ///
    /// The branch destination is left unresolved; the caller points it
    /// past the code body it guards.
    fn gen_testcond(
        &self,
        oprnd: &Operand,
        compare: Comparison,
        value: i64,
    ) -> Result<Vec<Instruction>, EncodeError>;

    /// Generates an instruction loading the address of an injected
    /// object into a register.
    fn gen_load_address(&self, reg: u16, addr: u64) -> Result<Instruction, EncodeError>;

    /// Generates an unconditional jump to `dest`.
    fn gen_jump(&self, dest: Pointer) -> Instruction;

    /// Generates a call to `dest`.
    fn gen_call(&self, dest: Pointer) -> Instruction;

    /// Builds the branch with the opposite condition of `insn`, if the
    /// instruction is a conditional branch.
    fn opposite_branch(&self, insn: &Instruction) -> Option<Instruction>;
}

/// Looks up the driver of an instruction set.
///
/// Used at engine start and again on every interworking switch.
pub fn driver_for(code: ArchCode) -> Box<dyn ArchOps> {
    match code {
        ArchCode::A64 => Box::new(crate::a64::A64Ops),
        ArchCode::A64c => Box::new(crate::a64::compact::A64cOps),
    }
}
