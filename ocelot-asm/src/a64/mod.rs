//! The a64 demonstration architecture.
//!
//! A small AArch64 subset: enough of the instruction set to exercise
//! every engine path (fixed 32-bit words stored little endian, relative
//! branches, conditional branches carrying their condition in the
//! instruction extension, literal loads resolving to data, and the code
//! generation primitives the patcher needs). The [`compact`] module is
//! its 16-bit companion set used for interworking.
//!
//! [`compact`]: compact/index.html

pub mod compact;
mod tables;

use byteorder::{ByteOrder, LittleEndian};
use ocelot_asm_derive::Opcode;

use crate::arch::{
    ArchCode, ArchDescriptor, ArchOps, CodeEndianness, Comparison, IsaSwitch, SwitchProbe,
};
use crate::assembler::{self, ParseError, ParsedInsn, ParsedOperand};
use crate::binary::Label;
use crate::grammar::GrammarTables;
use crate::insn::{Annotations, Coding, InsnExt, Instruction};
use crate::operand::{MemAccess, Operand, OperandFlags, OperandKind, Pointer, Role};
use crate::EncodeError;

/// Register table index of the stack pointer.
pub const REG_SP: u16 = 31;
/// Register table index of the zero register.
pub const REG_XZR: u16 = 32;
/// Register table index of the flags register.
pub const REG_NZCV: u16 = 33;

/// The scratch register the patcher's generated sequences clobber.
const REG_SCRATCH: u16 = 9;

/// The register names of the architecture, indexed by the identifiers
/// operands carry.
pub static A64_REGS: [&str; 34] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "sp", "xzr", "nzcv",
];

/// The condition names, indexed by the condition nibble.
pub static A64_CONDS: [&str; 16] = [
    "eq", "ne", "cs", "cc", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le", "al", "nv",
];

/// The kinds of operation an opcode performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum OpcodeKind {
    Arith,
    Branch,
    Call,
    Compare,
    Load,
    Move,
    Nop,
    Return,
    Store,
    System,
    Bad,
}

/// The instructions of the a64 subset.
///
/// The derive builds the sorted mnemonic table and its binary-search
/// lookup; opcode identifiers are indices into that table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Opcode)]
pub enum A64Opcode {
    /// Add an immediate to a register.
    #[opcode(mnemonic = "add", kind = "Arith")]
    Add,
    /// Branch, optionally under a condition carried by the instruction
    /// extension.
    #[opcode(mnemonic = "b", kind = "Branch")]
    B,
    /// Branch and link.
    #[opcode(mnemonic = "bl", kind = "Call")]
    Bl,
    /// Compare a register with an immediate.
    #[opcode(mnemonic = "cmp", kind = "Compare")]
    Cmp,
    /// The hint space; the canonical no-operation encoding.
    #[opcode(mnemonic = "hint", kind = "Nop")]
    Hint,
    /// Load a register, from a literal pool or with a post-indexed
    /// access.
    #[opcode(mnemonic = "ldr", kind = "Load")]
    Ldr,
    /// Load a 16-bit immediate into a register.
    #[opcode(mnemonic = "mov", kind = "Move")]
    Mov,
    /// Read a system register.
    #[opcode(mnemonic = "mrs", kind = "System")]
    Mrs,
    /// Write a system register.
    #[opcode(mnemonic = "msr", kind = "System")]
    Msr,
    /// Return from a subroutine.
    #[opcode(mnemonic = "ret", kind = "Return")]
    Ret,
    /// Store a register with a pre-indexed access.
    #[opcode(mnemonic = "str", kind = "Store")]
    Str,
    /// An un-decodable instruction.
    Bad,
}

static A64_OPCODE_ANNOTATIONS: [Annotations; A64Opcode::COUNT] =
    [Annotations::NONE; A64Opcode::COUNT];

/// The descriptor of the a64 instruction set.
pub static A64_DESCRIPTOR: ArchDescriptor = ArchDescriptor {
    name: "a64",
    code: ArchCode::A64,
    endianness: CodeEndianness::LittleSwap32,
    reg_names: &A64_REGS,
    opcode_names: &A64Opcode::MNEMONICS,
    opcode_annotations: &A64_OPCODE_ANNOTATIONS,
    cond_names: &A64_CONDS,
    insn_minlen: 32,
    insn_maxlen: 32,
};

/// Splits a mnemonic into its base and condition suffix.
fn split_mnemonic<'a>(mnemonic: &'a str) -> (&'a str, Option<u8>) {
    if let Some(pos) = mnemonic.find('.') {
        let (base, suffix) = (&mnemonic[..pos], &mnemonic[pos + 1..]);
        if let Some(cond) = A64_CONDS.iter().position(|c| *c == suffix) {
            return (base, Some(cond as u8));
        }
    }
    (mnemonic, None)
}

/// Encodes a register table index into a 5-bit register field.
fn reg_field(reg: u16) -> u32 {
    if reg == REG_SP || reg == REG_XZR {
        31
    } else {
        reg as u32
    }
}

fn branch_offset(insn: &Instruction) -> Result<i64, EncodeError> {
    let ptr = insn.branch_pointer().ok_or(EncodeError::UnresolvedPointer)?;
    Ok(ptr.get_addr(insn.address()) as i64 - insn.address() as i64)
}

/// The driver of the a64 instruction set.
pub struct A64Ops;

impl A64Ops {
    fn encode_word(&self, insn: &Instruction) -> Result<u32, EncodeError> {
        let ops = insn.operands();
        let word = match A64Opcode::from_id(insn.opcode()) {
            A64Opcode::Hint => {
                let imm = match ops.first().map(|o| &o.kind) {
                    Some(OperandKind::Immediate(v)) => *v as u32 & 0x7F,
                    _ => 0,
                };
                0xD503_201F | (imm << 5)
            }
            A64Opcode::B => {
                let off = branch_offset(insn)?;
                match insn.ext().and_then(|e| e.cond) {
                    Some(cond) => {
                        let imm19 = ((off >> 2) as u32) & 0x7_FFFF;
                        0x5400_0000 | (imm19 << 5) | cond as u32
                    }
                    None => {
                        let imm26 = ((off >> 2) as u32) & 0x03FF_FFFF;
                        0x1400_0000 | imm26
                    }
                }
            }
            A64Opcode::Bl => {
                let off = branch_offset(insn)?;
                let imm26 = ((off >> 2) as u32) & 0x03FF_FFFF;
                0x9400_0000 | imm26
            }
            A64Opcode::Ret => 0xD65F_03C0,
            A64Opcode::Add => match (ops.get(0), ops.get(1), ops.get(2)) {
                (
                    Some(Operand {
                        kind: OperandKind::Register(rd),
                        ..
                    }),
                    Some(Operand {
                        kind: OperandKind::Register(rn),
                        ..
                    }),
                    Some(Operand {
                        kind: OperandKind::Immediate(v),
                        ..
                    }),
                ) => {
                    let imm12 = (*v as u32) & 0xFFF;
                    0x9100_0000 | (imm12 << 10) | (reg_field(*rn) << 5) | reg_field(*rd)
                }
                _ => return Err(EncodeError::OperandTypeMismatch(0)),
            },
            A64Opcode::Cmp => match (ops.get(0), ops.get(1)) {
                (
                    Some(Operand {
                        kind: OperandKind::Register(rn),
                        ..
                    }),
                    Some(Operand {
                        kind: OperandKind::Immediate(v),
                        ..
                    }),
                ) => {
                    let imm12 = (*v as u32) & 0xFFF;
                    0xF100_001F | (imm12 << 10) | (reg_field(*rn) << 5)
                }
                _ => return Err(EncodeError::OperandTypeMismatch(0)),
            },
            A64Opcode::Ldr => match (ops.get(0), ops.get(1)) {
                (
                    Some(Operand {
                        kind: OperandKind::Register(rt),
                        ..
                    }),
                    Some(Operand {
                        kind: OperandKind::MemRelative(off, _),
                        ..
                    }),
                ) => {
                    let imm19 = (((off + 4) >> 2) as u32) & 0x7_FFFF;
                    0x5800_0000 | (imm19 << 5) | reg_field(*rt)
                }
                (
                    Some(Operand {
                        kind: OperandKind::Register(rt),
                        ..
                    }),
                    Some(Operand {
                        kind: OperandKind::Memory(mem),
                        ..
                    }),
                ) => {
                    // Post-indexed form, used to pop saved state.
                    let base = mem.base.ok_or(EncodeError::OperandTypeMismatch(1))?;
                    let imm9 = (mem.offset as u32) & 0x1FF;
                    0xF840_0400 | (imm9 << 12) | (reg_field(base) << 5) | reg_field(*rt)
                }
                _ => return Err(EncodeError::OperandTypeMismatch(1)),
            },
            A64Opcode::Str => match (ops.get(0), ops.get(1)) {
                (
                    Some(Operand {
                        kind: OperandKind::Register(rt),
                        ..
                    }),
                    Some(Operand {
                        kind: OperandKind::Memory(mem),
                        ..
                    }),
                ) => {
                    // Pre-indexed form, used to push saved state.
                    let base = mem.base.ok_or(EncodeError::OperandTypeMismatch(1))?;
                    let imm9 = (mem.offset as u32) & 0x1FF;
                    0xF800_0C00 | (imm9 << 12) | (reg_field(base) << 5) | reg_field(*rt)
                }
                _ => return Err(EncodeError::OperandTypeMismatch(1)),
            },
            A64Opcode::Mov => match (ops.get(0), ops.get(1)) {
                (
                    Some(Operand {
                        kind: OperandKind::Register(rd),
                        ..
                    }),
                    Some(Operand {
                        kind: OperandKind::Immediate(v),
                        ..
                    }),
                ) => {
                    let imm16 = (*v as u32) & 0xFFFF;
                    0xD280_0000 | (imm16 << 5) | reg_field(*rd)
                }
                _ => return Err(EncodeError::OperandTypeMismatch(0)),
            },
            A64Opcode::Mrs => match ops.get(0) {
                Some(Operand {
                    kind: OperandKind::Register(rt),
                    ..
                }) => 0xD53B_4200 | reg_field(*rt),
                _ => return Err(EncodeError::OperandTypeMismatch(0)),
            },
            A64Opcode::Msr => match ops.get(1) {
                Some(Operand {
                    kind: OperandKind::Register(rt),
                    ..
                }) => 0xD51B_4200 | reg_field(*rt),
                _ => return Err(EncodeError::OperandTypeMismatch(1)),
            },
            A64Opcode::Bad => return Err(EncodeError::UnknownOpcode(insn.opcode())),
        };
        Ok(word)
    }
}

impl ArchOps for A64Ops {
    fn descriptor(&self) -> &ArchDescriptor {
        &A64_DESCRIPTOR
    }

    fn load_grammar(&self) -> GrammarTables {
        tables::grammar()
    }

    fn switch_isa(&self, probe: &SwitchProbe<'_>) -> Option<IsaSwitch> {
        find_marker(probe.labels, "$t", probe.addr, 4).map(|reset_addr| IsaSwitch {
            code: ArchCode::A64c,
            reset_addr,
        })
    }

    fn parse_insn(&self, text: &str) -> Result<Instruction, ParseError> {
        let parsed = assembler::parse_line(&A64_DESCRIPTOR, text)?;
        let (base, cond) = split_mnemonic(&parsed.mnemonic);
        let opcode =
            A64Opcode::from_mnemonic(base).ok_or_else(|| ParseError::unknown_mnemonic(base))?;
        let address = parsed.address.unwrap_or(0);

        let mut insn = build_insn(opcode, &parsed, address)?;
        insn.set_address(address);
        if let Some(cond) = cond {
            if opcode != A64Opcode::B {
                return Err(ParseError::new("condition suffix on a non-branch"));
            }
            insn.set_ext(InsnExt { cond: Some(cond) });
        }
        Ok(insn)
    }

    fn encode_insn(&self, insn: &Instruction) -> Result<Coding, EncodeError> {
        let word = self.encode_word(insn)?;
        let mut bytes = vec![0u8; 4];
        LittleEndian::write_u32(&mut bytes, word);
        Ok(Coding::new(bytes, 32))
    }

    fn gen_nop(&self) -> Instruction {
        let mut insn = Instruction::new(A64Opcode::Hint.id(), Vec::new(), ArchCode::A64);
        if let Ok(coding) = self.encode_insn(&insn) {
            insn.set_coding(coding);
        }
        insn
    }

    fn gen_save_flags(&self) -> Vec<Instruction> {
        let mrs = Instruction::new(
            A64Opcode::Mrs.id(),
            vec![
                Operand::reg(REG_SCRATCH, 64, Role::Destination),
                Operand::reg(REG_NZCV, 64, Role::Source),
            ],
            ArchCode::A64,
        );
        let mut push_op = Operand::mem(
            MemAccess {
                base: Some(REG_SP),
                index: None,
                offset: -16,
                scale: 1,
                ext: None,
            },
            64,
            Role::Destination,
        );
        push_op.flags = push_op.flags.with(OperandFlags::WRITE_BACK);
        let push = Instruction::new(
            A64Opcode::Str.id(),
            vec![Operand::reg(REG_SCRATCH, 64, Role::Source), push_op],
            ArchCode::A64,
        );
        self.seal(vec![mrs, push])
    }

    fn gen_restore_flags(&self) -> Vec<Instruction> {
        let mut pop_op = Operand::mem(
            MemAccess {
                base: Some(REG_SP),
                index: None,
                offset: 16,
                scale: 1,
                ext: None,
            },
            64,
            Role::Source,
        );
        pop_op.flags = pop_op.flags.with(OperandFlags::POST_INDEXED);
        let pop = Instruction::new(
            A64Opcode::Ldr.id(),
            vec![Operand::reg(REG_SCRATCH, 64, Role::Destination), pop_op],
            ArchCode::A64,
        );
        let msr = Instruction::new(
            A64Opcode::Msr.id(),
            vec![
                Operand::reg(REG_NZCV, 64, Role::Destination),
                Operand::reg(REG_SCRATCH, 64, Role::Source),
            ],
            ArchCode::A64,
        );
        self.seal(vec![pop, msr])
    }

    fn gen_testcond(
        &self,
        oprnd: &Operand,
        compare: Comparison,
        value: i64,
    ) -> Result<Vec<Instruction>, EncodeError> {
        let reg = match &oprnd.kind {
            OperandKind::Register(r) => *r,
            _ => return Err(EncodeError::OperandTypeMismatch(0)),
        };
        let cmp = Instruction::new(
            A64Opcode::Cmp.id(),
            vec![Operand::reg(reg, 64, Role::Source), Operand::imm(value)],
            ArchCode::A64,
        );
        // The emitted branch bypasses the guarded body, so it takes the
        // negated condition.
        let mut branch = Instruction::new(
            A64Opcode::B.id(),
            vec![Operand::ptr(Pointer::relative(0))],
            ArchCode::A64,
        );
        branch.set_ext(InsnExt {
            cond: Some(cond_code(compare.negated())),
        });
        Ok(self.seal(vec![cmp, branch]))
    }

    fn gen_load_address(&self, reg: u16, addr: u64) -> Result<Instruction, EncodeError> {
        let mut insn = Instruction::new(
            A64Opcode::Mov.id(),
            vec![
                Operand::reg(reg, 64, Role::Destination),
                Operand::imm(addr as i64),
            ],
            ArchCode::A64,
        );
        let coding = self.encode_insn(&insn)?;
        insn.set_coding(coding);
        Ok(insn)
    }

    fn gen_jump(&self, dest: Pointer) -> Instruction {
        let mut insn = Instruction::new(
            A64Opcode::B.id(),
            vec![Operand::ptr(dest)],
            ArchCode::A64,
        );
        if let Ok(coding) = self.encode_insn(&insn) {
            insn.set_coding(coding);
        }
        insn
    }

    fn gen_call(&self, dest: Pointer) -> Instruction {
        let mut insn = Instruction::new(
            A64Opcode::Bl.id(),
            vec![Operand::ptr(dest)],
            ArchCode::A64,
        );
        if let Ok(coding) = self.encode_insn(&insn) {
            insn.set_coding(coding);
        }
        insn
    }

    fn opposite_branch(&self, insn: &Instruction) -> Option<Instruction> {
        if A64Opcode::from_id(insn.opcode()) != A64Opcode::B {
            return None;
        }
        let cond = insn.ext().and_then(|e| e.cond)?;
        if cond >= 14 {
            // `al` and `nv` have no meaningful opposite.
            return None;
        }
        let mut out = insn.clone();
        out.set_ext(InsnExt {
            // The low bit of the condition nibble inverts its meaning.
            cond: Some(cond ^ 1),
        });
        if let Ok(coding) = self.encode_insn(&out) {
            out.set_coding(coding);
        }
        Some(out)
    }
}

impl A64Ops {
    /// Stamps the codings of generated instructions.
    fn seal(&self, mut insns: Vec<Instruction>) -> Vec<Instruction> {
        for insn in &mut insns {
            if insn.coding().is_none() {
                if let Ok(coding) = self.encode_insn(insn) {
                    insn.set_coding(coding);
                }
            }
        }
        insns
    }
}

/// Maps a comparison operator to the condition nibble testing it after a
/// compare instruction.
fn cond_code(compare: Comparison) -> u8 {
    match compare {
        Comparison::Equal => 0,
        Comparison::NotEqual => 1,
        Comparison::GreaterOrEqual => 10,
        Comparison::Less => 11,
        Comparison::Greater => 12,
        Comparison::LessOrEqual => 13,
    }
}

/// Finds an interworking marker label: either exactly at the probed
/// address, or inside the word that was just decoded over it, in which
/// case parsing rewinds to the marker.
fn find_marker(labels: &[Label], name: &str, addr: u64, word_bytes: u64) -> Option<u64> {
    labels
        .iter()
        .filter(|l| l.name == name)
        .map(|l| l.addr)
        .find(|a| *a == addr || (*a > addr.saturating_sub(word_bytes) && *a < addr))
}

fn build_insn(
    opcode: A64Opcode,
    parsed: &ParsedInsn,
    address: u64,
) -> Result<Instruction, ParseError> {
    let ops = &parsed.operands;
    let insn = match opcode {
        A64Opcode::Hint => {
            let operands = match ops.first() {
                Some(ParsedOperand::Imm(v)) => vec![Operand::imm(*v)],
                None => Vec::new(),
                _ => return Err(ParseError::new("hint takes an immediate")),
            };
            Instruction::new(opcode.id(), operands, ArchCode::A64)
        }
        A64Opcode::B | A64Opcode::Bl => match ops.first() {
            Some(ParsedOperand::Addr(dest)) => Instruction::new(
                opcode.id(),
                vec![Operand::ptr(Pointer::absolute(*dest))],
                ArchCode::A64,
            ),
            _ => return Err(ParseError::new("branch needs a destination address")),
        },
        A64Opcode::Ret => Instruction::new(opcode.id(), Vec::new(), ArchCode::A64),
        A64Opcode::Add => match (ops.get(0), ops.get(1), ops.get(2)) {
            (
                Some(ParsedOperand::Reg(rd)),
                Some(ParsedOperand::Reg(rn)),
                Some(ParsedOperand::Imm(v)),
            ) => Instruction::new(
                opcode.id(),
                vec![
                    Operand::reg(*rd, 64, Role::Destination),
                    Operand::reg(*rn, 64, Role::Source),
                    Operand::imm(*v),
                ],
                ArchCode::A64,
            ),
            _ => return Err(ParseError::new("add takes rd, rn, #imm")),
        },
        A64Opcode::Cmp => match (ops.get(0), ops.get(1)) {
            (Some(ParsedOperand::Reg(rn)), Some(ParsedOperand::Imm(v))) => Instruction::new(
                opcode.id(),
                vec![Operand::reg(*rn, 64, Role::Source), Operand::imm(*v)],
                ArchCode::A64,
            ),
            _ => return Err(ParseError::new("cmp takes rn, #imm")),
        },
        A64Opcode::Ldr => match (ops.get(0), ops.get(1)) {
            (Some(ParsedOperand::Reg(rt)), Some(ParsedOperand::Addr(dest))) => {
                // Literal form: re-anchor the displacement on the
                // instruction's own end.
                let off = *dest as i64 - address as i64 - 4;
                Instruction::new(
                    opcode.id(),
                    vec![
                        Operand::reg(*rt, 64, Role::Destination),
                        Operand::mem_relative(off, 64, Role::Source),
                    ],
                    ArchCode::A64,
                )
            }
            (
                Some(ParsedOperand::Reg(rt)),
                Some(ParsedOperand::Mem {
                    base,
                    offset,
                    post: true,
                    ..
                }),
            ) => {
                let mut mem = Operand::mem(
                    MemAccess {
                        base: Some(*base),
                        index: None,
                        offset: *offset,
                        scale: 1,
                        ext: None,
                    },
                    64,
                    Role::Source,
                );
                mem.flags = mem.flags.with(OperandFlags::POST_INDEXED);
                Instruction::new(
                    opcode.id(),
                    vec![Operand::reg(*rt, 64, Role::Destination), mem],
                    ArchCode::A64,
                )
            }
            _ => return Err(ParseError::new("ldr takes rt and a source")),
        },
        A64Opcode::Str => match (ops.get(0), ops.get(1)) {
            (
                Some(ParsedOperand::Reg(rt)),
                Some(ParsedOperand::Mem {
                    base,
                    offset,
                    writeback,
                    ..
                }),
            ) => {
                let mut mem = Operand::mem(
                    MemAccess {
                        base: Some(*base),
                        index: None,
                        offset: *offset,
                        scale: 1,
                        ext: None,
                    },
                    64,
                    Role::Destination,
                );
                if *writeback {
                    mem.flags = mem.flags.with(OperandFlags::WRITE_BACK);
                }
                Instruction::new(
                    opcode.id(),
                    vec![Operand::reg(*rt, 64, Role::Source), mem],
                    ArchCode::A64,
                )
            }
            _ => return Err(ParseError::new("str takes rt and a memory operand")),
        },
        A64Opcode::Mov => match (ops.get(0), ops.get(1)) {
            (Some(ParsedOperand::Reg(rd)), Some(ParsedOperand::Imm(v))) => Instruction::new(
                opcode.id(),
                vec![Operand::reg(*rd, 64, Role::Destination), Operand::imm(*v)],
                ArchCode::A64,
            ),
            _ => return Err(ParseError::new("mov takes rd, #imm")),
        },
        A64Opcode::Mrs => match (ops.get(0), ops.get(1)) {
            (Some(ParsedOperand::Reg(rd)), Some(ParsedOperand::Reg(sys))) => Instruction::new(
                opcode.id(),
                vec![
                    Operand::reg(*rd, 64, Role::Destination),
                    Operand::reg(*sys, 64, Role::Source),
                ],
                ArchCode::A64,
            ),
            _ => return Err(ParseError::new("mrs takes rd and a system register")),
        },
        A64Opcode::Msr => match (ops.get(0), ops.get(1)) {
            (Some(ParsedOperand::Reg(sys)), Some(ParsedOperand::Reg(rn))) => Instruction::new(
                opcode.id(),
                vec![
                    Operand::reg(*sys, 64, Role::Destination),
                    Operand::reg(*rn, 64, Role::Source),
                ],
                ArchCode::A64,
            ),
            _ => return Err(ParseError::new("msr takes a system register and rn")),
        },
        A64Opcode::Bad => return Err(ParseError::unknown_mnemonic(&parsed.mnemonic)),
    };
    Ok(insn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::Parser;

    fn decode(bytes: &[u8]) -> Instruction {
        // The disassembler hands the parser pre-reordered bytes; tests
        // do the 32-bit swap by hand.
        let mut swapped = bytes.to_vec();
        for chunk in swapped.chunks_mut(4) {
            chunk.reverse();
        }
        let mut parser = Parser::new(A64Ops.load_grammar());
        parser.set_stream(swapped, 0x1000);
        let draft = parser.parse_word().expect("word must decode");
        let mut insn = Instruction::new(draft.opcode, draft.operands, ArchCode::A64);
        if let Some(ext) = draft.ext {
            insn.set_ext(ext);
        }
        insn.set_address(0x1000);
        insn.set_coding(Coding::new(bytes.to_vec(), 32));
        insn
    }

    #[test]
    fn decodes_the_canonical_nop() {
        let insn = decode(&[0x1F, 0x20, 0x03, 0xD5]);
        assert_eq!(A64Opcode::from_id(insn.opcode()), A64Opcode::Hint);
        assert!(insn.operands().is_empty());
    }

    #[test]
    fn decodes_a_relative_branch() {
        // b +8
        let insn = decode(&[0x02, 0x00, 0x00, 0x14]);
        assert_eq!(A64Opcode::from_id(insn.opcode()), A64Opcode::B);
        let ptr = insn.branch_pointer().unwrap();
        assert_eq!(ptr.get_addr(0x1000), 0x1008);
    }

    #[test]
    fn decodes_a_conditional_branch() {
        // b.ne +8
        let insn = decode(&[0x41, 0x00, 0x00, 0x54]);
        assert_eq!(A64Opcode::from_id(insn.opcode()), A64Opcode::B);
        assert_eq!(insn.ext().unwrap().cond, Some(1));
        assert_eq!(insn.branch_pointer().unwrap().get_addr(0x1000), 0x1008);
    }

    #[test]
    fn decodes_ret_add_ldr_cmp() {
        let ret = decode(&[0xC0, 0x03, 0x5F, 0xD6]);
        assert_eq!(A64Opcode::from_id(ret.opcode()), A64Opcode::Ret);

        // add x0, x1, #0x2a
        let add = decode(&[0x20, 0xA8, 0x00, 0x91]);
        assert_eq!(A64Opcode::from_id(add.opcode()), A64Opcode::Add);
        assert_eq!(
            add.display(&A64_DESCRIPTOR).to_string(),
            "add x0, x1, #0x2a"
        );

        // ldr x0, 0x1018
        let ldr = decode(&[0xC0, 0x00, 0x00, 0x58]);
        assert_eq!(A64Opcode::from_id(ldr.opcode()), A64Opcode::Ldr);
        assert_eq!(ldr.display(&A64_DESCRIPTOR).to_string(), "ldr x0, 0x1018");

        // cmp x5, #42
        let cmp = decode(&[0xBF, 0xA8, 0x00, 0xF1]);
        assert_eq!(A64Opcode::from_id(cmp.opcode()), A64Opcode::Cmp);
        assert_eq!(cmp.display(&A64_DESCRIPTOR).to_string(), "cmp x5, #0x2a");
    }

    #[test]
    fn decode_encode_round_trips() {
        for bytes in &[
            [0x1F, 0x20, 0x03, 0xD5],
            [0x02, 0x00, 0x00, 0x14],
            [0x41, 0x00, 0x00, 0x54],
            [0xC0, 0x03, 0x5F, 0xD6],
            [0x20, 0xA8, 0x00, 0x91],
            [0xC0, 0x00, 0x00, 0x58],
        ] {
            let insn = decode(bytes);
            let coding = A64Ops.encode_insn(&insn).expect("encodable");
            assert_eq!(coding.bytes(), &bytes[..], "{:?}", insn);
        }
    }

    #[test]
    fn parse_print_round_trips() {
        let insn = decode(&[0x20, 0xA8, 0x00, 0x91]);
        let text = format!("{}", insn.display(&A64_DESCRIPTOR));
        let reparsed = A64Ops.parse_insn(&text).unwrap();
        assert!(insn.equal(&reparsed));
    }

    #[test]
    fn generated_sequences_have_codings() {
        for insn in A64Ops
            .gen_save_flags()
            .into_iter()
            .chain(A64Ops.gen_restore_flags())
        {
            assert!(insn.coding().is_some(), "{:?}", insn);
        }
    }

    #[test]
    fn opposite_branch_flips_the_condition() {
        let insn = decode(&[0x41, 0x00, 0x00, 0x54]);
        let opp = A64Ops.opposite_branch(&insn).unwrap();
        assert_eq!(opp.ext().unwrap().cond, Some(0));
        assert!(A64Ops.opposite_branch(&opp.clone()).unwrap().equal(&insn));
    }
}
