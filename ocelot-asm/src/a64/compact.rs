//! The compact 16-bit companion instruction set.
//!
//! Binaries may interleave regions encoded with this narrow set into
//! regular a64 code, flagged by `$t` / `$a` marker labels. Only the
//! decoding surface matters here: the patcher always generates regular
//! a64 code.

use byteorder::{ByteOrder, LittleEndian};
use ocelot_asm_derive::Opcode;

use crate::arch::{
    ArchCode, ArchDescriptor, ArchOps, CodeEndianness, Comparison, IsaSwitch, SwitchProbe,
};
use crate::assembler::{self, ParseError, ParsedOperand};
use crate::binary::Label;
use crate::grammar::{
    GrammarBuilder, GrammarTables, Reduction, SemCtx, ShiftState, SubList, SubTable, SubValue,
};
use crate::insn::{Annotations, Coding, Instruction};
use crate::operand::{Operand, Pointer};
use crate::EncodeError;

use super::{OpcodeKind, A64_CONDS, A64_REGS};

const SYM_INSN: u16 = 1;
const SYM_IMM11: u16 = 2;
const N_SYMBOLS: usize = 3;

/// The instructions of the compact set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Opcode)]
pub enum A64cOpcode {
    /// Branch with an 11-bit halfword offset.
    #[opcode(mnemonic = "b", kind = "Branch")]
    B,
    /// No operation.
    #[opcode(mnemonic = "nop", kind = "Nop")]
    Nop,
    /// An un-decodable instruction.
    Bad,
}

static A64C_OPCODE_ANNOTATIONS: [Annotations; A64cOpcode::COUNT] =
    [Annotations::NONE; A64cOpcode::COUNT];

/// The descriptor of the compact instruction set.
pub static A64C_DESCRIPTOR: ArchDescriptor = ArchDescriptor {
    name: "a64c",
    code: ArchCode::A64c,
    endianness: CodeEndianness::LittleSwap16,
    reg_names: &A64_REGS,
    opcode_names: &A64cOpcode::MNEMONICS,
    opcode_annotations: &A64C_OPCODE_ANNOTATIONS,
    cond_names: &A64_CONDS,
    insn_minlen: 16,
    insn_maxlen: 16,
};

fn act_nop(ctx: &mut SemCtx<'_>) {
    ctx.draft.opcode = A64cOpcode::Nop.id();
}

fn act_b(ctx: &mut SemCtx<'_>) {
    ctx.draft.opcode = A64cOpcode::B.id();
    let imm = ctx.tok(SYM_IMM11);
    ctx.draft
        .operands
        .push(Operand::ptr(Pointer::relative(imm.signed() * 2)));
}

fn grammar() -> GrammarTables {
    let mut g = GrammarBuilder::new(N_SYMBOLS, 16, 16);
    g.sym_names(vec!["", "INSN", "IMM11"]);

    let mut lists: Vec<SubList> = (0..256).map(|_| SubList::no_match()).collect();
    lists[0xBF] = SubList::single(SubValue::table(
        0xBF,
        0xFF,
        SubTable::single(8, 8, SubList::single(SubValue::state(0x00, 0xFF, 1, 16))),
    ));
    for b in 0xE0..=0xE7u32 {
        lists[b as usize] = SubList::single(SubValue::state(b, 0xF8, 2, 5));
    }

    // 0: start
    g.shift(
        ShiftState::new(N_SYMBOLS)
            .table(SubTable::hash(0, 8, lists))
            .var(SYM_INSN, 4),
    );
    // 1: nop
    g.reduce(
        SYM_INSN,
        vec![Reduction::constant(16)],
        Some(act_nop),
        None,
    );
    // 2-3: branch
    g.take_bits(11, 3);
    g.reduce(
        SYM_INSN,
        vec![Reduction::constant(5), Reduction::token(SYM_IMM11, 11)],
        Some(act_b),
        None,
    );
    // 4: done
    g.final_state();

    g.build()
}

/// The driver of the compact instruction set.
pub struct A64cOps;

impl ArchOps for A64cOps {
    fn descriptor(&self) -> &ArchDescriptor {
        &A64C_DESCRIPTOR
    }

    fn load_grammar(&self) -> GrammarTables {
        grammar()
    }

    fn switch_isa(&self, probe: &SwitchProbe<'_>) -> Option<IsaSwitch> {
        find_marker(probe.labels, "$a", probe.addr, 2).map(|reset_addr| IsaSwitch {
            code: ArchCode::A64,
            reset_addr,
        })
    }

    fn parse_insn(&self, text: &str) -> Result<Instruction, ParseError> {
        let parsed = assembler::parse_line(&A64C_DESCRIPTOR, text)?;
        let opcode = A64cOpcode::from_mnemonic(&parsed.mnemonic)
            .ok_or_else(|| ParseError::unknown_mnemonic(&parsed.mnemonic))?;
        let insn = match opcode {
            A64cOpcode::Nop => Instruction::new(opcode.id(), Vec::new(), ArchCode::A64c),
            A64cOpcode::B => match parsed.operands.first() {
                Some(ParsedOperand::Addr(dest)) => Instruction::new(
                    opcode.id(),
                    vec![Operand::ptr(Pointer::absolute(*dest))],
                    ArchCode::A64c,
                ),
                _ => return Err(ParseError::new("branch needs a destination address")),
            },
            A64cOpcode::Bad => return Err(ParseError::unknown_mnemonic(&parsed.mnemonic)),
        };
        Ok(insn)
    }

    fn encode_insn(&self, insn: &Instruction) -> Result<Coding, EncodeError> {
        let half = match A64cOpcode::from_id(insn.opcode()) {
            A64cOpcode::Nop => 0xBF00,
            A64cOpcode::B => {
                let ptr = insn
                    .branch_pointer()
                    .ok_or(EncodeError::UnresolvedPointer)?;
                let off = ptr.get_addr(insn.address()) as i64 - insn.address() as i64;
                let imm11 = ((off >> 1) as u16) & 0x7FF;
                0xE000 | imm11
            }
            A64cOpcode::Bad => return Err(EncodeError::UnknownOpcode(insn.opcode())),
        };
        let mut bytes = vec![0u8; 2];
        LittleEndian::write_u16(&mut bytes, half);
        Ok(Coding::new(bytes, 16))
    }

    fn gen_nop(&self) -> Instruction {
        let mut insn = Instruction::new(A64cOpcode::Nop.id(), Vec::new(), ArchCode::A64c);
        if let Ok(coding) = self.encode_insn(&insn) {
            insn.set_coding(coding);
        }
        insn
    }

    fn gen_save_flags(&self) -> Vec<Instruction> {
        Vec::new()
    }

    fn gen_restore_flags(&self) -> Vec<Instruction> {
        Vec::new()
    }

    fn gen_testcond(
        &self,
        _oprnd: &Operand,
        _compare: Comparison,
        _value: i64,
    ) -> Result<Vec<Instruction>, EncodeError> {
        // Patch code is always generated in the regular instruction set.
        Err(EncodeError::UnknownOpcode(A64cOpcode::Bad.id()))
    }

    fn gen_load_address(&self, _reg: u16, _addr: u64) -> Result<Instruction, EncodeError> {
        Err(EncodeError::UnknownOpcode(A64cOpcode::Bad.id()))
    }

    fn gen_jump(&self, dest: Pointer) -> Instruction {
        let mut insn = Instruction::new(
            A64cOpcode::B.id(),
            vec![Operand::ptr(dest)],
            ArchCode::A64c,
        );
        if let Ok(coding) = self.encode_insn(&insn) {
            insn.set_coding(coding);
        }
        insn
    }

    fn gen_call(&self, dest: Pointer) -> Instruction {
        self.gen_jump(dest)
    }

    fn opposite_branch(&self, _insn: &Instruction) -> Option<Instruction> {
        None
    }
}

fn find_marker(labels: &[Label], name: &str, addr: u64, word_bytes: u64) -> Option<u64> {
    labels
        .iter()
        .filter(|l| l.name == name)
        .map(|l| l.addr)
        .find(|a| *a == addr || (*a > addr.saturating_sub(word_bytes) && *a < addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::Parser;

    #[test]
    fn decodes_compact_words() {
        // nop; b +4 (stream bytes already reordered to match order)
        let mut parser = Parser::new(A64cOps.load_grammar());
        parser.set_stream(vec![0xBF, 0x00, 0xE0, 0x02], 0x5000);

        let nop = parser.parse_word().unwrap();
        assert_eq!(A64cOpcode::from_id(nop.opcode), A64cOpcode::Nop);

        let b = parser.parse_word().unwrap();
        assert_eq!(A64cOpcode::from_id(b.opcode), A64cOpcode::B);
        match &b.operands[0].kind {
            crate::operand::OperandKind::Pointer(p) => assert_eq!(p.get_addr(0x5002), 0x5006),
            other => panic!("unexpected operand {:?}", other),
        }
    }

    #[test]
    fn encode_round_trips() {
        let nop = A64cOps.gen_nop();
        assert_eq!(nop.coding().unwrap().bytes(), &[0x00, 0xBF]);

        let mut b = Instruction::new(
            A64cOpcode::B.id(),
            vec![Operand::ptr(Pointer::relative(8))],
            ArchCode::A64c,
        );
        b.set_address(0x5000);
        let coding = A64cOps.encode_insn(&b).unwrap();
        assert_eq!(coding.bytes(), &[0x04, 0xE0]);
    }

    #[test]
    fn unused_kind_queries_stay_consistent() {
        assert_eq!(A64cOpcode::B.kind(), OpcodeKind::Branch);
        assert_eq!(A64cOpcode::Nop.kind(), OpcodeKind::Nop);
        assert!(A64cOpcode::Bad.is_bad());
    }
}
