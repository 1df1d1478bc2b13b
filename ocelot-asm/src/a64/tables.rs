//! Grammar tables for the a64 instruction set.
//!
//! This module plays the role of the code a grammar compiler would emit:
//! it builds the state machine blob the parser runs, together with the
//! semantic actions decoding token values into instruction drafts.

use crate::grammar::{
    GrammarBuilder, GrammarTables, Reduction, SemCtx, ShiftState, SubList, SubTable, SubValue,
};
use crate::insn::InsnExt;
use crate::operand::{Operand, Pointer, Role};

use super::{A64Opcode, REG_SP, REG_XZR};

pub(super) const SYM_INSN: u16 = 1;
pub(super) const SYM_IMM26: u16 = 2;
pub(super) const SYM_IMM19: u16 = 3;
pub(super) const SYM_COND: u16 = 4;
pub(super) const SYM_IMM12: u16 = 5;
pub(super) const SYM_RN: u16 = 6;
pub(super) const SYM_RD: u16 = 7;
pub(super) const SYM_IMM7: u16 = 8;
pub(super) const SYM_SHIFT: u16 = 9;
pub(super) const SYM_RT: u16 = 10;
const N_SYMBOLS: usize = 11;

const SYM_NAMES: [&str; N_SYMBOLS] = [
    "", "INSN", "IMM26", "IMM19", "COND", "IMM12", "RN", "RD", "IMM7", "SHIFT", "RT",
];

/// Maps a 5-bit register field to a register table index, with field 31
/// standing for the stack pointer.
fn reg_or_sp(field: u64) -> u16 {
    if field == 31 {
        REG_SP
    } else {
        field as u16
    }
}

/// Maps a 5-bit register field to a register table index, with field 31
/// standing for the zero register.
fn reg_or_zr(field: u64) -> u16 {
    if field == 31 {
        REG_XZR
    } else {
        field as u16
    }
}

fn act_b(ctx: &mut SemCtx<'_>) {
    ctx.draft.opcode = A64Opcode::B.id();
    let imm = ctx.tok(SYM_IMM26);
    ctx.draft
        .operands
        .push(Operand::ptr(Pointer::relative(imm.signed() * 4)));
}

fn act_bl(ctx: &mut SemCtx<'_>) {
    ctx.draft.opcode = A64Opcode::Bl.id();
    let imm = ctx.tok(SYM_IMM26);
    ctx.draft
        .operands
        .push(Operand::ptr(Pointer::relative(imm.signed() * 4)));
}

fn act_bcond(ctx: &mut SemCtx<'_>) {
    ctx.draft.opcode = A64Opcode::B.id();
    let imm = ctx.tok(SYM_IMM19);
    ctx.draft
        .operands
        .push(Operand::ptr(Pointer::relative(imm.signed() * 4)));
}

/// Final action of conditional branches: the condition nibble lands in
/// the instruction extension.
fn final_cond(ctx: &mut SemCtx<'_>) {
    let cond = ctx.tok(SYM_COND);
    ctx.draft.ext = Some(InsnExt {
        cond: Some(cond.value as u8),
    });
}

fn act_ret(ctx: &mut SemCtx<'_>) {
    ctx.draft.opcode = A64Opcode::Ret.id();
}

fn act_hint(ctx: &mut SemCtx<'_>) {
    ctx.draft.opcode = A64Opcode::Hint.id();
    let imm = ctx.tok(SYM_IMM7);
    if imm.value != 0 {
        ctx.draft.operands.push(Operand::imm(imm.value as i64));
    }
}

fn act_add(ctx: &mut SemCtx<'_>) {
    ctx.draft.opcode = A64Opcode::Add.id();
    let shift = ctx.tok(SYM_SHIFT);
    let imm = ctx.tok(SYM_IMM12);
    let rn = ctx.tok(SYM_RN);
    let rd = ctx.tok(SYM_RD);
    ctx.draft
        .operands
        .push(Operand::reg(reg_or_sp(rd.value), 64, Role::Destination));
    ctx.draft
        .operands
        .push(Operand::reg(reg_or_sp(rn.value), 64, Role::Source));
    ctx.draft
        .operands
        .push(Operand::imm((imm.value as i64) << (12 * shift.value)));
}

fn act_ldr(ctx: &mut SemCtx<'_>) {
    ctx.draft.opcode = A64Opcode::Ldr.id();
    let imm = ctx.tok(SYM_IMM19);
    let rt = ctx.tok(SYM_RT);
    ctx.draft
        .operands
        .push(Operand::reg(reg_or_zr(rt.value), 64, Role::Destination));
    // The raw displacement is anchored after the instruction itself.
    ctx.draft
        .operands
        .push(Operand::mem_relative(imm.signed() * 4 - 4, 64, Role::Source));
}

fn act_cmp(ctx: &mut SemCtx<'_>) {
    ctx.draft.opcode = A64Opcode::Cmp.id();
    let shift = ctx.tok(SYM_SHIFT);
    let imm = ctx.tok(SYM_IMM12);
    let rn = ctx.tok(SYM_RN);
    ctx.draft
        .operands
        .push(Operand::reg(reg_or_sp(rn.value), 64, Role::Source));
    ctx.draft
        .operands
        .push(Operand::imm((imm.value as i64) << (12 * shift.value)));
}

/// Builds the a64 grammar blob.
pub fn grammar() -> GrammarTables {
    let mut g = GrammarBuilder::new(N_SYMBOLS, 32, 32);
    g.sym_names(SYM_NAMES.to_vec());
    let set_cond = g.final_action(final_cond);

    // The start state dispatches on the first byte of the (reordered)
    // word.
    let mut lists: Vec<SubList> = (0..256).map(|_| SubList::no_match()).collect();
    for b in 0x14..=0x17u32 {
        lists[b as usize] = SubList::single(SubValue::state(b, 0xFC, 1, 6));
    }
    for b in 0x94..=0x97u32 {
        lists[b as usize] = SubList::single(SubValue::state(b, 0xFC, 3, 6));
    }
    lists[0x54] = SubList::single(SubValue::state(0x54, 0xFF, 5, 8));
    lists[0xD6] = SubList::single(SubValue::table(
        0xD6,
        0xFF,
        SubTable::single(
            8,
            16,
            SubList::single(SubValue::table(
                0x5F03,
                0xFFFF,
                SubTable::single(24, 8, SubList::single(SubValue::state(0xC0, 0xFF, 9, 32))),
            )),
        ),
    ));
    lists[0xD5] = SubList::single(SubValue::table(
        0xD5,
        0xFF,
        SubTable::single(
            8,
            12,
            SubList::single(SubValue::state(0x032, 0xFFF, 10, 20)),
        ),
    ));
    lists[0x91] = SubList::single(SubValue::state(0x91, 0xFF, 13, 8));
    lists[0x58] = SubList::single(SubValue::state(0x58, 0xFF, 18, 8));
    lists[0xF1] = SubList::single(SubValue::state(0xF1, 0xFF, 21, 8));

    // 0: start
    g.shift(
        ShiftState::new(N_SYMBOLS)
            .table(SubTable::hash(0, 8, lists))
            .var(SYM_INSN, 26),
    );
    // 1-2: b
    g.take_bits(26, 2);
    g.reduce(
        SYM_INSN,
        vec![Reduction::constant(6), Reduction::token(SYM_IMM26, 26)],
        Some(act_b),
        None,
    );
    // 3-4: bl
    g.take_bits(26, 4);
    g.reduce(
        SYM_INSN,
        vec![Reduction::constant(6), Reduction::token(SYM_IMM26, 26)],
        Some(act_bl),
        None,
    );
    // 5-8: b.cond
    g.take_bits(19, 6);
    g.take_bits(1, 7);
    g.take_bits(4, 8);
    g.reduce(
        SYM_INSN,
        vec![
            Reduction::constant(8),
            Reduction::token(SYM_IMM19, 19),
            Reduction::constant(1),
            Reduction::token(SYM_COND, 4),
        ],
        Some(act_bcond),
        Some(set_cond),
    );
    // 9: ret
    g.reduce(
        SYM_INSN,
        vec![Reduction::constant(32)],
        Some(act_ret),
        None,
    );
    // 10-12: hint
    g.take_bits(7, 11);
    g.take_bits(5, 12);
    g.reduce(
        SYM_INSN,
        vec![
            Reduction::constant(20),
            Reduction::token(SYM_IMM7, 7),
            Reduction::constant(5),
        ],
        Some(act_hint),
        None,
    );
    // 13-17: add (immediate form)
    g.take_bits(2, 14);
    g.take_bits(12, 15);
    g.take_bits(5, 16);
    g.take_bits(5, 17);
    g.reduce(
        SYM_INSN,
        vec![
            Reduction::constant(8),
            Reduction::token(SYM_SHIFT, 2),
            Reduction::token(SYM_IMM12, 12),
            Reduction::token(SYM_RN, 5),
            Reduction::token(SYM_RD, 5),
        ],
        Some(act_add),
        None,
    );
    // 18-20: ldr (literal form)
    g.take_bits(19, 19);
    g.take_bits(5, 20);
    g.reduce(
        SYM_INSN,
        vec![
            Reduction::constant(8),
            Reduction::token(SYM_IMM19, 19),
            Reduction::token(SYM_RT, 5),
        ],
        Some(act_ldr),
        None,
    );
    // 21-25: cmp (immediate form)
    g.take_bits(2, 22);
    g.take_bits(12, 23);
    g.take_bits(5, 24);
    g.take_bits(5, 25);
    g.reduce(
        SYM_INSN,
        vec![
            Reduction::constant(8),
            Reduction::token(SYM_SHIFT, 2),
            Reduction::token(SYM_IMM12, 12),
            Reduction::token(SYM_RN, 5),
            Reduction::token(SYM_RD, 5),
        ],
        Some(act_cmp),
        None,
    );
    // 26: done
    g.final_state();

    g.build()
}
