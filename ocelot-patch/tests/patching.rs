//! End-to-end patching checks over disassembled in-memory images.

use ocelot_asm::a64::A64Opcode;
use ocelot_asm::arch::{ArchCode, ArchOps, Comparison};
use ocelot_asm::binary::{BinaryImage, FileType, SectionAttrs};
use ocelot_asm::disassembler::disassemble;
use ocelot_asm::insn::{Annotations, Coding, Instruction};
use ocelot_asm::operand::{Operand, Pointer, PointerTarget, Role};
use ocelot_asm::AsmFile;
use ocelot_patch::writer::PATCH_CODE_SECTION;
use ocelot_patch::{ModifNext, ModifPos, PatchError, PatchFile, RedirectDest, StackPolicy};

const NOP: [u8; 4] = [0x1F, 0x20, 0x03, 0xD5];

/// Builds a file holding `n` nops at `base`, disassembled.
fn nops_at(base: u64, n: usize) -> AsmFile {
    let mut img = BinaryImage::new("patchee", ArchCode::A64, FileType::Executable);
    let mut bytes = Vec::new();
    for _ in 0..n {
        bytes.extend_from_slice(&NOP);
    }
    img.add_code_section(".text", base, bytes, SectionAttrs::STD_CODE);
    let mut af = AsmFile::new(img);
    disassemble(&mut af).unwrap();
    af
}

fn patch_insns(af: &AsmFile) -> Vec<ocelot_asm::InsnId> {
    let sid = af.image().find_section(PATCH_CODE_SECTION).unwrap();
    af.iter()
        .filter(|id| af.insn(*id).section() == Some(sid))
        .collect()
}

fn opcode(af: &AsmFile, id: ocelot_asm::InsnId) -> A64Opcode {
    A64Opcode::from_id(af.insn(id).opcode())
}

#[test]
fn conditional_insert_before_wraps_the_body() {
    let mut af = nops_at(0x4000, 8);
    let mut pf = PatchFile::new(&af, StackPolicy::Move);
    pf.track_addresses(true);

    let call = af.arch().gen_call(Pointer::absolute(0x9000));
    let m1 = pf
        .insert(&af, 0x4010, ModifPos::Before, vec![call])
        .unwrap();
    let cond = pf.cond_comp(
        Comparison::Equal,
        Operand::reg(5, 64, Role::Source),
        42,
    );
    pf.add_cond(m1, cond).unwrap();

    let out = pf.commit(&mut af).unwrap();

    // The displaced block: flag save, compare, conditional bypass, the
    // call, flag restore, the original instruction, the way back.
    let block = patch_insns(&af);
    let opcodes: Vec<A64Opcode> = block.iter().map(|id| opcode(&af, *id)).collect();
    assert_eq!(
        opcodes,
        vec![
            A64Opcode::Mrs,
            A64Opcode::Str,
            A64Opcode::Cmp,
            A64Opcode::B,
            A64Opcode::Bl,
            A64Opcode::Ldr,
            A64Opcode::Msr,
            A64Opcode::Hint,
            A64Opcode::B,
        ]
    );

    // The conditional branch bypasses exactly the call.
    let cond_branch = af.insn(block[3]);
    assert_eq!(cond_branch.ext().unwrap().cond, Some(1)); // ne
    let bypass_dest = cond_branch
        .branch_pointer()
        .unwrap()
        .get_addr(cond_branch.address());
    assert_eq!(bypass_dest, af.insn(block[5]).address());

    // The anchor site became a jump into the block.
    let anchor = af.insn_at(0x4010).unwrap();
    assert_eq!(opcode(&af, anchor), A64Opcode::B);
    assert!(af.insn(anchor).annotations().has(Annotations::PATCHED));
    assert_eq!(
        af.insn(anchor)
            .branch_pointer()
            .unwrap()
            .get_addr(0x4010),
        af.insn(block[0]).address()
    );

    // The displaced copy is the hint, flagged as moved.
    let copy = af.insn(block[7]);
    assert!(copy.annotations().has(Annotations::PATCH_MOVED));

    // The map records where the original instruction went.
    let map = pf.address_map().unwrap();
    let entry = map.iter().find(|(orig, _)| *orig == 0x4010).unwrap();
    assert_eq!(entry.1, copy.address());
    assert_eq!(entry.1, out.address_map.as_ref().unwrap()[4].1);

    // The way back leads to the anchor's successor.
    let back = af.insn(block[8]);
    assert_eq!(
        back.branch_pointer().unwrap().get_addr(back.address()),
        0x4014
    );

    // Every materialised branch pointer re-derives its address from
    // its target.
    for id in af.iter().collect::<Vec<_>>() {
        let insn = af.insn(id);
        if let Some(ptr) = insn.branch_pointer() {
            if let PointerTarget::Insn(tid) = ptr.target {
                assert_eq!(
                    ptr.get_addr(insn.address()) as i64,
                    af.insn(tid).address() as i64 + ptr.offset_in_target
                );
            }
        }
    }
}

#[test]
fn conditional_insert_emits_the_else_path() {
    let mut af = nops_at(0x4000, 4);
    let mut pf = PatchFile::new(&af, StackPolicy::Move);

    let then_call = af.arch().gen_call(Pointer::absolute(0x9000));
    let else_call = af.arch().gen_call(Pointer::absolute(0x9100));
    let m1 = pf
        .insert(&af, 0x4004, ModifPos::Before, vec![then_call])
        .unwrap();
    let melse = pf.insert_floating(vec![else_call]);
    let cond = pf.cond_comp(Comparison::Equal, Operand::reg(0, 64, Role::Source), 1);
    pf.add_cond(m1, cond).unwrap();
    pf.add_else(m1, melse).unwrap();

    pf.commit(&mut af).unwrap();

    let block = patch_insns(&af);
    let opcodes: Vec<A64Opcode> = block.iter().map(|id| opcode(&af, *id)).collect();
    // save, cmp, b.ne -> else, bl(then), b -> end, bl(else), restore...
    assert_eq!(
        &opcodes[..8],
        &[
            A64Opcode::Mrs,
            A64Opcode::Str,
            A64Opcode::Cmp,
            A64Opcode::B,
            A64Opcode::Bl,
            A64Opcode::B,
            A64Opcode::Bl,
            A64Opcode::Ldr,
        ]
    );

    // The false path lands on the else body.
    let cond_branch = af.insn(block[3]);
    assert_eq!(
        cond_branch
            .branch_pointer()
            .unwrap()
            .get_addr(cond_branch.address()),
        af.insn(block[6]).address()
    );
    // The then path skips it.
    let skip = af.insn(block[5]);
    assert_eq!(
        skip.branch_pointer().unwrap().get_addr(skip.address()),
        af.insn(block[7]).address()
    );
    // The else body is flagged as such.
    assert!(af
        .insn(block[6])
        .annotations()
        .has(Annotations::ELSE_BRANCH));
}

#[test]
fn padding_override_rejection_keeps_the_default() {
    let af = nops_at(0x1000, 2);
    let mut pf = PatchFile::new(&af, StackPolicy::Keep);

    let mut candidate = Instruction::new(A64Opcode::Hint.id(), Vec::new(), ArchCode::A64);
    candidate.set_coding(Coding::new(vec![0; 8], 64));

    assert_eq!(
        pf.set_padding(&af, candidate),
        Err(PatchError::PaddingTooLarge)
    );
    // The session padding is still the 4-byte default.
    assert_eq!(pf.padding().byte_size(), 4);
}

#[test]
fn modif_padding_cannot_be_set_twice() {
    let mut af = nops_at(0x1000, 2);
    let mut pf = PatchFile::new(&af, StackPolicy::Keep);
    let m = pf.delete(&af, 0x1000).unwrap();

    let nop = af.arch().gen_nop();
    pf.set_modif_padding(&af, m, nop.clone()).unwrap();
    assert_eq!(
        pf.set_modif_padding(&af, m, nop),
        Err(PatchError::ModifHasCustomPadding)
    );
    pf.commit(&mut af).unwrap();
}

#[test]
fn delete_pads_in_place() {
    let mut af = nops_at(0x1000, 3);
    let mut pf = PatchFile::new(&af, StackPolicy::Keep);
    pf.delete(&af, 0x1004).unwrap();
    let out = pf.commit(&mut af).unwrap();

    let id = af.insn_at(0x1004).unwrap();
    assert!(af.insn(id).annotations().has(Annotations::PATCH_DELETED));
    // Same byte length, so the section did not grow.
    let text = out.sections.iter().find(|s| s.name == ".text").unwrap();
    assert_eq!(text.bytes.len(), 12);
    assert_eq!(&text.bytes[4..8], &NOP);
}

#[test]
fn conflicting_requests_are_rejected() {
    let af = nops_at(0x1000, 3);
    let mut pf = PatchFile::new(&af, StackPolicy::Keep);
    pf.delete(&af, 0x1004).unwrap();
    assert!(matches!(
        pf.modify(&af, 0x1004, Some(A64Opcode::Ret.id()), None),
        Err(PatchError::ModificationConflict(0x1004))
    ));
    // Unknown anchors are reported as such.
    assert!(matches!(
        pf.delete(&af, 0x1001),
        Err(PatchError::InstructionNotFound(0x1001))
    ));
}

#[test]
fn same_size_modify_preserves_inbound_branches() {
    // b 0x1008 over a nop, then two nops.
    let mut img = BinaryImage::new("patchee", ArchCode::A64, FileType::Executable);
    let mut bytes = vec![0x02, 0x00, 0x00, 0x14];
    bytes.extend_from_slice(&NOP);
    bytes.extend_from_slice(&NOP);
    img.add_code_section(".text", 0x1000, bytes, SectionAttrs::STD_CODE);
    let mut af = AsmFile::new(img);
    disassemble(&mut af).unwrap();

    let mut pf = PatchFile::new(&af, StackPolicy::Keep);
    pf.modify(&af, 0x1008, Some(A64Opcode::Ret.id()), Some(Vec::new()))
        .unwrap();
    let out = pf.commit(&mut af).unwrap();

    let text = out.sections.iter().find(|s| s.name == ".text").unwrap();
    // The branch bytes did not change.
    assert_eq!(&text.bytes[0..4], &[0x02, 0x00, 0x00, 0x14]);
    // The rewritten instruction encodes the new opcode in place.
    assert_eq!(&text.bytes[8..12], &[0xC0, 0x03, 0x5F, 0xD6]);
}

#[test]
fn redirect_to_the_next_instruction_collapses() {
    let mut img = BinaryImage::new("patchee", ArchCode::A64, FileType::Executable);
    let mut bytes = vec![0x02, 0x00, 0x00, 0x14]; // b 0x1008
    bytes.extend_from_slice(&NOP);
    bytes.extend_from_slice(&NOP);
    img.add_code_section(".text", 0x1000, bytes, SectionAttrs::STD_CODE);
    let mut af = AsmFile::new(img);
    disassemble(&mut af).unwrap();

    let next = af.insn_at(0x1004).unwrap();
    let mut pf = PatchFile::new(&af, StackPolicy::Keep);
    pf.redirect_branch(&af, 0x1000, RedirectDest::Insn(next), false)
        .unwrap();
    let out = pf.commit(&mut af).unwrap();

    // The branch became padding.
    let id = af.insn_at(0x1000).unwrap();
    assert_eq!(opcode(&af, id), A64Opcode::Hint);
    let text = out.sections.iter().find(|s| s.name == ".text").unwrap();
    assert_eq!(&text.bytes[0..4], &NOP);
}

#[test]
fn redirect_retargets_the_branch() {
    let mut img = BinaryImage::new("patchee", ArchCode::A64, FileType::Executable);
    let mut bytes = vec![0x02, 0x00, 0x00, 0x14]; // b 0x1008
    bytes.extend_from_slice(&NOP);
    bytes.extend_from_slice(&NOP);
    bytes.extend_from_slice(&NOP);
    img.add_code_section(".text", 0x1000, bytes, SectionAttrs::STD_CODE);
    let mut af = AsmFile::new(img);
    disassemble(&mut af).unwrap();

    let dest = af.insn_at(0x100C).unwrap();
    let mut pf = PatchFile::new(&af, StackPolicy::Keep);
    pf.redirect_branch(&af, 0x1000, RedirectDest::Insn(dest), false)
        .unwrap();
    let out = pf.commit(&mut af).unwrap();

    let branch = af.insn(af.insn_at(0x1000).unwrap());
    assert_eq!(branch.branch_pointer().unwrap().get_addr(0x1000), 0x100C);
    let text = out.sections.iter().find(|s| s.name == ".text").unwrap();
    // b +12 encodes an imm26 of 3.
    assert_eq!(&text.bytes[0..4], &[0x03, 0x00, 0x00, 0x14]);
}

#[test]
fn unreached_floating_modifications_are_detected() {
    let mut af = nops_at(0x1000, 2);
    let mut pf = PatchFile::new(&af, StackPolicy::Keep);
    let nop = af.arch().gen_nop();
    let floating = pf.insert_floating(vec![nop]);
    assert!(matches!(
        pf.commit(&mut af),
        Err(PatchError::UnreachedFloating(id)) if id == floating.0
    ));
}

#[test]
fn chained_floating_modifications_are_emitted_last() {
    let mut af = nops_at(0x1000, 3);
    let mut pf = PatchFile::new(&af, StackPolicy::Keep);

    let call = af.arch().gen_call(Pointer::absolute(0x9000));
    let m1 = pf
        .insert(&af, 0x1004, ModifPos::After, vec![call])
        .unwrap();
    let tail_call = af.arch().gen_call(Pointer::absolute(0x9100));
    let floating = pf.insert_floating(vec![tail_call]);
    pf.set_next(m1, ModifNext::Modif(floating)).unwrap();

    pf.commit(&mut af).unwrap();

    let block = patch_insns(&af);
    let opcodes: Vec<A64Opcode> = block.iter().map(|id| opcode(&af, *id)).collect();
    // anchor copy, body, chain jump, way back, then the floating body.
    assert_eq!(
        opcodes,
        vec![
            A64Opcode::Hint,
            A64Opcode::Bl,
            A64Opcode::B,
            A64Opcode::B,
            A64Opcode::Bl,
        ]
    );
    // The chain jump points at the floating body.
    let chain = af.insn(block[2]);
    assert_eq!(
        chain.branch_pointer().unwrap().get_addr(chain.address()),
        af.insn(block[4]).address()
    );
}

#[test]
fn globalvars_materialise_into_a_data_section() {
    let mut af = nops_at(0x1000, 2);
    let mut pf = PatchFile::new(&af, StackPolicy::Keep);
    let gv = pf.globalvar_new(8, vec![1, 2, 3, 4]);
    let out = pf.commit(&mut af).unwrap();

    let var = pf.globvar(gv).unwrap();
    let addr = var.addr.unwrap();
    assert_eq!(addr % 8, 0);
    assert!(var.data.is_some());
    assert!(var.label.is_some());

    let data = out
        .sections
        .iter()
        .find(|s| s.name == ".ocelot.data")
        .unwrap();
    assert_eq!(&data.bytes[..8], &[1, 2, 3, 4, 0, 0, 0, 0]);
    assert!(af.data_at(addr).is_some());
}

#[test]
fn sessions_commit_once() {
    let mut af = nops_at(0x1000, 2);
    let mut pf = PatchFile::new(&af, StackPolicy::Keep);
    let m = pf.delete(&af, 0x1000).unwrap();

    let planned = pf.precommit(&mut af).unwrap();
    let committed = pf.commit(&mut af).unwrap();
    assert_eq!(planned.sections.len(), committed.sections.len());

    assert!(matches!(
        pf.commit(&mut af),
        Err(PatchError::AlreadyCommitted)
    ));
    // Fixed state cannot be toggled after the commit.
    assert_eq!(pf.set_fixed(m, true), Err(PatchError::ModifFixed(m.0)));
}

#[test]
fn address_map_requires_tracking() {
    let mut af = nops_at(0x1000, 2);
    let mut pf = PatchFile::new(&af, StackPolicy::Keep);
    pf.delete(&af, 0x1000).unwrap();
    pf.commit(&mut af).unwrap();
    assert_eq!(pf.address_map(), Err(PatchError::AddressesNotTracked));
}

#[test]
fn library_bookkeeping() {
    let mut af = nops_at(0x1000, 2);
    let mut pf = PatchFile::new(&af, StackPolicy::Keep);
    pf.lib_add("libfoo.so");
    pf.lib_rename("libfoo.so", "libbar.so").unwrap();
    assert_eq!(
        pf.lib_rename("libmissing.so", "x"),
        Err(PatchError::LibraryNotFound("libmissing.so".to_string()))
    );
    assert_eq!(
        pf.lib_rename("libbar.so", "libbar.so"),
        Err(PatchError::RenameCollision("libbar.so".to_string()))
    );
    pf.extfct_rename("libbar.so", "old_fn", "new_fn").unwrap();

    pf.commit(&mut af).unwrap();
    assert!(af.image().ext_libs.iter().any(|l| l == "libbar.so"));
}
