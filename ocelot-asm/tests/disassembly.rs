//! End-to-end disassembly checks over in-memory binary images.

use ocelot_asm::a64::{A64Opcode, A64_DESCRIPTOR};
use ocelot_asm::arch::{ArchCode, ArchOps};
use ocelot_asm::binary::{BinaryImage, FileType, LabelKind, SectionAttrs};
use ocelot_asm::disassembler::disassemble;
use ocelot_asm::insn::Annotations;
use ocelot_asm::operand::{OperandKind, PointerTarget};
use ocelot_asm::AsmFile;

fn image() -> BinaryImage {
    BinaryImage::new("test.bin", ArchCode::A64, FileType::Executable)
}

#[test]
fn nop_round_trip() {
    let mut img = image();
    img.add_code_section(
        ".text",
        0x1000,
        vec![0x1F, 0x20, 0x03, 0xD5],
        SectionAttrs::STD_CODE,
    );
    let mut af = AsmFile::new(img);
    let report = disassemble(&mut af).unwrap();
    assert_eq!(report.parse_errors, 0);

    let id = af.head().unwrap();
    let insn = af.insn(id);
    assert_eq!(A64Opcode::from_id(insn.opcode()), A64Opcode::Hint);
    assert_eq!(insn.address(), 0x1000);
    assert_eq!(insn.byte_size(), 4);
    assert!(insn.operands().is_empty());
    assert!(insn.annotations().has(Annotations::STD_CODE));

    let line = af.print_insn(id);
    assert_eq!(line, "1000:\t1f 20 03 d5\thint");

    // Reparsing the printed line yields an equal instruction.
    let reparsed = af.arch().parse_insn(&line).unwrap();
    assert!(af.insn(id).equal(&reparsed));
}

#[test]
fn addresses_are_contiguous_within_a_section() {
    let mut img = image();
    // Four nops in a row.
    let nop = [0x1F, 0x20, 0x03, 0xD5];
    let mut bytes = Vec::new();
    for _ in 0..4 {
        bytes.extend_from_slice(&nop);
    }
    img.add_code_section(".text", 0x1000, bytes, SectionAttrs::STD_CODE);
    let mut af = AsmFile::new(img);
    disassemble(&mut af).unwrap();

    let ids: Vec<_> = af.iter().collect();
    assert_eq!(ids.len(), 4);
    for pair in ids.windows(2) {
        let a = af.insn(pair[0]);
        let b = af.insn(pair[1]);
        assert_eq!(a.address() + a.byte_size() as u64, b.address());
    }
    // Section bounds hold for every decoded instruction.
    for id in &ids {
        let addr = af.insn(*id).address();
        assert!(addr >= 0x1000 && addr < 0x1010);
    }
}

#[test]
fn cross_label_resync() {
    // A valid word at 0x2000, junk at 0x2004 overlapping the function
    // label at 0x2006, then a valid word at 0x2006.
    let mut img = image();
    let mut bytes = vec![0x1F, 0x20, 0x03, 0xD5];
    bytes.extend_from_slice(&[0xAA, 0xBB]);
    bytes.extend_from_slice(&[0x1F, 0x20, 0x03, 0xD5]);
    img.add_code_section(".text", 0x2000, bytes, SectionAttrs::STD_CODE);
    img.add_label("foo", 0x2006, LabelKind::Function);

    let mut af = AsmFile::new(img);
    disassemble(&mut af).unwrap();

    let ids: Vec<_> = af.iter().collect();
    assert_eq!(ids.len(), 3);

    // The word that overlapped the boundary was truncated and marked
    // un-decodable.
    let overlap = af.insn(ids[1]);
    assert!(overlap.is_bad());
    assert_eq!(overlap.address(), 0x2004);
    assert_eq!(overlap.byte_size(), 2);

    // Parsing resumed at the label.
    let resumed = af.insn(ids[2]);
    assert_eq!(resumed.address(), 0x2006);
    assert_eq!(A64Opcode::from_id(resumed.opcode()), A64Opcode::Hint);
    assert_eq!(
        resumed.fct_label().map(|l| af.label(l).name.as_str()),
        Some("foo")
    );
}

#[test]
fn memory_relative_operand_binds_to_a_variable() {
    // ldr x0, 0x301c with var_x defined at 0x301c.
    let mut img = image();
    img.add_code_section(
        ".text",
        0x3000,
        vec![0xE0, 0x00, 0x00, 0x58],
        SectionAttrs::STD_CODE,
    );
    img.add_label("var_x", 0x301C, LabelKind::Variable);

    let mut af = AsmFile::new(img);
    disassemble(&mut af).unwrap();

    let id = af.head().unwrap();
    let insn = af.insn(id);
    let op = &insn.operands()[1];
    let did = match &op.kind {
        OperandKind::MemRelative(_, ptr) => match ptr.target {
            PointerTarget::Data(did) => did,
            other => panic!("pointer target is {:?}", other),
        },
        other => panic!("operand is {:?}", other),
    };
    assert_eq!(af.data(did).addr, 0x301C);
    assert_eq!(af.data_ref_of(id), Some(did));
    assert_eq!(af.insns_referencing(did), &[id]);

    let line = af.print_insn(id);
    assert!(line.ends_with("# 0x301c <var_x>"), "line was {:?}", line);
}

#[test]
fn branch_targets_resolve_across_the_section() {
    // b +8 at 0x4000 jumping over a nop to the nop at 0x4008.
    let mut img = image();
    let mut bytes = vec![0x02, 0x00, 0x00, 0x14];
    bytes.extend_from_slice(&[0x1F, 0x20, 0x03, 0xD5]);
    bytes.extend_from_slice(&[0x1F, 0x20, 0x03, 0xD5]);
    img.add_code_section(".text", 0x4000, bytes, SectionAttrs::STD_CODE);

    let mut af = AsmFile::new(img);
    disassemble(&mut af).unwrap();

    let ids: Vec<_> = af.iter().collect();
    let branch = af.insn(ids[0]);
    let ptr = branch.branch_pointer().unwrap();
    assert_eq!(ptr.get_addr(branch.address()), 0x4008);
    assert_eq!(ptr.target, PointerTarget::Insn(ids[2]));
    assert_eq!(ptr.offset_in_target, 0);

    // get_addr matches the target's address plus the stored offset.
    let dest = af.insn(ids[2]).address() as i64 + ptr.offset_in_target;
    assert_eq!(ptr.get_addr(branch.address()) as i64, dest);
}

#[test]
fn undecodable_words_resync_and_flag_followers() {
    // Junk at 0x6000, then two valid words.
    let mut img = image();
    let mut bytes = vec![0xFF, 0xFF, 0xFF, 0xFF];
    bytes.extend_from_slice(&[0x1F, 0x20, 0x03, 0xD5]);
    bytes.extend_from_slice(&[0x1F, 0x20, 0x03, 0xD5]);
    img.add_code_section(".text", 0x6000, bytes, SectionAttrs::STD_CODE);

    let mut af = AsmFile::new(img);
    let report = disassemble(&mut af).unwrap();
    assert_eq!(report.parse_errors, 1);

    let ids: Vec<_> = af.iter().collect();
    assert!(af.insn(ids[0]).is_bad());
    assert_eq!(af.insn(ids[0]).byte_size(), 4);

    // The parse right after an error block is doubtful; the next one is
    // trusted again.
    assert!(af.insn(ids[1]).annotations().has(Annotations::SUSPICIOUS));
    assert!(!af.insn(ids[2]).annotations().has(Annotations::SUSPICIOUS));
}

#[test]
fn interworking_switch_at_a_marker() {
    // Two a64 words, then compact code flagged by a `$t` marker.
    let mut img = image();
    let mut bytes = vec![0x1F, 0x20, 0x03, 0xD5];
    bytes.extend_from_slice(&[0x1F, 0x20, 0x03, 0xD5]);
    bytes.extend_from_slice(&[0x00, 0xBF]); // compact nop
    bytes.extend_from_slice(&[0x04, 0xE0]); // compact b +8
    img.add_code_section(".text", 0x5000, bytes, SectionAttrs::STD_CODE);
    img.add_label("$t", 0x5008, LabelKind::Dummy);

    let mut af = AsmFile::new(img);
    disassemble(&mut af).unwrap();

    let ids: Vec<_> = af.iter().collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(af.insn(ids[1]).isa(), ArchCode::A64);
    let first_compact = af.insn(ids[2]);
    assert_eq!(first_compact.isa(), ArchCode::A64c);
    assert_eq!(first_compact.address(), 0x5008);
    assert_eq!(first_compact.byte_size(), 2);
}

#[test]
fn interworking_rewind_undoes_straddling_words() {
    // A valid a64 word, two junk bytes, then compact code starting at
    // the `$t` marker in the middle of what a64 would decode next.
    let mut img = image();
    let mut bytes = vec![0x1F, 0x20, 0x03, 0xD5];
    bytes.extend_from_slice(&[0xAA, 0xBB]);
    bytes.extend_from_slice(&[0x00, 0xBF]); // compact nop at 0x5006
    bytes.extend_from_slice(&[0x04, 0xE0]); // compact b at 0x5008
    img.add_code_section(".text", 0x5000, bytes, SectionAttrs::STD_CODE);
    img.add_label("$t", 0x5006, LabelKind::Dummy);

    let mut af = AsmFile::new(img);
    disassemble(&mut af).unwrap();

    let ids: Vec<_> = af.iter().collect();
    assert_eq!(ids.len(), 3, "listing:\n{}", af.print_listing());

    assert_eq!(af.insn(ids[0]).address(), 0x5000);
    assert_eq!(af.insn(ids[0]).isa(), ArchCode::A64);

    // The word decoded across the marker was rolled back; parsing
    // resumed in the compact set at the marker.
    assert_eq!(af.insn(ids[1]).address(), 0x5006);
    assert_eq!(af.insn(ids[1]).isa(), ArchCode::A64c);
    assert_eq!(af.insn(ids[1]).byte_size(), 2);

    // The bytes skipped by the rewind leave a gap in the list.
    assert!(af.insn(ids[0]).annotations().has(Annotations::END_LIST));
    assert!(af.insn(ids[1]).annotations().has(Annotations::BEGIN_LIST));
}

#[test]
fn gap_flags_frame_the_listing() {
    let mut img = image();
    img.add_code_section(
        ".text",
        0x1000,
        vec![0x1F, 0x20, 0x03, 0xD5],
        SectionAttrs::STD_CODE,
    );
    img.add_code_section(
        ".text.hot",
        0x2000,
        vec![0x1F, 0x20, 0x03, 0xD5],
        SectionAttrs::STD_CODE,
    );
    let mut af = AsmFile::new(img);
    disassemble(&mut af).unwrap();

    let ids: Vec<_> = af.iter().collect();
    assert!(af.insn(ids[0]).annotations().has(Annotations::BEGIN_LIST));
    assert!(af.insn(ids[0]).annotations().has(Annotations::END_LIST));
    assert!(af.insn(ids[1]).annotations().has(Annotations::BEGIN_LIST));
    assert!(af.insn(ids[1]).annotations().has(Annotations::END_LIST));
}

#[test]
fn relocation_sites_link_to_their_instruction() {
    let mut img = image();
    img.add_code_section(
        ".text",
        0x1000,
        vec![0x1F, 0x20, 0x03, 0xD5],
        SectionAttrs::STD_CODE,
    );
    img.add_data_section(".data", 0x2000, vec![0; 8]);
    img.add_relocation(0x2000, 0x1000);

    let mut af = AsmFile::new(img);
    disassemble(&mut af).unwrap();

    let insn = af.head().unwrap();
    let did = af.data_at(0x2000).unwrap();
    let ptr = af.data(did).pointer.unwrap();
    assert_eq!(ptr.target, PointerTarget::Insn(insn));
    assert_eq!(ptr.offset_in_target, 0);
}

#[test]
fn printed_branches_reparse_to_the_same_destination() {
    let mut img = image();
    let mut bytes = vec![0x02, 0x00, 0x00, 0x14];
    bytes.extend_from_slice(&[0x1F, 0x20, 0x03, 0xD5]);
    bytes.extend_from_slice(&[0x1F, 0x20, 0x03, 0xD5]);
    img.add_code_section(".text", 0x4000, bytes, SectionAttrs::STD_CODE);
    let mut af = AsmFile::new(img);
    disassemble(&mut af).unwrap();

    let id = af.head().unwrap();
    let line = af.print_insn(id);
    let reparsed = af.arch().parse_insn(&line).unwrap();
    assert!(af.insn(id).equal(&reparsed));
    assert_eq!(
        format!("{}", reparsed.display(&A64_DESCRIPTOR)),
        "b 0x4008"
    );
}
