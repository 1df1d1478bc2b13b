//! Session-level end-to-end checks: API flow, deferred status and the
//! call-trace oracle.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use ocelot::image::{ArchCode, BinaryImage, FileType, SectionAttrs};
use ocelot::model::{Comparison, Operand, Role};
use ocelot::{ModifPos, Session, StackPolicy, Status, Warning};

const NOP: [u8; 4] = [0x1F, 0x20, 0x03, 0xD5];

/// A trace sink the test keeps a handle on.
#[derive(Clone, Default)]
struct Shared(Rc<RefCell<Vec<u8>>>);

impl Shared {
    fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).unwrap()
    }
}

impl Write for Shared {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn nop_image(base: u64, n: usize) -> BinaryImage {
    let mut img = BinaryImage::new("test.bin", ArchCode::A64, FileType::Executable);
    let mut bytes = Vec::new();
    for _ in 0..n {
        bytes.extend_from_slice(&NOP);
    }
    img.add_code_section(".text", base, bytes, SectionAttrs::STD_CODE);
    img
}

#[test]
fn cursor_navigation() {
    let mut img = nop_image(0x1000, 3);
    img.add_label("start", 0x1000, ocelot::image::LabelKind::Function);
    let mut session = Session::from_image(img);
    session.disassemble().unwrap();

    session.init_cursor(Some("start"), None, None).unwrap();
    assert_eq!(session.get_insn_addr().unwrap(), 0x1000);
    assert_eq!(session.get_insn_name().unwrap(), "hint");
    assert_eq!(session.get_insn_size().unwrap(), 4);
    assert_eq!(session.get_insn_hexcoding().unwrap(), "1f 20 03 d5");
    assert_eq!(session.get_insn_lbl().unwrap().as_deref(), Some("start"));
    assert_eq!(session.get_insn_paramnum().unwrap(), 0);

    assert!(session.insn_next().unwrap());
    assert_eq!(session.get_insn_addr().unwrap(), 0x1004);
    assert!(!session.insn_end_of_scn().unwrap());
    assert!(session.insn_next().unwrap());
    assert!(session.insn_end_of_scn().unwrap());
    assert!(!session.insn_next().unwrap());

    assert!(session.insn_prev().unwrap());
    assert_eq!(session.get_insn_addr().unwrap(), 0x1004);

    // Cursor by section name and by address agree.
    session.init_cursor(None, None, Some(".text")).unwrap();
    assert_eq!(session.get_insn_addr().unwrap(), 0x1000);
    session.init_cursor(None, Some(0x1008), None).unwrap();
    assert_eq!(session.get_insn_addr().unwrap(), 0x1008);
}

#[test]
fn deferred_status_is_read_and_reset() {
    let mut session = Session::from_image(nop_image(0x1000, 2));
    session.disassemble().unwrap();
    session.modifs_init(StackPolicy::Keep).unwrap();

    // A failing call records its error for deferred retrieval.
    assert!(session.delete_insns(0x9999).is_err());
    match session.last_status() {
        Some(Status::Error(e)) => assert_eq!(e.code(), 0x1502),
        other => panic!("unexpected status {:?}", other),
    }
    // The slot resets on read.
    assert_eq!(session.last_code(), 0);

    // Warnings are recorded, and a second init only warns.
    session.modifs_init(StackPolicy::Keep).unwrap();
    assert_eq!(
        session.last_status(),
        Some(Status::Warning(Warning::ModifsAlreadyInit))
    );

    // Errors are not overwritten by warnings.
    assert!(session.delete_insns(0x9999).is_err());
    session.modifs_init(StackPolicy::Keep).unwrap();
    match session.last_status() {
        Some(Status::Error(_)) => {}
        other => panic!("unexpected status {:?}", other),
    }
}

#[test]
fn null_stack_shift_warns() {
    let mut session = Session::from_image(nop_image(0x1000, 2));
    session.disassemble().unwrap();
    session.modifs_init(StackPolicy::Shift(0)).unwrap();
    assert_eq!(
        session.last_status(),
        Some(Status::Warning(Warning::StackShiftNull))
    );
}

#[test]
fn opposite_branch_carries_a_warning() {
    let mut img = BinaryImage::new("test.bin", ArchCode::A64, FileType::Executable);
    // b.ne 0x1008
    let mut bytes = vec![0x41, 0x00, 0x00, 0x54];
    bytes.extend_from_slice(&NOP);
    bytes.extend_from_slice(&NOP);
    img.add_code_section(".text", 0x1000, bytes, SectionAttrs::STD_CODE);
    let mut session = Session::from_image(img);
    session.disassemble().unwrap();

    let opposite = session.get_opposite_branch(0x1000).unwrap();
    assert_eq!(opposite.ext().unwrap().cond, Some(0)); // eq
    assert_eq!(
        session.last_status(),
        Some(Status::Warning(Warning::BranchOppositeCondition))
    );
}

#[test]
fn incomplete_disassembly_warns() {
    let mut img = BinaryImage::new("test.bin", ArchCode::A64, FileType::Executable);
    let mut bytes = vec![0xFF, 0xFF, 0xFF, 0xFF];
    bytes.extend_from_slice(&NOP);
    img.add_code_section(".text", 0x1000, bytes, SectionAttrs::STD_CODE);
    let mut session = Session::from_image(img);

    assert_eq!(session.disassemble().unwrap(), 1);
    assert_eq!(
        session.last_status(),
        Some(Status::Warning(Warning::IncompleteDisassembly))
    );
}

#[test]
fn trace_is_a_reproducible_oracle() {
    let sink = Shared::default();
    let mut session = Session::from_image(nop_image(0x4000, 8));
    session.disassemble().unwrap();
    session.trace_on(Box::new(sink.clone()));

    session.modifs_init(StackPolicy::Move).unwrap();
    let nop = session.generate_nop();
    let m = session
        .add_insns(0x4010, ModifPos::Before, vec![nop])
        .unwrap();
    let cond = session
        .cond_new(Comparison::Equal, Operand::reg(5, 64, Role::Source), 42)
        .unwrap();
    session.modif_addcond(m, cond).unwrap();
    assert!(session.delete_insns(0x9999).is_err());
    session.modifs_commit().unwrap();

    assert_eq!(
        sink.contents(),
        "modifs_init(stacksave=1,stackshift=0x0)\n\
         add_insns(addr=0x4010,pos=0)=modif_0\n\
         cond_new(condtype=Equal,condval=0x2a)=cond_0\n\
         modif_addcond(modif=modif_0,cond=cond_0)\n\
         delete_insns(addr=0x9999)=NULL\n\
         modifs_commit()\n"
    );
}

#[test]
fn session_level_conditional_patch() {
    let mut session = Session::from_image(nop_image(0x4000, 8));
    session.disassemble().unwrap();
    session.modifs_init(StackPolicy::Move).unwrap();
    session.track_addresses(true).unwrap();

    let m = session
        .insnlist_add("bl 0x9000", 0x4010, ModifPos::Before)
        .unwrap();
    let cond = session
        .cond_new(Comparison::Equal, Operand::reg(5, 64, Role::Source), 42)
        .unwrap();
    session.modif_addcond(m, cond).unwrap();

    let out = session.modifs_commit().unwrap();
    assert!(out
        .sections
        .iter()
        .any(|s| s.name == ".ocelot.text" && !s.bytes.is_empty()));

    let map = session.get_new_addresses().unwrap();
    let entry = map.iter().find(|(orig, _)| *orig == 0x4010).unwrap();
    assert_ne!(entry.0, entry.1);
}

#[test]
fn fctcall_composition() {
    let mut session = Session::from_image(nop_image(0x4000, 4));
    session.disassemble().unwrap();
    session.modifs_init(StackPolicy::Keep).unwrap();

    let gv = session.globalvar_new(8, vec![0xAA; 8]).unwrap();
    let call = session
        .fctcall_new("probe_hook", Some("libprobe.so"), 0x4004)
        .unwrap();
    session.fctcall_addparam_imm(call, 0, 7).unwrap();
    session.fctcall_addparam_fromglobvar(call, 1, gv).unwrap();

    let out = session.modifs_commit().unwrap();

    // The patched library list carries the new dependency.
    assert!(session
        .asmfile()
        .image()
        .ext_libs
        .iter()
        .any(|l| l == "libprobe.so"));
    // The data section holds the variable's initial contents.
    let data = out
        .sections
        .iter()
        .find(|s| s.name == ".ocelot.data")
        .unwrap();
    assert_eq!(&data.bytes[..8], &[0xAA; 8]);
}

#[test]
fn target_overrides_are_recorded() {
    let mut session = Session::from_image(nop_image(0x1000, 1));
    session.disassemble().unwrap();
    session.change_target_os(3).unwrap();
    session.change_target_machine(0xB7).unwrap();
    assert_eq!(session.target_os(), Some(3));
    assert_eq!(session.target_machine(), Some(0xB7));
}

#[test]
fn printed_listing_reparses() {
    let mut session = Session::from_image(nop_image(0x1000, 2));
    session.disassemble().unwrap();
    session.init_cursor(None, Some(0x1000), None).unwrap();

    let line = session.get_insn_text().unwrap();
    let reparsed = session.parse_insn(&line).unwrap();
    assert_eq!(reparsed.address(), 0x1000);

    let mut listing = Vec::new();
    session.insns_print(&mut listing).unwrap();
    assert!(String::from_utf8(listing).unwrap().contains("1000:"));
}
