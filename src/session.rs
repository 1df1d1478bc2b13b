//! The patch session: one handle per loaded file, bundling the
//! disassembled representation, the modification planner, call tracing
//! and the deferred-status slot.

use std::io::Write;

use ocelot_asm::arch::{ArchOps, Comparison};
use ocelot_asm::binary::{BinaryImage, Label, LabelKind, LabelTarget};
use ocelot_asm::disassembler::disassemble;
use ocelot_asm::insn::Instruction;
use ocelot_asm::operand::{Operand, OperandKind, Pointer};
use ocelot_asm::{AsmFile, InsnId};
use ocelot_patch::{
    CondId, GlobVarId, ModifId, ModifKind, ModifNext, ModifPos, PatchFile, PatchedBinary,
    RedirectDest, StackPolicy,
};

use crate::error::{LastStatus, OcelotError, Status, Warning};
use crate::trace::Tracer;

/// A loaded file prepared for analysis and patching.
///
/// Sessions are single-threaded and per-file; they own the
/// disassembled representation and, once [`modifs_init`] has run, the
/// modification planner.
///
/// [`modifs_init`]: #method.modifs_init
pub struct Session {
    af: AsmFile,
    patch: Option<PatchFile>,
    tracer: Option<Tracer>,
    status: LastStatus,
    cursor: Option<InsnId>,
    target_os: Option<u8>,
    target_machine: Option<u16>,
}

impl Session {
    /// Opens a session over a loaded binary image.
    pub fn from_image(image: BinaryImage) -> Self {
        tracing::debug!(file = %image.name, "session opened");
        Session {
            af: AsmFile::new(image),
            patch: None,
            tracer: None,
            status: LastStatus::default(),
            cursor: None,
            target_os: None,
            target_machine: None,
        }
    }

    /// The disassembled representation of the file.
    pub fn asmfile(&self) -> &AsmFile {
        &self.af
    }

    /// Mutable access to the disassembled representation.
    pub fn asmfile_mut(&mut self) -> &mut AsmFile {
        &mut self.af
    }

    /* Tracing and status */

    /// Enables call tracing into `sink`.
    pub fn trace_on(&mut self, sink: Box<dyn Write>) {
        self.tracer = Some(Tracer::new(sink));
    }

    /// Disables call tracing.
    pub fn trace_off(&mut self) {
        self.tracer = None;
    }

    fn trace_call(&mut self, name: &str, args: &str) {
        if let Some(tracer) = &mut self.tracer {
            tracer.call(name, args);
        }
    }

    fn trace_handle(&mut self, name: &str, args: &str, kind: &str, id: Option<u32>) {
        if let Some(tracer) = &mut self.tracer {
            tracer.call_handle(name, args, kind, id);
        }
    }

    fn record<T>(&mut self, res: Result<T, OcelotError>) -> Result<T, OcelotError> {
        if let Err(e) = &res {
            self.status.set_error(e.clone());
        }
        res
    }

    /// Reads and clears the status recorded by the last failing or
    /// warning call.
    pub fn last_status(&mut self) -> Option<Status> {
        self.status.take()
    }

    /// The numeric code of the recorded status; 0 when nothing is
    /// recorded.
    pub fn last_code(&mut self) -> u32 {
        self.status.take().map(|s| s.code()).unwrap_or(0)
    }

    /* Analysis */

    /// Disassembles every code section, returning the number of words
    /// that failed to decode.
    pub fn disassemble(&mut self) -> Result<u32, OcelotError> {
        let res = disassemble(&mut self.af)
            .map(|r| r.parse_errors)
            .map_err(OcelotError::from);
        let res = self.record(res);
        if let Ok(errors) = &res {
            if *errors > 0 {
                self.status.set_warning(Warning::IncompleteDisassembly);
            }
        }
        res
    }

    /// Parses one instruction from its text representation.
    pub fn parse_insn(&mut self, text: &str) -> Result<Instruction, OcelotError> {
        let res = self.af.arch().parse_insn(text).map_err(OcelotError::from);
        self.record(res)
    }

    /// Generates the architecture's no-operation instruction.
    pub fn generate_nop(&self) -> Instruction {
        self.af.arch().gen_nop()
    }

    /// Builds the branch with the opposite condition of the branch at
    /// `addr`.
    pub fn get_opposite_branch(&mut self, addr: u64) -> Result<Instruction, OcelotError> {
        let res = match self.af.insn_at(addr) {
            None => Err(OcelotError::InstructionNotFound(addr)),
            Some(id) => match self.af.arch().opposite_branch(self.af.insn(id)) {
                Some(insn) => Ok(insn),
                None => Err(OcelotError::OperandTypeMismatch),
            },
        };
        let res = self.record(res);
        if res.is_ok() {
            self.status.set_warning(Warning::BranchOppositeCondition);
        }
        res
    }

    /* Cursor navigation */

    /// Positions the cursor from a label name, an address or a section
    /// name, in that order of precedence.
    pub fn init_cursor(
        &mut self,
        label: Option<&str>,
        addr: Option<u64>,
        scnname: Option<&str>,
    ) -> Result<(), OcelotError> {
        let res = self.resolve_cursor(label, addr, scnname);
        let args = format!(
            "label={},addr={:#x},scnname={}",
            label.unwrap_or("NULL"),
            addr.unwrap_or(0),
            scnname.unwrap_or("NULL"),
        );
        self.trace_call("init_cursor", &args);
        self.record(res)
    }

    fn resolve_cursor(
        &mut self,
        label: Option<&str>,
        addr: Option<u64>,
        scnname: Option<&str>,
    ) -> Result<(), OcelotError> {
        let id = if let Some(name) = label {
            let lid = self
                .af
                .label_by_name(name)
                .ok_or_else(|| OcelotError::LabelNotFound(name.to_string()))?;
            match self.af.label(lid).target {
                Some(LabelTarget::Insn(id)) => id,
                _ => {
                    let at = self.af.label(lid).addr;
                    self.af
                        .insn_at(at)
                        .ok_or(OcelotError::InstructionNotFound(at))?
                }
            }
        } else if let Some(addr) = addr {
            self.af
                .insn_at(addr)
                .ok_or(OcelotError::InstructionNotFound(addr))?
        } else if let Some(name) = scnname {
            let sid = self
                .af
                .image()
                .find_section(name)
                .ok_or_else(|| OcelotError::SectionNotFound(name.to_string()))?;
            let start = self.af.image().section(sid).addr;
            self.af
                .insn_at(start)
                .ok_or(OcelotError::InstructionNotFound(start))?
        } else {
            self.af.head().ok_or(OcelotError::NotDisassembled)?
        };
        self.cursor = Some(id);
        Ok(())
    }

    fn at_cursor(&self) -> Result<InsnId, OcelotError> {
        self.cursor.ok_or(OcelotError::CursorNotSet)
    }

    /// Moves the cursor to the next instruction. Returns `false` at the
    /// end of the list.
    pub fn insn_next(&mut self) -> Result<bool, OcelotError> {
        let cur = self.at_cursor();
        let cur = self.record(cur)?;
        match self.af.next_of(cur) {
            Some(next) => {
                self.cursor = Some(next);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Moves the cursor to the previous instruction. Returns `false` at
    /// the head of the list.
    pub fn insn_prev(&mut self) -> Result<bool, OcelotError> {
        let cur = self.at_cursor();
        let cur = self.record(cur)?;
        match self.af.prev_of(cur) {
            Some(prev) => {
                self.cursor = Some(prev);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether the cursor sits on the last instruction of its section.
    pub fn insn_end_of_scn(&mut self) -> Result<bool, OcelotError> {
        let cur = self.at_cursor();
        let cur = self.record(cur)?;
        let section = self.af.insn(cur).section();
        Ok(match self.af.next_of(cur) {
            None => true,
            Some(next) => self.af.insn(next).section() != section,
        })
    }

    /* Cursor accessors */

    /// The mnemonic of the instruction under the cursor.
    pub fn get_insn_name(&mut self) -> Result<String, OcelotError> {
        let cur = self.at_cursor();
        let cur = self.record(cur)?;
        Ok(self
            .af
            .descriptor()
            .opcode_name(self.af.insn(cur).opcode())
            .to_string())
    }

    /// The coding of the instruction under the cursor, as hex bytes.
    pub fn get_insn_hexcoding(&mut self) -> Result<String, OcelotError> {
        let cur = self.at_cursor();
        let cur = self.record(cur)?;
        Ok(self
            .af
            .insn(cur)
            .coding()
            .map(|c| c.hex())
            .unwrap_or_default())
    }

    /// The address of the instruction under the cursor.
    pub fn get_insn_addr(&mut self) -> Result<u64, OcelotError> {
        let cur = self.at_cursor();
        let cur = self.record(cur)?;
        Ok(self.af.insn(cur).address())
    }

    /// The byte size of the instruction under the cursor.
    pub fn get_insn_size(&mut self) -> Result<usize, OcelotError> {
        let cur = self.at_cursor();
        let cur = self.record(cur)?;
        Ok(self.af.insn(cur).byte_size())
    }

    /// The function label the instruction under the cursor falls under.
    pub fn get_insn_lbl(&mut self) -> Result<Option<String>, OcelotError> {
        let cur = self.at_cursor();
        let cur = self.record(cur)?;
        Ok(self
            .af
            .insn(cur)
            .fct_label()
            .map(|l| self.af.label(l).name.clone()))
    }

    /// The number of operands of the instruction under the cursor.
    pub fn get_insn_paramnum(&mut self) -> Result<usize, OcelotError> {
        let cur = self.at_cursor();
        let cur = self.record(cur)?;
        Ok(self.af.insn(cur).operands().len())
    }

    /// The kind of operand `pos` of the instruction under the cursor.
    pub fn get_insn_paramtype(&mut self, pos: usize) -> Result<&'static str, OcelotError> {
        let cur = self.at_cursor();
        let cur = self.record(cur)?;
        let res = match self.af.insn(cur).operands().get(pos) {
            Some(op) => Ok(match op.kind {
                OperandKind::Register(_) => "register",
                OperandKind::Immediate(_) => "immediate",
                OperandKind::Memory(_) => "memory",
                OperandKind::Pointer(_) => "pointer",
                OperandKind::MemRelative(..) => "memory-relative",
            }),
            None => Err(OcelotError::OperandTypeMismatch),
        };
        self.record(res)
    }

    /// The printed form of the instruction under the cursor.
    pub fn get_insn_text(&mut self) -> Result<String, OcelotError> {
        let cur = self.at_cursor();
        let cur = self.record(cur)?;
        Ok(self.af.print_insn(cur))
    }

    /// Writes the whole listing to `out`.
    pub fn insns_print(&self, out: &mut dyn Write) -> std::io::Result<()> {
        out.write_all(self.af.print_listing().as_bytes())
    }

    /* Modification session */

    /// Prepares the file for modification with the given stack policy.
    pub fn modifs_init(&mut self, policy: StackPolicy) -> Result<(), OcelotError> {
        let (save, shift) = match policy {
            StackPolicy::Keep => (0, 0),
            StackPolicy::Move => (1, 0),
            StackPolicy::Shift(s) => (2, s),
        };
        let args = format!("stacksave={},stackshift={:#x}", save, shift);
        self.trace_call("modifs_init", &args);

        if self.patch.is_some() {
            self.status.set_warning(Warning::ModifsAlreadyInit);
            return Ok(());
        }
        if let StackPolicy::Shift(0) = policy {
            self.status.set_warning(Warning::StackShiftNull);
        }
        self.patch = Some(PatchFile::new(&self.af, policy));
        Ok(())
    }

    /// Registers an insertion of instructions at `addr`.
    pub fn add_insns(
        &mut self,
        addr: u64,
        pos: ModifPos,
        insns: Vec<Instruction>,
    ) -> Result<ModifId, OcelotError> {
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf
                .insert(&self.af, addr, pos, insns)
                .map_err(OcelotError::from),
        };
        let args = format!(
            "addr={:#x},pos={}",
            addr,
            if pos == ModifPos::Before { 0 } else { 1 }
        );
        self.trace_handle("add_insns", &args, "modif", res.as_ref().ok().map(|m| m.0));
        self.record(res)
    }

    /// Registers an insertion parsed from multi-line instruction text.
    pub fn insnlist_add(
        &mut self,
        text: &str,
        addr: u64,
        pos: ModifPos,
    ) -> Result<ModifId, OcelotError> {
        let mut insns = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match self.af.arch().parse_insn(line) {
                Ok(insn) => insns.push(insn),
                Err(e) => {
                    let err = OcelotError::from(e);
                    self.trace_handle(
                        "insnlist_add",
                        &format!("insn_list={:?},addr={:#x}", text, addr),
                        "modif",
                        None,
                    );
                    return self.record(Err(err));
                }
            }
        }
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf
                .insert(&self.af, addr, pos, insns)
                .map_err(OcelotError::from),
        };
        let args = format!("insn_list={:?},addr={:#x}", text, addr);
        self.trace_handle("insnlist_add", &args, "modif", res.as_ref().ok().map(|m| m.0));
        self.record(res)
    }

    /// Registers a floating instruction list.
    pub fn add_insns_floating(&mut self, insns: Vec<Instruction>) -> Result<ModifId, OcelotError> {
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => Ok(pf.insert_floating(insns)),
        };
        self.trace_handle(
            "add_insns",
            "addr=NULL,pos=floating",
            "modif",
            res.as_ref().ok().map(|m| m.0),
        );
        self.record(res)
    }

    /// Registers the deletion of the instruction at `addr`.
    pub fn delete_insns(&mut self, addr: u64) -> Result<ModifId, OcelotError> {
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf.delete(&self.af, addr).map_err(OcelotError::from),
        };
        let args = format!("addr={:#x}", addr);
        self.trace_handle("delete_insns", &args, "modif", res.as_ref().ok().map(|m| m.0));
        self.record(res)
    }

    /// Registers the replacement of the instruction at `addr`.
    pub fn replace_insns(
        &mut self,
        addr: u64,
        insns: Vec<Instruction>,
    ) -> Result<ModifId, OcelotError> {
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf
                .replace(&self.af, addr, insns)
                .map_err(OcelotError::from),
        };
        let args = format!("addr={:#x}", addr);
        self.trace_handle("replace_insns", &args, "modif", res.as_ref().ok().map(|m| m.0));
        self.record(res)
    }

    /// Registers an in-place rewrite of the instruction at `addr`.
    pub fn modify_insn(
        &mut self,
        addr: u64,
        opcode: Option<u16>,
        operands: Option<Vec<Operand>>,
    ) -> Result<ModifId, OcelotError> {
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf
                .modify(&self.af, addr, opcode, operands)
                .map_err(OcelotError::from),
        };
        let args = format!("addr={:#x}", addr);
        self.trace_handle("modify_insn", &args, "modif", res.as_ref().ok().map(|m| m.0));
        self.record(res)
    }

    /// Marks the block around `addr` as movable.
    pub fn relocate_insn(&mut self, addr: u64) -> Result<ModifId, OcelotError> {
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf.relocate(&self.af, addr).map_err(OcelotError::from),
        };
        let args = format!("addr={:#x}", addr);
        self.trace_handle("relocate_insn", &args, "modif", res.as_ref().ok().map(|m| m.0));
        self.record(res)
    }

    /// Points the branch at `addr` to the instruction at `dest`.
    pub fn set_branch_target(
        &mut self,
        addr: u64,
        dest: u64,
        update_if_patched: bool,
    ) -> Result<ModifId, OcelotError> {
        let res = match self.af.insn_at(dest) {
            None => Err(OcelotError::InstructionNotFound(dest)),
            Some(tid) => match self.patch.as_mut() {
                None => Err(OcelotError::PatchNotInitialised),
                Some(pf) => pf
                    .redirect_branch(&self.af, addr, RedirectDest::Insn(tid), update_if_patched)
                    .map_err(OcelotError::from),
            },
        };
        let args = format!(
            "addr={:#x},dest={:#x},update={}",
            addr, dest, update_if_patched as u8
        );
        self.trace_handle(
            "set_branch_target",
            &args,
            "modif",
            res.as_ref().ok().map(|m| m.0),
        );
        self.record(res)
    }

    /// Points the branch at `addr` into the body of a modification.
    pub fn set_branch_target_modif(
        &mut self,
        addr: u64,
        dest: ModifId,
        update_if_patched: bool,
    ) -> Result<ModifId, OcelotError> {
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf
                .redirect_branch(&self.af, addr, RedirectDest::Modif(dest), update_if_patched)
                .map_err(OcelotError::from),
        };
        let args = format!(
            "addr={:#x},dest=modif_{},update={}",
            addr, dest.0, update_if_patched as u8
        );
        self.trace_handle(
            "set_branch_target",
            &args,
            "modif",
            res.as_ref().ok().map(|m| m.0),
        );
        self.record(res)
    }

    /* Conditions */

    /// Builds a comparison condition.
    pub fn cond_new(
        &mut self,
        op: Comparison,
        oprnd: Operand,
        value: i64,
    ) -> Result<CondId, OcelotError> {
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => Ok(pf.cond_comp(op, oprnd, value)),
        };
        let args = format!("condtype={:?},condval={:#x}", op, value);
        self.trace_handle("cond_new", &args, "cond", res.as_ref().ok().map(|c| c.0));
        self.record(res)
    }

    /// Combines two conditions with a logical and.
    pub fn cond_and(&mut self, left: CondId, right: CondId) -> Result<CondId, OcelotError> {
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => Ok(pf.cond_and(left, right)),
        };
        let args = format!("cond1=cond_{},cond2=cond_{}", left.0, right.0);
        self.trace_handle("cond_new", &args, "cond", res.as_ref().ok().map(|c| c.0));
        self.record(res)
    }

    /// Combines two conditions with a logical or.
    pub fn cond_or(&mut self, left: CondId, right: CondId) -> Result<CondId, OcelotError> {
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => Ok(pf.cond_or(left, right)),
        };
        let args = format!("cond1=cond_{},cond2=cond_{}", left.0, right.0);
        self.trace_handle("cond_new", &args, "cond", res.as_ref().ok().map(|c| c.0));
        self.record(res)
    }

    /// Guards a modification with a condition.
    pub fn modif_addcond(&mut self, modif: ModifId, cond: CondId) -> Result<(), OcelotError> {
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf.add_cond(modif, cond).map_err(OcelotError::from),
        };
        let args = format!("modif=modif_{},cond=cond_{}", modif.0, cond.0);
        self.trace_call("modif_addcond", &args);
        self.record(res)
    }

    /// Binds the else-path of a conditional modification.
    pub fn modif_addelse(&mut self, modif: ModifId, elsemod: ModifId) -> Result<(), OcelotError> {
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf.add_else(modif, elsemod).map_err(OcelotError::from),
        };
        let args = format!("modif=modif_{},elsemod=modif_{}", modif.0, elsemod.0);
        self.trace_call("modif_addelse", &args);
        self.record(res)
    }

    /// Chains control flow after a modification's body.
    ///
    /// Combining an explicit chain with a redirection that carries the
    /// update flag is ambiguous; the update contract wins and a warning
    /// is recorded.
    pub fn modif_setnext(&mut self, modif: ModifId, next: ModifNext) -> Result<(), OcelotError> {
        let ambiguous = self
            .patch
            .as_ref()
            .and_then(|pf| pf.modif(modif))
            .map_or(false, |m| {
                matches!(
                    m.kind,
                    ModifKind::Redirect {
                        update_if_patched: true,
                        ..
                    }
                )
            });
        if ambiguous {
            self.status.set_warning(Warning::AmbiguousRedirect);
        }
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf.set_next(modif, next).map_err(OcelotError::from),
        };
        let args = match next {
            ModifNext::Modif(n) => format!("modif=modif_{},next=modif_{}", modif.0, n.0),
            ModifNext::Insn(_) => format!("modif=modif_{},next=insn", modif.0),
        };
        self.trace_call("modif_setnext", &args);
        self.record(res)
    }

    /* Padding */

    /// Overrides the session's padding instruction.
    pub fn modifs_setpaddinginsn(&mut self, insn: Instruction) -> Result<(), OcelotError> {
        let args = format!("insn={}", insn.display(self.af.descriptor()));
        self.trace_call("modifs_setpaddinginsn", &args);
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf.set_padding(&self.af, insn).map_err(OcelotError::from),
        };
        self.record(res)
    }

    /// Overrides the padding instruction of one modification.
    pub fn modif_setpaddinginsn(
        &mut self,
        modif: ModifId,
        insn: Instruction,
    ) -> Result<(), OcelotError> {
        let args = format!(
            "modif=modif_{},insn={}",
            modif.0,
            insn.display(self.af.descriptor())
        );
        self.trace_call("modif_setpaddinginsn", &args);
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf
                .set_modif_padding(&self.af, modif, insn)
                .map_err(OcelotError::from),
        };
        self.record(res)
    }

    /* Libraries and variables */

    /// Adds an external library dependency.
    pub fn extlib_add(&mut self, name: &str) -> Result<(), OcelotError> {
        let args = format!("extlibname={}", name);
        self.trace_call("extlib_add", &args);
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => {
                pf.lib_add(name);
                Ok(())
            }
        };
        self.record(res)
    }

    /// Renames an external library.
    pub fn extlib_rename(&mut self, old: &str, new: &str) -> Result<(), OcelotError> {
        let args = format!("oldname={},newname={}", old, new);
        self.trace_call("extlib_rename", &args);
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf.lib_rename(old, new).map_err(OcelotError::from),
        };
        self.record(res)
    }

    /// Renames a function of an external library.
    pub fn extfct_rename(&mut self, lib: &str, old: &str, new: &str) -> Result<(), OcelotError> {
        let args = format!("library={},oldname={},newname={}", lib, old, new);
        self.trace_call("extfct_rename", &args);
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf.extfct_rename(lib, old, new).map_err(OcelotError::from),
        };
        self.record(res)
    }

    /// Creates a global variable.
    pub fn globalvar_new(&mut self, size: usize, bytes: Vec<u8>) -> Result<GlobVarId, OcelotError> {
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => Ok(pf.globalvar_new(size, bytes)),
        };
        let args = format!("size={}", size);
        self.trace_handle("globalvar_new", &args, "globvar", res.as_ref().ok().map(|g| g.0));
        self.record(res)
    }

    /// Creates a thread-local variable.
    pub fn tlsvar_new(&mut self, size: usize, bytes: Vec<u8>) -> Result<GlobVarId, OcelotError> {
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => Ok(pf.tlsvar_new(size, bytes)),
        };
        let args = format!("size={}", size);
        self.trace_handle("tlsvar_new", &args, "tlsvar", res.as_ref().ok().map(|g| g.0));
        self.record(res)
    }

    /// Queues a label addition.
    pub fn label_add(&mut self, name: &str, addr: u64, kind: LabelKind) -> Result<(), OcelotError> {
        let args = format!("lblname={},addr={:#x}", name, addr);
        self.trace_call("label_add", &args);
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => {
                pf.label_add(name, addr, kind);
                Ok(())
            }
        };
        self.record(res)
    }

    /* Function call composition */

    /// Builds an insertion calling `fctname` from `libname` before the
    /// instruction at `addr`.
    pub fn fctcall_new(
        &mut self,
        fctname: &str,
        libname: Option<&str>,
        addr: u64,
    ) -> Result<ModifId, OcelotError> {
        let dest = match self.af.label_by_name(fctname) {
            Some(lid) => self.af.label(lid).addr,
            None => {
                self.af
                    .add_label(Label::new(fctname, 0, LabelKind::ExtFunction));
                0
            }
        };
        let call = self.af.arch().gen_call(Pointer::absolute(dest));
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => {
                if let Some(lib) = libname {
                    pf.lib_add(lib);
                }
                pf.insert(&self.af, addr, ModifPos::Before, vec![call])
                    .map_err(OcelotError::from)
            }
        };
        let args = format!(
            "fctname={},libname={},addr={:#x}",
            fctname,
            libname.unwrap_or("NULL"),
            addr
        );
        self.trace_handle("fctcall_new", &args, "modif", res.as_ref().ok().map(|m| m.0));
        self.record(res)
    }

    /// Passes an immediate parameter to an injected call.
    pub fn fctcall_addparam_imm(
        &mut self,
        modif: ModifId,
        reg: u16,
        imm: i64,
    ) -> Result<(), OcelotError> {
        let load = Instruction::new(
            self.af
                .descriptor()
                .opcode_lookup("mov")
                .ok_or(OcelotError::OperandTypeMismatch)?,
            vec![
                Operand::reg(reg, 64, ocelot_asm::operand::Role::Destination),
                Operand::imm(imm),
            ],
            self.af.descriptor().code,
        );
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf.body_prepend(modif, load).map_err(OcelotError::from),
        };
        let args = format!("modif=modif_{},imm={:#x}", modif.0, imm);
        self.trace_call("fctcall_addparam_imm", &args);
        self.record(res)
    }

    /// Passes the address of an injected variable to an injected call.
    pub fn fctcall_addparam_fromglobvar(
        &mut self,
        modif: ModifId,
        reg: u16,
        var: GlobVarId,
    ) -> Result<(), OcelotError> {
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf.param_from_globvar(modif, reg, var).map_err(OcelotError::from),
        };
        let args = format!("modif=modif_{},globvar=globvar_{}", modif.0, var.0);
        self.trace_call("fctcall_addparam_fromglobvar", &args);
        self.record(res)
    }

    /* Target overrides */

    /// Overrides the target OS identification of the emitted file.
    pub fn change_target_os(&mut self, code: u8) -> Result<(), OcelotError> {
        let args = format!("code={}", code);
        self.trace_call("change_OSABI", &args);
        self.target_os = Some(code);
        Ok(())
    }

    /// Overrides the target machine identification of the emitted file.
    pub fn change_target_machine(&mut self, code: u16) -> Result<(), OcelotError> {
        let args = format!("machine_code={}", code);
        self.trace_call("change_machine", &args);
        self.target_machine = Some(code);
        Ok(())
    }

    /// The recorded target OS override.
    pub fn target_os(&self) -> Option<u8> {
        self.target_os
    }

    /// The recorded target machine override.
    pub fn target_machine(&self) -> Option<u16> {
        self.target_machine
    }

    /* Commit */

    /// Enables or disables the address tracking map.
    pub fn track_addresses(&mut self, on: bool) -> Result<(), OcelotError> {
        let args = format!("on={}", on as u8);
        self.trace_call("track_addresses", &args);
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => {
                pf.track_addresses(on);
                Ok(())
            }
        };
        self.record(res)
    }

    /// The `(original, patched)` address pairs recorded by the commit.
    pub fn get_new_addresses(&mut self) -> Result<Vec<(u64, u64)>, OcelotError> {
        let res = match self.patch.as_ref() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf
                .address_map()
                .map(|m| m.to_vec())
                .map_err(OcelotError::from),
        };
        self.record(res)
    }

    /// Materialises every modification without considering the session
    /// written out.
    pub fn modifs_precommit(&mut self) -> Result<PatchedBinary, OcelotError> {
        self.trace_call("modifs_precommit", "");
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf.precommit(&mut self.af).map_err(OcelotError::from),
        };
        self.record(res)
    }

    /// Commits every modification and returns the patched byte
    /// streams.
    pub fn modifs_commit(&mut self) -> Result<PatchedBinary, OcelotError> {
        self.trace_call("modifs_commit", "");
        let res = match self.patch.as_mut() {
            None => Err(OcelotError::PatchNotInitialised),
            Some(pf) => pf.commit(&mut self.af).map_err(OcelotError::from),
        };
        self.record(res)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("file", &self.af.image().name)
            .field("patched", &self.patch.is_some())
            .finish()
    }
}
