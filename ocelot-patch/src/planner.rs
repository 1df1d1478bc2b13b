//! The modification session: request accumulation and the commit
//! pipeline.

use tracing::debug;

use ocelot_asm::arch::{ArchOps, Comparison};
use ocelot_asm::asmfile::AsmFile;
use ocelot_asm::binary::{Label, LabelKind};
use ocelot_asm::insn::Instruction;
use ocelot_asm::operand::Operand;
use ocelot_asm::InsnId;

use crate::cond::{Cond, CondExpr, CondId};
use crate::globvar::{GlobVar, GlobVarId, VarLife};
use crate::modif::{Modif, ModifId, ModifKind, ModifNext, ModifPos, RedirectDest};
use crate::writer::{self, PatchedBinary};
use crate::PatchError;

/// How the patcher deals with the stack around injected code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackPolicy {
    /// Use the stack in place.
    Keep,
    /// Move below the stack pointer before saving state.
    Move,
    /// Shift every stack access by a fixed amount.
    Shift(i64),
}

/// An external library added or renamed by the session.
#[derive(Clone, Debug)]
pub struct ModifLib {
    /// The current name of the library.
    pub name: String,
    /// The name the library had before a rename, if any.
    pub renamed_from: Option<String>,
    /// Function renames inside the library, as `(old, new)` pairs.
    pub fct_renames: Vec<(String, String)>,
}

/// A patching session over one disassembled file.
///
/// Requests accumulate without touching the instruction graph; the
/// [`commit`] entry point materialises them all at once.
///
/// [`commit`]: #method.commit
pub struct PatchFile {
    pub(crate) modifs: Vec<Modif>,
    pub(crate) conds: Vec<Cond>,
    pub(crate) globvars: Vec<GlobVar>,
    pub(crate) libs: Vec<ModifLib>,
    pub(crate) new_labels: Vec<Label>,
    pub(crate) stack_policy: StackPolicy,
    pub(crate) padding: Instruction,
    pub(crate) default_padding_len: usize,
    pub(crate) track: bool,
    pub(crate) address_map: Option<Vec<(u64, u64)>>,
    pub(crate) param_fixups: Vec<(ModifId, u16, GlobVarId)>,
    plan: Option<PatchedBinary>,
    committed: bool,
}

impl PatchFile {
    /// Opens a modification session over a disassembled file.
    ///
    /// The default padding instruction is the architecture's canonical
    /// no-operation.
    pub fn new(af: &AsmFile, stack_policy: StackPolicy) -> Self {
        let padding = af.arch().gen_nop();
        let default_padding_len = padding.byte_size();
        PatchFile {
            modifs: Vec::new(),
            conds: Vec::new(),
            globvars: Vec::new(),
            libs: Vec::new(),
            new_labels: Vec::new(),
            stack_policy,
            padding,
            default_padding_len,
            track: false,
            address_map: None,
            param_fixups: Vec::new(),
            plan: None,
            committed: false,
        }
    }

    /// The stack policy of the session.
    pub fn stack_policy(&self) -> StackPolicy {
        self.stack_policy
    }

    /// The session's current padding instruction.
    pub fn padding(&self) -> &Instruction {
        &self.padding
    }

    /// Immutable access to a modification.
    pub fn modif(&self, id: ModifId) -> Option<&Modif> {
        self.modifs.get(id.0 as usize)
    }

    /// All modifications, in insertion order.
    pub fn modifs(&self) -> &[Modif] {
        &self.modifs
    }

    /// Immutable access to a condition.
    pub fn cond(&self, id: CondId) -> Option<&Cond> {
        self.conds.get(id.0 as usize)
    }

    /// Immutable access to an injected variable.
    pub fn globvar(&self, id: GlobVarId) -> Option<&GlobVar> {
        self.globvars.get(id.0 as usize)
    }

    fn anchor_at(&self, af: &AsmFile, addr: u64) -> Result<InsnId, PatchError> {
        af.insn_at(addr)
            .ok_or(PatchError::InstructionNotFound(addr))
    }

    fn check_conflicts(&self, anchor: InsnId, kind: &ModifKind) -> Result<(), PatchError> {
        for m in &self.modifs {
            if m.anchor == Some(anchor) && m.kind.conflicts_with(kind) {
                return Err(PatchError::ModificationConflict(m.addr));
            }
        }
        Ok(())
    }

    fn push_modif(
        &mut self,
        kind: ModifKind,
        anchor: Option<InsnId>,
        addr: u64,
        pos: ModifPos,
    ) -> ModifId {
        let id = ModifId(self.modifs.len() as u32);
        self.modifs.push(Modif::new(id, kind, anchor, addr, pos));
        debug!(id = id.0, addr, "modification registered");
        id
    }

    /// Registers an insertion of `insns` before or after the
    /// instruction at `addr`.
    pub fn insert(
        &mut self,
        af: &AsmFile,
        addr: u64,
        pos: ModifPos,
        insns: Vec<Instruction>,
    ) -> Result<ModifId, PatchError> {
        debug_assert!(pos == ModifPos::Before || pos == ModifPos::After);
        let anchor = self.anchor_at(af, addr)?;
        Ok(self.push_modif(ModifKind::Insert { insns }, Some(anchor), addr, pos))
    }

    /// Registers a floating instruction list, reached only through
    /// explicit chaining.
    pub fn insert_floating(&mut self, insns: Vec<Instruction>) -> ModifId {
        self.push_modif(ModifKind::Insert { insns }, None, u64::max_value(), ModifPos::Floating)
    }

    /// Registers the deletion of the instruction at `addr`.
    pub fn delete(&mut self, af: &AsmFile, addr: u64) -> Result<ModifId, PatchError> {
        let anchor = self.anchor_at(af, addr)?;
        self.check_conflicts(anchor, &ModifKind::Delete)?;
        Ok(self.push_modif(ModifKind::Delete, Some(anchor), addr, ModifPos::Replace))
    }

    /// Registers the replacement of the instruction at `addr`.
    pub fn replace(
        &mut self,
        af: &AsmFile,
        addr: u64,
        insns: Vec<Instruction>,
    ) -> Result<ModifId, PatchError> {
        let anchor = self.anchor_at(af, addr)?;
        let kind = ModifKind::Replace { insns };
        self.check_conflicts(anchor, &kind)?;
        Ok(self.push_modif(kind, Some(anchor), addr, ModifPos::Replace))
    }

    /// Registers an in-place rewrite of the instruction at `addr`.
    pub fn modify(
        &mut self,
        af: &AsmFile,
        addr: u64,
        opcode: Option<u16>,
        operands: Option<Vec<Operand>>,
    ) -> Result<ModifId, PatchError> {
        let anchor = self.anchor_at(af, addr)?;
        let kind = ModifKind::Modify {
            opcode,
            operands,
            pad: true,
        };
        self.check_conflicts(anchor, &kind)?;
        Ok(self.push_modif(kind, Some(anchor), addr, ModifPos::Replace))
    }

    /// Marks the block around the instruction at `addr` as movable into
    /// the displaced code section.
    pub fn relocate(&mut self, af: &AsmFile, addr: u64) -> Result<ModifId, PatchError> {
        let anchor = self.anchor_at(af, addr)?;
        Ok(self.push_modif(ModifKind::Relocate, Some(anchor), addr, ModifPos::Keep))
    }

    /// Points the branch instruction at `addr` to a new destination.
    pub fn redirect_branch(
        &mut self,
        af: &AsmFile,
        addr: u64,
        dest: RedirectDest,
        update_if_patched: bool,
    ) -> Result<ModifId, PatchError> {
        let anchor = self.anchor_at(af, addr)?;
        if af.insn(anchor).branch_pointer().is_none() {
            return Err(PatchError::OperandTypeMismatch);
        }
        Ok(self.push_modif(
            ModifKind::Redirect {
                dest,
                update_if_patched,
            },
            Some(anchor),
            addr,
            ModifPos::Keep,
        ))
    }

    /// Builds a comparison condition.
    pub fn cond_comp(&mut self, op: Comparison, oprnd: Operand, value: i64) -> CondId {
        let id = CondId(self.conds.len() as u32);
        self.conds.push(Cond {
            id,
            expr: CondExpr::Comp { op, oprnd, value },
        });
        id
    }

    /// Builds the conjunction of two conditions.
    pub fn cond_and(&mut self, left: CondId, right: CondId) -> CondId {
        let id = CondId(self.conds.len() as u32);
        self.conds.push(Cond {
            id,
            expr: CondExpr::And(left, right),
        });
        id
    }

    /// Builds the disjunction of two conditions.
    pub fn cond_or(&mut self, left: CondId, right: CondId) -> CondId {
        let id = CondId(self.conds.len() as u32);
        self.conds.push(Cond {
            id,
            expr: CondExpr::Or(left, right),
        });
        id
    }

    /// Guards a modification's body with a condition.
    pub fn add_cond(&mut self, modif: ModifId, cond: CondId) -> Result<(), PatchError> {
        let m = self
            .modifs
            .get_mut(modif.0 as usize)
            .ok_or(PatchError::InstructionNotFound(0))?;
        m.cond = Some(cond);
        Ok(())
    }

    /// Binds the modification executed when `modif`'s condition is
    /// false.
    pub fn add_else(&mut self, modif: ModifId, elsemod: ModifId) -> Result<(), PatchError> {
        if self.modifs.get(elsemod.0 as usize).is_none() {
            return Err(PatchError::InstructionNotFound(0));
        }
        let m = self
            .modifs
            .get_mut(modif.0 as usize)
            .ok_or(PatchError::InstructionNotFound(0))?;
        m.else_modif = Some(elsemod);
        Ok(())
    }

    /// Overrides where control flows after a modification's body.
    pub fn set_next(&mut self, modif: ModifId, next: ModifNext) -> Result<(), PatchError> {
        let m = self
            .modifs
            .get_mut(modif.0 as usize)
            .ok_or(PatchError::InstructionNotFound(0))?;
        m.next = Some(next);
        Ok(())
    }

    /// Freezes or unfreezes a modification. Refused once the
    /// modification has been committed.
    pub fn set_fixed(&mut self, modif: ModifId, fixed: bool) -> Result<(), PatchError> {
        let m = self
            .modifs
            .get_mut(modif.0 as usize)
            .ok_or(PatchError::InstructionNotFound(0))?;
        if m.processed {
            return Err(PatchError::ModifFixed(modif.0));
        }
        m.fixed = fixed;
        Ok(())
    }

    fn padding_len(af: &AsmFile, insn: &Instruction) -> Result<usize, PatchError> {
        match insn.coding() {
            Some(c) => Ok(c.byte_len()),
            None => Ok(af.arch().encode_insn(insn)?.byte_len()),
        }
    }

    /// Overrides the session's padding instruction.
    ///
    /// Candidates longer than the architecture's default no-operation
    /// are rejected and the session padding stays unchanged.
    pub fn set_padding(&mut self, af: &AsmFile, insn: Instruction) -> Result<(), PatchError> {
        if Self::padding_len(af, &insn)? > self.default_padding_len {
            return Err(PatchError::PaddingTooLarge);
        }
        self.padding = insn;
        Ok(())
    }

    /// Overrides the padding instruction of one modification.
    pub fn set_modif_padding(
        &mut self,
        af: &AsmFile,
        modif: ModifId,
        insn: Instruction,
    ) -> Result<(), PatchError> {
        let len = Self::padding_len(af, &insn)?;
        if len > self.default_padding_len {
            return Err(PatchError::PaddingTooLarge);
        }
        let m = self
            .modifs
            .get_mut(modif.0 as usize)
            .ok_or(PatchError::InstructionNotFound(0))?;
        if m.padding.is_some() {
            return Err(PatchError::ModifHasCustomPadding);
        }
        m.padding = Some(insn);
        Ok(())
    }

    /// Prepends an instruction to a modification's body.
    ///
    /// Used to compose call parameters in front of an injected call.
    pub fn body_prepend(
        &mut self,
        modif: ModifId,
        insn: Instruction,
    ) -> Result<(), PatchError> {
        let m = self
            .modifs
            .get_mut(modif.0 as usize)
            .ok_or(PatchError::InstructionNotFound(0))?;
        match &mut m.kind {
            ModifKind::Insert { insns } | ModifKind::Replace { insns } => {
                insns.insert(0, insn);
                Ok(())
            }
            _ => Err(PatchError::OperandTypeMismatch),
        }
    }

    /// Queues a call parameter loading the address of an injected
    /// variable; the instruction is prepended once the variable has an
    /// address.
    pub fn param_from_globvar(
        &mut self,
        modif: ModifId,
        reg: u16,
        var: GlobVarId,
    ) -> Result<(), PatchError> {
        if self.modifs.get(modif.0 as usize).is_none() {
            return Err(PatchError::InstructionNotFound(0));
        }
        if self.globvars.get(var.0 as usize).is_none() {
            return Err(PatchError::InstructionNotFound(0));
        }
        self.param_fixups.push((modif, reg, var));
        Ok(())
    }

    /// Adds an external library dependency.
    pub fn lib_add(&mut self, name: impl Into<String>) -> usize {
        self.libs.push(ModifLib {
            name: name.into(),
            renamed_from: None,
            fct_renames: Vec::new(),
        });
        self.libs.len() - 1
    }

    /// Renames an external library.
    pub fn lib_rename(&mut self, old: &str, new: impl Into<String>) -> Result<(), PatchError> {
        let new = new.into();
        if self.libs.iter().any(|l| l.name == new) {
            return Err(PatchError::RenameCollision(new));
        }
        let lib = self
            .libs
            .iter_mut()
            .find(|l| l.name == old)
            .ok_or_else(|| PatchError::LibraryNotFound(old.to_string()))?;
        lib.renamed_from = Some(std::mem::replace(&mut lib.name, new));
        Ok(())
    }

    /// Renames a function of an external library.
    pub fn extfct_rename(
        &mut self,
        lib: &str,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Result<(), PatchError> {
        let lib = self
            .libs
            .iter_mut()
            .find(|l| l.name == lib)
            .ok_or_else(|| PatchError::LibraryNotFound(lib.to_string()))?;
        lib.fct_renames.push((old.into(), new.into()));
        Ok(())
    }

    /// Creates a global variable materialised by the commit.
    pub fn globalvar_new(&mut self, size: usize, bytes: Vec<u8>) -> GlobVarId {
        let id = GlobVarId(self.globvars.len() as u32);
        self.globvars.push(GlobVar {
            id,
            size,
            bytes,
            life: VarLife::Created,
            tls: false,
            data: None,
            label: None,
            addr: None,
        });
        id
    }

    /// Creates a thread-local variable materialised by the commit.
    pub fn tlsvar_new(&mut self, size: usize, bytes: Vec<u8>) -> GlobVarId {
        let id = GlobVarId(self.globvars.len() as u32);
        self.globvars.push(GlobVar {
            id,
            size,
            bytes,
            life: VarLife::Created,
            tls: true,
            data: None,
            label: None,
            addr: None,
        });
        id
    }

    /// Queues a label to add to the patched file.
    pub fn label_add(&mut self, name: impl Into<String>, addr: u64, kind: LabelKind) {
        self.new_labels.push(Label::new(name, addr, kind));
    }

    /// Enables or disables the address tracking map.
    pub fn track_addresses(&mut self, on: bool) {
        self.track = on;
    }

    /// The address tracking map recorded by the commit, as
    /// `(original, patched)` pairs.
    pub fn address_map(&self) -> Result<&[(u64, u64)], PatchError> {
        self.address_map
            .as_deref()
            .ok_or(PatchError::AddressesNotTracked)
    }

    /// Materialises every modification without considering the session
    /// written out.
    ///
    /// The returned plan is identical to what [`commit`] produces; a
    /// later commit reuses it instead of materialising twice.
    ///
    /// [`commit`]: #method.commit
    pub fn precommit(&mut self, af: &mut AsmFile) -> Result<PatchedBinary, PatchError> {
        if self.committed {
            return Err(PatchError::AlreadyCommitted);
        }
        if self.plan.is_none() {
            let plan = self.materialise(af)?;
            self.plan = Some(plan);
        }
        Ok(self.plan.clone().unwrap())
    }

    /// Commits the session: materialises every modification and emits
    /// the patched byte streams.
    pub fn commit(&mut self, af: &mut AsmFile) -> Result<PatchedBinary, PatchError> {
        if self.committed {
            return Err(PatchError::AlreadyCommitted);
        }
        let plan = match self.plan.take() {
            Some(plan) => plan,
            None => self.materialise(af)?,
        };
        self.committed = true;
        Ok(plan)
    }

    /// Runs the commit pipeline: libraries, labels, variables, then the
    /// modifications themselves, ending with the branch relink and the
    /// byte emission.
    fn materialise(&mut self, af: &mut AsmFile) -> Result<PatchedBinary, PatchError> {
        writer::check_floating_reachable(self)?;

        // Libraries land in the image's dependency list first.
        for lib in &self.libs {
            if !af.image().ext_libs.iter().any(|l| *l == lib.name) {
                af.image_mut().add_ext_lib(lib.name.clone());
            }
        }

        // Then the queued labels.
        let labels = std::mem::replace(&mut self.new_labels, Vec::new());
        for label in labels {
            af.add_label(label);
        }

        let out = writer::materialise(af, self)?;

        for m in &mut self.modifs {
            m.processed = true;
        }
        if self.track {
            self.address_map = out.address_map.clone();
        }
        Ok(out)
    }
}
