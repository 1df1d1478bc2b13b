//! Materialisation of committed modifications and patched stream
//! emission.
//!
//! Displaced code lands in a dedicated code section reached through
//! trampolines: each modified site keeps its original size (the anchor
//! becomes a jump or padding), so no other instruction moves and no
//! instruction ever straddles a section boundary. Relative branch
//! pointers are re-derived from their targets once every address is
//! final.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use ocelot_asm::arch::ArchOps;
use ocelot_asm::asmfile::AsmFile;
use ocelot_asm::binary::{LabelKind, SectionAttrs, SectionKind};
use ocelot_asm::insn::{Annotations, Instruction};
use ocelot_asm::operand::{OperandKind, Pointer, PointerTarget};
use ocelot_asm::{InsnId, SectionId};

use crate::cond::{Cond, CondExpr, CondId};
use crate::modif::{ModifId, ModifKind, ModifNext, ModifPos, RedirectDest};
use crate::planner::{PatchFile, StackPolicy};
use crate::PatchError;

/// The name of the section receiving displaced and injected code.
pub const PATCH_CODE_SECTION: &str = ".ocelot.text";
/// The name of the section receiving injected variables.
pub const PATCH_DATA_SECTION: &str = ".ocelot.data";

/// One emitted section of the patched binary.
#[derive(Clone, Debug)]
pub struct PatchedSection {
    /// The section name.
    pub name: String,
    /// The address the section is mapped at.
    pub addr: u64,
    /// The emitted bytes.
    pub bytes: Vec<u8>,
}

/// The outcome of a commit: the patched byte streams and, when
/// tracking was enabled, the address map.
#[derive(Clone, Debug)]
pub struct PatchedBinary {
    /// Every emitted section, code first.
    pub sections: Vec<PatchedSection>,
    /// `(original, patched)` address pairs for every original
    /// instruction.
    pub address_map: Option<Vec<(u64, u64)>>,
}

/// Verifies that every floating modification is reached through a
/// chain, an else-branch or a redirection.
pub(crate) fn check_floating_reachable(pf: &PatchFile) -> Result<(), PatchError> {
    let mut reached: HashSet<ModifId> = HashSet::new();
    for m in pf.modifs() {
        if let Some(ModifNext::Modif(n)) = m.next {
            reached.insert(n);
        }
        if let Some(e) = m.else_modif {
            reached.insert(e);
        }
        if let ModifKind::Redirect {
            dest: RedirectDest::Modif(n),
            ..
        } = m.kind
        {
            reached.insert(n);
        }
    }
    for m in pf.modifs() {
        if m.is_floating() && !reached.contains(&m.id) {
            return Err(PatchError::UnreachedFloating(m.id.0));
        }
    }
    Ok(())
}

/// Where a block-internal branch goes.
enum Target {
    /// A label inside the same block.
    Label(usize),
    /// An instruction of the file.
    Insn(InsnId),
    /// The head of another modification's body.
    Modif(ModifId),
}

struct BlockInsn {
    insn: Instruction,
    target: Option<Target>,
}

/// A contiguous run of instructions emitted into the patch section.
struct Block {
    addr: u64,
    insns: Vec<BlockInsn>,
    labels: Vec<usize>,
    heads: Vec<(ModifId, usize)>,
    anchor_copy: Option<usize>,
}

impl Block {
    fn new() -> Self {
        Block {
            addr: 0,
            insns: Vec::new(),
            labels: Vec::new(),
            heads: Vec::new(),
            anchor_copy: None,
        }
    }

    fn push(&mut self, mut insn: Instruction) {
        insn.annotations_mut().add(Annotations::PATCH_NEW);
        self.insns.push(BlockInsn { insn, target: None });
    }

    fn push_jump(&mut self, mut insn: Instruction, target: Target) {
        insn.annotations_mut().add(Annotations::PATCH_NEW);
        self.insns.push(BlockInsn {
            insn,
            target: Some(target),
        });
    }

    fn new_label(&mut self) -> usize {
        self.labels.push(usize::max_value());
        self.labels.len() - 1
    }

    fn bind_label(&mut self, label: usize) {
        self.labels[label] = self.insns.len();
    }

    fn mark_head(&mut self, id: ModifId) {
        self.heads.push((id, self.insns.len()));
    }
}

/// One modified site, grouping every request sharing the anchor.
struct Group {
    anchor: InsnId,
    before: Vec<ModifId>,
    after: Vec<ModifId>,
    delete: Option<ModifId>,
    replace: Option<ModifId>,
    relocate: bool,
}

fn align_up(addr: u64, align: u64) -> u64 {
    (addr + align - 1) / align * align
}

fn insn_len(af: &AsmFile, insn: &Instruction) -> usize {
    if let Some(coding) = insn.coding() {
        return coding.byte_len();
    }
    af.arch()
        .encode_insn(insn)
        .map(|c| c.byte_len())
        .unwrap_or_else(|_| af.descriptor().insn_maxlen_bytes())
}

/// Shifts the stack displacements of a generated sequence by the
/// session's stack-shift amount.
fn apply_stack_policy(policy: StackPolicy, mut seq: Vec<Instruction>) -> Vec<Instruction> {
    if let StackPolicy::Shift(shift) = policy {
        for insn in &mut seq {
            for op in insn.operands_mut() {
                if let OperandKind::Memory(mem) = &mut op.kind {
                    if mem.offset < 0 {
                        mem.offset -= shift;
                    } else if mem.offset > 0 {
                        mem.offset += shift;
                    }
                }
            }
        }
    }
    seq
}

fn gen_cond_false(
    af: &AsmFile,
    conds: &[Cond],
    block: &mut Block,
    cid: CondId,
    false_lbl: usize,
) -> Result<(), PatchError> {
    match conds[cid.0 as usize].expr.clone() {
        CondExpr::Comp { op, oprnd, value } => {
            let seq = af.arch().gen_testcond(&oprnd, op, value)?;
            let last = seq.len() - 1;
            for (i, insn) in seq.into_iter().enumerate() {
                if i == last {
                    block.push_jump(insn, Target::Label(false_lbl));
                } else {
                    block.push(insn);
                }
            }
        }
        CondExpr::And(l, r) => {
            gen_cond_false(af, conds, block, l, false_lbl)?;
            gen_cond_false(af, conds, block, r, false_lbl)?;
        }
        CondExpr::Or(l, r) => {
            let true_lbl = block.new_label();
            gen_cond_true(af, conds, block, l, true_lbl)?;
            gen_cond_false(af, conds, block, r, false_lbl)?;
            block.bind_label(true_lbl);
        }
    }
    Ok(())
}

fn gen_cond_true(
    af: &AsmFile,
    conds: &[Cond],
    block: &mut Block,
    cid: CondId,
    true_lbl: usize,
) -> Result<(), PatchError> {
    match conds[cid.0 as usize].expr.clone() {
        CondExpr::Comp { op, oprnd, value } => {
            let seq = af.arch().gen_testcond(&oprnd, op.negated(), value)?;
            let last = seq.len() - 1;
            for (i, insn) in seq.into_iter().enumerate() {
                if i == last {
                    block.push_jump(insn, Target::Label(true_lbl));
                } else {
                    block.push(insn);
                }
            }
        }
        CondExpr::Or(l, r) => {
            gen_cond_true(af, conds, block, l, true_lbl)?;
            gen_cond_true(af, conds, block, r, true_lbl)?;
        }
        CondExpr::And(l, r) => {
            let fall = block.new_label();
            gen_cond_false(af, conds, block, l, fall)?;
            gen_cond_false(af, conds, block, r, fall)?;
            let jump = af.arch().gen_jump(Pointer::relative(0));
            block.push_jump(jump, Target::Label(true_lbl));
            block.bind_label(fall);
        }
    }
    Ok(())
}

/// Emits one modification's body into a block: optional flag save,
/// condition tests, the instruction list, the else path, the flag
/// restore and the chained jump.
fn emit_modif_body(
    af: &AsmFile,
    pf: &PatchFile,
    block: &mut Block,
    mid: ModifId,
) -> Result<(), PatchError> {
    let m = &pf.modifs()[mid.0 as usize];
    block.mark_head(mid);

    let body: Vec<Instruction> = match &m.kind {
        ModifKind::Insert { insns } | ModifKind::Replace { insns } => insns.clone(),
        _ => Vec::new(),
    };

    if let Some(cid) = m.cond {
        for insn in apply_stack_policy(pf.stack_policy(), af.arch().gen_save_flags()) {
            block.push(insn);
        }
        let false_lbl = block.new_label();
        gen_cond_false(af, &pf.conds, block, cid, false_lbl)?;
        for insn in body {
            block.push(insn);
        }
        if let Some(else_id) = m.else_modif {
            let end_lbl = block.new_label();
            let jump = af.arch().gen_jump(Pointer::relative(0));
            block.push_jump(jump, Target::Label(end_lbl));
            block.bind_label(false_lbl);
            block.mark_head(else_id);
            if let ModifKind::Insert { insns } = &pf.modifs()[else_id.0 as usize].kind {
                for insn in insns {
                    let mut insn = insn.clone();
                    insn.annotations_mut().add(Annotations::ELSE_BRANCH);
                    block.push(insn);
                }
            }
            block.bind_label(end_lbl);
        } else {
            block.bind_label(false_lbl);
        }
        for insn in apply_stack_policy(pf.stack_policy(), af.arch().gen_restore_flags()) {
            block.push(insn);
        }
    } else {
        for insn in body {
            block.push(insn);
        }
    }

    if let Some(next) = m.next {
        let jump = af.arch().gen_jump(Pointer::relative(0));
        match next {
            ModifNext::Modif(n) => block.push_jump(jump, Target::Modif(n)),
            ModifNext::Insn(i) => block.push_jump(jump, Target::Insn(i)),
        }
    }
    Ok(())
}

/// Runs the whole materialisation: block building, layout, anchor
/// rewrites, redirections, the final branch relink and the byte
/// emission.
pub(crate) fn materialise(
    af: &mut AsmFile,
    pf: &mut PatchFile,
) -> Result<PatchedBinary, PatchError> {
    // Seed the address map before anything moves.
    let mut map: Vec<(u64, u64)> = af
        .iter()
        .map(|id| (af.insn(id).address(), af.insn(id).address()))
        .collect();
    map.sort_unstable();
    let map_index: HashMap<u64, usize> =
        map.iter().enumerate().map(|(i, e)| (e.0, i)).collect();

    // Section bases: injected data first, displaced code after it.
    let max_end = af
        .image()
        .sections
        .iter()
        .map(|s| s.addr + s.size())
        .max()
        .unwrap_or(0);
    let data_base = align_up(max_end, 0x1000);

    // Global and TLS variables materialise before any code is laid
    // out.
    let mut data_bytes = Vec::new();
    let mut data_cursor = data_base;
    let n_vars = pf.globvars.len();
    for i in 0..n_vars {
        data_cursor = align_up(data_cursor, 8);
        while data_bytes.len() < (data_cursor - data_base) as usize {
            data_bytes.push(0);
        }
        let (size, mut bytes, vid) = {
            let var = &pf.globvars[i];
            (var.size, var.bytes.clone(), var.id)
        };
        bytes.resize(size, 0);
        data_bytes.extend_from_slice(&bytes);
        let label_id = af.add_label(ocelot_asm::binary::Label::new(
            format!("ocelot_gv_{}", vid.0),
            data_cursor,
            LabelKind::Variable,
        ));
        let data_id = af.create_data(data_cursor, size as u64, Some(label_id));
        let var = &mut pf.globvars[i];
        var.addr = Some(data_cursor);
        var.label = Some(label_id);
        var.data = Some(data_id);
        data_cursor += size as u64;
    }
    let code_base = align_up(data_cursor.max(data_base), 0x1000);

    // Call parameters referencing injected variables now know their
    // addresses.
    let fixups = std::mem::replace(&mut pf.param_fixups, Vec::new());
    for (mid, reg, vid) in fixups {
        let addr = pf.globvars[vid.0 as usize]
            .addr
            .expect("variables were materialised above");
        let load = af.arch().gen_load_address(reg, addr)?;
        if let ModifKind::Insert { insns } | ModifKind::Replace { insns } =
            &mut pf.modifs[mid.0 as usize].kind
        {
            insns.insert(0, load);
        }
    }

    // Group the anchored modifications by address.
    let mut order: Vec<ModifId> = pf
        .modifs()
        .iter()
        .filter(|m| !m.is_floating())
        .map(|m| m.id)
        .collect();
    order.sort_by_key(|id| pf.modifs()[id.0 as usize].sort_key());

    let mut groups: BTreeMap<u64, Group> = BTreeMap::new();
    for id in order {
        let m = &pf.modifs()[id.0 as usize];
        let anchor = match m.anchor {
            Some(a) => a,
            None => continue,
        };
        let group = groups.entry(m.addr).or_insert_with(|| Group {
            anchor,
            before: Vec::new(),
            after: Vec::new(),
            delete: None,
            replace: None,
            relocate: false,
        });
        match (&m.kind, m.pos) {
            (ModifKind::Insert { .. }, ModifPos::Before) => group.before.push(id),
            (ModifKind::Insert { .. }, _) => group.after.push(id),
            (ModifKind::Delete, _) => group.delete = Some(id),
            (ModifKind::Replace { .. }, _) => group.replace = Some(id),
            (ModifKind::Relocate, _) => group.relocate = true,
            (ModifKind::Modify { .. }, _) | (ModifKind::Redirect { .. }, _) => {}
        }
    }

    // Original successors, recorded before any block instruction is
    // appended to the list.
    let succ_of: HashMap<u64, Option<InsnId>> = groups
        .iter()
        .map(|(addr, g)| (*addr, af.next_of(g.anchor)))
        .collect();

    // In-place rewrites happen first so displaced copies carry them.
    for m in pf.modifs() {
        if let ModifKind::Modify {
            opcode, operands, ..
        } = &m.kind
        {
            let anchor = m.anchor.expect("modify always has an anchor");
            let insn = af.insn_mut(anchor);
            if let Some(op) = opcode {
                insn.set_opcode(*op);
            }
            if let Some(ops) = operands {
                *insn.operands_mut() = ops.clone();
            }
            insn.annotations_mut().add(Annotations::PATCHED);
            insn.annotations_mut().add(Annotations::HAS_MODIF);
        }
    }

    // Build the displaced blocks.
    let mut blocks: Vec<(Option<u64>, Block)> = Vec::new();
    let mut block_of_addr: HashMap<u64, usize> = HashMap::new();
    for (addr, group) in &groups {
        let anchor_len = af.insn(group.anchor).byte_size();
        let in_place_replace = group.replace.map_or(false, |rid| {
            if group.before.is_empty() && group.after.is_empty() && !group.relocate {
                if let ModifKind::Replace { insns } = &pf.modifs()[rid.0 as usize].kind {
                    return insns.len() == 1 && insn_len(af, &insns[0]) == anchor_len;
                }
            }
            false
        });
        let needs_block = !group.before.is_empty()
            || !group.after.is_empty()
            || group.relocate
            || (group.replace.is_some() && !in_place_replace);
        if !needs_block {
            continue;
        }

        let mut block = Block::new();
        for mid in &group.before {
            emit_modif_body(af, pf, &mut block, *mid)?;
        }
        if let Some(rid) = group.replace {
            emit_modif_body(af, pf, &mut block, rid)?;
        } else if group.delete.is_none() {
            let mut copy = af.insn(group.anchor).clone();
            copy.annotations_mut().add(Annotations::PATCH_MOVED);
            block.anchor_copy = Some(block.insns.len());
            block.insns.push(BlockInsn {
                insn: copy,
                target: None,
            });
        }
        for mid in &group.after {
            emit_modif_body(af, pf, &mut block, *mid)?;
        }
        // Fall back to the anchor's successor.
        if let Some(succ) = succ_of.get(addr).copied().flatten() {
            let jump = af.arch().gen_jump(Pointer::relative(0));
            block.push_jump(jump, Target::Insn(succ));
        }
        block_of_addr.insert(*addr, blocks.len());
        blocks.push((Some(*addr), block));
    }

    // Floating bodies come last. Else-bodies were inlined on their
    // condition's false path already.
    let else_inlined: HashSet<ModifId> = pf.modifs().iter().filter_map(|m| m.else_modif).collect();
    for m in pf.modifs() {
        if m.is_floating() && !else_inlined.contains(&m.id) {
            let mut block = Block::new();
            emit_modif_body(af, pf, &mut block, m.id)?;
            blocks.push((None, block));
        }
    }

    // Layout: assign every block instruction its final address.
    let mut cursor = code_base;
    let mut insn_addrs: Vec<Vec<u64>> = Vec::new();
    for (_, block) in blocks.iter_mut() {
        block.addr = cursor;
        let mut addrs = Vec::with_capacity(block.insns.len());
        for bi in &block.insns {
            addrs.push(cursor);
            cursor += insn_len(af, &bi.insn) as u64;
        }
        insn_addrs.push(addrs);
    }
    let patch_end = cursor;

    // Heads of every modification body, for chains and redirections.
    let mut head_addr: HashMap<ModifId, u64> = HashMap::new();
    for (bidx, (_, block)) in blocks.iter().enumerate() {
        for (mid, idx) in &block.heads {
            let addr = if *idx < insn_addrs[bidx].len() {
                insn_addrs[bidx][*idx]
            } else {
                block.addr
            };
            head_addr.insert(*mid, addr);
        }
    }

    // The patch section exists from here on.
    let patch_sid = af.image_mut().add_code_section(
        PATCH_CODE_SECTION,
        code_base,
        Vec::new(),
        SectionAttrs::STD_CODE.with(SectionAttrs::PATCHED),
    );

    // Append the block instructions, resolving their branches.
    for (bidx, (_, block)) in blocks.iter().enumerate() {
        let end_addr = match insn_addrs[bidx].last() {
            Some(last) => *last,
            None => block.addr,
        };
        for (idx, bi) in block.insns.iter().enumerate() {
            let mut insn = bi.insn.clone();
            insn.set_address(insn_addrs[bidx][idx]);
            insn.set_section(patch_sid);
            match &bi.target {
                Some(Target::Label(l)) => {
                    let lidx = block.labels[*l];
                    let dest = if lidx < insn_addrs[bidx].len() {
                        insn_addrs[bidx][lidx]
                    } else {
                        end_addr
                    };
                    if let Some(ptr) = insn.branch_pointer_mut() {
                        ptr.target = PointerTarget::None;
                    }
                    let addr = insn.address();
                    if let Some(ptr) = insn.branch_pointer_mut() {
                        ptr.set_addr(addr, dest);
                    }
                }
                Some(Target::Insn(tid)) => {
                    if let Some(ptr) = insn.branch_pointer_mut() {
                        ptr.target = PointerTarget::Insn(*tid);
                        ptr.offset_in_target = 0;
                    }
                }
                Some(Target::Modif(mid)) => {
                    let dest = head_addr.get(mid).copied().unwrap_or(block.addr);
                    let addr = insn.address();
                    if let Some(ptr) = insn.branch_pointer_mut() {
                        ptr.target = PointerTarget::None;
                        ptr.set_addr(addr, dest);
                    }
                }
                None => {}
            }
            af.append(insn);
        }
    }

    // Rewrite the anchor sites.
    for (addr, group) in &groups {
        if let Some(bidx) = block_of_addr.get(addr) {
            let block = &blocks[*bidx].1;
            // The displaced copy is where the original now lives.
            let new_addr = block
                .anchor_copy
                .and_then(|i| insn_addrs[*bidx].get(i).copied())
                .unwrap_or(block.addr);
            if let Some(slot) = map_index.get(addr) {
                map[*slot].1 = new_addr;
            }

            let anchor = group.anchor;
            let old = af.insn(anchor).clone();
            let mut jump = af
                .arch()
                .gen_jump(Pointer::absolute(blocks[*bidx].1.addr));
            jump.set_address(old.address());
            if let Some(sid) = old.section() {
                jump.set_section(sid);
            }
            let mut anno = old
                .annotations()
                .union(Annotations::PATCHED)
                .union(Annotations::HAS_MODIF);
            if group.replace.is_some() || group.delete.is_some() {
                anno.add(Annotations::PATCH_DELETED);
            } else {
                anno.add(Annotations::PATCH_MOVED);
            }
            *jump.annotations_mut() = anno;
            *af.insn_mut(anchor) = jump;
        } else if let Some(did) = group.delete {
            // Lone deletion: padding of identical byte length in place.
            let padding = pf.modifs()[did.0 as usize]
                .padding
                .clone()
                .unwrap_or_else(|| pf.padding.clone());
            substitute_in_place(af, group.anchor, padding, Annotations::PATCH_DELETED);
        } else if let Some(rid) = group.replace {
            // Same-size replacement in place; inbound branches stay.
            if let ModifKind::Replace { insns } = &pf.modifs()[rid.0 as usize].kind {
                let repl = insns[0].clone();
                substitute_in_place(af, group.anchor, repl, Annotations::PATCH_NEW);
            }
        }
    }

    // Inbound branches into a replaced instruction reroute to its
    // successor.
    let mut reroutes: Vec<(InsnId, InsnId)> = Vec::new();
    for (addr, group) in &groups {
        if group.replace.is_some() && block_of_addr.contains_key(addr) {
            if let Some(succ) = succ_of.get(addr).copied().flatten() {
                for id in af.iter().collect::<Vec<_>>() {
                    if let Some(ptr) = af.insn(id).branch_pointer() {
                        if ptr.target == PointerTarget::Insn(group.anchor) {
                            reroutes.push((id, succ));
                        }
                    }
                }
            }
        }
    }
    for (id, succ) in reroutes {
        if let Some(ptr) = af.insn_mut(id).branch_pointer_mut() {
            ptr.target = PointerTarget::Insn(succ);
            ptr.offset_in_target = 0;
        }
        af.insn_mut(id).annotations_mut().add(Annotations::PATCHED);
    }

    // Branch redirections.
    apply_redirects(af, pf, &groups, &block_of_addr, &blocks, &head_addr)?;

    // Relink: every branch pointer with a materialised instruction
    // target re-derives its address.
    let all: Vec<InsnId> = af.iter().collect();
    for id in &all {
        let (owner_addr, dest) = {
            let insn = af.insn(*id);
            match insn.branch_pointer() {
                Some(ptr) => match ptr.target {
                    PointerTarget::Insn(tid) if af.is_live(tid) => (
                        insn.address(),
                        Some(af.insn(tid).address() as i64 + ptr.offset_in_target),
                    ),
                    _ => (insn.address(), None),
                },
                None => (0, None),
            }
        };
        if let Some(dest) = dest {
            let mut changed = false;
            if let Some(ptr) = af.insn_mut(*id).branch_pointer_mut() {
                let before = ptr.addr;
                ptr.set_addr(owner_addr, dest as u64);
                changed = ptr.addr != before;
            }
            // A moved destination invalidates the stored coding.
            if changed {
                af.insn_mut(*id).annotations_mut().add(Annotations::PATCHED);
            }
        }
    }

    // Emit the byte streams.
    let mut out_sections = Vec::new();
    let code_sids: Vec<SectionId> = af
        .image()
        .sections
        .iter()
        .enumerate()
        .filter(|(_, s)| s.kind == SectionKind::Code)
        .map(|(i, _)| SectionId(i as u16))
        .collect();
    for sid in code_sids {
        let (name, addr) = {
            let s = af.image().section(sid);
            (s.name.clone(), s.addr)
        };
        let mut bytes = Vec::new();
        for id in af.iter().collect::<Vec<_>>() {
            if af.insn(id).section() != Some(sid) {
                continue;
            }
            let insn = af.insn(id);
            let modified = insn.annotations().has(Annotations::PATCH_NEW)
                || insn.annotations().has(Annotations::PATCHED);
            let coding = if modified {
                af.arch().encode_insn(insn)?
            } else {
                insn.coding().cloned().ok_or(PatchError::OperandTypeMismatch)?
            };
            bytes.extend_from_slice(coding.bytes());
        }
        if sid == patch_sid {
            af.image_mut().sections[sid.0 as usize].bytes = bytes.clone();
        }
        out_sections.push(PatchedSection { name, addr, bytes });
    }
    if !data_bytes.is_empty() {
        af.image_mut()
            .add_data_section(PATCH_DATA_SECTION, data_base, data_bytes.clone());
        out_sections.push(PatchedSection {
            name: PATCH_DATA_SECTION.to_string(),
            addr: data_base,
            bytes: data_bytes,
        });
    }

    debug!(
        blocks = blocks.len(),
        patch_len = patch_end - code_base,
        "modifications materialised"
    );

    Ok(PatchedBinary {
        sections: out_sections,
        address_map: if pf.track { Some(map) } else { None },
    })
}

/// Replaces the content of an instruction in place, keeping its
/// address, section and size.
fn substitute_in_place(af: &mut AsmFile, anchor: InsnId, with: Instruction, extra: Annotations) {
    let old = af.insn(anchor).clone();
    let mut new = with;
    new.set_address(old.address());
    if let Some(sid) = old.section() {
        new.set_section(sid);
    }
    let mut anno = old
        .annotations()
        .union(Annotations::PATCHED)
        .union(Annotations::HAS_MODIF);
    anno.add(extra);
    *new.annotations_mut() = anno;
    *af.insn_mut(anchor) = new;
}

fn apply_redirects(
    af: &mut AsmFile,
    pf: &PatchFile,
    groups: &BTreeMap<u64, Group>,
    block_of_addr: &HashMap<u64, usize>,
    blocks: &[(Option<u64>, Block)],
    head_addr: &HashMap<ModifId, u64>,
) -> Result<(), PatchError> {
    for m in pf.modifs() {
        let (dest, update_if_patched) = match &m.kind {
            ModifKind::Redirect {
                dest,
                update_if_patched,
            } => (*dest, *update_if_patched),
            _ => continue,
        };
        let branch = m.anchor.expect("redirect always has an anchor");

        match dest {
            RedirectDest::Insn(tid) => {
                let tid_addr = af.insn(tid).address();
                let diverted = update_if_patched
                    && groups
                        .get(&tid_addr)
                        .map_or(false, |g| !g.before.is_empty())
                    && block_of_addr.contains_key(&tid_addr);
                if diverted {
                    // Follow the patch: aim at the block head.
                    let bidx = block_of_addr[&tid_addr];
                    let dest_addr = blocks[bidx].1.addr;
                    let owner = af.insn(branch).address();
                    if let Some(ptr) = af.insn_mut(branch).branch_pointer_mut() {
                        ptr.target = PointerTarget::None;
                        ptr.set_addr(owner, dest_addr);
                    }
                    af.insn_mut(branch)
                        .annotations_mut()
                        .add(Annotations::PATCHED);
                } else if af.next_of(branch) == Some(tid) {
                    // Branching to the very next instruction is a
                    // removal of the branch after padding.
                    substitute_in_place(af, branch, pf.padding.clone(), Annotations::PATCHED);
                } else {
                    let owner = af.insn(branch).address();
                    let dest_addr = af.insn(tid).address();
                    if let Some(ptr) = af.insn_mut(branch).branch_pointer_mut() {
                        ptr.target = PointerTarget::Insn(tid);
                        ptr.offset_in_target = 0;
                        ptr.set_addr(owner, dest_addr);
                    }
                    af.insn_mut(branch)
                        .annotations_mut()
                        .add(Annotations::PATCHED);
                }
            }
            RedirectDest::Modif(mid) => {
                let dest_addr = head_addr
                    .get(&mid)
                    .copied()
                    .ok_or(PatchError::UnreachedFloating(mid.0))?;
                let owner = af.insn(branch).address();
                if let Some(ptr) = af.insn_mut(branch).branch_pointer_mut() {
                    ptr.target = PointerTarget::None;
                    ptr.set_addr(owner, dest_addr);
                }
                af.insn_mut(branch)
                    .annotations_mut()
                    .add(Annotations::PATCHED);
            }
        }
    }
    Ok(())
}
