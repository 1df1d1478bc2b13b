//! Incremental resolution of branch and data references.
//!
//! Every decoded instruction is fed through the resolver so that its
//! pointer operands get bound to the instructions or data entries they
//! designate. Branches whose destination has not been decoded yet are
//! queued and bound in a final pass once the whole file is known.

use tracing::trace;

use crate::asmfile::AsmFile;
use crate::operand::{OperandKind, PointerTarget};
use crate::{DataId, InsnId};

/// The resolver state carried across a disassembly run.
pub struct Resolver {
    branches: Vec<InsnId>,
}

impl Resolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Resolver {
            branches: Vec::new(),
        }
    }

    /// The branches still waiting for their destination.
    pub fn pending_branches(&self) -> &[InsnId] {
        &self.branches
    }

    /// Drops a rolled-back instruction from the pending queue.
    pub fn forget(&mut self, id: InsnId) {
        self.branches.retain(|b| *b != id);
    }

    /// Links the references of one freshly decoded instruction.
    pub fn resolve_insn(&mut self, af: &mut AsmFile, id: InsnId) {
        let insn = af.insn(id);
        let addr = insn.address();
        let size = insn.byte_size() as u64;

        let (op_idx, kind) = match insn.ref_operand() {
            Some((idx, op)) => (idx, op.kind.clone()),
            None => return,
        };

        match kind {
            OperandKind::Pointer(ptr) => {
                let dest = ptr.get_addr(addr);
                if let Some(tid) = af.insn_at(dest) {
                    self.bind_insn(af, id, op_idx, tid, 0);
                } else if let Some(did) = af.data_at(dest) {
                    self.bind_data(af, id, op_idx, did, dest);
                } else {
                    // Destination not materialised yet: check it in the
                    // final pass.
                    trace!(addr, dest, "branch destination pending");
                    self.branches.push(id);
                }
            }
            OperandKind::MemRelative(offset, _) => {
                // The referenced address accounts for the instruction's
                // own size.
                let dest = (addr as i64 + size as i64 + offset) as u64;
                let did = match af.data_at(dest) {
                    Some(did) => Some(did),
                    None => af
                        .var_label_at(dest)
                        .map(|lbl| af.create_data(dest, 0, Some(lbl))),
                };
                if let Some(did) = did {
                    let data_addr = af.data(did).addr;
                    let insn = af.insn_mut(id);
                    if let Some(op) = insn.operands_mut().get_mut(op_idx) {
                        if let Some(ptr) = op.pointer_mut() {
                            // Re-anchor the pointer so its resolved
                            // address matches the referenced one.
                            ptr.addr = size as i64 + offset;
                            ptr.target = PointerTarget::Data(did);
                            ptr.offset_in_target = dest as i64 - data_addr as i64;
                        }
                    }
                    af.link_insn_to_data(id, did);
                    trace!(addr, dest, "memory-relative operand bound to data");
                }
            }
            _ => {}
        }
    }

    /// Binds every branch whose destination was decoded after it.
    pub fn finalize(&mut self, af: &mut AsmFile) {
        let pending = std::mem::replace(&mut self.branches, Vec::new());
        for id in pending {
            if !af.is_live(id) {
                continue;
            }
            let addr = af.insn(id).address();
            let dest = match af.insn(id).branch_pointer() {
                Some(ptr) => ptr.get_addr(addr),
                None => continue,
            };
            if let Some(tid) = af.insn_at(dest) {
                self.bind_insn_ptr(af, id, tid, 0);
            } else if let Some((tid, off)) = af.insn_covering(dest) {
                self.bind_insn_ptr(af, id, tid, off as i64);
            } else if let Some(did) = af.data_at(dest) {
                let data_addr = af.data(did).addr;
                if let Some(ptr) = af.insn_mut(id).branch_pointer_mut() {
                    ptr.target = PointerTarget::Data(did);
                    ptr.offset_in_target = dest as i64 - data_addr as i64;
                }
            }
            // Destinations outside of the file stay unresolved; their
            // pointer still carries the raw address.
        }
    }

    fn bind_insn(&mut self, af: &mut AsmFile, id: InsnId, op_idx: usize, target: InsnId, off: i64) {
        let insn = af.insn_mut(id);
        if let Some(op) = insn.operands_mut().get_mut(op_idx) {
            if let Some(ptr) = op.pointer_mut() {
                ptr.target = PointerTarget::Insn(target);
                ptr.offset_in_target = off;
            }
        }
    }

    fn bind_insn_ptr(&mut self, af: &mut AsmFile, id: InsnId, target: InsnId, off: i64) {
        if let Some(ptr) = af.insn_mut(id).branch_pointer_mut() {
            ptr.target = PointerTarget::Insn(target);
            ptr.offset_in_target = off;
        }
    }

    fn bind_data(&mut self, af: &mut AsmFile, id: InsnId, op_idx: usize, did: DataId, dest: u64) {
        let data_addr = af.data(did).addr;
        let insn = af.insn_mut(id);
        if let Some(op) = insn.operands_mut().get_mut(op_idx) {
            if let Some(ptr) = op.pointer_mut() {
                ptr.target = PointerTarget::Data(did);
                ptr.offset_in_target = dest as i64 - data_addr as i64;
            }
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Resolver::new()
    }
}
