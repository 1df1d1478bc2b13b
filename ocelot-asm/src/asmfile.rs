//! The in-memory representation of a disassembled file.
//!
//! Instructions live in an arena and are chained into a doubly linked,
//! address-ordered list through stable [`InsnId`] indices. Pointers
//! between instructions and data entries only ever store those weak
//! indices; the arena owns the objects, so rollbacks and patching cannot
//! leave dangling references behind.
//!
//! [`InsnId`]: ../struct.InsnId.html

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use crate::arch::{driver_for, ArchDescriptor, ArchOps};
use crate::binary::{BinaryImage, DataEntry, Label, LabelKind, LabelTarget};
use crate::insn::Instruction;
use crate::operand::{OperandKind, PointerTarget};
use crate::{DataId, InsnId, LabelId, SectionId};

struct InsnNode {
    insn: Instruction,
    prev: Option<InsnId>,
    next: Option<InsnId>,
    live: bool,
}

/// A loaded binary together with its decoded instruction list, labels,
/// data entries and reference indexes.
pub struct AsmFile {
    arch: Box<dyn ArchOps>,
    image: BinaryImage,
    nodes: Vec<InsnNode>,
    head: Option<InsnId>,
    tail: Option<InsnId>,
    by_addr: BTreeMap<u64, InsnId>,
    labels: Vec<Label>,
    label_by_name: HashMap<String, LabelId>,
    fct_labels: Vec<LabelId>,
    var_labels: Vec<LabelId>,
    data: Vec<DataEntry>,
    data_by_addr: BTreeMap<u64, DataId>,
    insn_to_data: HashMap<InsnId, DataId>,
    data_to_insns: HashMap<DataId, Vec<InsnId>>,
    analyzed: bool,
    parse_errors: u32,
}

impl AsmFile {
    /// Wraps a binary image, loading the driver of its architecture.
    pub fn new(image: BinaryImage) -> Self {
        let arch = driver_for(image.arch_code);
        let mut af = AsmFile {
            arch,
            image,
            nodes: Vec::new(),
            head: None,
            tail: None,
            by_addr: BTreeMap::new(),
            labels: Vec::new(),
            label_by_name: HashMap::new(),
            fct_labels: Vec::new(),
            var_labels: Vec::new(),
            data: Vec::new(),
            data_by_addr: BTreeMap::new(),
            insn_to_data: HashMap::new(),
            data_to_insns: HashMap::new(),
            analyzed: false,
            parse_errors: 0,
        };
        let labels = af.image.labels.clone();
        for label in labels {
            af.add_label(label);
        }
        af
    }

    /// The architecture capability object of the file.
    pub fn arch(&self) -> &dyn ArchOps {
        self.arch.as_ref()
    }

    /// The architecture descriptor of the file.
    pub fn descriptor(&self) -> &ArchDescriptor {
        self.arch.descriptor()
    }

    /// The underlying binary image.
    pub fn image(&self) -> &BinaryImage {
        &self.image
    }

    /// Mutable access to the underlying binary image.
    pub fn image_mut(&mut self) -> &mut BinaryImage {
        &mut self.image
    }

    /// Whether the file has been disassembled.
    pub fn analyzed(&self) -> bool {
        self.analyzed
    }

    /// Marks the file as disassembled.
    pub fn set_analyzed(&mut self) {
        self.analyzed = true;
    }

    /// The number of words that failed to decode.
    pub fn parse_errors(&self) -> u32 {
        self.parse_errors
    }

    /// Bumps the decode failure counter.
    pub fn count_parse_error(&mut self) {
        self.parse_errors += 1;
    }

    /* Instruction arena */

    /// Immutable access to an instruction.
    pub fn insn(&self, id: InsnId) -> &Instruction {
        &self.nodes[id.0 as usize].insn
    }

    /// Mutable access to an instruction.
    pub fn insn_mut(&mut self, id: InsnId) -> &mut Instruction {
        &mut self.nodes[id.0 as usize].insn
    }

    /// The first instruction of the list.
    pub fn head(&self) -> Option<InsnId> {
        self.head
    }

    /// The last instruction of the list.
    pub fn tail(&self) -> Option<InsnId> {
        self.tail
    }

    /// The successor of `id` in the list.
    pub fn next_of(&self, id: InsnId) -> Option<InsnId> {
        self.nodes[id.0 as usize].next
    }

    /// The predecessor of `id` in the list.
    pub fn prev_of(&self, id: InsnId) -> Option<InsnId> {
        self.nodes[id.0 as usize].prev
    }

    /// Iterates over the instruction list in order.
    pub fn iter(&self) -> InsnIter<'_> {
        InsnIter {
            af: self,
            cur: self.head,
        }
    }

    /// The number of live instructions.
    pub fn insn_count(&self) -> usize {
        self.iter().count()
    }

    fn new_node(&mut self, insn: Instruction) -> InsnId {
        self.nodes.push(InsnNode {
            insn,
            prev: None,
            next: None,
            live: true,
        });
        InsnId((self.nodes.len() - 1) as u32)
    }

    /// Appends an instruction at the end of the list.
    pub fn append(&mut self, insn: Instruction) -> InsnId {
        let id = self.new_node(insn);
        match self.tail {
            Some(tail) => {
                self.nodes[tail.0 as usize].next = Some(id);
                self.nodes[id.0 as usize].prev = Some(tail);
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        id
    }

    /// Appends a decoded instruction and indexes it by address.
    pub fn append_decoded(&mut self, insn: Instruction) -> InsnId {
        let addr = insn.address();
        let id = self.append(insn);
        self.by_addr.insert(addr, id);
        id
    }

    /// Inserts an instruction right after `anchor`.
    pub fn insert_after(&mut self, anchor: InsnId, insn: Instruction) -> InsnId {
        let id = self.new_node(insn);
        let next = self.nodes[anchor.0 as usize].next;
        self.nodes[id.0 as usize].prev = Some(anchor);
        self.nodes[id.0 as usize].next = next;
        self.nodes[anchor.0 as usize].next = Some(id);
        match next {
            Some(n) => self.nodes[n.0 as usize].prev = Some(id),
            None => self.tail = Some(id),
        }
        id
    }

    /// Inserts an instruction right before `anchor`.
    pub fn insert_before(&mut self, anchor: InsnId, insn: Instruction) -> InsnId {
        let id = self.new_node(insn);
        let prev = self.nodes[anchor.0 as usize].prev;
        self.nodes[id.0 as usize].next = Some(anchor);
        self.nodes[id.0 as usize].prev = prev;
        self.nodes[anchor.0 as usize].prev = Some(id);
        match prev {
            Some(p) => self.nodes[p.0 as usize].next = Some(id),
            None => self.head = Some(id),
        }
        id
    }

    /// Unlinks the last instruction of the list and returns its
    /// identifier.
    ///
    /// Used by the disassembler to roll decoded instructions back.
    pub fn pop_tail(&mut self) -> Option<InsnId> {
        let tail = self.tail?;
        let prev = self.nodes[tail.0 as usize].prev;
        self.nodes[tail.0 as usize].live = false;
        self.nodes[tail.0 as usize].prev = None;
        match prev {
            Some(p) => self.nodes[p.0 as usize].next = None,
            None => self.head = None,
        }
        self.tail = prev;
        let addr = self.nodes[tail.0 as usize].insn.address();
        if self.by_addr.get(&addr) == Some(&tail) {
            self.by_addr.remove(&addr);
        }
        self.unlink_insn_refs(tail);
        Some(tail)
    }

    /// Whether `id` still belongs to the instruction list.
    pub fn is_live(&self, id: InsnId) -> bool {
        self.nodes
            .get(id.0 as usize)
            .map(|n| n.live)
            .unwrap_or(false)
    }

    /// Finds the instruction starting exactly at `addr`.
    pub fn insn_at(&self, addr: u64) -> Option<InsnId> {
        self.by_addr.get(&addr).copied()
    }

    /// Finds the instruction whose byte range covers `addr`, together
    /// with the offset of `addr` inside it.
    pub fn insn_covering(&self, addr: u64) -> Option<(InsnId, u64)> {
        let (&start, &id) = self.by_addr.range(..=addr).next_back()?;
        let size = self.insn(id).byte_size() as u64;
        if addr < start + size.max(1) {
            Some((id, addr - start))
        } else {
            None
        }
    }

    /* Labels */

    /// All labels.
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Immutable access to a label.
    pub fn label(&self, id: LabelId) -> &Label {
        &self.labels[id.0 as usize]
    }

    /// Mutable access to a label.
    pub fn label_mut(&mut self, id: LabelId) -> &mut Label {
        &mut self.labels[id.0 as usize]
    }

    /// Registers a label, keeping the sorted sweep arrays up to date.
    pub fn add_label(&mut self, mut label: Label) -> LabelId {
        if label.section.is_none() {
            label.section = self.image.section_at(label.addr);
        }
        let id = LabelId(self.labels.len() as u32);
        self.label_by_name.insert(label.name.clone(), id);
        let addr = label.addr;
        let kind = label.kind;
        self.labels.push(label);
        match kind {
            LabelKind::Function => {
                let pos = self
                    .fct_labels
                    .binary_search_by_key(&addr, |l| self.labels[l.0 as usize].addr)
                    .unwrap_or_else(|p| p);
                self.fct_labels.insert(pos, id);
            }
            LabelKind::Variable => {
                let pos = self
                    .var_labels
                    .binary_search_by_key(&addr, |l| self.labels[l.0 as usize].addr)
                    .unwrap_or_else(|p| p);
                self.var_labels.insert(pos, id);
            }
            _ => {}
        }
        id
    }

    /// Looks a label up by name.
    pub fn label_by_name(&self, name: &str) -> Option<LabelId> {
        self.label_by_name.get(name).copied()
    }

    /// The function labels, sorted by address.
    pub fn fct_labels(&self) -> &[LabelId] {
        &self.fct_labels
    }

    /// The index in [`fct_labels`] of the last function label at or
    /// before `addr`.
    ///
    /// [`fct_labels`]: #method.fct_labels
    pub fn last_fct_label_before(&self, addr: u64) -> Option<usize> {
        let mut out = None;
        for (i, id) in self.fct_labels.iter().enumerate() {
            if self.labels[id.0 as usize].addr <= addr {
                out = Some(i);
            } else {
                break;
            }
        }
        out
    }

    /// Finds a variable label at exactly `addr`.
    pub fn var_label_at(&self, addr: u64) -> Option<LabelId> {
        self.var_labels
            .binary_search_by_key(&addr, |l| self.labels[l.0 as usize].addr)
            .ok()
            .map(|i| self.var_labels[i])
    }

    /// The labels owned by section `sid`, sorted by address.
    pub fn section_labels(&self, sid: SectionId) -> Vec<LabelId> {
        let mut out: Vec<LabelId> = self
            .labels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.section == Some(sid))
            .map(|(i, _)| LabelId(i as u32))
            .collect();
        out.sort_by_key(|l| self.labels[l.0 as usize].addr);
        out
    }

    /* Data entries */

    /// Immutable access to a data entry.
    pub fn data(&self, id: DataId) -> &DataEntry {
        &self.data[id.0 as usize]
    }

    /// Mutable access to a data entry.
    pub fn data_mut(&mut self, id: DataId) -> &mut DataEntry {
        &mut self.data[id.0 as usize]
    }

    /// Finds the data entry at exactly `addr`.
    pub fn data_at(&self, addr: u64) -> Option<DataId> {
        self.data_by_addr.get(&addr).copied()
    }

    /// Creates a data entry, indexing it by address.
    pub fn create_data(&mut self, addr: u64, size: u64, label: Option<LabelId>) -> DataId {
        let id = DataId(self.data.len() as u32);
        self.data.push(DataEntry {
            addr,
            size,
            section: self.image.section_at(addr),
            pointer: None,
            label,
        });
        self.data_by_addr.insert(addr, id);
        if let Some(lid) = label {
            self.labels[lid.0 as usize].target = Some(LabelTarget::Data(id));
        }
        id
    }

    /* Reference indexes */

    /// Records that instruction `insn` references data entry `data`.
    ///
    /// Both directions of the index stay consistent.
    pub fn link_insn_to_data(&mut self, insn: InsnId, data: DataId) {
        self.insn_to_data.insert(insn, data);
        self.data_to_insns.entry(data).or_default().push(insn);
    }

    /// The data entry referenced by `insn`, if any.
    pub fn data_ref_of(&self, insn: InsnId) -> Option<DataId> {
        self.insn_to_data.get(&insn).copied()
    }

    /// The instructions referencing `data`.
    pub fn insns_referencing(&self, data: DataId) -> &[InsnId] {
        self.data_to_insns
            .get(&data)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Drops every reference-index entry involving `insn`.
    pub fn unlink_insn_refs(&mut self, insn: InsnId) {
        if let Some(data) = self.insn_to_data.remove(&insn) {
            if let Some(list) = self.data_to_insns.get_mut(&data) {
                list.retain(|i| *i != insn);
            }
        }
    }

    /* Printing */

    /// Renders one instruction as an objdump-style line: address, coding
    /// bytes, mnemonic and operands, plus a comment naming the data
    /// entry a memory-relative operand resolves to.
    pub fn print_insn(&self, id: InsnId) -> String {
        let insn = self.insn(id);
        let mut out = String::new();
        write!(out, "{:x}:\t", insn.address()).unwrap();
        if let Some(coding) = insn.coding() {
            write!(out, "{}", coding.hex()).unwrap();
        }
        write!(out, "\t{}", insn.display(self.descriptor())).unwrap();

        // Memory-relative operands resolving to a known data entry get
        // the destination spelled out.
        for op in insn.operands() {
            if let OperandKind::MemRelative(_, ptr) = &op.kind {
                if let PointerTarget::Data(did) = ptr.target {
                    let data = self.data(did);
                    let dest = data.addr as i64 + ptr.offset_in_target;
                    write!(out, "\t# {:#x} <", dest).unwrap();
                    match data.label {
                        Some(lid) => write!(out, "{}", self.label(lid).name).unwrap(),
                        None => write!(out, "{:#x}", data.addr).unwrap(),
                    }
                    if ptr.offset_in_target != 0 {
                        write!(out, "+{:#x}", ptr.offset_in_target).unwrap();
                    }
                    write!(out, ">").unwrap();
                }
            }
        }
        out
    }

    /// Renders the whole instruction list, with a label header before
    /// each function entry point.
    pub fn print_listing(&self) -> String {
        let mut out = String::new();
        for id in self.iter() {
            let insn = self.insn(id);
            if let Some(lid) = insn.fct_label() {
                if self.label(lid).addr == insn.address() {
                    writeln!(out, "{:016x} <{}>:", insn.address(), self.label(lid).name)
                        .unwrap();
                }
            }
            writeln!(out, "{}", self.print_insn(id)).unwrap();
        }
        out
    }
}

/// Iterator over the instruction list of an [`AsmFile`].
///
/// [`AsmFile`]: struct.AsmFile.html
pub struct InsnIter<'a> {
    af: &'a AsmFile,
    cur: Option<InsnId>,
}

impl Iterator for InsnIter<'_> {
    type Item = InsnId;

    fn next(&mut self) -> Option<InsnId> {
        let cur = self.cur?;
        self.cur = self.af.next_of(cur);
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchCode;
    use crate::binary::FileType;
    use crate::insn::Coding;

    fn empty_file() -> AsmFile {
        AsmFile::new(BinaryImage::new(
            "test",
            ArchCode::A64,
            FileType::Executable,
        ))
    }

    fn stub_insn(addr: u64) -> Instruction {
        let mut insn = Instruction::bad(ArchCode::A64);
        insn.set_address(addr);
        insn.set_coding(Coding::new(vec![0; 4], 32));
        insn
    }

    #[test]
    fn list_linkage_is_consistent() {
        let mut af = empty_file();
        let a = af.append_decoded(stub_insn(0x1000));
        let b = af.append_decoded(stub_insn(0x1004));
        let c = af.append_decoded(stub_insn(0x1008));

        assert_eq!(af.head(), Some(a));
        assert_eq!(af.tail(), Some(c));
        assert_eq!(af.next_of(a), Some(b));
        assert_eq!(af.prev_of(c), Some(b));
        assert_eq!(af.iter().collect::<Vec<_>>(), vec![a, b, c]);
    }

    #[test]
    fn pop_tail_rolls_back() {
        let mut af = empty_file();
        let a = af.append_decoded(stub_insn(0x1000));
        let b = af.append_decoded(stub_insn(0x1004));

        assert_eq!(af.pop_tail(), Some(b));
        assert!(!af.is_live(b));
        assert_eq!(af.tail(), Some(a));
        assert_eq!(af.insn_at(0x1004), None);
        assert_eq!(af.insn_at(0x1000), Some(a));
    }

    #[test]
    fn insert_around_an_anchor() {
        let mut af = empty_file();
        let b = af.append(stub_insn(0x1004));
        let a = af.insert_before(b, stub_insn(0x1000));
        let c = af.insert_after(b, stub_insn(0x1008));

        assert_eq!(af.iter().collect::<Vec<_>>(), vec![a, b, c]);
        assert_eq!(af.head(), Some(a));
        assert_eq!(af.tail(), Some(c));
    }

    #[test]
    fn covering_lookup_accounts_for_size() {
        let mut af = empty_file();
        let a = af.append_decoded(stub_insn(0x1000));
        assert_eq!(af.insn_covering(0x1002), Some((a, 2)));
        assert_eq!(af.insn_covering(0x1004), None);
    }

    #[test]
    fn function_labels_stay_sorted() {
        let mut af = empty_file();
        af.add_label(Label::new("b", 0x2000, LabelKind::Function));
        af.add_label(Label::new("a", 0x1000, LabelKind::Function));
        af.add_label(Label::new("v", 0x3000, LabelKind::Variable));

        let addrs: Vec<u64> = af
            .fct_labels()
            .iter()
            .map(|l| af.label(*l).addr)
            .collect();
        assert_eq!(addrs, vec![0x1000, 0x2000]);
        assert_eq!(af.last_fct_label_before(0x1fff), Some(0));
        assert_eq!(af.last_fct_label_before(0x2000), Some(1));
        assert_eq!(af.last_fct_label_before(0x0fff), None);
        assert!(af.var_label_at(0x3000).is_some());
    }

    #[test]
    fn reference_indexes_stay_bidirectional() {
        let mut af = empty_file();
        let i = af.append_decoded(stub_insn(0x1000));
        let d = af.create_data(0x2000, 8, None);

        af.link_insn_to_data(i, d);
        assert_eq!(af.data_ref_of(i), Some(d));
        assert_eq!(af.insns_referencing(d), &[i]);

        af.unlink_insn_refs(i);
        assert_eq!(af.data_ref_of(i), None);
        assert!(af.insns_referencing(d).is_empty());
    }
}
