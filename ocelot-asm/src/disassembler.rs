//! Section-level disassembly orchestration.
//!
//! The disassembler walks every code section of a binary image and feeds
//! its bytes through the LR(0) parser, taking care of everything the
//! parser itself does not know about: code byte ordering, instruction
//! set switches in the middle of a stream, resynchronisation on function
//! boundaries and the incremental linking of references.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::arch::{driver_for, ArchCode, ArchOps, CodeEndianness, SwitchProbe};
use crate::asmfile::AsmFile;
use crate::binary::{Label, LabelTarget, SectionAttrs, SectionKind};
use crate::fsm::Parser;
use crate::insn::{Annotations, Coding, Instruction, BAD_OPCODE};
use crate::operand::Pointer;
use crate::resolver::Resolver;
use crate::{DataId, DisassError, SectionId};

/// The outcome of a disassembly run over a whole file.
///
/// A non-zero error count is a warning, not a failure: the instruction
/// list is consistent and contains `(bad)` markers where words could not
/// be decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisassReport {
    /// The number of words that could not be decoded.
    pub parse_errors: u32,
}

/// Disassembles every code section of the file.
pub fn disassemble(af: &mut AsmFile) -> Result<DisassReport, DisassError> {
    let code_sections: Vec<SectionId> = af
        .image()
        .sections
        .iter()
        .enumerate()
        .filter(|(_, s)| s.kind == SectionKind::Code)
        .map(|(i, _)| SectionId(i as u16))
        .collect();
    if code_sections.is_empty() {
        return Err(DisassError::NoCode);
    }

    let mut resolver = Resolver::new();

    // Materialise relocation sites as data entries whose pointers await
    // the instruction they designate, ordered by destination.
    let mut relocs: Vec<(u64, u64)> = af
        .image()
        .relocations
        .iter()
        .map(|r| (r.dest, r.addr))
        .collect();
    relocs.sort_unstable();
    let mut unlinked: VecDeque<(u64, DataId)> = VecDeque::new();
    for (dest, site) in relocs {
        let did = af.create_data(site, 8, None);
        af.data_mut(did).pointer = Some(Pointer::absolute(dest));
        unlinked.push_back((dest, did));
    }

    for sid in code_sections {
        stream_parse(af, sid, &mut resolver, &mut unlinked)?;
    }

    resolver.finalize(af);
    detect_gaps(af);
    af.set_analyzed();

    let report = DisassReport {
        parse_errors: af.parse_errors(),
    };
    if report.parse_errors > 0 {
        warn!(
            errors = report.parse_errors,
            "disassembly completed with undecodable words"
        );
    }
    Ok(report)
}

fn section_annotations(attrs: SectionAttrs) -> Annotations {
    let mut out = Annotations::empty();
    if attrs.has(SectionAttrs::STD_CODE) {
        out.add(Annotations::STD_CODE);
    }
    if attrs.has(SectionAttrs::EXT_FCT_STUBS) {
        out.add(Annotations::EXT_STUB);
    }
    if attrs.has(SectionAttrs::PATCHED) {
        out.add(Annotations::PATCHED);
    }
    out
}

/// Applies the byte reordering the current instruction set demands over
/// the window `[nb_parsed, nb_parsed + max_bytes)`, rolling back any
/// previous reordering done under different rules.
///
/// `inverted` tracks how many bytes past `nb_parsed` currently hold
/// reordered contents; the pristine buffer is the rollback source.
fn apply_code_swap(
    buf: &mut [u8],
    pristine: &[u8],
    nb_parsed: usize,
    inverted: &mut usize,
    prev: CodeEndianness,
    cur: CodeEndianness,
    max_bytes: usize,
) {
    let group = match cur.group_size() {
        Some(group) => group,
        None => {
            if *inverted > 0 {
                let end = (nb_parsed + *inverted).min(buf.len());
                buf[nb_parsed..end].copy_from_slice(&pristine[nb_parsed..end]);
                *inverted = 0;
            }
            return;
        }
    };

    let mut i = nb_parsed;
    if *inverted > 0 && prev != cur {
        // The previous reordering used another grouping: restore the
        // original bytes before regrouping.
        let end = (nb_parsed + *inverted).min(buf.len());
        buf[nb_parsed..end].copy_from_slice(&pristine[nb_parsed..end]);
        *inverted = 0;
    } else if *inverted > 0 {
        i = nb_parsed + *inverted;
    }

    let limit = (nb_parsed + max_bytes).min(buf.len());
    while i + group <= limit {
        buf[i..i + group].reverse();
        i += group;
    }
    *inverted = i.saturating_sub(nb_parsed);
}

fn stream_parse(
    af: &mut AsmFile,
    sid: SectionId,
    resolver: &mut Resolver,
    unlinked: &mut VecDeque<(u64, DataId)>,
) -> Result<(), DisassError> {
    let (bytes, start, attrs) = {
        let s = af.image().section(sid);
        (s.bytes.clone(), s.addr, s.attrs)
    };
    let pristine = bytes.clone();
    let bslen = bytes.len();
    let scn_anno = section_annotations(attrs);
    debug!(section = sid.0, start, len = bslen, "parsing section");

    let mut cur_code: ArchCode = af.image().arch_code;
    let mut cur_ops: Box<dyn ArchOps> = driver_for(cur_code);
    let mut parser = Parser::new(cur_ops.load_grammar());
    parser.set_stream(bytes, start);

    let mut cur_endian = cur_ops.descriptor().endianness;
    let mut prev_endian;
    let mut inverted: usize = 0;
    let mut errcount: u32 = 0;

    // Function label sweep state.
    let mut last_fct_idx = af.last_fct_label_before(start);
    let mut next_fct_addr = fct_addr_after(af, last_fct_idx, start, bslen);

    // Labels owned by the section, for target binding and the
    // interworking probe.
    let scn_labels = af.section_labels(sid);
    let probe_labels: Vec<Label> = scn_labels.iter().map(|l| af.label(*l).clone()).collect();
    let mut lblidx = 0;
    while lblidx < scn_labels.len() && af.label(scn_labels[lblidx]).addr < start {
        lblidx += 1;
    }

    let mut current_addr = parser.current_addr();

    loop {
        // Bytes consumed by the last word shrink the reordered window.
        let new_addr = parser.current_addr();
        inverted = inverted.saturating_sub((new_addr - current_addr) as usize);
        current_addr = new_addr;
        let mut nb_parsed = (current_addr - start) as usize;
        if nb_parsed >= bslen {
            break;
        }

        // Interworking: ask the current instruction set whether another
        // one takes over at this address.
        let probe = SwitchProbe {
            addr: current_addr,
            current: cur_code,
            labels: &probe_labels,
        };
        if let Some(sw) = cur_ops.switch_isa(&probe) {
            if sw.code != cur_code {
                if sw.reset_addr != current_addr {
                    debug!(
                        reset = sw.reset_addr,
                        "interworking switch rewinds the stream"
                    );
                    // Undo every instruction decoded at or across the
                    // reset address, and the byte reordering with them.
                    while let Some(tail) = af.tail() {
                        let end = af.insn(tail).address() + af.insn(tail).byte_size() as u64;
                        if af.insn(tail).section() == Some(sid) && end > sw.reset_addr {
                            let id = af.pop_tail().unwrap();
                            resolver.forget(id);
                        } else {
                            break;
                        }
                    }
                    let reset_off = (sw.reset_addr - start) as usize;
                    let end = (nb_parsed + inverted).min(bslen);
                    if reset_off < end {
                        parser.stream_mut().bytes_mut()[reset_off..end]
                            .copy_from_slice(&pristine[reset_off..end]);
                    }
                    inverted = 0;
                    parser
                        .reset_stream_to(sw.reset_addr)
                        .map_err(|_| DisassError::ResetFailed(sw.reset_addr))?;
                    current_addr = sw.reset_addr;
                    nb_parsed = reset_off;
                }
                debug!(code = sw.code.code(), "interworking switch");
                cur_ops = driver_for(sw.code);
                parser.reinit(cur_ops.load_grammar());
                cur_code = sw.code;
            }
        }

        // Apply the byte ordering the instruction set expects.
        prev_endian = cur_endian;
        cur_endian = cur_ops.descriptor().endianness;
        let max_bytes = cur_ops.descriptor().insn_maxlen_bytes();
        apply_code_swap(
            parser.stream_mut().bytes_mut(),
            &pristine,
            nb_parsed,
            &mut inverted,
            prev_endian,
            cur_endian,
            max_bytes,
        );

        // Streams shorter than the smallest instruction cannot be
        // parsed: the trailing bytes become one un-decodable marker,
        // unless the label sweep below restarts parsing elsewhere.
        let remaining_bits = parser.stream().bit_len() - parser.stream().cursor().total_bits();
        let trailing = remaining_bits < parser.tables().insn_minlen as u64;

        let (mut insn, err, word_bits) = if trailing {
            (Instruction::bad(cur_code), true, remaining_bits)
        } else {
            match parser.parse_word() {
                Ok(draft) => {
                    let mut insn = Instruction::new(draft.opcode, draft.operands, cur_code);
                    if let Some(ext) = draft.ext {
                        insn.set_ext(ext);
                    }
                    (insn, false, parser.word_len_bits())
                }
                Err(_) => (Instruction::bad(cur_code), true, parser.word_len_bits()),
            }
        };
        let word_bytes = ((word_bits + 7) / 8) as usize;

        insn.set_address(current_addr);
        insn.set_coding(Coding::new(
            pristine[nb_parsed..(nb_parsed + word_bytes).min(bslen)].to_vec(),
            word_bits as u32,
        ));
        insn.set_section(sid);
        insn.set_isa(cur_code);

        // Function label sweep: crossing into the next function label
        // checks that the previous instruction did not overlap it.
        if next_fct_addr <= current_addr {
            while next_fct_addr <= current_addr {
                last_fct_idx = Some(last_fct_idx.map(|i| i + 1).unwrap_or(0));
                next_fct_addr = fct_addr_after(af, last_fct_idx, start, bslen);
            }
            let lbl_id = af.fct_labels()[last_fct_idx.unwrap()];
            let lbl_addr = af.label(lbl_id).addr;
            if lbl_addr != current_addr && lbl_addr >= start {
                debug!(
                    label = %af.label(lbl_id).name,
                    lbl_addr,
                    current_addr,
                    "function boundary overlapped, resynchronising"
                );
                // Restore the pristine bytes from the boundary onwards.
                let lbl_off = (lbl_addr - start) as usize;
                let end = (nb_parsed + inverted.max(max_bytes)).min(bslen);
                if lbl_off < end {
                    parser.stream_mut().bytes_mut()[lbl_off..end]
                        .copy_from_slice(&pristine[lbl_off..end]);
                }
                inverted = 0;

                // Drop every decoded instruction past the boundary.
                while let Some(tail) = af.tail() {
                    if af.insn(tail).section() == Some(sid) && af.insn(tail).address() > lbl_addr {
                        let id = af.pop_tail().unwrap();
                        resolver.forget(id);
                    } else {
                        break;
                    }
                }

                // Truncate the instruction straddling the boundary and
                // mark it un-decodable.
                if let Some(tail) = af.tail() {
                    let taddr = af.insn(tail).address();
                    let tsize = af.insn(tail).byte_size() as u64;
                    if af.insn(tail).section() == Some(sid)
                        && taddr < lbl_addr
                        && taddr + tsize > lbl_addr
                    {
                        resolver.forget(tail);
                        af.unlink_insn_refs(tail);
                        let keep_bits = ((lbl_addr - taddr) * 8) as u32;
                        let t = af.insn_mut(tail);
                        t.set_opcode(BAD_OPCODE);
                        t.operands_mut().clear();
                        *t.annotations_mut() = Annotations::empty();
                        if let Some(coding) = t.coding_mut() {
                            coding.truncate(keep_bits);
                        }
                    }
                }

                // The current instruction is dropped; parsing resumes at
                // the label.
                parser
                    .reset_stream_to(lbl_addr)
                    .map_err(|_| DisassError::ResetFailed(lbl_addr))?;
                errcount = 0;
                current_addr = parser.current_addr();
                continue;
            }
        }

        if let Some(idx) = last_fct_idx {
            insn.set_fct_label(Some(af.fct_labels()[idx]));
        }

        if err {
            af.count_parse_error();
            errcount += 1;
        } else if errcount > 0 {
            // A successful parse in the middle of a block of errors is
            // itself doubtful.
            insn.annotations_mut().add(Annotations::SUSPICIOUS);
            errcount -= 1;
        }
        insn.annotations_mut().add(scn_anno);

        let id = af.append_decoded(insn);

        // Labels defined at this address resolve to the instruction.
        while lblidx < scn_labels.len() && af.label(scn_labels[lblidx]).addr < current_addr {
            lblidx += 1;
        }
        while lblidx < scn_labels.len() && af.label(scn_labels[lblidx]).addr == current_addr {
            let lid = scn_labels[lblidx];
            af.label_mut(lid).target = Some(LabelTarget::Insn(id));
            lblidx += 1;
        }

        // Relocation sites pointing inside this instruction get linked.
        while let Some(&(dest, did)) = unlinked.front() {
            if dest < current_addr {
                unlinked.pop_front();
            } else if dest < current_addr + word_bytes as u64 {
                if let Some(ptr) = af.data_mut(did).pointer.as_mut() {
                    ptr.target = crate::operand::PointerTarget::Insn(id);
                    ptr.offset_in_target = (dest - current_addr) as i64;
                }
                unlinked.pop_front();
            } else {
                break;
            }
        }

        if !err {
            resolver.resolve_insn(af, id);
        }

        if trailing {
            break;
        }
    }

    Ok(())
}

fn fct_addr_after(af: &AsmFile, idx: Option<usize>, start: u64, bslen: usize) -> u64 {
    let next = idx.map(|i| i + 1).unwrap_or(0);
    if next < af.fct_labels().len() {
        af.label(af.fct_labels()[next]).addr
    } else {
        start + bslen as u64
    }
}

/// Flags the boundaries of non-contiguous instruction runs.
fn detect_gaps(af: &mut AsmFile) {
    let ids: Vec<_> = af.iter().collect();
    if let Some(first) = ids.first() {
        af.insn_mut(*first).annotations_mut().add(Annotations::BEGIN_LIST);
    }
    if let Some(last) = ids.last() {
        af.insn_mut(*last).annotations_mut().add(Annotations::END_LIST);
    }
    for pair in ids.windows(2) {
        let end = af.insn(pair[0]).address() + af.insn(pair[0]).byte_size() as u64;
        if end != af.insn(pair[1]).address() {
            af.insn_mut(pair[0]).annotations_mut().add(Annotations::END_LIST);
            af.insn_mut(pair[1])
                .annotations_mut()
                .add(Annotations::BEGIN_LIST);
        }
    }
}
