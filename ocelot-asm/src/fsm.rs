//! The LR(0) automaton driving word-by-word disassembly.
//!
//! The parser consumes a [`BitStream`] under the control of an
//! architecture's [`GrammarTables`] and produces one word (normally one
//! machine instruction) per [`Parser::parse_word`] call. Parsing errors
//! never abort a run: the cursor resynchronises past the smallest
//! possible instruction and the caller decides what to emit for the
//! un-decodable word.
//!
//! [`BitStream`]: ../bitstream/struct.BitStream.html
//! [`GrammarTables`]: ../grammar/struct.GrammarTables.html
//! [`Parser::parse_word`]: struct.Parser.html#method.parse_word

use std::mem;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::bitstream::{BitPos, BitStream};
use crate::grammar::{
    GrammarTables, InsnDraft, ReduceState, ReductionKind, SemAction, SemCtx, ShiftState, StateKind,
    SubList, SubListKind, SubNext, SubTable, SubTableKind, TokenSlot, SYM_NONE,
};
use crate::DecodeError;

/// What a buffer entry stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ValueKind {
    /// A constant bit field shifted from the input.
    Const,
    /// A reduced grammar variable.
    Var,
}

impl Default for ValueKind {
    fn default() -> Self {
        ValueKind::Const
    }
}

/// One element of the parse buffer: a state plus the bit range of the
/// value that led into it.
#[derive(Clone, Copy, Debug, Default)]
struct BufEntry {
    state: u32,
    kind: ValueKind,
    start: BitPos,
    end: BitPos,
    sym: u16,
}

impl BufEntry {
    fn bit_len(&self) -> u64 {
        self.end.total_bits() - self.start.total_bits()
    }
}

/// A saved parser state, taken on entry to a shift-reduce state so that a
/// later shift failure can fall back to the stored reduction.
#[derive(Clone, Default)]
struct Snapshot {
    buffer: Vec<BufEntry>,
    sem_queue: Vec<SemAction>,
    syms: Vec<TokenSlot>,
    cursor: BitPos,
    trans_end: BitPos,
    last_reduced: u16,
}

/// The result of evaluating one subtable against the input.
enum Step<'t> {
    /// The transition is complete.
    Matched { id: u32, translen: u16 },
    /// More bits must be matched in a deeper subtable.
    Descend(&'t SubTable),
    /// Nothing matched.
    Fail,
}

/// The LR(0) parser for one architecture's grammar.
pub struct Parser {
    tables: Rc<GrammarTables>,
    stream: BitStream,
    buffer: Vec<BufEntry>,
    syms: Vec<TokenSlot>,
    sem_queue: Vec<SemAction>,
    alt: Vec<Snapshot>,
    spare: Vec<Snapshot>,
    last_reduced: u16,
    coding_start: BitPos,
    final_action: Option<u16>,
    complete: bool,
    error: Option<DecodeError>,
    saw_eos: bool,
}

impl Parser {
    /// Constructs a parser over an empty stream from a grammar blob.
    pub fn new(tables: GrammarTables) -> Self {
        let n_symbols = tables.n_symbols;
        let mut parser = Parser {
            tables: Rc::new(tables),
            stream: BitStream::new(Vec::new(), 0),
            buffer: Vec::new(),
            syms: vec![TokenSlot::default(); n_symbols],
            sem_queue: Vec::new(),
            alt: Vec::new(),
            spare: Vec::new(),
            last_reduced: SYM_NONE,
            coding_start: BitPos::default(),
            final_action: None,
            complete: false,
            error: None,
            saw_eos: false,
        };
        parser.buffer.push(BufEntry::default());
        parser
    }

    /// Swaps the grammar tables while keeping the stream position.
    ///
    /// Used for interworking; must only be called between words.
    pub fn reinit(&mut self, tables: GrammarTables) {
        self.tables = Rc::new(tables);
        self.syms = vec![TokenSlot::default(); self.tables.n_symbols];
        self.sem_queue.clear();
        self.alt.clear();
        self.spare.clear();
        self.buffer.truncate(1);
        self.buffer[0] = BufEntry::default();
        self.last_reduced = SYM_NONE;
        debug!("parser reinitialised with a new grammar");
    }

    /// Sets the stream the parser will consume.
    pub fn set_stream(&mut self, bytes: Vec<u8>, start_addr: u64) {
        self.stream = BitStream::new(bytes, start_addr);
        self.buffer.truncate(1);
        self.buffer[0] = BufEntry::default();
    }

    /// The stream being parsed.
    pub fn stream(&self) -> &BitStream {
        &self.stream
    }

    /// Mutable access to the stream, for code byte reordering.
    pub fn stream_mut(&mut self) -> &mut BitStream {
        &mut self.stream
    }

    /// The grammar currently loaded.
    pub fn tables(&self) -> &GrammarTables {
        &self.tables
    }

    /// The address of the next word to parse.
    pub fn current_addr(&self) -> u64 {
        self.stream.addr()
    }

    /// Whether the whole stream has been consumed.
    pub fn exhausted(&self) -> bool {
        self.stream.exhausted()
    }

    /// Moves the parsing position to `addr`. Must not be called in the
    /// middle of a word.
    pub fn reset_stream_to(&mut self, addr: u64) -> Result<(), DecodeError> {
        self.stream.reset_to(addr)
    }

    /// Where the last parsed word begins.
    pub fn word_start(&self) -> BitPos {
        self.coding_start
    }

    /// The length in bits of the last parsed word.
    pub fn word_len_bits(&self) -> u64 {
        self.stream.cursor().bits_since(self.coding_start)
    }

    /// Parses one word from the stream.
    ///
    /// On success the semantic actions run in the order they were
    /// enqueued and the resulting draft is returned; the cursor sits
    /// right after the word. On failure the cursor resynchronises past
    /// the smallest instruction length (clamped to the stream end) so
    /// that the caller can emit an un-decodable marker and resume.
    pub fn parse_word(&mut self) -> Result<InsnDraft, DecodeError> {
        let tables = Rc::clone(&self.tables);

        let remaining = self.stream.bit_len() - self.stream.cursor().total_bits();
        if remaining < tables.insn_minlen as u64 {
            return Err(DecodeError::EndOfStream);
        }

        self.word_reset();
        trace!(addr = self.stream.addr(), "parsing new word");

        while !self.complete && self.error.is_none() {
            let sid = self.buffer.last().unwrap().state as usize;
            match &tables.states[sid].kind {
                StateKind::Shift(st) => {
                    if !self.process_shift(st) {
                        self.shift_failed(&tables);
                    }
                }
                StateKind::Reduce(rd) => self.process_reduce(rd),
                StateKind::ShiftReduce(st, rd) => {
                    // Save the parser before attempting the shift so a
                    // failure in a later state can fall back to this
                    // reduction.
                    self.save_snapshot();
                    if !self.process_shift(st) {
                        if let Some(snap) = self.alt.pop() {
                            self.spare.push(snap);
                        }
                        self.process_reduce(rd);
                    }
                }
                StateKind::Final => {
                    self.complete = true;
                    while let Some(snap) = self.alt.pop() {
                        self.spare.push(snap);
                    }
                    trace!("final state reached");
                }
            }
        }

        if let Some(err) = self.error.take() {
            debug!(addr = self.stream.addr(), ?err, "parser error, resyncing");
            let resync = self.coding_start.add_bits(tables.insn_minlen as u64);
            let clamped = BitPos::from_total_bits(resync.total_bits().min(self.stream.bit_len()));
            self.stream.seek(clamped);
            self.buffer.truncate(1);
            return Err(err);
        }

        let mut draft = InsnDraft::default();
        let actions = mem::replace(&mut self.sem_queue, Vec::new());
        {
            let mut ctx = SemCtx {
                syms: &self.syms,
                draft: &mut draft,
            };
            for act in &actions {
                act(&mut ctx);
            }
            if let Some(fid) = self.final_action.take() {
                (tables.final_actions[fid as usize])(&mut ctx);
            }
        }
        self.sem_queue = actions;
        self.sem_queue.clear();
        self.buffer.truncate(1);

        Ok(draft)
    }

    fn word_reset(&mut self) {
        self.error = None;
        self.complete = false;
        self.saw_eos = false;
        self.stream.rewind();
        self.coding_start = self.stream.cursor();
        self.last_reduced = SYM_NONE;
        self.final_action = None;
        self.sem_queue.clear();
        while let Some(snap) = self.alt.pop() {
            self.spare.push(snap);
        }
        for slot in &mut self.syms {
            *slot = TokenSlot::default();
        }
        self.buffer.truncate(1);
        self.buffer[0] = BufEntry {
            state: 0,
            kind: ValueKind::Const,
            start: self.coding_start,
            end: self.coding_start,
            sym: SYM_NONE,
        };
    }

    /// The end of the value at the top of the buffer, or the word start
    /// when only the sentinel remains.
    fn top_end(&self) -> BitPos {
        if self.buffer.len() > 1 {
            self.buffer.last().unwrap().end
        } else {
            self.coding_start
        }
    }

    fn push_entry(&mut self, state: u32, kind: ValueKind, start: BitPos, end: BitPos, sym: u16) {
        self.buffer.push(BufEntry {
            state,
            kind,
            start,
            end,
            sym,
        });
    }

    /// Shifts the pending transition into the buffer and commits the
    /// stream.
    fn shift_bits(&mut self, state: u32) {
        let start = self.stream.cursor();
        let end = self.stream.trans_end();
        self.push_entry(state, ValueKind::Const, start, end, SYM_NONE);
        self.stream.commit();
    }

    fn process_shift(&mut self, st: &ShiftState) -> bool {
        let out;
        if self.last_reduced != SYM_NONE {
            let var = self.last_reduced;
            trace!(sym = self.tables.sym_name(var), "transition over variable");
            match st.var_trans[var as usize] {
                None => out = false,
                Some(next) => {
                    // The variable spans from the previous top of the
                    // buffer to the current stream position.
                    let start = self.top_end();
                    let end = self.stream.trans_end();
                    self.push_entry(next, ValueKind::Var, start, end, var);
                    let extra = st.shift_after[var as usize];
                    if extra > 0 {
                        if self.stream.advance(extra as u64).is_err() {
                            self.saw_eos = true;
                            out = false;
                        } else {
                            self.shift_bits(next);
                            out = true;
                        }
                    } else {
                        out = true;
                    }
                }
            }
        } else {
            out = self.find_next(st);
        }
        self.last_reduced = SYM_NONE;
        out
    }

    /// Evaluates one subtable against the input.
    fn lookup_step<'t>(&mut self, tbl: &'t SubTable) -> Step<'t> {
        let list: &'t SubList;
        let mut val_idx = 0usize;
        match tbl.kind {
            SubTableKind::AlwaysOk => {
                list = &tbl.lists[0];
            }
            SubTableKind::SingleValue | SubTableKind::HashTable => {
                let parts = tbl.parts();
                let test = match self.stream.peek(&parts) {
                    Ok(v) => v,
                    Err(_) => {
                        self.saw_eos = true;
                        return Step::Fail;
                    }
                };
                list = if tbl.kind == SubTableKind::SingleValue {
                    &tbl.lists[0]
                } else {
                    &tbl.lists[test as usize]
                };
                match list.kind {
                    SubListKind::NoMatch => return Step::Fail,
                    // In a dense table the index selection already is the
                    // test for single-entry lists.
                    SubListKind::AlwaysOk => {}
                    SubListKind::Single if tbl.kind == SubTableKind::HashTable => {}
                    SubListKind::Single => {
                        if !list.vals[0].matches(test) {
                            return Step::Fail;
                        }
                    }
                    SubListKind::Many => {
                        match list.vals.iter().position(|v| v.matches(test)) {
                            Some(i) => val_idx = i,
                            None => return Step::Fail,
                        }
                    }
                }
            }
        }
        match &list.vals[val_idx].next {
            SubNext::State { id, translen } => Step::Matched {
                id: *id,
                translen: *translen,
            },
            SubNext::Table(t) => Step::Descend(t),
        }
    }

    /// Finds the successor of a shift state from the input bits.
    fn find_next(&mut self, st: &ShiftState) -> bool {
        let mut next = None;
        if let Some(root) = st.table.as_ref() {
            let mut tbl = root;
            loop {
                match self.lookup_step(tbl) {
                    Step::Matched { id, translen } => {
                        if self.stream.advance(translen as u64).is_err() {
                            self.saw_eos = true;
                        } else {
                            next = Some(id);
                        }
                        break;
                    }
                    Step::Descend(t) => tbl = t,
                    Step::Fail => break,
                }
            }
        }
        if let Some(id) = next {
            trace!(state = id, "transition matched");
            self.shift_bits(id);
            true
        } else if let Some(els) = st.else_state {
            // Zero-length transition; the stream has not moved.
            let pos = self.stream.trans_end();
            self.push_entry(els, ValueKind::Const, pos, pos, SYM_NONE);
            trace!(state = els, "match made with empty value");
            true
        } else {
            false
        }
    }

    fn process_reduce(&mut self, rd: &ReduceState) {
        let tables = Rc::clone(&self.tables);
        self.last_reduced = rd.lhs;
        let mut reduced_bits: u64 = 0;

        // Reductions are stored in rule order and applied in reverse,
        // peeling the buffer from its top.
        for r in rd.reductions.iter().rev() {
            match r.kind {
                ReductionKind::Constant => {
                    self.remove_bits(r.len as u64);
                    reduced_bits += r.len as u64;
                }
                ReductionKind::Token => {
                    let old_end = self.top_end();
                    self.remove_bits(r.len as u64);
                    let new_end = self.top_end();
                    let (value, len) = self.stream.value_in_range(new_end, old_end, r.endianness);
                    self.syms[r.sym as usize] = TokenSlot {
                        value,
                        len,
                        set: true,
                    };
                    trace!(
                        sym = tables.sym_name(r.sym),
                        value,
                        len,
                        "token reduced"
                    );
                    reduced_bits += r.len as u64;
                }
                ReductionKind::Variable => {
                    reduced_bits += self.remove_var(r.sym);
                }
            }

            // Pop zero-length entries whose already-tested bits fall
            // inside what was just reduced.
            while self.buffer.len() > 1 {
                let top = self.buffer.last().unwrap();
                let first_tested = tables.states[top.state as usize].first_tested as u64;
                if top.bit_len() == 0 && first_tested < reduced_bits {
                    self.buffer.pop();
                } else {
                    break;
                }
            }
        }

        if let Some(act) = rd.sem_action {
            self.sem_queue.push(act);
        }
        if let Some(fid) = rd.final_action {
            self.final_action = Some(fid);
        }
        // An empty-symbol reduction still removes its state.
        if rd.reductions.is_empty() {
            self.buffer.pop();
        }
        // No roll-back across a reduction: drop any saved parser.
        while let Some(snap) = self.alt.pop() {
            self.spare.push(snap);
        }
        trace!(sym = tables.sym_name(rd.lhs), reduced_bits, "symbol reduced");
    }

    fn remove_bits(&mut self, len: u64) {
        let mut removed = 0u64;
        while self.buffer.len() > 1 && removed < len {
            let top = self.buffer.last_mut().unwrap();
            let l = top.bit_len();
            if len - removed < l {
                top.end = BitPos::from_total_bits(top.end.total_bits() - (len - removed));
                removed = len;
            } else {
                removed += l;
                self.buffer.pop();
            }
        }
    }

    fn remove_var(&mut self, sym: u16) -> u64 {
        if self.buffer.len() > 1 {
            let top = self.buffer.last().unwrap();
            if top.kind == ValueKind::Var && top.sym == sym {
                let len = top.bit_len();
                self.buffer.pop();
                return len;
            }
        }
        // The variable reduced to nothing and stays out of the buffer.
        0
    }

    fn save_snapshot(&mut self) {
        let mut snap = self.spare.pop().unwrap_or_default();
        snap.buffer.clone_from(&self.buffer);
        snap.sem_queue.clone_from(&self.sem_queue);
        snap.syms.clone_from(&self.syms);
        snap.cursor = self.stream.cursor();
        snap.trans_end = self.stream.trans_end();
        snap.last_reduced = self.last_reduced;
        self.alt.push(snap);
        trace!("parser state saved for shift-reduce fallback");
    }

    fn restore_snapshot(&mut self) -> bool {
        if let Some(snap) = self.alt.pop() {
            self.buffer.clone_from(&snap.buffer);
            self.sem_queue.clone_from(&snap.sem_queue);
            self.syms.clone_from(&snap.syms);
            self.stream.restore_positions(snap.cursor, snap.trans_end);
            self.last_reduced = snap.last_reduced;
            self.spare.push(snap);
            trace!("parser state restored");
            true
        } else {
            false
        }
    }

    fn shift_failed(&mut self, tables: &GrammarTables) {
        if self.restore_snapshot() {
            let sid = self.buffer.last().unwrap().state as usize;
            if let StateKind::ShiftReduce(_, rd) = &tables.states[sid].kind {
                self.process_reduce(rd);
            } else {
                self.error = Some(DecodeError::NoTransitionMatch);
            }
        } else {
            self.error = Some(if self.saw_eos {
                DecodeError::EndOfStream
            } else {
                DecodeError::NoTransitionMatch
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{FsmState, Reduction, SubValue};

    const SYM_INSN: u16 = 1;
    const SYM_VAL: u16 = 2;
    const SYM_PFX: u16 = 3;

    fn set_opcode_7(ctx: &mut SemCtx<'_>) {
        ctx.draft.opcode = 7;
        let tok = ctx.tok(SYM_VAL);
        ctx.draft
            .operands
            .push(crate::operand::Operand::imm(tok.value as i64));
    }

    fn set_opcode_8(ctx: &mut SemCtx<'_>) {
        ctx.draft.opcode = 8;
        let tok = ctx.tok(SYM_VAL);
        ctx.draft
            .operands
            .push(crate::operand::Operand::imm(tok.value as i64));
    }

    fn set_opcode_9(ctx: &mut SemCtx<'_>) {
        ctx.draft.opcode = 9;
    }

    /// 8-bit words: a 0xA nibble followed by a 4-bit immediate.
    fn simple_grammar() -> GrammarTables {
        let states = vec![
            // 0: start
            FsmState::new(StateKind::Shift(
                ShiftState::new(4)
                    .table(SubTable::single(
                        0,
                        4,
                        SubList::single(SubValue::state(0xA, 0xF, 1, 4)),
                    ))
                    .var(SYM_INSN, 3),
            )),
            // 1: read the immediate nibble
            FsmState::new(StateKind::Shift(ShiftState::new(4).table(
                SubTable::always_ok(SubList::always_ok(SubValue::state(0, 0, 2, 4))),
            ))),
            // 2: reduce INSN
            FsmState::new(StateKind::Reduce(ReduceState {
                reductions: vec![Reduction::constant(4), Reduction::token(SYM_VAL, 4)],
                sem_action: Some(set_opcode_7),
                lhs: SYM_INSN,
                final_action: None,
            })),
            // 3: done
            FsmState::new(StateKind::Final),
        ];
        GrammarTables {
            states,
            n_symbols: 4,
            final_actions: Vec::new(),
            insn_minlen: 8,
            insn_maxlen: 8,
            sym_names: vec!["", "INSN", "VAL", "PFX"],
        }
    }

    /// Like `simple_grammar`, but the payload goes through a
    /// shift-reduce state: `1111` payloads match a longer shift chain
    /// and everything else falls back to a reduction of the prefix.
    fn shrdc_grammar() -> GrammarTables {
        let states = vec![
            // 0: start
            FsmState::new(StateKind::Shift(
                ShiftState::new(4)
                    .table(SubTable::single(
                        0,
                        4,
                        SubList::single(SubValue::state(0xA, 0xF, 1, 4)),
                    ))
                    .var(SYM_INSN, 3)
                    .var(SYM_PFX, 5),
            )),
            // 1: try to shift a `1` bit, else reduce the prefix
            FsmState::new(StateKind::ShiftReduce(
                ShiftState::new(4).table(SubTable::single(
                    0,
                    1,
                    SubList::single(SubValue::state(1, 1, 4, 1)),
                )),
                ReduceState {
                    reductions: vec![Reduction::constant(4)],
                    sem_action: None,
                    lhs: SYM_PFX,
                    final_action: None,
                },
            )),
            // 2: unused slot to keep state ids readable
            FsmState::new(StateKind::Final),
            // 3: done
            FsmState::new(StateKind::Final),
            // 4: the rest of the long form must be `111`
            FsmState::new(StateKind::Shift(ShiftState::new(4).table(
                SubTable::single(0, 3, SubList::single(SubValue::state(0b111, 0b111, 6, 3))),
            ))),
            // 5: after the prefix reduction, read the immediate nibble
            FsmState::new(StateKind::Shift(ShiftState::new(4).table(
                SubTable::always_ok(SubList::always_ok(SubValue::state(0, 0, 7, 4))),
            ))),
            // 6: long form reduces straight to INSN
            FsmState::new(StateKind::Reduce(ReduceState {
                reductions: vec![
                    Reduction::constant(4),
                    Reduction::constant(1),
                    Reduction::constant(3),
                ],
                sem_action: Some(set_opcode_9),
                lhs: SYM_INSN,
                final_action: None,
            })),
            // 7: short form reduces the prefix variable and the payload
            FsmState::new(StateKind::Reduce(ReduceState {
                reductions: vec![Reduction::variable(SYM_PFX), Reduction::token(SYM_VAL, 4)],
                sem_action: Some(set_opcode_8),
                lhs: SYM_INSN,
                final_action: None,
            })),
        ];
        GrammarTables {
            states,
            n_symbols: 4,
            final_actions: Vec::new(),
            insn_minlen: 8,
            insn_maxlen: 8,
            sym_names: vec!["", "INSN", "VAL", "PFX"],
        }
    }

    #[test]
    fn parses_consecutive_words() {
        let mut parser = Parser::new(simple_grammar());
        parser.set_stream(vec![0xA5, 0xA7], 0x100);

        let first = parser.parse_word().unwrap();
        assert_eq!(first.opcode, 7);
        assert_eq!(parser.word_len_bits(), 8);
        assert_eq!(parser.current_addr(), 0x101);

        let second = parser.parse_word().unwrap();
        assert_eq!(second.opcode, 7);
        assert!(parser.exhausted());
    }

    #[test]
    fn decodes_token_values() {
        let mut parser = Parser::new(simple_grammar());
        parser.set_stream(vec![0xA9], 0);
        let draft = parser.parse_word().unwrap();
        match draft.operands[0].kind {
            crate::operand::OperandKind::Immediate(v) => assert_eq!(v, 9),
            ref other => panic!("unexpected operand {:?}", other),
        }
    }

    #[test]
    fn error_resyncs_past_min_length() {
        let mut parser = Parser::new(simple_grammar());
        parser.set_stream(vec![0xB5, 0xA7], 0x200);

        assert_eq!(parser.parse_word(), Err(DecodeError::NoTransitionMatch));
        // The cursor skipped the smallest instruction length.
        assert_eq!(parser.current_addr(), 0x201);
        assert_eq!(parser.word_len_bits(), 8);

        let next = parser.parse_word().unwrap();
        assert_eq!(next.opcode, 7);
    }

    #[test]
    fn short_stream_reports_end_of_stream() {
        let mut parser = Parser::new(simple_grammar());
        parser.set_stream(vec![], 0);
        assert_eq!(parser.parse_word(), Err(DecodeError::EndOfStream));
    }

    #[test]
    fn shift_reduce_takes_the_long_form() {
        let mut parser = Parser::new(shrdc_grammar());
        parser.set_stream(vec![0xAF], 0);
        let draft = parser.parse_word().unwrap();
        assert_eq!(draft.opcode, 9);
    }

    #[test]
    fn shift_reduce_falls_back_immediately() {
        // Payload 0b0011: the first shift of the long form fails inside
        // the shift-reduce state itself.
        let mut parser = Parser::new(shrdc_grammar());
        parser.set_stream(vec![0xA3], 0);
        let draft = parser.parse_word().unwrap();
        assert_eq!(draft.opcode, 8);
        match draft.operands[0].kind {
            crate::operand::OperandKind::Immediate(v) => assert_eq!(v, 3),
            ref other => panic!("unexpected operand {:?}", other),
        }
    }

    #[test]
    fn shift_reduce_recovers_from_a_later_failure() {
        // Payload 0b1000: the long form consumes the leading 1, then
        // fails on the `111` requirement; the saved parser state is
        // restored and the short form wins.
        let mut parser = Parser::new(shrdc_grammar());
        parser.set_stream(vec![0xA8], 0);
        let draft = parser.parse_word().unwrap();
        assert_eq!(draft.opcode, 8);
        match draft.operands[0].kind {
            crate::operand::OperandKind::Immediate(v) => assert_eq!(v, 8),
            ref other => panic!("unexpected operand {:?}", other),
        }
    }

    #[test]
    fn reinit_swaps_grammars_between_words() {
        let mut parser = Parser::new(shrdc_grammar());
        parser.set_stream(vec![0xAF, 0xA5], 0);
        assert_eq!(parser.parse_word().unwrap().opcode, 9);

        parser.reinit(simple_grammar());
        assert_eq!(parser.parse_word().unwrap().opcode, 7);
    }
}
