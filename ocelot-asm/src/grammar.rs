//! The grammar table contract between an architecture and the parser.
//!
//! Grammar tables are produced ahead of time by an external grammar
//! compiler and shipped per architecture as a structured blob. The parser
//! never interprets anything architecture-specific: it only walks the
//! states described here and calls back into the semantic actions the
//! tables carry.

use crate::bitstream::ValueEndianness;
use crate::insn::InsnExt;
use crate::operand::Operand;

/// The symbol identifier reserved for "no symbol".
///
/// Grammar symbols are numbered starting at 1 so that 0 can mark the
/// absence of a pending reduction.
pub const SYM_NONE: u16 = 0;

/// The decoded value of a token together with its bit length.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenSlot {
    /// The raw, unsigned value of the token.
    pub value: u64,
    /// The length of the token in the coding, in bits.
    pub len: u8,
    /// Whether the token was reduced during the current word.
    pub set: bool,
}

impl TokenSlot {
    /// The value of the token, sign-extended from its bit length.
    pub fn signed(&self) -> i64 {
        crate::bitstream::sign_extend(self.value, self.len)
    }
}

/// The instruction under construction during a word parse.
///
/// Semantic actions fill this structure from the reduced token slots;
/// the caller stamps address, coding and annotations afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct InsnDraft {
    /// The opcode identifier, [`BAD_OPCODE`] until an action sets it.
    ///
    /// [`BAD_OPCODE`]: ../insn/constant.BAD_OPCODE.html
    pub opcode: u16,
    /// The operand vector, in order.
    pub operands: Vec<Operand>,
    /// Architecture-specific payload.
    pub ext: Option<InsnExt>,
}

impl Default for InsnDraft {
    fn default() -> Self {
        InsnDraft {
            opcode: crate::insn::BAD_OPCODE,
            operands: Vec::new(),
            ext: None,
        }
    }
}

/// The context handed to semantic and final actions.
pub struct SemCtx<'a> {
    /// The reduced token slots, indexed by symbol identifier.
    pub syms: &'a [TokenSlot],
    /// The instruction under construction.
    pub draft: &'a mut InsnDraft,
}

impl SemCtx<'_> {
    /// The token slot of symbol `sym`.
    pub fn tok(&self, sym: u16) -> TokenSlot {
        self.syms[sym as usize]
    }
}

/// A semantic action, executed in reduction order once a word has been
/// parsed successfully.
pub type SemAction = fn(&mut SemCtx<'_>);

/// A final action, executed once after the semantic actions of a word.
pub type FinalAction = fn(&mut SemCtx<'_>);

/// What a matching transition subvalue leads to.
#[derive(Clone, Debug)]
pub enum SubNext {
    /// Descend into another subtable for the following bits.
    Table(Box<SubTable>),
    /// The transition is complete; consume `translen` bits and enter the
    /// state.
    State {
        /// Index of the next state.
        id: u32,
        /// Total length in bits of the completed transition.
        translen: u16,
    },
}

/// One tested subvalue inside a transition.
#[derive(Clone, Debug)]
pub struct SubValue {
    /// The expected bits, with undefined positions cleared.
    pub value: u32,
    /// The mask selecting the meaningful bits of `value`.
    pub mask: u32,
    /// Where a match leads.
    pub next: SubNext,
}

impl SubValue {
    /// Builds a subvalue completing a transition into state `id`.
    pub fn state(value: u32, mask: u32, id: u32, translen: u16) -> Self {
        SubValue {
            value,
            mask,
            next: SubNext::State { id, translen },
        }
    }

    /// Builds a subvalue descending into `table`.
    pub fn table(value: u32, mask: u32, table: SubTable) -> Self {
        SubValue {
            value,
            mask,
            next: SubNext::Table(Box::new(table)),
        }
    }

    /// Whether `input` matches this subvalue.
    pub fn matches(&self, input: u32) -> bool {
        input & self.mask == self.value
    }
}

/// How the entries of a subvalue list are checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubListKind {
    /// The list never matches.
    NoMatch,
    /// The single entry always matches; no test needed.
    AlwaysOk,
    /// The single entry must be checked against its mask.
    Single,
    /// The entries are checked in order; the first match wins. The order
    /// encodes the priorities chosen by the grammar compiler.
    Many,
}

/// A prioritised list of transition subvalues.
#[derive(Clone, Debug)]
pub struct SubList {
    /// How the entries are checked.
    pub kind: SubListKind,
    /// The entries, in priority order.
    pub vals: Vec<SubValue>,
}

impl SubList {
    /// A list that never matches.
    pub fn no_match() -> Self {
        SubList {
            kind: SubListKind::NoMatch,
            vals: Vec::new(),
        }
    }

    /// A single entry that matches without a test.
    pub fn always_ok(val: SubValue) -> Self {
        SubList {
            kind: SubListKind::AlwaysOk,
            vals: vec![val],
        }
    }

    /// A single entry checked against its mask.
    pub fn single(val: SubValue) -> Self {
        SubList {
            kind: SubListKind::Single,
            vals: vec![val],
        }
    }

    /// Several entries checked in priority order.
    pub fn many(vals: Vec<SubValue>) -> Self {
        SubList {
            kind: SubListKind::Many,
            vals,
        }
    }
}

/// How a subtable selects its candidate list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubTableKind {
    /// The single list always applies; nothing is read from the stream.
    AlwaysOk,
    /// The single list applies after reading the tested bits.
    SingleValue,
    /// The read value indexes a dense table of lists.
    HashTable,
}

/// A table of transition subvalues.
///
/// The tested bits are described by parallel `offsets`/`sizes` arrays:
/// each part is read at its offset from the beginning of the current
/// transition and the parts are concatenated most significant first.
#[derive(Clone, Debug)]
pub struct SubTable {
    /// How the candidate list is selected.
    pub kind: SubTableKind,
    /// Bit offsets of the tested parts, from the transition start.
    pub offsets: Vec<u16>,
    /// Bit sizes of the tested parts.
    pub sizes: Vec<u16>,
    /// The candidate lists.
    pub lists: Vec<SubList>,
}

impl SubTable {
    /// Builds a table whose single list applies unconditionally.
    pub fn always_ok(list: SubList) -> Self {
        SubTable {
            kind: SubTableKind::AlwaysOk,
            offsets: Vec::new(),
            sizes: Vec::new(),
            lists: vec![list],
        }
    }

    /// Builds a table testing one bit range against a single list.
    pub fn single(offset: u16, size: u16, list: SubList) -> Self {
        SubTable {
            kind: SubTableKind::SingleValue,
            offsets: vec![offset],
            sizes: vec![size],
            lists: vec![list],
        }
    }

    /// Builds a dense table indexed by the tested bit range.
    ///
    /// `lists` must have `1 << size` entries.
    pub fn hash(offset: u16, size: u16, lists: Vec<SubList>) -> Self {
        debug_assert_eq!(lists.len(), 1usize << size);
        SubTable {
            kind: SubTableKind::HashTable,
            offsets: vec![offset],
            sizes: vec![size],
            lists,
        }
    }

    /// The `(offset, size)` pairs of the tested parts.
    pub fn parts(&self) -> Vec<(u16, u16)> {
        self.offsets
            .iter()
            .copied()
            .zip(self.sizes.iter().copied())
            .collect()
    }
}

/// The kinds of symbol a reduction removes from the parse buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReductionKind {
    /// A constant bit field; removed and discarded.
    Constant,
    /// A terminal; its value is decoded into the token slot of its
    /// symbol.
    Token,
    /// An already-reduced variable; only its size is returned.
    Variable,
}

/// One reduction operation of a reduce state.
#[derive(Clone, Copy, Debug)]
pub struct Reduction {
    /// What kind of symbol is removed.
    pub kind: ReductionKind,
    /// The symbol identifier (token slot for tokens, variable name for
    /// variables).
    pub sym: u16,
    /// The bit length removed (unused for variables, whose size is
    /// whatever was reduced into them).
    pub len: u16,
    /// The endianness under which token values are decoded.
    pub endianness: ValueEndianness,
}

impl Reduction {
    /// A constant bit field of `len` bits.
    pub fn constant(len: u16) -> Self {
        Reduction {
            kind: ReductionKind::Constant,
            sym: SYM_NONE,
            len,
            endianness: ValueEndianness::BigBit,
        }
    }

    /// A token of `len` bits decoded big-bit into slot `sym`.
    pub fn token(sym: u16, len: u16) -> Self {
        Reduction {
            kind: ReductionKind::Token,
            sym,
            len,
            endianness: ValueEndianness::BigBit,
        }
    }

    /// A token decoded under an explicit endianness.
    pub fn token_endian(sym: u16, len: u16, endianness: ValueEndianness) -> Self {
        Reduction {
            kind: ReductionKind::Token,
            sym,
            len,
            endianness,
        }
    }

    /// An already-reduced variable.
    pub fn variable(sym: u16) -> Self {
        Reduction {
            kind: ReductionKind::Variable,
            sym,
            len: 0,
            endianness: ValueEndianness::BigBit,
        }
    }
}

/// A reduce state.
#[derive(Clone, Debug)]
pub struct ReduceState {
    /// The reductions to perform. They are stored in rule order and
    /// applied in reverse, peeling the parse buffer from its top.
    pub reductions: Vec<Reduction>,
    /// The semantic action enqueued once the reductions are done.
    pub sem_action: Option<SemAction>,
    /// The left-hand-side symbol being reduced.
    pub lhs: u16,
    /// Index of the final action to run after the word completes, if
    /// any.
    pub final_action: Option<u16>,
}

/// A shift state.
#[derive(Clone, Debug)]
pub struct ShiftState {
    /// Transitions over reduced variables: the next state, indexed by
    /// symbol identifier.
    pub var_trans: Vec<Option<u32>>,
    /// Additional raw bits to consume after each variable transition.
    pub shift_after: Vec<u16>,
    /// The subtable tree driving transitions over input bits.
    pub table: Option<SubTable>,
    /// The state entered with a zero-length transition when nothing else
    /// matches.
    pub else_state: Option<u32>,
}

impl ShiftState {
    /// Builds a shift state with no transitions for a grammar of
    /// `n_symbols` symbols.
    pub fn new(n_symbols: usize) -> Self {
        ShiftState {
            var_trans: vec![None; n_symbols],
            shift_after: vec![0; n_symbols],
            table: None,
            else_state: None,
        }
    }

    /// Adds a transition over variable `sym` into state `state`.
    pub fn var(mut self, sym: u16, state: u32) -> Self {
        self.var_trans[sym as usize] = Some(state);
        self
    }

    /// Adds a transition over variable `sym` that also consumes `extra`
    /// raw bits.
    pub fn var_shift(mut self, sym: u16, state: u32, extra: u16) -> Self {
        self.var_trans[sym as usize] = Some(state);
        self.shift_after[sym as usize] = extra;
        self
    }

    /// Sets the subtable tree for transitions over input bits.
    pub fn table(mut self, table: SubTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Sets the fallback state for the zero-length transition.
    pub fn else_state(mut self, state: u32) -> Self {
        self.else_state = Some(state);
        self
    }
}

/// The behaviour of a state.
#[derive(Clone, Debug)]
pub enum StateKind {
    /// Consume input or follow a reduced variable.
    Shift(ShiftState),
    /// Apply a grammar rule.
    Reduce(ReduceState),
    /// Try the shift; fall back to the reduction if the shift ultimately
    /// fails.
    ShiftReduce(ShiftState, ReduceState),
    /// The word is complete.
    Final,
}

/// One state of the automaton.
#[derive(Clone, Debug)]
pub struct FsmState {
    /// The behaviour of the state.
    pub kind: StateKind,
    /// Index of the first input bit tested ahead of this state, used to
    /// keep the parse buffer consistent across peel-back reductions.
    pub first_tested: u16,
}

impl FsmState {
    /// Wraps a state kind with no bits tested ahead.
    pub fn new(kind: StateKind) -> Self {
        FsmState {
            kind,
            first_tested: 0,
        }
    }

    /// Wraps a state kind, recording the first input bit tested ahead of
    /// the state.
    pub fn with_first_tested(kind: StateKind, first_tested: u16) -> Self {
        FsmState { kind, first_tested }
    }
}

/// The grammar blob of one architecture.
///
/// The first state of `states` is the start state of the automaton.
#[derive(Clone, Debug)]
pub struct GrammarTables {
    /// All states; index 0 is the start state.
    pub states: Vec<FsmState>,
    /// The number of grammar symbols, including the reserved symbol 0.
    pub n_symbols: usize,
    /// The final actions, indexed by the identifiers reduce states carry.
    pub final_actions: Vec<FinalAction>,
    /// The minimum instruction length in bits.
    pub insn_minlen: u16,
    /// The maximum instruction length in bits.
    pub insn_maxlen: u16,
    /// Symbol names, for debug logging only. May be empty.
    pub sym_names: Vec<&'static str>,
}

impl GrammarTables {
    /// Looks a symbol name up for debug logging.
    pub fn sym_name(&self, sym: u16) -> &'static str {
        self.sym_names.get(sym as usize).copied().unwrap_or("?")
    }
}

/// Incremental assembly of a [`GrammarTables`] blob.
///
/// Per-architecture table modules stand in for the external grammar
/// compiler: they append states in automaton order (the first appended
/// state is the start state) and every append returns the identifier
/// transitions refer to.
///
/// [`GrammarTables`]: struct.GrammarTables.html
pub struct GrammarBuilder {
    states: Vec<FsmState>,
    final_actions: Vec<FinalAction>,
    n_symbols: usize,
    insn_minlen: u16,
    insn_maxlen: u16,
    sym_names: Vec<&'static str>,
}

impl GrammarBuilder {
    /// Starts a blob for a grammar of `n_symbols` symbols and the given
    /// instruction length bounds in bits.
    pub fn new(n_symbols: usize, insn_minlen: u16, insn_maxlen: u16) -> Self {
        GrammarBuilder {
            states: Vec::new(),
            final_actions: Vec::new(),
            n_symbols,
            insn_minlen,
            insn_maxlen,
            sym_names: Vec::new(),
        }
    }

    /// Records the symbol names used by debug logging.
    pub fn sym_names(&mut self, names: Vec<&'static str>) {
        self.sym_names = names;
    }

    /// Registers a final action and returns the identifier reduce
    /// states carry.
    pub fn final_action(&mut self, action: FinalAction) -> u16 {
        self.final_actions.push(action);
        (self.final_actions.len() - 1) as u16
    }

    /// Appends a state and returns its identifier.
    pub fn push(&mut self, state: FsmState) -> u32 {
        self.states.push(state);
        (self.states.len() - 1) as u32
    }

    /// Appends a shift state.
    pub fn shift(&mut self, shift: ShiftState) -> u32 {
        self.push(FsmState::new(StateKind::Shift(shift)))
    }

    /// Appends a shift state consuming `len` raw bits unconditionally
    /// before entering `next`.
    pub fn take_bits(&mut self, len: u16, next: u32) -> u32 {
        let shift = ShiftState::new(self.n_symbols).table(SubTable::always_ok(
            SubList::always_ok(SubValue::state(0, 0, next, len)),
        ));
        self.shift(shift)
    }

    /// Appends a reduce state for symbol `lhs`.
    pub fn reduce(
        &mut self,
        lhs: u16,
        reductions: Vec<Reduction>,
        sem_action: Option<SemAction>,
        final_action: Option<u16>,
    ) -> u32 {
        self.push(FsmState::new(StateKind::Reduce(ReduceState {
            reductions,
            sem_action,
            lhs,
            final_action,
        })))
    }

    /// Appends a shift-reduce state.
    pub fn shift_reduce(&mut self, shift: ShiftState, reduce: ReduceState) -> u32 {
        self.push(FsmState::new(StateKind::ShiftReduce(shift, reduce)))
    }

    /// Appends the state ending a word.
    pub fn final_state(&mut self) -> u32 {
        self.push(FsmState::new(StateKind::Final))
    }

    /// Finishes the blob.
    pub fn build(self) -> GrammarTables {
        GrammarTables {
            states: self.states,
            n_symbols: self.n_symbols,
            final_actions: self.final_actions,
            insn_minlen: self.insn_minlen,
            insn_maxlen: self.insn_maxlen,
            sym_names: self.sym_names,
        }
    }
}
