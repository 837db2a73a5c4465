//! The instruction list that blocks are built from and that the dispatcher is threaded through.
//!
//! The host lowers each block it builds into an [InstList] and encodes machine code from the
//! list once every pass has run. The list is an arena of [Inst]s linked in program order: an
//! [InstIdx] stays valid for the lifetime of the list no matter what is inserted around it, which
//! lets passes remember positions (labels, "insert here" points) while they keep editing. Removed
//! instructions stay in the arena but are unlinked.
//!
//! The instruction set is deliberately small and x86-flavoured: it has exactly what the engine and
//! the application code it wraps need in order to reason about registers, arithmetic flags and
//! control flow. Conventions used throughout (in alphabetical order):
//!
//!  * `app`: an instruction that came from the application.
//!  * `meta`: an instruction inserted by instrumentation (the engine's or a client's). Meta
//!    instructions have no application pc.
//!  * `slot`: one of the engine's reserved thread-local storage words (see [Slot]).
//!  * `spill`/`restore`: a meta `mov slot <- reg` / `mov reg <- slot`.

use std::{collections::HashMap, fmt};
use strum::{Display, EnumCount, EnumIter, FromRepr};
use typed_index_collections::TiVec;

/// General purpose registers.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, EnumIter, FromRepr, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Reg {
    RAX = 0,
    RCX,
    RDX,
    RBX,
    RBP,
    RSI,
    RDI,
    R8,
}

impl Reg {
    pub fn idx(self) -> usize {
        usize::from(self as u8)
    }
}

/// The engine's reserved thread-local storage. These words are distinct from any storage that
/// client instrumentation can obtain, so the dispatcher can spill into them without coordinating
/// with anybody else.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, EnumIter, FromRepr, Eq, Hash, PartialEq)]
pub enum Slot {
    /// The runtime case encoding of the block being dispatched.
    #[strum(to_string = "encoding")]
    Encoding = 0,
    /// The application value of the dispatcher's scratch register.
    #[strum(to_string = "scratch")]
    Scratch,
    /// The application's arithmetic flags.
    #[strum(to_string = "flags")]
    Flags,
    /// The address of this thread's hit-count table.
    #[strum(to_string = "hit_table")]
    HitTable,
}

impl Slot {
    pub fn idx(self) -> usize {
        usize::from(self as u8)
    }
}

/// The size of a memory access.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum OpSize {
    Byte,
    Word,
    Dword,
    Qword,
}

impl OpSize {
    /// The size of a pointer on the targets we generate code for.
    pub const PTR: OpSize = OpSize::Qword;

    pub fn bytes(self) -> u32 {
        match self {
            OpSize::Byte => 1,
            OpSize::Word => 2,
            OpSize::Dword => 4,
            OpSize::Qword => 8,
        }
    }

    /// Truncate `val` to this size.
    pub fn truncate(self, val: u64) -> u64 {
        match self {
            OpSize::Qword => val,
            _ => val & ((1u64 << (self.bytes() * 8)) - 1),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Opnd {
    Reg(Reg),
    Imm(u64),
    Slot(Slot),
    Mem { addr: u64, size: OpSize },
}

impl Opnd {
    /// A pointer-sized memory operand at `addr`.
    pub fn mem_ptr(addr: u64) -> Self {
        Opnd::Mem {
            addr,
            size: OpSize::PTR,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Opnd::Slot(_) | Opnd::Mem { .. })
    }

    fn reg(&self) -> Option<Reg> {
        match self {
            Opnd::Reg(r) => Some(*r),
            _ => None,
        }
    }
}

/// Conditions tested by [InstKind::Jcc].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Cond {
    /// Zero flag set.
    Z,
    /// Zero flag clear.
    NZ,
}

/// Where a control transfer goes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Target {
    /// A label in the same list.
    Label(InstIdx),
    /// An absolute code address outside the list.
    Pc(u64),
}

/// The native routine an out-of-line ("clean") call invokes. The host guarantees the full
/// execution context is saved before, and restored after, the call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Callee {
    /// Record that an execution fell back to the default case.
    BailCount,
    /// Decide whether a newly seen case should be added to a block (the promotion stub).
    NewCase,
    /// Client-defined code, identified by an opaque id.
    User(u64),
}

/// Annotations carried by labels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Note {
    /// The start of a block variant.
    Start,
    /// The point all variants but the last jump to when they finish.
    Exit,
    /// The start of a range of instrumentation-visible instructions that emulate a single
    /// application instruction. If `rest_of_block` is true the range implicitly extends to the
    /// end of the block.
    EmulateStart { rest_of_block: bool },
    /// The end of an emulation range.
    EmulateEnd,
    /// Client-defined.
    User(u64),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstKind {
    Label,
    Nop,
    Mov {
        dst: Opnd,
        src: Opnd,
    },
    /// Load `src` into `dst`. If `acquire` is true the load has acquire semantics.
    Load {
        dst: Reg,
        src: Opnd,
        acquire: bool,
    },
    /// `dst += src`, setting the arithmetic flags.
    Add {
        dst: Opnd,
        src: Opnd,
    },
    /// Set the arithmetic flags according to `lhs - rhs`.
    Cmp {
        lhs: Opnd,
        rhs: Opnd,
    },
    /// Copy the arithmetic flags into a register. Does not alter the flags.
    SaveFlags(Reg),
    /// Set the arithmetic flags from a register previously written by [InstKind::SaveFlags].
    RestoreFlags(Reg),
    /// Decrement entry `n` of the current thread's hit-count table (found through
    /// [Slot::HitTable]), setting the zero flag if the entry reaches zero.
    DecHitCount(u32),
    Jmp(Target),
    Jcc(Cond, Target),
    /// Jump if `rcx` is zero. Neither reads nor writes the flags.
    Jrcxz(Target),
    Call(Target),
    Ret,
    Syscall,
    Interrupt(u8),
    IndirectJmp(Reg),
    CleanCall {
        callee: Callee,
        arg: Opnd,
    },
}

impl InstKind {
    /// The number of bytes this instruction occupies once encoded.
    pub fn encoded_len(&self) -> u64 {
        match self {
            InstKind::Label => 0,
            InstKind::Nop | InstKind::Ret => 1,
            InstKind::Jrcxz(_) | InstKind::Syscall | InstKind::Interrupt(_) => 2,
            InstKind::IndirectJmp(_) => 3,
            InstKind::SaveFlags(_) | InstKind::RestoreFlags(_) => 4,
            InstKind::Jmp(_) | InstKind::Call(_) => 5,
            InstKind::Jcc(..) | InstKind::Add { .. } => 6,
            InstKind::Mov { .. } | InstKind::Load { .. } | InstKind::Cmp { .. } => 8,
            InstKind::DecHitCount(_) => 9,
            InstKind::CleanCall { .. } => 32,
        }
    }

    /// Is this a control transfer instruction?
    pub fn is_cti(&self) -> bool {
        matches!(
            self,
            InstKind::Jmp(_)
                | InstKind::Jcc(..)
                | InstKind::Jrcxz(_)
                | InstKind::Call(_)
                | InstKind::Ret
                | InstKind::IndirectJmp(_)
        )
    }

    /// Must this instruction be the last one in a block?
    pub fn is_block_terminator(&self) -> bool {
        self.is_cti() || matches!(self, InstKind::Syscall | InstKind::Interrupt(_))
    }

    pub fn reads_reg(&self, reg: Reg) -> bool {
        match self {
            InstKind::Mov { src, .. } => src.reg() == Some(reg),
            InstKind::Add { dst, src } | InstKind::Cmp { lhs: dst, rhs: src } => {
                dst.reg() == Some(reg) || src.reg() == Some(reg)
            }
            InstKind::RestoreFlags(r) | InstKind::IndirectJmp(r) => *r == reg,
            InstKind::Jrcxz(_) => reg == Reg::RCX,
            InstKind::CleanCall { arg, .. } => arg.reg() == Some(reg),
            _ => false,
        }
    }

    pub fn writes_reg(&self, reg: Reg) -> bool {
        match self {
            InstKind::Mov { dst, .. } | InstKind::Add { dst, .. } => dst.reg() == Some(reg),
            InstKind::Load { dst, .. } | InstKind::SaveFlags(dst) => *dst == reg,
            _ => false,
        }
    }

    pub fn reads_flags(&self) -> bool {
        matches!(self, InstKind::SaveFlags(_) | InstKind::Jcc(..))
    }

    pub fn writes_flags(&self) -> bool {
        matches!(
            self,
            InstKind::Add { .. }
                | InstKind::Cmp { .. }
                | InstKind::RestoreFlags(_)
                | InstKind::DecHitCount(_)
        )
    }

    pub fn writes_slot(&self, slot: Slot) -> bool {
        matches!(self, InstKind::Mov { dst: Opnd::Slot(s), .. } if *s == slot)
    }

    fn target_mut(&mut self) -> Option<&mut Target> {
        match self {
            InstKind::Jmp(t) | InstKind::Jcc(_, t) | InstKind::Jrcxz(t) | InstKind::Call(t) => {
                Some(t)
            }
            _ => None,
        }
    }

    pub fn target(&self) -> Option<Target> {
        match self {
            InstKind::Jmp(t) | InstKind::Jcc(_, t) | InstKind::Jrcxz(t) | InstKind::Call(t) => {
                Some(*t)
            }
            _ => None,
        }
    }
}

// Generate the conversions `TiVec` needs for `usize` newtype indices.
macro_rules! index_usize {
    ($struct:ident) => {
        impl From<usize> for $struct {
            fn from(v: usize) -> Self {
                Self(v)
            }
        }

        impl From<$struct> for usize {
            fn from(v: $struct) -> Self {
                v.0
            }
        }
    };
}
pub(crate) use index_usize;

/// An index into an [InstList]'s arena.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InstIdx(usize);
index_usize!(InstIdx);

impl fmt::Display for InstIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct Inst {
    kind: InstKind,
    meta: bool,
    app_pc: Option<u64>,
    note: Option<Note>,
    prev: Option<InstIdx>,
    next: Option<InstIdx>,
    linked: bool,
}

impl Inst {
    fn new(kind: InstKind, meta: bool, app_pc: Option<u64>, note: Option<Note>) -> Self {
        Self {
            kind,
            meta,
            app_pc,
            note,
            prev: None,
            next: None,
            linked: false,
        }
    }

    /// An application instruction that came from address `pc`.
    pub fn app(kind: InstKind, pc: u64) -> Self {
        Self::new(kind, false, Some(pc), None)
    }

    pub fn meta(kind: InstKind) -> Self {
        Self::new(kind, true, None, None)
    }

    pub fn label(note: Option<Note>) -> Self {
        Self::new(InstKind::Label, true, None, note)
    }

    /// `mov slot <- reg`.
    pub fn spill(slot: Slot, reg: Reg) -> Self {
        Self::meta(InstKind::Mov {
            dst: Opnd::Slot(slot),
            src: Opnd::Reg(reg),
        })
    }

    /// `mov reg <- slot`.
    pub fn restore(reg: Reg, slot: Slot) -> Self {
        Self::meta(InstKind::Mov {
            dst: Opnd::Reg(reg),
            src: Opnd::Slot(slot),
        })
    }

    pub fn kind(&self) -> &InstKind {
        &self.kind
    }

    pub fn is_meta(&self) -> bool {
        self.meta
    }

    pub fn is_app(&self) -> bool {
        !self.meta
    }

    pub fn app_pc(&self) -> Option<u64> {
        self.app_pc
    }

    pub fn note(&self) -> Option<Note> {
        self.note
    }

    pub fn is_label(&self) -> bool {
        matches!(self.kind, InstKind::Label)
    }

    /// Is this a meta label carrying `note`?
    pub fn is_label_with(&self, note: Note) -> bool {
        self.is_label() && self.meta && self.note == Some(note)
    }

    /// If this is a meta spill, return the slot and register involved.
    pub fn as_spill(&self) -> Option<(Slot, Reg)> {
        match self.kind {
            InstKind::Mov {
                dst: Opnd::Slot(s),
                src: Opnd::Reg(r),
            } if self.meta => Some((s, r)),
            _ => None,
        }
    }

    /// If this is a meta restore, return the register and slot involved.
    pub fn as_restore(&self) -> Option<(Reg, Slot)> {
        match self.kind {
            InstKind::Mov {
                dst: Opnd::Reg(r),
                src: Opnd::Slot(s),
            } if self.meta => Some((r, s)),
            _ => None,
        }
    }

    fn map_label_targets(&mut self, map: &HashMap<InstIdx, InstIdx>) {
        if let Some(Target::Label(old)) = self.kind.target_mut() {
            if let Some(new) = map.get(old) {
                *old = *new;
            }
        }
    }
}

/// What a liveness query asks about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Liveness {
    Reg(Reg),
    Flags,
}

/// A list of instructions. See the module documentation for the invariants.
#[derive(Clone, Debug, Default)]
pub struct InstList {
    insts: TiVec<InstIdx, Inst>,
    first: Option<InstIdx>,
    last: Option<InstIdx>,
    len: usize,
}

impl InstList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_insts<I: IntoIterator<Item = Inst>>(insts: I) -> Self {
        let mut l = Self::new();
        for inst in insts {
            l.append(inst);
        }
        l
    }

    /// How many instructions are linked into the list?
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn first(&self) -> Option<InstIdx> {
        self.first
    }

    pub fn last(&self) -> Option<InstIdx> {
        self.last
    }

    pub fn next(&self, idx: InstIdx) -> Option<InstIdx> {
        self.insts[idx].next
    }

    pub fn prev(&self, idx: InstIdx) -> Option<InstIdx> {
        self.insts[idx].prev
    }

    pub fn inst(&self, idx: InstIdx) -> &Inst {
        &self.insts[idx]
    }

    /// Iterate over the linked instructions in program order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cur: self.first,
        }
    }

    /// The indices of the linked instructions in program order. Handy for passes that insert
    /// instructions while walking the list.
    pub fn indices(&self) -> Vec<InstIdx> {
        self.iter().map(|(idx, _)| idx).collect()
    }

    /// Add `inst` to the arena without linking it. `inst` may be a copy of an instruction linked
    /// into some list: its links are meaningless here, so they are cleared.
    fn push_unlinked(&mut self, mut inst: Inst) -> InstIdx {
        inst.prev = None;
        inst.next = None;
        inst.linked = false;
        self.insts.push_and_get_key(inst)
    }

    fn link_before(&mut self, idx: InstIdx, at: Option<InstIdx>) {
        debug_assert!(!self.insts[idx].linked);
        let prev = match at {
            Some(at) => self.insts[at].prev,
            None => self.last,
        };
        self.insts[idx].prev = prev;
        self.insts[idx].next = at;
        self.insts[idx].linked = true;
        match prev {
            Some(p) => self.insts[p].next = Some(idx),
            None => self.first = Some(idx),
        }
        match at {
            Some(at) => self.insts[at].prev = Some(idx),
            None => self.last = Some(idx),
        }
        self.len += 1;
    }

    pub fn append(&mut self, inst: Inst) -> InstIdx {
        self.preinsert(None, inst)
    }

    pub fn prepend(&mut self, inst: Inst) -> InstIdx {
        let first = self.first;
        self.preinsert(first, inst)
    }

    /// Insert `inst` before `at` or, if `at` is `None`, at the end of the list.
    pub fn preinsert(&mut self, at: Option<InstIdx>, inst: Inst) -> InstIdx {
        let idx = self.push_unlinked(inst);
        self.link_before(idx, at);
        idx
    }

    pub fn insert_before(&mut self, at: InstIdx, inst: Inst) -> InstIdx {
        self.preinsert(Some(at), inst)
    }

    pub fn insert_after(&mut self, at: InstIdx, inst: Inst) -> InstIdx {
        let next = self.insts[at].next;
        self.preinsert(next, inst)
    }

    /// Unlink `idx` from the list. The instruction stays in the arena, so `idx` remains a valid
    /// argument to [Self::inst].
    pub fn remove(&mut self, idx: InstIdx) {
        debug_assert!(self.insts[idx].linked);
        let (prev, next) = (self.insts[idx].prev, self.insts[idx].next);
        match prev {
            Some(p) => self.insts[p].next = next,
            None => self.first = next,
        }
        match next {
            Some(n) => self.insts[n].prev = prev,
            None => self.last = prev,
        }
        let inst = &mut self.insts[idx];
        inst.prev = None;
        inst.next = None;
        inst.linked = false;
        self.len -= 1;
    }

    pub fn first_app(&self) -> Option<InstIdx> {
        self.iter().find(|(_, i)| i.is_app()).map(|(idx, _)| idx)
    }

    pub fn last_app(&self) -> Option<InstIdx> {
        let mut cur = self.last;
        while let Some(idx) = cur {
            if self.insts[idx].is_app() {
                return Some(idx);
            }
            cur = self.insts[idx].prev;
        }
        None
    }

    pub fn first_nonlabel(&self) -> Option<InstIdx> {
        self.iter().find(|(_, i)| !i.is_label()).map(|(idx, _)| idx)
    }

    /// Copy every instruction of `src` into `self`, inserting the copies before `at` (or at the
    /// end if `at` is `None`). Label targets inside `src` are redirected to the copied labels.
    /// Returns the index of the first copy, if `src` was non-empty.
    pub fn splice_copy(&mut self, at: Option<InstIdx>, src: &InstList) -> Option<InstIdx> {
        let mut map = HashMap::with_capacity(src.len());
        let mut copies = Vec::with_capacity(src.len());
        for (old, inst) in src.iter() {
            let mut cp = inst.clone();
            cp.linked = false;
            let new = self.push_unlinked(cp);
            map.insert(old, new);
            copies.push(new);
        }
        for &new in &copies {
            self.insts[new].map_label_targets(&map);
            self.link_before(new, at);
        }
        copies.first().copied()
    }

    /// Copy the instructions from `from` (inclusive) up to, but excluding, the first instruction
    /// for which `stop` returns true, into a fresh list.
    pub fn extract<F>(&self, from: Option<InstIdx>, stop: F) -> InstList
    where
        F: Fn(InstIdx, &Inst) -> bool,
    {
        let mut out = InstList::new();
        let mut map = HashMap::new();
        let mut cur = from;
        while let Some(idx) = cur {
            let inst = &self.insts[idx];
            if stop(idx, inst) {
                break;
            }
            let mut cp = inst.clone();
            cp.linked = false;
            let new = out.push_unlinked(cp);
            out.link_before(new, None);
            map.insert(idx, new);
            cur = inst.next;
        }
        for idx in out.indices() {
            out.insts[idx].map_label_targets(&map);
        }
        out
    }

    /// Assign a code address to every linked instruction, starting at `start_pc`.
    pub fn encode(&self, start_pc: u64) -> Encoded {
        let mut pcs = TiVec::from(vec![None; self.insts.len()]);
        let mut pc = start_pc;
        for (idx, inst) in self.iter() {
            pcs[idx] = Some(pc);
            pc += inst.kind.encoded_len();
        }
        Encoded {
            pcs,
            start_pc,
            end_pc: pc,
        }
    }

    /// Is `what` dead immediately before `at`? The answer is conservative: anything that might be
    /// read after the end of the block is considered live.
    pub fn is_dead(&self, at: InstIdx, what: Liveness) -> bool {
        let mut cur = Some(at);
        while let Some(idx) = cur {
            let k = &self.insts[idx].kind;
            let (reads, writes) = match what {
                Liveness::Reg(r) => (k.reads_reg(r), k.writes_reg(r)),
                Liveness::Flags => (k.reads_flags(), k.writes_flags()),
            };
            if reads {
                return false;
            }
            if writes {
                return true;
            }
            if k.is_block_terminator() {
                return false;
            }
            cur = self.insts[idx].next;
        }
        false
    }
}

pub struct Iter<'a> {
    list: &'a InstList,
    cur: Option<InstIdx>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (InstIdx, &'a Inst);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cur?;
        let inst = &self.list.insts[idx];
        self.cur = inst.next;
        Some((idx, inst))
    }
}

/// The code addresses an [InstList] was encoded at.
#[derive(Clone, Debug)]
pub struct Encoded {
    pcs: TiVec<InstIdx, Option<u64>>,
    start_pc: u64,
    end_pc: u64,
}

impl Encoded {
    pub fn pc(&self, idx: InstIdx) -> Option<u64> {
        self.pcs.get(idx).copied().flatten()
    }

    pub fn start_pc(&self) -> u64 {
        self.start_pc
    }

    /// The first address past the end of the encoded code.
    pub fn end_pc(&self) -> u64 {
        self.end_pc
    }

    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.start_pc && pc < self.end_pc
    }
}

impl fmt::Display for Opnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opnd::Reg(r) => write!(f, "{r}"),
            Opnd::Imm(x) => write!(f, "{x:#x}"),
            Opnd::Slot(s) => write!(f, "tls[{s}]"),
            Opnd::Mem { addr, size } => {
                let sz = match size {
                    OpSize::Byte => "byte",
                    OpSize::Word => "word",
                    OpSize::Dword => "dword",
                    OpSize::Qword => "qword",
                };
                write!(f, "{sz} [{addr:#x}]")
            }
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Label(idx) => write!(f, "{idx}"),
            Target::Pc(pc) => write!(f, "{pc:#x}"),
        }
    }
}

impl fmt::Display for InstKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstKind::Label => write!(f, "label"),
            InstKind::Nop => write!(f, "nop"),
            InstKind::Mov { dst, src } => write!(f, "mov {dst}, {src}"),
            InstKind::Load { dst, src, acquire } => {
                if *acquire {
                    write!(f, "load.acq {dst}, {src}")
                } else {
                    write!(f, "load {dst}, {src}")
                }
            }
            InstKind::Add { dst, src } => write!(f, "add {dst}, {src}"),
            InstKind::Cmp { lhs, rhs } => write!(f, "cmp {lhs}, {rhs}"),
            InstKind::SaveFlags(r) => write!(f, "save_flags {r}"),
            InstKind::RestoreFlags(r) => write!(f, "restore_flags {r}"),
            InstKind::DecHitCount(n) => write!(f, "dec_hit_count {n}"),
            InstKind::Jmp(t) => write!(f, "jmp {t}"),
            InstKind::Jcc(Cond::Z, t) => write!(f, "jz {t}"),
            InstKind::Jcc(Cond::NZ, t) => write!(f, "jnz {t}"),
            InstKind::Jrcxz(t) => write!(f, "jrcxz {t}"),
            InstKind::Call(t) => write!(f, "call {t}"),
            InstKind::Ret => write!(f, "ret"),
            InstKind::Syscall => write!(f, "syscall"),
            InstKind::Interrupt(n) => write!(f, "int {n:#x}"),
            InstKind::IndirectJmp(r) => write!(f, "jmp *{r}"),
            InstKind::CleanCall { callee, arg } => {
                let c = match callee {
                    Callee::BailCount => "bail_count".to_owned(),
                    Callee::NewCase => "new_case".to_owned(),
                    Callee::User(x) => format!("user({x})"),
                };
                write!(f, "clean_call {c}, {arg}")
            }
        }
    }
}

impl fmt::Display for InstList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, inst) in self.iter() {
            if inst.is_label() {
                match inst.note {
                    Some(Note::Start) => writeln!(f, "{idx}: start")?,
                    Some(Note::Exit) => writeln!(f, "{idx}: exit")?,
                    Some(Note::EmulateStart { rest_of_block }) => {
                        if rest_of_block {
                            writeln!(f, "{idx}: emulate_start rest_of_block")?
                        } else {
                            writeln!(f, "{idx}: emulate_start")?
                        }
                    }
                    Some(Note::EmulateEnd) => writeln!(f, "{idx}: emulate_end")?,
                    Some(Note::User(x)) => writeln!(f, "{idx}: user({x})")?,
                    None => writeln!(f, "{idx}:")?,
                }
            } else if inst.meta {
                writeln!(f, "  meta {}", inst.kind)?;
            } else {
                writeln!(f, "  app {}", inst.kind)?;
            }
        }
        Ok(())
    }
}

/// Check that the textual form of `ilist` matches the [fm] pattern `ptn`. Use `{{name}}` to match
/// (consistently) against label and other non-literal names, `{{_}}` to ignore one.
#[cfg(test)]
pub(crate) fn assert_ilist_matches(ilist: &InstList, ptn: &str) {
    use fm::FMBuilder;
    use regex::Regex;
    use std::sync::OnceLock;

    // Compiling the regexes once and cloning them avoids contention between test threads.
    static PTN_RE: OnceLock<Regex> = OnceLock::new();
    static PTN_RE_IGNORE: OnceLock<Regex> = OnceLock::new();
    static TEXT_RE: OnceLock<Regex> = OnceLock::new();
    let ptn_re = PTN_RE
        .get_or_init(|| Regex::new(r"\{\{.+?\}\}").unwrap())
        .clone();
    let ptn_re_ignore = PTN_RE_IGNORE
        .get_or_init(|| Regex::new(r"\{\{_\}\}").unwrap())
        .clone();
    let text_re = TEXT_RE
        .get_or_init(|| Regex::new(r"[a-zA-Z0-9\._]+").unwrap())
        .clone();
    let fmm = FMBuilder::new(ptn)
        .unwrap()
        .name_matcher_ignore(ptn_re_ignore, text_re.clone())
        .name_matcher(ptn_re, text_re)
        .build()
        .unwrap();
    if let Err(e) = fmm.matches(&ilist.to_string()) {
        panic!("{e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mov(d: Reg, s: Reg) -> InstKind {
        InstKind::Mov {
            dst: Opnd::Reg(d),
            src: Opnd::Reg(s),
        }
    }

    #[test]
    fn insert_and_remove_keep_links_consistent() {
        let mut l = InstList::new();
        let a = l.append(Inst::app(mov(Reg::RBX, Reg::RCX), 0x10));
        let c = l.append(Inst::app(InstKind::Ret, 0x18));
        let b = l.insert_before(c, Inst::app(mov(Reg::RSI, Reg::RAX), 0x14));
        let z = l.prepend(Inst::label(Some(Note::Start)));
        assert_eq!(l.indices(), vec![z, a, b, c]);
        assert_eq!(l.len(), 4);
        l.remove(b);
        assert_eq!(l.indices(), vec![z, a, c]);
        assert_eq!(l.prev(c), Some(a));
        l.remove(z);
        assert_eq!(l.first(), Some(a));
        assert_eq!(l.first_app(), Some(a));
        assert_eq!(l.last_app(), Some(c));
        // Removed instructions are still reachable through their index.
        assert_eq!(l.inst(b).app_pc(), Some(0x14));
    }

    #[test]
    fn splice_copy_remaps_labels() {
        let mut src = InstList::new();
        let lbl = src.append(Inst::label(None));
        src.append(Inst::meta(InstKind::Jmp(Target::Label(lbl))));
        let mut dst = InstList::new();
        let ret = dst.append(Inst::app(InstKind::Ret, 0));
        let first = dst.splice_copy(Some(ret), &src).unwrap();
        let jmp = dst.next(first).unwrap();
        assert_eq!(dst.inst(jmp).kind().target(), Some(Target::Label(first)));
        assert_eq!(dst.last(), Some(ret));
        assert_eq!(dst.len(), 3);
    }

    #[test]
    fn liveness() {
        let mut l = InstList::new();
        let a = l.append(Inst::app(mov(Reg::RAX, Reg::RBX), 0));
        l.append(Inst::app(
            InstKind::Cmp {
                lhs: Opnd::Reg(Reg::RCX),
                rhs: Opnd::Imm(0),
            },
            8,
        ));
        l.append(Inst::app(InstKind::Ret, 16));
        assert!(l.is_dead(a, Liveness::Reg(Reg::RAX)));
        assert!(!l.is_dead(a, Liveness::Reg(Reg::RBX)));
        assert!(!l.is_dead(a, Liveness::Reg(Reg::RCX)));
        assert!(l.is_dead(a, Liveness::Flags));
        // Live out of the block.
        assert!(!l.is_dead(a, Liveness::Reg(Reg::RDX)));
    }

    #[test]
    fn encode_gives_labels_zero_length() {
        let mut l = InstList::new();
        let s = l.append(Inst::label(Some(Note::Start)));
        let r = l.append(Inst::app(InstKind::Ret, 0));
        let enc = l.encode(0x1000);
        assert_eq!(enc.pc(s), Some(0x1000));
        assert_eq!(enc.pc(r), Some(0x1000));
        assert_eq!(enc.end_pc(), 0x1001);
        assert!(enc.contains(0x1000));
        assert!(!enc.contains(0x1001));
    }
}
