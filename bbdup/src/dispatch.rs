//! The insertion phase: instrumenting each variant and threading the dispatcher through them.
//!
//! For a block with cases `A` and `B` (and the default `D`) the final unit looks like:
//!
//! ```text
//!   spill scratch, flags          ; only those that are live
//!   <compute encoding>
//! START
//!   cmp encoding, A
//!   jnz START'
//!   restore flags, scratch        ; "landing restoration"
//!   <A's instrumented body>
//!   jmp EXIT
//! START'
//!   cmp encoding, B
//!   jnz START''
//!   restore flags, scratch
//!   <B's instrumented body>
//!   jmp EXIT
//! START''
//!   <promotion trigger>           ; only with dynamic handling
//!   restore flags, scratch
//!   <D's instrumented body>
//! EXIT
//!   <shared terminator>
//! ```
//!
//! When a block has exactly the cases 0 and 1 and no cases can be added, the compare is replaced
//! by a flags-free zero test of `rcx`, so the flags never need preserving.

use crate::{
    client::InstrumentCx,
    duplicate::{is_variant_end, is_variant_start, next_end, next_start, special_last},
    engine::{Build, EncodingSource, Engine, ThreadCtx},
    hitcount::HitTable,
    ir::{Callee, Cond, Inst, InstIdx, InstKind, InstList, Liveness, Opnd, Reg, Slot, Target},
    log::Verbosity,
    manager::BlockManager,
};

/// The cached boundaries of the variant being instrumented.
#[derive(Clone, Copy, Default)]
struct Bounds {
    first: Option<InstIdx>,
    first_nonlabel: Option<InstIdx>,
    last: Option<InstIdx>,
}

/// Which variant the insertion walk is in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Cursor {
    NotStarted,
    Variant(usize),
    /// Past the end of the last variant: only the shared terminator remains.
    Ignore,
}

impl Engine {
    /// Does the block use the flags-free zero test rather than compares?
    pub(crate) fn uses_zero_test(&self, m: &BlockManager) -> bool {
        if !matches!(self.encoding, EncodingSource::Memory { .. })
            || m.enable_dynamic_handling
            || self.max_case_encoding != 1
        {
            return false;
        }
        let mut cases = m.defined_cases();
        match (cases.next(), cases.next()) {
            (Some(c), None) => (c.encoding == 0) != (m.default_case.encoding == 0),
            _ => false,
        }
    }

    /// Pick the scratch register and record what the dispatcher must preserve at `first`.
    pub(crate) fn choose_dispatch(&self, m: &mut BlockManager, ilist: &InstList, first: InstIdx) {
        let zero_test = self.uses_zero_test(m);
        m.scratch_reg = if zero_test { Reg::RCX } else { Reg::RAX };
        m.scratch_dead = self
            .host
            .is_dead(ilist, first, Liveness::Reg(m.scratch_reg));
        // Nothing in the zero-test dispatcher touches the flags.
        m.flags_dead = zero_test || self.host.is_dead(ilist, first, Liveness::Flags);
    }

    /// Instrument the block being built and insert its dispatcher. Drops the block's analyses.
    pub fn insert_phase(&self, tc: &mut ThreadCtx, ilist: &mut InstList) {
        let Some(b) = tc.build.take() else {
            return;
        };
        if b.manager.enable_dup {
            self.instrument_dups(&b, ilist);
        } else {
            self.instrument_without_dups(&b, ilist);
        }
        self.log
            .log_block(Verbosity::BlockEvent, b.tag, || format!("instrumented:\n{ilist}"));
    }

    fn instrument(
        &self,
        b: &Build,
        bounds: Bounds,
        variant: usize,
        ilist: &mut InstList,
        instr: InstIdx,
        at: InstIdx,
    ) {
        let cx = InstrumentCx {
            tag: b.tag,
            encoding: b.manager.variant_encoding(variant),
            orig: b.orig.as_ref(),
            case: b.cases.get(variant).and_then(Option::as_ref),
            first: bounds.first,
            first_nonlabel: bounds.first_nonlabel,
            last: bounds.last,
        };
        self.client.instrument_instr(&cx, ilist, instr, at);
    }

    fn instrument_without_dups(&self, b: &Build, ilist: &mut InstList) {
        let bounds = Bounds {
            first: ilist.first(),
            first_nonlabel: ilist.first_nonlabel(),
            last: ilist.last(),
        };
        for idx in ilist.indices() {
            self.instrument(b, bounds, 0, ilist, idx, idx);
        }
    }

    fn instrument_dups(&self, b: &Build, ilist: &mut InstList) {
        let m = &b.manager;
        let special = special_last(ilist);
        let indices = ilist.indices();
        if let Some(&first) = indices.first() {
            self.insert_prologue(b, ilist, first);
        }
        let mut cursor = Cursor::NotStarted;
        let mut bounds = Bounds::default();
        for idx in indices {
            if is_variant_start(ilist, idx) {
                let (Some(next), Some(end)) = (ilist.next(idx), next_end(ilist, Some(idx))) else {
                    unreachable!("variant without an end");
                };
                bounds = variant_bounds(ilist, next, end, special);
                let variant = match cursor {
                    Cursor::NotStarted => 0,
                    Cursor::Variant(i) => i + 1,
                    Cursor::Ignore => unreachable!("variant after the last"),
                };
                cursor = Cursor::Variant(variant);
                match next_start(ilist, Some(end)) {
                    Some(next_label) => {
                        let enc = m.variant_encoding(variant);
                        self.insert_dispatch(m, ilist, next, next_label, enc);
                    }
                    None => {
                        debug_assert_eq!(variant + 1, m.variant_count());
                        self.insert_dispatch_end(b.tag, m, ilist, next);
                    }
                }
            } else if is_variant_end(ilist, idx) {
                let Cursor::Variant(variant) = cursor else {
                    unreachable!("variant end outside a variant");
                };
                if let Some(special) = special {
                    self.instrument(b, bounds, variant, ilist, special, idx);
                    if variant + 1 == m.variant_count() {
                        cursor = Cursor::Ignore;
                    }
                }
                self.host.restore_user_spills(ilist, idx);
            } else {
                match cursor {
                    Cursor::Variant(variant) => {
                        self.instrument(b, bounds, variant, ilist, idx, idx)
                    }
                    Cursor::Ignore => debug_assert_eq!(Some(idx), special),
                    Cursor::NotStarted => unreachable!("instruction before the first variant"),
                }
            }
        }
    }

    /// Spill what the dispatcher clobbers and compute the runtime encoding, before `at`.
    fn insert_prologue(&self, b: &Build, ilist: &mut InstList, at: InstIdx) {
        let m = &b.manager;
        let r = m.scratch_reg;
        if !m.scratch_dead {
            ilist.insert_before(at, Inst::spill(Slot::Scratch, r));
        }
        if !m.flags_dead {
            ilist.insert_before(at, Inst::meta(InstKind::SaveFlags(r)));
            ilist.insert_before(at, Inst::spill(Slot::Flags, r));
            if !m.scratch_dead {
                ilist.insert_before(at, Inst::restore(r, Slot::Scratch));
            }
        }
        match &self.encoding {
            EncodingSource::Callback(enc) => {
                enc.insert_encode(ilist, at, b.orig.as_ref());
                self.host.restore_user_spills(ilist, at);
            }
            EncodingSource::Memory { opnd, atomic } => {
                ilist.insert_before(
                    at,
                    Inst::meta(InstKind::Load {
                        dst: r,
                        src: *opnd,
                        acquire: *atomic,
                    }),
                );
                // The zero test works on the register alone.
                if !self.uses_zero_test(m) {
                    ilist.insert_before(at, Inst::spill(Slot::Encoding, r));
                }
            }
        }
    }

    /// Insert, before `at`, code comparing the runtime encoding with `encoding`.
    fn insert_cmp(&self, m: &BlockManager, ilist: &mut InstList, at: InstIdx, encoding: u64) {
        let lhs = Engine::encoding_opnd();
        if fits_imm(encoding) {
            ilist.insert_before(
                at,
                Inst::meta(InstKind::Cmp {
                    lhs,
                    rhs: Opnd::Imm(encoding),
                }),
            );
        } else {
            let r = Opnd::Reg(m.scratch_reg);
            ilist.insert_before(
                at,
                Inst::meta(InstKind::Mov {
                    dst: r,
                    src: Opnd::Imm(encoding),
                }),
            );
            ilist.insert_before(at, Inst::meta(InstKind::Cmp { lhs, rhs: r }));
        }
    }

    /// Insert, before `at`, the dispatch for a non-default variant specialised for `encoding`:
    /// on a mismatch, jump to `next_label`.
    fn insert_dispatch(
        &self,
        m: &BlockManager,
        ilist: &mut InstList,
        at: InstIdx,
        next_label: InstIdx,
        encoding: u64,
    ) {
        if self.uses_zero_test(m) {
            debug_assert_eq!(m.scratch_reg, Reg::RCX);
            if encoding == 0 {
                let matched = ilist.insert_before(at, Inst::label(None));
                ilist.insert_before(
                    matched,
                    Inst::meta(InstKind::Jrcxz(Target::Label(matched))),
                );
                ilist.insert_before(
                    matched,
                    Inst::meta(InstKind::Jmp(Target::Label(next_label))),
                );
            } else {
                ilist.insert_before(
                    at,
                    Inst::meta(InstKind::Jrcxz(Target::Label(next_label))),
                );
            }
        } else {
            self.insert_cmp(m, ilist, at, encoding);
            ilist.insert_before(
                at,
                Inst::meta(InstKind::Jcc(Cond::NZ, Target::Label(next_label))),
            );
        }
        insert_landing(m, ilist, at);
    }

    /// Insert, before `at`, the entry of the default variant.
    fn insert_dispatch_end(
        &self,
        tag: u64,
        m: &BlockManager,
        ilist: &mut InstList,
        at: InstIdx,
    ) {
        if m.enable_dynamic_handling {
            let done = ilist.insert_before(at, Inst::label(None));
            self.insert_cmp(m, ilist, done, m.default_encoding());
            ilist.insert_before(
                done,
                Inst::meta(InstKind::Jcc(Cond::Z, Target::Label(done))),
            );
            // From here on the encoding is one the block has no variant for.
            if m.has_free_slot() {
                let stub = self.stub_pc();
                let r = Opnd::Reg(m.scratch_reg);
                let load_tag = Inst::meta(InstKind::Mov {
                    dst: r,
                    src: Opnd::Imm(tag),
                });
                if self.hit_threshold > 0 {
                    ilist.insert_before(
                        done,
                        Inst::meta(InstKind::DecHitCount(HitTable::hash(tag))),
                    );
                    ilist.insert_before(done, load_tag);
                    ilist.insert_before(
                        done,
                        Inst::meta(InstKind::Jcc(Cond::Z, Target::Pc(stub))),
                    );
                } else {
                    ilist.insert_before(done, load_tag);
                    ilist.insert_before(done, Inst::meta(InstKind::Jmp(Target::Pc(stub))));
                }
            }
            if self.stats.is_enabled() {
                ilist.insert_before(
                    done,
                    Inst::meta(InstKind::CleanCall {
                        callee: Callee::BailCount,
                        arg: Opnd::Imm(tag),
                    }),
                );
            }
        }
        insert_landing(m, ilist, at);
    }
}

/// Work out the boundaries of the variant whose first instruction is `next` and which ends at
/// `end`. The shared terminator, if there is one, belongs to every variant.
fn variant_bounds(
    ilist: &InstList,
    next: InstIdx,
    end: InstIdx,
    special: Option<InstIdx>,
) -> Bounds {
    let first = match special {
        Some(s) if next == end => Some(s),
        _ => Some(next),
    };
    let mut first_nonlabel = next;
    while first_nonlabel != end && ilist.inst(first_nonlabel).is_label() {
        match ilist.next(first_nonlabel) {
            Some(n) => first_nonlabel = n,
            None => break,
        }
    }
    let first_nonlabel = match special {
        Some(s) if first_nonlabel == end => Some(s),
        _ => Some(first_nonlabel),
    };
    let last = special.or_else(|| ilist.prev(end));
    Bounds {
        first,
        first_nonlabel,
        last,
    }
}

/// Can `encoding` be compared as a sign-extended 32-bit immediate? A `max_case_encoding` hint
/// bounds the runtime encodings, not the registered cases, so it can't make a wider case fit.
fn fits_imm(encoding: u64) -> bool {
    encoding <= i32::MAX as u64
}

/// Undo the dispatcher's spills before `at`.
fn insert_landing(m: &BlockManager, ilist: &mut InstList, at: InstIdx) {
    let r = m.scratch_reg;
    if !m.flags_dead {
        ilist.insert_before(at, Inst::restore(r, Slot::Flags));
        ilist.insert_before(at, Inst::meta(InstKind::RestoreFlags(r)));
    }
    if !m.scratch_dead {
        ilist.insert_before(at, Inst::restore(r, Slot::Scratch));
    }
}
