//! Adding cases to blocks at runtime.
//!
//! A block with dynamic handling enabled moves through the following states:
//!
//! ```text
//!                 ┌──────────────────┐
//!                 │                  │ encoding matches a case
//!     ───────────▶│      Stable      │◀───────────┐
//!                 │                  │────────────┘
//!                 └──────────────────┘
//!                   │              ▲
//!    unmatched      │              │ block rebuilt with
//!    encoding       ▼              │ the extended case set
//!                 ┌──────────────────┐
//!                 │                  │ count > 0: bail
//!                 │    Candidate     │ to the default variant
//!                 │                  │◀───────────┐
//!                 └──────────────────┘────────────┘
//!                   │              ▲
//!    count reaches  │              │ already registered,
//!    zero           ▼              │ refused or limit reached
//!                 ┌──────────────────┐
//!                 │    Generating    │──────▶ flush and redirect
//!                 └──────────────────┘
//! ```
//!
//! The count lives in the thread's [crate::hitcount::HitTable] and is decremented inline by the
//! default variant. When it reaches zero the default variant jumps to an out-of-line stub which
//! calls [Engine::handle_new_case]. Whatever that decides, the thread resumes at the start of the
//! block.

use crate::{
    engine::{Engine, ThreadCtx},
    host::{flags, MachineContext},
    ir::{Callee, Inst, InstKind, InstList, Opnd, Reg, Slot},
    log::Verbosity,
};

/// What [Engine::handle_new_case] did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Promotion {
    /// The case was added and the block flushed.
    Generated,
    /// The case was already present (another thread added it first).
    AlreadyRegistered,
    /// The block has no room for another case.
    LimitReached,
    /// The client refused the case.
    Declined,
    /// The block no longer accepts new cases.
    DynamicHandlingDisabled,
    /// The block's manager has gone away.
    UnknownBlock,
}

/// Where, and in what state, a thread should resume after [Engine::handle_new_case].
#[derive(Clone, Copy, Debug)]
pub struct Redirect {
    pub mc: MachineContext,
    pub outcome: Promotion,
}

impl Engine {
    /// The address of the out-of-line stub that calls [Engine::handle_new_case], allocating it if
    /// necessary.
    pub(crate) fn stub_pc(&self) -> u64 {
        *self.stub_pc.get_or_init(|| {
            let stub = InstList::from_insts([Inst::meta(InstKind::CleanCall {
                callee: Callee::NewCase,
                arg: Opnd::Reg(Reg::RAX),
            })]);
            self.host.alloc_stub(&stub)
        })
    }

    /// Called from the promotion stub with the thread's context `mc`, in which the dispatcher's
    /// scratch register holds the block's tag. Decides whether the thread's runtime encoding
    /// becomes a new case of the block and returns the context to resume with: the start of the
    /// block, with the dispatcher's spills undone.
    pub fn handle_new_case(&self, tc: &mut ThreadCtx, mut mc: MachineContext) -> Redirect {
        // Blocks with dynamic handling never use the zero test, so the scratch register is rax.
        let tag = mc.reg(Reg::RAX);
        let new_encoding = tc.slot(Slot::Encoding);
        let decoded = self.host.decode_block(tag);

        let (outcome, do_flush, flags_dead, scratch_dead) = self.write_table(&mut tc.table, |t| {
            let Some(m) = t.get_mut(tag) else {
                // Restoring a dead value is harmless, so without a manager restore everything.
                return (Promotion::UnknownBlock, false, false, false);
            };
            debug_assert!(m.enable_dup);
            debug_assert_ne!(new_encoding, m.default_encoding());
            // Another thread may have switched dynamic handling off or added the case.
            let outcome = if !m.enable_dynamic_handling {
                Promotion::DynamicHandlingDisabled
            } else if m.is_included(new_encoding) {
                Promotion::AlreadyRegistered
            } else {
                let allow = self.client.allow_gen(
                    tag,
                    decoded.as_ref(),
                    new_encoding,
                    &mut m.enable_dynamic_handling,
                );
                if !m.enable_dynamic_handling {
                    self.stats.no_dynamic_handling();
                }
                if !allow {
                    Promotion::Declined
                } else if m.register_case(new_encoding).is_ok() {
                    self.stats.case_generated();
                    Promotion::Generated
                } else {
                    Promotion::LimitReached
                }
            };
            // A full block is rebuilt too: without a free slot its default variant has no trigger.
            let do_flush = match outcome {
                Promotion::Generated | Promotion::LimitReached => true,
                Promotion::Declined => !m.enable_dynamic_handling,
                _ => false,
            };
            if do_flush && !m.is_regenerating {
                m.is_regenerating = true;
                // The rebuilt copy, which may be built before the old one's deletion is reported.
                m.fragments += 1;
            }
            (outcome, do_flush, m.flags_dead, m.scratch_dead)
        });

        if !flags_dead {
            mc.xflags = flags::merge_arith(mc.xflags, tc.slot(Slot::Flags));
        }
        if !scratch_dead {
            mc.set_reg(Reg::RAX, tc.slot(Slot::Scratch));
        }
        mc.pc = self.host.entry_pc(tag);

        if self.hit_threshold > 0 {
            tc.hit_table.reset(tag);
        }
        if do_flush {
            self.host.flush(tag);
        }
        self.log.log_block(Verbosity::CaseEvent, tag, || {
            format!("case {new_encoding:#x}: {outcome:?}")
        });
        Redirect { mc, outcome }
    }
}
