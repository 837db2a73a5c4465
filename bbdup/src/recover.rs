//! Reconstructing the application's state when a thread is interrupted inside a dispatcher.
//!
//! Between the prologue's spills and a variant's landing restoration, the dispatcher's scratch
//! register and the arithmetic flags may hold values that aren't the application's: the real
//! values are in the engine's reserved slots. To find out which values are where at a given code
//! address we replay the unit's spills and restores in layout order, following the dispatcher's
//! forward branches so that a variant's `START` sees the state its incoming branch left behind.

use crate::{
    duplicate::is_variant_start,
    engine::{Engine, ThreadCtx},
    host::{flags, MachineContext},
    ir::{InstIdx, InstKind, InstList, Reg, Slot, Target},
    log::Verbosity,
};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum RecoverError {
    /// The host has no instruction list for the faulting unit. The caller should retry later.
    #[error("the faulting unit's instructions are not available")]
    NotMaterialized,
    /// The fault address isn't the address of any instruction in the unit.
    #[error("no instruction at {0:#x}")]
    PcNotFound(u64),
}

/// Where the application's scratch register and flags live at one point of a unit.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct SpillState {
    /// The dispatcher's scratch register, once a spill has revealed it.
    scratch: Option<Reg>,
    /// Does the scratch register hold the application's value?
    scratch_clobbered: bool,
    /// Does [Slot::Scratch] hold the application's value?
    scratch_spilled: bool,
    flags_clobbered: bool,
    flags_spilled: bool,
}

impl SpillState {
    fn step(&mut self, ilist: &InstList, idx: InstIdx) {
        let inst = ilist.inst(idx);
        let k = inst.kind();
        if inst.is_meta() {
            if let Some((slot, r)) = inst.as_spill() {
                match slot {
                    Slot::Scratch => {
                        self.scratch = Some(r);
                        self.scratch_spilled = true;
                    }
                    Slot::Flags => self.flags_spilled = true,
                    Slot::Encoding | Slot::HitTable => (),
                }
            } else if let Some((r, Slot::Scratch)) = inst.as_restore() {
                if self.scratch == Some(r) {
                    self.scratch_clobbered = false;
                }
            } else if self.scratch.is_some_and(|r| k.writes_reg(r)) {
                self.scratch_clobbered = true;
            }
            if matches!(k, InstKind::RestoreFlags(_)) {
                self.flags_clobbered = false;
            } else if k.writes_flags() {
                self.flags_clobbered = true;
            }
        } else {
            if self.scratch.is_some_and(|r| k.writes_reg(r)) {
                self.scratch_clobbered = false;
                self.scratch_spilled = false;
            }
            if k.writes_flags() {
                self.flags_clobbered = false;
                self.flags_spilled = false;
            }
        }
    }
}

impl Engine {
    /// `mc` was interrupted at `fault_pc`, inside the unit `ilist` encoded at `unit_start_pc`.
    /// Rewrite `mc` with the application's values of anything the dispatcher had spilled at that
    /// point. On success, returns the address of the start of the variant containing `fault_pc`
    /// (or `unit_start_pc` if the fault precedes all variants): code before it belongs to other
    /// variants and is irrelevant to the interrupted execution.
    ///
    /// The list is only read. If `ilist` is `None` or the fault can't be located, `mc` is left
    /// untouched.
    pub fn restore_state(
        &self,
        tc: &ThreadCtx,
        fault_pc: u64,
        unit_start_pc: u64,
        ilist: Option<&InstList>,
        mc: &mut MachineContext,
    ) -> Result<u64, RecoverError> {
        let ilist = ilist.ok_or(RecoverError::NotMaterialized)?;
        let enc = ilist.encode(unit_start_pc);
        let mut st = SpillState::default();
        // The state at each label some earlier branch targets.
        let mut pending: HashMap<InstIdx, SpillState> = HashMap::new();
        let mut region_start = unit_start_pc;
        let mut prev_is_jmp = false;
        let mut found = false;
        for (idx, inst) in ilist.iter() {
            if inst.is_label() {
                // A label nothing falls through to inherits the state of the branch to it.
                if prev_is_jmp {
                    if let Some(s) = pending.get(&idx) {
                        st = *s;
                    }
                }
                if is_variant_start(ilist, idx) {
                    region_start = enc.pc(idx).unwrap_or(region_start);
                }
                continue;
            }
            if enc.pc(idx) == Some(fault_pc) {
                found = true;
                break;
            }
            st.step(ilist, idx);
            if inst.is_meta() {
                if let Some(Target::Label(l)) = inst.kind().target() {
                    pending.entry(l).or_insert(st);
                }
            }
            prev_is_jmp = matches!(inst.kind(), InstKind::Jmp(_));
        }
        if !found {
            return Err(RecoverError::PcNotFound(fault_pc));
        }

        if let Some(r) = st.scratch {
            if st.scratch_clobbered && st.scratch_spilled {
                mc.set_reg(r, tc.slot(Slot::Scratch));
            }
        }
        if st.flags_clobbered && st.flags_spilled {
            mc.xflags = flags::merge_arith(mc.xflags, tc.slot(Slot::Flags));
        }
        self.log.log(Verbosity::BlockEvent, || {
            format!("fault at {fault_pc:#x}: state restored, variant starts at {region_start:#x}")
        });
        Ok(region_start)
    }
}
