//! What the engine needs from the runtime it is embedded in.

use crate::ir::{InstIdx, InstList, Liveness, Reg};
use strum::EnumCount;

/// The services a code-cache runtime provides to the engine.
pub trait Host: Send + Sync {
    /// Does every thread have its own code cache? This fixes, for the lifetime of an engine,
    /// whether block managers are kept per thread or in a single locked table.
    fn thread_private_caches(&self) -> bool;

    /// Is `what` dead immediately before `at`?
    fn is_dead(&self, ilist: &InstList, at: InstIdx, what: Liveness) -> bool {
        ilist.is_dead(at, what)
    }

    /// Insert, before `at`, code restoring every register that client instrumentation has
    /// spilled. Called at the end of each variant and after the encoding callback.
    fn restore_user_spills(&self, _ilist: &mut InstList, _at: InstIdx) {}

    /// Evict the cached code for `tag`. The host must later report the deletion through
    /// [crate::Engine::on_block_deleted].
    fn flush(&self, tag: u64);

    /// The application address execution should resume at to re-enter the block `tag`.
    fn entry_pc(&self, tag: u64) -> u64;

    /// Decode the application code of block `tag` afresh, if possible.
    fn decode_block(&self, tag: u64) -> Option<InstList>;

    /// Place `stub` somewhere executable and return its address.
    fn alloc_stub(&self, stub: &InstList) -> u64;
}

/// The register state of a suspended thread.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MachineContext {
    pub regs: [u64; Reg::COUNT],
    pub xflags: u64,
    pub pc: u64,
}

impl MachineContext {
    pub fn reg(&self, r: Reg) -> u64 {
        self.regs[r.idx()]
    }

    pub fn set_reg(&mut self, r: Reg, v: u64) {
        self.regs[r.idx()] = v;
    }
}

/// Bits of `xflags` holding the arithmetic flags.
pub mod flags {
    pub const CF: u64 = 1 << 0;
    pub const PF: u64 = 1 << 2;
    pub const AF: u64 = 1 << 4;
    pub const ZF: u64 = 1 << 6;
    pub const SF: u64 = 1 << 7;
    pub const OF: u64 = 1 << 11;
    pub const ARITH: u64 = CF | PF | AF | ZF | SF | OF;

    /// Replace the arithmetic flags of `xflags` with those of `saved`.
    pub fn merge_arith(xflags: u64, saved: u64) -> u64 {
        (xflags & !ARITH) | (saved & ARITH)
    }
}
