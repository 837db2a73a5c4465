//! The engine and its per-thread state.
//!
//! A host drives the engine through three phases for every block it builds, in order:
//!
//!  1. [Engine::duplicate_phase] finds (or creates) the block's [BlockManager] and turns the block
//!     into a chain of variants, one per case.
//!  2. [Engine::analyse_phase] runs the client's analyses, once for the whole block and once per
//!     case.
//!  3. [Engine::insert_phase] instruments every variant for its case and threads the dispatcher
//!     through the chain.
//!
//! [Engine::instrument_block] runs all three.

use crate::{
    client::{Analysis, Client, Encoder},
    duplicate::{duplicate, extract_variant, next_start},
    hitcount::HitTable,
    host::Host,
    ir::{InstList, OpSize, Opnd, Slot},
    log::{
        stats::{Stats, StatsSnapshot},
        Log, LogError, Verbosity,
    },
    manager::BlockManager,
    table::{ManagerHandle, ManagerTable},
};
use parking_lot::RwLock;
use std::sync::{Arc, OnceLock};
use strum::EnumCount;
use thiserror::Error;

/// Where the runtime case encoding of a block comes from.
#[derive(Clone)]
pub enum EncodingSource {
    /// Client-inserted code computes the encoding.
    Callback(Arc<dyn Encoder>),
    /// The encoding is loaded from a pointer-sized memory location. If `atomic` is true the load
    /// has acquire semantics, so a store of the dispatch variable by another thread is observed
    /// in order with the stores preceding it.
    Memory { opnd: Opnd, atomic: bool },
}

/// Engine configuration.
#[derive(Clone)]
pub struct Options {
    pub client: Arc<dyn Client>,
    pub encoding: Option<EncodingSource>,
    /// How many non-default cases a block may have.
    pub dup_limit: u16,
    /// How many unmatched executions of a block it takes before a case is added to it. Zero
    /// means "on the first one".
    pub hit_threshold: u16,
    /// If non-zero, the largest encoding the dispatch variable will ever hold.
    pub max_case_encoding: u64,
    pub collect_stats: bool,
}

impl Options {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self {
            client,
            encoding: None,
            dup_limit: 1,
            hit_threshold: 0,
            max_case_encoding: 0,
            collect_stats: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no way of computing the runtime case encoding was given")]
    MissingEncoder,
    #[error("the dispatch operand {0} is not a pointer-sized memory location")]
    InvalidOperand(Opnd),
    #[error("the non-default case limit must be at least 1")]
    ZeroCaseLimit,
    #[error(transparent)]
    Log(#[from] LogError),
}

/// Why a block is being built.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BuildFlags {
    /// The block is being built as part of a trace.
    pub for_trace: bool,
    /// The block is being rebuilt to translate a machine state within it (e.g. after a fault).
    pub translating: bool,
}

pub struct Engine {
    pub(crate) host: Arc<dyn Host>,
    pub(crate) client: Arc<dyn Client>,
    pub(crate) encoding: EncodingSource,
    pub(crate) dup_limit: u16,
    pub(crate) hit_threshold: u16,
    pub(crate) max_case_encoding: u64,
    /// The process-wide manager table. `None` if tables are thread-private.
    pub(crate) shared: Option<RwLock<ManagerTable>>,
    /// The address of the out-of-line promotion stub, allocated on first use.
    pub(crate) stub_pc: OnceLock<u64>,
    pub(crate) log: Log,
    pub(crate) stats: Stats,
}

/// The engine's state for one thread. Obtained from [Engine::thread_init] and handed back to every
/// engine call the thread makes.
pub struct ThreadCtx {
    /// The engine's reserved thread-local storage, indexed by [Slot].
    pub(crate) slots: [u64; Slot::COUNT],
    pub(crate) hit_table: HitTable,
    /// This thread's managers. Only used if tables are thread-private.
    pub(crate) table: ManagerTable,
    /// The block currently being built.
    pub(crate) build: Option<Build>,
}

/// What a thread remembers between the phases of a block build.
pub(crate) struct Build {
    pub(crate) tag: u64,
    /// The manager as it was when the block was duplicated.
    pub(crate) manager: BlockManager,
    pub(crate) orig: Option<Analysis>,
    /// Per-variant analyses. The last is the default case's.
    pub(crate) cases: Vec<Option<Analysis>>,
}

impl ThreadCtx {
    fn new(hit_threshold: u16) -> Self {
        let mut tc = Self {
            slots: [0; Slot::COUNT],
            hit_table: HitTable::new(hit_threshold),
            table: ManagerTable::new(),
            build: None,
        };
        tc.slots[Slot::HitTable.idx()] = tc.hit_table.addr();
        tc
    }

    /// Read one of the engine's reserved storage slots.
    pub fn slot(&self, s: Slot) -> u64 {
        self.slots[s.idx()]
    }

    pub fn set_slot(&mut self, s: Slot, v: u64) {
        self.slots[s.idx()] = v;
    }

    pub fn hit_table(&self) -> &HitTable {
        &self.hit_table
    }

    pub fn hit_table_mut(&mut self) -> &mut HitTable {
        &mut self.hit_table
    }
}

impl Engine {
    pub fn new(host: Arc<dyn Host>, opts: Options) -> Result<Arc<Self>, ConfigError> {
        let encoding = match opts.encoding {
            None => return Err(ConfigError::MissingEncoder),
            Some(EncodingSource::Memory { opnd, .. })
                if !matches!(opnd, Opnd::Mem { size, .. } if size == OpSize::PTR) =>
            {
                return Err(ConfigError::InvalidOperand(opnd));
            }
            Some(x) => x,
        };
        if opts.dup_limit == 0 {
            return Err(ConfigError::ZeroCaseLimit);
        }
        let log = Log::from_env()?;
        let shared = if host.thread_private_caches() {
            None
        } else {
            Some(RwLock::new(ManagerTable::new()))
        };
        Ok(Arc::new(Self {
            host,
            client: opts.client,
            encoding,
            dup_limit: opts.dup_limit,
            hit_threshold: opts.hit_threshold,
            max_case_encoding: opts.max_case_encoding,
            shared,
            stub_pc: OnceLock::new(),
            log,
            stats: Stats::new(opts.collect_stats),
        }))
    }

    /// Shut the engine down, writing out statistics if requested.
    pub fn exit(&self) {
        self.stats.output();
        if let Some(lk) = &self.shared {
            *lk.write() = ManagerTable::new();
        }
    }

    pub fn thread_init(&self) -> ThreadCtx {
        ThreadCtx::new(self.hit_threshold)
    }

    pub fn thread_exit(&self, tc: ThreadCtx) {
        if tc.table.len() > 0 {
            self.log.log(Verbosity::BlockEvent, || {
                format!("thread exiting with {} block managers", tc.table.len())
            });
        }
    }

    /// Are manager tables kept per thread?
    pub fn is_thread_private(&self) -> bool {
        self.shared.is_none()
    }

    pub(crate) fn read_table<R, F>(&self, private: &ManagerTable, f: F) -> R
    where
        F: FnOnce(&ManagerTable) -> R,
    {
        match &self.shared {
            Some(lk) => f(&lk.read()),
            None => f(private),
        }
    }

    pub(crate) fn write_table<R, F>(&self, private: &mut ManagerTable, f: F) -> R
    where
        F: FnOnce(&mut ManagerTable) -> R,
    {
        match &self.shared {
            Some(lk) => f(&mut lk.write()),
            None => f(private),
        }
    }

    /// The operand client encoding code must write the runtime case encoding to.
    pub fn encoding_opnd() -> Opnd {
        Opnd::Slot(Slot::Encoding)
    }

    /// Set the runtime case encoding of the current thread. For use from clean calls inserted by
    /// an [Encoder].
    pub fn set_encoding(&self, tc: &mut ThreadCtx, encoding: u64) {
        tc.set_slot(Slot::Encoding, encoding);
    }

    /// A copy of the statistics, if they are being collected.
    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.stats.snapshot()
    }

    /// Block until `test` holds for the statistics.
    #[cfg(feature = "bbdup_testing")]
    pub fn wait_until_stats<F>(&self, test: F)
    where
        F: Fn(&StatsSnapshot) -> bool,
    {
        self.stats.wait_until(test)
    }

    /// Target of [crate::ir::Callee::BailCount] clean calls.
    pub fn record_bail(&self) {
        self.stats.bail();
    }

    pub fn manager_handle(&self, tc: &ThreadCtx, tag: u64) -> Option<ManagerHandle> {
        self.read_table(&tc.table, |t| t.handle(tag))
    }

    /// Run `f` on the manager `h` refers to, if it still exists.
    pub fn with_manager<R, F>(&self, tc: &ThreadCtx, h: ManagerHandle, f: F) -> Option<R>
    where
        F: FnOnce(&BlockManager) -> R,
    {
        self.read_table(&tc.table, |t| t.resolve(h).map(f))
    }

    /// Run all the phases over a block.
    pub fn instrument_block(
        &self,
        tc: &mut ThreadCtx,
        tag: u64,
        ilist: &mut InstList,
        flags: BuildFlags,
    ) {
        self.duplicate_phase(tc, tag, ilist, flags);
        self.analyse_phase(tc, ilist);
        self.insert_phase(tc, ilist);
    }

    fn new_manager(&self, tag: u64, ilist: &InstList) -> BlockManager {
        let su = self.client.set_up_block(tag, ilist);
        let mut m = BlockManager::new(self.dup_limit, su.default_encoding);
        m.enable_dup = su.enable_dup;
        m.enable_dynamic_handling = su.enable_dup && su.enable_dynamic_handling;
        if m.enable_dup {
            self.client.register_cases(tag, ilist, &mut m);
        } else {
            m.cases = Box::new([]);
            self.stats.no_dup();
        }
        // A block that isn't duplicated can't gain cases either, whatever the client asked for.
        if !m.enable_dynamic_handling {
            self.stats.no_dynamic_handling();
        }
        m
    }

    /// Find or create the manager for `tag` and duplicate `ilist` accordingly.
    pub fn duplicate_phase(
        &self,
        tc: &mut ThreadCtx,
        tag: u64,
        ilist: &mut InstList,
        flags: BuildFlags,
    ) {
        tc.build = None;
        let Some(first) = ilist.first() else {
            return;
        };
        let manager = self.write_table(&mut tc.table, |t| {
            let m = t.fetch_or_replace(
                tag,
                |m| {
                    if m.is_regenerating {
                        // Promotion already counted the rebuilt copy.
                        if !flags.translating {
                            m.is_regenerating = false;
                        }
                        true
                    } else if flags.translating {
                        // Nothing new gets cached.
                        true
                    } else if flags.for_trace {
                        m.fragments += 1;
                        true
                    } else {
                        false
                    }
                },
                || self.new_manager(tag, ilist),
            );
            if m.enable_dup {
                self.choose_dispatch(m, ilist, first);
            }
            m.clone()
        });

        if manager.enable_dup {
            duplicate(ilist, manager.variant_count());
        }
        self.log.log_block(Verbosity::BlockEvent, tag, || {
            format!(
                "{} variant(s), default case {:#x}",
                manager.variant_count(),
                manager.default_encoding()
            )
        });
        tc.build = Some(Build {
            tag,
            manager,
            orig: None,
            cases: Vec::new(),
        });
    }

    /// Run the client's analyses over the block being built.
    pub fn analyse_phase(&self, tc: &mut ThreadCtx, ilist: &InstList) {
        let Some(b) = tc.build.as_mut() else {
            return;
        };
        let m = &b.manager;
        // The variants are identical at this point, so the first stands for all of them.
        let first_variant;
        let view = match next_start(ilist, ilist.first()) {
            Some(start) if m.enable_dup => {
                first_variant = extract_variant(ilist, start);
                &first_variant
            }
            _ => ilist,
        };
        b.orig = self.client.analyse_orig(b.tag, view);
        b.cases = (0..m.variant_count())
            .map(|i| {
                self.client
                    .analyse_case(b.tag, view, m.variant_encoding(i), b.orig.as_ref())
            })
            .collect();
    }

    /// The host deleted the code of block `tag`.
    pub fn on_block_deleted(&self, tc: &mut ThreadCtx, tag: u64) {
        self.write_table(&mut tc.table, |t| {
            let Some(m) = t.get_mut(tag) else {
                return;
            };
            debug_assert!(m.fragments > 0);
            m.fragments = m.fragments.saturating_sub(1);
            if m.fragments == 0 {
                t.remove(tag);
            }
        });
    }
}
