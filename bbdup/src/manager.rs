//! Per-block case bookkeeping.
//!
//! A [BlockManager] records which cases a block has been (or will be) specialised for. It is
//! created the first time the engine sees a block's tag, handed to the client so it can register
//! the block's initial cases, and extended at runtime by promotion.

use crate::ir::Reg;
use thiserror::Error;

/// A runtime condition a block variant is specialised for.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Case {
    pub encoding: u64,
    pub is_defined: bool,
}

/// Why [BlockManager::register_case] refused a case.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum RegisterError {
    /// The encoding (possibly the default encoding) is already present.
    #[error("case {0:#x} is already registered")]
    AlreadyRegistered(u64),
    /// Every non-default slot is in use.
    #[error("cannot register case {0:#x}: case limit reached")]
    LimitReached(u64),
}

/// The duplication policy of a single block.
#[derive(Clone, Debug)]
pub struct BlockManager {
    pub(crate) default_case: Case,
    /// Non-default cases. The length of the slice is the engine's non-default case limit; defined
    /// cases are packed at the front in registration order.
    pub(crate) cases: Box<[Case]>,
    pub(crate) enable_dup: bool,
    pub(crate) enable_dynamic_handling: bool,
    /// The register the dispatcher may clobber.
    pub(crate) scratch_reg: Reg,
    pub(crate) flags_dead: bool,
    pub(crate) scratch_dead: bool,
    /// Is a flush requested by promotion in flight for this block?
    pub(crate) is_regenerating: bool,
    /// How many cached copies of the block refer to this manager, counting one that a flush in
    /// flight will rebuild. The manager is dropped when the last is deleted.
    pub(crate) fragments: u32,
}

impl BlockManager {
    pub(crate) fn new(limit: u16, default_encoding: u64) -> Self {
        Self {
            default_case: Case {
                encoding: default_encoding,
                is_defined: true,
            },
            cases: vec![Case::default(); usize::from(limit)].into_boxed_slice(),
            enable_dup: true,
            enable_dynamic_handling: true,
            scratch_reg: Reg::RAX,
            flags_dead: false,
            scratch_dead: false,
            is_regenerating: false,
            fragments: 1,
        }
    }

    /// Register `encoding` as a case of this block.
    pub fn register_case(&mut self, encoding: u64) -> Result<(), RegisterError> {
        if self.is_included(encoding) {
            return Err(RegisterError::AlreadyRegistered(encoding));
        }
        match self.cases.iter_mut().find(|c| !c.is_defined) {
            Some(c) => {
                *c = Case {
                    encoding,
                    is_defined: true,
                };
                Ok(())
            }
            None => Err(RegisterError::LimitReached(encoding)),
        }
    }

    /// Is `encoding` either the default encoding or that of a registered case?
    pub fn is_included(&self, encoding: u64) -> bool {
        self.default_case.encoding == encoding
            || self.defined_cases().any(|c| c.encoding == encoding)
    }

    pub fn default_encoding(&self) -> u64 {
        self.default_case.encoding
    }

    /// The registered non-default cases in registration order.
    pub fn defined_cases(&self) -> impl Iterator<Item = &Case> + '_ {
        self.cases.iter().take_while(|c| c.is_defined)
    }

    /// How many non-default cases are registered?
    pub fn case_count(&self) -> usize {
        self.defined_cases().count()
    }

    pub(crate) fn has_free_slot(&self) -> bool {
        self.cases.iter().any(|c| !c.is_defined)
    }

    pub fn is_dup_enabled(&self) -> bool {
        self.enable_dup
    }

    pub fn is_dynamic_handling_enabled(&self) -> bool {
        self.enable_dynamic_handling
    }

    pub fn is_regenerating(&self) -> bool {
        self.is_regenerating
    }

    /// How many variants a block built from this manager has: one per non-default case plus the
    /// default variant. Blocks that aren't duplicated have a single variant.
    pub(crate) fn variant_count(&self) -> usize {
        if self.enable_dup {
            self.case_count() + 1
        } else {
            1
        }
    }

    /// The encoding of variant `i`, where the last variant is the default.
    pub(crate) fn variant_encoding(&self, i: usize) -> u64 {
        if self.enable_dup && i < self.case_count() {
            self.cases[i].encoding
        } else {
            self.default_case.encoding
        }
    }
}
