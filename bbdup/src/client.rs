//! The hooks through which a tool tells the engine how to specialise blocks.

use crate::{
    ir::{InstIdx, InstList},
    manager::BlockManager,
};
use std::any::Any;

/// Data a client computes while analysing a block and consumes while instrumenting it. Results
/// are dropped once the block has been instrumented.
pub type Analysis = Box<dyn Any + Send>;

/// The per-block policy returned by [Client::set_up_block].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockSetUp {
    pub default_encoding: u64,
    /// Should the block be duplicated at all? If not, it is instrumented once, for the default
    /// encoding, and no dispatcher is inserted.
    pub enable_dup: bool,
    /// May new cases be added to the block at runtime?
    pub enable_dynamic_handling: bool,
}

impl BlockSetUp {
    pub fn new(default_encoding: u64) -> Self {
        Self {
            default_encoding,
            enable_dup: true,
            enable_dynamic_handling: true,
        }
    }
}

pub trait Client: Send + Sync {
    /// Decide the policy for a block seen for the first time (or rebuilt other than through
    /// promotion).
    fn set_up_block(&self, tag: u64, ilist: &InstList) -> BlockSetUp;

    /// Register the block's initial non-default cases through [BlockManager::register_case].
    /// Only called for blocks with duplication enabled.
    fn register_cases(&self, _tag: u64, _ilist: &InstList, _manager: &mut BlockManager) {}

    /// Analyse the block once, whatever the number of variants.
    fn analyse_orig(&self, _tag: u64, _ilist: &InstList) -> Option<Analysis> {
        None
    }

    /// Analyse the block for the case `encoding`.
    fn analyse_case(
        &self,
        _tag: u64,
        _ilist: &InstList,
        _encoding: u64,
        _orig: Option<&Analysis>,
    ) -> Option<Analysis> {
        None
    }

    /// Instrument `instr`, inserting any code before `at`. `at` is usually `instr` itself, but
    /// differs for a block-terminating instruction shared by all variants: each variant is then
    /// given the chance to instrument it at the variant's own end.
    fn instrument_instr(
        &self,
        cx: &InstrumentCx<'_>,
        ilist: &mut InstList,
        instr: InstIdx,
        at: InstIdx,
    );

    /// A block is about to get a new case `new_encoding`. Return false to refuse. Setting
    /// `enable_dynamic_handling` to false stops the block from ever asking again.
    fn allow_gen(
        &self,
        _tag: u64,
        _ilist: Option<&InstList>,
        _new_encoding: u64,
        _enable_dynamic_handling: &mut bool,
    ) -> bool {
        true
    }
}

/// Inserts code computing the runtime case encoding of a block. The code must leave the encoding
/// in [crate::Engine::encoding_opnd] (or call [crate::Engine::set_encoding] from a clean call).
pub trait Encoder: Send + Sync {
    fn insert_encode(&self, ilist: &mut InstList, at: InstIdx, orig: Option<&Analysis>);
}

/// What a client knows while instrumenting one instruction of one variant.
pub struct InstrumentCx<'a> {
    pub(crate) tag: u64,
    pub(crate) encoding: u64,
    pub(crate) orig: Option<&'a Analysis>,
    pub(crate) case: Option<&'a Analysis>,
    pub(crate) first: Option<InstIdx>,
    pub(crate) first_nonlabel: Option<InstIdx>,
    pub(crate) last: Option<InstIdx>,
}

impl<'a> InstrumentCx<'a> {
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// The encoding of the case the current variant is specialised for.
    pub fn encoding(&self) -> u64 {
        self.encoding
    }

    pub fn orig_analysis(&self) -> Option<&'a Analysis> {
        self.orig
    }

    pub fn case_analysis(&self) -> Option<&'a Analysis> {
        self.case
    }

    /// Is `instr` the first instruction of the current variant?
    pub fn is_first_instr(&self, instr: InstIdx) -> bool {
        self.first == Some(instr)
    }

    /// Is `instr` the first non-label instruction of the current variant?
    pub fn is_first_nonlabel_instr(&self, instr: InstIdx) -> bool {
        self.first_nonlabel == Some(instr)
    }

    /// Is `instr` the last instruction of the current variant?
    pub fn is_last_instr(&self, instr: InstIdx) -> bool {
        self.last == Some(instr)
    }
}
