//! Turning one block into a chain of variants.
//!
//! Given the block:
//!
//! ```text
//!   mov rbx, rcx
//!   mov rsi, rax
//!   ret
//! ```
//!
//! and two variants, [duplicate] produces:
//!
//! ```text
//! START
//!   mov rbx, rcx
//!   mov rsi, rax
//!   jmp EXIT
//! START
//!   mov rbx, rcx
//!   mov rsi, rax
//! EXIT
//!   ret
//! ```
//!
//! A block-terminating instruction (a control transfer, a syscall, an interrupt) must remain the
//! last instruction of the unit, so it is not copied: it appears once, after `EXIT`, and is
//! shared by every variant. The last variant is always the default case's. Dispatch code is
//! threaded through the chain later, by the insertion phase.

use crate::ir::{Inst, InstIdx, InstKind, InstList, Note, Target};

/// Is `inst` an application instruction that has to stay last in its unit?
pub(crate) fn is_special(inst: &Inst) -> bool {
    inst.is_app() && inst.kind().is_block_terminator()
}

/// If the last application instruction of `ilist` has to stay last, return it.
pub(crate) fn special_last(ilist: &InstList) -> Option<InstIdx> {
    ilist.last_app().filter(|&i| is_special(ilist.inst(i)))
}

pub(crate) fn is_variant_start(ilist: &InstList, idx: InstIdx) -> bool {
    ilist.inst(idx).is_label_with(Note::Start)
}

/// Does `idx` end a variant? Variants end at `EXIT` or at the jump to it.
pub(crate) fn is_variant_end(ilist: &InstList, idx: InstIdx) -> bool {
    let inst = ilist.inst(idx);
    if inst.is_label_with(Note::Exit) {
        return true;
    }
    match inst.kind() {
        InstKind::Jmp(Target::Label(t)) if inst.is_meta() => {
            ilist.inst(*t).is_label_with(Note::Exit)
        }
        _ => false,
    }
}

/// The first variant start at or after `from`.
pub(crate) fn next_start(ilist: &InstList, from: Option<InstIdx>) -> Option<InstIdx> {
    let mut cur = from;
    while let Some(idx) = cur {
        if is_variant_start(ilist, idx) {
            return Some(idx);
        }
        cur = ilist.next(idx);
    }
    None
}

/// The first variant end at or after `from`.
pub(crate) fn next_end(ilist: &InstList, from: Option<InstIdx>) -> Option<InstIdx> {
    let mut cur = from;
    while let Some(idx) = cur {
        if is_variant_end(ilist, idx) {
            return Some(idx);
        }
        cur = ilist.next(idx);
    }
    None
}

/// Rewrite `ilist` into a chain of `variants` copies of itself.
pub(crate) fn duplicate(ilist: &mut InstList, variants: usize) {
    debug_assert!(variants >= 1);
    let mut body = ilist.clone();
    if let Some(last) = special_last(&body) {
        body.remove(last);
    }
    // A rest-of-block emulation range would otherwise run on into the next variant.
    let rest_of_block = body
        .iter()
        .any(|(_, i)| i.is_label_with(Note::EmulateStart { rest_of_block: true }));

    let exit = match special_last(ilist) {
        Some(last) => ilist.insert_before(last, Inst::label(Some(Note::Exit))),
        None => ilist.append(Inst::label(Some(Note::Exit))),
    };
    ilist.prepend(Inst::label(Some(Note::Start)));
    for _ in 1..variants {
        ilist.prepend(Inst::meta(InstKind::Jmp(Target::Label(exit))));
        if rest_of_block {
            ilist.prepend(Inst::label(Some(Note::EmulateEnd)));
        }
        let first = ilist.first();
        ilist.splice_copy(first, &body);
        ilist.prepend(Inst::label(Some(Note::Start)));
    }
}

/// Copy the variant beginning at `start` into a list of its own, as the analysis callbacks see
/// it: the shared block-terminating instruction, if any, is appended.
pub(crate) fn extract_variant(ilist: &InstList, start: InstIdx) -> InstList {
    debug_assert!(is_variant_start(ilist, start));
    let mut out = ilist.extract(ilist.next(start), |idx, _| is_variant_end(ilist, idx));
    if let Some(last) = ilist.last() {
        if is_special(ilist.inst(last)) {
            out.append(ilist.inst(last).clone());
        }
    }
    out
}
