use crate::{DISPATCH, Fixture, TAG, initial_context};
use bbdup::{
    EncodingSource, MachineContext, RecoverError,
    host::flags,
    ir::{Opnd, Reg},
    testing::{MemEncoder, SimThread, TestClient},
};
use std::sync::Arc;

fn two_cases(thread_private: bool) -> Fixture {
    Fixture::new(
        TestClient::new(0)
            .with_cases(&[1, 2])
            .without_dynamic_handling(),
        thread_private,
        |o| o.dup_limit = 2,
    )
}

/// Simulate a fault at `pc`, recover, and check the application's state is intact.
fn fault_and_recover(f: &Fixture, t: &mut SimThread, encoding: u64, pc: u64) -> u64 {
    f.set_dispatch(encoding);
    let Some(mut mc) = t.run_until(TAG, initial_context(), pc) else {
        panic!("{pc:#x} not reached with encoding {encoding}");
    };
    let b = t.block(TAG);
    let region = f
        .engine
        .restore_state(t.tc(), pc, b.enc.start_pc(), Some(&b.ilist), &mut mc)
        .unwrap();
    let init = initial_context();
    assert_eq!(mc.regs, init.regs);
    assert_eq!(mc.xflags & flags::ARITH, init.xflags & flags::ARITH);
    region
}

#[test]
fn fault_at_each_variant() {
    for thread_private in [true, false] {
        let f = two_cases(thread_private);
        let mut t = f.thread();
        let starts = t.variant_entry_pcs(TAG);
        assert_eq!(starts.len(), 3);
        for (&enc, &start) in [1, 2, 0].iter().zip(&starts) {
            assert_eq!(fault_and_recover(&f, &mut t, enc, start), start);
        }
    }
}

#[test]
fn fault_in_each_variant_body() {
    let f = two_cases(true);
    let mut t = f.thread();
    let starts = t.variant_entry_pcs(TAG);
    let b = t.block(TAG);
    // The copies of the block's first instruction, one per variant.
    let bodies = b
        .ilist
        .iter()
        .filter(|(_, i)| i.app_pc() == Some(TAG))
        .filter_map(|(idx, _)| b.enc.pc(idx))
        .collect::<Vec<_>>();
    assert_eq!(bodies.len(), 3);
    for ((&enc, &body), &start) in [1, 2, 0].iter().zip(&bodies).zip(&starts) {
        assert_eq!(fault_and_recover(&f, &mut t, enc, body), start);
    }
}

#[test]
fn fault_anywhere_with_dynamic_handling() {
    for callback in [false, true] {
        let f = Fixture::new(TestClient::new(0).with_cases(&[1, 2]), true, |o| {
            o.hit_threshold = 100;
            o.dup_limit = 3;
            if callback {
                o.encoding = Some(EncodingSource::Callback(Arc::new(MemEncoder(DISPATCH))));
            }
        });
        let mut t = f.thread();
        let b = t.block(TAG);
        let pcs = b
            .ilist
            .iter()
            .filter(|(_, i)| !i.is_label())
            .filter_map(|(idx, _)| b.enc.pc(idx))
            .collect::<Vec<_>>();
        let init = initial_context();
        for enc in [1, 2, 0, 7] {
            f.set_dispatch(enc);
            let mut reached = 0;
            for &pc in &pcs {
                let Some(mut mc) = t.run_until(TAG, init, pc) else {
                    continue;
                };
                reached += 1;
                f.engine
                    .restore_state(t.tc(), pc, b.enc.start_pc(), Some(&b.ilist), &mut mc)
                    .unwrap();
                assert_eq!(mc.reg(Reg::RAX), init.reg(Reg::RAX), "rax at {pc:#x}, case {enc}");
                assert_eq!(mc.reg(Reg::RCX), init.reg(Reg::RCX), "rcx at {pc:#x}, case {enc}");
                assert_eq!(
                    mc.xflags & flags::ARITH,
                    init.xflags & flags::ARITH,
                    "flags at {pc:#x}, case {enc}"
                );
            }
            assert!(reached > 0);
        }
        // The sweep never reached the promotion threshold, so the block is the one swept.
        assert!(f.client.gen_requests().is_empty());
        assert!(Arc::ptr_eq(&b, &t.block(TAG)));
    }
}

#[test]
fn unmaterialised_units_are_retried() {
    let f = two_cases(true);
    let t = f.thread();
    let mut mc = initial_context();
    mc.set_reg(Reg::RAX, 1);
    let before: MachineContext = mc;
    assert_eq!(
        f.engine.restore_state(t.tc(), TAG, TAG, None, &mut mc),
        Err(RecoverError::NotMaterialized)
    );
    assert_eq!(mc, before);
}
