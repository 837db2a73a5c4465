use crate::{DISPATCH, Fixture, TAG, block, initial_context};
use bbdup::{
    EncodingSource,
    ir::{Note, Reg},
    testing::{MemEncoder, TestClient},
};
use fm::FMBuilder;
use regex::Regex;
use std::sync::Arc;

fn assert_matches(text: &str, ptn: &str) {
    let fmm = FMBuilder::new(ptn)
        .unwrap()
        .name_matcher(
            Regex::new(r"\{\{.+?\}\}").unwrap(),
            Regex::new(r"[a-zA-Z0-9\._]+").unwrap(),
        )
        .build()
        .unwrap();
    if let Err(e) = fmm.matches(text) {
        panic!("{e}");
    }
}

#[test]
fn no_dup_leaves_control_flow_alone() {
    let f = Fixture::new(TestClient::new(3).without_dup(), true, |o| {
        o.collect_stats = true
    });
    let mut t = f.thread();
    let b = t.block(TAG);
    assert_eq!(b.ilist.len(), block(TAG).len());
    assert!(b.ilist.iter().all(|(_, i)| !i.is_label() && i.is_app()));
    assert_matches(
        &b.ilist.to_string(),
        "
          app mov rbx, rax
          app ret
        ",
    );
    // Each instruction is instrumented exactly once, for the default case.
    let ins = f.client.instrumented();
    assert_eq!(ins.len(), 2);
    assert!(ins.iter().all(|i| i.encoding == 3 && i.tag == TAG));
    assert_eq!(
        ins.iter().map(|i| i.app_pc).collect::<Vec<_>>(),
        vec![Some(TAG), Some(TAG + 8)]
    );
    let s = f.engine.stats().unwrap();
    assert_eq!(s.no_dup_count, 1);
    assert_eq!(s.no_dynamic_handling_count, 1);

    f.set_dispatch(9);
    let r = t.run(TAG, initial_context());
    assert_eq!(r.mc.reg(Reg::RBX), initial_context().reg(Reg::RAX));
}

#[test]
fn dispatch_on_zero_or_one() {
    let f = Fixture::new(
        TestClient::new(0)
            .with_cases(&[1])
            .without_dynamic_handling()
            .marking(),
        true,
        |_| (),
    );
    let mut t = f.thread();
    for (v, expected) in [(1, 1), (0, 0), (2, 0), (u64::MAX, 0), (1, 1)] {
        f.set_dispatch(v);
        let r = t.run(TAG, initial_context());
        assert_eq!(r.marks, vec![expected], "dispatch value {v}");
        let init = initial_context();
        assert_eq!(r.mc.reg(Reg::RAX), init.reg(Reg::RAX));
        assert_eq!(r.mc.reg(Reg::RBX), init.reg(Reg::RAX));
        assert_eq!(r.mc.xflags, init.xflags);
    }
}

#[test]
fn zero_test_dispatch_executes() {
    let f = Fixture::new(
        TestClient::new(1)
            .with_cases(&[0])
            .without_dynamic_handling()
            .marking(),
        true,
        |o| o.max_case_encoding = 1,
    );
    let mut t = f.thread();
    let b = t.block(TAG);
    assert!(
        b.ilist
            .iter()
            .all(|(_, i)| !matches!(i.kind(), bbdup::ir::InstKind::Cmp { .. }))
    );
    for v in [0, 1, 0] {
        f.set_dispatch(v);
        let r = t.run(TAG, initial_context());
        assert_eq!(r.marks, vec![v]);
        // rcx was the scratch register and the flags were never touched.
        assert_eq!(r.mc.reg(Reg::RCX), initial_context().reg(Reg::RCX));
        assert_eq!(r.mc.xflags, initial_context().xflags);
    }
}

#[test]
fn callback_encoding() {
    let f = Fixture::new(
        TestClient::new(0)
            .with_cases(&[0x1_0000_0000, 2])
            .without_dynamic_handling()
            .marking(),
        true,
        |o| {
            o.encoding = Some(EncodingSource::Callback(Arc::new(MemEncoder(DISPATCH))));
            o.dup_limit = 2;
        },
    );
    let mut t = f.thread();
    for v in [2, 0x1_0000_0000, 7] {
        f.set_dispatch(v);
        let r = t.run(TAG, initial_context());
        assert_eq!(r.marks, vec![if v == 7 { 0 } else { v }]);
        assert_eq!(r.mc.reg(Reg::RAX), initial_context().reg(Reg::RAX));
        assert_eq!(r.mc.xflags, initial_context().xflags);
    }
}

#[test]
fn variants_see_their_own_analyses() {
    let f = Fixture::new(
        TestClient::new(0).with_cases(&[4, 5]).without_dynamic_handling(),
        true,
        |o| o.dup_limit = 2,
    );
    let mut t = f.thread();
    let b = t.block(TAG);
    assert_eq!(
        b.ilist
            .iter()
            .filter(|(_, i)| i.is_label_with(Note::Start))
            .count(),
        3
    );
    let ins = f.client.instrumented();
    // The body instruction once per variant, the shared `ret` once per variant.
    assert_eq!(ins.len(), 6);
    assert!(ins.iter().all(|i| i.analysed_for == Some(i.encoding)));
    let mut encs = ins.iter().map(|i| i.encoding).collect::<Vec<_>>();
    encs.dedup();
    assert_eq!(encs, vec![4, 5, 0]);
}
