use crate::{Fixture, TAG, initial_context};
use bbdup::{
    Promotion,
    ir::{Inst, InstKind, InstList, Reg},
    testing::TestClient,
};

#[test]
fn threshold_gates_promotion() {
    let f = Fixture::new(TestClient::new(0).marking(), true, |o| {
        o.hit_threshold = 3;
        o.collect_stats = true;
    });
    f.set_dispatch(5);
    let mut t = f.thread();
    let mut promotions = Vec::new();
    for _ in 0..3 {
        let r = t.run(TAG, initial_context());
        promotions.push(r.promotions);
    }
    assert_eq!(promotions, vec![vec![], vec![], vec![Promotion::Generated]]);
    let s = f.engine.stats().unwrap();
    assert_eq!(s.bail_count, 2);
    assert_eq!(s.gen_count, 1);
    assert_eq!(f.host.flush_count(), 1);
    assert_eq!(f.client.gen_requests(), vec![(TAG, 5)]);

    // The fourth execution runs the new variant.
    let r = t.run(TAG, initial_context());
    assert!(r.promotions.is_empty());
    assert_eq!(r.marks, vec![5]);
    assert_eq!(f.engine.stats().unwrap().bail_count, 2);
    assert_eq!(f.host.flush_count(), 1);
}

#[test]
fn promotion_is_transparent_to_the_application() {
    let f = Fixture::new(TestClient::new(0).marking(), true, |o| o.dup_limit = 3);
    let mut t = f.thread();
    for v in [5, 6, 5, 7, 6, 7] {
        f.set_dispatch(v);
        let r = t.run(TAG, initial_context());
        // Whatever happens in the dispatcher, the block computes the same thing.
        assert_eq!(r.mc.reg(Reg::RBX), initial_context().reg(Reg::RAX));
        assert_eq!(r.mc.reg(Reg::RAX), initial_context().reg(Reg::RAX));
        assert_eq!(r.mc.xflags, initial_context().xflags);
        assert_eq!(r.marks, vec![v]);
    }
    let h = f.engine.manager_handle(t.tc(), TAG).unwrap();
    let cases = f.engine.with_manager(t.tc(), h, |m| {
        m.defined_cases().map(|c| c.encoding).collect::<Vec<_>>()
    });
    assert_eq!(cases, Some(vec![5, 6, 7]));
    assert_eq!(f.host.flush_count(), 3);
}

#[test]
fn full_blocks_keep_bailing() {
    let f = Fixture::new(TestClient::new(0).marking(), true, |o| {
        o.collect_stats = true;
    });
    let mut t = f.thread();
    f.set_dispatch(5);
    assert_eq!(t.run(TAG, initial_context()).promotions, vec![Promotion::Generated]);
    // The only slot is taken: other encodings fall back to the default variant for good.
    f.set_dispatch(6);
    for _ in 0..3 {
        let r = t.run(TAG, initial_context());
        assert!(r.promotions.is_empty());
        assert_eq!(r.marks, vec![0]);
    }
    assert_eq!(f.engine.stats().unwrap().bail_count, 3);
    assert_eq!(f.client.gen_requests().len(), 1);
}

#[test]
fn shared_tables_promote_too() {
    let f = Fixture::new(TestClient::new(0).marking(), false, |o| {
        o.hit_threshold = 2;
    });
    assert!(!f.engine.is_thread_private());
    f.set_dispatch(9);
    let mut t = f.thread();
    assert!(t.run(TAG, initial_context()).promotions.is_empty());
    assert_eq!(
        t.run(TAG, initial_context()).promotions,
        vec![Promotion::Generated]
    );
    assert_eq!(t.run(TAG, initial_context()).marks, vec![9]);
}

#[test]
fn terminator_only_blocks() {
    const RET: u64 = 0x6000;
    let f = Fixture::new(TestClient::new(0).with_cases(&[1]).marking(), true, |o| {
        o.dup_limit = 2;
        o.hit_threshold = 2;
    });
    f.host
        .add_block(RET, InstList::from_insts([Inst::app(InstKind::Ret, RET)]));
    let mut t = f.thread();
    let init = initial_context();
    let mut marks = Vec::new();
    let mut promotions = Vec::new();
    for v in [1, 0, 7, 7, 7] {
        f.set_dispatch(v);
        let r = t.run(RET, init);
        assert_eq!(r.mc.reg(Reg::RAX), init.reg(Reg::RAX));
        assert_eq!(r.mc.xflags, init.xflags);
        marks.push(r.marks);
        promotions.push(r.promotions);
    }
    assert_eq!(marks, vec![vec![1], vec![0], vec![0], vec![7], vec![7]]);
    assert_eq!(
        promotions,
        vec![vec![], vec![], vec![], vec![Promotion::Generated], vec![]]
    );
    assert_eq!(f.client.gen_requests(), vec![(RET, 7)]);
}
