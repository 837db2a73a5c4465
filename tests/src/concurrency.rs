use crate::{Fixture, TAG, initial_context};
use bbdup::{Promotion, ir::Reg, testing::TestClient};
use std::{
    sync::{Arc, Barrier},
    thread,
};

#[test]
fn racing_threads_generate_one_variant() {
    let f = Fixture::new(TestClient::new(0).marking(), false, |_| ());
    f.set_dispatch(5);
    let barrier = Barrier::new(2);
    let results = thread::scope(|s| {
        let mut hs = Vec::new();
        for _ in 0..2 {
            let (f, barrier) = (&f, &barrier);
            hs.push(s.spawn(move || {
                let mut t = f.thread();
                t.block(TAG);
                let mut mc = initial_context();
                mc.set_reg(Reg::RAX, TAG);
                let e = Arc::clone(t.engine());
                e.set_encoding(t.tc_mut(), 5);
                // Both threads have reached the promotion stub before either asks for a case.
                barrier.wait();
                let r = t.handle_new_case(mc);
                barrier.wait();
                (r.outcome, t.run(TAG, initial_context()).marks)
            }));
        }
        hs.into_iter()
            .map(|h| match h.join() {
                Ok(r) => r,
                Err(e) => std::panic::resume_unwind(e),
            })
            .collect::<Vec<_>>()
    });

    let generated = results
        .iter()
        .filter(|(o, _)| *o == Promotion::Generated)
        .count();
    let registered = results
        .iter()
        .filter(|(o, _)| *o == Promotion::AlreadyRegistered)
        .count();
    assert_eq!((generated, registered), (1, 1));
    assert!(results.iter().all(|(_, marks)| *marks == vec![5]));
    assert_eq!(f.host.flush_count(), 1);
    assert_eq!(f.client.gen_requests(), vec![(TAG, 5)]);
}

#[test]
fn private_tables_are_independent() {
    let f = Fixture::new(TestClient::new(0).marking(), true, |o| o.dup_limit = 2);
    thread::scope(|s| {
        for v in [3, 4] {
            let f = &f;
            s.spawn(move || {
                let mut t = f.thread();
                let mut mc = initial_context();
                mc.set_reg(Reg::RAX, TAG);
                t.block(TAG);
                let e = Arc::clone(t.engine());
                e.set_encoding(t.tc_mut(), v);
                assert_eq!(t.handle_new_case(mc).outcome, Promotion::Generated);
                let h = e.manager_handle(t.tc(), TAG).unwrap();
                let cases = e.with_manager(t.tc(), h, |m| {
                    m.defined_cases().map(|c| c.encoding).collect::<Vec<_>>()
                });
                assert_eq!(cases, Some(vec![v]));
            });
        }
    });
    assert_eq!(f.host.flush_count(), 2);
}
