use crate::{DISPATCH, TAG, block};
use bbdup::{
    BlockManager, BlockSetUp, Client, EncodingSource, Engine, InstrumentCx, Options,
    RegisterError,
    ir::{InstIdx, InstList, Opnd},
    testing::{SimHost, SimThread},
};
use std::sync::{Arc, Mutex};

/// Registers a fixed list of encodings for every new block and records what happened.
struct Registering {
    encodings: Vec<u64>,
    results: Mutex<Vec<Result<(), RegisterError>>>,
    case_counts: Mutex<Vec<usize>>,
}

impl Registering {
    fn new(encodings: &[u64]) -> Self {
        Self {
            encodings: encodings.to_vec(),
            results: Mutex::new(Vec::new()),
            case_counts: Mutex::new(Vec::new()),
        }
    }
}

impl Client for Registering {
    fn set_up_block(&self, _tag: u64, _ilist: &InstList) -> BlockSetUp {
        BlockSetUp::new(0)
    }

    fn register_cases(&self, _tag: u64, _ilist: &InstList, manager: &mut BlockManager) {
        for &e in &self.encodings {
            self.results.lock().unwrap().push(manager.register_case(e));
            self.case_counts.lock().unwrap().push(manager.case_count());
        }
    }

    fn instrument_instr(
        &self,
        _cx: &InstrumentCx<'_>,
        _ilist: &mut InstList,
        _instr: InstIdx,
        _at: InstIdx,
    ) {
    }
}

fn build(client: Arc<Registering>, limit: u16) -> (Arc<Engine>, SimThread) {
    let host = Arc::new(SimHost::new(true));
    host.add_block(TAG, block(TAG));
    let mut o = Options::new(client);
    o.encoding = Some(EncodingSource::Memory {
        opnd: Opnd::mem_ptr(DISPATCH),
        atomic: false,
    });
    o.dup_limit = limit;
    let e = Engine::new(host.clone(), o).unwrap();
    let mut t = SimThread::new(Arc::clone(&e), host);
    t.block(TAG);
    (e, t)
}

#[test]
fn duplicate_registration() {
    let c = Arc::new(Registering::new(&[3, 3, 0]));
    let (e, t) = build(c.clone(), 4);
    assert_eq!(
        *c.results.lock().unwrap(),
        vec![
            Ok(()),
            Err(RegisterError::AlreadyRegistered(3)),
            Err(RegisterError::AlreadyRegistered(0))
        ]
    );
    assert_eq!(*c.case_counts.lock().unwrap(), vec![1, 1, 1]);
    let h = e.manager_handle(t.tc(), TAG).unwrap();
    let cases = e.with_manager(t.tc(), h, |m| {
        m.defined_cases().map(|c| c.encoding).collect::<Vec<_>>()
    });
    assert_eq!(cases, Some(vec![3]));
}

#[test]
fn registration_beyond_the_limit() {
    let c = Arc::new(Registering::new(&[1, 2, 3, 4]));
    let (e, t) = build(c.clone(), 2);
    assert_eq!(
        *c.results.lock().unwrap(),
        vec![
            Ok(()),
            Ok(()),
            Err(RegisterError::LimitReached(3)),
            Err(RegisterError::LimitReached(4))
        ]
    );
    let h = e.manager_handle(t.tc(), TAG).unwrap();
    assert_eq!(e.with_manager(t.tc(), h, |m| m.case_count()), Some(2));
    assert!(!e.with_manager(t.tc(), h, |m| m.is_included(3)).unwrap());
}

#[test]
fn managers_are_dropped_with_their_block() {
    let c = Arc::new(Registering::new(&[1]));
    let (e, mut t) = build(c, 1);
    let h = e.manager_handle(t.tc(), TAG).unwrap();
    e.on_block_deleted(t.tc_mut(), TAG);
    assert!(e.with_manager(t.tc(), h, |_| ()).is_none());
    assert!(e.manager_handle(t.tc(), TAG).is_none());
}
