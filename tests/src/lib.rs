//! End-to-end tests of the engine, run against the simulated host and machine of
//! `bbdup::testing`.

use bbdup::{
    EncodingSource, Engine, MachineContext, Options,
    host::flags,
    ir::{Inst, InstKind, InstList, Opnd, Reg},
    testing::{SimHost, SimThread, TestClient},
};
use std::sync::Arc;

#[cfg(test)]
mod concurrency;
#[cfg(test)]
mod dispatch;
#[cfg(test)]
mod promotion;
#[cfg(test)]
mod recovery;
#[cfg(test)]
mod registry;

/// The tag (and application address) of the block most tests run.
pub const TAG: u64 = 0x4000;
/// Where the runtime case encoding is read from.
pub const DISPATCH: u64 = 0x9000;

/// `mov rbx, rax; ret`: reads `rax`, and the flags are live out of it.
pub fn block(tag: u64) -> InstList {
    InstList::from_insts([
        Inst::app(
            InstKind::Mov {
                dst: Opnd::Reg(Reg::RBX),
                src: Opnd::Reg(Reg::RAX),
            },
            tag,
        ),
        Inst::app(InstKind::Ret, tag + 8),
    ])
}

/// A context in which every register holds a distinct value and some flags are set.
pub fn initial_context() -> MachineContext {
    let mut mc = MachineContext::default();
    for (i, r) in mc.regs.iter_mut().enumerate() {
        *r = 0xa000 + i as u64;
    }
    mc.xflags = flags::ZF | flags::AF | (1 << 9);
    mc.pc = TAG;
    mc
}

/// Everything a test needs to drive the engine.
pub struct Fixture {
    pub host: Arc<SimHost>,
    pub client: Arc<TestClient>,
    pub engine: Arc<Engine>,
}

impl Fixture {
    /// An engine reading the encoding from [DISPATCH] and knowing the single block [block]`(TAG)`.
    /// `f` can adjust the options before the engine is created.
    pub fn new<F>(client: TestClient, thread_private: bool, f: F) -> Self
    where
        F: FnOnce(&mut Options),
    {
        let host = Arc::new(SimHost::new(thread_private));
        host.add_block(TAG, block(TAG));
        let client = Arc::new(client);
        let mut o = Options::new(client.clone());
        o.encoding = Some(EncodingSource::Memory {
            opnd: Opnd::mem_ptr(DISPATCH),
            atomic: !thread_private,
        });
        f(&mut o);
        let engine = match Engine::new(host.clone(), o) {
            Ok(e) => e,
            Err(e) => panic!("{e}"),
        };
        Self {
            host,
            client,
            engine,
        }
    }

    /// A simulated thread for the calling thread.
    pub fn thread(&self) -> SimThread {
        SimThread::new(Arc::clone(&self.engine), Arc::clone(&self.host))
    }

    pub fn set_dispatch(&self, encoding: u64) {
        self.host.write_mem(DISPATCH, encoding);
    }
}
