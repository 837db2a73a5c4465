//! A simulated host, client and machine for testing the engine without a real code cache.
//!
//! [SimHost] keeps application blocks, a flat data memory and code caches (one per thread or one
//! shared, as configured). [SimThread] plays the part of a thread executing cached code: it
//! builds blocks through the engine on demand, interprets the resulting instruction lists and
//! calls into the engine when the code does (promotion stubs, clean calls).

use crate::{
    client::{Analysis, BlockSetUp, Client, Encoder, InstrumentCx},
    engine::{BuildFlags, Engine, ThreadCtx},
    host::{flags, Host, MachineContext},
    ir::{Callee, Cond, Encoded, Inst, InstIdx, InstKind, InstList, Note, Opnd, Reg, Target},
    manager::BlockManager,
    promote::{Promotion, Redirect},
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::Arc,
    thread::{self, ThreadId},
};

/// Where the simulated code cache places its first block.
const CODE_BASE: u64 = 0x1000_0000;
/// Where out-of-line stubs live.
const STUB_BASE: u64 = 0xF000_0000;
/// How many instructions a single [SimThread::run] may execute before we assume it has looped.
const MAX_STEPS: usize = 100_000;

/// A block as it sits in a code cache.
#[derive(Debug)]
pub struct CachedBlock {
    pub ilist: InstList,
    pub enc: Encoded,
}

/// Identifies a code cache: a thread's own, or (`None`) the shared one.
type CacheKey = (Option<ThreadId>, u64);

#[derive(Default)]
struct CodeCache {
    blocks: HashMap<CacheKey, Arc<CachedBlock>>,
    /// Flushed blocks whose deletion hasn't been reported to the engine yet.
    deleted: Vec<CacheKey>,
    next_pc: u64,
    flush_count: usize,
}

pub struct SimHost {
    thread_private: bool,
    app: Mutex<HashMap<u64, InstList>>,
    mem: Mutex<HashMap<u64, u64>>,
    stubs: Mutex<Vec<InstList>>,
    cache: Mutex<CodeCache>,
}

impl SimHost {
    pub fn new(thread_private: bool) -> Self {
        Self {
            thread_private,
            app: Mutex::new(HashMap::new()),
            mem: Mutex::new(HashMap::new()),
            stubs: Mutex::new(Vec::new()),
            cache: Mutex::new(CodeCache {
                next_pc: CODE_BASE,
                ..CodeCache::default()
            }),
        }
    }

    /// Make `ilist` the application code of the block `tag`.
    pub fn add_block(&self, tag: u64, ilist: InstList) {
        self.app.lock().insert(tag, ilist);
    }

    pub fn write_mem(&self, addr: u64, val: u64) {
        self.mem.lock().insert(addr, val);
    }

    pub fn read_mem(&self, addr: u64) -> u64 {
        self.mem.lock().get(&addr).copied().unwrap_or(0)
    }

    /// How many times has the engine asked for a block to be flushed?
    pub fn flush_count(&self) -> usize {
        self.cache.lock().flush_count
    }

    /// The stub placed at `pc`, if there is one.
    pub fn stub(&self, pc: u64) -> Option<InstList> {
        let i = usize::try_from(pc.checked_sub(STUB_BASE)? / 0x100).ok()?;
        self.stubs.lock().get(i).cloned()
    }

    fn cache_key(&self, tag: u64) -> CacheKey {
        if self.thread_private {
            (Some(thread::current().id()), tag)
        } else {
            (None, tag)
        }
    }
}

impl Host for SimHost {
    fn thread_private_caches(&self) -> bool {
        self.thread_private
    }

    fn flush(&self, tag: u64) {
        let key = self.cache_key(tag);
        let mut c = self.cache.lock();
        c.flush_count += 1;
        if c.blocks.remove(&key).is_some() {
            c.deleted.push(key);
        }
    }

    fn entry_pc(&self, tag: u64) -> u64 {
        tag
    }

    fn decode_block(&self, tag: u64) -> Option<InstList> {
        self.app.lock().get(&tag).cloned()
    }

    fn alloc_stub(&self, stub: &InstList) -> u64 {
        let mut stubs = self.stubs.lock();
        stubs.push(stub.clone());
        STUB_BASE + (stubs.len() as u64 - 1) * 0x100
    }
}

/// Reads a block's runtime case encoding from memory into the encoding slot, without touching any
/// register.
pub struct MemEncoder(pub u64);

impl Encoder for MemEncoder {
    fn insert_encode(&self, ilist: &mut InstList, at: InstIdx, _orig: Option<&Analysis>) {
        ilist.insert_before(
            at,
            Inst::meta(InstKind::Mov {
                dst: Engine::encoding_opnd(),
                src: Opnd::mem_ptr(self.0),
            }),
        );
    }
}

/// The clean call id [TestClient] marks variants with.
pub const MARK: u64 = 1;

/// One call of [Client::instrument_instr].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Instrumented {
    pub tag: u64,
    pub encoding: u64,
    /// The application address of the instrumented instruction.
    pub app_pc: Option<u64>,
    /// The encoding the case analysis was computed for.
    pub analysed_for: Option<u64>,
}

/// What [TestClient::allow_gen] does.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum GenPolicy {
    Allow,
    Decline,
    /// Decline and stop the block asking again.
    Disable,
}

/// A client with a fixed policy for every block, which records what it is asked to instrument.
pub struct TestClient {
    default: u64,
    cases: Vec<u64>,
    dup: bool,
    dynamic: bool,
    marking: bool,
    gen: GenPolicy,
    instrumented: Mutex<Vec<Instrumented>>,
    gen_requests: Mutex<Vec<(u64, u64)>>,
}

impl TestClient {
    pub fn new(default: u64) -> Self {
        Self {
            default,
            cases: Vec::new(),
            dup: true,
            dynamic: true,
            marking: false,
            gen: GenPolicy::Allow,
            instrumented: Mutex::new(Vec::new()),
            gen_requests: Mutex::new(Vec::new()),
        }
    }

    /// Register `cases` for every new block.
    pub fn with_cases(mut self, cases: &[u64]) -> Self {
        self.cases = cases.to_vec();
        self
    }

    pub fn without_dup(mut self) -> Self {
        self.dup = false;
        self
    }

    pub fn without_dynamic_handling(mut self) -> Self {
        self.dynamic = false;
        self
    }

    /// Start every variant with a `clean_call user(MARK), <encoding>`, so that executions reveal
    /// which variant ran.
    pub fn marking(mut self) -> Self {
        self.marking = true;
        self
    }

    pub fn declining(mut self) -> Self {
        self.gen = GenPolicy::Decline;
        self
    }

    /// Decline new cases and switch dynamic handling off for any block that asks.
    pub fn disabling(mut self) -> Self {
        self.gen = GenPolicy::Disable;
        self
    }

    pub fn instrumented(&self) -> Vec<Instrumented> {
        self.instrumented.lock().clone()
    }

    /// The `(tag, encoding)` pairs [Client::allow_gen] was asked about.
    pub fn gen_requests(&self) -> Vec<(u64, u64)> {
        self.gen_requests.lock().clone()
    }
}

impl Client for TestClient {
    fn set_up_block(&self, _tag: u64, _ilist: &InstList) -> BlockSetUp {
        BlockSetUp {
            default_encoding: self.default,
            enable_dup: self.dup,
            enable_dynamic_handling: self.dynamic,
        }
    }

    fn register_cases(&self, _tag: u64, _ilist: &InstList, manager: &mut BlockManager) {
        for &c in &self.cases {
            // Tests configure duplicates and excess cases on purpose.
            manager.register_case(c).ok();
        }
    }

    fn analyse_case(
        &self,
        _tag: u64,
        _ilist: &InstList,
        encoding: u64,
        _orig: Option<&Analysis>,
    ) -> Option<Analysis> {
        Some(Box::new(encoding))
    }

    fn instrument_instr(
        &self,
        cx: &InstrumentCx<'_>,
        ilist: &mut InstList,
        instr: InstIdx,
        at: InstIdx,
    ) {
        self.instrumented.lock().push(Instrumented {
            tag: cx.tag(),
            encoding: cx.encoding(),
            app_pc: ilist.inst(instr).app_pc(),
            analysed_for: cx
                .case_analysis()
                .and_then(|a| a.downcast_ref::<u64>())
                .copied(),
        });
        if self.marking && cx.is_first_nonlabel_instr(instr) {
            ilist.insert_before(
                at,
                Inst::meta(InstKind::CleanCall {
                    callee: Callee::User(MARK),
                    arg: Opnd::Imm(cx.encoding()),
                }),
            );
        }
    }

    fn allow_gen(
        &self,
        tag: u64,
        _ilist: Option<&InstList>,
        new_encoding: u64,
        enable_dynamic_handling: &mut bool,
    ) -> bool {
        self.gen_requests.lock().push((tag, new_encoding));
        match self.gen {
            GenPolicy::Allow => true,
            GenPolicy::Decline => false,
            GenPolicy::Disable => {
                *enable_dynamic_handling = false;
                false
            }
        }
    }
}

/// What happened during a [SimThread::run].
#[derive(Clone, Debug, Default)]
pub struct Run {
    /// The context when execution left the last block.
    pub mc: MachineContext,
    /// The arguments of the `user(MARK)` clean calls executed, in order.
    pub marks: Vec<u64>,
    pub promotions: Vec<Promotion>,
}

/// How a stretch of execution ended.
enum Step {
    /// Continue at the block with this application address.
    Enter(u64),
    /// Left the simulated program.
    Exit,
    /// Reached the requested stop address.
    Stopped,
}

/// A simulated thread.
pub struct SimThread {
    engine: Arc<Engine>,
    host: Arc<SimHost>,
    // Only `None` while being dropped.
    tc: Option<ThreadCtx>,
}

impl SimThread {
    /// Create a thread context for the calling thread.
    pub fn new(engine: Arc<Engine>, host: Arc<SimHost>) -> Self {
        let tc = engine.thread_init();
        Self {
            engine,
            host,
            tc: Some(tc),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn host(&self) -> &Arc<SimHost> {
        &self.host
    }

    pub fn tc(&self) -> &ThreadCtx {
        match &self.tc {
            Some(tc) => tc,
            None => unreachable!(),
        }
    }

    pub fn tc_mut(&mut self) -> &mut ThreadCtx {
        match &mut self.tc {
            Some(tc) => tc,
            None => unreachable!(),
        }
    }

    /// Return the cached code of block `tag`, building it if necessary.
    pub fn block(&mut self, tag: u64) -> Arc<CachedBlock> {
        let (engine, host) = (Arc::clone(&self.engine), Arc::clone(&self.host));
        let key = host.cache_key(tag);
        let mut c = host.cache.lock();
        // Report deletions before looking anything up, so that a rebuild sees their effect.
        let mut deleted = Vec::new();
        c.deleted.retain(|k| {
            if k.0 == key.0 {
                deleted.push(k.1);
                false
            } else {
                true
            }
        });
        for t in deleted {
            engine.on_block_deleted(self.tc_mut(), t);
        }
        if let Some(b) = c.blocks.get(&key) {
            return Arc::clone(b);
        }
        let mut ilist = match host.decode_block(tag) {
            Some(l) => l,
            None => panic!("no application block at {tag:#x}"),
        };
        engine.instrument_block(self.tc_mut(), tag, &mut ilist, BuildFlags::default());
        let enc = ilist.encode(c.next_pc);
        c.next_pc = (enc.end_pc() + 0xff) & !0xff;
        let b = Arc::new(CachedBlock { ilist, enc });
        c.blocks.insert(key, Arc::clone(&b));
        b
    }

    /// The addresses of the `START` labels of block `tag`'s variants, in layout order.
    pub fn variant_entry_pcs(&mut self, tag: u64) -> Vec<u64> {
        let b = self.block(tag);
        b.ilist
            .iter()
            .filter(|(_, i)| i.is_label_with(Note::Start))
            .filter_map(|(idx, _)| b.enc.pc(idx))
            .collect()
    }

    /// Call [Engine::handle_new_case] as the promotion stub would.
    pub fn handle_new_case(&mut self, mc: MachineContext) -> Redirect {
        let engine = Arc::clone(&self.engine);
        engine.handle_new_case(self.tc_mut(), mc)
    }

    /// Execute from block `tag` in context `mc` until the program exits.
    pub fn run(&mut self, tag: u64, mc: MachineContext) -> Run {
        let mut run = Run {
            mc,
            ..Run::default()
        };
        run.mc.pc = tag;
        self.exec(tag, None, &mut run);
        run
    }

    /// Execute from block `tag` in context `mc` until about to execute the instruction at code
    /// address `stop_pc`, returning the context at that point. Returns `None` if the program
    /// exits first.
    pub fn run_until(
        &mut self,
        tag: u64,
        mc: MachineContext,
        stop_pc: u64,
    ) -> Option<MachineContext> {
        let mut run = Run {
            mc,
            ..Run::default()
        };
        run.mc.pc = tag;
        match self.exec(tag, Some(stop_pc), &mut run) {
            Step::Stopped => Some(run.mc),
            _ => None,
        }
    }

    fn exec(&mut self, mut tag: u64, stop_pc: Option<u64>, run: &mut Run) -> Step {
        let mut steps = 0;
        loop {
            let b = self.block(tag);
            match self.exec_block(&b, stop_pc, run, &mut steps) {
                Step::Enter(next) => tag = next,
                s => return s,
            }
        }
    }

    fn exec_block(
        &mut self,
        b: &CachedBlock,
        stop_pc: Option<u64>,
        run: &mut Run,
        steps: &mut usize,
    ) -> Step {
        let mut cur = b.ilist.first();
        while let Some(idx) = cur {
            *steps += 1;
            if *steps > MAX_STEPS {
                panic!("execution doesn't terminate");
            }
            let inst = b.ilist.inst(idx);
            cur = b.ilist.next(idx);
            if inst.is_label() {
                continue;
            }
            if let Some(pc) = b.enc.pc(idx) {
                if stop_pc == Some(pc) {
                    run.mc.pc = pc;
                    return Step::Stopped;
                }
                run.mc.pc = pc;
            }
            let jump = match *inst.kind() {
                InstKind::Label | InstKind::Nop => None,
                InstKind::Mov { dst, src } => {
                    let v = self.read(&run.mc, src);
                    self.write(&mut run.mc, dst, v);
                    None
                }
                InstKind::Load { dst, src, .. } => {
                    let v = self.read(&run.mc, src);
                    run.mc.set_reg(dst, v);
                    None
                }
                InstKind::Add { dst, src } => {
                    let (l, r) = (self.read(&run.mc, dst), self.read(&run.mc, src));
                    let (v, carry) = l.overflowing_add(r);
                    set_arith(&mut run.mc, v, carry);
                    self.write(&mut run.mc, dst, v);
                    None
                }
                InstKind::Cmp { lhs, rhs } => {
                    let (l, r) = (self.read(&run.mc, lhs), self.read(&run.mc, rhs));
                    let (v, borrow) = l.overflowing_sub(r);
                    set_arith(&mut run.mc, v, borrow);
                    None
                }
                InstKind::SaveFlags(r) => {
                    run.mc.set_reg(r, run.mc.xflags & flags::ARITH);
                    None
                }
                InstKind::RestoreFlags(r) => {
                    run.mc.xflags = flags::merge_arith(run.mc.xflags, run.mc.reg(r));
                    None
                }
                InstKind::DecHitCount(n) => {
                    let z = self.tc_mut().hit_table_mut().decrement_at(n);
                    run.mc.xflags = if z {
                        run.mc.xflags | flags::ZF
                    } else {
                        run.mc.xflags & !flags::ZF
                    };
                    None
                }
                InstKind::Jmp(t) | InstKind::Call(t) => Some(t),
                InstKind::Jcc(c, t) => {
                    let zf = run.mc.xflags & flags::ZF != 0;
                    match (c, zf) {
                        (Cond::Z, true) | (Cond::NZ, false) => Some(t),
                        _ => None,
                    }
                }
                InstKind::Jrcxz(t) => {
                    if run.mc.reg(Reg::RCX) == 0 {
                        Some(t)
                    } else {
                        None
                    }
                }
                InstKind::IndirectJmp(r) => Some(Target::Pc(run.mc.reg(r))),
                InstKind::Ret | InstKind::Syscall | InstKind::Interrupt(_) => return Step::Exit,
                InstKind::CleanCall { callee, arg } => {
                    let v = self.read(&run.mc, arg);
                    if let Some(next) = self.clean_call(callee, v, run) {
                        return Step::Enter(next);
                    }
                    None
                }
            };
            match jump {
                None => (),
                Some(Target::Label(l)) => cur = Some(l),
                Some(Target::Pc(pc)) => return self.jump_to_pc(pc, run),
            }
        }
        Step::Exit
    }

    /// Perform a clean call. Returns the application address to continue at if the callee
    /// redirected execution.
    fn clean_call(&mut self, callee: Callee, arg: u64, run: &mut Run) -> Option<u64> {
        match callee {
            Callee::BailCount => {
                self.engine.record_bail();
                None
            }
            Callee::NewCase => {
                let r = self.handle_new_case(run.mc);
                run.promotions.push(r.outcome);
                run.mc = r.mc;
                Some(r.mc.pc)
            }
            Callee::User(MARK) => {
                run.marks.push(arg);
                None
            }
            Callee::User(_) => None,
        }
    }

    fn jump_to_pc(&mut self, pc: u64, run: &mut Run) -> Step {
        let Some(stub) = self.host.stub(pc) else {
            return Step::Enter(pc);
        };
        // Stubs are single clean calls.
        for (_, inst) in stub.iter() {
            if let InstKind::CleanCall { callee, arg } = *inst.kind() {
                let v = self.read(&run.mc, arg);
                if let Some(next) = self.clean_call(callee, v, run) {
                    return Step::Enter(next);
                }
            }
        }
        Step::Exit
    }

    fn read(&self, mc: &MachineContext, o: Opnd) -> u64 {
        match o {
            Opnd::Reg(r) => mc.reg(r),
            Opnd::Imm(x) => x,
            Opnd::Slot(s) => self.tc().slot(s),
            Opnd::Mem { addr, size } => size.truncate(self.host.read_mem(addr)),
        }
    }

    fn write(&mut self, mc: &mut MachineContext, o: Opnd, v: u64) {
        match o {
            Opnd::Reg(r) => mc.set_reg(r, v),
            Opnd::Imm(_) => panic!("write to an immediate"),
            Opnd::Slot(s) => self.tc_mut().set_slot(s, v),
            Opnd::Mem { addr, size } => self.host.write_mem(addr, size.truncate(v)),
        }
    }
}

impl Drop for SimThread {
    fn drop(&mut self) {
        if let Some(tc) = self.tc.take() {
            self.engine.thread_exit(tc);
        }
    }
}

/// Set ZF, SF and CF for a result `v`, clearing the other arithmetic flags.
fn set_arith(mc: &mut MachineContext, v: u64, carry: bool) {
    let mut f = 0;
    if v == 0 {
        f |= flags::ZF;
    }
    if v >> 63 != 0 {
        f |= flags::SF;
    }
    if carry {
        f |= flags::CF;
    }
    mc.xflags = flags::merge_arith(mc.xflags, f);
}
