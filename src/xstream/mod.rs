// xstream/mod.rs
//
// Execution Stream: one kernel thread, a stack of schedulers (top = the
// one currently driving this ES), and the request word producers raise
// against it (spec §3 "Execution Stream", §4 "ES lifecycle & main loop").
//
// Handles (`XsId`) are validated by registry lookup rather than pointer
// dereference (spec §3 Ownership) — see [`crate::registry`].

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use parking_lot::Mutex;

use crate::context::ContextOps;
use crate::error::Result;
use crate::pool::PoolHandle;
use crate::request::{RequestWord, XsRequest};
use crate::sched::{check_events, SchedHostKind, SchedPosition, SchedState, SchedulerRef};
use crate::tasklet::{TaskletInner, TaskletState};
use crate::ult::{UltInner, UltState};
use crate::unit::Unit;

/// Opaque, copyable handle to an execution stream. Never dereferenced
/// directly — every operation goes through [`crate::registry::Runtime`]
/// to look up the live `Arc<XstreamInner>`, so a stale or forged handle
/// fails with [`Error::InvalidXstream`] instead of undefined behaviour.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct XsId(u64);

impl XsId {
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum XsKind {
    Primary,
    Secondary,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum XsState {
    Created = 0,
    Ready = 1,
    Running = 2,
    Terminated = 3,
}

/// What `run_unit` handed off to, so `check_events`/migration bookkeeping
/// can tell which slot to inspect on return (spec §4.5 dispatch).
enum Running {
    None,
    Ult(Arc<UltInner>),
    Tasklet(Arc<TaskletInner>),
}

pub struct XstreamInner {
    id: XsId,
    rank: AtomicU64,
    kind: XsKind,
    state: AtomicU8,
    request: RequestWord,
    name: Mutex<String>,

    /// Scheduler stack; last element is the one currently running a unit.
    /// `top_sched_mutex` serializes push/pop against concurrent migration
    /// readers inspecting the stack (spec §4.4).
    sched_stack: Mutex<Vec<SchedulerRef>>,
    top_sched_mutex: StdMutex<()>,

    running: Mutex<Running>,
    ctx: Arc<dyn ContextOps>,
    cpu_id: Mutex<Option<usize>>,
}

impl XstreamInner {
    pub(crate) fn new(id: XsId, rank: u64, kind: XsKind, main_sched: SchedulerRef, ctx: Arc<dyn ContextOps>) -> Arc<Self> {
        main_sched.mark_main();
        crate::pool::bind_all(&main_sched.pools, id).expect("fresh ES cannot conflict with an existing pool consumer");
        Arc::new(Self {
            id,
            rank: AtomicU64::new(rank),
            kind,
            state: AtomicU8::new(XsState::Created as u8),
            request: RequestWord::new(),
            name: Mutex::new(format!("xstream-{rank}")),
            sched_stack: Mutex::new(vec![main_sched]),
            top_sched_mutex: StdMutex::new(()),
            running: Mutex::new(Running::None),
            ctx,
            cpu_id: Mutex::new(None),
        })
    }

    pub fn id(&self) -> XsId {
        self.id
    }

    pub fn rank(&self) -> u64 {
        self.rank.load(Ordering::Relaxed)
    }

    /// Override the rank (spec §6 `set_rank`). For identification only —
    /// once overridden, uniqueness across ESes is no longer guaranteed
    /// (spec §6 "Rank allocation").
    pub fn set_rank(&self, rank: u64) {
        self.rank.store(rank, Ordering::Relaxed);
    }

    pub fn is_primary(&self) -> bool {
        self.kind == XsKind::Primary
    }

    /// True while this ES is actively driving a scheduler (spec §6
    /// accessor, `original_source/src/stream.c` `ABT_xstream_is_running`).
    pub fn is_running(&self) -> bool {
        self.state() == XsState::Running
    }

    pub fn state(&self) -> XsState {
        match self.state.load(Ordering::Acquire) {
            0 => XsState::Created,
            1 => XsState::Ready,
            2 => XsState::Running,
            _ => XsState::Terminated,
        }
    }

    fn set_state(&self, s: XsState) {
        let from = self.state();
        self.state.store(s as u8, Ordering::Release);
        crate::trace::xs_state_change(self.id, from, s);
    }

    /// Mark this ES as running without going through `ctx_create` — used
    /// only to adopt the calling OS thread as the primary ES (spec §4.2).
    pub(crate) fn mark_running(&self) {
        self.set_state(XsState::Running);
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = name.into();
    }

    pub fn request_word(&self) -> &RequestWord {
        &self.request
    }

    /// Pin this ES's kernel thread to `cpu` (spec §6 `xstream_set_cpubind`,
    /// supplemented from `original_source/src/stream.c`). Best-effort —
    /// see [`ContextOps::ctx_set_affinity`].
    pub fn set_affinity(&self, cpu: usize) -> Result<()> {
        self.ctx.ctx_set_affinity(self.id, cpu)?;
        *self.cpu_id.lock() = Some(cpu);
        Ok(())
    }

    pub fn cpu_id(&self) -> Option<usize> {
        *self.cpu_id.lock()
    }

    /// CAS-based short-circuit: a never-started ES can be joined/freed
    /// straight from CREATED to TERMINATED (spec §4.2) without ever
    /// spinning up its kernel thread.
    fn short_circuit_to_terminated(&self) -> bool {
        self.state
            .compare_exchange(
                XsState::Created as u8,
                XsState::Terminated as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self
            .state
            .compare_exchange(
                XsState::Created as u8,
                XsState::Ready as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(()); // already started or past it: no-op, not an error
        }
        let me = self.clone();
        self.ctx.ctx_create(self.id, Box::new(move || me.main_loop()))
    }

    pub fn join(self: &Arc<Self>) -> Result<()> {
        // spec §4.3: join fails on self-join or a PRIMARY target, before
        // any state mutation — a secondary joining itself would otherwise
        // reach `ctx_join` on its own still-running `JoinHandle`.
        if self.is_primary() || crate::registry::Runtime::current() == Some(self.id) {
            return Err(crate::error::Error::InvalidXstream);
        }
        if self.short_circuit_to_terminated() {
            return Ok(());
        }
        XsRequest::raise_on(&self.request, XsRequest::JOIN);
        crate::trace::xs_request_raised(self.id, XsRequest::JOIN.bits());
        self.ctx.ctx_join(self.id)
    }

    pub fn cancel(&self) {
        XsRequest::raise_on(&self.request, XsRequest::CANCEL);
        crate::trace::xs_request_raised(self.id, XsRequest::CANCEL.bits());
    }

    /// Request exit of the calling ES's own main scheduler (spec §6
    /// `xstream_exit` — only valid called from inside the ES it targets).
    pub fn exit(self: &Arc<Self>) {
        XsRequest::raise_on(&self.request, XsRequest::EXIT);
        crate::trace::xs_request_raised(self.id, XsRequest::EXIT.bits());
    }

    /// The ES's kernel-thread body: drive the main scheduler until it
    /// stops, then terminate (spec §4.4 main loop).
    fn main_loop(self: &Arc<Self>) {
        crate::registry::set_current(Some(self.id));
        self.set_state(XsState::Running);
        let main = self.sched_stack.lock().first().cloned().expect("ES has no main scheduler");
        main.set_state(SchedState::Running);
        main.run(&Xstream { inner: self.clone() });
        main.set_state(crate::sched::SchedState::Terminated);
        self.set_state(XsState::Terminated);
    }

    pub fn main_scheduler(&self) -> SchedulerRef {
        self.sched_stack.lock().first().cloned().expect("ES has no main scheduler")
    }

    /// Swap out the bottom-of-stack (main) scheduler. Only meaningful
    /// before `start` — the caller (`lib::set_main_sched`) enforces that.
    pub(crate) fn replace_main_scheduler(&self, sched: SchedulerRef) {
        sched.mark_main();
        let mut stack = self.sched_stack.lock();
        crate::pool::unbind_all(&stack[0].pools, self.id);
        crate::pool::bind_all(&sched.pools, self.id).expect("fresh ES cannot conflict with an existing pool consumer");
        stack[0] = sched;
    }

    pub fn main_pools(&self) -> Vec<PoolHandle> {
        self.main_scheduler().pools.clone()
    }

    /// Currently active scheduler: top of the stack (spec §4.4).
    pub fn active_scheduler(&self) -> SchedulerRef {
        self.sched_stack.lock().last().cloned().expect("ES has no active scheduler")
    }

    /// Push `sched` as the new top of this ES's scheduler stack, binding
    /// it to `host` (the unit whose `is_sched` named it). Serialized
    /// against migration readers via `top_sched_mutex` (spec §4.4).
    pub(crate) fn push_scheduler(&self, sched: SchedulerRef, host: &Arc<UltInner>) {
        let _guard = self.top_sched_mutex.lock().unwrap();
        sched.set_host_ult(host);
        *sched.position.lock() = SchedPosition::Nested;
        crate::pool::bind_all(&sched.pools, self.id).expect("fresh nested scheduler cannot conflict with an existing pool consumer");
        self.sched_stack.lock().push(sched);
    }

    fn pop_scheduler(&self) {
        let _guard = self.top_sched_mutex.lock().unwrap();
        if let Some(sched) = self.sched_stack.lock().pop() {
            crate::pool::unbind_all(&sched.pools, self.id);
        }
    }

    /// Hand `unit` to this ES for execution (spec §4.5). ULTs are
    /// context-switched into and may suspend; tasklets run straight
    /// through. Call sites are scheduler `run` implementations.
    pub fn run_unit(self: &Arc<Self>, unit: Unit) {
        match unit {
            Unit::Ult(u) => self.run_ult(u),
            Unit::Tasklet(t) => self.run_tasklet(t),
        }
    }

    fn run_ult(self: &Arc<Self>, u: Arc<UltInner>) {
        use crate::request::UltRequest;

        // Entry safe point (spec §4.5 ULT path steps 1-2): a CANCEL/EXIT
        // raised while this ULT was still sitting in its pool means it
        // never runs at all; a pending MIGRATE moves it without running
        // it either.
        let entry = UltRequest::decide(&u.request);
        if entry.intersects(UltRequest::CANCEL | UltRequest::EXIT) {
            u.request.take((UltRequest::CANCEL | UltRequest::EXIT).bits());
            u.set_state(UltState::Terminated);
            return;
        }
        if entry.contains(UltRequest::MIGRATE) {
            self.migrate_ult(u);
            return;
        }

        u.set_state(UltState::Running);
        *u.last_xstream.lock() = Some(self.id);
        *self.running.lock() = Running::Ult(u.clone());

        if let Some(nested) = u.is_sched.lock().clone() {
            self.push_scheduler(nested.clone(), &u);
            nested.set_state(SchedState::Running);
            nested.run(&Xstream { inner: self.clone() });
            nested.set_state(SchedState::Terminated);
            self.pop_scheduler();
            u.set_state(UltState::Terminated);
            *self.running.lock() = Running::None;
            return;
        }

        let suspended = u.resume();
        *self.running.lock() = Running::None;

        if !suspended {
            u.set_state(UltState::Terminated);
            return;
        }

        self.handle_ult_suspend(u);
    }

    /// Post-resume bookkeeping: precedence is TERMINATE/CANCEL/EXIT (the
    /// ULT is done, don't re-push) > MIGRATE (move to another pool) >
    /// BLOCK (don't re-push, something else must wake it) > default
    /// re-push to the owning pool (spec §4.6).
    fn handle_ult_suspend(self: &Arc<Self>, u: Arc<UltInner>) {
        use crate::request::UltRequest;

        let seen = UltRequest::decide(&u.request);

        if seen.intersects(UltRequest::TERMINATE | UltRequest::CANCEL | UltRequest::EXIT) {
            u.set_state(UltState::Terminated);
            return;
        }

        if seen.contains(UltRequest::MIGRATE) {
            self.migrate_ult(u);
            return;
        }

        if seen.contains(UltRequest::BLOCK) {
            u.request.take(UltRequest::BLOCK.bits());
            u.set_state(UltState::Blocked);
            return;
        }

        u.set_state(UltState::Ready);
        if let Some(pool) = u.owning_pool.lock().clone() {
            pool.push(Unit::Ult(u.clone()));
            u.bind_pool(&pool);
        }
    }

    /// Migration protocol (spec §4.7): under the ULT's mutex, take the
    /// target pool and clear MIGRATE; update the owning pool; push to
    /// the target; adjust migration counters; auto-start the target ES
    /// if it's never been started.
    fn migrate_ult(&self, u: Arc<UltInner>) {
        let target = match u.take_migration_target() {
            Some(t) => t,
            None => {
                u.set_state(UltState::Ready);
                return;
            }
        };
        if let Some(prev) = u.owning_pool.lock().clone() {
            prev.note_migration_out();
        }
        u.run_migration_callback();
        u.set_state(UltState::Ready);
        target.note_migration_in();
        target.push(Unit::Ult(u.clone()));
        u.bind_pool(&target);

        // spec §4.7 step 6: if the target pool's consumer ES exists and
        // has never been started, start it now so the migrated ULT
        // actually gets picked up.
        if let Some(consumer) = target.consumer() {
            if let Ok(rt) = crate::registry::Runtime::get() {
                if let Some(consumer_inner) = rt.lookup(consumer) {
                    if consumer_inner.state() == XsState::Created {
                        let _ = consumer_inner.start();
                    }
                }
            }
        }

        crate::trace::migration(self.id);
    }

    fn run_tasklet(self: &Arc<Self>, t: Arc<TaskletInner>) {
        use crate::request::TaskletRequest;

        // Tasklet path step 1 (spec §4.5): CANCEL terminates without
        // ever invoking the task function.
        if TaskletRequest::decide(&t.request).contains(TaskletRequest::CANCEL) {
            t.request.take(TaskletRequest::CANCEL.bits());
            t.set_state(TaskletState::Terminated);
            return;
        }

        t.set_state(TaskletState::Running);
        *t.last_xstream.lock() = Some(self.id);
        *self.running.lock() = Running::Tasklet(t.clone());

        if let Some(nested) = t.is_sched.lock().clone() {
            self.push_scheduler_tasklet(nested.clone());
            nested.set_state(SchedState::Running);
            nested.run(&Xstream { inner: self.clone() });
            nested.set_state(SchedState::Terminated);
            self.pop_scheduler();
            t.set_state(TaskletState::Terminated);
            *self.running.lock() = Running::None;
            return;
        }

        t.run();
        t.set_state(TaskletState::Terminated);
        *self.running.lock() = Running::None;
    }

    fn push_scheduler_tasklet(&self, sched: SchedulerRef) {
        let _guard = self.top_sched_mutex.lock().unwrap();
        *sched.host_kind.lock() = SchedHostKind::Tasklet;
        *sched.position.lock() = SchedPosition::Nested;
        crate::pool::bind_all(&sched.pools, self.id).expect("fresh nested scheduler cannot conflict with an existing pool consumer");
        self.sched_stack.lock().push(sched);
    }

    /// Called by a scheduler's `run` loop at a safe point (spec §4.4).
    pub fn check_events(self: &Arc<Self>) {
        check_events(&self.active_scheduler(), &Xstream { inner: self.clone() });
    }
}

/// Cheap, cloneable front-end over an `Arc<XstreamInner>` handed to
/// scheduler `run` implementations; avoids exposing the inner `Arc` type
/// name across the scheduler trait boundary.
#[derive(Clone)]
pub struct Xstream {
    inner: Arc<XstreamInner>,
}

impl Xstream {
    pub fn id(&self) -> XsId {
        self.inner.id()
    }

    pub fn run_unit(&self, unit: Unit) {
        self.inner.clone().run_unit(unit)
    }

    pub fn check_events(&self) {
        self.inner.clone().check_events()
    }

    pub fn request_word(&self) -> &RequestWord {
        self.inner.request_word()
    }

    pub fn is_primary(&self) -> bool {
        self.inner.is_primary()
    }
}

static NEXT_XS_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn alloc_xs_id() -> XsId {
    XsId::from_raw(NEXT_XS_ID.fetch_add(1, Ordering::Relaxed))
}
