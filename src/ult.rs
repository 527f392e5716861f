// ult.rs
//
// User-level thread: a stackful coroutine scheduled cooperatively within
// one ES at a time (spec §3 "Work unit — ULT-only"). Context save/
// restore/switch is provided by `corosensei`; ULT bodies receive a
// `UltCx` handle to call back into the scheduler rather than reaching
// for thread-local magic, matching the "interface over inheritance"
// design note in spec §9.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::Mutex;

use crate::pool::PoolHandle;
use crate::request::{RequestWord, UltRequest};
use crate::sched::SchedulerRef;
use crate::xstream::XsId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum UltState {
    Ready = 0,
    Running = 1,
    Blocked = 2,
    Terminated = 3,
}

/// Handle a running ULT body uses to suspend itself. Constructed fresh
/// on every resume; never escapes the body's call stack.
pub struct UltCx<'y> {
    yielder: &'y Yielder<(), ()>,
    me: Arc<UltInner>,
}

impl<'y> UltCx<'y> {
    /// Cooperative suspension point: hands control back to the ES, which
    /// re-pushes this ULT to its pool per spec §4.5 step 11.
    pub fn yield_now(&self) {
        self.yielder.suspend(());
    }

    /// Suspend and do not re-push; some other actor must wake this ULT
    /// by pushing it back onto a pool.
    pub fn block(&self) {
        UltRequest::raise_on(&self.me.request, UltRequest::BLOCK);
        self.yielder.suspend(());
    }

    /// Self-termination distinct from [`block`](Self::block) and from the
    /// owning execution stream's own `exit` (spec §4.1 "EXIT | ULT |
    /// Self-termination"): this ULT is torn down at the next safe point,
    /// the ES it runs on is unaffected. Does not return in practice — the
    /// ULT is never resumed again once it suspends here.
    pub fn exit(&self) {
        UltRequest::raise_on(&self.me.request, UltRequest::EXIT);
        self.yielder.suspend(());
    }

    pub fn handle(&self) -> Arc<UltInner> {
        self.me.clone()
    }
}

pub type UltBody = dyn FnOnce(&mut UltCx<'_>) + Send;

pub struct UltInner {
    pub request: RequestWord,
    pub owning_pool: Mutex<Option<PoolHandle>>,
    pub last_xstream: Mutex<Option<XsId>>,
    pub is_sched: Mutex<Option<SchedulerRef>>,

    state: AtomicU8,
    coroutine: Mutex<Option<Coroutine<(), (), (), DefaultStack>>>,

    /// Migration argument slot + migration callback, both guarded by the
    /// same mutex per spec §4.7 ("under the ULT's mutex").
    migration: Mutex<MigrationSlot>,
}

#[derive(Default)]
struct MigrationSlot {
    target: Option<PoolHandle>,
    callback: Option<Box<dyn Fn(&Arc<UltInner>) + Send + Sync>>,
}

impl UltInner {
    pub fn spawn(stack_size: usize, body: Box<UltBody>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<UltInner>| {
            let weak = weak.clone();
            let stack = DefaultStack::new(stack_size).expect("ULT stack allocation failed");
            let coroutine = Coroutine::with_stack(stack, move |yielder, ()| {
                let me = weak.upgrade().expect("ULT dropped before it ran");
                let mut cx = UltCx { yielder, me: me.clone() };
                let mut body = Some(body);
                (body.take().expect("ULT body already consumed"))(&mut cx);
                me.set_state(UltState::Terminated);
                UltRequest::raise_on(&me.request, UltRequest::TERMINATE);
            });

            Self {
                request: RequestWord::new(),
                owning_pool: Mutex::new(None),
                last_xstream: Mutex::new(None),
                is_sched: Mutex::new(None),
                state: AtomicU8::new(UltState::Ready as u8),
                coroutine: Mutex::new(Some(coroutine)),
                migration: Mutex::new(MigrationSlot::default()),
            }
        })
    }

    /// A ULT whose "body" is a nested scheduler: the ES that runs it
    /// drives `sched` instead of resuming a coroutine (spec §4.5 "nested
    /// scheduler"). The coroutine still needs *some* body to construct;
    /// it's never actually resumed, so it's an empty stub.
    pub fn with_nested_sched(stack_size: usize, sched: SchedulerRef) -> Arc<Self> {
        let u = Self::spawn(stack_size, Box::new(|_cx| {}));
        *u.is_sched.lock() = Some(sched);
        u
    }

    pub fn state(&self) -> UltState {
        match self.state.load(Ordering::Acquire) {
            0 => UltState::Ready,
            1 => UltState::Running,
            2 => UltState::Blocked,
            _ => UltState::Terminated,
        }
    }

    pub fn set_state(&self, s: UltState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Context-switch into this ULT (spec §4.6 suspension point). Returns
    /// `true` if the ULT returned control by suspending, `false` if it
    /// ran to completion.
    pub fn resume(&self) -> bool {
        let mut slot = self.coroutine.lock();
        let coro = slot.as_mut().expect("resume on a terminated ULT");
        match coro.resume(()) {
            CoroutineResult::Yield(()) => true,
            CoroutineResult::Return(()) => {
                *slot = None;
                false
            }
        }
    }

    pub fn done(&self) -> bool {
        self.coroutine.lock().is_none()
    }

    /// Record `pool` as the pool this ULT currently lives in. Called
    /// once on initial spawn and again every time the ES re-pushes this
    /// ULT (including across a migration).
    pub(crate) fn bind_pool(self: &Arc<Self>, pool: &PoolHandle) {
        *self.owning_pool.lock() = Some(pool.clone());
    }

    /// Arm a migration: record the target pool and clear any stale one.
    /// Called by a producer (another ULT, another thread) via `raise`.
    pub fn request_migration(&self, target: PoolHandle) {
        self.migration.lock().target = Some(target);
        UltRequest::raise_on(&self.request, UltRequest::MIGRATE);
    }

    pub fn set_migration_callback(&self, cb: Box<dyn Fn(&Arc<UltInner>) + Send + Sync>) {
        self.migration.lock().callback = Some(cb);
    }

    /// Raise CANCEL against this specific ULT (spec §4.1 "CANCEL | ULT |
    /// Abort at next yield point"), distinct from cancelling the whole ES
    /// it happens to be running on. Observed at dispatch entry if the ULT
    /// hasn't started running yet, or after it next returns control.
    pub fn cancel(&self) {
        UltRequest::raise_on(&self.request, UltRequest::CANCEL);
        crate::trace::ult_request_raised(UltRequest::CANCEL.bits());
    }

    /// Extract the migration target under the ULT mutex, clearing the
    /// request bit atomically with respect to other migration readers
    /// (spec §4.7 steps 1-3).
    pub(crate) fn take_migration_target(&self) -> Option<PoolHandle> {
        let mut slot = self.migration.lock();
        let target = slot.target.take();
        self.request.take(UltRequest::MIGRATE.bits());
        target
    }

    pub(crate) fn run_migration_callback(self: &Arc<Self>) {
        let slot = self.migration.lock();
        if let Some(cb) = slot.callback.as_ref() {
            cb(self);
        }
    }
}
