// tasklet.rs
//
// Stackless run-to-completion work unit (spec §3 "Work unit — TASKLET-only").
// Cannot block or yield; the task function runs straight through.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::pool::PoolHandle;
use crate::request::{RequestWord, TaskletRequest};
use crate::sched::SchedulerRef;
use crate::xstream::XsId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TaskletState {
    Ready = 0,
    Running = 1,
    Terminated = 2,
}

pub struct TaskletInner {
    pub request: RequestWord,
    pub owning_pool: Mutex<Option<PoolHandle>>,
    pub last_xstream: Mutex<Option<XsId>>,
    pub is_sched: Mutex<Option<SchedulerRef>>,
    state: AtomicU8,
    func: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl TaskletInner {
    pub fn new(func: Box<dyn FnOnce() + Send>) -> Arc<Self> {
        Arc::new(Self {
            request: RequestWord::new(),
            owning_pool: Mutex::new(None),
            last_xstream: Mutex::new(None),
            is_sched: Mutex::new(None),
            state: AtomicU8::new(TaskletState::Ready as u8),
            func: Mutex::new(Some(func)),
        })
    }

    /// A tasklet whose "body" is a nested scheduler, borrowing the
    /// current ULT context rather than owning a stack of its own (spec
    /// §4.5 tasklet path step 3). `func` is never invoked in this case;
    /// it exists only because `TaskletInner` always needs one.
    pub fn with_nested_sched(sched: SchedulerRef) -> Arc<Self> {
        let t = Self::new(Box::new(|| {}));
        *t.is_sched.lock() = Some(sched);
        t
    }

    pub fn state(&self) -> TaskletState {
        match self.state.load(Ordering::Acquire) {
            0 => TaskletState::Ready,
            1 => TaskletState::Running,
            _ => TaskletState::Terminated,
        }
    }

    pub fn set_state(&self, s: TaskletState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Record `pool` as the pool this tasklet currently lives in.
    pub(crate) fn bind_pool(self: &Arc<Self>, pool: &PoolHandle) {
        *self.owning_pool.lock() = Some(pool.clone());
    }

    /// Raise CANCEL against this specific tasklet (spec §4.5 tasklet path
    /// step 1): it is dropped without ever running if it hasn't been
    /// dispatched yet. Has no effect once the tasklet is already running,
    /// since a tasklet cannot suspend to observe the request mid-flight.
    pub fn cancel(&self) {
        TaskletRequest::raise_on(&self.request, TaskletRequest::CANCEL);
        crate::trace::ult_request_raised(TaskletRequest::CANCEL.bits());
    }

    /// Runs the task function to completion. Panics if called twice.
    pub fn run(&self) {
        let f = self
            .func
            .lock()
            .take()
            .expect("tasklet function already consumed");
        f();
    }
}
