// sched/mod.rs
//
// Scheduler: a pluggable `run` function plus a pool set, installed on an
// ES's scheduler stack (spec §3 "Scheduler", §4.4 "Scheduler stack & main
// loop"). `run`/`finish`/`exit` are the pluggable surface (spec §6); the
// stop-flag bookkeeping they usually drive is provided as a shared helper
// so custom schedulers don't have to reinvent it.

pub mod basic;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::pool::PoolHandle;
use crate::ult::UltInner;
use crate::xstream::Xstream;

pub use basic::BasicScheduler;

/// Whether a nested scheduler is hosted by a ULT (owns a stack) or a
/// tasklet (borrows the current scheduler's ULT context, spec §4.5
/// tasklet path step 3). A MAIN scheduler is always coerced to `Ult`
/// (spec §3 invariant) so the ES main loop can context-switch into it
/// uniformly.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SchedHostKind {
    Ult,
    Tasklet,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SchedPosition {
    Main,
    Nested,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SchedState {
    Ready = 0,
    Running = 1,
    Stopped = 2,
    Terminated = 3,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StopMode {
    Run,
    Finish,
    Exit,
}

/// The pluggable scheduling policy (spec §6 Scheduler surface).
pub trait SchedOps: Send + Sync {
    /// Repeatedly pick a unit from `sched`'s pools and hand it to `xs`
    /// via [`Xstream::run_unit`], periodically calling
    /// [`check_events`]. Returns once the scheduler has stopped.
    fn run(&self, xs: &Xstream, sched: &SchedulerRef);

    /// Request a graceful drain: keep running until every pool is empty,
    /// then stop. Default: flip the shared stop flag to `Finish`.
    fn finish(&self, sched: &SchedulerRef) {
        sched.request_finish();
    }

    /// Request an immediate stop, abandoning unrun work.
    /// Default: flip the shared stop flag to `Exit`.
    fn exit(&self, sched: &SchedulerRef) {
        sched.request_exit();
    }
}

pub struct SchedulerInner {
    pub pools: Vec<PoolHandle>,
    pub host_kind: Mutex<SchedHostKind>,
    pub position: Mutex<SchedPosition>,
    pub automatic: bool,
    state: AtomicU8,
    stop: AtomicU8,
    /// Non-owning back-reference to the ULT hosting this scheduler when
    /// nested (spec §9 cyclic-reference resolution: unidirectional
    /// ownership, ES owns schedulers, schedulers hold a weak host link).
    host_ult: Mutex<Option<Weak<UltInner>>>,
    run_fn: Box<dyn SchedOps>,
}

pub type SchedulerRef = Arc<SchedulerInner>;

impl SchedulerInner {
    pub fn new(pools: Vec<PoolHandle>, host_kind: SchedHostKind, run_fn: Box<dyn SchedOps>, automatic: bool) -> SchedulerRef {
        Arc::new(Self {
            pools,
            host_kind: Mutex::new(host_kind),
            position: Mutex::new(SchedPosition::Nested),
            automatic,
            state: AtomicU8::new(SchedState::Ready as u8),
            stop: AtomicU8::new(StopMode::Run as u8),
            host_ult: Mutex::new(None),
            run_fn,
        })
    }

    pub fn state(&self) -> SchedState {
        match self.state.load(Ordering::Acquire) {
            0 => SchedState::Ready,
            1 => SchedState::Running,
            2 => SchedState::Stopped,
            _ => SchedState::Terminated,
        }
    }

    pub fn set_state(&self, s: SchedState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Coerce to ULT-hosted and mark MAIN, per the spec §3 invariant.
    pub fn mark_main(self: &SchedulerRef) {
        *self.host_kind.lock() = SchedHostKind::Ult;
        *self.position.lock() = SchedPosition::Main;
    }

    pub fn is_main(&self) -> bool {
        *self.position.lock() == SchedPosition::Main
    }

    pub fn set_host_ult(&self, host: &Arc<UltInner>) {
        *self.host_ult.lock() = Some(Arc::downgrade(host));
    }

    pub fn stop_mode(&self) -> StopMode {
        match self.stop.load(Ordering::Acquire) {
            1 => StopMode::Finish,
            2 => StopMode::Exit,
            _ => StopMode::Run,
        }
    }

    pub fn request_finish(&self) {
        // EXIT beats a pending FINISH; never downgrade Exit -> Finish.
        let _ = self.stop.compare_exchange(
            StopMode::Run as u8,
            StopMode::Finish as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn request_exit(&self) {
        self.stop.store(StopMode::Exit as u8, Ordering::Release);
    }

    pub fn pools_idle(&self) -> bool {
        self.pools.iter().all(|p| p.is_empty())
    }

    pub fn run(self: &SchedulerRef, xs: &Xstream) {
        self.run_fn.run(xs, self);
    }

    pub fn finish(self: &SchedulerRef) {
        self.run_fn.finish(self);
    }

    pub fn exit(self: &SchedulerRef) {
        self.run_fn.exit(self);
    }
}

/// Honours ES requests per spec §4.4: JOIN drains (`sched.finish`),
/// EXIT/CANCEL stops immediately (`sched.exit`). Scheduler authors call
/// this periodically from inside their `run` loop.
pub fn check_events(sched: &SchedulerRef, xs: &Xstream) {
    use crate::request::XsRequest;

    match XsRequest::decide(xs.request_word()) {
        Some(r) if r.intersects(XsRequest::EXIT | XsRequest::CANCEL) => sched.exit(),
        Some(r) if r.contains(XsRequest::JOIN) => sched.finish(),
        _ => {}
    }
}
