//! User-level threading runtime: execution streams, ULTs, tasklets,
//! pools and schedulers, modelled on Argobots (spec §0 overview).
//!
//! Call [`Runtime::init`] once per process before using anything else.
//! The calling thread becomes the **primary** execution stream; `create`
//! spawns additional **secondary** ones on their own kernel threads.

pub mod config;
pub mod context;
pub mod error;
pub mod pool;
pub mod registry;
pub mod request;
pub mod sched;
pub mod tasklet;
pub mod trace;
pub mod ult;
pub mod unit;
pub mod xstream;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use registry::Runtime;

use std::sync::Arc;

use pool::PoolHandle;
use sched::{SchedHostKind, SchedOps, SchedulerInner, SchedulerRef};
use tasklet::TaskletInner;
use ult::{UltBody, UltInner};
use unit::Unit;
use xstream::{alloc_xs_id, XsId, XsKind, XsState, XstreamInner};

/// Create a secondary execution stream with the given pool set and
/// scheduling policy. The ES is registered but not yet running; call
/// [`start`] to spin up its kernel thread (spec §4.2 `xstream_create`).
pub fn create(pools: Vec<PoolHandle>, run: Box<dyn SchedOps>) -> Result<XsId> {
    let rt = Runtime::get()?;
    let id = alloc_xs_id();
    let rank = rt.next_rank();
    // A secondary ES's main scheduler persists until explicitly joined
    // or cancelled, like the primary's — it isn't automatic.
    let main_sched = SchedulerInner::new(pools, SchedHostKind::Ult, run, false);
    let inner = XstreamInner::new(id, rank, XsKind::Secondary, main_sched, rt.ctx());
    rt.register(inner);
    Ok(id)
}

/// Convenience: `create` backed by a single default FIFO pool and the
/// built-in round-robin scheduler.
pub fn create_basic() -> Result<XsId> {
    create(vec![pool::BasicPool::fifo()], Box::new(sched::BasicScheduler::new()))
}

pub fn start(xs: XsId) -> Result<()> {
    lookup(xs)?.start()
}

/// Block the calling thread until `xs` terminates, raising JOIN so its
/// main scheduler drains and stops (spec §4.2). Short-circuits to an
/// immediate no-op if `xs` was never started. Rejects self-join and the
/// primary (spec §4.3/§8) — see `XstreamInner::join`.
pub fn join(xs: XsId) -> Result<()> {
    lookup(xs)?.join()
}

/// Reclaim a terminated ES's registry entry. Spec §4.2/§8: freeing the
/// primary is always `InvalidXstream`, checked first and without side
/// effects; freeing a still-running secondary is a logic error at the
/// caller's level, not something this runtime silently allows — it
/// returns `WrongState`.
pub fn free(xs: XsId) -> Result<()> {
    let rt = Runtime::get()?;
    let inner = lookup(xs)?;
    if inner.is_primary() {
        return Err(Error::InvalidXstream);
    }
    if inner.state() != XsState::Terminated {
        trace::error(&Error::WrongState);
        return Err(Error::WrongState);
    }
    rt.unregister(xs);
    Ok(())
}

/// Raise CANCEL: the ES's scheduler stack exits at the next safe point
/// without draining pending work (spec §4.4, contrast with `join`).
/// Rejects the primary (spec §8 "primary-cancel … without side effects")
/// before raising anything.
pub fn cancel(xs: XsId) -> Result<()> {
    let inner = lookup(xs)?;
    if inner.is_primary() {
        return Err(Error::InvalidXstream);
    }
    inner.cancel();
    Ok(())
}

/// Raise EXIT against the calling ES's own scheduler stack. Only
/// meaningful called from inside the ES it targets (spec §6
/// `xstream_exit`). Spec §8: an uninitialised runtime is `Uninitialised`;
/// an initialised runtime called from a thread with no current ES (i.e.
/// not running as any ES) is `InvalidXstream`.
pub fn exit() -> Result<()> {
    let id = self_()?;
    lookup(id)?.exit();
    Ok(())
}

/// The execution stream the calling OS thread is running as. Spec §6/§8:
/// distinguishes "runtime never initialised" (`Uninitialised`) from
/// "initialised, but this thread isn't running as any ES" (`InvalidXstream`).
pub fn self_() -> Result<XsId> {
    Runtime::get()?;
    registry::Runtime::current().ok_or(Error::InvalidXstream)
}

pub fn self_rank() -> Result<u64> {
    Ok(lookup(self_()?)?.rank())
}

/// Override `xs`'s rank (spec §6 `set_rank`). Identification only — after
/// an override, uniqueness across ESes is no longer guaranteed.
pub fn set_rank(xs: XsId, rank: u64) -> Result<()> {
    lookup(xs)?.set_rank(rank);
    Ok(())
}

/// `xs`'s rank (spec §6 accessor table; named `get_rank` here to avoid
/// colliding with the registry-wide `get_num` — spec §8's "`get_num`
/// equals the sum of created + active registry sizes" names a count, not
/// a per-handle accessor, so the two can't share one signature).
pub fn get_rank(xs: XsId) -> Result<u64> {
    Ok(lookup(xs)?.rank())
}

pub fn is_primary(xs: XsId) -> Result<bool> {
    Ok(lookup(xs)?.is_primary())
}

pub fn equal(a: XsId, b: XsId) -> bool {
    a == b
}

pub fn get_state(xs: XsId) -> Result<XsState> {
    Ok(lookup(xs)?.state())
}

pub fn is_running(xs: XsId) -> Result<bool> {
    Ok(lookup(xs)?.is_running())
}

/// Pin `xs`'s kernel thread to `cpu` (spec §6 `xstream_set_cpubind`).
pub fn set_affinity(xs: XsId, cpu: usize) -> Result<()> {
    lookup(xs)?.set_affinity(cpu)
}

pub fn cpu_id(xs: XsId) -> Result<Option<usize>> {
    Ok(lookup(xs)?.cpu_id())
}

/// Spec §6/§8 `get_num`: the sum of the created and active registry
/// sizes, dead (terminated, awaiting `free`) ESes excluded. Kept under
/// the name `num_xstreams` — the public name callers use (SPEC_FULL §6)
/// — since `get_num` alone reads as a per-handle accessor next to
/// `get_rank`/`get_state`/`is_primary` above.
pub fn num_xstreams() -> Result<usize> {
    Ok(Runtime::get()?.num_xstreams())
}

pub fn set_name(xs: XsId, name: impl Into<String>) -> Result<()> {
    lookup(xs)?.set_name(name);
    Ok(())
}

pub fn get_name(xs: XsId) -> Result<String> {
    Ok(lookup(xs)?.name())
}

/// Replace `xs`'s main scheduler before it has been started (spec §6
/// `xstream_set_main_sched`). Attempting this after `start` is a logic
/// error the caller must avoid; we don't defend against it here since
/// the scheduler stack's bottom slot is only read once, at `start`.
pub fn set_main_sched(xs: XsId, sched: SchedulerRef) -> Result<()> {
    let inner = lookup(xs)?;
    if inner.state() != XsState::Created {
        return Err(Error::WrongState);
    }
    inner.replace_main_scheduler(sched);
    Ok(())
}

pub fn get_main_sched(xs: XsId) -> Result<SchedulerRef> {
    Ok(lookup(xs)?.main_scheduler())
}

pub fn get_main_pools(xs: XsId) -> Result<Vec<PoolHandle>> {
    Ok(lookup(xs)?.main_pools())
}

/// Spawn a new ULT onto `pool` (spec §5 `thread_create`). The ULT is
/// pushed ready to run; whichever ES is bound as `pool`'s consumer will
/// pick it up.
pub fn thread_create(pool: &PoolHandle, stack_size: usize, body: Box<UltBody>) -> Arc<UltInner> {
    let u = UltInner::spawn(stack_size, body);
    pool.push(Unit::Ult(u.clone()));
    u.bind_pool(pool);
    u
}

/// Spawn a ULT that itself hosts a nested scheduler (spec §4.4 "nested
/// scheduler", e.g. a dedicated event-loop ULT).
pub fn thread_create_with_sched(pool: &PoolHandle, stack_size: usize, sched: SchedulerRef) -> Arc<UltInner> {
    let u = UltInner::with_nested_sched(stack_size, sched);
    pool.push(Unit::Ult(u.clone()));
    u.bind_pool(pool);
    u
}

/// Spawn a tasklet onto `pool` (spec §5 `task_create`).
pub fn task_create(pool: &PoolHandle, func: Box<dyn FnOnce() + Send>) -> Arc<TaskletInner> {
    let t = TaskletInner::new(func);
    pool.push(Unit::Tasklet(t.clone()));
    t.bind_pool(pool);
    t
}

/// Spawn a tasklet that hosts a nested scheduler, borrowing whichever
/// ULT context is running when the ES picks it up (spec §4.5 tasklet
/// path step 3).
pub fn task_create_with_sched(pool: &PoolHandle, sched: SchedulerRef) -> Arc<TaskletInner> {
    let t = TaskletInner::with_nested_sched(sched);
    pool.push(Unit::Tasklet(t.clone()));
    t.bind_pool(pool);
    t
}

fn lookup(xs: XsId) -> Result<Arc<XstreamInner>> {
    Runtime::get()?.lookup(xs).ok_or(Error::InvalidXstream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use crate::pool::BasicPool;
    use crate::sched::{BasicScheduler, SchedHostKind, SchedulerInner};

    #[test]
    fn many_ults_increment_a_shared_counter() {
        Runtime::init();
        let xs = create_basic().unwrap();
        let pool = get_main_pools(xs).unwrap()[0].clone();

        let counter = Arc::new(AtomicI64::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            thread_create(
                &pool,
                64 * 1024,
                Box::new(move |_cx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        start(xs).unwrap();
        join(xs).unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn join_drains_every_queued_tasklet() {
        Runtime::init();
        let xs = create_basic().unwrap();
        let pool = get_main_pools(xs).unwrap()[0].clone();

        let counter = Arc::new(AtomicI64::new(0));
        for _ in 0..1000 {
            let counter = counter.clone();
            task_create(
                &pool,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        start(xs).unwrap();
        join(xs).unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn cancel_during_drain_abandons_remaining_tasklets_but_terminates_promptly() {
        Runtime::init();
        let xs = create_basic().unwrap();
        let pool = get_main_pools(xs).unwrap()[0].clone();

        let counter = Arc::new(AtomicI64::new(0));
        // Runs first (FIFO) and buys enough wall-clock time for `cancel`
        // below to land on the ES's request word before the pool would
        // otherwise drain on its own.
        task_create(
            &pool,
            Box::new(|| {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }),
        );
        for _ in 0..1000 {
            let counter = counter.clone();
            task_create(
                &pool,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        start(xs).unwrap();
        cancel(xs).unwrap();
        join(xs).unwrap();

        assert_eq!(get_state(xs).unwrap(), XsState::Terminated);
        assert!(counter.load(Ordering::SeqCst) < 1000);
    }

    #[test]
    fn join_before_start_short_circuits_to_terminated() {
        Runtime::init();
        let xs = create_basic().unwrap();

        assert_eq!(get_state(xs).unwrap(), XsState::Created);
        join(xs).unwrap();
        assert_eq!(get_state(xs).unwrap(), XsState::Terminated);

        free(xs).unwrap();
    }

    #[test]
    fn migrating_ult_resumes_on_its_new_pools_stream() {
        Runtime::init();
        let xs_a = create_basic().unwrap();
        let xs_b = create_basic().unwrap();
        let pool_a = get_main_pools(xs_a).unwrap()[0].clone();
        let pool_b = get_main_pools(xs_b).unwrap()[0].clone();

        let finished_on_b = Arc::new(AtomicBool::new(false));
        let finished = finished_on_b.clone();
        let pool_b_for_body = pool_b.clone();
        thread_create(
            &pool_a,
            64 * 1024,
            Box::new(move |cx| {
                // Request migration on itself mid-flight, then suspend so
                // the request is only acted on at the post-return safe
                // point (spec §4.5 step 11), not the dispatch-entry one
                // (covered separately below).
                cx.handle().request_migration(pool_b_for_body);
                cx.yield_now();
                finished.store(true, Ordering::SeqCst);
            }),
        );

        start(xs_a).unwrap();
        start(xs_b).unwrap();
        join(xs_a).unwrap();
        join(xs_b).unwrap();

        assert!(finished_on_b.load(Ordering::SeqCst));
    }

    #[test]
    fn migrate_requested_before_first_run_moves_ult_without_running_it_on_source() {
        Runtime::init();
        let xs_a = create_basic().unwrap();
        let xs_b = create_basic().unwrap();
        let pool_a = get_main_pools(xs_a).unwrap()[0].clone();
        let pool_b = get_main_pools(xs_b).unwrap()[0].clone();

        let ran_on: Arc<std::sync::Mutex<Option<XsId>>> = Arc::new(std::sync::Mutex::new(None));
        let ran_on2 = ran_on.clone();
        let u = thread_create(
            &pool_a,
            64 * 1024,
            Box::new(move |_cx| {
                *ran_on2.lock().unwrap() = Runtime::current();
            }),
        );
        // Raised before xs_a ever starts: the dispatch-entry safe point
        // (spec §4.5 ULT path step 2) moves it to pool_b without ever
        // dispatching it on A at all.
        u.request_migration(pool_b);

        start(xs_a).unwrap();
        start(xs_b).unwrap();
        join(xs_a).unwrap();
        join(xs_b).unwrap();

        assert_eq!(*ran_on.lock().unwrap(), Some(xs_b));
    }

    #[test]
    fn migrating_to_a_never_started_xstream_starts_it_automatically() {
        Runtime::init();
        let xs_a = create_basic().unwrap();
        let xs_b = create_basic().unwrap(); // never `start`ed explicitly
        let pool_a = get_main_pools(xs_a).unwrap()[0].clone();
        let pool_b = get_main_pools(xs_b).unwrap()[0].clone();

        let finished_on_b = Arc::new(AtomicBool::new(false));
        let finished = finished_on_b.clone();
        let pool_b_for_body = pool_b.clone();
        thread_create(
            &pool_a,
            64 * 1024,
            Box::new(move |cx| {
                cx.handle().request_migration(pool_b_for_body);
                cx.yield_now();
                finished.store(true, Ordering::SeqCst);
            }),
        );

        assert_eq!(get_state(xs_b).unwrap(), XsState::Created);
        start(xs_a).unwrap();
        join(xs_a).unwrap();
        // B transitioned CREATED -> READY (and on to running its main
        // scheduler) on its own, driven by the migration (spec §4.7 step 6).
        join(xs_b).unwrap();

        assert!(finished_on_b.load(Ordering::SeqCst));
    }

    #[test]
    fn cancelling_a_specific_ult_terminates_it_without_running() {
        Runtime::init();
        let xs = create_basic().unwrap();
        let pool = get_main_pools(xs).unwrap()[0].clone();

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let cancelled = thread_create(
            &pool,
            64 * 1024,
            Box::new(move |_cx| {
                ran2.store(true, Ordering::SeqCst);
            }),
        );
        cancelled.cancel();

        let survivor_ran = Arc::new(AtomicBool::new(false));
        let survivor_ran2 = survivor_ran.clone();
        thread_create(
            &pool,
            64 * 1024,
            Box::new(move |_cx| {
                survivor_ran2.store(true, Ordering::SeqCst);
            }),
        );

        start(xs).unwrap();
        join(xs).unwrap();

        assert!(!ran.load(Ordering::SeqCst));
        assert!(survivor_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cancelling_a_specific_tasklet_terminates_it_without_running() {
        Runtime::init();
        let xs = create_basic().unwrap();
        let pool = get_main_pools(xs).unwrap()[0].clone();

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let cancelled = task_create(
            &pool,
            Box::new(move || {
                ran2.store(true, Ordering::SeqCst);
            }),
        );
        cancelled.cancel();

        let survivor_ran = Arc::new(AtomicBool::new(false));
        let survivor_ran2 = survivor_ran.clone();
        task_create(
            &pool,
            Box::new(move || {
                survivor_ran2.store(true, Ordering::SeqCst);
            }),
        );

        start(xs).unwrap();
        join(xs).unwrap();

        assert!(!ran.load(Ordering::SeqCst));
        assert!(survivor_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn a_ult_can_exit_itself_without_affecting_its_xstream() {
        Runtime::init();
        let xs = create_basic().unwrap();
        let pool = get_main_pools(xs).unwrap()[0].clone();

        thread_create(
            &pool,
            64 * 1024,
            Box::new(|cx| {
                cx.exit();
            }),
        );

        let ran_after = Arc::new(AtomicBool::new(false));
        let ran_after2 = ran_after.clone();
        thread_create(
            &pool,
            64 * 1024,
            Box::new(move |_cx| {
                ran_after2.store(true, Ordering::SeqCst);
            }),
        );

        start(xs).unwrap();
        join(xs).unwrap();

        assert!(ran_after.load(Ordering::SeqCst));
    }

    #[test]
    fn nested_scheduler_drains_its_own_pool_then_returns() {
        Runtime::init();
        let xs = create_basic().unwrap();
        let outer_pool = get_main_pools(xs).unwrap()[0].clone();

        let inner_pool = BasicPool::fifo();
        let inner_ran = Arc::new(AtomicBool::new(false));
        let inner_ran2 = inner_ran.clone();
        task_create(
            &inner_pool,
            Box::new(move || {
                inner_ran2.store(true, Ordering::SeqCst);
            }),
        );

        // `automatic`: this nested scheduler stops as soon as its own
        // pool drains, rather than waiting for an explicit Finish.
        let nested = SchedulerInner::new(vec![inner_pool], SchedHostKind::Ult, Box::new(BasicScheduler::new()), true);
        thread_create_with_sched(&outer_pool, 64 * 1024, nested);

        start(xs).unwrap();
        join(xs).unwrap();

        assert!(inner_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_before_start_abandons_queued_work() {
        Runtime::init();
        let xs = create_basic().unwrap();
        let pool = get_main_pools(xs).unwrap()[0].clone();

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        thread_create(
            &pool,
            64 * 1024,
            Box::new(move |_cx| {
                ran2.store(true, Ordering::SeqCst);
            }),
        );

        cancel(xs).unwrap();
        start(xs).unwrap();
        join(xs).unwrap();

        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn ult_can_exit_its_own_xstream() {
        Runtime::init();
        let xs = create_basic().unwrap();
        let pool = get_main_pools(xs).unwrap()[0].clone();

        thread_create(
            &pool,
            64 * 1024,
            Box::new(|_cx| {
                exit().unwrap();
            }),
        );

        let ran_after = Arc::new(AtomicBool::new(false));
        let ran_after2 = ran_after.clone();
        thread_create(
            &pool,
            64 * 1024,
            Box::new(move |_cx| {
                ran_after2.store(true, Ordering::SeqCst);
            }),
        );

        start(xs).unwrap();
        join(xs).unwrap();

        assert!(!ran_after.load(Ordering::SeqCst));
    }

    #[test]
    fn set_rank_overrides_the_allocated_value() {
        Runtime::init();
        let xs = create_basic().unwrap();

        assert_ne!(get_rank(xs).unwrap(), 4242);
        set_rank(xs, 4242).unwrap();
        assert_eq!(get_rank(xs).unwrap(), 4242);
    }

    #[test]
    fn cancel_rejects_the_primary_without_side_effects() {
        Runtime::init();
        let primary = Runtime::get().unwrap().primary();
        assert_eq!(cancel(primary), Err(Error::InvalidXstream));
        assert_eq!(get_state(primary).unwrap(), XsState::Running);
    }

    #[test]
    fn join_rejects_the_primary() {
        Runtime::init();
        let primary = Runtime::get().unwrap().primary();
        assert_eq!(join(primary), Err(Error::InvalidXstream));
    }

    #[test]
    fn join_rejects_self_join_from_inside_the_target() {
        Runtime::init();
        let xs = create_basic().unwrap();
        let pool = get_main_pools(xs).unwrap()[0].clone();

        let outcome: Arc<std::sync::Mutex<Option<Result<()>>>> = Arc::new(std::sync::Mutex::new(None));
        let outcome2 = outcome.clone();
        thread_create(
            &pool,
            64 * 1024,
            Box::new(move |_cx| {
                *outcome2.lock().unwrap() = Some(join(xs));
            }),
        );

        start(xs).unwrap();
        join(xs).unwrap();

        assert_eq!(outcome.lock().unwrap().take(), Some(Err(Error::InvalidXstream)));
    }

    #[test]
    fn free_rejects_the_primary() {
        Runtime::init();
        let primary = Runtime::get().unwrap().primary();
        assert_eq!(free(primary), Err(Error::InvalidXstream));
    }

    #[test]
    fn exit_from_a_thread_with_no_current_xstream_is_invalid_not_uninitialised() {
        Runtime::init();
        // A plain OS thread the runtime never adopted as an ES: `self_`
        // must report `InvalidXstream`, not `Uninitialised` (spec §8) —
        // the runtime itself is fine, this thread just isn't one of its ESes.
        let outcome = std::thread::spawn(exit).join().unwrap();
        assert_eq!(outcome, Err(Error::InvalidXstream));
    }

    #[test]
    fn num_xstreams_excludes_dead_but_not_yet_freed_xstreams() {
        Runtime::init();
        let baseline = num_xstreams().unwrap();

        let xs = create_basic().unwrap();
        assert_eq!(num_xstreams().unwrap(), baseline + 1);

        // never started: short-circuits CREATED -> TERMINATED (dead).
        join(xs).unwrap();
        assert_eq!(num_xstreams().unwrap(), baseline);

        free(xs).unwrap();
        assert_eq!(num_xstreams().unwrap(), baseline);
    }
}
