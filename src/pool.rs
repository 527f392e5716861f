// pool.rs
//
// Pool: abstract runnable container with push/pop/remove and a bound
// consumer ES (spec §3, §4.5 invariant: at most one consumer per pool).
// Pool *internals* are an out-of-scope collaborator per spec §1 — what's
// specified is the contract, not the data structure, so the built-in
// pools below generalize the teacher's `Mutex<VecDeque<Task>>` queue
// (sched/scheduler.rs) rather than a hand-rolled intrusive list.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Discipline;
use crate::error::{Error, Result};
use crate::unit::{Unit, UnitKind};
use crate::xstream::XsId;

/// Capability set a scheduler consumes a pool through.
pub trait Pool: Send + Sync {
    /// Add a unit, per the pool's discipline.
    fn push(&self, unit: Unit);

    /// Remove the next unit to run, if any.
    fn pop(&self) -> Option<Unit>;

    /// Remove a specific unit wherever it sits in the pool. Returns
    /// whether it was present.
    fn remove(&self, unit: &Unit) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The ES currently bound as this pool's consumer, if any.
    fn consumer(&self) -> Option<XsId>;

    /// Bind `xs` as this pool's consumer. Fails if a *different* ES is
    /// already bound (spec §3 invariant).
    fn set_consumer(&self, xs: XsId) -> Result<()>;

    /// Release the consumer binding (used when a scheduler is popped off
    /// an ES's stack or discarded).
    fn clear_consumer(&self, xs: XsId);

    fn num_migrations(&self) -> i64;
    fn note_migration_in(&self);
    fn note_migration_out(&self);
}

/// get_type/get_thread/get_task from spec §6, as free functions over
/// `Unit` rather than methods on `Pool` — they don't need the pool.
pub fn get_type(unit: &Unit) -> UnitKind {
    unit.kind()
}

pub fn get_thread(unit: &Unit) -> Option<Arc<crate::ult::UltInner>> {
    unit.as_ult()
}

pub fn get_task(unit: &Unit) -> Option<Arc<crate::tasklet::TaskletInner>> {
    unit.as_tasklet()
}

pub type PoolHandle = Arc<dyn Pool>;

/// Built-in FIFO/LIFO pool. `Discipline::Fifo` pops from the front of
/// push order; `Discipline::Lifo` pops the most recently pushed.
pub struct BasicPool {
    discipline: Discipline,
    items: Mutex<VecDeque<Unit>>,
    consumer: Mutex<Option<XsId>>,
    num_migrations: AtomicI64,
}

impl BasicPool {
    pub fn new(discipline: Discipline) -> PoolHandle {
        Arc::new(Self {
            discipline,
            items: Mutex::new(VecDeque::new()),
            consumer: Mutex::new(None),
            num_migrations: AtomicI64::new(0),
        })
    }

    pub fn fifo() -> PoolHandle {
        Self::new(Discipline::Fifo)
    }

    pub fn lifo() -> PoolHandle {
        Self::new(Discipline::Lifo)
    }
}

impl Pool for BasicPool {
    fn push(&self, unit: Unit) {
        unit.set_owning_pool(None); // caller sets it after a successful push
        self.items.lock().push_back(unit);
    }

    fn pop(&self) -> Option<Unit> {
        let mut items = self.items.lock();
        match self.discipline {
            Discipline::Fifo => items.pop_front(),
            Discipline::Lifo => items.pop_back(),
        }
    }

    fn remove(&self, unit: &Unit) -> bool {
        let mut items = self.items.lock();
        if let Some(pos) = items.iter().position(|u| u == unit) {
            items.remove(pos);
            true
        } else {
            false
        }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn consumer(&self) -> Option<XsId> {
        *self.consumer.lock()
    }

    fn set_consumer(&self, xs: XsId) -> Result<()> {
        let mut cur = self.consumer.lock();
        match *cur {
            Some(existing) if existing != xs => Err(Error::PoolAlreadyBound),
            _ => {
                *cur = Some(xs);
                Ok(())
            }
        }
    }

    fn clear_consumer(&self, xs: XsId) {
        let mut cur = self.consumer.lock();
        if *cur == Some(xs) {
            *cur = None;
        }
    }

    fn num_migrations(&self) -> i64 {
        self.num_migrations.load(Ordering::Relaxed)
    }

    fn note_migration_in(&self) {
        self.num_migrations.fetch_add(1, Ordering::Relaxed);
    }

    fn note_migration_out(&self) {
        self.num_migrations.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Atomically bind every pool in `pools` to `xs`, rolling back on the
/// first failure (spec §4.4 consumer-binding invariant).
pub fn bind_all(pools: &[PoolHandle], xs: XsId) -> Result<()> {
    for (i, p) in pools.iter().enumerate() {
        if let Err(e) = p.set_consumer(xs) {
            for p in &pools[..i] {
                p.clear_consumer(xs);
            }
            return Err(e);
        }
    }
    Ok(())
}

pub fn unbind_all(pools: &[PoolHandle], xs: XsId) {
    for p in pools {
        p.clear_consumer(xs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasklet::TaskletInner;

    fn dummy_unit() -> Unit {
        Unit::Tasklet(TaskletInner::new(Box::new(|| {})))
    }

    #[test]
    fn fifo_order() {
        let p = BasicPool::fifo();
        let a = dummy_unit();
        let b = dummy_unit();
        p.push(a.clone());
        p.push(b.clone());
        assert!(p.pop().unwrap() == a);
        assert!(p.pop().unwrap() == b);
    }

    #[test]
    fn lifo_order() {
        let p = BasicPool::lifo();
        let a = dummy_unit();
        let b = dummy_unit();
        p.push(a.clone());
        p.push(b.clone());
        assert!(p.pop().unwrap() == b);
        assert!(p.pop().unwrap() == a);
    }

    #[test]
    fn consumer_binding_conflict() {
        let p = BasicPool::fifo();
        p.set_consumer(XsId::from_raw(1)).unwrap();
        assert_eq!(p.set_consumer(XsId::from_raw(2)), Err(Error::PoolAlreadyBound));
        assert!(p.set_consumer(XsId::from_raw(1)).is_ok());
    }
}
