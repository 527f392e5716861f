// unit.rs
//
// Work unit: tagged union of ULT and tasklet (spec §3 "Work unit").
// Common fields live on both inner types; `Unit` is the value schedulers
// and pools actually move around.

use std::sync::Arc;

use crate::pool::PoolHandle;
use crate::request::RequestWord;
use crate::sched::SchedulerRef;
use crate::tasklet::TaskletInner;
use crate::ult::UltInner;
use crate::xstream::XsId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnitKind {
    Ult,
    Tasklet,
}

/// A work unit as stored in a pool. Cheap to clone (Arc bump).
#[derive(Clone)]
pub enum Unit {
    Ult(Arc<UltInner>),
    Tasklet(Arc<TaskletInner>),
}

impl Unit {
    pub fn kind(&self) -> UnitKind {
        match self {
            Unit::Ult(_) => UnitKind::Ult,
            Unit::Tasklet(_) => UnitKind::Tasklet,
        }
    }

    pub fn request(&self) -> &RequestWord {
        match self {
            Unit::Ult(u) => &u.request,
            Unit::Tasklet(t) => &t.request,
        }
    }

    pub fn owning_pool(&self) -> Option<PoolHandle> {
        match self {
            Unit::Ult(u) => u.owning_pool.lock().clone(),
            Unit::Tasklet(t) => t.owning_pool.lock().clone(),
        }
    }

    pub fn set_owning_pool(&self, pool: Option<PoolHandle>) {
        match self {
            Unit::Ult(u) => *u.owning_pool.lock() = pool,
            Unit::Tasklet(t) => *t.owning_pool.lock() = pool,
        }
    }

    pub fn last_xstream(&self) -> Option<XsId> {
        match self {
            Unit::Ult(u) => u.last_xstream.lock().clone(),
            Unit::Tasklet(t) => t.last_xstream.lock().clone(),
        }
    }

    pub fn set_last_xstream(&self, xs: Option<XsId>) {
        match self {
            Unit::Ult(u) => *u.last_xstream.lock() = xs,
            Unit::Tasklet(t) => *t.last_xstream.lock() = xs,
        }
    }

    /// Non-null iff this unit hosts a nested scheduler.
    pub fn is_sched(&self) -> Option<SchedulerRef> {
        match self {
            Unit::Ult(u) => u.is_sched.lock().clone(),
            Unit::Tasklet(t) => t.is_sched.lock().clone(),
        }
    }

    pub fn as_ult(&self) -> Option<Arc<UltInner>> {
        match self {
            Unit::Ult(u) => Some(u.clone()),
            Unit::Tasklet(_) => None,
        }
    }

    pub fn as_tasklet(&self) -> Option<Arc<TaskletInner>> {
        match self {
            Unit::Tasklet(t) => Some(t.clone()),
            Unit::Ult(_) => None,
        }
    }
}

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Unit::Ult(a), Unit::Ult(b)) => Arc::ptr_eq(a, b),
            (Unit::Tasklet(a), Unit::Tasklet(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
