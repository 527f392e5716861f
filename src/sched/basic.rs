// sched/basic.rs
//
// Default round-robin scheduler: repeatedly polls each bound pool in
// turn and hands the first hit to the ES (spec §6 "default scheduler").

use crate::sched::{check_events, SchedOps, SchedulerRef, StopMode};
use crate::xstream::Xstream;

/// Round-robins the scheduler's pool set, handing each popped unit to
/// the ES via [`Xstream::run_unit`]. Stops once `Finish` is requested
/// and every pool has drained, or immediately on `Exit`. A scheduler
/// marked `automatic` (spec §6 "automatic scheduler") also stops as soon
/// as its own pools go idle, with no explicit `Finish` required — the
/// shape a nested, scoped scheduler needs so its host ULT can return
/// once there's nothing left for it to do.
pub struct BasicScheduler;

impl BasicScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BasicScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedOps for BasicScheduler {
    fn run(&self, xs: &Xstream, sched: &SchedulerRef) {
        let mut idx = 0usize;
        loop {
            check_events(sched, xs);

            match sched.stop_mode() {
                StopMode::Exit => return,
                StopMode::Finish if sched.pools_idle() => return,
                _ => {}
            }

            if sched.automatic && sched.pools_idle() {
                return;
            }

            if sched.pools.is_empty() {
                if sched.stop_mode() != StopMode::Run {
                    return;
                }
                std::thread::yield_now();
                continue;
            }

            idx %= sched.pools.len();
            let pool = &sched.pools[idx];
            idx += 1;

            match pool.pop() {
                Some(unit) => xs.run_unit(unit),
                None => std::thread::yield_now(),
            }
        }
    }
}
