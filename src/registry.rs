// registry.rs
//
// Process-wide runtime state: the live execution-stream registry, rank
// allocation, and the primary ES. Handles are validated against this
// registry rather than trusted as raw pointers (spec §3 Ownership).
// Backed by `once_cell` the way the teacher backs its global kernel
// singletons with `lazy_static` (userspace analogue, see Cargo.toml).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::config::RuntimeConfig;
use crate::context::{ContextOps, ThreadContext};
use crate::error::{Error, Result};
use crate::pool::BasicPool;
use crate::sched::{BasicScheduler, SchedHostKind, SchedulerInner};
use crate::xstream::{alloc_xs_id, XsId, XsKind, XstreamInner};

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

thread_local! {
    /// The ES the calling OS thread is executing as, if any. Set by
    /// `main_loop` before the main scheduler runs; read by `Runtime::self_`.
    static CURRENT_XS: std::cell::Cell<Option<XsId>> = std::cell::Cell::new(None);
}

pub(crate) fn set_current(xs: Option<XsId>) {
    CURRENT_XS.with(|c| c.set(xs));
}

/// Process-wide handle table and bookkeeping for every execution stream
/// the runtime knows about (spec §4.1 "ES registry").
pub struct Runtime {
    config: RuntimeConfig,
    rank_alloc: AtomicU64,
    streams: RwLock<HashMap<u64, Arc<XstreamInner>>>,
    primary: OnceCell<XsId>,
    ctx: Arc<dyn ContextOps>,
}

impl Runtime {
    /// Initialise the process-wide runtime with default configuration.
    /// Installs a `tracing` subscriber per `config.install_tracing`
    /// (spec ambient logging). Idempotent: a second call is a no-op.
    pub fn init() -> &'static Runtime {
        Self::init_with(RuntimeConfig::default())
    }

    pub fn init_with(config: RuntimeConfig) -> &'static Runtime {
        RUNTIME.get_or_init(|| {
            if config.install_tracing {
                #[cfg(feature = "tracing-init")]
                {
                    let _ = tracing_subscriber::fmt()
                        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                        .try_init();
                }
            }
            let rt = Runtime {
                config,
                rank_alloc: AtomicU64::new(0),
                streams: RwLock::new(HashMap::new()),
                primary: OnceCell::new(),
                ctx: Arc::new(ThreadContext::new()),
            };
            rt.register_primary();
            rt
        })
    }

    pub fn get() -> Result<&'static Runtime> {
        RUNTIME.get().ok_or(Error::Uninitialised)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Wrap the OS thread that called `init` as the primary ES (spec §4.2
    /// "the calling thread becomes the primary execution stream").
    fn register_primary(&self) {
        let id = alloc_xs_id();
        let rank = self.rank_alloc.fetch_add(1, Ordering::Relaxed);
        let main_sched = SchedulerInner::new(
            vec![BasicPool::fifo()],
            SchedHostKind::Ult,
            Box::new(BasicScheduler::new()),
            false, // the primary ES's main scheduler is a persistent service loop
        );
        let inner = XstreamInner::new(id, rank, XsKind::Primary, main_sched, self.ctx.clone());
        inner.mark_running();
        self.streams.write().insert(id.raw(), inner);
        let _ = self.primary.set(id);
        set_current(Some(id));
    }

    pub fn primary(&self) -> XsId {
        *self.primary.get().expect("primary ES registered on init")
    }

    /// Register a newly created (not yet started) secondary ES.
    pub(crate) fn register(&self, inner: Arc<XstreamInner>) {
        self.streams.write().insert(inner.id().raw(), inner);
    }

    pub(crate) fn lookup(&self, id: XsId) -> Option<Arc<XstreamInner>> {
        self.streams.read().get(&id.raw()).cloned()
    }

    pub(crate) fn unregister(&self, id: XsId) {
        self.streams.write().remove(&id.raw());
    }

    pub(crate) fn next_rank(&self) -> u64 {
        self.rank_alloc.fetch_add(1, Ordering::Relaxed)
    }

    /// Sum of the created and active registry sizes; dead (terminated,
    /// awaiting `free`) ESes are excluded (spec §6 `ABT_xstream_get_num`,
    /// spec §8 Boundaries — mirrored here under the name the original
    /// exposes at the runtime level).
    pub fn num_xstreams(&self) -> usize {
        self.streams
            .read()
            .values()
            .filter(|xs| xs.state() != crate::xstream::XsState::Terminated)
            .count()
    }

    pub(crate) fn ctx(&self) -> Arc<dyn ContextOps> {
        self.ctx.clone()
    }

    /// The ES the calling OS thread is currently executing as.
    pub fn current() -> Option<XsId> {
        CURRENT_XS.with(|c| c.get())
    }

    /// Tear down: request EXIT on every still-live secondary ES and drop
    /// the registry. Does not join — callers that need a clean drain
    /// should `join` each ES themselves first (spec §4.2 shutdown note).
    pub fn finalize(&self) {
        let mut streams = self.streams.write();
        for (_, xs) in streams.drain() {
            xs.cancel();
        }
    }
}
