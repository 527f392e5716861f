//! Runtime-wide configuration. Parsing a config *file* is out of scope —
//! this is a plain struct an embedding application fills in and hands to
//! [`crate::Runtime::init_with`].

/// Default discipline new pools are created with when a caller doesn't
/// specify one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    Fifo,
    Lifo,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stack size (bytes) handed to freshly spawned ULTs that don't
    /// request their own.
    pub default_ult_stack_size: usize,

    /// Target size for a per-ES cache of recycled ULT stacks (see
    /// SPEC_FULL §3). Reserved: no stack recycling is wired up yet, so
    /// this is currently read by nothing.
    pub stack_cache_capacity: usize,

    pub default_pool_discipline: Discipline,

    /// Install a global `tracing` subscriber on `Runtime::init`. Disable
    /// when the embedding application installs its own.
    pub install_tracing: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_ult_stack_size: 256 * 1024,
            stack_cache_capacity: 8,
            default_pool_discipline: Discipline::Fifo,
            install_tracing: cfg!(feature = "tracing-init"),
        }
    }
}
