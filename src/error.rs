//! Error kinds returned by the runtime's public surface.
//!
//! State-transition failures caused by a losing CAS are not represented
//! here: they reduce to no-ops (double `start`, etc.) per spec §7.
//! Internal logic violations (unknown unit kind, a null scheduler where
//! one is required) are implementer bugs and `panic!` instead, matching
//! the teacher's own `.expect("...")` style for invariant violations.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("runtime not initialised")]
    Uninitialised,

    #[error("invalid execution stream handle")]
    InvalidXstream,

    #[error("invalid work unit handle")]
    InvalidUnit,

    #[error("invalid scheduler handle")]
    InvalidSched,

    #[error("operation not valid in the handle's current state")]
    WrongState,

    #[error("allocation failed")]
    OutOfMemory,

    #[error("pool already bound to a different execution stream")]
    PoolAlreadyBound,
}

pub type Result<T> = core::result::Result<T, Error>;
