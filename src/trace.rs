// trace.rs
//
// Thin `tracing` helpers so call sites read `trace::xs_state(...)` instead
// of repeating target/field names (spec ambient logging, grounded in the
// teacher's own `nonosctl` sibling crate's use of `tracing`).

use crate::xstream::{XsId, XsState};

pub fn xs_state_change(xs: XsId, from: XsState, to: XsState) {
    tracing::debug!(target: "xstream_rt::xstream", xs = xs.raw(), ?from, ?to, "state transition");
}

pub fn xs_request_raised(xs: XsId, bits: u32) {
    tracing::trace!(target: "xstream_rt::xstream", xs = xs.raw(), bits, "request word raised");
}

pub fn ult_request_raised(bits: u32) {
    tracing::trace!(target: "xstream_rt::ult", bits, "request word raised");
}

pub fn migration(xs: XsId) {
    tracing::debug!(target: "xstream_rt::ult", xs = xs.raw(), "ult migrated");
}

pub fn error(err: &crate::error::Error) {
    tracing::warn!(target: "xstream_rt::error", %err, "runtime error");
}
