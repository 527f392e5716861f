// request.rs
//
// Per-ES and per-ULT pending-request bitsets (spec §4.1). Producers set
// bits with fetch-or; the consumer tests-and-clears with fetch-and at a
// documented safe point. Acquire/release throughout — the original
// (original_source/src/stream.c) gets away with relaxed atomics plus a
// volatile read; SPEC_FULL §4 upgrades that to explicit acquire/release.

use std::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// Bits meaningful on an execution stream's request word.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct XsRequest: u32 {
        const JOIN     = 1 << 0;
        const EXIT     = 1 << 1;
        const CANCEL   = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Bits meaningful on a ULT's request word.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct UltRequest: u32 {
        const TERMINATE = 1 << 0;
        const CANCEL    = 1 << 1;
        const EXIT      = 1 << 2;
        const BLOCK     = 1 << 3;
        const MIGRATE   = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Bits meaningful on a tasklet's request word (spec §4.5 tasklet
    /// path step 1: "if CANCEL is set, terminate without running").
    /// Tasklets don't suspend, so only CANCEL applies — there's no
    /// BLOCK/MIGRATE/TERMINATE-by-self analogue for a run-to-completion unit.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TaskletRequest: u32 {
        const CANCEL = 1 << 0;
    }
}

/// An atomic bitset shared by producers (fetch-or) and one consumer
/// (fetch-and, at a safe point).
#[derive(Debug, Default)]
pub struct RequestWord(AtomicU32);

impl RequestWord {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Producer side: OR bits in, return the bits as they were *before*.
    pub fn raise(&self, bits: u32) -> u32 {
        self.0.fetch_or(bits, Ordering::AcqRel)
    }

    /// Consumer side: read without clearing.
    pub fn peek(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Consumer side: clear exactly `bits` and return the value observed
    /// before clearing.
    pub fn take(&self, bits: u32) -> u32 {
        self.0.fetch_and(!bits, Ordering::AcqRel)
    }

    /// Clear everything, returning the prior value.
    pub fn drain(&self) -> u32 {
        self.0.swap(0, Ordering::AcqRel)
    }
}

impl XsRequest {
    pub fn raise_on(word: &RequestWord, bits: Self) {
        word.raise(bits.bits());
    }

    /// Precedence at the ES safe point: EXIT/CANCEL > JOIN.
    pub fn decide(word: &RequestWord) -> Option<Self> {
        let seen = Self::from_bits_truncate(word.peek());
        if seen.intersects(Self::EXIT | Self::CANCEL) {
            Some(seen & (Self::EXIT | Self::CANCEL))
        } else if seen.contains(Self::JOIN) {
            Some(Self::JOIN)
        } else {
            None
        }
    }
}

impl UltRequest {
    pub fn raise_on(word: &RequestWord, bits: Self) {
        word.raise(bits.bits());
    }

    /// Precedence at the ULT safe point: TERMINATE/CANCEL/EXIT > BLOCK > re-push.
    pub fn decide(word: &RequestWord) -> Self {
        Self::from_bits_truncate(word.peek())
    }
}

impl TaskletRequest {
    pub fn raise_on(word: &RequestWord, bits: Self) {
        word.raise(bits.bits());
    }

    pub fn decide(word: &RequestWord) -> Self {
        Self::from_bits_truncate(word.peek())
    }
}
