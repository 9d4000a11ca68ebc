//! Payloads: the injected code an instrumentation point runs.
//!
//! A payload is either a [Snippet] (an inline sequence of instructions with
//! optional one-time bootstrap and scratch data) or a [FunctionCall] (an
//! ABI-correct call into an external function). Payloads live in the
//! [PayloadTable], which is their sole owner; points refer to them by
//! [PayloadIdx], so one payload may serve any number of points.

pub mod funccall;
pub mod snippet;

pub use crate::inst::CellId;
pub use funccall::{Argument, FunctionCall};
pub use snippet::Snippet;

use crate::isa::Isa;
use typed_index_collections::TiVec;

/// Index of a payload in the [PayloadTable].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadIdx(u32);

impl From<usize> for PayloadIdx {
    // Required for TiVec.
    fn from(v: usize) -> Self {
        Self(u32::try_from(v).unwrap())
    }
}

impl From<PayloadIdx> for usize {
    // Required for TiVec.
    fn from(v: PayloadIdx) -> usize {
        v.0 as usize
    }
}

/// One of the two payload variants.
#[derive(Debug)]
pub enum Payload {
    Snippet(Snippet),
    FunctionCall(FunctionCall),
}

impl Payload {
    /// Bytes of output-image space this payload needs, before addresses are
    /// known.
    pub fn size_needed(&self, isa: Isa) -> usize {
        match self {
            Payload::Snippet(s) => s.size_needed(isa),
            Payload::FunctionCall(f) => f.size_needed(isa),
        }
    }

    /// The address a trampoline transfers to. Valid only after layout.
    pub fn entry_point(&self) -> u64 {
        match self {
            Payload::Snippet(s) => s.entry_point(),
            Payload::FunctionCall(f) => f.entry_point(),
        }
    }

    pub fn as_snippet(&self) -> Option<&Snippet> {
        match self {
            Payload::Snippet(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_snippet_mut(&mut self) -> Option<&mut Snippet> {
        match self {
            Payload::Snippet(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionCall> {
        match self {
            Payload::FunctionCall(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_function_mut(&mut self) -> Option<&mut FunctionCall> {
        match self {
            Payload::FunctionCall(f) => Some(f),
            _ => None,
        }
    }

    /// Whether every point targeting this payload must get its own
    /// trampoline rather than joining a chain.
    pub fn requires_distinct_trampoline(&self) -> bool {
        match self {
            Payload::Snippet(s) => s.requires_distinct_trampoline(),
            Payload::FunctionCall(f) => f.requires_distinct_trampoline(),
        }
    }
}

/// Owner of every payload in a rewrite. Shared payloads are identified by
/// index (identity, not value).
#[derive(Debug, Default)]
pub struct PayloadTable {
    payloads: TiVec<PayloadIdx, Payload>,
}

impl PayloadTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, payload: Payload) -> PayloadIdx {
        let idx = self.payloads.next_key();
        let mut payload = payload;
        if let Payload::FunctionCall(f) = &mut payload {
            f.set_index(u32::try_from(usize::from(idx)).unwrap());
        }
        self.payloads.push(payload);
        idx
    }

    pub fn get(&self, idx: PayloadIdx) -> &Payload {
        &self.payloads[idx]
    }

    pub fn get_mut(&mut self, idx: PayloadIdx) -> &mut Payload {
        &mut self.payloads[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = (PayloadIdx, &Payload)> {
        self.payloads.iter_enumerated()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (PayloadIdx, &mut Payload)> {
        self.payloads.iter_mut_enumerated()
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}
