//! Errors surfaced by the instrumentation core.

use crate::{isa::Region, point::Priority};
use thiserror::Error;

/// Reasons a registration is rejected or a rewrite aborts.
///
/// The first three variants are non-fatal: the offending registration is
/// rejected and the rewrite proceeds with the accepted subset. The remaining
/// variants are fatal and abort the rewrite before the output file is
/// written.
#[derive(Debug, Error)]
pub enum RewriteError {
    /// Two points with the same priority were registered at one address.
    #[error("a point with priority {priority} is already registered at {addr:#x}")]
    DuplicatePriorityAtAddress { addr: u64, priority: Priority },

    /// The overwrite region would clobber a branch target, or the source
    /// address does not sit on an instruction boundary.
    #[error("unsafe overwrite of {len} bytes at {addr:#x}: {what}")]
    UnsafeOverwrite {
        addr: u64,
        len: u32,
        what: &'static str,
    },

    /// Registration was attempted after the registry was frozen.
    #[error("registry is frozen; registration rejected")]
    RegistryFrozen,

    /// A trampoline cannot reach its target with a near jump or call.
    #[error("trampoline at {from:#x} cannot reach {to:#x} with a near branch")]
    TrampolineTooFar { from: u64, to: u64 },

    /// A generator produced more bytes than its reserved region. This
    /// indicates an encoding bug, not bad input.
    #[error("{region} emitted {got} bytes, exceeding its {reserve}-byte reserve")]
    PayloadSizeExceedsReserve {
        region: Region,
        got: usize,
        reserve: usize,
    },

    /// Post-layout verification found an inconsistency.
    #[error("verification failed: {0}")]
    VerifyFailed(String),

    /// The parsed image is missing something the core needs.
    #[error("image: {0}")]
    Image(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl RewriteError {
    /// Non-fatal errors reject one registration; fatal errors abort the
    /// whole rewrite.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RewriteError::DuplicatePriorityAtAddress { .. }
                | RewriteError::UnsafeOverwrite { .. }
                | RewriteError::RegistryFrozen
        )
    }
}
