//! Instrumentation points and their registry.
//!
//! A point binds a payload to one decoded host instruction. The registry
//! owns every point, keeps them ordered on `(source address, priority)`, and
//! enforces the registration-time safety rules: no duplicate priority at an
//! address, no overwrite region clobbering a branch target, nothing after
//! `freeze()`.

use crate::{
    errors::RewriteError,
    inst::{CodeMap, Instruction},
    isa::FlagsProtect,
    payload::PayloadIdx,
};
use fxhash::FxHashMap;
use std::{fmt, ops::Range};
use strum_macros::{Display, FromRepr};
use typed_index_collections::TiVec;

/// Index of a point in the [PointRegistry].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointIdx(u32);

impl From<usize> for PointIdx {
    // Required for TiVec.
    fn from(v: usize) -> Self {
        Self(u32::try_from(v).unwrap())
    }
}

impl From<PointIdx> for usize {
    // Required for TiVec.
    fn from(v: PointIdx) -> usize {
        v.0 as usize
    }
}

/// Chain order of points sharing one source address. Lower runs first. The
/// numeric values are the persisted form and must not change.
#[derive(Debug, Display, FromRepr, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    Undefined = 0,
    SysInit = 1,
    UserInit = 2,
    Regular = 3,
}

/// Where the trampoline's first instruction sits relative to the original:
/// injected code before it, instead of it, or after it.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum InstLocation {
    Prior,
    Replace,
    After,
}

/// How the payload body is reached.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum InstMode {
    /// Body bytes expanded directly into the trampoline (small snippets).
    InlineSnippet,
    /// Near call from the trampoline to the payload's entry.
    Trampolined,
}

/// One instrumentation request: payload, program point, and composition
/// attributes.
#[derive(Debug)]
pub struct InstrumentationPoint {
    inst: Instruction,
    payload: PayloadIdx,
    location: InstLocation,
    protection: FlagsProtect,
    mode: InstMode,
    priority: Priority,
    precursors: Vec<Instruction>,
    postcursors: Vec<Instruction>,
    /// The whole instructions covered by the overwrite region.
    overwritten: Vec<Instruction>,
    number_of_bytes: u32,
}

impl InstrumentationPoint {
    pub(crate) fn new(
        inst: Instruction,
        payload: PayloadIdx,
        location: InstLocation,
        protection: FlagsProtect,
        mode: InstMode,
        priority: Priority,
        overwritten: Vec<Instruction>,
    ) -> Self {
        debug_assert!(priority != Priority::Undefined);
        let number_of_bytes = overwritten.iter().map(|i| i.len() as u32).sum();
        Self {
            inst,
            payload,
            location,
            protection,
            mode,
            priority,
            precursors: Vec::new(),
            postcursors: Vec::new(),
            overwritten,
            number_of_bytes,
        }
    }

    pub fn source_address(&self) -> u64 {
        self.inst.addr()
    }

    /// Address immediately past the overwrite region; every chain's final
    /// trampoline jumps here.
    pub fn return_address(&self) -> u64 {
        self.source_address() + u64::from(self.number_of_bytes)
    }

    pub fn number_of_bytes(&self) -> u32 {
        self.number_of_bytes
    }

    pub fn payload(&self) -> PayloadIdx {
        self.payload
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn location(&self) -> InstLocation {
        self.location
    }

    pub fn protection(&self) -> FlagsProtect {
        self.protection
    }

    pub fn mode(&self) -> InstMode {
        self.mode
    }

    pub fn precursors(&self) -> &[Instruction] {
        &self.precursors
    }

    pub fn postcursors(&self) -> &[Instruction] {
        &self.postcursors
    }

    pub(crate) fn overwritten(&self) -> &[Instruction] {
        &self.overwritten
    }
}

impl fmt::Display for InstrumentationPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "point @ {:#x} {} {} {} flags {} overwrite {} bytes",
            self.source_address(),
            self.priority,
            self.location,
            self.mode,
            self.protection,
            self.number_of_bytes
        )
    }
}

/// Owner of every instrumentation point.
#[derive(Debug, Default)]
pub struct PointRegistry {
    points: TiVec<PointIdx, InstrumentationPoint>,
    by_addr: FxHashMap<u64, Vec<PointIdx>>,
    frozen: bool,
}

impl PointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a point. Rejects registrations after [Self::freeze], a
    /// second point with the same priority at the same address, and
    /// overwrite regions that cover a branch target or overlap another
    /// point's region.
    pub fn register(
        &mut self,
        point: InstrumentationPoint,
        code: &CodeMap,
    ) -> Result<PointIdx, RewriteError> {
        if self.frozen {
            return Err(RewriteError::RegistryFrozen);
        }
        let addr = point.source_address();
        let region = addr..addr + u64::from(point.number_of_bytes());

        if let Some(peers) = self.by_addr.get(&addr) {
            if peers
                .iter()
                .any(|&p| self.points[p].priority() == point.priority())
            {
                return Err(RewriteError::DuplicatePriorityAtAddress {
                    addr,
                    priority: point.priority(),
                });
            }
        }

        // Branch-target safety: nothing may branch into the middle of the
        // overwrite region.
        if code.branch_target_within(region.clone()).is_some() {
            return Err(RewriteError::UnsafeOverwrite {
                addr,
                len: point.number_of_bytes(),
                what: "overwrite region covers a branch target",
            });
        }

        // Regions of points at *different* addresses must not overlap.
        for other in self.points.iter() {
            if other.source_address() == addr {
                continue;
            }
            let o = other.source_address()..other.return_address();
            if region.start < o.end && o.start < region.end {
                return Err(RewriteError::UnsafeOverwrite {
                    addr,
                    len: point.number_of_bytes(),
                    what: "overwrite region overlaps another point's region",
                });
            }
        }

        let idx = self.points.next_key();
        self.by_addr.entry(addr).or_default().push(idx);
        self.points.push(point);
        self.sort_addr_group(addr);
        Ok(idx)
    }

    fn sort_addr_group(&mut self, addr: u64) {
        let points = &self.points;
        if let Some(group) = self.by_addr.get_mut(&addr) {
            group.sort_by_key(|&p| points[p].priority());
        }
    }

    /// Points at `addr`, ascending priority (SysInit runs first).
    pub fn points_at(&self, addr: u64) -> &[PointIdx] {
        self.by_addr.get(&addr).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Points whose source address falls in `range`, ordered on
    /// `(address, priority)`.
    pub fn filter_by_range(&self, range: Range<u64>) -> Vec<PointIdx> {
        let mut out: Vec<PointIdx> = self
            .points
            .iter_enumerated()
            .filter(|(_, p)| range.contains(&p.source_address()))
            .map(|(i, _)| i)
            .collect();
        out.sort_by_key(|&i| (self.points[i].source_address(), self.points[i].priority()));
        out
    }

    /// Every point, ordered on `(address, priority)`.
    pub fn sorted_points(&self) -> Vec<PointIdx> {
        self.filter_by_range(0..u64::MAX)
    }

    /// Ascending list of distinct source addresses.
    pub fn unique_addresses(&self) -> Vec<u64> {
        let mut addrs: Vec<u64> = self.by_addr.keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }

    /// Freeze the registry: all later registrations and mutations fail with
    /// [RewriteError::RegistryFrozen].
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn point(&self, idx: PointIdx) -> &InstrumentationPoint {
        &self.points[idx]
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PointIdx, &InstrumentationPoint)> {
        self.points.iter_enumerated()
    }

    /// Reverse lookup: the points targeting a payload.
    pub fn points_of_payload(&self, payload: PayloadIdx) -> Vec<PointIdx> {
        self.points
            .iter_enumerated()
            .filter(|(_, p)| p.payload == payload)
            .map(|(i, _)| i)
            .collect()
    }

    /// Append fixed prologue glue around the payload call.
    pub fn add_precursor(&mut self, idx: PointIdx, inst: Instruction) -> Result<(), RewriteError> {
        if self.frozen {
            return Err(RewriteError::RegistryFrozen);
        }
        self.points[idx].precursors.push(inst);
        Ok(())
    }

    /// Append fixed epilogue glue around the payload call.
    pub fn add_postcursor(&mut self, idx: PointIdx, inst: Instruction) -> Result<(), RewriteError> {
        if self.frozen {
            return Err(RewriteError::RegistryFrozen);
        }
        self.points[idx].postcursors.push(inst);
        Ok(())
    }

    /// Change a point's priority, re-checking the per-address uniqueness
    /// rule.
    pub fn set_priority(&mut self, idx: PointIdx, priority: Priority) -> Result<(), RewriteError> {
        if self.frozen {
            return Err(RewriteError::RegistryFrozen);
        }
        assert!(priority != Priority::Undefined);
        let addr = self.points[idx].source_address();
        if self
            .points_at(addr)
            .iter()
            .any(|&p| p != idx && self.points[p].priority() == priority)
        {
            return Err(RewriteError::DuplicatePriorityAtAddress { addr, priority });
        }
        self.points[idx].priority = priority;
        self.sort_addr_group(addr);
        Ok(())
    }
}
