//! Address assignment and the two-phase encode.
//!
//! Layout runs once, after the registry is frozen, in five ordered passes:
//! size tally, trampoline placement, payload placement, relocation
//! computation, and the phase-2 encode. It is deterministic: the same
//! registered point set always produces the same addresses and bytes.

use crate::{
    addr::next_aligned,
    errors::RewriteError,
    image::ImageModel,
    isa::{nop_pad, Isa, Region, SIZE_UNCOND_JUMP, TRAMPOLINE_AUTOINC},
    payload::{Payload, PayloadIdx, PayloadTable},
    point::{PointIdx, PointRegistry},
    trampoline, Context,
};
use fxhash::FxHashMap;
use log::debug;
use std::fmt::Write as _;
use strum_macros::Display;

/// The trampoline arena starts on a page boundary.
const PAGE_ALIGN: u64 = 0x1000;

/// A placed trampoline: entry address plus final bytes.
#[derive(Debug, Default, Clone)]
pub struct TrampolineImage {
    pub entry: u64,
    pub size: u32,
    pub bytes: Vec<u8>,
}

/// The jump+nop overwrite for one source address.
#[derive(Debug, Clone)]
pub struct SitePatch {
    pub addr: u64,
    pub bytes: Vec<u8>,
}

/// The sub-arena a placed region belongs to.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    #[strum(serialize = "snippet code")]
    SnippetCode,
    #[strum(serialize = "snippet data")]
    SnippetData,
    #[strum(serialize = "wrapper")]
    Wrapper,
    #[strum(serialize = "bootstrap")]
    Bootstrap,
    #[strum(serialize = "procedure link")]
    ProcedureLink,
    #[strum(serialize = "global data")]
    GlobalData,
}

/// Final bytes of one payload region.
#[derive(Debug, Clone)]
pub struct RegionImage {
    pub kind: RegionKind,
    pub payload: PayloadIdx,
    pub addr: u64,
    pub bytes: Vec<u8>,
}

/// The result of a layout run: every address and every byte the emitter
/// writes, except the untouched remainder of the original image.
#[derive(Debug)]
pub struct Layout {
    tramp_base: u64,
    arena_capacity: u64,
    arena_used: u64,
    tramps: Vec<TrampolineImage>,
    site_patches: Vec<SitePatch>,
    regions: Vec<RegionImage>,
    end: u64,
}

impl Layout {
    pub fn trampoline_arena_base(&self) -> u64 {
        self.tramp_base
    }

    pub fn trampoline_arena_capacity(&self) -> u64 {
        self.arena_capacity
    }

    pub fn trampoline_arena_used(&self) -> u64 {
        self.arena_used
    }

    pub fn trampoline(&self, idx: PointIdx) -> &TrampolineImage {
        &self.tramps[usize::from(idx)]
    }

    pub fn site_patches(&self) -> &[SitePatch] {
        &self.site_patches
    }

    pub fn regions(&self) -> &[RegionImage] {
        &self.regions
    }

    /// First address past everything layout placed.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Human-readable dump of the whole placement, one line per trampoline
    /// and region.
    pub fn dump(&self, registry: &PointRegistry) -> String {
        let mut out = String::new();
        writeln!(
            out,
            "trampoline arena @ {:#x} capacity {:#x} used {:#x}",
            self.tramp_base, self.arena_capacity, self.arena_used
        )
        .unwrap();
        for idx in registry.sorted_points() {
            let p = registry.point(idx);
            let t = self.trampoline(idx);
            writeln!(
                out,
                "  point {} @ {:#x} {} {} tramp {:#x} size {}",
                usize::from(idx),
                p.source_address(),
                p.priority(),
                p.mode(),
                t.entry,
                t.size,
            )
            .unwrap();
        }
        for patch in &self.site_patches {
            writeln!(
                out,
                "  patch @ {:#x} {}",
                patch.addr,
                hex::encode(&patch.bytes)
            )
            .unwrap();
        }
        for r in &self.regions {
            writeln!(
                out,
                "region {} payload {} @ {:#x} len {}",
                r.kind,
                usize::from(r.payload),
                r.addr,
                r.bytes.len()
            )
            .unwrap();
        }
        out
    }
}

/// Run the five layout passes. Mutates payloads only to record their
/// assigned addresses, so a second run over an unchanged registry is
/// byte-identical.
pub(crate) fn run(
    ctx: &Context,
    isa: Isa,
    image: &dyn ImageModel,
    registry: &PointRegistry,
    payloads: &mut PayloadTable,
) -> Result<Layout, RewriteError> {
    debug_assert!(registry.is_frozen());
    let order = registry.sorted_points();
    let addrs = registry.unique_addresses();

    // Pass 1: size tally.
    debug!("layout pass 1: sizing {} points", order.len());
    let mut sizes: FxHashMap<PointIdx, usize> = FxHashMap::default();
    for addr in &addrs {
        let group = registry.points_at(*addr);
        for (i, &idx) in group.iter().enumerate() {
            let point = registry.point(idx);
            let payload = payloads.get(point.payload());
            let is_last = i + 1 == group.len();
            sizes.insert(
                idx,
                trampoline::measure(point, payload, isa, &ctx.config, is_last),
            );
        }
    }

    // Pass 2: trampoline placement, first-fit in (address, priority) order.
    let tramp_base = next_aligned(image.extension_code_base(), PAGE_ALIGN);
    let mut capacity = TRAMPOLINE_AUTOINC;
    let mut cursor = tramp_base;
    let mut tramps = vec![TrampolineImage::default(); registry.len()];
    for &idx in &order {
        let size = sizes[&idx];
        while cursor + size as u64 - tramp_base > capacity {
            capacity += TRAMPOLINE_AUTOINC;
            debug!("trampoline arena grown to {capacity:#x}");
        }
        tramps[usize::from(idx)] = TrampolineImage {
            entry: cursor,
            size: size as u32,
            bytes: Vec::new(),
        };
        cursor += size as u64;
    }
    let arena_used = cursor - tramp_base;

    // Pass 3: payload placement. Snippet bodies and data sit right after
    // the arena; function-call regions get four contiguous sub-arenas so
    // the emitter can give each one its own section treatment.
    let mut pcur = tramp_base + capacity;
    for (_, payload) in payloads.iter_mut() {
        if let Payload::Snippet(s) = payload {
            s.set_code_addr(pcur);
            pcur += (s.bootstrap_size() + s.body_size()) as u64;
        }
    }
    for (_, payload) in payloads.iter_mut() {
        if let Payload::Snippet(s) = payload {
            pcur = next_aligned(pcur, 8);
            s.set_data_addr(pcur);
            pcur += s.data_size();
        }
    }

    let mut wrapper_addrs = FxHashMap::default();
    let mut bootstrap_addrs = FxHashMap::default();
    let mut proclink_addrs = FxHashMap::default();
    let mut data_addrs = FxHashMap::default();
    for (pidx, payload) in payloads.iter() {
        if payload.as_function().is_some() {
            pcur = next_aligned(pcur, 16);
            wrapper_addrs.insert(pidx, pcur);
            pcur += isa.reserved_size(Region::Wrapper) as u64;
        }
    }
    for (pidx, payload) in payloads.iter() {
        if payload.as_function().is_some() {
            pcur = next_aligned(pcur, 16);
            bootstrap_addrs.insert(pidx, pcur);
            pcur += isa.reserved_size(Region::Bootstrap) as u64;
        }
    }
    for (pidx, payload) in payloads.iter() {
        if payload.as_function().is_some() {
            pcur = next_aligned(pcur, 16);
            proclink_addrs.insert(pidx, pcur);
            pcur += isa.reserved_size(Region::ProcedureLink) as u64;
        }
    }
    pcur = next_aligned(pcur.max(image.extension_data_base()), 16);
    for (pidx, payload) in payloads.iter() {
        if let Payload::FunctionCall(f) = payload {
            pcur = next_aligned(pcur, 16);
            data_addrs.insert(pidx, pcur);
            pcur += f.global_data_size(isa);
        }
    }
    for (pidx, payload) in payloads.iter_mut() {
        if let Payload::FunctionCall(f) = payload {
            f.set_addrs(
                wrapper_addrs[&pidx],
                bootstrap_addrs[&pidx],
                proclink_addrs[&pidx],
                data_addrs[&pidx],
            );
        }
    }
    let end = pcur;

    // Pass 4: relocation computation — the per-site overwrite bytes.
    debug!("layout pass 4: patch computation for {} sites", addrs.len());
    let mut site_patches = Vec::with_capacity(addrs.len());
    for &addr in &addrs {
        let group = registry.points_at(addr);
        let n = registry.point(group[0]).number_of_bytes();
        debug_assert!(group
            .iter()
            .all(|&p| registry.point(p).number_of_bytes() == n));
        let first = tramps[usize::from(group[0])].entry;
        let jmp = isa
            .encode_jump_near(addr, first)
            .ok_or(RewriteError::TrampolineTooFar {
                from: addr,
                to: first,
            })?;
        let mut bytes = jmp.to_vec();
        nop_pad(&mut bytes, n as usize);
        site_patches.push(SitePatch { addr, bytes });
    }

    // Pass 5: phase-2 encode with final addresses.
    for &addr in &addrs {
        let group = registry.points_at(addr);
        for (i, &idx) in group.iter().enumerate() {
            let point = registry.point(idx);
            let payload = payloads.get(point.payload());
            let is_last = i + 1 == group.len();
            let tail = if is_last {
                point.return_address()
            } else {
                tramps[usize::from(group[i + 1])].entry
            };
            let entry = tramps[usize::from(idx)].entry;
            let bytes =
                trampoline::encode(point, payload, isa, &ctx.config, entry, tail, is_last)?;
            if bytes.len() != sizes[&idx] {
                return Err(RewriteError::VerifyFailed(format!(
                    "trampoline for point {} re-encoded to {} bytes, sized {}",
                    usize::from(idx),
                    bytes.len(),
                    sizes[&idx]
                )));
            }
            tramps[usize::from(idx)].bytes = bytes;
        }
    }

    let mut regions = Vec::new();
    for (pidx, payload) in payloads.iter() {
        match payload {
            Payload::Snippet(s) => {
                regions.push(RegionImage {
                    kind: RegionKind::SnippetCode,
                    payload: pidx,
                    addr: s.entry_point(),
                    bytes: s.emit_code(isa)?,
                });
                let mut data = s.data_bytes();
                s.init_data(&mut data);
                regions.push(RegionImage {
                    kind: RegionKind::SnippetData,
                    payload: pidx,
                    addr: s.data_addr().unwrap(),
                    bytes: data,
                });
            }
            Payload::FunctionCall(f) => {
                regions.push(RegionImage {
                    kind: RegionKind::Wrapper,
                    payload: pidx,
                    addr: f.entry_point(),
                    bytes: f.generate_wrapper(isa)?,
                });
                regions.push(RegionImage {
                    kind: RegionKind::Bootstrap,
                    payload: pidx,
                    addr: f.bootstrap_addr().unwrap(),
                    bytes: f.generate_bootstrap(isa)?,
                });
                regions.push(RegionImage {
                    kind: RegionKind::ProcedureLink,
                    payload: pidx,
                    addr: f.proclink_addr().unwrap(),
                    bytes: f.generate_procedure_link(isa, image.plt_base())?,
                });
                regions.push(RegionImage {
                    kind: RegionKind::GlobalData,
                    payload: pidx,
                    addr: f.data_addr().unwrap(),
                    bytes: f.generate_global_data(isa),
                });
            }
        }
    }
    regions.sort_by_key(|r| r.addr);

    debug!(
        "layout done: arena {tramp_base:#x}+{capacity:#x} (used {arena_used:#x}), end {end:#x}"
    );
    Ok(Layout {
        tramp_base,
        arena_capacity: capacity,
        arena_used,
        tramps,
        site_patches,
        regions,
        end,
    })
}

/// Post-layout consistency check: chain integrity, alignment, overlap and
/// unresolved callees. Any failure is fatal.
pub(crate) fn verify(
    layout: &Layout,
    registry: &PointRegistry,
    payloads: &PayloadTable,
) -> Result<(), RewriteError> {
    // Chain integrity: every trampoline's tail jump must hit the next
    // trampoline's entry, and the final one the return address.
    for addr in registry.unique_addresses() {
        let group = registry.points_at(addr);
        for (i, &idx) in group.iter().enumerate() {
            let t = layout.trampoline(idx);
            let bytes = &t.bytes;
            if bytes.len() < SIZE_UNCOND_JUMP || bytes[bytes.len() - SIZE_UNCOND_JUMP] != 0xE9 {
                return Err(RewriteError::VerifyFailed(format!(
                    "trampoline at {:#x} does not end with a near jump",
                    t.entry
                )));
            }
            let tail = bytes.len() - SIZE_UNCOND_JUMP;
            let disp = i32::from_le_bytes(bytes[tail + 1..].try_into().unwrap());
            let target = (t.entry + bytes.len() as u64).wrapping_add(disp as i64 as u64);
            let expect = if i + 1 == group.len() {
                registry.point(idx).return_address()
            } else {
                layout.trampoline(group[i + 1]).entry
            };
            if target != expect {
                return Err(RewriteError::VerifyFailed(format!(
                    "chain breakage at {:#x}: tail jumps to {target:#x}, expected {expect:#x}",
                    t.entry
                )));
            }
        }
    }

    // Wrapper alignment and callee resolution.
    for (pidx, payload) in payloads.iter() {
        if let Payload::FunctionCall(f) = payload {
            if f.entry_point() % 16 != 0 {
                return Err(RewriteError::VerifyFailed(format!(
                    "wrapper for payload {} at {:#x} is not 16-byte aligned",
                    usize::from(pidx),
                    f.entry_point()
                )));
            }
            if f.resolved_target().is_none() {
                return Err(RewriteError::VerifyFailed(format!(
                    "callee {} is neither statically linked nor imported",
                    f.name()
                )));
            }
        }
    }

    // No two placed regions may overlap.
    let mut spans: Vec<(u64, u64, &'static str)> = Vec::new();
    for t in &layout.tramps {
        spans.push((t.entry, t.entry + t.bytes.len() as u64, "trampoline"));
    }
    for r in &layout.regions {
        spans.push((r.addr, r.addr + r.bytes.len() as u64, "region"));
    }
    spans.sort();
    for pair in spans.windows(2) {
        if pair[0].1 > pair[1].0 {
            return Err(RewriteError::VerifyFailed(format!(
                "{} at {:#x} overlaps {} at {:#x}",
                pair[0].2, pair[0].0, pair[1].2, pair[1].0
            )));
        }
    }
    Ok(())
}
