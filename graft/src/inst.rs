//! Instruction handles and the decoded-code index.
//!
//! The core does not disassemble anything itself: the disassembler
//! collaborator decodes the executable sections up front and hands the result
//! to [CodeMap::build]. From then on instructions are opaque byte strings
//! plus just enough structure ([InstKind]) to re-emit them at a new address
//! with PC-relative operands still pointing at their original targets.

use crate::{
    errors::RewriteError,
    isa::{rel32, Isa},
};
use byteorder::{ByteOrder, LittleEndian};
use fxhash::{FxHashMap, FxHashSet};
use intervaltree::IntervalTree;
use std::ops::Range;

/// Identifies a reserved data cell inside a snippet's data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId(pub(crate) u32);

/// The shape of an instruction, as far as relocation cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstKind {
    /// No PC-relative operand; bytes can move freely.
    Plain,
    /// Direct relative jump. `cond` is the condition-code nibble for `jcc`,
    /// `None` for `jmp`. `disp_len` is 1 (short form) or 4 (near form).
    JumpRel {
        cond: Option<u8>,
        disp_len: u8,
        target: u64,
    },
    /// Direct relative call (`call rel32`).
    CallRel { target: u64 },
    /// x86_64 RIP-relative memory operand; `disp_off` is the byte offset of
    /// the disp32 field.
    RipRelMem { disp_off: u8, target: u64 },
    /// Synthetic instruction referencing a snippet data cell through a
    /// disp32 field at `disp_off`. Resolved during the final encode:
    /// RIP-relative on x86_64, absolute on 32-bit x86.
    CellRel { disp_off: u8, cell: CellId },
    /// Return; terminates a decode window.
    Ret,
}

/// A machine instruction at a known address.
///
/// Host instructions come from the disassembler with their real address;
/// synthetic instructions (snippet bodies, precursors) carry address 0 and
/// are emitted verbatim apart from cell references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    addr: u64,
    bytes: Vec<u8>,
    kind: InstKind,
}

impl Instruction {
    /// A decoded host instruction.
    pub fn decoded(addr: u64, bytes: Vec<u8>, kind: InstKind) -> Self {
        debug_assert!(!bytes.is_empty());
        Self { addr, bytes, kind }
    }

    /// A synthetic instruction with no PC-relative operand.
    pub fn synth(bytes: Vec<u8>) -> Self {
        Self {
            addr: 0,
            bytes,
            kind: InstKind::Plain,
        }
    }

    /// A synthetic instruction whose disp32 field at `disp_off` refers to a
    /// reserved snippet data cell.
    pub fn cell_ref(bytes: Vec<u8>, disp_off: u8, cell: CellId) -> Self {
        debug_assert!(usize::from(disp_off) + 4 <= bytes.len());
        Self {
            addr: 0,
            bytes,
            kind: InstKind::CellRel { disp_off, cell },
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn kind(&self) -> &InstKind {
        &self.kind
    }

    pub fn end(&self) -> u64 {
        self.addr + self.len() as u64
    }

    /// Target of a direct branch or call, if any.
    pub fn branch_target(&self) -> Option<u64> {
        match self.kind {
            InstKind::JumpRel { target, .. } | InstKind::CallRel { target } => Some(target),
            _ => None,
        }
    }

    /// Size of this instruction once re-emitted at a new address. Short
    /// branches widen to their near forms; everything else keeps its length.
    pub fn relocated_len(&self) -> usize {
        match self.kind {
            InstKind::JumpRel {
                cond, disp_len: 1, ..
            } => {
                if cond.is_some() {
                    6
                } else {
                    5
                }
            }
            _ => self.len(),
        }
    }

    /// Re-emit this instruction at `new_addr`, rewriting PC-relative
    /// operands so they still hit their original targets. `cells` resolves
    /// snippet data cells to final addresses.
    pub(crate) fn emit_at(
        &self,
        new_addr: u64,
        isa: Isa,
        cells: Option<&dyn Fn(CellId) -> u64>,
    ) -> Result<Vec<u8>, RewriteError> {
        let too_far = |to: u64| RewriteError::TrampolineTooFar { from: new_addr, to };
        match self.kind {
            InstKind::Plain | InstKind::Ret => Ok(self.bytes.clone()),
            InstKind::JumpRel {
                cond,
                disp_len,
                target,
            } => match disp_len {
                4 => {
                    let mut out = self.bytes.clone();
                    let len = out.len() as u64;
                    let off = out.len() - 4;
                    let disp = rel32(new_addr, len, target).ok_or_else(|| too_far(target))?;
                    LittleEndian::write_i32(&mut out[off..], disp);
                    Ok(out)
                }
                1 => {
                    // Widen to the near form.
                    let mut out = match cond {
                        Some(c) => vec![0x0F, 0x80 | (c & 0x0F), 0, 0, 0, 0],
                        None => vec![0xE9, 0, 0, 0, 0],
                    };
                    let len = out.len() as u64;
                    let off = out.len() - 4;
                    let disp = rel32(new_addr, len, target).ok_or_else(|| too_far(target))?;
                    LittleEndian::write_i32(&mut out[off..], disp);
                    Ok(out)
                }
                n => Err(RewriteError::VerifyFailed(format!(
                    "cannot relocate branch at {:#x} with a {n}-byte displacement",
                    self.addr
                ))),
            },
            InstKind::CallRel { target } => {
                let mut out = self.bytes.clone();
                let len = out.len() as u64;
                let off = out.len() - 4;
                let disp = rel32(new_addr, len, target).ok_or_else(|| too_far(target))?;
                LittleEndian::write_i32(&mut out[off..], disp);
                Ok(out)
            }
            InstKind::RipRelMem { disp_off, target } => {
                let mut out = self.bytes.clone();
                let len = out.len() as u64;
                let disp = rel32(new_addr, len, target).ok_or_else(|| too_far(target))?;
                LittleEndian::write_i32(&mut out[usize::from(disp_off)..], disp);
                Ok(out)
            }
            InstKind::CellRel { disp_off, cell } => {
                let resolve = cells.ok_or_else(|| {
                    RewriteError::VerifyFailed(format!(
                        "instruction references data cell {cell:?} outside a snippet context"
                    ))
                })?;
                let cell_addr = resolve(cell);
                let mut out = self.bytes.clone();
                let off = usize::from(disp_off);
                match isa {
                    Isa::X86 => {
                        let abs = u32::try_from(cell_addr)
                            .map_err(|_| too_far(cell_addr))?;
                        LittleEndian::write_u32(&mut out[off..], abs);
                    }
                    Isa::X64 => {
                        let len = out.len() as u64;
                        let disp =
                            rel32(new_addr, len, cell_addr).ok_or_else(|| too_far(cell_addr))?;
                        LittleEndian::write_i32(&mut out[off..], disp);
                    }
                }
                Ok(out)
            }
        }
    }
}

/// Index over the decoded executable range: instruction boundaries plus the
/// set of direct branch targets. Built once by the caller from the
/// disassembler's output and borrowed by the core for the whole rewrite.
pub struct CodeMap {
    insts: Vec<Instruction>,
    by_addr: FxHashMap<u64, usize>,
    spans: IntervalTree<u64, usize>,
    branch_targets: FxHashSet<u64>,
}

impl CodeMap {
    pub fn build(mut insts: Vec<Instruction>) -> Self {
        insts.sort_by_key(|i| i.addr());
        let mut by_addr = FxHashMap::default();
        let mut branch_targets = FxHashSet::default();
        let mut elems = Vec::with_capacity(insts.len());
        for (i, inst) in insts.iter().enumerate() {
            by_addr.insert(inst.addr(), i);
            if let Some(t) = inst.branch_target() {
                branch_targets.insert(t);
            }
            elems.push((inst.addr()..inst.end(), i));
        }
        Self {
            insts,
            by_addr,
            spans: elems.into_iter().collect::<IntervalTree<_, _>>(),
            branch_targets,
        }
    }

    /// The instruction starting exactly at `addr`.
    pub fn instruction_at(&self, addr: u64) -> Option<&Instruction> {
        self.by_addr.get(&addr).map(|&i| &self.insts[i])
    }

    /// The instruction whose byte range contains `addr`.
    pub fn instruction_containing(&self, addr: u64) -> Option<&Instruction> {
        self.spans
            .query_point(addr)
            .next()
            .map(|e| &self.insts[e.value])
    }

    /// Is `addr` the target of a direct branch or call?
    pub fn is_branch_target(&self, addr: u64) -> bool {
        self.branch_targets.contains(&addr)
    }

    /// Does any direct branch land strictly inside `range` (excluding its
    /// start)? Overwrite regions are at most a few instructions, so a linear
    /// probe is fine.
    pub fn branch_target_within(&self, range: Range<u64>) -> Option<u64> {
        ((range.start + 1)..range.end).find(|a| self.branch_targets.contains(a))
    }

    /// The contiguous run of whole instructions starting at `addr` covering
    /// at least `min` bytes: the overwrite region of a trampolined point.
    pub(crate) fn overwrite_window(
        &self,
        addr: u64,
        min: usize,
    ) -> Result<Vec<Instruction>, RewriteError> {
        let mut idx = match self.by_addr.get(&addr) {
            Some(&i) => i,
            None => {
                return Err(RewriteError::UnsafeOverwrite {
                    addr,
                    len: min as u32,
                    what: "address is not an instruction boundary",
                })
            }
        };
        let mut out = Vec::new();
        let mut covered = 0usize;
        let mut expected = addr;
        while covered < min {
            let inst = match self.insts.get(idx) {
                Some(i) if i.addr() == expected => i,
                _ => {
                    return Err(RewriteError::UnsafeOverwrite {
                        addr,
                        len: min as u32,
                        what: "overwrite region runs off the decoded code",
                    })
                }
            };
            covered += inst.len();
            expected = inst.end();
            out.push(inst.clone());
            idx += 1;
        }
        Ok(out)
    }
}
