//! Snippet payloads.
//!
//! A snippet is an ordered sequence of instructions plus an optional
//! bootstrap prefix (run the first time the snippet fires) and a data region
//! of caller-reserved scratch cells. Trampolines reach the snippet with a
//! near call, so the generated control code terminates the body with `ret`.

use crate::{
    addr::{next_aligned, next_aligned_word},
    errors::RewriteError,
    inst::{CellId, Instruction},
    isa::{rel32, x64, x86, Isa},
};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// Bytes of bootstrap-once control emitted ahead of the bootstrap body:
/// two register saves, the sentinel compare-exchange, two restores and a
/// near `jnz` over the one-time code.
pub(crate) const BOOTSTRAP_CONTROL_LEN: usize = 25;

/// Size of the sentinel cell guarding the bootstrap.
const SENTINEL_SIZE: u64 = 4;

#[derive(Debug, Clone, Copy)]
struct DataCell {
    offset: u64,
    size: u32,
}

/// An instruction-sequence payload.
#[derive(Debug, Default)]
pub struct Snippet {
    body: Vec<Instruction>,
    bootstrap: Vec<Instruction>,
    cells: Vec<DataCell>,
    distinct_trampoline: bool,
    // Assigned by layout.
    code_addr: Option<u64>,
    body_addr: Option<u64>,
    data_addr: Option<u64>,
}

impl Snippet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an instruction to the snippet body.
    pub fn add_instruction(&mut self, inst: Instruction) {
        self.body.push(inst);
    }

    /// Append an instruction to the one-time bootstrap.
    pub fn add_bootstrap_instruction(&mut self, inst: Instruction) {
        self.bootstrap.push(inst);
    }

    /// Reserve a scratch cell at `offset` within the data region. The cell's
    /// final address is `data_base + offset` once layout has run.
    pub fn reserve_data(&mut self, offset: u64, size: u32) -> CellId {
        let id = CellId(u32::try_from(self.cells.len()).unwrap());
        self.cells.push(DataCell { offset, size });
        id
    }

    pub fn set_requires_distinct_trampoline(&mut self, rdt: bool) {
        self.distinct_trampoline = rdt;
    }

    pub fn requires_distinct_trampoline(&self) -> bool {
        self.distinct_trampoline
    }

    pub fn has_bootstrap(&self) -> bool {
        !self.bootstrap.is_empty()
    }

    /// Offset of a reserved cell within the data region.
    pub fn cell_offset(&self, id: CellId) -> u64 {
        self.cells[id.0 as usize].offset
    }

    /// Final address of a reserved cell.
    ///
    /// # Panics
    ///
    /// Panics if layout has not run.
    pub fn cell_address(&self, id: CellId) -> u64 {
        self.data_addr.expect("layout has not assigned addresses") + self.cell_offset(id)
    }

    /// Offset of the bootstrap sentinel cell, placed just past the reserved
    /// cells. Only meaningful when a bootstrap exists.
    fn sentinel_offset(&self) -> u64 {
        let end = self
            .cells
            .iter()
            .map(|c| c.offset + u64::from(c.size))
            .max()
            .unwrap_or(0);
        next_aligned_word(end)
    }

    /// Size of the data region: reserved cells plus the sentinel.
    pub fn data_size(&self) -> u64 {
        let end = self
            .cells
            .iter()
            .map(|c| c.offset + u64::from(c.size))
            .max()
            .unwrap_or(0);
        if self.has_bootstrap() {
            self.sentinel_offset() + SENTINEL_SIZE
        } else {
            end
        }
    }

    /// Size of the bootstrap region (control code plus one-time body).
    pub fn bootstrap_size(&self) -> usize {
        if self.has_bootstrap() {
            BOOTSTRAP_CONTROL_LEN + self.bootstrap.iter().map(|i| i.len()).sum::<usize>()
        } else {
            0
        }
    }

    /// Size of the snippet body, including the terminating return.
    pub fn body_size(&self) -> usize {
        self.body.iter().map(|i| i.len()).sum::<usize>() + 1
    }

    /// Body size when expanded in place inside a trampoline (no return).
    pub(crate) fn inline_body_size(&self) -> usize {
        self.body.iter().map(|i| i.relocated_len()).sum::<usize>()
    }

    /// Total space needed: bootstrap, body, and data, each rounded up to its
    /// alignment (code is byte-aligned, data 8-byte aligned).
    pub fn size_needed(&self, _isa: Isa) -> usize {
        let code = self.bootstrap_size() + self.body_size();
        code + usize::try_from(next_aligned(self.data_size(), 8)).unwrap()
    }

    /// The address a trampoline calls: the bootstrap when one exists, the
    /// body otherwise.
    ///
    /// # Panics
    ///
    /// Panics if layout has not run.
    pub fn entry_point(&self) -> u64 {
        self.code_addr.expect("layout has not assigned addresses")
    }

    pub(crate) fn set_code_addr(&mut self, code: u64) {
        self.code_addr = Some(code);
        self.body_addr = Some(code + self.bootstrap_size() as u64);
    }

    pub(crate) fn set_data_addr(&mut self, data: u64) {
        self.data_addr = Some(data);
    }

    pub(crate) fn data_addr(&self) -> Option<u64> {
        self.data_addr
    }

    /// Emit the snippet's code region at its assigned address: bootstrap
    /// control + one-time body, then the snippet body and its return.
    pub(crate) fn emit_code(&self, isa: Isa) -> Result<Vec<u8>, RewriteError> {
        let base = self.code_addr.expect("layout has not assigned addresses");
        let body_addr = self.body_addr.unwrap();
        let data = self.data_addr.unwrap();
        let resolver = |c: CellId| data + self.cell_offset(c);

        let mut code = Vec::new();
        if self.has_bootstrap() {
            self.emit_bootstrap_control(isa, base, body_addr, &mut code)?;
            let mut cur = base + code.len() as u64;
            for inst in &self.bootstrap {
                let bytes = inst.emit_at(cur, isa, Some(&resolver))?;
                cur += bytes.len() as u64;
                code.extend_from_slice(&bytes);
            }
            debug_assert_eq!(base + code.len() as u64, body_addr);
        }

        let mut cur = base + code.len() as u64;
        for inst in &self.body {
            let bytes = inst.emit_at(cur, isa, Some(&resolver))?;
            cur += bytes.len() as u64;
            code.extend_from_slice(&bytes);
        }
        match isa {
            Isa::X86 => x86::ret(&mut code),
            Isa::X64 => x64::ret(&mut code),
        }
        Ok(code)
    }

    /// The sentinel claim: `lock cmpxchg` 0 -> 1 on the sentinel cell, then
    /// a near `jnz` over the one-time body when another thread (or an
    /// earlier fire) already claimed it. Register saves keep the sequence
    /// transparent; flags are the point's flag-protection problem.
    fn emit_bootstrap_control(
        &self,
        isa: Isa,
        base: u64,
        body_addr: u64,
        code: &mut Vec<u8>,
    ) -> Result<(), RewriteError> {
        let sentinel = self.data_addr.unwrap() + self.sentinel_offset();
        match isa {
            Isa::X86 => {
                x86::push_r(code, x86::EAX);
                x86::push_r(code, x86::ECX);
                x86::xor_eax_eax(code);
                x86::mov_ecx_imm32(code, 1);
                x86::lock_cmpxchg_abs_ecx(
                    code,
                    u32::try_from(sentinel).map_err(|_| RewriteError::TrampolineTooFar {
                        from: base,
                        to: sentinel,
                    })?,
                );
                x86::pop_r(code, x86::ECX);
                x86::pop_r(code, x86::EAX);
            }
            Isa::X64 => {
                x64::push_r(code, x64::RAX);
                x64::push_r(code, x64::RCX);
                x64::xor_eax_eax(code);
                x64::mov_ecx_imm32(code, 1);
                let inst_addr = base + code.len() as u64;
                let disp = rel32(inst_addr, x64::LOCK_CMPXCHG_RIP_LEN as u64, sentinel)
                    .ok_or(RewriteError::TrampolineTooFar {
                        from: inst_addr,
                        to: sentinel,
                    })?;
                x64::lock_cmpxchg_rip_ecx(code, disp);
                x64::pop_r(code, x64::RCX);
                x64::pop_r(code, x64::RAX);
            }
        }
        // jnz over the one-time body, to the snippet proper.
        let jnz_at = base + code.len() as u64;
        let disp = rel32(jnz_at, 6, body_addr).ok_or(RewriteError::TrampolineTooFar {
            from: jnz_at,
            to: body_addr,
        })?;
        match isa {
            Isa::X86 => x86::jnz_rel32(code, disp),
            Isa::X64 => x64::jnz_rel32(code, disp),
        }
        debug_assert_eq!(code.len(), BOOTSTRAP_CONTROL_LEN);
        Ok(())
    }

    /// Emit the body alone, for in-place expansion inside a trampoline.
    pub(crate) fn emit_inline_body(&self, isa: Isa, at: u64) -> Result<Vec<u8>, RewriteError> {
        let data = self.data_addr.expect("layout has not assigned addresses");
        let resolver = |c: CellId| data + self.cell_offset(c);
        let mut code = Vec::new();
        let mut cur = at;
        for inst in &self.body {
            let bytes = inst.emit_at(cur, isa, Some(&resolver))?;
            cur += bytes.len() as u64;
            code.extend_from_slice(&bytes);
        }
        Ok(code)
    }

    /// Zero-initialised image of the data region.
    pub(crate) fn data_bytes(&self) -> Vec<u8> {
        vec![0; usize::try_from(self.data_size()).unwrap()]
    }

    /// Conservative scan: does any body or bootstrap instruction write the
    /// flags register? Errs towards "yes"; only a small set of opcodes is
    /// known safe.
    pub(crate) fn clobbers_flags(&self) -> bool {
        self.body
            .iter()
            .chain(self.bootstrap.iter())
            .any(|i| inst_clobbers_flags(i.bytes()))
    }

    /// Patch the sentinel's initial value into a data image (always zero
    /// today; kept separate so the data layout stays in one place).
    pub(crate) fn init_data(&self, data: &mut [u8]) {
        if self.has_bootstrap() {
            let off = usize::try_from(self.sentinel_offset()).unwrap();
            LittleEndian::write_u32(&mut data[off..], 0);
        }
    }
}

impl fmt::Display for Snippet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "snippet: {} body insts, {} bootstrap insts, {} cells, {} data bytes",
            self.body.len(),
            self.bootstrap.len(),
            self.cells.len(),
            self.data_size()
        )?;
        if let Some(a) = self.code_addr {
            write!(f, " @ {a:#x}")?;
        }
        Ok(())
    }
}

fn inst_clobbers_flags(bytes: &[u8]) -> bool {
    // Skip prefixes we may see on synthetic instructions.
    let mut i = 0;
    while i < bytes.len() && matches!(bytes[i], 0x40..=0x4F | 0x66 | 0x67) {
        i += 1;
    }
    let Some(&op) = bytes.get(i) else {
        return true;
    };
    match op {
        // push/pop, mov, lea, nop, mov imm, ret, push imm, jmp rel.
        0x50..=0x5F | 0x88..=0x8B | 0x8D | 0x90 | 0xB0..=0xBF | 0xC3 | 0x68 | 0x6A | 0xC6
        | 0xC7 | 0xE9 | 0xEB => false,
        // Two-byte escape: SSE moves and setcc leave flags alone.
        0x0F => !matches!(
            bytes.get(i + 1).copied(),
            Some(0x10 | 0x11 | 0x28 | 0x29 | 0x90..=0x9F)
        ),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::InstKind;

    fn inc_cell_inst(cell: CellId) -> Instruction {
        // inc qword [rip + disp32]
        Instruction::cell_ref(vec![0x48, 0xFF, 0x05, 0, 0, 0, 0], 3, cell)
    }

    #[test]
    fn sizes_without_bootstrap() {
        let mut s = Snippet::new();
        let cell = s.reserve_data(0, 8);
        s.add_instruction(inc_cell_inst(cell));
        assert_eq!(s.bootstrap_size(), 0);
        assert_eq!(s.body_size(), 8); // 7-byte inc + ret
        assert_eq!(s.data_size(), 8);
        assert_eq!(s.size_needed(Isa::X64), 16);
    }

    #[test]
    fn sizes_with_bootstrap() {
        let mut s = Snippet::new();
        let cell = s.reserve_data(0, 8);
        s.add_instruction(inc_cell_inst(cell));
        s.add_bootstrap_instruction(Instruction::synth(vec![0x90]));
        assert_eq!(s.bootstrap_size(), BOOTSTRAP_CONTROL_LEN + 1);
        // Sentinel lands at the word boundary after the cell.
        assert_eq!(s.data_size(), 12);
    }

    #[test]
    fn sparse_cells() {
        let mut s = Snippet::new();
        let a = s.reserve_data(0, 8);
        let b = s.reserve_data(16, 4);
        assert_eq!(s.cell_offset(a), 0);
        assert_eq!(s.cell_offset(b), 16);
        assert_eq!(s.data_size(), 20);
    }

    #[test]
    fn emitted_code_ends_with_ret() {
        let mut s = Snippet::new();
        let cell = s.reserve_data(0, 8);
        s.add_instruction(inc_cell_inst(cell));
        s.set_code_addr(0x500000);
        s.set_data_addr(0x600000);
        let code = s.emit_code(Isa::X64).unwrap();
        assert_eq!(code.len(), s.body_size());
        assert_eq!(*code.last().unwrap(), 0xC3);
        // The cell displacement points at 0x600000 from the inc at 0x500000.
        assert_eq!(
            i32::from_le_bytes([code[3], code[4], code[5], code[6]]),
            0x600000 - 0x500007
        );
    }

    #[test]
    fn bootstrap_control_shape() {
        let mut s = Snippet::new();
        s.add_instruction(Instruction::synth(vec![0x90]));
        s.add_bootstrap_instruction(Instruction::synth(vec![0x90, 0x90]));
        s.set_code_addr(0x500000);
        s.set_data_addr(0x600000);
        let code = s.emit_code(Isa::X64).unwrap();
        assert_eq!(code.len(), s.bootstrap_size() + s.body_size());
        // Claim sequence starts with the two saves.
        assert_eq!(&code[..2], [0x50, 0x51]);
        // The jnz lands exactly on the body.
        let jnz_off = BOOTSTRAP_CONTROL_LEN - 6;
        assert_eq!(&code[jnz_off..jnz_off + 2], [0x0F, 0x85]);
        let disp = i32::from_le_bytes([
            code[jnz_off + 2],
            code[jnz_off + 3],
            code[jnz_off + 4],
            code[jnz_off + 5],
        ]);
        assert_eq!(
            0x500000 + jnz_off as i64 + 6 + i64::from(disp),
            0x500000 + s.bootstrap_size() as i64
        );
    }

    #[test]
    fn snippet_summary() {
        let mut s = Snippet::new();
        let cell = s.reserve_data(0, 8);
        s.add_instruction(inc_cell_inst(cell));
        assert_eq!(
            s.to_string(),
            "snippet: 1 body insts, 0 bootstrap insts, 1 cells, 8 data bytes"
        );
        s.set_code_addr(0x500000);
        assert!(s.to_string().ends_with(" @ 0x500000"));
    }

    #[test]
    fn flags_scan() {
        let mut quiet = Snippet::new();
        quiet.add_instruction(Instruction::synth(vec![0x50])); // push
        quiet.add_instruction(Instruction::synth(vec![0x48, 0x89, 0xC1])); // mov
        assert!(!quiet.clobbers_flags());

        let mut noisy = Snippet::new();
        noisy.add_instruction(Instruction::decoded(
            0,
            vec![0x48, 0xFF, 0x05, 0, 0, 0, 0],
            InstKind::Plain,
        )); // inc
        assert!(noisy.clobbers_flags());
    }
}
