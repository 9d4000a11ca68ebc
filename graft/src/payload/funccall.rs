//! Function-call payloads.
//!
//! A function call names an external function and a list of arguments, each
//! backed by a pointer-sized cell in the payload's global data block. Four
//! sibling regions are generated:
//!
//!   * a *wrapper* — the trampoline's call target; saves caller-owned
//!     registers, marshals arguments, calls the procedure link and restores;
//!   * a *procedure link* — a PLT-shaped stub reaching the callee through a
//!     cached slot;
//!   * a *bootstrap* — claims a sentinel once and fills the slot with the
//!     callee's resolved entry;
//!   * a *global data* block — name string, resolved-entry slot, sentinel,
//!     argument cells and (on x86_64) the wrapper's XMM spill slots.
//!
//! The wrapper, bootstrap and procedure link each occupy a fixed reserve per
//! word size; a generator overrunning its reserve is an encoding bug and
//! surfaces as [RewriteError::PayloadSizeExceedsReserve].

use crate::{
    addr::next_aligned,
    errors::RewriteError,
    isa::{nop_pad, rel32, x64, x86, Isa, Region, PLT_RETURN_OFFSET},
};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// An argument: the block-relative offset of the cell whose value is loaded
/// and passed at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argument {
    pub offset: u64,
}

/// Layout of the global data block, derived from the name length, argument
/// count and word size.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GlobalDataLayout {
    pub resolved_off: u64,
    pub sentinel_off: u64,
    pub args_off: u64,
    pub xmm_off: Option<u64>,
    pub size: u64,
}

/// An external-function payload.
#[derive(Debug)]
pub struct FunctionCall {
    name: String,
    index: u32,
    static_entry: Option<u64>,
    plt_entry: Option<u64>,
    num_args: usize,
    distinct_trampoline: bool,
    // Assigned by layout.
    wrapper_addr: Option<u64>,
    bootstrap_addr: Option<u64>,
    proclink_addr: Option<u64>,
    data_addr: Option<u64>,
}

impl FunctionCall {
    /// `static_entry` is the callee's address when it is statically linked
    /// into the host; `plt_entry` its PLT entry when it is imported.
    pub fn new(name: impl Into<String>, static_entry: Option<u64>, plt_entry: Option<u64>) -> Self {
        Self {
            name: name.into(),
            index: 0,
            static_entry,
            plt_entry,
            num_args: 0,
            distinct_trampoline: false,
            wrapper_addr: None,
            bootstrap_addr: None,
            proclink_addr: None,
            data_addr: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_index(&mut self, index: u32) {
        self.index = index;
    }

    pub fn is_static_linked(&self) -> bool {
        self.static_entry.is_some()
    }

    /// The entry the bootstrap caches: the static entry, or the callee's
    /// real PLT entry in the host image.
    pub fn resolved_target(&self) -> Option<u64> {
        self.static_entry.or(self.plt_entry)
    }

    /// Append an argument; returns its position in the ABI order.
    pub fn add_argument(&mut self) -> usize {
        let i = self.num_args;
        self.num_args += 1;
        i
    }

    pub fn num_args(&self) -> usize {
        self.num_args
    }

    /// The arguments with their block-relative cell offsets.
    pub fn arguments(&self, isa: Isa) -> Vec<Argument> {
        let lay = self.data_layout(isa);
        let w = isa.word_bytes() as u64;
        (0..self.num_args as u64)
            .map(|i| Argument {
                offset: lay.args_off + i * w,
            })
            .collect()
    }

    pub fn set_requires_distinct_trampoline(&mut self, rdt: bool) {
        self.distinct_trampoline = rdt;
    }

    pub fn requires_distinct_trampoline(&self) -> bool {
        self.distinct_trampoline
    }

    pub(crate) fn data_layout(&self, isa: Isa) -> GlobalDataLayout {
        let w = isa.word_bytes() as u64;
        let resolved_off = next_aligned(self.name.len() as u64 + 1, w);
        let sentinel_off = resolved_off + w;
        let args_off = sentinel_off + w;
        let after_args = args_off + self.num_args as u64 * w;
        match isa {
            Isa::X86 => GlobalDataLayout {
                resolved_off,
                sentinel_off,
                args_off,
                xmm_off: None,
                size: after_args,
            },
            Isa::X64 => {
                let xmm_off = next_aligned(after_args, 16);
                GlobalDataLayout {
                    resolved_off,
                    sentinel_off,
                    args_off,
                    xmm_off: Some(xmm_off),
                    size: xmm_off + 32,
                }
            }
        }
    }

    pub fn global_data_size(&self, isa: Isa) -> u64 {
        self.data_layout(isa).size
    }

    /// Space needed across all four regions.
    pub fn size_needed(&self, isa: Isa) -> usize {
        isa.reserved_size(Region::Bootstrap)
            + isa.reserved_size(Region::ProcedureLink)
            + isa.reserved_size(Region::Wrapper)
            + usize::try_from(self.global_data_size(isa)).unwrap()
    }

    /// The wrapper: what trampolines call.
    ///
    /// # Panics
    ///
    /// Panics if layout has not run.
    pub fn entry_point(&self) -> u64 {
        self.wrapper_addr.expect("layout has not assigned addresses")
    }

    /// Final address of argument `i`'s value cell.
    ///
    /// # Panics
    ///
    /// Panics if layout has not run or `i` is out of bounds.
    pub fn argument_address(&self, isa: Isa, i: usize) -> u64 {
        assert!(i < self.num_args);
        let data = self.data_addr.expect("layout has not assigned addresses");
        data + self.data_layout(isa).args_off + (i as u64) * isa.word_bytes() as u64
    }

    pub(crate) fn set_addrs(&mut self, wrapper: u64, bootstrap: u64, proclink: u64, data: u64) {
        self.wrapper_addr = Some(wrapper);
        self.bootstrap_addr = Some(bootstrap);
        self.proclink_addr = Some(proclink);
        self.data_addr = Some(data);
    }

    pub(crate) fn bootstrap_addr(&self) -> Option<u64> {
        self.bootstrap_addr
    }

    pub(crate) fn proclink_addr(&self) -> Option<u64> {
        self.proclink_addr
    }

    pub(crate) fn data_addr(&self) -> Option<u64> {
        self.data_addr
    }

    /// The PLT-shaped stub. A statically linked callee gets a direct jump;
    /// otherwise an indirect jump through the resolved-entry slot, followed
    /// by the classic push/jump lazy path at [PLT_RETURN_OFFSET] targeting
    /// the host's own resolver stub (`real_plt_base`).
    pub fn generate_procedure_link(
        &self,
        isa: Isa,
        real_plt_base: Option<u64>,
    ) -> Result<Vec<u8>, RewriteError> {
        let own = self.proclink_addr.expect("layout has not assigned addresses");
        let data = self.data_addr.unwrap();
        let slot = data + self.data_layout(isa).resolved_off;
        let reserve = isa.reserved_size(Region::ProcedureLink);

        let mut code = Vec::new();
        if let Some(entry) = self.static_entry {
            let disp = rel32(own, 5, entry).ok_or(RewriteError::TrampolineTooFar {
                from: own,
                to: entry,
            })?;
            match isa {
                Isa::X86 => x86::jmp_rel32(&mut code, disp),
                Isa::X64 => x64::jmp_rel32(&mut code, disp),
            }
            // Keep the lazy-path offset meaningful even for direct stubs.
            nop_pad(&mut code, PLT_RETURN_OFFSET);
        } else {
            match isa {
                Isa::X86 => {
                    let slot32 = u32::try_from(slot).map_err(|_| {
                        RewriteError::TrampolineTooFar { from: own, to: slot }
                    })?;
                    x86::jmp_indirect_abs(&mut code, slot32);
                    x86::push_imm32(&mut code, self.index);
                    if let Some(plt0) = real_plt_base {
                        let at = own + code.len() as u64;
                        let disp = rel32(at, 5, plt0).ok_or(RewriteError::TrampolineTooFar {
                            from: at,
                            to: plt0,
                        })?;
                        x86::jmp_rel32(&mut code, disp);
                    }
                }
                Isa::X64 => {
                    let disp = rel32(own, 6, slot).ok_or(RewriteError::TrampolineTooFar {
                        from: own,
                        to: slot,
                    })?;
                    x64::jmp_indirect_rip(&mut code, disp);
                    x64::push_imm32(&mut code, self.index);
                    if let Some(plt0) = real_plt_base {
                        let at = own + code.len() as u64;
                        let disp = rel32(at, 5, plt0).ok_or(RewriteError::TrampolineTooFar {
                            from: at,
                            to: plt0,
                        })?;
                        x64::jmp_rel32(&mut code, disp);
                    }
                }
            }
        }
        finish_region(code, Region::ProcedureLink, reserve)
    }

    /// The one-time bootstrap: claim the sentinel with a lock-prefixed
    /// compare-exchange, cache the callee's resolved entry, and tail into
    /// the procedure link.
    pub fn generate_bootstrap(&self, isa: Isa) -> Result<Vec<u8>, RewriteError> {
        let own = self.bootstrap_addr.expect("layout has not assigned addresses");
        let data = self.data_addr.unwrap();
        let proclink = self.proclink_addr.unwrap();
        let lay = self.data_layout(isa);
        let reserve = isa.reserved_size(Region::Bootstrap);

        let mut code = Vec::new();
        let jnz_field;
        match isa {
            Isa::X86 => {
                let sent = u32::try_from(data + lay.sentinel_off).map_err(|_| {
                    RewriteError::TrampolineTooFar {
                        from: own,
                        to: data,
                    }
                })?;
                x86::xor_eax_eax(&mut code);
                x86::mov_ecx_imm32(&mut code, 1);
                x86::lock_cmpxchg_abs_ecx(&mut code, sent);
                x86::jnz_rel32(&mut code, 0);
                jnz_field = code.len() - 4;
                if let Some(target) = self.resolved_target() {
                    let slot = u32::try_from(data + lay.resolved_off).unwrap();
                    x86::mov_mem_abs_imm32(&mut code, slot, u32::try_from(target).unwrap());
                }
            }
            Isa::X64 => {
                x64::mov_r_imm64(&mut code, x64::R11, data);
                x64::xor_eax_eax(&mut code);
                x64::mov_ecx_imm32(&mut code, 1);
                x64::lock_cmpxchg_r11_ecx(&mut code, i32::try_from(lay.sentinel_off).unwrap());
                x64::jnz_rel32(&mut code, 0);
                jnz_field = code.len() - 4;
                if let Some(target) = self.resolved_target() {
                    x64::mov_r_imm64(&mut code, x64::RAX, target);
                    x64::mov_r11_from_r(
                        &mut code,
                        i32::try_from(lay.resolved_off).unwrap(),
                        x64::RAX,
                    );
                }
            }
        }
        // The jnz skips the cache-fill and lands on the tail jump.
        let skip = i32::try_from(code.len() - (jnz_field + 4)).unwrap();
        LittleEndian::write_i32(&mut code[jnz_field..], skip);

        let at = own + code.len() as u64;
        let disp = rel32(at, 5, proclink).ok_or(RewriteError::TrampolineTooFar {
            from: at,
            to: proclink,
        })?;
        match isa {
            Isa::X86 => x86::jmp_rel32(&mut code, disp),
            Isa::X64 => x64::jmp_rel32(&mut code, disp),
        }
        finish_region(code, Region::Bootstrap, reserve)
    }

    /// The wrapper: caller-saves, argument marshaling, the call, restores.
    pub fn generate_wrapper(&self, isa: Isa) -> Result<Vec<u8>, RewriteError> {
        let own = self.wrapper_addr.expect("layout has not assigned addresses");
        let data = self.data_addr.unwrap();
        let proclink = self.proclink_addr.unwrap();
        let lay = self.data_layout(isa);
        let reserve = isa.reserved_size(Region::Wrapper);

        let mut code = Vec::new();
        match isa {
            Isa::X86 => {
                if self.num_args > 8 {
                    return Err(RewriteError::VerifyFailed(format!(
                        "function {} has {} arguments; the 32-bit wrapper passes at most 8",
                        self.name, self.num_args
                    )));
                }
                x86::pusha(&mut code);
                // cdecl: push the cell values right-to-left.
                for i in (0..self.num_args as u64).rev() {
                    let cell = u32::try_from(data + lay.args_off + i * 4).map_err(|_| {
                        RewriteError::TrampolineTooFar {
                            from: own,
                            to: data,
                        }
                    })?;
                    x86::push_mem_abs(&mut code, cell);
                }
                let at = own + code.len() as u64;
                let disp = rel32(at, 5, proclink).ok_or(RewriteError::TrampolineTooFar {
                    from: at,
                    to: proclink,
                })?;
                x86::call_rel32(&mut code, disp);
                if self.num_args > 0 {
                    x86::add_esp_imm8(&mut code, i8::try_from(self.num_args * 4).unwrap());
                }
                x86::popa(&mut code);
                x86::ret(&mut code);
            }
            Isa::X64 => {
                if self.num_args > x64::ARG_REGS.len() {
                    return Err(RewriteError::VerifyFailed(format!(
                        "function {} has {} arguments; the 64-bit wrapper passes at most {}",
                        self.name,
                        self.num_args,
                        x64::ARG_REGS.len()
                    )));
                }
                for r in x64::CALLER_SAVED {
                    x64::push_r(&mut code, r);
                }
                let xmm_off = lay.xmm_off.unwrap();
                x64::mov_r_imm64(&mut code, x64::R11, data);
                x64::movaps_store_r11(&mut code, i32::try_from(xmm_off).unwrap(), 0);
                x64::movaps_store_r11(&mut code, i32::try_from(xmm_off + 16).unwrap(), 1);
                for i in 0..self.num_args {
                    let disp = i32::try_from(lay.args_off + i as u64 * 8).unwrap();
                    x64::mov_r_from_r11(&mut code, x64::ARG_REGS[i], disp);
                }
                // Vararg convention: no vector arguments.
                x64::xor_eax_eax(&mut code);
                let at = own + code.len() as u64;
                let disp = rel32(at, 5, proclink).ok_or(RewriteError::TrampolineTooFar {
                    from: at,
                    to: proclink,
                })?;
                x64::call_rel32(&mut code, disp);
                x64::mov_r_imm64(&mut code, x64::R11, data);
                x64::movaps_load_r11(&mut code, 1, i32::try_from(xmm_off + 16).unwrap());
                x64::movaps_load_r11(&mut code, 0, i32::try_from(xmm_off).unwrap());
                for r in x64::CALLER_SAVED.iter().rev() {
                    x64::pop_r(&mut code, *r);
                }
                x64::ret(&mut code);
            }
        }
        finish_region(code, Region::Wrapper, reserve)
    }

    /// The global data block image: name string, resolved-entry slot
    /// (initialised to the stub's lazy path, or the static entry), zeroed
    /// sentinel and argument cells, zeroed XMM spill slots.
    pub fn generate_global_data(&self, isa: Isa) -> Vec<u8> {
        let lay = self.data_layout(isa);
        let proclink = self.proclink_addr.expect("layout has not assigned addresses");
        let mut data = vec![0u8; usize::try_from(lay.size).unwrap()];
        data[..self.name.len()].copy_from_slice(self.name.as_bytes());
        // data[name.len()] is already the NUL terminator.
        let init = self
            .static_entry
            .unwrap_or(proclink + PLT_RETURN_OFFSET as u64);
        let off = usize::try_from(lay.resolved_off).unwrap();
        match isa {
            Isa::X86 => LittleEndian::write_u32(&mut data[off..], init as u32),
            Isa::X64 => LittleEndian::write_u64(&mut data[off..], init),
        }
        data
    }
}

impl fmt::Display for FunctionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "function {}: {} args, {}",
            self.name,
            self.num_args,
            if self.is_static_linked() {
                "static"
            } else {
                "dynamic"
            }
        )?;
        if let Some(w) = self.wrapper_addr {
            write!(f, ", wrapper @ {w:#x}")?;
        }
        Ok(())
    }
}

/// Reserve check + pad: every region occupies exactly its reserve in the
/// output image.
fn finish_region(
    mut code: Vec<u8>,
    region: Region,
    reserve: usize,
) -> Result<Vec<u8>, RewriteError> {
    if code.len() > reserve {
        return Err(RewriteError::PayloadSizeExceedsReserve {
            region,
            got: code.len(),
            reserve,
        });
    }
    nop_pad(&mut code, reserve);
    Ok(code)
}
