//! Byte emitters for x86_64.
//!
//! Only the handful of instructions the generators need. Addressing through
//! `r11` avoids SIB bytes (r11 is caller-saved and never holds an argument,
//! so the wrappers use it as the data-block base).

#![allow(dead_code)]

pub(crate) const RAX: u8 = 0;
pub(crate) const RCX: u8 = 1;
pub(crate) const RDX: u8 = 2;
pub(crate) const RBX: u8 = 3;
pub(crate) const RSP: u8 = 4;
pub(crate) const RBP: u8 = 5;
pub(crate) const RSI: u8 = 6;
pub(crate) const RDI: u8 = 7;
pub(crate) const R8: u8 = 8;
pub(crate) const R9: u8 = 9;
pub(crate) const R10: u8 = 10;
pub(crate) const R11: u8 = 11;

/// Argument registers of the SysV ABI, in order.
pub(crate) const ARG_REGS: [u8; 6] = [RDI, RSI, RDX, RCX, R8, R9];

/// Integer registers a wrapper must preserve around an external call.
pub(crate) const CALLER_SAVED: [u8; 9] = [RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11];

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 7) << 3) | (rm & 7)
}

pub(crate) fn push_r(code: &mut Vec<u8>, r: u8) {
    if r >= 8 {
        code.push(0x41);
    }
    code.push(0x50 + (r & 7));
}

pub(crate) fn pop_r(code: &mut Vec<u8>, r: u8) {
    if r >= 8 {
        code.push(0x41);
    }
    code.push(0x58 + (r & 7));
}

/// `mov r, imm64`.
pub(crate) fn mov_r_imm64(code: &mut Vec<u8>, r: u8, imm: u64) {
    code.push(if r >= 8 { 0x49 } else { 0x48 });
    code.push(0xB8 + (r & 7));
    code.extend_from_slice(&imm.to_le_bytes());
}

/// `mov dst, [r11 + disp]`.
pub(crate) fn mov_r_from_r11(code: &mut Vec<u8>, dst: u8, disp: i32) {
    code.push(0x49 | if dst >= 8 { 0x04 } else { 0 });
    code.push(0x8B);
    disp_modrm(code, dst, disp);
}

/// `mov [r11 + disp], src`.
pub(crate) fn mov_r11_from_r(code: &mut Vec<u8>, disp: i32, src: u8) {
    code.push(0x49 | if src >= 8 { 0x04 } else { 0 });
    code.push(0x89);
    disp_modrm(code, src, disp);
}

fn disp_modrm(code: &mut Vec<u8>, reg: u8, disp: i32) {
    if let Ok(d8) = i8::try_from(disp) {
        code.push(modrm(0b01, reg, R11));
        code.push(d8 as u8);
    } else {
        code.push(modrm(0b10, reg, R11));
        code.extend_from_slice(&disp.to_le_bytes());
    }
}

/// `movaps [r11 + disp], xmmN`.
pub(crate) fn movaps_store_r11(code: &mut Vec<u8>, disp: i32, xmm: u8) {
    code.push(0x41);
    code.push(0x0F);
    code.push(0x29);
    disp_modrm(code, xmm, disp);
}

/// `movaps xmmN, [r11 + disp]`.
pub(crate) fn movaps_load_r11(code: &mut Vec<u8>, xmm: u8, disp: i32) {
    code.push(0x41);
    code.push(0x0F);
    code.push(0x28);
    disp_modrm(code, xmm, disp);
}

pub(crate) fn xor_eax_eax(code: &mut Vec<u8>) {
    code.extend_from_slice(&[0x31, 0xC0]);
}

pub(crate) fn mov_ecx_imm32(code: &mut Vec<u8>, imm: u32) {
    code.push(0xB9);
    code.extend_from_slice(&imm.to_le_bytes());
}

/// `lock cmpxchg [r11 + disp], ecx`.
pub(crate) fn lock_cmpxchg_r11_ecx(code: &mut Vec<u8>, disp: i32) {
    code.extend_from_slice(&[0xF0, 0x41, 0x0F, 0xB1]);
    disp_modrm(code, RCX, disp);
}

/// `lock cmpxchg [rip + disp32], ecx`.
pub(crate) fn lock_cmpxchg_rip_ecx(code: &mut Vec<u8>, disp: i32) {
    code.extend_from_slice(&[0xF0, 0x0F, 0xB1, modrm(0b00, RCX, 5)]);
    code.extend_from_slice(&disp.to_le_bytes());
}

/// Length of [lock_cmpxchg_rip_ecx] output.
pub(crate) const LOCK_CMPXCHG_RIP_LEN: usize = 8;

/// `jnz rel32`.
pub(crate) fn jnz_rel32(code: &mut Vec<u8>, disp: i32) {
    code.extend_from_slice(&[0x0F, 0x85]);
    code.extend_from_slice(&disp.to_le_bytes());
}

pub(crate) fn jmp_rel32(code: &mut Vec<u8>, disp: i32) {
    code.push(0xE9);
    code.extend_from_slice(&disp.to_le_bytes());
}

pub(crate) fn call_rel32(code: &mut Vec<u8>, disp: i32) {
    code.push(0xE8);
    code.extend_from_slice(&disp.to_le_bytes());
}

/// `jmp [rip + disp32]`.
pub(crate) fn jmp_indirect_rip(code: &mut Vec<u8>, disp: i32) {
    code.extend_from_slice(&[0xFF, 0x25]);
    code.extend_from_slice(&disp.to_le_bytes());
}

pub(crate) fn push_imm32(code: &mut Vec<u8>, imm: u32) {
    code.push(0x68);
    code.extend_from_slice(&imm.to_le_bytes());
}

pub(crate) fn ret(code: &mut Vec<u8>) {
    code.push(0xC3);
}
