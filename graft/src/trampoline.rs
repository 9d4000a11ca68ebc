//! Trampoline generation.
//!
//! A trampoline bridges one instrumentation point to its payload:
//! flags save, precursor glue, the payload transfer, postcursor glue, flags
//! restore, the relocated host bytes (final trampoline of a chain only) and
//! the tail jump. Generation is two-phase: [measure] sizes everything with
//! placeholder displacements so layout can allocate, [encode] re-emits with
//! the final addresses. The two must agree byte-for-byte on length.

use crate::{
    errors::RewriteError,
    isa::{FlagsProtect, Isa, SIZE_UNCOND_JUMP},
    payload::Payload,
    point::{InstLocation, InstMode, InstrumentationPoint},
    RewriteConfig,
};

/// The flags protection actually applied: the point's own mode, unless the
/// non-leaf optimisation proves the snippet body leaves flags alone.
pub(crate) fn effective_protection(
    point: &InstrumentationPoint,
    payload: &Payload,
    config: &RewriteConfig,
) -> FlagsProtect {
    if config.optimize_nonleaf && point.protection() != FlagsProtect::None {
        if let Payload::Snippet(s) = payload {
            if !s.clobbers_flags() {
                return FlagsProtect::None;
            }
        }
    }
    point.protection()
}

fn transfer_size(point: &InstrumentationPoint, payload: &Payload) -> usize {
    match point.mode() {
        InstMode::Trampolined => SIZE_UNCOND_JUMP,
        InstMode::InlineSnippet => match payload {
            Payload::Snippet(s) => s.inline_body_size(),
            // Function calls are never inlined; the registration path
            // forces Trampolined.
            Payload::FunctionCall(_) => SIZE_UNCOND_JUMP,
        },
    }
}

fn relocated_size(point: &InstrumentationPoint, is_last: bool) -> usize {
    if is_last && point.location() != InstLocation::Replace {
        point.overwritten().iter().map(|i| i.relocated_len()).sum()
    } else {
        0
    }
}

/// Phase 1: exact size of this point's trampoline. `is_last` marks the
/// final trampoline of the chain at this source address, which carries the
/// relocated host bytes and the return jump.
pub(crate) fn measure(
    point: &InstrumentationPoint,
    payload: &Payload,
    isa: Isa,
    config: &RewriteConfig,
    is_last: bool,
) -> usize {
    let prot = effective_protection(point, payload, config);
    let pre: usize = point.precursors().iter().map(|i| i.relocated_len()).sum();
    let post: usize = point.postcursors().iter().map(|i| i.relocated_len()).sum();
    isa.flags_save_len(prot)
        + pre
        + transfer_size(point, payload)
        + post
        + isa.flags_restore_len(prot)
        + relocated_size(point, is_last)
        + SIZE_UNCOND_JUMP
}

/// Phase 2: emit the trampoline at `entry`. `tail_target` is the next
/// trampoline in the chain, or the return address for the final one.
pub(crate) fn encode(
    point: &InstrumentationPoint,
    payload: &Payload,
    isa: Isa,
    config: &RewriteConfig,
    entry: u64,
    tail_target: u64,
    is_last: bool,
) -> Result<Vec<u8>, RewriteError> {
    let prot = effective_protection(point, payload, config);
    let mut code = Vec::new();

    let emit_relocated = |code: &mut Vec<u8>| -> Result<(), RewriteError> {
        for inst in point.overwritten() {
            let at = entry + code.len() as u64;
            let bytes = inst.emit_at(at, isa, None)?;
            code.extend_from_slice(&bytes);
        }
        Ok(())
    };

    // An `After` point runs the original instruction(s) before the payload.
    if point.location() == InstLocation::After && is_last {
        emit_relocated(&mut code)?;
    }

    code.extend_from_slice(&isa.save_flags(prot));

    for inst in point.precursors() {
        let at = entry + code.len() as u64;
        let bytes = inst.emit_at(at, isa, None)?;
        code.extend_from_slice(&bytes);
    }

    match (point.mode(), payload) {
        (InstMode::InlineSnippet, Payload::Snippet(s)) => {
            let at = entry + code.len() as u64;
            code.extend_from_slice(&s.emit_inline_body(isa, at)?);
        }
        _ => {
            let at = entry + code.len() as u64;
            let target = payload.entry_point();
            let call = isa
                .encode_call_near(at, target)
                .ok_or(RewriteError::TrampolineTooFar {
                    from: at,
                    to: target,
                })?;
            code.extend_from_slice(&call);
        }
    }

    for inst in point.postcursors() {
        let at = entry + code.len() as u64;
        let bytes = inst.emit_at(at, isa, None)?;
        code.extend_from_slice(&bytes);
    }

    code.extend_from_slice(&isa.restore_flags(prot));

    // `Replace` drops the original instructions entirely.
    if point.location() == InstLocation::Prior && is_last {
        emit_relocated(&mut code)?;
    }

    let at = entry + code.len() as u64;
    let jmp = isa
        .encode_jump_near(at, tail_target)
        .ok_or(RewriteError::TrampolineTooFar {
            from: at,
            to: tail_target,
        })?;
    code.extend_from_slice(&jmp);

    debug_assert_eq!(code.len(), measure(point, payload, isa, config, is_last));
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        inst::{InstKind, Instruction},
        payload::{PayloadIdx, Snippet},
        point::Priority,
    };

    fn host_inst(addr: u64) -> Vec<Instruction> {
        vec![Instruction::decoded(addr, vec![0x90; 5], InstKind::Plain)]
    }

    fn snippet_payload() -> Payload {
        let mut s = Snippet::new();
        let cell = s.reserve_data(0, 8);
        s.add_instruction(Instruction::cell_ref(
            vec![0x48, 0xFF, 0x05, 0, 0, 0, 0],
            3,
            cell,
        ));
        s.set_code_addr(0x500000);
        s.set_data_addr(0x600000);
        Payload::Snippet(s)
    }

    fn test_point(protection: FlagsProtect, mode: InstMode) -> InstrumentationPoint {
        InstrumentationPoint::new(
            Instruction::decoded(0x400500, vec![0x90; 5], InstKind::Plain),
            PayloadIdx::from(0usize),
            InstLocation::Prior,
            protection,
            mode,
            Priority::Regular,
            host_inst(0x400500),
        )
    }

    fn cfg() -> RewriteConfig {
        RewriteConfig {
            optimize_nonleaf: false,
            ..Default::default()
        }
    }

    #[test]
    fn scenario_shape_no_flags() {
        // call snippet + relocated 5-byte original + return jump.
        let point = test_point(FlagsProtect::None, InstMode::Trampolined);
        let payload = snippet_payload();
        let size = measure(&point, &payload, Isa::X64, &cfg(), true);
        assert_eq!(size, 5 + 5 + 5);
        let code = encode(
            &point,
            &payload,
            Isa::X64,
            &cfg(),
            0x480000,
            0x400505,
            true,
        )
        .unwrap();
        assert_eq!(code.len(), size);
        assert_eq!(code[0], 0xE8); // call
        assert_eq!(code[10], 0xE9); // return jump
        let disp = i32::from_le_bytes([code[11], code[12], code[13], code[14]]);
        assert_eq!(0x480000 + 10 + 5 + i64::from(disp), 0x400505);
    }

    #[test]
    fn light_flags_grow_by_fixed_amounts() {
        let payload = snippet_payload();
        let none = measure(
            &test_point(FlagsProtect::None, InstMode::Trampolined),
            &payload,
            Isa::X86,
            &cfg(),
            true,
        );
        let light = measure(
            &test_point(FlagsProtect::Light, InstMode::Trampolined),
            &payload,
            Isa::X86,
            &cfg(),
            true,
        );
        assert_eq!(light - none, 12);

        let none64 = measure(
            &test_point(FlagsProtect::None, InstMode::Trampolined),
            &payload,
            Isa::X64,
            &cfg(),
            true,
        );
        let light64 = measure(
            &test_point(FlagsProtect::Light, InstMode::Trampolined),
            &payload,
            Isa::X64,
            &cfg(),
            true,
        );
        assert_eq!(light64 - none64, 18);

        let full = measure(
            &test_point(FlagsProtect::Full, InstMode::Trampolined),
            &payload,
            Isa::X64,
            &cfg(),
            true,
        );
        assert_eq!(full - none64, 2);
    }

    #[test]
    fn chain_member_omits_relocated_bytes() {
        let point = test_point(FlagsProtect::None, InstMode::Trampolined);
        let payload = snippet_payload();
        let last = measure(&point, &payload, Isa::X64, &cfg(), true);
        let inner = measure(&point, &payload, Isa::X64, &cfg(), false);
        assert_eq!(last - inner, 5);

        // An inner trampoline's tail jump goes to the next trampoline.
        let code = encode(
            &point,
            &payload,
            Isa::X64,
            &cfg(),
            0x480000,
            0x480100,
            false,
        )
        .unwrap();
        assert_eq!(code.len(), inner);
        let n = code.len();
        assert_eq!(code[n - 5], 0xE9);
    }

    #[test]
    fn inline_mode_splices_body() {
        let point = test_point(FlagsProtect::None, InstMode::InlineSnippet);
        let payload = snippet_payload();
        let code = encode(
            &point,
            &payload,
            Isa::X64,
            &cfg(),
            0x480000,
            0x400505,
            true,
        )
        .unwrap();
        // inc [rip+disp] spliced in place of the call.
        assert_eq!(&code[..3], [0x48, 0xFF, 0x05]);
        let disp = i32::from_le_bytes([code[3], code[4], code[5], code[6]]);
        assert_eq!(0x480000 + 7 + i64::from(disp), 0x600000);
    }

    #[test]
    fn after_location_runs_original_first() {
        let point = InstrumentationPoint::new(
            Instruction::decoded(0x400500, vec![0x90; 5], InstKind::Plain),
            PayloadIdx::from(0usize),
            InstLocation::After,
            FlagsProtect::None,
            InstMode::Trampolined,
            Priority::Regular,
            host_inst(0x400500),
        );
        let payload = snippet_payload();
        let code = encode(
            &point,
            &payload,
            Isa::X64,
            &cfg(),
            0x480000,
            0x400505,
            true,
        )
        .unwrap();
        // Relocated original precedes the payload call.
        assert_eq!(&code[..5], &[0x90; 5]);
        assert_eq!(code[5], 0xE8);
    }

    #[test]
    fn replace_location_drops_original() {
        let point = InstrumentationPoint::new(
            Instruction::decoded(0x400500, vec![0x90; 5], InstKind::Plain),
            PayloadIdx::from(0usize),
            InstLocation::Replace,
            FlagsProtect::None,
            InstMode::Trampolined,
            Priority::Regular,
            host_inst(0x400500),
        );
        let payload = snippet_payload();
        let size = measure(&point, &payload, Isa::X64, &cfg(), true);
        assert_eq!(size, 10); // call + return jump, no relocated copy
        let code = encode(
            &point,
            &payload,
            Isa::X64,
            &cfg(),
            0x480000,
            0x400505,
            true,
        )
        .unwrap();
        assert!(!code.windows(5).any(|w| w == [0x90; 5]));
    }

    #[test]
    fn nonleaf_optimisation_drops_flag_saves() {
        let mut quiet = Snippet::new();
        quiet.add_instruction(Instruction::synth(vec![0x50]));
        quiet.add_instruction(Instruction::synth(vec![0x58]));
        quiet.set_code_addr(0x500000);
        quiet.set_data_addr(0x600000);
        let payload = Payload::Snippet(quiet);

        let config = RewriteConfig {
            optimize_nonleaf: true,
            ..Default::default()
        };
        let point = test_point(FlagsProtect::Full, InstMode::Trampolined);
        assert_eq!(
            effective_protection(&point, &payload, &config),
            FlagsProtect::None
        );
        let with = measure(&point, &payload, Isa::X64, &config, true);
        let without = measure(&point, &payload, Isa::X64, &cfg(), true);
        assert_eq!(without - with, 2);
    }
}
