//! End-to-end rewrites against a synthetic image.
//!
//! These drive the whole pipeline (register -> layout -> verify -> emit)
//! with a hand-decoded code stream, checking the byte-level contracts a
//! disassembler would otherwise observe.

use graft::{
    CellId, CodeMap, ExecSection, FlagsProtect, ImageModel, InstKind, InstLocation, InstMode,
    Instruction, Isa, PointRequest, Priority, RegionKind, RewriteConfig, RewriteError, Rewriter,
    Snippet, VecOut, PLT_RETURN_OFFSET, TRAMPOLINE_AUTOINC,
};

const TEXT_VADDR: u64 = 0x400000;
const TEXT_SIZE: u64 = 0x2000;
const TEXT_FILE_OFF: u64 = 0x1000;
const EXT_BASE: u64 = 0x480000;
const EXT_FILE_OFF: u64 = 0x10000;

struct TestImage {
    word: usize,
    sections: Vec<ExecSection>,
    plt_base: Option<u64>,
    plt_entries: Vec<(String, u64)>,
    symbols: Vec<(String, u64)>,
}

impl TestImage {
    fn new(word: usize) -> Self {
        Self {
            word,
            sections: vec![ExecSection {
                name: ".text".to_owned(),
                vaddr: TEXT_VADDR,
                size: TEXT_SIZE,
                file_off: TEXT_FILE_OFF,
            }],
            plt_base: Some(0x400480),
            plt_entries: vec![("myCounter".to_owned(), 0x400490)],
            symbols: vec![("localFn".to_owned(), 0x400800)],
        }
    }
}

impl ImageModel for TestImage {
    fn word_bytes(&self) -> usize {
        self.word
    }

    fn exec_sections(&self) -> &[ExecSection] {
        &self.sections
    }

    fn symbol_addr(&self, name: &str) -> Option<u64> {
        self.symbols
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| *a)
    }

    fn plt_entry(&self, name: &str) -> Option<u64> {
        self.plt_entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| *a)
    }

    fn plt_base(&self) -> Option<u64> {
        self.plt_base
    }

    fn extension_code_base(&self) -> u64 {
        EXT_BASE
    }

    fn extension_data_base(&self) -> u64 {
        EXT_BASE
    }

    fn file_offset(&self, vaddr: u64) -> Option<u64> {
        if vaddr >= EXT_BASE {
            return Some(EXT_FILE_OFF + (vaddr - EXT_BASE));
        }
        if vaddr >= TEXT_VADDR && vaddr < TEXT_VADDR + TEXT_SIZE {
            return Some(TEXT_FILE_OFF + (vaddr - TEXT_VADDR));
        }
        None
    }
}

/// A plain 5-byte instruction (think `mov eax, imm32`).
fn mov5(addr: u64) -> Instruction {
    Instruction::decoded(addr, vec![0xB8, 1, 0, 0, 0], InstKind::Plain)
}

fn small_code() -> CodeMap {
    CodeMap::build(vec![
        mov5(0x400500),
        mov5(0x400505),
        Instruction::decoded(0x40050A, vec![0x90; 3], InstKind::Plain),
        mov5(0x40050D),
    ])
}

/// One-instruction snippet bumping a reserved 8-byte cell.
fn counter_snippet(isa: Isa) -> (Snippet, CellId) {
    let mut s = Snippet::new();
    let cell = s.reserve_data(0, 8);
    let inst = match isa {
        // inc qword [rip+disp32]
        Isa::X64 => Instruction::cell_ref(vec![0x48, 0xFF, 0x05, 0, 0, 0, 0], 3, cell),
        // inc dword [abs32]
        Isa::X86 => Instruction::cell_ref(vec![0xFF, 0x05, 0, 0, 0, 0], 2, cell),
    };
    s.add_instruction(inst);
    (s, cell)
}

fn point_req(addr: u64, payload: graft::PayloadIdx, priority: Priority) -> PointRequest {
    PointRequest {
        address: addr,
        payload,
        location: InstLocation::Prior,
        protection: FlagsProtect::None,
        mode: Some(InstMode::Trampolined),
        priority,
    }
}

#[test]
fn scenario_a_single_snippet_no_flags() {
    let _ = env_logger::builder().is_test(true).try_init();
    let image = TestImage::new(8);
    let code = small_code();
    let mut rw = Rewriter::new(&image, &code, RewriteConfig::default()).unwrap();

    let (snippet, cell) = counter_snippet(Isa::X64);
    let payload = rw.add_snippet(snippet);
    let point = rw.register(point_req(0x400500, payload, Priority::Regular)).unwrap();

    let mut out = VecOut::new();
    let layout = rw.rewrite(&mut out).unwrap();

    // The reserved cell lands at the base of the snippet's data region.
    let snip = rw.payload(payload).as_snippet().unwrap();
    let data = layout
        .regions()
        .iter()
        .find(|r| r.kind == RegionKind::SnippetData)
        .unwrap();
    assert_eq!(snip.cell_address(cell), data.addr);

    // The original five bytes are replaced by a near jump to the trampoline.
    let patch = &layout.site_patches()[0];
    assert_eq!(patch.addr, 0x400500);
    assert_eq!(patch.bytes.len(), 5);
    assert_eq!(patch.bytes[0], 0xE9);
    let disp = i32::from_le_bytes(patch.bytes[1..5].try_into().unwrap());
    let tramp = layout.trampoline(point);
    assert_eq!(0x400505u64.wrapping_add(disp as i64 as u64), tramp.entry);

    // Trampoline: call snippet + relocated original + jump back to 0x400505.
    let t = &tramp.bytes;
    assert_eq!(t.len(), 15);
    assert_eq!(t[0], 0xE8);
    let call_disp = i32::from_le_bytes(t[1..5].try_into().unwrap());
    let snippet_entry = rw.payload(payload).entry_point();
    assert_eq!(tramp.entry + 5 + call_disp as i64 as u64, snippet_entry);
    // Byte conservation: the overwritten instruction reappears verbatim.
    assert_eq!(&t[5..10], &[0xB8, 1, 0, 0, 0]);
    assert_eq!(t[10], 0xE9);
    let back = i32::from_le_bytes(t[11..15].try_into().unwrap());
    assert_eq!((tramp.entry + 15).wrapping_add(back as i64 as u64), 0x400505);

    // The emitter wrote the patch into the right file offset.
    let off = (TEXT_FILE_OFF + 0x500) as usize;
    assert_eq!(&out.bytes()[off..off + 5], patch.bytes.as_slice());
}

#[test]
fn scenario_b_priority_chain() {
    let image = TestImage::new(8);
    let code = small_code();
    let mut rw = Rewriter::new(&image, &code, RewriteConfig::default()).unwrap();

    let (snippet, _) = counter_snippet(Isa::X64);
    let payload = rw.add_snippet(snippet);
    let regular = rw.register(point_req(0x400500, payload, Priority::Regular)).unwrap();
    let sysinit = rw.register(point_req(0x400500, payload, Priority::SysInit)).unwrap();

    let mut out = VecOut::new();
    let layout = rw.rewrite(&mut out).unwrap();

    // The source site jumps to the SysInit trampoline.
    let patch = &layout.site_patches()[0];
    let disp = i32::from_le_bytes(patch.bytes[1..5].try_into().unwrap());
    let first = 0x400505u64.wrapping_add(disp as i64 as u64);
    assert_eq!(first, layout.trampoline(sysinit).entry);

    // Priority monotonicity: SysInit is placed before Regular.
    assert!(layout.trampoline(sysinit).entry < layout.trampoline(regular).entry);

    // The SysInit trampoline ends by jumping to the Regular trampoline.
    let t = &layout.trampoline(sysinit).bytes;
    let disp = i32::from_le_bytes(t[t.len() - 4..].try_into().unwrap());
    let next = layout.trampoline(sysinit).entry + t.len() as u64;
    assert_eq!(next.wrapping_add(disp as i64 as u64), layout.trampoline(regular).entry);

    // Only the final trampoline carries the relocated bytes and return jump.
    assert_eq!(
        layout.trampoline(regular).bytes.len() - t.len(),
        5,
        "inner trampoline must omit the single relocated copy"
    );
    let last = &layout.trampoline(regular).bytes;
    assert_eq!(&last[5..10], &[0xB8, 1, 0, 0, 0]);
    let back = i32::from_le_bytes(last[last.len() - 4..].try_into().unwrap());
    assert_eq!(
        (layout.trampoline(regular).entry + last.len() as u64).wrapping_add(back as i64 as u64),
        0x400505
    );
}

#[test]
fn scenario_c_function_call_with_two_arguments() {
    let image = TestImage::new(8);
    let code = small_code();
    let mut rw = Rewriter::new(&image, &code, RewriteConfig::default()).unwrap();

    let payload = rw.add_function("myCounter");
    rw.payload_mut(payload).as_function_mut().unwrap().add_argument();
    rw.payload_mut(payload).as_function_mut().unwrap().add_argument();
    rw.register(PointRequest {
        address: 0x400500,
        payload,
        location: InstLocation::Prior,
        protection: FlagsProtect::Full,
        mode: None,
        priority: Priority::Regular,
    })
    .unwrap();

    let mut out = VecOut::new();
    let layout = rw.rewrite(&mut out).unwrap();

    let f = rw.payload(payload).as_function().unwrap();
    assert_eq!(f.entry_point() % 16, 0);

    let regions: Vec<_> = layout.regions().to_vec();
    let gd = regions
        .iter()
        .find(|r| r.kind == RegionKind::GlobalData)
        .unwrap();
    // Name string, resolved-entry slot, sentinel, two arg cells.
    assert_eq!(&gd.bytes[..10], b"myCounter\0");
    let lay_resolved = 16; // "myCounter\0" rounded to the next word
    let slot = u64::from_le_bytes(gd.bytes[lay_resolved..lay_resolved + 8].try_into().unwrap());
    let proclink = regions
        .iter()
        .find(|r| r.kind == RegionKind::ProcedureLink)
        .unwrap();
    assert_eq!(slot, proclink.addr + PLT_RETURN_OFFSET as u64);
    // Sentinel starts unclaimed; arg cells zeroed.
    assert!(gd.bytes[24..48].iter().all(|&b| b == 0));
    assert_eq!(f.argument_address(Isa::X64, 0), gd.addr + 32);
    assert_eq!(f.argument_address(Isa::X64, 1), gd.addr + 40);
    assert_eq!(f.arguments(Isa::X64)[0].offset, 32);

    // A 128-byte wrapper.
    let wrapper = regions
        .iter()
        .find(|r| r.kind == RegionKind::Wrapper)
        .unwrap();
    assert_eq!(wrapper.bytes.len(), 128);

    // The bootstrap claims the sentinel with a lock cmpxchg before caching
    // the resolved entry; later fires observe the sentinel and bypass it.
    let bootstrap = regions
        .iter()
        .find(|r| r.kind == RegionKind::Bootstrap)
        .unwrap();
    assert_eq!(bootstrap.bytes.len(), 128);
    assert!(bootstrap.bytes.windows(4).any(|w| w == [0xF0, 0x41, 0x0F, 0xB1]));
}

#[test]
fn scenario_d_light_flags_cost_on_32bit() {
    let image = TestImage::new(4);
    let code = small_code();
    let mut rw = Rewriter::new(&image, &code, RewriteConfig::default()).unwrap();
    assert_eq!(rw.isa(), Isa::X86);

    let (snippet, _) = counter_snippet(Isa::X86);
    let payload = rw.add_snippet(snippet);
    let none = rw.register(point_req(0x400500, payload, Priority::Regular)).unwrap();
    let light = rw
        .register(PointRequest {
            address: 0x40050D,
            payload,
            location: InstLocation::Prior,
            protection: FlagsProtect::Light,
            mode: Some(InstMode::Trampolined),
            priority: Priority::Regular,
        })
        .unwrap();

    let mut out = VecOut::new();
    let layout = rw.rewrite(&mut out).unwrap();
    assert_eq!(
        layout.trampoline(light).size - layout.trampoline(none).size,
        12
    );
}

#[test]
fn scenario_e_mid_instruction_registration_rejected() {
    let image = TestImage::new(8);
    let code = small_code();
    let mut rw = Rewriter::new(&image, &code, RewriteConfig::default()).unwrap();
    let (snippet, _) = counter_snippet(Isa::X64);
    let payload = rw.add_snippet(snippet);

    // 0x400501 falls inside the mov at 0x400500.
    let err = rw
        .register(point_req(0x400501, payload, Priority::Regular))
        .unwrap_err();
    assert!(matches!(err, RewriteError::UnsafeOverwrite { .. }));
    assert!(!err.is_fatal());
    assert_eq!(rw.warnings(), 1);

    // Layout proceeds with the accepted subset.
    rw.register(point_req(0x400500, payload, Priority::Regular)).unwrap();
    let mut out = VecOut::new();
    rw.rewrite(&mut out).unwrap();
}

#[test]
fn scenario_f_trampoline_arena_growth() {
    let image = TestImage::new(8);
    // Enough 5-byte instructions that the trampolines overflow one arena
    // increment: each trampoline is 15 bytes.
    let count = (TRAMPOLINE_AUTOINC as usize / 15) + 50;
    let mut insts = Vec::new();
    for i in 0..count {
        insts.push(mov5(TEXT_VADDR + 0x100 + (i as u64) * 5));
    }
    let code = CodeMap::build(insts);
    let mut rw = Rewriter::new(&image, &code, RewriteConfig::default()).unwrap();
    let (snippet, _) = counter_snippet(Isa::X64);
    let payload = rw.add_snippet(snippet);

    let mut points = Vec::new();
    for i in 0..count {
        let addr = TEXT_VADDR + 0x100 + (i as u64) * 5;
        points.push(rw.register(point_req(addr, payload, Priority::Regular)).unwrap());
    }

    let mut out = VecOut::new();
    let layout = rw.rewrite(&mut out).unwrap();

    // Exactly one extra increment, and no reordering of earlier entries.
    assert_eq!(layout.trampoline_arena_capacity(), 2 * TRAMPOLINE_AUTOINC);
    assert_eq!(layout.trampoline(points[0]).entry, layout.trampoline_arena_base());
    let mut prev = 0;
    for &p in &points {
        let e = layout.trampoline(p).entry;
        assert!(e > prev || prev == 0);
        prev = e;
    }
    // Snippet code sits after the grown arena.
    assert!(rw.payload(payload).entry_point() >= layout.trampoline_arena_base() + 2 * TRAMPOLINE_AUTOINC);
    // All points share the one snippet payload.
    assert_eq!(rw.registry().points_of_payload(payload).len(), count);
}

#[test]
fn determinism_and_layout_idempotence() {
    let run = || {
        let image = TestImage::new(8);
        let code = small_code();
        let mut rw = Rewriter::new(&image, &code, RewriteConfig::default()).unwrap();
        let (snippet, _) = counter_snippet(Isa::X64);
        let payload = rw.add_snippet(snippet);
        rw.register(point_req(0x400500, payload, Priority::Regular)).unwrap();
        rw.register(point_req(0x400505, payload, Priority::SysInit)).unwrap();
        let f = rw.add_function("myCounter");
        rw.register(point_req(0x40050D, f, Priority::Regular)).unwrap();
        let mut out = VecOut::new();
        rw.rewrite(&mut out).unwrap();
        out.into_bytes()
    };
    assert_eq!(run(), run());

    // Layout twice over one frozen registry: identical addresses.
    let image = TestImage::new(8);
    let code = small_code();
    let mut rw = Rewriter::new(&image, &code, RewriteConfig::default()).unwrap();
    let (snippet, _) = counter_snippet(Isa::X64);
    let payload = rw.add_snippet(snippet);
    rw.register(point_req(0x400500, payload, Priority::Regular)).unwrap();
    let a = rw.layout().unwrap();
    let b = rw.layout().unwrap();
    assert_eq!(a.dump(rw.registry()), b.dump(rw.registry()));
}

#[test]
fn reserve_conformance_and_alignment() {
    let image = TestImage::new(8);
    let code = small_code();
    let mut rw = Rewriter::new(&image, &code, RewriteConfig::default()).unwrap();
    let payload = rw.add_function("myCounter");
    rw.register(point_req(0x400500, payload, Priority::Regular)).unwrap();
    let mut out = VecOut::new();
    let layout = rw.rewrite(&mut out).unwrap();

    assert_eq!(layout.trampoline_arena_base() % 0x1000, 0);
    for r in layout.regions() {
        let reserve = match r.kind {
            RegionKind::Wrapper => Some(128),
            RegionKind::Bootstrap => Some(128),
            RegionKind::ProcedureLink => Some(16),
            _ => None,
        };
        if let Some(n) = reserve {
            assert_eq!(r.bytes.len(), n);
        }
        if r.kind == RegionKind::Wrapper {
            assert_eq!(r.addr % 16, 0);
        }
    }
}

#[test]
fn frozen_rewriter_rejects_late_registration() {
    let image = TestImage::new(8);
    let code = small_code();
    let mut rw = Rewriter::new(&image, &code, RewriteConfig::default()).unwrap();
    let (snippet, _) = counter_snippet(Isa::X64);
    let payload = rw.add_snippet(snippet);
    rw.register(point_req(0x400500, payload, Priority::Regular)).unwrap();
    rw.freeze();
    assert!(matches!(
        rw.register(point_req(0x40050D, payload, Priority::Regular)),
        Err(RewriteError::RegistryFrozen)
    ));
}

#[test]
fn precursors_wrap_the_payload_call() {
    let image = TestImage::new(8);
    let code = small_code();
    let mut rw = Rewriter::new(&image, &code, RewriteConfig::default()).unwrap();
    let (snippet, _) = counter_snippet(Isa::X64);
    let payload = rw.add_snippet(snippet);
    let point = rw.register(point_req(0x400500, payload, Priority::Regular)).unwrap();
    // push rdi / pop rdi around the call.
    rw.add_precursor(point, Instruction::synth(vec![0x57])).unwrap();
    rw.add_postcursor(point, Instruction::synth(vec![0x5F])).unwrap();

    let mut out = VecOut::new();
    let layout = rw.rewrite(&mut out).unwrap();
    let t = &layout.trampoline(point).bytes;
    assert_eq!(t.len(), 17);
    assert_eq!(t[0], 0x57);
    assert_eq!(t[1], 0xE8);
    assert_eq!(t[6], 0x5F);
}

#[test]
fn unspecified_mode_follows_config_default() {
    let image = TestImage::new(8);
    let code = small_code();
    // Default config inlines plain snippets.
    let mut rw = Rewriter::new(&image, &code, RewriteConfig::default()).unwrap();
    let (snippet, _) = counter_snippet(Isa::X64);
    let payload = rw.add_snippet(snippet);
    let point = rw
        .register(PointRequest {
            address: 0x400500,
            payload,
            location: InstLocation::Prior,
            protection: FlagsProtect::None,
            mode: None,
            priority: Priority::Regular,
        })
        .unwrap();
    let mut out = VecOut::new();
    let layout = rw.rewrite(&mut out).unwrap();
    // Inline: 7-byte body spliced + relocated 5 + return 5.
    assert_eq!(layout.trampoline(point).size, 17);
    let t = &layout.trampoline(point).bytes;
    assert_eq!(&t[..3], [0x48, 0xFF, 0x05]);

    // With the trampoline default switched on, the same registration calls.
    let config = RewriteConfig {
        snippet_trampoline_default: true,
        ..Default::default()
    };
    let mut rw = Rewriter::new(&image, &code, config).unwrap();
    let (snippet, _) = counter_snippet(Isa::X64);
    let payload = rw.add_snippet(snippet);
    let point = rw
        .register(PointRequest {
            address: 0x400500,
            payload,
            location: InstLocation::Prior,
            protection: FlagsProtect::None,
            mode: None,
            priority: Priority::Regular,
        })
        .unwrap();
    let mut out = VecOut::new();
    let layout = rw.rewrite(&mut out).unwrap();
    assert_eq!(layout.trampoline(point).size, 15);
    assert_eq!(layout.trampoline(point).bytes[0], 0xE8);
}

#[test]
fn distinct_trampoline_payloads_are_never_inlined() {
    let image = TestImage::new(8);
    let code = small_code();
    let mut rw = Rewriter::new(&image, &code, RewriteConfig::default()).unwrap();
    let (mut snippet, _) = counter_snippet(Isa::X64);
    snippet.set_requires_distinct_trampoline(true);
    let payload = rw.add_snippet(snippet);
    // Even an explicit inline request is overridden: the point must reach
    // the payload's own stub.
    let point = rw
        .register(PointRequest {
            address: 0x400500,
            payload,
            location: InstLocation::Prior,
            protection: FlagsProtect::None,
            mode: Some(InstMode::InlineSnippet),
            priority: Priority::Regular,
        })
        .unwrap();
    let mut out = VecOut::new();
    let layout = rw.rewrite(&mut out).unwrap();
    assert_eq!(layout.trampoline(point).size, 15);
    assert_eq!(layout.trampoline(point).bytes[0], 0xE8);
}

#[test]
fn layout_dump_matches() {
    let image = TestImage::new(8);
    let code = small_code();
    let mut rw = Rewriter::new(&image, &code, RewriteConfig::default()).unwrap();
    let (snippet, _) = counter_snippet(Isa::X64);
    let payload = rw.add_snippet(snippet);
    rw.register(point_req(0x400500, payload, Priority::Regular)).unwrap();
    let layout = rw.layout().unwrap();

    let ptn = "\
trampoline arena @ 0x480000 capacity 0x4000 used 0xf
  point 0 @ 0x400500 Regular Trampolined tramp 0x480000 size 15
  patch @ 0x400500 e9fbfa0700
region snippet code payload 0 @ 0x484000 len 8
region snippet data payload 0 @ 0x484008 len 8
";
    let matcher = fm::FMBuilder::new(ptn).unwrap().build().unwrap();
    if let Err(e) = matcher.matches(&layout.dump(rw.registry())) {
        panic!("{e}");
    }
}
