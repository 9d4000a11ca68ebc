//! graft: the code-injection engine of a static ELF rewriter.
//!
//! The engine takes a pre-linked 32- or 64-bit x86 executable and injects
//! machine code at chosen program points, so the rewritten binary runs the
//! injected code alongside the original. Conceptually it is a one-shot
//! batch: collaborators parse the image ([image::ImageModel]) and decode its
//! executable sections ([inst::CodeMap]); callers register payloads
//! ([payload::Snippet], [payload::FunctionCall]) and points
//! ([point::InstrumentationPoint]) against a [Rewriter]; layout assigns
//! every trampoline and payload region an address; the emitter writes the
//! output image.
//!
//! Everything is deterministic: the same registered point set produces
//! byte-identical output.

mod addr;
mod emit;
mod errors;
mod image;
mod inst;
mod isa;
mod layout;
mod payload;
mod point;
mod trampoline;

pub use addr::{next_aligned, next_aligned_double, next_aligned_half, next_aligned_word};
pub use emit::{pretty_buffer, FileOut, OutputFile, VecOut};
pub use errors::RewriteError;
pub use image::{ElfImage, ExecSection, ImageModel};
pub use inst::{CellId, CodeMap, InstKind, Instruction};
pub use isa::{
    FlagsProtect, Isa, Region, PLT_RETURN_OFFSET, SIZE_FLAG_PROTECT_FULL,
    SIZE_FLAG_PROTECT_LIGHT_32, SIZE_FLAG_PROTECT_LIGHT_64, SIZE_FUNCTION_BOOTSTRAP,
    SIZE_FUNCTION_WRAPPER_32, SIZE_FUNCTION_WRAPPER_64, SIZE_PROCEDURE_LINK, SIZE_UNCOND_JUMP,
    TRAMPOLINE_AUTOINC,
};
pub use layout::{Layout, RegionImage, RegionKind, SitePatch, TrampolineImage};
pub use payload::{Argument, FunctionCall, Payload, PayloadIdx, PayloadTable, Snippet};
pub use point::{
    InstLocation, InstMode, InstrumentationPoint, PointIdx, PointRegistry, Priority,
};

/// Toggles inherited from the original tool's build-time switches, now
/// runtime configuration.
#[derive(Debug, Clone)]
pub struct RewriteConfig {
    /// Demote a point's flags protection to `None` when a conservative scan
    /// proves its snippet payload never writes the flags.
    pub optimize_nonleaf: bool,
    /// Mode used when a registration leaves the instrumentation mode
    /// unspecified: `true` trampolines snippets, `false` inlines them.
    pub snippet_trampoline_default: bool,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            optimize_nonleaf: true,
            snippet_trampoline_default: false,
        }
    }
}

/// Per-rewrite state threaded through the top-level operations; there is no
/// process-global state anywhere in the engine.
#[derive(Debug, Default)]
pub struct Context {
    pub config: RewriteConfig,
    warnings: u64,
}

impl Context {
    pub fn new(config: RewriteConfig) -> Self {
        Self {
            config,
            warnings: 0,
        }
    }

    pub(crate) fn warn(&mut self, msg: &str) {
        log::warn!("{msg}");
        self.warnings += 1;
    }

    /// Count of rejected registrations and other reported problems.
    pub fn warnings(&self) -> u64 {
        self.warnings
    }
}

/// One instrumentation request.
#[derive(Debug, Clone)]
pub struct PointRequest {
    /// Source instruction address; must be an instruction boundary inside
    /// an executable section.
    pub address: u64,
    pub payload: PayloadIdx,
    pub location: InstLocation,
    pub protection: FlagsProtect,
    /// `None` picks the configured default for the payload kind.
    pub mode: Option<InstMode>,
    pub priority: Priority,
}

/// The top-level driver: owns the payload table, the point registry and the
/// rewrite context; borrows the parsed image and the decoded code.
pub struct Rewriter<'a> {
    isa: Isa,
    image: &'a dyn ImageModel,
    code: &'a CodeMap,
    ctx: Context,
    payloads: PayloadTable,
    registry: PointRegistry,
}

impl<'a> Rewriter<'a> {
    pub fn new(
        image: &'a dyn ImageModel,
        code: &'a CodeMap,
        config: RewriteConfig,
    ) -> Result<Self, RewriteError> {
        let isa = Isa::for_word_bytes(image.word_bytes()).ok_or_else(|| {
            RewriteError::Image(format!(
                "unsupported word size {} bytes",
                image.word_bytes()
            ))
        })?;
        log::debug!("rewriter opened for {isa}");
        Ok(Self {
            isa,
            image,
            code,
            ctx: Context::new(config),
            payloads: PayloadTable::new(),
            registry: PointRegistry::new(),
        })
    }

    pub fn isa(&self) -> Isa {
        self.isa
    }

    pub fn warnings(&self) -> u64 {
        self.ctx.warnings()
    }

    pub fn registry(&self) -> &PointRegistry {
        &self.registry
    }

    pub fn payload(&self, idx: PayloadIdx) -> &Payload {
        self.payloads.get(idx)
    }

    /// Mutable payload access, for reserving cells and adding instructions
    /// or arguments. Payloads freeze together with the registry.
    pub fn payload_mut(&mut self, idx: PayloadIdx) -> &mut Payload {
        debug_assert!(!self.registry.is_frozen());
        self.payloads.get_mut(idx)
    }

    pub fn add_snippet(&mut self, snippet: Snippet) -> PayloadIdx {
        self.payloads.add(Payload::Snippet(snippet))
    }

    /// Add a function-call payload, resolving the callee against the image:
    /// a defined symbol means a statically linked callee, otherwise its PLT
    /// entry is used.
    pub fn add_function(&mut self, name: &str) -> PayloadIdx {
        let f = FunctionCall::new(
            name,
            self.image.symbol_addr(name),
            self.image.plt_entry(name),
        );
        self.payloads.add(Payload::FunctionCall(f))
    }

    /// Register a point. Non-fatal rejections increment the warning counter
    /// and leave the registry unchanged.
    pub fn register(&mut self, req: PointRequest) -> Result<PointIdx, RewriteError> {
        if self.registry.is_frozen() {
            return Err(RewriteError::RegistryFrozen);
        }
        if !self.image.is_executable_addr(req.address) {
            let err = RewriteError::UnsafeOverwrite {
                addr: req.address,
                len: 0,
                what: "address outside the executable sections",
            };
            self.ctx.warn(&err.to_string());
            return Err(err);
        }
        let window = match self.code.overwrite_window(req.address, SIZE_UNCOND_JUMP) {
            Ok(w) => w,
            Err(e) => {
                self.ctx.warn(&e.to_string());
                return Err(e);
            }
        };
        let mode = self.resolve_mode(&req);
        let point = InstrumentationPoint::new(
            window[0].clone(),
            req.payload,
            req.location,
            req.protection,
            mode,
            req.priority,
            window,
        );
        match self.registry.register(point, self.code) {
            Ok(idx) => Ok(idx),
            Err(e) => {
                self.ctx.warn(&e.to_string());
                Err(e)
            }
        }
    }

    /// The mode actually used: the explicit request, or the configured
    /// default. Function calls are always trampolined, as are snippets with
    /// a bootstrap (inline expansion has nowhere to put it) and payloads
    /// flagged as requiring a distinct trampoline (their points must
    /// transfer to the payload's own stub, never a spliced copy).
    fn resolve_mode(&self, req: &PointRequest) -> InstMode {
        let payload = self.payloads.get(req.payload);
        match payload {
            Payload::FunctionCall(_) => InstMode::Trampolined,
            Payload::Snippet(s) => {
                if s.has_bootstrap() || s.requires_distinct_trampoline() {
                    return InstMode::Trampolined;
                }
                match req.mode {
                    Some(m) => m,
                    None if self.ctx.config.snippet_trampoline_default => InstMode::Trampolined,
                    None => InstMode::InlineSnippet,
                }
            }
        }
    }

    pub fn add_precursor(
        &mut self,
        idx: PointIdx,
        inst: Instruction,
    ) -> Result<(), RewriteError> {
        self.registry.add_precursor(idx, inst)
    }

    pub fn add_postcursor(
        &mut self,
        idx: PointIdx,
        inst: Instruction,
    ) -> Result<(), RewriteError> {
        self.registry.add_postcursor(idx, inst)
    }

    pub fn set_priority(&mut self, idx: PointIdx, p: Priority) -> Result<(), RewriteError> {
        self.registry.set_priority(idx, p)
    }

    /// Freeze the registry; registrations and point mutations are rejected
    /// from here on.
    pub fn freeze(&mut self) {
        self.registry.freeze();
    }

    /// Run the layout passes. Freezes the registry if the caller has not.
    pub fn layout(&mut self) -> Result<Layout, RewriteError> {
        if !self.registry.is_frozen() {
            self.registry.freeze();
        }
        layout::run(
            &self.ctx,
            self.isa,
            self.image,
            &self.registry,
            &mut self.payloads,
        )
    }

    /// Post-layout consistency check. Fatal on failure.
    pub fn verify(&self, layout: &Layout) -> Result<(), RewriteError> {
        layout::verify(layout, &self.registry, &self.payloads)
    }

    /// Write everything layout placed into `out`.
    pub fn emit(&self, layout: &Layout, out: &mut dyn OutputFile) -> Result<(), RewriteError> {
        emit::emit(layout, &self.registry, self.image, out)
    }

    /// The whole back half: freeze, layout, verify, emit. On any fatal
    /// error the output is untouched.
    pub fn rewrite(&mut self, out: &mut dyn OutputFile) -> Result<Layout, RewriteError> {
        self.freeze();
        let layout = self.layout()?;
        self.verify(&layout)?;
        self.emit(&layout, out)?;
        Ok(layout)
    }
}
