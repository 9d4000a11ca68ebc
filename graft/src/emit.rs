//! Writing the rewritten image.
//!
//! The emitter walks the frozen registry in ascending source address and
//! writes three things through the append-only [OutputFile] abstraction:
//! the patched `.text` overwrites, the trampoline arena, and the payload
//! sub-arenas. The caller is expected to have seeded the output with a copy
//! of the original file; the emitter only touches the bytes it owns.

use crate::{
    errors::RewriteError, image::ImageModel, layout::Layout, point::PointRegistry,
};
use log::{debug, trace};
use std::{fs, io, os::unix::fs::FileExt};

/// Positioned writes into the output image.
pub trait OutputFile {
    fn write_bytes(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
}

/// File-backed sink.
pub struct FileOut {
    file: fs::File,
}

impl FileOut {
    pub fn new(file: fs::File) -> Self {
        Self { file }
    }
}

impl OutputFile for FileOut {
    fn write_bytes(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }
}

/// Growable in-memory sink, for tests and byte-for-byte comparisons.
#[derive(Debug, Default)]
pub struct VecOut {
    bytes: Vec<u8>,
}

impl VecOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl OutputFile for VecOut {
    fn write_bytes(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let off = usize::try_from(offset).map_err(|_| io::ErrorKind::InvalidInput)?;
        if self.bytes.len() < off + buf.len() {
            self.bytes.resize(off + buf.len(), 0);
        }
        self.bytes[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// Render a buffer as an address-prefixed hex grid: one line per
/// `bytes_per_line` bytes, each prefixed with the absolute address and the
/// offset into the buffer, bytes grouped into `bytes_per_word` words. Zero
/// arguments fall back to 8-byte words and 64-byte lines.
pub fn pretty_buffer(buf: &[u8], base: u64, bytes_per_word: usize, bytes_per_line: usize) -> String {
    let word = if bytes_per_word == 0 { 8 } else { bytes_per_word };
    let line = if bytes_per_line == 0 { 64 } else { bytes_per_line };
    let mut out = String::new();
    for (i, b) in buf.iter().enumerate() {
        if i % line == 0 {
            if i != 0 {
                out.push('\n');
            }
            out.push_str(&format!("({:16x}) {:8x}: ", base + i as u64, i));
        } else if i % word == 0 {
            out.push(' ');
        }
        out.push_str(&format!("{b:02x}"));
    }
    if !buf.is_empty() {
        out.push('\n');
    }
    out
}

fn write_at_vaddr(
    image: &dyn ImageModel,
    out: &mut dyn OutputFile,
    vaddr: u64,
    bytes: &[u8],
    what: &str,
) -> Result<(), RewriteError> {
    let off = image.file_offset(vaddr).ok_or_else(|| {
        RewriteError::Image(format!("no file backing for {what} at {vaddr:#x}"))
    })?;
    trace!("write {what} @ {vaddr:#x} (file {off:#x}), {} bytes", bytes.len());
    if log::log_enabled!(log::Level::Trace) {
        for line in pretty_buffer(bytes, vaddr, 8, 64).lines() {
            trace!("{line}");
        }
    }
    out.write_bytes(off, bytes)?;
    Ok(())
}

/// Write everything layout placed. Walks sites in ascending address order;
/// the output is byte-identical across runs on the same registry.
pub(crate) fn emit(
    layout: &Layout,
    registry: &PointRegistry,
    image: &dyn ImageModel,
    out: &mut dyn OutputFile,
) -> Result<(), RewriteError> {
    debug!(
        "emitting {} site patches, {} trampolines, {} regions",
        layout.site_patches().len(),
        registry.len(),
        layout.regions().len()
    );
    for patch in layout.site_patches() {
        write_at_vaddr(image, out, patch.addr, &patch.bytes, "site patch")?;
    }
    for idx in registry.sorted_points() {
        let t = layout.trampoline(idx);
        write_at_vaddr(image, out, t.entry, &t.bytes, "trampoline")?;
    }
    for r in layout.regions() {
        write_at_vaddr(image, out, r.addr, &r.bytes, "payload region")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_out_grows_and_overwrites() {
        let mut out = VecOut::new();
        out.write_bytes(4, &[1, 2, 3]).unwrap();
        assert_eq!(out.bytes(), &[0, 0, 0, 0, 1, 2, 3]);
        out.write_bytes(0, &[9]).unwrap();
        assert_eq!(out.bytes()[0], 9);
    }

    #[test]
    fn pretty_buffer_grid() {
        let buf: Vec<u8> = (0u8..12).collect();
        let s = pretty_buffer(&buf, 0x480000, 4, 8);
        assert_eq!(
            s,
            "(          480000)        0: 00010203 04050607\n\
             (          480008)        8: 08090a0b\n"
        );
        assert_eq!(pretty_buffer(&[], 0, 0, 0), "");
        // Zero word/line arguments take the defaults.
        let s = pretty_buffer(&[0xE9; 5], 0x400500, 0, 0);
        assert_eq!(s, "(          400500)        0: e9e9e9e9e9\n");
    }
}
