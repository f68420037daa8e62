//! Low-level x86-64 instruction emission and smashable-site alignment.
//!
//! An append-only byte buffer with a frontier pointer and a notion of
//! patchable sites, in the vein of a `CodeSink`. Unlike a one-shot
//! compiler backend that emits a function once and never revisits it,
//! these buffers stay live at run time: a smashable site emitted here may
//! be overwritten in place long after the surrounding code has executed,
//! so `CodeBuffer` adds the cache-line-aligned patch-window discipline a
//! single-pass emitter wouldn't need.

pub mod regs;
pub mod trampoline;

use std::fmt;

/// Bytes in one host cache line. Smashable sites must not straddle this
/// boundary, or a concurrently-executing thread could observe a torn,
/// partially-overwritten instruction.
pub const CACHE_LINE: u32 = 64;

/// An append-only byte buffer with byte-level emission primitives and a
/// relocatable cursor for in-place patches.
///
/// `CodeBuffer` does not know about registers, opcodes, or calling
/// convention -- only bytes and offsets. [`crate::regalloc`] and
/// [`crate::codegen`] are the layers that know about those, consuming this
/// type as their only way to produce machine code.
#[derive(Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
}

/// Offset in bytes from the start of a `CodeBuffer`.
pub type CodeOffset = u32;

impl CodeBuffer {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn frontier(&self) -> CodeOffset {
        self.bytes.len() as CodeOffset
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn put1(&mut self, b: u8) {
        self.bytes.push(b);
    }

    pub fn put4(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put8(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_slice(&mut self, s: &[u8]) {
        self.bytes.extend_from_slice(s);
    }

    /// Pad with single-byte NOPs (`0x90`) until the next `nbytes`-long
    /// write would not straddle a [`CACHE_LINE`] boundary. Every smashable
    /// emission must be wrapped in this call first.
    pub fn prepare_for_smash(&mut self, nbytes: u32) {
        loop {
            let start = self.frontier();
            let end = start + nbytes;
            if start / CACHE_LINE == (end - 1) / CACHE_LINE {
                return;
            }
            self.put1(0x90);
        }
    }

    /// Align the frontier up to a `to`-byte boundary by emitting NOPs.
    pub fn align(&mut self, to: u32) {
        while self.frontier() % to != 0 {
            self.put1(0x90);
        }
    }

    /// Run `f` with the buffer's write cursor temporarily relocated to
    /// `at`, restoring the original frontier (by truncating back, or by
    /// extending with the previously-written tail) when `f` returns.
    ///
    /// This is how callers patch an already-emitted smashable site: they
    /// never literally move the buffer's logical length backwards and
    /// forwards, they overwrite a fixed-size window in place.
    pub fn patch_at<F: FnOnce(&mut PatchCursor<'_>)>(&mut self, at: CodeOffset, len: u32, f: F) {
        let at = at as usize;
        let len = len as usize;
        assert!(
            at + len <= self.bytes.len(),
            "patch window out of bounds: at={at} len={len} buffer_len={}",
            self.bytes.len()
        );
        let start = (at as u32) / CACHE_LINE;
        let end = ((at as u32) + len - 1) / CACHE_LINE;
        assert_eq!(
            start, end,
            "patch window [{at}, {}) straddles a cache line",
            at + len
        );
        let mut cursor = PatchCursor {
            buf: &mut self.bytes[at..at + len],
            pos: 0,
        };
        f(&mut cursor);
    }
}

/// A bounded, in-place write window produced by [`CodeBuffer::patch_at`].
/// Unlike the main buffer this never grows -- every write must land inside
/// the window reserved when the smashable site was first emitted.
pub struct PatchCursor<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> PatchCursor<'a> {
    pub fn put1(&mut self, b: u8) {
        self.buf[self.pos] = b;
        self.pos += 1;
    }

    pub fn put4(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    pub fn put8(&mut self, v: u64) {
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
    }
}

/// Relocation kinds this crate's emitted code can require once placed in
/// its final cache arena. Kept to exactly two variants because this crate
/// targets one ISA and the three code-cache arenas are guaranteed mutually
/// 32-bit-displacement reachable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reloc {
    /// x86 PC-relative 4-byte displacement (`call`/`jmp rel32`).
    X86PcRel4,
    /// Absolute 8-byte pointer (used only inside the trampoline arena).
    Abs8,
}

impl fmt::Display for Reloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86PcRel4 => write!(f, "PcRel4"),
            Self::Abs8 => write!(f, "Abs8"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_for_smash_never_straddles_a_cache_line() {
        let mut buf = CodeBuffer::new();
        // Push the frontier to a few bytes before a cache-line boundary.
        for _ in 0..(CACHE_LINE - 3) {
            buf.put1(0x90);
        }
        buf.prepare_for_smash(8);
        let start = buf.frontier();
        assert_eq!(start / CACHE_LINE, (start + 7) / CACHE_LINE);
    }

    #[test]
    fn patch_at_overwrites_in_place_without_growing_buffer() {
        let mut buf = CodeBuffer::new();
        buf.put4(0);
        buf.put4(0);
        let len_before = buf.frontier();
        buf.patch_at(0, 4, |c| c.put4(0xdead_beef));
        assert_eq!(buf.frontier(), len_before);
        assert_eq!(&buf.as_slice()[0..4], &0xdead_beef_u32.to_le_bytes());
    }

    #[test]
    #[should_panic(expected = "straddles a cache line")]
    fn patch_at_rejects_cache_line_straddling_windows() {
        let mut buf = CodeBuffer::new();
        for _ in 0..CACHE_LINE + 8 {
            buf.put1(0);
        }
        buf.patch_at(CACHE_LINE - 3, 8, |c| c.put8(0));
    }
}
