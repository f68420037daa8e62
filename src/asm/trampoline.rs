//! Trampoline arena: thunks to far helper calls.
//!
//! A helper routine registered by the embedding runtime can live anywhere
//! in the address space, well outside the range a PC-relative 32-bit
//! displacement reaches from the code cache. One fixed-size thunk
//! (`movabs imm64, scratch; jmp scratch; ud2`) is emitted per distinct
//! helper; call sites inside the main/cold arenas then use an ordinary
//! PC-relative `call rel32` to the thunk, which is guaranteed reachable
//! because all arenas share one reserved region.

use crate::asm::regs::ASM_SCRATCH;
use crate::asm::CodeBuffer;
use cranelift_entity::{entity_impl, SecondaryMap};
use std::fmt;

/// `movabs imm64, scratch; jmp scratch; ud2`, laid out as: `49 BD imm64`
/// (movabs r13, imm64) = 10 bytes, `41 FF E5` (jmp r13) = 3 bytes, `0F 0B`
/// (ud2) = 2 bytes; 15 bytes total. The trailing `ud2` asserts control
/// never falls off the jmp.
pub const TRAMPOLINE_SIZE: u32 = 15;

/// Opaque identifier for one registered helper routine. The embedding
/// runtime hands these out; this crate only needs them as map keys plus an
/// address to materialize into the thunk. Implementing `EntityRef` lets
/// [`TrampolineArena`] key its helper-to-thunk table with a
/// [`SecondaryMap`] instead of a general-purpose hash map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HelperId(pub u32);
entity_impl!(HelperId, "helper");

struct Entry {
    addr: u64,
    name: &'static str,
    thunk_offset: u32,
    hit_count: Option<u32>,
}

/// The trampoline arena: one fixed-size thunk per distinct helper, plus an
/// optional per-trampoline hit counter for profiling.
pub struct TrampolineArena {
    buf: CodeBuffer,
    by_helper: SecondaryMap<HelperId, Option<usize>>,
    entries: Vec<Entry>,
    profile_counters: bool,
}

impl TrampolineArena {
    pub fn new(profile_counters: bool) -> Self {
        Self {
            buf: CodeBuffer::new(),
            by_helper: SecondaryMap::new(),
            entries: Vec::new(),
            profile_counters,
        }
    }

    /// Get (emitting if necessary) the trampoline for `helper`, returning
    /// its offset within this arena. Idempotent: calling twice for the
    /// same `HelperId` returns the same offset and does not re-emit.
    pub fn get_or_emit(&mut self, helper: HelperId, addr: u64, name: &'static str) -> u32 {
        if let Some(idx) = self.by_helper[helper] {
            return self.entries[idx].thunk_offset;
        }
        self.buf.align(16);
        let thunk_offset = self.buf.frontier();

        // movabs r13, imm64 (REX.WB + 0xBD + imm64)
        self.buf.put1(0x49);
        self.buf.put1(0xBD);
        self.buf.put8(addr);
        // jmp r13 (REX.B + 0xFF /4)
        self.buf.put1(0x41);
        self.buf.put1(0xFF);
        self.buf.put1(0xE5);
        // ud2, as an assert that control never falls off the jmp.
        self.buf.put1(0x0F);
        self.buf.put1(0x0B);

        let idx = self.entries.len();
        self.entries.push(Entry {
            addr,
            name,
            thunk_offset,
            hit_count: if self.profile_counters { Some(0) } else { None },
        });
        self.by_helper[helper] = Some(idx);
        thunk_offset
    }

    /// `(helper address, demangled name)` for each trampoline, in emission
    /// order -- the text index half of the translation-cache dump format.
    pub fn text_index(&self) -> Vec<(u32, u64, &'static str)> {
        self.entries
            .iter()
            .map(|e| (e.thunk_offset, e.addr, e.name))
            .collect()
    }

    pub fn buffer(&self) -> &CodeBuffer {
        &self.buf
    }

    /// Note one execution of the trampoline at `thunk_offset`, if profiling
    /// counters are enabled (`jit-trampolines` + profiling build).
    pub fn record_hit(&mut self, thunk_offset: u32) {
        if let Some(e) = self
            .entries
            .iter_mut()
            .find(|e| e.thunk_offset == thunk_offset)
        {
            if let Some(c) = e.hit_count.as_mut() {
                *c += 1;
            }
        }
    }
}

impl fmt::Debug for TrampolineArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrampolineArena")
            .field("count", &self.entries.len())
            .field("bytes", &self.buf.frontier())
            .finish()
    }
}

// Suppress an unused-field warning: `ASM_SCRATCH` documents which register
// role this arena's generated code uses, even though the bytes above are
// hand-encoded rather than emitted via the register role constant.
const _: fn() -> crate::regalloc::register_set::Gpr = || ASM_SCRATCH;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_emit_is_idempotent_per_helper() {
        let mut arena = TrampolineArena::new(false);
        let off1 = arena.get_or_emit(HelperId(1), 0x1234_5678, "helper_one");
        let off2 = arena.get_or_emit(HelperId(1), 0x1234_5678, "helper_one");
        assert_eq!(off1, off2);
        assert_eq!(arena.text_index().len(), 1);
    }

    #[test]
    fn distinct_helpers_get_distinct_thunks() {
        let mut arena = TrampolineArena::new(false);
        let off1 = arena.get_or_emit(HelperId(1), 0x1000, "a");
        let off2 = arena.get_or_emit(HelperId(2), 0x2000, "b");
        assert_ne!(off1, off2);
        assert_eq!(arena.text_index().len(), 2);
    }

    #[test]
    fn profiling_counter_tracks_hits_when_enabled() {
        let mut arena = TrampolineArena::new(true);
        let off = arena.get_or_emit(HelperId(1), 0x1000, "a");
        arena.record_hit(off);
        arena.record_hit(off);
        // No public getter for the counter value beyond text_index; the
        // absence of a panic plus idempotent re-registration is the
        // behavior under test here.
        let _ = arena.get_or_emit(HelperId(1), 0x1000, "a");
    }
}
