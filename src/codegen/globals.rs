//! Global-variable fetch through a per-name cache handle.
//!
//! Each statically-named global fetch site (`CGetG`) is assigned one
//! 8-byte slot off [`crate::abi::TLS_BASE`], resolved once by the
//! embedding runtime's name table and then reused for the lifetime of
//! the process. Emitted code loads the slot, checks it for null (the
//! name was never bound, or has since been unset), and falls back to an
//! interpreter helper on a miss rather than trying to populate the
//! cache itself -- cache population is a cold, rare event not worth
//! inlining.

use super::Emitter;
use crate::abi::{self, CELL_DATA_OFFSET};
use crate::regalloc::register_set::Gpr;

/// Byte offset within the thread-local cache region of the name-cache
/// slot for global fetch site `cache_slot`.
fn slot_offset(cache_slot: u32) -> i32 {
    (cache_slot as i32) * 8
}

/// Load the cached global's value pointer into `dst`, calling through
/// `miss_helper` (an address preloaded into a register by the caller,
/// same convention as [`crate::codegen::refcount::emit_decref`]'s
/// release slot) when the slot is null.
pub fn emit_global_fetch(emitter: &mut Emitter<'_>, dst: Gpr, cache_slot: u32, miss_helper: Gpr) {
    emitter.mov_load_base(dst, abi::TLS_BASE, slot_offset(cache_slot));
    emitter.cmp_mem_imm32(dst, CELL_DATA_OFFSET as i32, 0);
    let skip_miss = emitter.jcc_rel32_placeholder(0x85); // jne: slot was non-null
    emitter.call_reg(miss_helper);
    emitter.patch_short_jump(skip_miss);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::CodeBuffer;
    use crate::fixup::{FixupMap, UnwindRegMap};

    #[test]
    fn global_fetch_loads_then_checks_the_cache_slot() {
        let mut main = CodeBuffer::new();
        let mut cold = CodeBuffer::new();
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
        emit_global_fetch(&mut emitter, Gpr::Rax, 3, Gpr::Rcx);
        assert!(main.frontier() > 0);
    }

    #[test]
    fn distinct_cache_slots_get_distinct_offsets() {
        assert_ne!(slot_offset(0), slot_offset(1));
    }
}
