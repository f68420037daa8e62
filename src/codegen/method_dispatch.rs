//! Call-target resolution for method and static-method call sequences.
//!
//! `FPushObjMethodD`/`FPushClsMethodD`/`FPushClsMethodF` each resolve a
//! callee that depends on the receiver's runtime class, not just its
//! static name -- a per-call-site cache (keyed by the observed class)
//! rather than a single shared slot like [`crate::codegen::globals`]
//! uses for names. Two policies exist for how eagerly that cache is
//! trusted:
//! - burned-in: the first observed class is baked directly into the
//!   call site as an immediate compare, with no indirection through a
//!   cache slot at all. Cheapest, but only sound for call sites that
//!   monomorphic profiling has shown never see a second class.
//! - per-site cache: a guard compares the receiver's class against the
//!   cached one and falls back to the interpreter on a miss, same shape
//!   as a global fetch.

use super::Emitter;
use crate::abi::CELL_DISCRIMINATOR_OFFSET;
use crate::regalloc::register_set::Gpr;

/// Burn the expected class id directly into the call site as an
/// immediate compare against the receiver's class-identity word,
/// falling back to `interp_helper` (preloaded address) on any mismatch.
/// Rebinding this call site to a different class later requires
/// smashing the immediate, which [`crate::cache`] is responsible for.
pub fn emit_burned_in_check(emitter: &mut Emitter<'_>, receiver: Gpr, expected_class_id: u32, interp_helper: Gpr) {
    emitter.cmp_mem_imm32(receiver, CELL_DISCRIMINATOR_OFFSET as i32, expected_class_id);
    let skip = emitter.jcc_rel32_placeholder(0x84); // je: matches, skip the interpreter fallback
    emitter.call_reg(interp_helper);
    emitter.patch_short_jump(skip);
}

/// Per-site cache variant: compare the receiver's class-identity word
/// directly against the expected class id already resolved into this
/// call site's cache, so a polymorphic call site can still hit its
/// most-recently-seen class without smashing code. `scratch` must not
/// alias `receiver`.
pub fn emit_cached_dispatch(emitter: &mut Emitter<'_>, receiver: Gpr, scratch: Gpr, cache_base: Gpr, cache_off: i32, miss_helper: Gpr) {
    emitter.mov_load_base(scratch, cache_base, cache_off);
    emitter.cmp_mem_reg(receiver, CELL_DISCRIMINATOR_OFFSET as i32, scratch);
    let skip = emitter.jcc_rel32_placeholder(0x84);
    emitter.call_reg(miss_helper);
    emitter.patch_short_jump(skip);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::CodeBuffer;
    use crate::fixup::{FixupMap, UnwindRegMap};

    #[test]
    fn burned_in_check_emits_an_immediate_compare() {
        let mut main = CodeBuffer::new();
        let mut cold = CodeBuffer::new();
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
        emit_burned_in_check(&mut emitter, Gpr::Rax, 42, Gpr::Rcx);
        assert!(main.frontier() > 0);
    }

    #[test]
    fn cached_dispatch_loads_before_comparing() {
        let mut main = CodeBuffer::new();
        let mut cold = CodeBuffer::new();
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
        emit_cached_dispatch(&mut emitter, Gpr::Rax, Gpr::Rdx, Gpr::R12, 16, Gpr::Rcx);
        assert!(main.frontier() > 0);
    }
}
