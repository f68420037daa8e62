//! Inline increment/decrement of a value's reference count.
//!
//! A refcounted cell stores its count as the first word of the pointee
//! (not the 16-byte stack/local cell itself, which only holds the
//! pointer and a discriminator). Both directions are emitted fully
//! inline, including the decrement-to-zero release call: the call
//! itself is guarded behind a `jnz` so the common (still-live) case
//! never pays for it.

use super::Emitter;
use crate::abi::STATIC_REFCOUNT;
use crate::regalloc::register_set::Gpr;
use crate::types::RuntimeType;

const REFCOUNT_OFFSET: i32 = 0;

/// `if (*reg != STATIC_REFCOUNT) ++*reg;` A static value's sentinel count
/// is never touched, so this never risks wrapping it into a small
/// positive number that looks live-and-countable.
pub fn emit_incref(emitter: &mut Emitter<'_>, reg: Gpr) {
    let skip = emitter.cmp_and_skip_if_static(reg);
    emitter.add_mem_imm8(reg, REFCOUNT_OFFSET, 0, 1);
    emitter.patch_short_jump(skip);
}

/// `if (*reg != STATIC_REFCOUNT && --*reg == 0) release(reg);` The
/// release call is an indirect call through `release_slot`, a register
/// preloaded by the caller with the per-type release routine's address
/// (the same per-type dispatch [`crate::codegen::globals`] uses for
/// name caches). Emitted inline: a decrement-to-zero is rare but not
/// rare enough here to be worth the cross-arena bookkeeping a cold-path
/// placement would need.
pub fn emit_decref(emitter: &mut Emitter<'_>, reg: Gpr, ty: &RuntimeType, release_slot: Gpr) {
    let skip_all = emitter.cmp_and_skip_if_static(reg);
    emitter.add_mem_imm8(reg, REFCOUNT_OFFSET, 5, -1);
    // `jnz` past the release call -- only a decrement to exactly zero
    // reaches the helper.
    let skip_release = emitter.jcc_rel32_placeholder(0x85);
    emitter.call_reg(release_slot);
    emitter.patch_short_jump(skip_release);
    emitter.patch_short_jump(skip_all);
    let _ = ty;
}

impl<'a> Emitter<'a> {
    /// `cmp dword [reg], STATIC_REFCOUNT; je <end>` -- returns the
    /// placeholder's end offset so the caller can patch it once `<end>`
    /// is known via [`Emitter::patch_short_jump`].
    fn cmp_and_skip_if_static(&mut self, reg: Gpr) -> crate::asm::CodeOffset {
        self.cmp_mem_imm32(reg, REFCOUNT_OFFSET, STATIC_REFCOUNT as u32);
        self.jcc_rel32_placeholder(0x84)
    }
}
