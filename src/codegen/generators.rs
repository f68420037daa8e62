//! Generator/continuation materialization and resumption.
//!
//! `CreateCont` snapshots the current frame's locals into a
//! heap-allocated continuation object so the frame can be torn down
//! while the generator is suspended; `ContEnter` does the reverse,
//! restoring them before jumping into the generator body. Both are rare
//! enough, and touch enough fields, that inlining the whole copy is not
//! worth it except for very small frames -- this crate inlines only
//! below [`SMALL_FRAME_LOCAL_THRESHOLD`] locals and otherwise falls back
//! to a helper that loops over the count at run time.

use super::Emitter;
use crate::abi::ActivationRecordLayout;
use crate::regalloc::register_set::Gpr;
use crate::service::ServiceRequest;

/// Locals counts at or below this are copied with a straight-line
/// sequence of loads/stores; above it, a helper call handles the loop.
pub const SMALL_FRAME_LOCAL_THRESHOLD: u32 = 8;

/// Materialize a continuation object from the current frame. For small
/// frames, copy each local inline via `scratch`; otherwise hand the
/// whole frame to a helper (preloaded in `helper`) that knows how to
/// walk an arbitrary local count.
pub fn emit_create_cont(emitter: &mut Emitter<'_>, num_locals: u32, scratch: Gpr, helper: Gpr) -> ServiceRequest {
    if num_locals <= SMALL_FRAME_LOCAL_THRESHOLD {
        for local_id in 0..num_locals {
            let off = ActivationRecordLayout::local_offset(local_id);
            emitter.mov_load(scratch, off);
            emitter.mov_store(off, scratch);
        }
    } else {
        emitter.call_reg(helper);
    }
    ServiceRequest::PostInterpRet
}

/// Resume a suspended generator: the mirror copy of
/// [`emit_create_cont`], restoring locals from the continuation object
/// back into the fresh frame before falling through into the generator
/// body's bound resumption point.
pub fn emit_cont_enter(
    emitter: &mut Emitter<'_>,
    num_locals: u32,
    scratch: Gpr,
    helper: Gpr,
    resume_key: crate::key::SourceKey,
) -> ServiceRequest {
    if num_locals <= SMALL_FRAME_LOCAL_THRESHOLD {
        for local_id in 0..num_locals {
            let off = ActivationRecordLayout::local_offset(local_id);
            emitter.mov_load(scratch, off);
            emitter.mov_store(off, scratch);
        }
    } else {
        emitter.call_reg(helper);
    }
    ServiceRequest::Resume { key: resume_key }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::CodeBuffer;
    use crate::fixup::{FixupMap, UnwindRegMap};

    #[test]
    fn small_frames_copy_inline() {
        let mut main = CodeBuffer::new();
        let mut cold = CodeBuffer::new();
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
        emit_create_cont(&mut emitter, 2, Gpr::Rax, Gpr::Rcx);
        assert!(main.frontier() > 0);
    }

    #[test]
    fn large_frames_fall_back_to_a_helper() {
        let mut main = CodeBuffer::new();
        let mut cold = CodeBuffer::new();
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
        let before = main.frontier();
        emit_create_cont(&mut emitter, SMALL_FRAME_LOCAL_THRESHOLD + 1, Gpr::Rax, Gpr::Rcx);
        // A single call is shorter than copying nine locals inline.
        assert!(main.frontier() - before < 20);
    }
}
