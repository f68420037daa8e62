//! Function-entry sequences.
//!
//! A prologue is the shared adapter between a call site and a function
//! body: it owns the function-identity guard direct calls are bound
//! against, adapts whatever argument count the caller actually passed
//! to what the callee declares, installs the frame, and hands off to
//! the body's own translation via a bind-jump. One prologue is emitted
//! per `(function, arg count bucket)` pair, where the bucket is
//! `min(n_passed, num_params + 1)` -- see [`crate::unit::FuncShape::arg_count_bucket`].

use crate::abi::{self, ActivationRecordLayout};
use crate::codegen::Emitter;
use crate::key::BcOffset;
use crate::regalloc::register_set::Gpr;
use crate::service::ServiceRequest;
use crate::unit::FuncShape;

/// Registers the prologue reads on entry: the callee-function identity
/// (compared against the guard immediate), the argument count the
/// caller actually passed, and a scratch register for the zero-init
/// loop and helper calls.
pub struct PrologueInputs {
    pub func_identity: Gpr,
    pub n_passed: Gpr,
    pub scratch: Gpr,
}

/// Where a prologue's func guard landed, so the caller (the translation
/// cache, on interception or rename) can find and zero it. `offset` is
/// the position of the 4-byte identity immediate itself, not the start
/// of the `cmp` instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuardSite {
    pub offset: u32,
}

/// Emit one prologue for `shape` at argument-count bucket
/// `n_passed_bucket`. `overflow_helper` raises the stack-overflow
/// service request; `trim_args_helper` and `shuffle_helper` are
/// preloaded call targets for the argument-adaptation and magic-call
/// paths respectively; `zero_locals_helper` is the preloaded target for
/// the large-frame zero-init fallback (see
/// [`emit_frame_install_and_zero_init`]). Returns the func guard's site
/// (for later interception) and the bind-jump request handing off to
/// the body.
pub fn emit_prologue(
    emitter: &mut Emitter<'_>,
    shape: &FuncShape,
    n_passed_bucket: u32,
    inputs: &PrologueInputs,
    overflow_helper: Gpr,
    trim_args_helper: Gpr,
    zero_locals_helper: Gpr,
) -> (GuardSite, ServiceRequest) {
    let guard = emit_func_guard(emitter, shape, inputs);
    emit_stack_overflow_check(emitter, inputs.scratch, overflow_helper);
    emit_arg_count_adaptation(emitter, shape, n_passed_bucket, inputs, trim_args_helper);
    emit_frame_install_and_zero_init(emitter, shape, inputs.scratch, zero_locals_helper);
    emit_entry_hook(emitter, inputs.scratch);

    let entry_offset = missing_param_default_offset(shape, n_passed_bucket).unwrap_or(0);
    (guard, ServiceRequest::BindJmp { target: entry_offset })
}

/// The func guard: compare `func_identity` against this function's
/// identity immediate (emitted 8-byte aligned so an interception can
/// atomically zero it), falling through to a redispatch thunk read
/// from the callee's prologue table on mismatch.
fn emit_func_guard(emitter: &mut Emitter<'_>, shape: &FuncShape, inputs: &PrologueInputs) -> GuardSite {
    emitter.buf().align(8);
    emitter.cmp_mem_imm32(inputs.func_identity, ActivationRecordLayout::FUNC_PTR_OFF, shape.id.0);
    let offset = emitter.buf().frontier() - 4;
    let skip = emitter.jcc_rel32_placeholder(0x84);
    // Mismatch: fall through to the redispatch thunk (emitted by the
    // cache layer once the callee's own prologue table exists); this
    // crate only needs to reserve the branch shape here.
    emitter.call_reg(inputs.scratch);
    emitter.patch_short_jump(skip);
    GuardSite { offset }
}

fn emit_stack_overflow_check(emitter: &mut Emitter<'_>, scratch: Gpr, overflow_helper: Gpr) {
    emitter.cmp_reg_reg(abi::STACK_PTR, scratch);
    let skip = emitter.jcc_rel32_placeholder(0x83);
    emitter.call_reg(overflow_helper);
    emitter.patch_short_jump(skip);
}

fn emit_arg_count_adaptation(
    emitter: &mut Emitter<'_>,
    shape: &FuncShape,
    n_passed_bucket: u32,
    inputs: &PrologueInputs,
    trim_args_helper: Gpr,
) {
    if n_passed_bucket > shape.num_params {
        // This bucket only exists because at least one extra argument
        // was passed (`bucket = min(n_passed, num_params + 1)`); the
        // helper re-reads the actual count off `NUM_ARGS_OFF` to know
        // how many to stash or drop.
        emitter.call_reg(trim_args_helper);
        return;
    }
    for missing in n_passed_bucket..shape.num_params {
        if shape.param_defaults.get(missing as usize).copied().flatten().is_some() {
            continue;
        }
        let off = ActivationRecordLayout::local_offset(missing);
        emitter.mov_mem_imm32(abi::FRAME_PTR, off + abi::CELL_DISCRIMINATOR_OFFSET as i32, uninit_discriminator());
    }
}

fn uninit_discriminator() -> u32 {
    0
}

/// The bytecode offset of the default-value funclet the prologue should
/// hand off to, if the bucket left the earliest missing parameter
/// without a value and that parameter declares one. `None` means the
/// regular function entry point (offset 0) applies.
fn missing_param_default_offset(shape: &FuncShape, n_passed_bucket: u32) -> Option<BcOffset> {
    if n_passed_bucket >= shape.num_params {
        return None;
    }
    shape.param_defaults.get(n_passed_bucket as usize).copied().flatten()
}

/// Frame-pointer install (the caller's stashed activation record becomes
/// this frame's `rbp`) followed by local zero-init: small counts get an
/// unrolled discriminator write per slot, larger ones load the count
/// into `scratch` and hand off to a helper that loops over it at run
/// time -- the same inline-vs-helper split
/// [`crate::codegen::generators::emit_create_cont`] uses for copying a
/// frame's locals.
fn emit_frame_install_and_zero_init(emitter: &mut Emitter<'_>, shape: &FuncShape, scratch: Gpr, zero_locals_helper: Gpr) {
    const UNROLL_THRESHOLD: u32 = 16;
    emitter.mov_reg_reg(abi::FRAME_PTR, abi::STASHED_AR);
    if shape.num_locals <= UNROLL_THRESHOLD {
        for local_id in 0..shape.num_locals {
            let off = ActivationRecordLayout::local_offset(local_id);
            emitter.mov_mem_imm32(abi::FRAME_PTR, off + abi::CELL_DISCRIMINATOR_OFFSET as i32, uninit_discriminator());
        }
    } else {
        emitter.mov_reg_imm32(scratch, shape.num_locals);
        emitter.call_reg(zero_locals_helper);
    }
}

/// Test the surprise flags and call the function-entry event hook if
/// set; reached via a cold arm so the common case pays only the compare.
fn emit_entry_hook(emitter: &mut Emitter<'_>, scratch: Gpr) {
    emitter.cmp_mem_imm32(abi::TLS_BASE, 0, 0);
    let skip = emitter.jcc_rel32_placeholder(0x84);
    emitter.call_reg(scratch);
    emitter.patch_short_jump(skip);
}

/// The magic-call variant: before the regular two-argument prologue
/// runs, repack the caller's arguments into the invocation-name plus
/// args-array form `__call`/`__callStatic` expects. `shuffle_helper` is
/// the preloaded address of that repacking routine; its own entry point
/// is distinct from the regular prologue's, so callers that know they
/// are dispatching a magic call can jump straight past the guard.
pub fn emit_magic_call_prologue(
    emitter: &mut Emitter<'_>,
    shape: &FuncShape,
    n_passed_bucket: u32,
    inputs: &PrologueInputs,
    overflow_helper: Gpr,
    trim_args_helper: Gpr,
    shuffle_helper: Gpr,
    zero_locals_helper: Gpr,
) -> (GuardSite, ServiceRequest) {
    emitter.call_reg(shuffle_helper);
    emit_prologue(
        emitter,
        shape,
        n_passed_bucket,
        inputs,
        overflow_helper,
        trim_args_helper,
        zero_locals_helper,
    )
}

/// Zero a func guard's immediate in place, forcing every future direct
/// call through it to miss into the redispatch thunk -- the mechanism
/// behind both function interception and function renaming. The
/// surrounding prologue is left untouched; only the 4-byte identity
/// immediate at `guard.offset` is patched.
pub fn zero_guard(emitter: &mut Emitter<'_>, guard: GuardSite) {
    emitter.buf().patch_at(guard.offset, 4, |c| c.put4(0));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::CodeBuffer;
    use crate::fixup::{FixupMap, UnwindRegMap};

    fn shape(num_params: u32, num_locals: u32) -> FuncShape {
        FuncShape {
            id: crate::key::FuncId(7),
            num_params,
            num_locals,
            param_defaults: vec![None; num_params as usize],
            uses_extra_args: false,
            has_var_env: false,
            is_pseudomain: false,
        }
    }

    #[test]
    fn prologue_emits_a_bind_jmp_to_the_function_entry_when_fully_applied() {
        let mut main = CodeBuffer::new();
        let mut cold = CodeBuffer::new();
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
        let inputs = PrologueInputs {
            func_identity: Gpr::Rdi,
            n_passed: Gpr::Rsi,
            scratch: Gpr::Rcx,
        };
        let (_, req) = emit_prologue(&mut emitter, &shape(2, 3), 2, &inputs, Gpr::Rdx, Gpr::R8, Gpr::R9);
        assert_eq!(req, ServiceRequest::BindJmp { target: 0 });
        assert!(main.frontier() > 0);
    }

    #[test]
    fn missing_required_params_without_defaults_resolve_to_entry_zero() {
        let s = shape(3, 3);
        assert_eq!(missing_param_default_offset(&s, 1), None);
    }

    #[test]
    fn missing_param_with_a_default_funclet_resolves_to_its_offset() {
        let mut s = shape(2, 2);
        s.param_defaults[1] = Some(40);
        assert_eq!(missing_param_default_offset(&s, 1), Some(40));
    }

    #[test]
    fn zero_guard_clears_the_identity_immediate() {
        let mut main = CodeBuffer::new();
        let mut cold = CodeBuffer::new();
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
        let inputs = PrologueInputs {
            func_identity: Gpr::Rdi,
            n_passed: Gpr::Rsi,
            scratch: Gpr::Rcx,
        };
        let (guard, _) = emit_prologue(&mut emitter, &shape(0, 0), 0, &inputs, Gpr::Rdx, Gpr::R8, Gpr::R9);
        zero_guard(&mut emitter, guard);
        let at = guard.offset as usize;
        assert_eq!(&main.as_slice()[at..at + 4], &0u32.to_le_bytes());
    }

    #[test]
    fn large_frames_zero_init_via_a_helper_call_instead_of_unrolling() {
        let mut main = CodeBuffer::new();
        let mut cold = CodeBuffer::new();
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
        let inputs = PrologueInputs {
            func_identity: Gpr::Rdi,
            n_passed: Gpr::Rsi,
            scratch: Gpr::Rcx,
        };
        emit_frame_install_and_zero_init(&mut emitter, &shape(0, 64), inputs.scratch, Gpr::R9);
        // A count load plus one call is far shorter than unrolling 64 stores.
        assert!(main.frontier() < 20);
    }
}
