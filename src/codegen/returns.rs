//! `RetC`/`RetV`: unwind the current activation record back to the
//! caller.
//!
//! The return value's own decref (if the caller's context doesn't want
//! it) is the caller's problem -- what this module emits is this
//! frame's own cleanup, the frame-pointer restore, and the jump through
//! the saved return address. Locals still holding refcounted values get
//! an inline decref each; this is the one place per function where that
//! cost is paid once instead of at every local's last use, since the
//! analyzer doesn't track per-local liveness precisely enough to elide
//! any of them.

use super::Emitter;
use crate::abi::ActivationRecordLayout;
use crate::regalloc::register_set::Gpr;
use crate::regalloc::RegisterMap;
use crate::service::ServiceRequest;
use crate::types::RuntimeType;

use super::refcount;

/// Locals-to-release counts at or below this are decref'd with a
/// straight-line sequence of inline calls, the same split
/// [`crate::codegen::generators::emit_create_cont`] uses for copying a
/// frame's locals.
pub const INLINE_RELEASE_THRESHOLD: usize = 8;

/// Decref every local in `locals_to_release`, restore the caller's
/// frame and stack pointers, and jump through the saved return address.
/// `release_slot` is preloaded the same way [`refcount::emit_decref`]
/// expects.
///
/// A function with a variable environment (`extract`/`compact`-style
/// dynamic locals) can hold live refcounted values the analyzer never
/// sees as a fixed local list, so `locals_to_release` alone isn't a
/// complete release plan for it; the same is true once the fixed list
/// gets too long to keep inlining cheaply. Both cases fall back to
/// `release_frame_helper`, which walks the frame's real layout at run
/// time instead.
pub fn emit_return(
    emitter: &mut Emitter<'_>,
    regs: &mut RegisterMap,
    locals_to_release: &[(Gpr, RuntimeType)],
    release_slot: Gpr,
    has_var_env: bool,
    release_frame_helper: Gpr,
) -> ServiceRequest {
    regs.clean_all(emitter);
    if has_var_env || locals_to_release.len() > INLINE_RELEASE_THRESHOLD {
        emitter.call_reg(release_frame_helper);
    } else {
        for (reg, ty) in locals_to_release {
            if ty.is_refcounted() {
                refcount::emit_decref(emitter, *reg, ty, release_slot);
            }
        }
    }
    emitter.mov_load(Gpr::Rcx, ActivationRecordLayout::SAVED_RETURN_IP_OFF);
    emitter.mov_load(Gpr::Rbp, ActivationRecordLayout::SAVED_FP_OFF);
    emitter.jmp_reg(Gpr::Rcx);
    ServiceRequest::PostInterpRet
}
