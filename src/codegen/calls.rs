//! The `FCall` sequence: invoking the in-flight activation record built
//! up by the preceding `FPush*`/`FPassC` run.
//!
//! The call site itself is smashable -- its first execution always goes
//! through [`crate::service::ServiceRequest::BindCall`] to resolve the
//! callee, and later executions may be rebound if profiling decides a
//! different target is now more likely. Before the call, the current
//! bytecode offset is stamped into the new frame's
//! [`crate::abi::ActivationRecordLayout::PRECEDING_CALL_OFF`] slot, so a
//! stack-overflow or re-entry in the callee can find its way back here
//! without the fixup map (which isn't populated until the call actually
//! returns).

use super::Emitter;
use crate::abi::ActivationRecordLayout;
use crate::regalloc::register_set::Gpr;
use crate::regalloc::RegisterMap;
use crate::service::ServiceRequest;

/// Emit one `FCall`: stamp the preceding-call offset into the new
/// frame, then a smashable direct call with its displacement left
/// zeroed. Returns the `BindCall` request the shared emission sequence
/// hands back to the dispatcher; the actual callee address is resolved
/// and the site patched to reach it the first time this request is
/// serviced (and again on any later rebind).
pub fn emit_call(emitter: &mut Emitter<'_>, regs: &mut RegisterMap, bc_offset: u32, ar_reg: Gpr) -> ServiceRequest {
    regs.clean_all(emitter);
    emitter.mov_mem_imm32(ar_reg, ActivationRecordLayout::PRECEDING_CALL_OFF, bc_offset);
    let placeholder_end = emitter.call_rel32_placeholder();
    ServiceRequest::BindCall { call_site: placeholder_end - 5 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::CodeBuffer;
    use crate::fixup::{FixupMap, UnwindRegMap};

    #[test]
    fn fcall_emits_a_bind_call_request() {
        let mut main = CodeBuffer::new();
        let mut cold = CodeBuffer::new();
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
        let mut regs = RegisterMap::new();
        let req = emit_call(&mut emitter, &mut regs, 10, Gpr::Rbx);
        assert!(matches!(req, ServiceRequest::BindCall { .. }));
    }
}
