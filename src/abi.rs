//! The ABI emitted code observes: cell layout, activation-record layout,
//! and the fixed register roles tying the two together.

use crate::asm::regs;
use crate::regalloc::register_set::Gpr;

/// A value is a 16-byte `(data word, discriminator word)` tuple. The
/// discriminator's low bits carry the type tag; `DataType` variants map
/// onto it 1:1 (kept in [`crate::types`], not duplicated here).
pub const CELL_SIZE: u32 = 16;
pub const CELL_DATA_OFFSET: u32 = 0;
pub const CELL_DISCRIMINATOR_OFFSET: u32 = 8;

/// The reserved out-of-band refcount value meaning "static, never freed."
/// A single signed compare against this sentinel distinguishes "static"
/// from "refcounted, maybe zero" without a separate flag bit.
pub const STATIC_REFCOUNT: i32 = i32::MIN;

/// Byte layout of one activation record (a function-call frame), in the
/// order the prologue lays locals out above it. Offsets are relative to
/// the frame-pointer value installed at the end of the prologue.
#[derive(Debug, Clone, Copy)]
pub struct ActivationRecordLayout;

impl ActivationRecordLayout {
    pub const SAVED_FP_OFF: i32 = 0;
    pub const SAVED_RETURN_IP_OFF: i32 = 8;
    pub const FUNC_PTR_OFF: i32 = 16;
    /// `this` pointer for instance calls, or the resolved class pointer
    /// for static calls; which interpretation applies is carried by the
    /// function pointer's own flags.
    pub const THIS_OR_CLS_OFF: i32 = 24;
    pub const NUM_ARGS_OFF: i32 = 32;
    /// Set when this activation was created via `new` (constructor call).
    pub const CTOR_FLAG_BIT: u32 = 0;
    pub const VAR_ENV_PTR_OFF: i32 = 36;
    /// The bytecode offset of the instruction immediately following the
    /// `FCall` that created this frame, recorded before the call executes.
    /// `POST_INTERP_RET` and `STACK_OVERFLOW` resolve through this when
    /// the fixup map alone can't help -- e.g. an overflow detected before
    /// any fixup-eligible call has executed in the new frame.
    pub const PRECEDING_CALL_OFF: i32 = 44;
    /// First local slot; locals count down from here toward lower
    /// addresses as `Location::Local(0)`, `Location::Local(1)`, ...
    pub const FIRST_LOCAL_OFF: i32 = 48;

    pub fn local_offset(local_id: u32) -> i32 {
        Self::FIRST_LOCAL_OFF + (local_id as i32) * CELL_SIZE as i32
    }
}

/// Fixed register roles emitted code relies on, re-exported here so ABI
/// consumers (prologue emission, call sequence emission) import one
/// module instead of reaching into `asm::regs` directly.
pub const STACK_PTR: Gpr = regs::STACK_PTR;
pub const FRAME_PTR: Gpr = regs::FRAME_PTR;
pub const TLS_BASE: Gpr = regs::TLS_BASE;
pub const STASHED_AR: Gpr = regs::STASHED_AR;
pub const ASM_SCRATCH: Gpr = regs::ASM_SCRATCH;
pub const SERVICE_ID: Gpr = regs::SERVICE_ID;

/// The small fixed set of argument registers a service request's
/// calling convention uses to carry its id plus arguments, in order.
pub const SERVICE_ARG_REGS: [Gpr; 3] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx];

/// Bytes reserved below the frame pointer for the tracelet's symbolic
/// stack (`Location::Stack`), below the activation record's own fields
/// and locals.
pub const STACK_SPILL_BASE_OFF: i32 = -512;

/// Frame-pointer-relative byte offset of `loc`'s memory home, or `None`
/// for locations that never spill to memory (literals, scratch
/// temporaries, the invalid sentinel).
pub fn memory_offset(loc: &crate::loc::Location) -> Option<i32> {
    use crate::loc::Location;
    match loc {
        Location::Local(id) => Some(ActivationRecordLayout::local_offset(*id)),
        Location::Stack(off) => Some(STACK_SPILL_BASE_OFF + off * CELL_SIZE as i32),
        Location::Iterator(_) | Location::Literal(_) | Location::Scratch(_) | Location::Invalid => {
            None
        }
    }
}
