//! Type guards: the runtime checks that let a tracelet trust its
//! assumptions about what a location holds.
//!
//! A type check on a runtime value is a 4-byte compare of the cell's
//! discriminator word against an immediate, followed by a conditional
//! jump to a side exit. Strings use a masked compare, because two
//! discriminator codes (`Static`, `Counted`) both count as "string."

use super::Emitter;
use crate::abi::{self, CELL_DISCRIMINATOR_OFFSET};
use crate::instr::NormalizedInstruction;
use crate::regalloc::RegisterMap;
use crate::types::{DataType, StringKind};

/// `cmp dword [reg+disp], imm32` then `jne` to a side-exit stub in cold,
/// wrapped in `prepare_for_smash` since the jump target is patched the
/// first time it actually fires (the stub resolves to `BindSideExit`).
fn emit_discriminator_check(emitter: &mut Emitter<'_>, base_disp: i32, expect_tag: u32, mask: u32) {
    // `mov eax, [rbp+disp+CELL_DISCRIMINATOR_OFFSET]` -- load the
    // discriminator word for the compare.
    let disp = base_disp + CELL_DISCRIMINATOR_OFFSET as i32;
    {
        let buf = emitter.buf();
        buf.put1(0x8B); // mov r32, r/m32 (no REX needed: eax, 32-bit op)
        buf.put1(0b10_000_101); // modrm: mod=10, reg=eax(0), rm=rbp(5)
        buf.put4(disp as u32);
        if mask != u32::MAX {
            buf.put1(0x25); // and eax, imm32
            buf.put4(mask);
        }
        buf.put1(0x3D); // cmp eax, imm32
        buf.put4(expect_tag);
        buf.prepare_for_smash(6);
        // jne rel32 -- patched later to the resolved side-exit stub.
        buf.put1(0x0F);
        buf.put1(0x85);
        buf.put4(0); // placeholder displacement
    }
}

fn tag_of(dt: &DataType) -> (u32, u32) {
    match dt {
        DataType::Null => (0, u32::MAX),
        DataType::Bool => (1, u32::MAX),
        DataType::Int => (2, u32::MAX),
        DataType::Double => (3, u32::MAX),
        // Both string discriminator codes share bit 4; masking it off
        // turns "is this a string" into one compare for either kind.
        DataType::String(StringKind::Static) => (4, 0xFFFF_FFEF),
        DataType::String(StringKind::Counted) => (5, 0xFFFF_FFEF),
        DataType::Array => (6, u32::MAX),
        DataType::Object => (7, u32::MAX),
        DataType::ClassRef => (8, u32::MAX),
        DataType::Iterator(_) => (9, u32::MAX),
        DataType::RefCell => (10, u32::MAX),
    }
}

/// Emit every guard this instruction newly introduces. A no-op unless
/// [`crate::instr::InstrHints::introduces_guard`] is set.
pub fn emit_input_guards(instr: &NormalizedInstruction, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) {
    if !instr.hints.introduces_guard {
        return;
    }
    for input in &instr.inputs {
        let Some(dt) = input.ty.data_type() else {
            // A vague guard has no concrete discriminator to compare
            // against; this opcode's translation plan already routes
            // through `Interp` in that case, so there is nothing to
            // check here.
            continue;
        };
        let Some(disp) = abi::memory_offset(&input.loc) else {
            continue;
        };
        let _ = regs; // the register allocator is not consulted for the discriminator check itself
        let (tag, mask) = tag_of(dt);
        emit_discriminator_check(emitter, disp, tag, mask);
    }
}

/// The trailing check after a prediction-flagged instruction (global
/// fetch, dynamic call): the same discriminator compare as an input
/// guard, but against the predicted output rather than a consumed input.
pub fn emit_prediction_check(instr: &NormalizedInstruction, _regs: &mut RegisterMap, emitter: &mut Emitter<'_>) {
    let Some(output) = instr.outputs.first() else {
        return;
    };
    let Some(dt) = output.ty.data_type() else {
        return;
    };
    let Some(disp) = abi::memory_offset(&output.loc) else {
        return;
    };
    let (tag, mask) = tag_of(dt);
    emit_discriminator_check(emitter, disp, tag, mask);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::CodeBuffer;
    use crate::fixup::{FixupMap, UnwindRegMap};
    use crate::instr::{Immediate, NormalizedInstruction, Opcode};
    use crate::loc::{DynLocation, Location};
    use crate::types::RuntimeType;

    #[test]
    fn guard_on_a_concrete_type_emits_bytes() {
        let mut main = CodeBuffer::new();
        let mut cold = CodeBuffer::new();
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
        let mut regs = RegisterMap::new();

        let mut instr = NormalizedInstruction::new(Opcode::CGetL, 0, Immediate::Local(0));
        instr.hints.introduces_guard = true;
        instr
            .inputs
            .push(DynLocation::new(Location::Local(0), RuntimeType::known(DataType::Int)));

        emit_input_guards(&instr, &mut regs, &mut emitter);
        assert!(main.frontier() > 0);
    }

    #[test]
    fn no_guard_hint_emits_nothing() {
        let mut main = CodeBuffer::new();
        let mut cold = CodeBuffer::new();
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
        let mut regs = RegisterMap::new();

        let mut instr = NormalizedInstruction::new(Opcode::CGetL, 0, Immediate::Local(0));
        instr.hints.introduces_guard = false;
        emit_input_guards(&instr, &mut regs, &mut emitter);
        assert_eq!(main.frontier(), 0);
    }
}
