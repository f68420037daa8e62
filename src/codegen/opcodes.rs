//! The per-opcode `translate` dispatch: the second half of the shared
//! emission sequence in [`super`], after input guards and register
//! allocation have already run.
//!
//! Each arm below assumes its inputs are already resident in registers
//! (courtesy of the generic `allocInputReg` pass) unless the
//! instruction set
//! [`crate::instr::InstrHints::manually_alloc_inputs`], in which case it
//! is responsible for its own allocation -- `SetM`/`CGetM` do this
//! because the member-access helper calling convention wants the base
//! and key in specific argument registers, not wherever the allocator
//! happened to put them.

use super::{array, calls, generators, globals, method_dispatch, refcount, returns, Emitter, TranslateOutcome};
use crate::abi::SERVICE_ARG_REGS;
use crate::instr::{Immediate, NormalizedInstruction, Opcode};
use crate::regalloc::register_set::Gpr;
use crate::regalloc::RegisterMap;
use crate::unit::FuncShape;

/// Dispatch one instruction to its translate routine. `shape` is the
/// enclosing function's layout; only the return sequence consults it
/// (to decide between an inline per-local decref and a helper-driven
/// frame release), but every arm takes it uniformly so dispatch doesn't
/// need to special-case one opcode's signature.
pub fn translate(instr: &NormalizedInstruction, shape: &FuncShape, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    match instr.opcode {
        Opcode::Int | Opcode::Double | Opcode::NullLit | Opcode::StringLit => translate_literal(instr, regs, emitter),
        Opcode::CGetL => translate_cgetl(instr, regs, emitter),
        Opcode::SetL => translate_setl(instr, regs, emitter),
        Opcode::Dup => translate_dup(instr, regs, emitter),
        Opcode::Add | Opcode::Sub | Opcode::Mul => translate_arith(instr, regs, emitter),
        Opcode::Lt | Opcode::Eq => translate_compare(instr, regs, emitter),
        Opcode::PopC => translate_popc(instr, regs, emitter),
        Opcode::Jmp | Opcode::JmpZ | Opcode::JmpNZ => translate_branch(instr, regs, emitter),
        Opcode::CGetG => translate_cgetg(instr, regs, emitter),
        Opcode::SetM => translate_setm(instr, regs, emitter),
        Opcode::CGetM => translate_cgetm(instr, regs, emitter),
        Opcode::FPushFuncD | Opcode::FPushObjMethodD | Opcode::FPushClsMethodD | Opcode::FPushClsMethodF => {
            translate_fpush(instr, regs, emitter)
        }
        Opcode::FPassC => translate_fpassc(instr, regs, emitter),
        Opcode::FCall => translate_fcall(instr, regs, emitter),
        Opcode::RetC | Opcode::RetV => translate_ret(instr, shape, regs, emitter),
        Opcode::CreateCont => translate_create_cont(instr, regs, emitter),
        Opcode::ContEnter => translate_cont_enter(instr, regs, emitter),
    }
}

fn output_reg(instr: &NormalizedInstruction, regs: &mut RegisterMap) -> Option<Gpr> {
    let out = instr.outputs.first()?;
    Some(regs.alloc_output_reg(&out.loc, &out.ty))
}

fn translate_literal(instr: &NormalizedInstruction, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    if let Some(dst) = output_reg(instr, regs) {
        let imm = match instr.imm {
            Immediate::Literal(crate::loc::Literal::Int(v)) => v as u32,
            Immediate::Literal(crate::loc::Literal::Double(v)) => v.to_bits() as u32,
            Immediate::Literal(crate::loc::Literal::Bool(b)) => b as u32,
            Immediate::Literal(crate::loc::Literal::StringId(id)) => id,
            _ => 0,
        };
        emitter.mov_reg_imm32(dst, imm);
    }
    TranslateOutcome::default()
}

fn translate_cgetl(instr: &NormalizedInstruction, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    if let (Some(input), Some(dst)) = (instr.inputs.first(), output_reg(instr, regs)) {
        if let Some(src) = regs.reg_of(&input.loc) {
            emitter.mov_reg_reg(dst, src);
        }
    }
    TranslateOutcome::default()
}

fn translate_setl(instr: &NormalizedInstruction, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    if let (Some(input), Some(dst)) = (instr.inputs.first(), output_reg(instr, regs)) {
        if let Some(src) = regs.reg_of(&input.loc) {
            emitter.mov_reg_reg(dst, src);
        }
    }
    TranslateOutcome::default()
}

fn translate_dup(instr: &NormalizedInstruction, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    if let Some(input) = instr.inputs.first() {
        if let Some(src) = regs.reg_of(&input.loc) {
            for out in &instr.outputs {
                let dst = regs.alloc_output_reg(&out.loc, &out.ty);
                emitter.mov_reg_reg(dst, src);
            }
        }
    }
    TranslateOutcome::default()
}

fn translate_arith(instr: &NormalizedInstruction, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    // Both inputs are proven `Int` here (`select_plan` routes the mixed
    // or unknown-type case through `Interp` instead), so this is a
    // plain integer op: move the left input into the output register,
    // then operate against the right.
    if let (Some(lhs), Some(rhs)) = (instr.inputs.first(), instr.inputs.get(1)) {
        if let (Some(l), Some(r), Some(dst)) = (regs.reg_of(&lhs.loc), regs.reg_of(&rhs.loc), output_reg(instr, regs)) {
            emitter.mov_reg_reg(dst, l);
            emit_binop(emitter, instr.opcode, dst, r);
        }
    }
    TranslateOutcome::default()
}

fn emit_binop(emitter: &mut Emitter<'_>, op: Opcode, dst: Gpr, src: Gpr) {
    // `add`/`sub`/`imul` dst, src -- same ModRM shape as `cmp_reg_reg`
    // with a different primary opcode byte; `imul` additionally needs
    // its own two-byte opcode, all three share the REX computation.
    let (dst8, src8) = (dst as u8, src as u8);
    let rex = Emitter::rex(true, dst8 >= 8, false, src8 >= 8);
    let buf = emitter.buf();
    buf.put1(rex);
    match op {
        Opcode::Add => {
            buf.put1(0x01);
            buf.put1(Emitter::modrm(0b11, src8, dst8));
        }
        Opcode::Sub => {
            buf.put1(0x29);
            buf.put1(Emitter::modrm(0b11, src8, dst8));
        }
        Opcode::Mul => {
            buf.put1(0x0F);
            buf.put1(0xAF);
            buf.put1(Emitter::modrm(0b11, dst8, src8));
        }
        _ => unreachable!("emit_binop called with a non-arithmetic opcode"),
    }
}

fn translate_compare(instr: &NormalizedInstruction, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    if let (Some(lhs), Some(rhs)) = (instr.inputs.first(), instr.inputs.get(1)) {
        if let (Some(l), Some(r)) = (regs.reg_of(&lhs.loc), regs.reg_of(&rhs.loc)) {
            emitter.cmp_reg_reg(l, r);
            if let Some(dst) = output_reg(instr, regs) {
                let cc = if instr.opcode == Opcode::Lt { 0x9C } else { 0x94 }; // setl / sete
                emitter.setcc_zero_extend(dst, cc);
            }
        }
    }
    TranslateOutcome::default()
}

fn translate_popc(instr: &NormalizedInstruction, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    if let Some(input) = instr.inputs.first() {
        if input.ty.is_refcounted() {
            if let Some(r) = regs.reg_of(&input.loc) {
                refcount::emit_decref(emitter, r, &input.ty, Gpr::Rdx);
            }
        }
    }
    TranslateOutcome::default()
}

fn translate_branch(instr: &NormalizedInstruction, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    regs.clean_all(emitter);
    let target = match instr.imm {
        Immediate::BranchOffset(off) => (instr.bc_offset as i64 + off as i64) as u32,
        _ => instr.bc_offset + 1,
    };
    TranslateOutcome {
        service_request: Some(match instr.opcode {
            Opcode::Jmp => crate::service::ServiceRequest::BindJmp { target },
            _ => crate::service::ServiceRequest::BindJmpccFirst {
                taken: target,
                not_taken: instr.bc_offset + 1,
            },
        }),
        ..Default::default()
    }
}

fn translate_cgetg(instr: &NormalizedInstruction, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    if let Some(dst) = output_reg(instr, regs) {
        let cache_slot = match instr.imm {
            Immediate::NameId(id) => id,
            _ => 0,
        };
        globals::emit_global_fetch(emitter, dst, cache_slot, Gpr::Rcx);
    }
    TranslateOutcome::default()
}

fn translate_setm(instr: &NormalizedInstruction, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    for (i, input) in instr.inputs.iter().enumerate().take(SERVICE_ARG_REGS.len()) {
        regs.alloc_input_reg(emitter, &input.loc, &input.ty, Some(SERVICE_ARG_REGS[i]));
    }
    if let Some(base) = instr.inputs.first() {
        array::emit_array_set(emitter, regs, &base.loc, &base.ty, Gpr::R10);
    }
    TranslateOutcome::default()
}

fn translate_cgetm(instr: &NormalizedInstruction, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    for (i, input) in instr.inputs.iter().enumerate().take(SERVICE_ARG_REGS.len()) {
        regs.alloc_input_reg(emitter, &input.loc, &input.ty, Some(SERVICE_ARG_REGS[i]));
    }
    if let Some(dst) = output_reg(instr, regs) {
        array::emit_array_get(emitter, dst, Gpr::R10);
    }
    TranslateOutcome::default()
}

fn translate_fpush(instr: &NormalizedInstruction, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    if instr.opcode == Opcode::FPushObjMethodD {
        if let Some(recv) = instr.inputs.first() {
            if let Some(r) = regs.reg_of(&recv.loc) {
                method_dispatch::emit_burned_in_check(emitter, r, 0, Gpr::Rcx);
            }
        }
    }
    TranslateOutcome::default()
}

fn translate_fpassc(_instr: &NormalizedInstruction, _regs: &mut RegisterMap, _emitter: &mut Emitter<'_>) -> TranslateOutcome {
    TranslateOutcome::default()
}

fn translate_fcall(instr: &NormalizedInstruction, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    let req = calls::emit_call(emitter, regs, instr.bc_offset, Gpr::R12);
    TranslateOutcome {
        fixup_return_offset: Some(emitter.buf().frontier()),
        service_request: Some(req),
        ..Default::default()
    }
}

fn translate_ret(instr: &NormalizedInstruction, shape: &FuncShape, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    let locals: Vec<(Gpr, crate::types::RuntimeType)> = instr
        .inputs
        .iter()
        .filter_map(|d| regs.reg_of(&d.loc).map(|r| (r, d.ty.clone())))
        .collect();
    let req = returns::emit_return(emitter, regs, &locals, Gpr::Rdx, shape.has_var_env, Gpr::R13);
    TranslateOutcome {
        service_request: Some(req),
        ..Default::default()
    }
}

fn translate_create_cont(_instr: &NormalizedInstruction, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    regs.clean_all(emitter);
    let req = generators::emit_create_cont(emitter, 4, Gpr::Rax, Gpr::Rcx);
    TranslateOutcome {
        service_request: Some(req),
        ..Default::default()
    }
}

fn translate_cont_enter(instr: &NormalizedInstruction, regs: &mut RegisterMap, emitter: &mut Emitter<'_>) -> TranslateOutcome {
    regs.clean_all(emitter);
    let resume_key = match instr.imm {
        Immediate::NameId(id) => crate::key::SourceKey::new(crate::key::FuncId(id), instr.bc_offset),
        _ => crate::key::SourceKey::new(crate::key::FuncId(0), instr.bc_offset),
    };
    let req = generators::emit_cont_enter(emitter, 4, Gpr::Rax, Gpr::Rcx, resume_key);
    TranslateOutcome {
        service_request: Some(req),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::CodeBuffer;
    use crate::fixup::{FixupMap, UnwindRegMap};
    use crate::loc::{DynLocation, Location};
    use crate::types::{DataType, RuntimeType};

    fn new_emitter<'a>(main: &'a mut CodeBuffer, cold: &'a mut CodeBuffer, fixups: &'a mut FixupMap, unwind_regs: &'a mut UnwindRegMap) -> Emitter<'a> {
        Emitter::new(main, cold, fixups, unwind_regs)
    }

    #[test]
    fn arithmetic_moves_lhs_then_operates_against_rhs() {
        let mut main = CodeBuffer::new();
        let mut cold = CodeBuffer::new();
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let mut emitter = new_emitter(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
        let mut regs = RegisterMap::new();

        let int_ty = RuntimeType::known(DataType::Int);
        regs.bind(Gpr::Rax, Location::Stack(0), int_ty.clone(), crate::regalloc::Cleanliness::Clean);
        regs.bind(Gpr::Rbx, Location::Stack(1), int_ty.clone(), crate::regalloc::Cleanliness::Clean);

        let mut instr = NormalizedInstruction::new(Opcode::Add, 2, Immediate::None);
        instr.inputs.push(DynLocation::new(Location::Stack(0), int_ty.clone()));
        instr.inputs.push(DynLocation::new(Location::Stack(1), int_ty.clone()));
        instr.outputs.push(DynLocation::new(Location::Stack(0), int_ty));

        translate_arith(&instr, &mut regs, &mut emitter);
        assert!(main.frontier() > 0);
    }

    #[test]
    fn fcall_reports_a_fixup_return_offset() {
        let mut main = CodeBuffer::new();
        let mut cold = CodeBuffer::new();
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let mut emitter = new_emitter(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
        let mut regs = RegisterMap::new();
        let instr = NormalizedInstruction::new(Opcode::FCall, 5, Immediate::None);
        let outcome = translate_fcall(&instr, &mut regs, &mut emitter);
        assert!(outcome.fixup_return_offset.is_some());
        assert!(matches!(outcome.service_request, Some(crate::service::ServiceRequest::BindCall { .. })));
    }
}
