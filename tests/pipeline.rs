//! End-to-end exercises of the `analyze` -> `codegen::emit_tracelet`
//! pipeline against hand-built bytecode fixtures, in the style
//! established by `analyze`'s own unit tests: a `SourceUnit` built by
//! hand, no real interpreter or parser attached.

use tracelet_jit::analyze::{analyze, TypeEnv};
use tracelet_jit::asm::CodeBuffer;
use tracelet_jit::codegen::{emit_tracelet, Emitter};
use tracelet_jit::fixup::{FixupMap, UnwindRegMap};
use tracelet_jit::instr::{Immediate, Opcode};
use tracelet_jit::key::{FuncId, SourceKey};
use tracelet_jit::loc::{Literal, Location};
use tracelet_jit::regalloc::RegisterMap;
use tracelet_jit::service::ServiceRequest;
use tracelet_jit::tracelet::GuardKind;
use tracelet_jit::types::{DataType, RuntimeType};
use tracelet_jit::unit::{FuncShape, RawBc, SourceUnit};

fn shape(num_params: u32, num_locals: u32) -> FuncShape {
    FuncShape {
        id: FuncId(1),
        num_params,
        num_locals,
        param_defaults: vec![None; num_params as usize],
        uses_extra_args: false,
        has_var_env: false,
        is_pseudomain: false,
    }
}

fn bc(offset: u32, opcode: Opcode, imm: Immediate) -> RawBc {
    RawBc { offset, opcode, imm }
}

/// `$i` is local 0, `$s` is local 1.
fn int_add_loop_unit() -> SourceUnit {
    let instrs = vec![
        bc(0, Opcode::Int, Immediate::Literal(Literal::Int(1))),
        bc(1, Opcode::SetL, Immediate::Local(0)),
        bc(2, Opcode::Int, Immediate::Literal(Literal::Int(0))),
        bc(3, Opcode::SetL, Immediate::Local(1)),
        bc(4, Opcode::CGetL, Immediate::Local(1)), // L: loop head
        bc(5, Opcode::CGetL, Immediate::Local(0)),
        bc(6, Opcode::Add, Immediate::None),
        bc(7, Opcode::SetL, Immediate::Local(1)),
        bc(8, Opcode::PopC, Immediate::None),
        bc(9, Opcode::CGetL, Immediate::Local(0)),
        bc(10, Opcode::Int, Immediate::Literal(Literal::Int(1))),
        bc(11, Opcode::Add, Immediate::None),
        bc(12, Opcode::SetL, Immediate::Local(0)),
        bc(13, Opcode::PopC, Immediate::None),
        bc(14, Opcode::CGetL, Immediate::Local(0)),
        bc(15, Opcode::Int, Immediate::Literal(Literal::Int(1_000_000))),
        bc(16, Opcode::Lt, Immediate::None),
        bc(17, Opcode::JmpNZ, Immediate::BranchOffset(4 - 17)),
    ];
    SourceUnit::new(shape(0, 2), instrs)
}

fn fresh_emission() -> (CodeBuffer, CodeBuffer, FixupMap, UnwindRegMap, RegisterMap) {
    (CodeBuffer::new(), CodeBuffer::new(), FixupMap::new(), UnwindRegMap::new(), RegisterMap::new())
}

/// Scenario 1 (integer add hot loop): entering the loop head with both
/// locals already known to be int (as a runtime snapshot of the prior
/// interpreted iteration would report) produces one native tracelet
/// covering the whole body, ending at the back-edge.
#[test]
fn integer_add_loop_compiles_to_one_native_tracelet_ending_at_the_back_edge() {
    let unit = int_add_loop_unit();
    let mut env = TypeEnv::from_snapshot([
        (Location::Local(0), RuntimeType::known(DataType::Int)),
        (Location::Local(1), RuntimeType::known(DataType::Int)),
    ]);
    let result = analyze(&unit, SourceKey::new(FuncId(1), 4), &mut env, 64);

    assert!(!result.tracelet.failed);
    assert_eq!(result.consumed, 14, "the whole loop body, offsets 4..=17");
    assert_eq!(result.tracelet.instrs.last().unwrap().opcode, Opcode::JmpNZ);
    assert!(result.tracelet.instrs.last().unwrap().opcode.ends_basic_block());

    // No instruction in the body should have fallen back to Interp --
    // both locals were seeded as known ints, so arithmetic and the
    // final comparison all stay native.
    for instr in &result.tracelet.instrs {
        assert!(
            !instr.plan.requires_interp(),
            "{:?} unexpectedly requires interpretation",
            instr.opcode
        );
    }

    let (mut main, mut cold, mut fixups, mut unwind_regs, mut regs) = fresh_emission();
    let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
    let requests = emit_tracelet(&result.tracelet, &unit.shape, &mut regs, &mut emitter);

    assert_eq!(
        requests,
        vec![ServiceRequest::BindJmpccFirst { taken: 4, not_taken: 18 }],
        "the back-edge is the only pending request; first execution resolves both arms"
    );
    assert!(main.frontier() > 0, "native codegen must have emitted something");
}

/// Testable property 1 (guard completeness): every input location the
/// loop body reads is either guarded on first use or provably written by
/// an earlier instruction in the same tracelet -- never both, and never
/// neither.
#[test]
fn every_loop_input_is_guarded_or_proven_by_a_preceding_write() {
    let unit = int_add_loop_unit();
    let mut env = TypeEnv::from_snapshot([
        (Location::Local(0), RuntimeType::known(DataType::Int)),
        (Location::Local(1), RuntimeType::known(DataType::Int)),
    ]);
    let result = analyze(&unit, SourceKey::new(FuncId(1), 4), &mut env, 64);

    assert_eq!(result.tracelet.dependencies.len(), 2, "one guard per local, first use only");
    assert!(matches!(
        result.tracelet.dependencies.get(&Location::Local(0)),
        Some(GuardKind::Outer(ty)) if ty.data_type() == Some(&DataType::Int)
    ));
    assert!(matches!(
        result.tracelet.dependencies.get(&Location::Local(1)),
        Some(GuardKind::Outer(ty)) if ty.data_type() == Some(&DataType::Int)
    ));

    let mut written_by = std::collections::HashMap::new();
    for instr in &result.tracelet.instrs {
        for input in &instr.inputs {
            if !input.loc.is_local() {
                continue;
            }
            let guarded = result.tracelet.dependencies.contains_key(&input.loc);
            let proven = written_by.contains_key(&input.loc);
            assert!(
                guarded || proven,
                "{:?} read at {} is neither guarded nor proven",
                input.loc,
                instr.bc_offset
            );
        }
        if matches!(instr.opcode, Opcode::SetL) {
            if let Immediate::Local(id) = instr.imm {
                written_by.insert(Location::Local(id), instr.bc_offset);
            }
        }
    }
}

/// Without a seeded snapshot, the same bytecode starting cold falls back
/// to the interpreter for the arithmetic instead of guessing a type --
/// this is the first-ever execution of a source key, before any runtime
/// type observation exists to seed a guard with.
#[test]
fn a_cold_entry_with_no_snapshot_cannot_natively_compile_arithmetic() {
    let unit = int_add_loop_unit();
    let mut env = TypeEnv::default();
    let result = analyze(&unit, SourceKey::new(FuncId(1), 4), &mut env, 64);

    let add_instr = result
        .tracelet
        .instrs
        .iter()
        .find(|i| i.opcode == Opcode::Add)
        .expect("loop body contains an Add");
    assert!(add_instr.plan.requires_interp());
}

/// Testable property 2 (register-map coherence): at the tracelet's one
/// basic-block-ending instruction, every live value has been flushed to
/// its memory home before the service request is handed back.
#[test]
fn register_map_is_fully_clean_at_the_back_edge() {
    let unit = int_add_loop_unit();
    let mut env = TypeEnv::from_snapshot([
        (Location::Local(0), RuntimeType::known(DataType::Int)),
        (Location::Local(1), RuntimeType::known(DataType::Int)),
    ]);
    let result = analyze(&unit, SourceKey::new(FuncId(1), 4), &mut env, 64);

    let (mut main, mut cold, mut fixups, mut unwind_regs, mut regs) = fresh_emission();
    let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
    emit_tracelet(&result.tracelet, &unit.shape, &mut regs, &mut emitter);

    assert!(regs.all_clean(), "translate_branch must clean the register map before its own jump");
}

/// Scenario 4 (global fetch cache miss): a statically-named global read
/// resolves to a predicted, possibly-vague output and emits through the
/// dedicated global-fetch helper rather than a plain register move.
#[test]
fn global_fetch_is_flagged_as_a_prediction() {
    let instrs = vec![
        bc(0, Opcode::CGetG, Immediate::NameId(42)),
        bc(1, Opcode::RetC, Immediate::None),
    ];
    let unit = SourceUnit::new(shape(0, 0), instrs);
    let mut env = TypeEnv::default();
    let result = analyze(&unit, SourceKey::entry(FuncId(1)), &mut env, 64);

    assert!(!result.tracelet.failed);
    let cgetg = &result.tracelet.instrs[0];
    assert!(cgetg.hints.output_predicted, "a global read's type is a prediction, not a proven fact");
    assert!(cgetg.outputs[0].ty.is_vague());

    let (mut main, mut cold, mut fixups, mut unwind_regs, mut regs) = fresh_emission();
    let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
    emit_tracelet(&result.tracelet, &unit.shape, &mut regs, &mut emitter);
    assert!(main.frontier() > 0, "the global-fetch sequence emits into the main arena");
}

/// Testable property 4 (fixup coverage): a call site that may re-enter
/// the runtime records a fixup keyed by its return address, with the
/// stack depth observed at that emission point.
#[test]
fn a_call_instruction_records_a_fixup_at_its_return_address() {
    let instrs = vec![bc(0, Opcode::FCall, Immediate::None)];
    let unit = SourceUnit::new(shape(0, 0), instrs);
    let mut env = TypeEnv::default();
    let result = analyze(&unit, SourceKey::entry(FuncId(1)), &mut env, 64);

    assert!(!result.tracelet.failed);
    assert_eq!(result.consumed, 1, "FCall ends the block on its own");
    assert!(result.tracelet.instrs[0].plan.requires_fixup());

    let (mut main, mut cold, mut fixups, mut unwind_regs, mut regs) = fresh_emission();
    let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
    let requests = emit_tracelet(&result.tracelet, &unit.shape, &mut regs, &mut emitter);

    assert_eq!(requests.len(), 1);
    assert!(matches!(requests[0], ServiceRequest::BindCall { .. }));
    assert_eq!(fixups.len(), 1, "exactly one fixup for the one call");

    let return_addr = main.frontier();
    let fixup = fixups.lookup(return_addr).expect("fixup keyed by the call's return address");
    assert_eq!(fixup.bc_offset, 0);
    assert_eq!(fixup.stack_depth, 0);
}

/// Testable property 3 (smashable site alignment): every call site this
/// pipeline emits is reserved through `prepare_for_smash`, which never
/// lets the reserved range straddle a 64-byte cache line -- exercised
/// here across a run of several calls back to back rather than in
/// isolation, since that's the shape a real tracelet produces.
#[test]
fn consecutive_call_sites_never_straddle_a_cache_line() {
    let mut instrs = Vec::new();
    for i in 0..20 {
        instrs.push(bc(i, Opcode::FCall, Immediate::None));
    }
    // FCall ends the block, so analyze each one as its own tracelet,
    // but emit them back to back into the same buffer to mimic how the
    // cache actually lays consecutive translations out.
    let (mut main, mut cold, mut fixups, mut unwind_regs) =
        (CodeBuffer::new(), CodeBuffer::new(), FixupMap::new(), UnwindRegMap::new());
    for (idx, raw) in instrs.iter().enumerate() {
        let unit = SourceUnit::new(shape(0, 0), vec![*raw]);
        let mut env = TypeEnv::default();
        let result = analyze(&unit, SourceKey::new(FuncId(1), idx as u32), &mut env, 64);
        let mut regs = RegisterMap::new();
        let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
        let requests = emit_tracelet(&result.tracelet, &unit.shape, &mut regs, &mut emitter);
        let call_site = match requests[0] {
            ServiceRequest::BindCall { call_site } => call_site,
            other => panic!("expected BindCall, got {other:?}"),
        };
        assert_eq!(
            call_site / 64,
            (call_site + 4) / 64,
            "5-byte call site at {call_site} straddles a cache line"
        );
    }
}

/// Analysis failure (a decode gap, or exceeding the length budget) is
/// represented as a flag on the tracelet rather than propagated as an
/// error -- only genuine resource exhaustion at the cache layer uses
/// `JitError`.
#[test]
fn analysis_failure_is_a_flag_not_an_error_type() {
    let unit = SourceUnit::new(shape(0, 0), vec![bc(9, Opcode::RetC, Immediate::None)]);
    let mut env = TypeEnv::default();
    let result = analyze(&unit, SourceKey::entry(FuncId(1)), &mut env, 64);
    assert!(result.tracelet.failed);
    assert_eq!(result.consumed, 0);
}
