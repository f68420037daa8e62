//! The tracelet analyzer: symbolically executes bytecode from a source
//! key, tracking a type environment, to build a [`Tracelet`].

use crate::instr::{Immediate, InstrHints, NormalizedInstruction, Opcode, TranslationPlan};
use crate::key::SourceKey;
use crate::loc::{DynLocation, Location};
use crate::tracelet::{GuardKind, Tracelet};
use crate::types::{DataType, IterKind, RuntimeType, StringKind};
use crate::unit::SourceUnit;
use rustc_hash::{FxHashMap, FxHashSet};

/// The analyzer's live knowledge of what each `Location` holds, as of the
/// current point in the symbolic walk. Starts from a runtime snapshot
/// (what the interpreter actually observed) plus whatever the walk itself
/// has proven since.
#[derive(Debug, Default, Clone)]
pub struct TypeEnv {
    known: FxHashMap<Location, RuntimeType>,
    /// Locations this tracelet has itself assigned. A read of a location
    /// in this set is provably safe without a fresh guard; a read of a
    /// location not in it is an assumption about the world outside this
    /// tracelet and needs one (the first time only).
    written: FxHashSet<Location>,
    stack_top: i32,
}

impl TypeEnv {
    pub fn from_snapshot(snapshot: impl IntoIterator<Item = (Location, RuntimeType)>) -> Self {
        Self {
            known: snapshot.into_iter().collect(),
            written: FxHashSet::default(),
            stack_top: 0,
        }
    }

    fn type_of(&self, loc: &Location) -> Option<&RuntimeType> {
        self.known.get(loc)
    }

    fn set(&mut self, loc: Location, ty: RuntimeType) {
        self.written.insert(loc.clone());
        self.known.insert(loc, ty);
    }

    fn needs_guard(&self, loc: &Location) -> bool {
        !self.written.contains(loc)
    }

    fn push_stack(&mut self, ty: RuntimeType) -> Location {
        let loc = Location::Stack(self.stack_top);
        self.stack_top += 1;
        self.set(loc.clone(), ty);
        loc
    }

    fn pop_stack(&mut self) -> Location {
        self.stack_top -= 1;
        Location::Stack(self.stack_top)
    }
}

/// Outcome of analyzing one source key into (at most) one tracelet.
pub struct AnalysisResult {
    pub tracelet: Tracelet,
    /// Number of bytecodes consumed before stopping, for callers that
    /// need to emit a pure-interpret request covering just the failed
    /// prefix.
    pub consumed: u32,
}

/// Symbolically execute bytecode starting at `entry`, building a tracelet
/// bounded by `max_len` instructions.
pub fn analyze(unit: &SourceUnit, entry: SourceKey, env: &mut TypeEnv, max_len: u32) -> AnalysisResult {
    let mut tracelet = Tracelet::new(entry);
    let mut offset = entry.offset;
    let mut consumed = 0u32;

    loop {
        if tracelet.len() as u32 >= max_len {
            break;
        }
        let Some(raw) = unit.decode_at(offset) else {
            tracelet.mark_failed();
            break;
        };
        let mut instr = NormalizedInstruction::new(raw.opcode, raw.offset, raw.imm);
        let introduced_guard = match resolve_inputs(&mut instr, env, &mut tracelet) {
            Ok(introduced) => introduced,
            Err(()) => {
                tracelet.mark_failed();
                break;
            }
        };
        instr.plan = select_plan(&instr, env);
        instr.hints = compute_hints(&instr, introduced_guard);
        apply_outputs(&mut instr, env);

        let ends_block = instr.opcode.ends_basic_block();
        tracelet.push(instr);
        consumed += 1;

        if ends_block {
            break;
        }
        match unit.next_offset(offset) {
            Some(next) => offset = next,
            None => {
                tracelet.mark_failed();
                break;
            }
        }
    }

    if !tracelet.failed {
        tracelet.fallthrough = unit.next_offset(offset).map(|off| entry.at(off));
    }
    tracelet.net_stack_change = env.stack_top;
    tracelet.postconditions = env
        .known
        .iter()
        .map(|(loc, ty)| DynLocation::new(loc.clone(), ty.clone()))
        .collect();

    AnalysisResult { tracelet, consumed }
}

/// Resolve an instruction's inputs against the environment, recording a
/// new guard for any location not yet tracked (guard minimization: a
/// location already proven by a preceding instruction gets no guard).
/// Resolve an instruction's inputs against the environment. Returns
/// whether this call introduced at least one fresh guard (as opposed to
/// reusing a guard already recorded, or reading a location this tracelet
/// itself proved by an earlier write -- guard minimization).
fn resolve_inputs(
    instr: &mut NormalizedInstruction,
    env: &mut TypeEnv,
    tracelet: &mut Tracelet,
) -> Result<bool, ()> {
    let mut introduced = false;
    let mut require_fresh_guard = |tracelet: &mut Tracelet, loc: Location, guard: GuardKind| {
        if !tracelet.dependencies.contains_key(&loc) {
            introduced = true;
        }
        tracelet.require_guard(loc, guard);
    };

    let pop_count = instr.opcode.stack_pop_count();
    for _ in 0..pop_count {
        let loc = env.pop_stack();
        let ty = env.type_of(&loc).cloned().unwrap_or(RuntimeType::Vague);
        if env.needs_guard(&loc) {
            require_fresh_guard(tracelet, loc.clone(), GuardKind::Outer(ty.clone()));
        }
        instr.inputs.push(DynLocation::new(loc, ty));
    }
    match instr.imm {
        Immediate::Local(id) => {
            let loc = Location::Local(id);
            let ty = env.type_of(&loc).cloned().unwrap_or(RuntimeType::Vague);
            if env.needs_guard(&loc) {
                require_fresh_guard(tracelet, loc.clone(), GuardKind::Outer(ty.clone()));
            }
            if let Some(inner) = ty.inner_of_ref_cell() {
                require_fresh_guard(tracelet, loc.clone(), GuardKind::RefCellInner(inner.clone()));
            }
            instr.inputs.push(DynLocation::new(loc, ty));
        }
        Immediate::NameId(_) if instr.opcode == Opcode::CGetG => {
            // Global fetch reads through a name cache, not a Location the
            // environment tracks directly; nothing to resolve here.
        }
        _ => {}
    }
    Ok(introduced)
}

fn select_plan(instr: &NormalizedInstruction, _env: &TypeEnv) -> TranslationPlan {
    match instr.opcode {
        Opcode::Int | Opcode::Double | Opcode::NullLit | Opcode::StringLit | Opcode::Dup => {
            TranslationPlan::Native
        }
        Opcode::CGetL | Opcode::SetL => TranslationPlan::Native,
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Lt | Opcode::Eq => {
            if instr.inputs.iter().all(|i| !i.ty.is_vague()) {
                TranslationPlan::Native
            } else {
                TranslationPlan::Interp
            }
        }
        Opcode::PopC => TranslationPlan::Simple,
        Opcode::Jmp | Opcode::JmpZ | Opcode::JmpNZ => TranslationPlan::Native,
        Opcode::CGetG => TranslationPlan::Supported,
        Opcode::SetM | Opcode::CGetM => TranslationPlan::Supported,
        Opcode::FPushFuncD
        | Opcode::FPushObjMethodD
        | Opcode::FPushClsMethodD
        | Opcode::FPushClsMethodF
        | Opcode::FPassC => TranslationPlan::Simple,
        Opcode::FCall => TranslationPlan::Supported,
        Opcode::RetC | Opcode::RetV => TranslationPlan::Supported,
        Opcode::CreateCont | Opcode::ContEnter => TranslationPlan::Supported,
    }
}

fn compute_hints(instr: &NormalizedInstruction, introduced_guard: bool) -> InstrHints {
    InstrHints {
        output_predicted: matches!(instr.opcode, Opcode::CGetG | Opcode::FPushObjMethodD),
        introduces_guard: introduced_guard,
        ends_basic_block: instr.opcode.ends_basic_block(),
        manually_alloc_inputs: matches!(instr.opcode, Opcode::SetM | Opcode::CGetM),
    }
}

fn apply_outputs(instr: &mut NormalizedInstruction, env: &mut TypeEnv) {
    match instr.opcode {
        Opcode::Int => {
            instr.outputs.push(DynLocation::new(
                env.push_stack(RuntimeType::known(DataType::Int)),
                RuntimeType::known(DataType::Int),
            ));
        }
        Opcode::Double => {
            instr.outputs.push(DynLocation::new(
                env.push_stack(RuntimeType::known(DataType::Double)),
                RuntimeType::known(DataType::Double),
            ));
        }
        Opcode::NullLit => {
            instr.outputs.push(DynLocation::new(
                env.push_stack(RuntimeType::known(DataType::Null)),
                RuntimeType::known(DataType::Null),
            ));
        }
        Opcode::StringLit => {
            let ty = RuntimeType::known(DataType::String(StringKind::Static));
            instr
                .outputs
                .push(DynLocation::new(env.push_stack(ty.clone()), ty));
        }
        Opcode::CGetL => {
            if let Immediate::Local(id) = instr.imm {
                let ty = env
                    .type_of(&Location::Local(id))
                    .cloned()
                    .unwrap_or(RuntimeType::Vague);
                instr
                    .outputs
                    .push(DynLocation::new(env.push_stack(ty.clone()), ty));
            }
        }
        Opcode::SetL => {
            if let Immediate::Local(id) = instr.imm {
                let ty = instr
                    .inputs
                    .first()
                    .map(|d| d.ty.clone())
                    .unwrap_or(RuntimeType::Vague);
                env.set(Location::Local(id), ty.clone());
                instr
                    .outputs
                    .push(DynLocation::new(env.push_stack(ty.clone()), ty));
            }
        }
        Opcode::Dup => {
            if let Some(top) = instr.inputs.first().cloned() {
                instr
                    .outputs
                    .push(DynLocation::new(env.push_stack(top.ty.clone()), top.ty.clone()));
                instr
                    .outputs
                    .push(DynLocation::new(env.push_stack(top.ty.clone()), top.ty));
            }
        }
        Opcode::Add | Opcode::Sub | Opcode::Mul => {
            let ty = numeric_result_type(instr);
            instr
                .outputs
                .push(DynLocation::new(env.push_stack(ty.clone()), ty));
        }
        Opcode::Lt | Opcode::Eq => {
            let ty = RuntimeType::known(DataType::Bool);
            instr
                .outputs
                .push(DynLocation::new(env.push_stack(ty.clone()), ty));
        }
        Opcode::CGetG => {
            // Prediction: assume the common case (the global exists and
            // is whatever type it was last observed as); the code
            // generator emits a trailing check per the prediction flag.
            let ty = RuntimeType::Vague;
            instr
                .outputs
                .push(DynLocation::new(env.push_stack(ty.clone()), ty));
        }
        Opcode::CGetM => {
            instr.outputs.push(DynLocation::new(
                env.push_stack(RuntimeType::Vague),
                RuntimeType::Vague,
            ));
        }
        _ => {}
    }
}

fn numeric_result_type(instr: &NormalizedInstruction) -> RuntimeType {
    let all_int = instr
        .inputs
        .iter()
        .all(|d| d.ty.data_type() == Some(&DataType::Int));
    if all_int {
        RuntimeType::known(DataType::Int)
    } else {
        RuntimeType::Vague
    }
}

/// Resolve an iterator's element-kind guard; used by continuation/
/// iteration opcodes this crate's closed opcode set doesn't yet model as
/// distinct variants, kept here so `IterKind` has at least one non-test
/// call site documenting its intended use.
pub fn iter_kind_of(ty: &RuntimeType) -> Option<IterKind> {
    match ty.data_type() {
        Some(DataType::Iterator(kind)) => Some(*kind),
        _ => None,
    }
}
