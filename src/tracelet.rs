//! The tracelet: a single-entry, multi-exit region built by symbolically
//! executing bytecode while tracking types.

use crate::instr::NormalizedInstruction;
use crate::key::SourceKey;
use crate::loc::{DynLocation, Location};
use crate::types::RuntimeType;
use rustc_hash::FxHashMap;

/// A newly-introduced type requirement on an input: either a guard
/// against the bare `Location`, or (when the translator reads through a
/// boxed reference cell) a guard on the cell's inner type, which is
/// tracked distinctly from the outer-type guard.
#[derive(Clone, Debug, PartialEq)]
pub enum GuardKind {
    Outer(RuntimeType),
    RefCellInner(RuntimeType),
}

/// The expected by-ref bitmap of a callee, recorded against the
/// activation record a tracelet pushes for one call it doesn't itself
/// execute to completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByRefExpectation {
    pub call_bc_offset: u32,
    pub by_ref_mask: u64,
}

/// A single-entry region starting at a source key: the ordered
/// instruction stream, the guard wall its entry requires, and the
/// post-condition describing what holds at its fall-through exit.
/// Ephemeral -- owned by the analyzer/code-generator only during one
/// analyze/emit cycle, never retained afterward.
#[derive(Debug, Default)]
pub struct Tracelet {
    pub entry: Option<SourceKey>,
    pub instrs: Vec<NormalizedInstruction>,
    /// Guard wall: for each input location read before this tracelet
    /// writes it, the type that must hold on entry.
    pub dependencies: FxHashMap<Location, GuardKind>,
    pub by_ref_deps: Vec<ByRefExpectation>,
    /// Live outputs and their proven types at the tracelet's fall-through
    /// exit.
    pub postconditions: Vec<DynLocation>,
    pub net_stack_change: i32,
    pub fallthrough: Option<SourceKey>,
    /// Set when analysis was aborted mid-stream; the caller should emit a
    /// short pure-interpret request covering the instructions collected
    /// so far instead of trying to code-generate this tracelet.
    pub failed: bool,
}

impl Tracelet {
    pub fn new(entry: SourceKey) -> Self {
        Self {
            entry: Some(entry),
            ..Default::default()
        }
    }

    pub fn push(&mut self, instr: NormalizedInstruction) {
        let idx = self.instrs.len();
        if let Some(prev) = self.instrs.last_mut() {
            prev.next = Some(idx);
        }
        let mut instr = instr;
        instr.prev = self.instrs.len().checked_sub(1);
        self.instrs.push(instr);
    }

    /// Record that `loc` must satisfy `guard` on entry, unless a stronger
    /// or equal guard is already recorded (guard minimization: a location
    /// re-read after an instruction that provably can't alias or
    /// invalidate it gets no second guard).
    pub fn require_guard(&mut self, loc: Location, guard: GuardKind) {
        self.dependencies.entry(loc).or_insert(guard);
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}
