//! Register allocation cooperating with code generation.
//!
//! A persistent, reusable piece of state threaded through emission, backed
//! by a `RegisterSet` bitset and a location→register map kept in sync as
//! code is emitted: a linear scan driven directly by the per-opcode
//! translators as they call `allocInputReg`/`cleanRegs`/`smashRegs`, rather
//! than a global graph-coloring pass over an SSA form built up front.

pub mod diamond;
pub mod register_set;

use crate::loc::Location;
use crate::types::RuntimeType;
use register_set::{Gpr, RegisterSet, ALL_GPRS};
use rustc_hash::FxHashMap;

/// How a register's contents relate to that location's memory home.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cleanliness {
    /// The register and its memory home agree; the register can be
    /// smashed with no write-back.
    Clean,
    /// The register holds a value not yet written to its memory home;
    /// `cleanRegs` must flush it before the register can be reused for
    /// anything else.
    Dirty,
    /// No `Location` owns this register; it was handed out by
    /// `scratchReg()` and must be released explicitly.
    Scratch,
}

#[derive(Clone, Debug)]
struct RegEntry {
    owner: Location,
    ty: RuntimeType,
    state: Cleanliness,
    pinned: bool,
}

/// Emission primitives the allocator needs from the code generator to
/// actually move bytes around -- kept as a trait so [`RegisterMap`] never
/// depends on [`crate::asm::CodeBuffer`] or frame-layout details directly.
/// The dependency only runs one way: the allocator knows about the
/// assembler through this trait, never the other way around.
pub trait SpillEmitter {
    fn emit_fill(&mut self, reg: Gpr, loc: &Location, ty: &RuntimeType);
    fn emit_spill(&mut self, reg: Gpr, loc: &Location, ty: &RuntimeType);
    fn emit_reg_move(&mut self, dst: Gpr, src: Gpr);
}

/// The allocator's state: for each physical register, an
/// `(owner Location, cached RuntimeType, cleanliness, pinned)` tuple, plus
/// the reverse index from `Location` to register.
pub struct RegisterMap {
    regs: [Option<RegEntry>; register_set::NUM_GPRS],
    by_loc: FxHashMap<Location, Gpr>,
    avail: RegisterSet,
    frozen: bool,
}

impl RegisterMap {
    pub fn new() -> Self {
        Self {
            regs: Default::default(),
            by_loc: FxHashMap::default(),
            avail: RegisterSet::new(),
            frozen: false,
        }
    }

    fn entry(&self, r: Gpr) -> Option<&RegEntry> {
        self.regs[r as usize].as_ref()
    }

    pub fn reg_of(&self, loc: &Location) -> Option<Gpr> {
        self.by_loc.get(loc).copied()
    }

    pub fn is_dirty(&self, r: Gpr) -> bool {
        matches!(
            self.entry(r).map(|e| e.state),
            Some(Cleanliness::Dirty)
        )
    }

    /// True iff no register currently holds a dirty value -- the shared
    /// emission sequence and every service-request site must check this
    /// before suspending, since a suspended translation can only resume by
    /// re-deriving state from memory.
    pub fn all_clean(&self) -> bool {
        self.regs
            .iter()
            .flatten()
            .all(|e| e.state != Cleanliness::Dirty)
    }

    fn assert_not_frozen(&self) {
        assert!(
            !self.frozen,
            "register map mutated while frozen (inside a DiamondGuard parent scope)"
        );
    }

    /// Bring `loc` into a register for reading, preferring `preferred` if
    /// free, filling from memory if it isn't already resident.
    pub fn alloc_input_reg<E: SpillEmitter>(
        &mut self,
        emitter: &mut E,
        loc: &Location,
        ty: &RuntimeType,
        preferred: Option<Gpr>,
    ) -> Gpr {
        self.assert_not_frozen();
        if let Some(r) = self.reg_of(loc) {
            return r;
        }
        let r = self.pick_free_reg(preferred);
        emitter.emit_fill(r, loc, ty);
        self.bind_internal(r, loc.clone(), ty.clone(), Cleanliness::Clean);
        r
    }

    /// Reserve (but do not fill) a register for an output location, marking
    /// it dirty -- the translate routine is expected to write the result
    /// into it directly.
    pub fn alloc_output_reg(&mut self, loc: &Location, ty: &RuntimeType) -> Gpr {
        self.assert_not_frozen();
        if let Some(existing) = self.reg_of(loc) {
            self.mark_dirty(existing);
            return existing;
        }
        let r = self.pick_free_reg(None);
        self.bind_internal(r, loc.clone(), ty.clone(), Cleanliness::Dirty);
        r
    }

    /// A register with no `Location` binding, for the translator's own
    /// internal use. Must be released with [`RegisterMap::release_scratch`].
    pub fn scratch_reg(&mut self) -> Gpr {
        self.assert_not_frozen();
        let r = self.pick_free_reg(None);
        self.regs[r as usize] = Some(RegEntry {
            owner: Location::Scratch(r as u32),
            ty: RuntimeType::Vague,
            state: Cleanliness::Scratch,
            pinned: false,
        });
        self.avail.take(r);
        r
    }

    pub fn release_scratch(&mut self, r: Gpr) {
        self.assert_not_frozen();
        debug_assert!(matches!(
            self.entry(r).map(|e| e.state),
            Some(Cleanliness::Scratch)
        ));
        self.regs[r as usize] = None;
        self.avail.free(r);
    }

    /// Flush every dirty register in `set` to its memory home, leaving it
    /// clean. Called before any helper call, since the callee is free to
    /// clobber caller-saved registers and must see correct memory state.
    pub fn clean_regs<E: SpillEmitter>(&mut self, emitter: &mut E, set: &[Gpr]) {
        for &r in set {
            if let Some(e) = self.regs[r as usize].clone() {
                if e.state == Cleanliness::Dirty {
                    emitter.emit_spill(r, &e.owner, &e.ty);
                    self.regs[r as usize].as_mut().unwrap().state = Cleanliness::Clean;
                }
            }
        }
    }

    /// Flush every dirty register everywhere, leaving the whole map clean.
    /// Called at every basic-block-ending instruction and every
    /// service-request emission site, so a suspended or exited translation
    /// never leaves a value only live in a register.
    pub fn clean_all<E: SpillEmitter>(&mut self, emitter: &mut E) {
        let dirty: Vec<Gpr> = ALL_GPRS
            .into_iter()
            .filter(|r| self.is_dirty(*r))
            .collect();
        self.clean_regs(emitter, &dirty);
    }

    /// Declare every register in `set` clobbered: dirty ones are flushed
    /// first (preserving their value), then the register's binding is
    /// dropped entirely, with no promise it retains anything afterward.
    /// Called on caller-saved registers immediately after a helper call
    /// returns.
    pub fn smash_regs<E: SpillEmitter>(&mut self, emitter: &mut E, set: &[Gpr]) {
        self.clean_regs(emitter, set);
        for &r in set {
            if let Some(e) = self.regs[r as usize].take() {
                self.by_loc.remove(&e.owner);
                self.avail.free(r);
            }
        }
    }

    /// Drop any cached knowledge of `loc`: its memory home is now
    /// authoritative. Used after a helper that may have rebound the
    /// location's value out from under the allocator, such as a
    /// copy-on-write array mutation that can return a new backing array.
    pub fn invalidate(&mut self, loc: &Location) {
        self.assert_not_frozen();
        if let Some(r) = self.by_loc.remove(loc) {
            self.regs[r as usize] = None;
            self.avail.free(r);
        }
    }

    /// Manually install `reg` as holding `loc`, e.g. right after a helper
    /// call whose return register is a known value.
    pub fn bind(&mut self, reg: Gpr, loc: Location, ty: RuntimeType, state: Cleanliness) {
        self.assert_not_frozen();
        if self.avail.is_avail(reg) {
            self.avail.take(reg);
        }
        self.bind_internal(reg, loc, ty, state);
    }

    fn bind_internal(&mut self, reg: Gpr, loc: Location, ty: RuntimeType, state: Cleanliness) {
        if let Some(old) = self.regs[reg as usize].take() {
            self.by_loc.remove(&old.owner);
        }
        self.by_loc.insert(loc.clone(), reg);
        self.regs[reg as usize] = Some(RegEntry {
            owner: loc,
            ty,
            state,
            pinned: false,
        });
    }

    pub fn pin(&mut self, r: Gpr) {
        if let Some(e) = self.regs[r as usize].as_mut() {
            e.pinned = true;
        }
    }

    pub fn unpin(&mut self, r: Gpr) {
        if let Some(e) = self.regs[r as usize].as_mut() {
            e.pinned = false;
        }
    }

    fn mark_dirty(&mut self, r: Gpr) {
        if let Some(e) = self.regs[r as usize].as_mut() {
            e.state = Cleanliness::Dirty;
        }
    }

    fn pick_free_reg(&mut self, preferred: Option<Gpr>) -> Gpr {
        if let Some(p) = preferred {
            if self.avail.is_avail(p) {
                self.avail.take(p);
                return p;
            }
        }
        let r = self
            .avail
            .iter_preferring_caller_saved()
            .find(|r| self.entry(*r).map(|e| !e.pinned).unwrap_or(true))
            .expect("register allocator exhausted all GPRs -- spill policy bug");
        self.avail.take(r);
        r
    }

    /// Forbid any further state change (alloc, clean, smash, invalidate,
    /// bind) until [`RegisterMap::defrost`] is called. Used by
    /// [`diamond::DiamondGuard`] to protect the parent scope's view while
    /// a conditional arm is emitted.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn defrost(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// A cheap snapshot of (location, register, cleanliness) triples,
    /// consumed by [`diamond::DiamondGuard`] to compute the reconciliation
    /// diff between two control-flow arms.
    pub fn snapshot(&self) -> Vec<(Location, Gpr, Cleanliness)> {
        self.regs
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                e.as_ref().map(|e| {
                    (
                        e.owner.clone(),
                        ALL_GPRS[i],
                        e.state,
                    )
                })
            })
            .collect()
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    struct NullEmitter {
        fills: u32,
        spills: u32,
    }

    impl SpillEmitter for NullEmitter {
        fn emit_fill(&mut self, _reg: Gpr, _loc: &Location, _ty: &RuntimeType) {
            self.fills += 1;
        }
        fn emit_spill(&mut self, _reg: Gpr, _loc: &Location, _ty: &RuntimeType) {
            self.spills += 1;
        }
        fn emit_reg_move(&mut self, _dst: Gpr, _src: Gpr) {}
    }

    #[test]
    fn alloc_input_reg_fills_once_then_reuses() {
        let mut map = RegisterMap::new();
        let mut em = NullEmitter { fills: 0, spills: 0 };
        let loc = Location::Local(0);
        let ty = RuntimeType::known(DataType::Int);
        let r1 = map.alloc_input_reg(&mut em, &loc, &ty, None);
        let r2 = map.alloc_input_reg(&mut em, &loc, &ty, None);
        assert_eq!(r1, r2);
        assert_eq!(em.fills, 1);
    }

    #[test]
    fn clean_all_flushes_dirty_outputs() {
        let mut map = RegisterMap::new();
        let mut em = NullEmitter { fills: 0, spills: 0 };
        let loc = Location::Stack(0);
        let ty = RuntimeType::known(DataType::Int);
        map.alloc_output_reg(&loc, &ty);
        assert!(!map.all_clean());
        map.clean_all(&mut em);
        assert!(map.all_clean());
        assert_eq!(em.spills, 1);
    }

    #[test]
    fn smash_regs_drops_bindings_after_flushing() {
        let mut map = RegisterMap::new();
        let mut em = NullEmitter { fills: 0, spills: 0 };
        let loc = Location::Stack(1);
        let ty = RuntimeType::known(DataType::Int);
        let r = map.alloc_output_reg(&loc, &ty);
        map.smash_regs(&mut em, &[r]);
        assert_eq!(em.spills, 1);
        assert!(map.reg_of(&loc).is_none());
    }

    #[test]
    fn invalidate_drops_cached_binding_without_flushing() {
        let mut map = RegisterMap::new();
        let mut em = NullEmitter { fills: 0, spills: 0 };
        let loc = Location::Stack(2);
        let ty = RuntimeType::known(DataType::Int);
        map.alloc_output_reg(&loc, &ty);
        map.invalidate(&loc);
        assert!(map.reg_of(&loc).is_none());
        assert_eq!(em.spills, 0);
    }

    #[test]
    #[should_panic(expected = "frozen")]
    fn mutating_a_frozen_map_panics() {
        let mut map = RegisterMap::new();
        map.freeze();
        map.invalidate(&Location::Stack(0));
    }
}
