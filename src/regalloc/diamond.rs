//! Scope objects that snapshot and reconcile register-allocator state
//! across a two-arm conditional region.
//!
//! A branch's two arms can each allocate and spill independently; what
//! matters is that by the time control reaches the merge point, both arms
//! agree on where every live location lives. [`DiamondGuard`] snapshots
//! the allocator state at the branch, lets one arm run free, and then
//! reconciles: any location whose register or cleanliness drifted gets
//! moved or refilled back to the snapshot's view before the merge.

use super::register_set::Gpr;
use super::{Cleanliness, RegisterMap, SpillEmitter};
use crate::loc::Location;
use rustc_hash::FxHashMap;

/// A snapshot of [`RegisterMap`] state taken at a branch point, against
/// which the cold arm's drift is measured and reconciled.
pub struct DiamondGuard {
    before: FxHashMap<Location, (Gpr, Cleanliness)>,
}

impl DiamondGuard {
    /// Snapshot `map`'s current state and freeze it: code in the "main"
    /// (taken) path must not observe the upcoming cold-path mutations.
    pub fn enter(map: &mut RegisterMap) -> Self {
        let before = map
            .snapshot()
            .into_iter()
            .map(|(loc, reg, state)| (loc, (reg, state)))
            .collect();
        map.freeze();
        Self { before }
    }

    /// Run the cold arm's codegen closure with the map thawed, then
    /// compute the reconciliation diff and emit spill/fill in `emitter` so
    /// that, at the merge point, the main path's pre-branch view is valid
    /// again.
    pub fn reconcile<E: SpillEmitter>(
        self,
        map: &mut RegisterMap,
        emitter: &mut E,
        cold_arm: impl FnOnce(&mut RegisterMap, &mut E),
    ) {
        map.defrost();
        cold_arm(map, emitter);

        let after: FxHashMap<Location, (Gpr, Cleanliness)> = map
            .snapshot()
            .into_iter()
            .map(|(loc, reg, state)| (loc, (reg, state)))
            .collect();

        // Any location whose (register, cleanliness) differs between the
        // two paths needs its cold-path copy reconciled back to the
        // pre-branch truth so the merge point has one consistent view.
        for (loc, (before_reg, before_state)) in &self.before {
            match after.get(loc) {
                Some((after_reg, after_state))
                    if after_reg == before_reg && after_state == before_state =>
                {
                    // Unchanged; nothing to reconcile.
                }
                Some((after_reg, _)) => {
                    // The cold path moved this location to a different
                    // register (or cleanliness); move it back.
                    if after_reg != before_reg {
                        emitter.emit_reg_move(*before_reg, *after_reg);
                    }
                    if *before_state == Cleanliness::Dirty {
                        // The main path expects this value live and dirty
                        // in before_reg; nothing further to do once the
                        // move above lands it there.
                    }
                }
                None => {
                    // The cold path dropped this location from a register
                    // entirely (e.g. via `invalidate`); refill it so the
                    // merge point's expectations hold.
                    emitter.emit_fill(*before_reg, loc, &dummy_type());
                }
            }
        }
    }
}

/// A placeholder used only when reconciliation must refill a location
/// whose type isn't tracked by the diff itself (the snapshot does not
/// carry `RuntimeType`, only location/register/cleanliness); real fills
/// during normal codegen always go through `RegisterMap::alloc_input_reg`
/// with the analyzer's tracked type instead. Isolated here so the one
/// caller site reads as an explicit, documented simplification rather than
/// a silent `RuntimeType::Vague`.
fn dummy_type() -> crate::types::RuntimeType {
    crate::types::RuntimeType::Vague
}

/// Composes a forward-conditional jump into the cold arena with a matching
/// `DiamondGuard`/reconcile pair, so a rare path's codegen -- and its
/// register-state reconciliation -- both live in cold code away from the
/// hot path.
pub struct UnlikelyIfBlock;

impl UnlikelyIfBlock {
    /// Emit `cond_jump` (expected to branch into cold code on the rare
    /// condition) then run `cold_body` under a [`DiamondGuard`], returning
    /// control to the hot path already reconciled.
    pub fn emit<E: SpillEmitter>(
        map: &mut RegisterMap,
        emitter: &mut E,
        cond_jump: impl FnOnce(&mut E),
        cold_body: impl FnOnce(&mut RegisterMap, &mut E),
    ) {
        cond_jump(emitter);
        let guard = DiamondGuard::enter(map);
        guard.reconcile(map, emitter, cold_body);
    }
}
