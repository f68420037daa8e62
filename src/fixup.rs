//! Maps from a helper call's return address back to the bytecode state
//! live at the call site, so the runtime can resynchronize on exception
//! or re-entry.

use crate::key::BcOffset;
use crate::regalloc::register_set::Gpr;
use crate::types::RuntimeType;
use rustc_hash::FxHashMap;

/// Native code offset of a call instruction's return address, within
/// whichever arena (main or cold) it was emitted into.
pub type NativeOffset = u32;

/// One call site's bytecode-level state: the offset of the instruction
/// that issued the call, and how many stack cells were live at that
/// point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fixup {
    pub bc_offset: BcOffset,
    pub stack_depth: u32,
}

/// Records a [`Fixup`] for every call site that could throw or re-enter.
/// Keyed by the return address because that's what a C-stack walk during
/// unwinding actually has in hand.
#[derive(Default)]
pub struct FixupMap {
    entries: FxHashMap<NativeOffset, Fixup>,
}

impl FixupMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, return_addr: NativeOffset, fixup: Fixup) {
        self.entries.insert(return_addr, fixup);
    }

    pub fn lookup(&self, return_addr: NativeOffset) -> Option<Fixup> {
        self.entries.get(&return_addr).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One register's contents at a fixup-eligible call site, for a
/// callee-saved register that was dirty (its memory home hadn't yet
/// received the value) when the call was emitted.
#[derive(Clone, Debug, PartialEq)]
pub struct UnwindRegEntry {
    pub reg: Gpr,
    pub loc: crate::loc::Location,
    pub ty: RuntimeType,
}

/// Per-call-site list of dirty callee-saved registers, consulted by the
/// unwinder after it has restored VM SP/FP/PC via the [`FixupMap`], to
/// spill what's still only live in a register before the exception
/// machinery runs.
#[derive(Default)]
pub struct UnwindRegMap {
    entries: FxHashMap<NativeOffset, Vec<UnwindRegEntry>>,
}

impl UnwindRegMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, return_addr: NativeOffset, regs: Vec<UnwindRegEntry>) {
        if !regs.is_empty() {
            self.entries.insert(return_addr, regs);
        }
    }

    pub fn lookup(&self, return_addr: NativeOffset) -> &[UnwindRegEntry] {
        self.entries
            .get(&return_addr)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixup_round_trips_by_return_address() {
        let mut map = FixupMap::new();
        map.record(
            0x100,
            Fixup {
                bc_offset: 42,
                stack_depth: 3,
            },
        );
        assert_eq!(
            map.lookup(0x100),
            Some(Fixup {
                bc_offset: 42,
                stack_depth: 3
            })
        );
        assert_eq!(map.lookup(0x200), None);
    }

    #[test]
    fn unwind_reg_map_omits_call_sites_with_no_dirty_registers() {
        let mut map = UnwindRegMap::new();
        map.record(0x100, Vec::new());
        assert!(map.lookup(0x100).is_empty());
    }
}
