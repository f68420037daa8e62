//! Exception unwinding through the fixup map.
//!
//! On a host exception from a helper, the runtime walks its C stack; for
//! each frame whose return address falls inside the code cache it
//! consults [`FixupMap`] to restore the virtual-machine stack/frame/pc
//! pointers and [`UnwindRegMap`] to spill any dirty callee-saved
//! registers before handing control to the language's own exception
//! machinery. The JIT never catches -- it only resynchronizes state so
//! the catch can happen above it.

use crate::fixup::{Fixup, FixupMap, NativeOffset, UnwindRegEntry, UnwindRegMap};
use crate::key::{FuncId, SourceKey};

/// The virtual-machine register values recovered for one unwound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredFrame {
    pub source_key: SourceKey,
    pub stack_depth: u32,
    /// Registers that held a dirty value at the call site and have now
    /// been spilled to their memory homes; each entry names the location
    /// that was made authoritative.
    pub spilled: Vec<UnwindRegEntry>,
}

/// Resolve one C-stack frame's return address into VM state, spilling any
/// dirty callee-saved registers along the way. Returns `None` if
/// `return_addr` has no fixup entry, meaning this frame's return address
/// does not belong to a fixup-eligible call site (the caller should not
/// have invoked unwinding on it).
pub fn recover_frame(
    fixups: &FixupMap,
    unwind_regs: &UnwindRegMap,
    func: FuncId,
    return_addr: NativeOffset,
) -> Option<RecoveredFrame> {
    let Fixup {
        bc_offset,
        stack_depth,
    } = fixups.lookup(return_addr)?;
    let spilled = unwind_regs.lookup(return_addr).to_vec();
    Some(RecoveredFrame {
        source_key: SourceKey::new(func, bc_offset),
        stack_depth,
        spilled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loc::Location;
    use crate::regalloc::register_set::Gpr;
    use crate::types::{DataType, RuntimeType};

    #[test]
    fn recover_frame_resolves_bc_offset_and_spills_dirty_registers() {
        let mut fixups = FixupMap::new();
        fixups.record(
            0x1000,
            Fixup {
                bc_offset: 17,
                stack_depth: 2,
            },
        );
        let mut unwind_regs = UnwindRegMap::new();
        unwind_regs.record(
            0x1000,
            vec![UnwindRegEntry {
                reg: Gpr::Rbx,
                loc: Location::Local(0),
                ty: RuntimeType::known(DataType::Int),
            }],
        );

        let frame = recover_frame(&fixups, &unwind_regs, FuncId(9), 0x1000).unwrap();
        assert_eq!(frame.source_key, SourceKey::new(FuncId(9), 17));
        assert_eq!(frame.stack_depth, 2);
        assert_eq!(frame.spilled.len(), 1);
    }

    #[test]
    fn unknown_return_address_yields_no_frame() {
        let fixups = FixupMap::new();
        let unwind_regs = UnwindRegMap::new();
        assert!(recover_frame(&fixups, &unwind_regs, FuncId(1), 0xdead).is_none());
    }
}
