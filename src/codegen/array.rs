//! Array element read and write.
//!
//! Every element access (`CGetM`/`SetM` when the base is an array) goes
//! through a helper call dispatched on `(key type, value type)`: this
//! crate's closed opcode set doesn't distinguish `ArrayGetInt` from
//! `ArrayGetString` the way a fuller bytecode would, so the dispatch
//! happens here instead of at analysis time. A write additionally has
//! to account for copy-on-write: the array may need to be duplicated
//! before the mutation if its refcount shows another owner, and the
//! helper communicates a possibly-different backing pointer back in its
//! return register, which the caller must rebind into the register
//! allocator.

use super::Emitter;
use crate::abi::SERVICE_ID;
use crate::loc::Location;
use crate::regalloc::register_set::Gpr;
use crate::regalloc::{Cleanliness, RegisterMap};
use crate::types::RuntimeType;

/// Which helper routine handles a given key shape. The embedding
/// runtime supplies the actual addresses; this crate only needs to pick
/// the right one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyShape {
    Int,
    String,
    /// Key type not proven; the helper itself must switch on it.
    Unknown,
}

pub fn key_shape_of(ty: &RuntimeType) -> KeyShape {
    use crate::types::DataType;
    match ty.data_type() {
        Some(DataType::Int) => KeyShape::Int,
        Some(DataType::String(_)) => KeyShape::String,
        _ => KeyShape::Unknown,
    }
}

/// `CGetM` against an array base: call the read helper (preloaded
/// address in `helper`), landing the result in `dst`. `base`/`key` are
/// assumed already placed in the calling convention's argument
/// registers by the caller.
pub fn emit_array_get(emitter: &mut Emitter<'_>, dst: Gpr, helper: Gpr) {
    emitter.call_reg(helper);
    if dst != SERVICE_ID {
        emitter.mov_reg_reg(dst, SERVICE_ID);
    }
}

/// `SetM` against an array base: call the write helper, then rebind
/// `array_loc` in the register allocator to whatever pointer the helper
/// returned, since a copy-on-write array may have been duplicated under
/// the call.
pub fn emit_array_set(emitter: &mut Emitter<'_>, regs: &mut RegisterMap, array_loc: &Location, array_ty: &RuntimeType, helper: Gpr) {
    emitter.call_reg(helper);
    regs.invalidate(array_loc);
    regs.bind(SERVICE_ID, array_loc.clone(), array_ty.clone(), Cleanliness::Clean);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::CodeBuffer;
    use crate::fixup::{FixupMap, UnwindRegMap};
    use crate::types::DataType;

    #[test]
    fn key_shape_classifies_ints_and_strings() {
        assert_eq!(key_shape_of(&RuntimeType::known(DataType::Int)), KeyShape::Int);
        assert_eq!(key_shape_of(&RuntimeType::Vague), KeyShape::Unknown);
    }

    #[test]
    fn array_set_rebinds_the_base_location() {
        let mut main = CodeBuffer::new();
        let mut cold = CodeBuffer::new();
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let mut emitter = Emitter::new(&mut main, &mut cold, &mut fixups, &mut unwind_regs);
        let mut regs = RegisterMap::new();
        let loc = Location::Stack(0);
        let ty = RuntimeType::known(DataType::Array);
        emit_array_set(&mut emitter, &mut regs, &loc, &ty, Gpr::Rcx);
        assert!(regs.reg_of(&loc).is_some());
    }
}
