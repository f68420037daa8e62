//! The bytecode source the analyzer walks.
//!
//! A real embedding runtime owns the parser/compiler that produces this;
//! this crate only needs read access to a linear decode of one function's
//! bytecode. `SourceUnit` is that minimal surface, and is what the
//! `tests/` fixtures build by hand to drive the translator without a real
//! interpreter attached.

use crate::instr::{Immediate, Opcode};
use crate::key::{BcOffset, FuncId};

/// One decoded bytecode at a fixed offset, before analyzer processing.
#[derive(Clone, Copy, Debug)]
pub struct RawBc {
    pub offset: BcOffset,
    pub opcode: Opcode,
    pub imm: Immediate,
}

/// A function's parameter/local layout, enough for prologue emission
/// without needing the full object model.
#[derive(Clone, Debug)]
pub struct FuncShape {
    pub id: FuncId,
    pub num_params: u32,
    pub num_locals: u32,
    /// Bytecode offset of the default-value-initializer funclet for each
    /// parameter beyond the required ones, if any.
    pub param_defaults: Vec<Option<BcOffset>>,
    /// Whether this function may read `func_get_args()`-style extra
    /// arguments (the prologue must stash them rather than drop them).
    pub uses_extra_args: bool,
    /// Whether the function has a variable-environment (`extract()`,
    /// `compact()`) that forces locals to be read through a slow path.
    pub has_var_env: bool,
    /// True for top-level "pseudomain" scripts, where locals behave like
    /// globals for guard-policy purposes.
    pub is_pseudomain: bool,
}

impl FuncShape {
    /// `min(nPassed, numParams + 1)`, the prologue argument-count bucket.
    pub fn arg_count_bucket(&self, n_passed: u32) -> u32 {
        n_passed.min(self.num_params + 1)
    }
}

/// One function's linear bytecode stream plus its shape, addressable by
/// offset. The analyzer only ever looks forward from a given `SourceKey`,
/// so `decode_at` plus `next_offset` is the whole read interface it needs.
#[derive(Clone, Debug)]
pub struct SourceUnit {
    pub shape: FuncShape,
    instrs: Vec<RawBc>,
}

impl SourceUnit {
    pub fn new(shape: FuncShape, instrs: Vec<RawBc>) -> Self {
        debug_assert!(
            instrs.windows(2).all(|w| w[0].offset < w[1].offset),
            "bytecode stream must be in increasing offset order"
        );
        Self { shape, instrs }
    }

    pub fn decode_at(&self, offset: BcOffset) -> Option<RawBc> {
        self.instrs.iter().copied().find(|i| i.offset == offset)
    }

    /// The offset one past `offset`'s instruction, i.e. the fall-through
    /// target, or `None` at end of stream.
    pub fn next_offset(&self, offset: BcOffset) -> Option<BcOffset> {
        let idx = self.instrs.iter().position(|i| i.offset == offset)?;
        self.instrs.get(idx + 1).map(|i| i.offset)
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }
}
