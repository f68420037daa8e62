//! Symbolic addresses the analyzer and register allocator reason about.

use crate::types::RuntimeType;
use std::fmt;

/// A local variable slot index within the current activation record.
pub type LocalId = u32;

/// An active iterator slot index within the current activation record.
pub type IterId = u32;

/// A symbolic address. Stack offsets are relative to the tracelet's entry
/// top-of-stack (not the physical stack pointer, which moves as helper
/// calls push/pop); [`crate::abi`] is responsible for the final
/// stack-pointer-relative translation at emission time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    /// `offset` cells below the tracelet's entry top-of-stack.
    Stack(i32),
    Local(LocalId),
    Iterator(IterId),
    /// A compile-time-known constant; never lives in a register slot of
    /// its own, but can be the input operand to an instruction.
    Literal(Literal),
    /// An allocator-private temporary with no user-visible identity.
    Scratch(u32),
    /// Used as the sentinel default and as the register-map "no owner"
    /// marker; never a valid analyzer output.
    Invalid,
}

/// A compile-time literal value embedded directly in a
/// [`Location::Literal`]. Deliberately narrow: anything bigger than a
/// machine word (strings, arrays) is interned by the embedding runtime and
/// referenced here by id.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Literal {
    Int(i64),
    Double(f64),
    Bool(bool),
    Null,
    /// Interned string-literal table index.
    StringId(u32),
}

impl Location {
    pub fn is_stack(&self) -> bool {
        matches!(self, Self::Stack(_))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stack(off) => write!(f, "stack[{off}]"),
            Self::Local(id) => write!(f, "local${id}"),
            Self::Iterator(id) => write!(f, "iter${id}"),
            Self::Literal(l) => write!(f, "lit({l:?})"),
            Self::Scratch(tag) => write!(f, "scratch#{tag}"),
            Self::Invalid => write!(f, "<invalid>"),
        }
    }
}

/// `(Location, RuntimeType)` -- the analyzer's unit of reasoning: "at this
/// program point, this location holds this type." Every
/// [`crate::instr::NormalizedInstruction`] consumes a list of these as
/// inputs and produces a list of these as outputs.
#[derive(Clone, Debug, PartialEq)]
pub struct DynLocation {
    pub loc: Location,
    pub ty: RuntimeType,
}

impl DynLocation {
    pub fn new(loc: Location, ty: RuntimeType) -> Self {
        Self { loc, ty }
    }
}

impl fmt::Display for DynLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.loc, self.ty)
    }
}
