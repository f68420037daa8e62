//! Source keys: the primary key of the translation cache.

use std::fmt;

/// Identifies one owning function (or pseudomain unit-level scope) in the
/// source program. Opaque to this crate beyond equality and hashing; the
/// embedding runtime hands these out and guarantees they're stable for the
/// lifetime of the function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FuncId(pub u32);

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func#{}", self.0)
    }
}

/// A byte offset into a function's bytecode stream.
pub type BcOffset = u32;

/// `(owning-function-identity, bytecode-offset)`. The primary key of the
/// translation cache: every [`crate::cache::SrcRec`] is keyed by one of
/// these, and every [`crate::tracelet::Tracelet`] starts at one.
///
/// Two source keys compare equal only when both components match -- the
/// same bytecode offset in two different functions (e.g. two closures that
/// happen to share a literal body) is never the same source key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceKey {
    pub func: FuncId,
    pub offset: BcOffset,
}

impl SourceKey {
    pub fn new(func: FuncId, offset: BcOffset) -> Self {
        Self { func, offset }
    }

    /// The source key for the entry point of `func` (offset 0).
    pub fn entry(func: FuncId) -> Self {
        Self::new(func, 0)
    }

    /// A source key for the same function at a different offset, as
    /// produced when the analyzer walks a fall-through or computes a
    /// branch target.
    pub fn at(self, offset: BcOffset) -> Self {
        Self::new(self.func, offset)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:#x}", self.func, self.offset)
    }
}
