//! Value classification used by the tracelet analyzer.
//!
//! `RuntimeType` is the unit of type reasoning throughout this crate: the
//! analyzer tracks one per live [`crate::loc::Location`], the code
//! generator emits a guard whenever a `RuntimeType` is "vague" but an
//! instruction needs it checked, and the prediction machinery (global
//! fetch, dynamic call) stamps a `RuntimeType` onto an output before it's
//! actually known to be true.

use std::fmt;

/// The known, checkable data types a cell's discriminator word can carry.
/// This must stay in sync with the discriminator encoding baked into
/// emitted code by [`crate::abi::CELL_DISCRIMINATOR_OFFSET`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Null,
    Bool,
    Int,
    Double,
    /// Two discriminator codes are considered "string" (static and
    /// refcounted); see [`StringKind`].
    String(StringKind),
    Array,
    Object,
    ClassRef,
    Iterator(IterKind),
    /// A boxed reference cell. Always carries an inner type, itself
    /// possibly [`RuntimeType::Vague`] -- see the invariant on
    /// [`RuntimeType`].
    RefCell,
}

/// Strings come in a static (never refcounted, immortal) and a normal
/// (refcounted) flavor; the discriminator test for "is this a string" must
/// mask both codes, while code that only cares whether a decref is needed
/// distinguishes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StringKind {
    Static,
    Counted,
}

/// Iteration is over either a reference-counted array or an object's
/// property table; the two require different helper routines for advance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IterKind {
    Array,
    Object,
}

/// A more precise fact layered on top of a [`DataType`], when the analyzer
/// has proven (by a preceding guard, a literal, or a static fact) more than
/// the bare discriminator.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Refinement {
    /// No refinement beyond the bare `DataType`.
    None,
    /// An object of exactly this class (not a subclass) -- opaque class
    /// identity, owned by the embedding runtime.
    ExactClass(u32),
    /// The inner type of a [`DataType::RefCell`]. Boxed within `Box` to
    /// keep `RuntimeType` a small, `Copy`-free but cheaply-clonable value
    /// even though it's recursive.
    Inner(Box<RuntimeType>),
}

/// A value classification record: either a known [`DataType`] (optionally
/// refined), or [`RuntimeType::Vague`] meaning "unknown, must be checked or
/// interpreted."
///
/// Invariants (checked by [`RuntimeType::check_invariants`] in debug
/// builds, and by the analyzer's construction sites):
/// - A `RefCell` type always carries a `Refinement::Inner`, even if that
///   inner type is itself `Vague`.
/// - A `Refinement::ExactClass` implies the underlying `DataType` is
///   `Object`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeType {
    /// Unknown; must be checked (guard) or interpreted.
    Vague,
    Known(DataType, Refinement),
}

impl RuntimeType {
    pub fn known(dt: DataType) -> Self {
        let rt = Self::Known(dt, Refinement::None);
        rt.check_invariants();
        rt
    }

    pub fn ref_cell(inner: RuntimeType) -> Self {
        let rt = Self::Known(DataType::RefCell, Refinement::Inner(Box::new(inner)));
        rt.check_invariants();
        rt
    }

    pub fn exact_class(class_id: u32) -> Self {
        let rt = Self::Known(DataType::Object, Refinement::ExactClass(class_id));
        rt.check_invariants();
        rt
    }

    /// Panics if the type-invariants documented on this enum don't hold.
    /// Called at every construction site rather than trusted blindly,
    /// because a violated invariant here would silently miscompile a
    /// guard.
    fn check_invariants(&self) {
        if let Self::Known(dt, refinement) = self {
            match (dt, refinement) {
                (DataType::RefCell, Refinement::Inner(_)) => {}
                (DataType::RefCell, _) => {
                    panic!("RefCell RuntimeType must carry an Inner refinement")
                }
                (_, Refinement::ExactClass(_)) if !matches!(dt, DataType::Object) => {
                    panic!("ExactClass refinement requires DataType::Object")
                }
                _ => {}
            }
        }
    }

    pub fn is_vague(&self) -> bool {
        matches!(self, Self::Vague)
    }

    pub fn data_type(&self) -> Option<&DataType> {
        match self {
            Self::Vague => None,
            Self::Known(dt, _) => Some(dt),
        }
    }

    /// The inner type of a boxed reference cell, if this is one.
    pub fn inner_of_ref_cell(&self) -> Option<&RuntimeType> {
        match self {
            Self::Known(DataType::RefCell, Refinement::Inner(inner)) => Some(inner),
            _ => None,
        }
    }

    /// Whether a value of this type is reference-counted and thus needs
    /// incref/decref sequences. Vague types conservatively answer `true`
    /// (see [`crate::codegen::refcount`]).
    pub fn is_refcounted(&self) -> bool {
        match self {
            Self::Vague => true,
            Self::Known(dt, _) => matches!(
                dt,
                DataType::String(StringKind::Counted)
                    | DataType::Array
                    | DataType::Object
                    | DataType::RefCell
            ),
        }
    }

    /// Does `self` satisfy a guard requiring `required`? Used to decide
    /// whether a new guard must be emitted for a given input, so a type
    /// already proven by an earlier guard or literal is never re-checked.
    pub fn satisfies(&self, required: &RuntimeType) -> bool {
        match (self, required) {
            (_, RuntimeType::Vague) => true,
            (RuntimeType::Vague, _) => false,
            (RuntimeType::Known(a, ra), RuntimeType::Known(b, rb)) => {
                a == b
                    && match (ra, rb) {
                        (_, Refinement::None) => true,
                        (Refinement::ExactClass(x), Refinement::ExactClass(y)) => x == y,
                        (Refinement::Inner(x), Refinement::Inner(y)) => x.satisfies(y),
                        _ => false,
                    }
            }
        }
    }
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vague => write!(f, "Vague"),
            Self::Known(dt, Refinement::None) => write!(f, "{dt:?}"),
            Self::Known(dt, Refinement::ExactClass(c)) => write!(f, "{dt:?}<class#{c}>"),
            Self::Known(dt, Refinement::Inner(inner)) => write!(f, "{dt:?}({inner})"),
        }
    }
}
