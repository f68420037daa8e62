//! Set of allocatable general-purpose registers as a bit vector.
//!
//! Narrowed to this crate's single ISA: the sixteen x86-64 general-purpose
//! registers. There is no register-unit aliasing to model (no AL/AH style
//! sub-registers in play here -- every opcode this crate emits operates on
//! full 64-bit GPRs), so this is a flat 16-bit mask rather than a
//! multi-word register-unit mask.

use std::fmt;

/// One of the sixteen x86-64 general-purpose registers, named the way the
/// assembler (and the ABI layer) names them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

pub const NUM_GPRS: usize = 16;

pub const ALL_GPRS: [Gpr; NUM_GPRS] = [
    Gpr::Rax,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rbx,
    Gpr::Rsp,
    Gpr::Rbp,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
];

impl Gpr {
    pub fn bit(self) -> u16 {
        1u16 << (self as u8)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Rax => "rax",
            Self::Rcx => "rcx",
            Self::Rdx => "rdx",
            Self::Rbx => "rbx",
            Self::Rsp => "rsp",
            Self::Rbp => "rbp",
            Self::Rsi => "rsi",
            Self::Rdi => "rdi",
            Self::R8 => "r8",
            Self::R9 => "r9",
            Self::R10 => "r10",
            Self::R11 => "r11",
            Self::R12 => "r12",
            Self::R13 => "r13",
            Self::R14 => "r14",
            Self::R15 => "r15",
        }
    }

    /// System V AMD64 caller-saved (volatile across a `call`) registers.
    pub fn is_caller_saved(self) -> bool {
        matches!(
            self,
            Self::Rax
                | Self::Rcx
                | Self::Rdx
                | Self::Rsi
                | Self::Rdi
                | Self::R8
                | Self::R9
                | Self::R10
                | Self::R11
        )
    }

    pub fn is_callee_saved(self) -> bool {
        !self.is_caller_saved()
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.name())
    }
}

/// The five registers dedicated to fixed roles and never considered for
/// allocation: stack-pointer mirror, frame-pointer mirror, thread-local-
/// cache base, stashed activation record, assembler scratch.
///
/// `Rsp`/`Rbp` are excluded because the hardware itself dedicates them;
/// `R15`/`R14`/`R13` are this crate's concrete choice for the remaining
/// three roles (thread-local base, stashed activation record, assembler
/// scratch respectively).
pub const RESERVED: [Gpr; 5] = [Gpr::Rsp, Gpr::Rbp, Gpr::R15, Gpr::R14, Gpr::R13];

fn reserved_mask() -> u16 {
    RESERVED.iter().fold(0u16, |m, &r| m | r.bit())
}

/// Set of registers available for allocation, as a bitset over the
/// sixteen GPRs. `take`/`free` are the only mutators; everything else is a
/// query.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RegisterSet {
    avail: u16,
}

impl RegisterSet {
    /// All allocatable registers (i.e. all sixteen GPRs minus the five
    /// reserved roles) available.
    pub fn new() -> Self {
        Self {
            avail: !reserved_mask(),
        }
    }

    pub fn empty() -> Self {
        Self { avail: 0 }
    }

    pub fn is_avail(&self, r: Gpr) -> bool {
        self.avail & r.bit() != 0
    }

    /// Remove `r` from the available set.
    ///
    /// # Panics
    /// If `r` is already unavailable, or is one of [`RESERVED`].
    pub fn take(&mut self, r: Gpr) {
        debug_assert!(reserved_mask() & r.bit() == 0, "{r} is a reserved register");
        debug_assert!(self.is_avail(r), "{r} not available in {self}");
        self.avail &= !r.bit();
    }

    /// Return `r` to the available set.
    ///
    /// # Panics
    /// If `r` is already available.
    pub fn free(&mut self, r: Gpr) {
        debug_assert!(!self.is_avail(r), "{r} is already free in {self}");
        self.avail |= r.bit();
    }

    pub fn intersect(&mut self, other: &Self) {
        self.avail &= other.avail;
    }

    pub fn interferes_with(&self, other: &Self) -> bool {
        self.avail & other.avail != 0
    }

    /// Iterate available registers from the caller-saved set first, then
    /// the callee-saved ones -- cheap registers to fill and forget are
    /// preferred, since the allocator never has to emit a
    /// callee-save-preserving prologue for them.
    pub fn iter_preferring_caller_saved(&self) -> impl Iterator<Item = Gpr> + '_ {
        ALL_GPRS
            .into_iter()
            .filter(|r| self.is_avail(*r) && r.is_caller_saved())
            .chain(
                ALL_GPRS
                    .into_iter()
                    .filter(|r| self.is_avail(*r) && r.is_callee_saved()),
            )
    }

    pub fn count(&self) -> u32 {
        self.avail.count_ones()
    }
}

impl Default for RegisterSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for r in ALL_GPRS {
            if self.is_avail(r) {
                write!(f, " {r}")?;
            }
        }
        write!(f, " ]")
    }
}
