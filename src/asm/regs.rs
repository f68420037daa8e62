//! The fixed register roles emitted code observes.

use crate::regalloc::register_set::Gpr;

/// Mirrors the hardware stack pointer's role in the emitted ABI. This is
/// just `%rsp` itself -- listed here for documentation parity with the
/// other four roles, all of which *are* allocator-reserved GPRs.
pub const STACK_PTR: Gpr = Gpr::Rsp;

/// Mirrors the hardware frame pointer's role.
pub const FRAME_PTR: Gpr = Gpr::Rbp;

/// Thread-local cache base: per-name caches (global fetch, method dispatch)
/// are addressed off this register.
pub const TLS_BASE: Gpr = Gpr::R15;

/// The "stashed activation record" register, live across prologue entry
/// before the callee's own frame pointer is installed.
pub const STASHED_AR: Gpr = Gpr::R14;

/// Reserved for the assembler's own internal use (e.g. materializing a
/// 64-bit immediate before a `movabs`-style sequence); never visible
/// across an instruction boundary.
pub const ASM_SCRATCH: Gpr = Gpr::R13;

/// The register the dispatcher reads the service-id out of when a
/// translation suspends back to it. Chosen as a caller-saved GPR distinct
/// from the five ABI-reserved roles above, so ordinary codegen never
/// collides with it.
pub const SERVICE_ID: Gpr = Gpr::Rax;
