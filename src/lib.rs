//! A tracelet-based, non-optimizing JIT for a dynamically-typed
//! bytecode VM, x86-64 only.
//!
//! The pipeline a source key goes through: [`analyze`] walks bytecode
//! forward from an entry point under symbolic types, producing a
//! [`tracelet::Tracelet`]; [`codegen`] lowers that tracelet's
//! instructions to machine code one opcode at a time; [`cache`] owns
//! the arenas the bytes land in, the per-source-key translation
//! records, and the write lease that keeps concurrent translators from
//! stepping on each other; [`service`] is the vocabulary translated
//! code uses to ask the embedder for help (binding an unresolved call,
//! falling back to the interpreter, handling a guard miss) when it
//! runs out of road. [`prologue`] emits the function-entry sequences
//! that lead into a tracelet; [`dump`] renders the cache's contents
//! for offline inspection. [`dispatch`] is the glue: it runs the
//! analyze-then-codegen pipeline for one source key and publishes the
//! result, and turns a resolved service request into the `patch_at`
//! calls that make the next call through that site land directly in
//! the new code.

pub mod abi;
pub mod analyze;
pub mod asm;
pub mod cache;
pub mod codegen;
pub mod config;
pub mod dispatch;
pub mod dump;
pub mod error;
pub mod fixup;
pub mod instr;
pub mod key;
pub mod loc;
pub mod prologue;
pub mod regalloc;
pub mod service;
pub mod tracelet;
pub mod types;
pub mod unit;
pub mod unwind;

pub use analyze::{analyze, AnalysisResult, TypeEnv};
pub use error::{JitError, JitResult};
pub use key::{FuncId, SourceKey};
pub use service::ServiceRequest;
pub use tracelet::Tracelet;
pub use unit::{FuncShape, SourceUnit};
