//! Top-level pipeline: turn a bytecode region into native code and wire
//! the result into the translation cache.
//!
//! [`translate`] is what a dispatch loop calls once it decides a source
//! key is hot enough to translate: it runs the analyzer, lowers the
//! resulting tracelet through code generation, and publishes the bytes
//! under the write lease the caller already holds. [`bind_call`] and
//! [`bind_branch`] are the other half -- given a service request that
//! names a target source key, and the native site that request was
//! reached from, patch that site against whatever translation exists
//! (or will later exist) for the target, through the same
//! [`CodeCache::chain_incoming_branch`] machinery [`CodeCache::publish_translation`]
//! itself re-patches against on every republish.

use std::sync::Arc;

use crate::analyze::{analyze, TypeEnv};
use crate::asm::Reloc;
use crate::cache::{ArenaKind, CodeCache, IncomingBranch, NativeRange, TranslationKind, TranslationRec};
use crate::codegen::{self, Emitter, RegisterMap};
use crate::error::{JitError, JitResult};
use crate::fixup::{FixupMap, UnwindRegMap};
use crate::key::{FuncId, SourceKey};
use crate::service::ServiceRequest;
use crate::unit::SourceUnit;

/// A freshly-published translation plus whatever control transfers its
/// body left unresolved: a call site still pointing nowhere, a branch
/// whose target has no translation yet, a guard's side exit.
pub struct TranslateOutput {
    pub translation: Arc<TranslationRec>,
    pub pending: Vec<ServiceRequest>,
}

/// Run the pipeline for one source key: analyze, emit, publish.
///
/// `env` is the caller's live type snapshot for `entry`, threaded
/// through exactly as repeated [`analyze`] calls always expect. The
/// caller must already hold the write lease (this crate never takes it
/// implicitly -- see [`CodeCache::try_acquire_lease`]).
pub fn translate(
    cache: &mut CodeCache,
    lease: &parking_lot::MutexGuard<'_, ()>,
    fixups: &mut FixupMap,
    unwind_regs: &mut UnwindRegMap,
    unit: &SourceUnit,
    entry: SourceKey,
    env: &mut TypeEnv,
    max_len: u32,
) -> JitResult<TranslateOutput> {
    let analysis = analyze(unit, entry, env, max_len);
    if analysis.tracelet.failed && analysis.tracelet.instrs.is_empty() {
        return Err(JitError::MalformedSourceUnit(format!(
            "{entry} decoded no bytecode to translate"
        )));
    }

    let (main_range, cold_range, pending) = {
        let (main, cold) = cache.arenas_mut();
        let main_start = main.frontier();
        let cold_start = cold.frontier();
        let mut regs = RegisterMap::new();
        let mut emitter = Emitter::new(main, cold, fixups, unwind_regs);
        let pending = codegen::emit_tracelet(&analysis.tracelet, &unit.shape, &mut regs, &mut emitter);
        let main_end = emitter.main.frontier();
        let cold_end = emitter.cold.frontier();
        let main_range = NativeRange {
            arena: ArenaKind::Main,
            start: main_start,
            end: main_end,
        };
        let cold_range = (cold_end > cold_start).then_some(NativeRange {
            arena: ArenaKind::Cold,
            start: cold_start,
            end: cold_end,
        });
        (main_range, cold_range, pending)
    };

    let translation = cache.publish_translation(lease, entry, TranslationKind::Tracelet, main_range, cold_range)?;
    Ok(TranslateOutput { translation, pending })
}

/// Patch a [`ServiceRequest::BindCall`]'s call site so the call lands
/// directly in `callee`'s top translation once one exists, and remember
/// the site so a later republish of `callee` repatches it automatically.
/// Deciding which function a callee id actually names is the embedding
/// runtime's job; this only resolves the already-known target.
pub fn bind_call(
    cache: &mut CodeCache,
    lease: &parking_lot::MutexGuard<'_, ()>,
    arena: ArenaKind,
    call_site: u32,
    callee: SourceKey,
) {
    cache.chain_incoming_branch(
        lease,
        callee,
        IncomingBranch {
            arena,
            site_offset: call_site,
            reloc: Reloc::X86PcRel4,
        },
    );
}

/// Patch a same-function jump, side exit, or conditional-branch arm so
/// it lands directly in `target_offset`'s top translation.
/// `BindJmp`/`BindSideExit`/`BindJmpccSecond`/either half of
/// `BindJmpccFirst` all name a bytecode offset within the owning
/// function rather than a full source key, so `func` supplies the rest.
/// `native_site` is the rel32 placeholder the dispatch loop reserved for
/// this control transfer.
pub fn bind_branch(
    cache: &mut CodeCache,
    lease: &parking_lot::MutexGuard<'_, ()>,
    arena: ArenaKind,
    native_site: u32,
    func: FuncId,
    target_offset: u32,
) {
    let target = SourceKey::new(func, target_offset);
    cache.chain_incoming_branch(
        lease,
        target,
        IncomingBranch {
            arena,
            site_offset: native_site,
            reloc: Reloc::X86PcRel4,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::instr::{Immediate, Opcode};
    use crate::unit::{FuncShape, RawBc, SourceUnit};

    fn shape() -> FuncShape {
        FuncShape {
            id: FuncId(1),
            num_params: 0,
            num_locals: 1,
            param_defaults: vec![],
            uses_extra_args: false,
            has_var_env: false,
            is_pseudomain: false,
        }
    }

    fn straight_line_unit() -> SourceUnit {
        SourceUnit::new(
            shape(),
            vec![
                RawBc {
                    offset: 0,
                    opcode: Opcode::Int,
                    imm: Immediate::None,
                },
                RawBc {
                    offset: 1,
                    opcode: Opcode::RetC,
                    imm: Immediate::None,
                },
            ],
        )
    }

    #[test]
    fn translate_runs_analysis_through_publish() {
        let mut cache = CodeCache::new(&JitConfig::default());
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let unit = straight_line_unit();
        let entry = SourceKey::entry(FuncId(1));
        let mut env = TypeEnv::default();

        let lease = cache.try_acquire_lease().unwrap();
        let out = translate(&mut cache, &lease, &mut fixups, &mut unwind_regs, &unit, entry, &mut env, 64).unwrap();
        drop(lease);

        assert!(out.translation.main_range.end > out.translation.main_range.start);
        assert_eq!(cache.top_translation(entry).unwrap().main_range, out.translation.main_range);
        assert!(out.pending.iter().any(|r| matches!(r, ServiceRequest::PostInterpRet)));
    }

    #[test]
    fn translate_of_an_empty_decode_is_an_error() {
        let mut cache = CodeCache::new(&JitConfig::default());
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let unit = SourceUnit::new(shape(), vec![]);
        let mut env = TypeEnv::default();

        let lease = cache.try_acquire_lease().unwrap();
        let err = translate(&mut cache, &lease, &mut fixups, &mut unwind_regs, &unit, SourceKey::entry(FuncId(1)), &mut env, 64)
            .unwrap_err();
        assert!(matches!(err, JitError::MalformedSourceUnit(_)));
    }

    #[test]
    fn bind_call_patches_an_existing_translation_immediately() {
        let mut cache = CodeCache::new(&JitConfig::default());
        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let unit = straight_line_unit();
        let callee = SourceKey::entry(FuncId(1));
        let mut env = TypeEnv::default();

        let lease = cache.try_acquire_lease().unwrap();
        translate(&mut cache, &lease, &mut fixups, &mut unwind_regs, &unit, callee, &mut env, 64).unwrap();

        let call_site = {
            let main = cache.main_mut();
            main.prepare_for_smash(4);
            let at = main.frontier();
            main.put4(0);
            at
        };
        bind_call(&mut cache, &lease, ArenaKind::Main, call_site, callee);
        drop(lease);

        let patched = &cache.main().as_slice()[call_site as usize..call_site as usize + 4];
        assert_ne!(patched, &0u32.to_le_bytes());
    }

    #[test]
    fn bind_branch_chains_against_a_not_yet_published_target() {
        let mut cache = CodeCache::new(&JitConfig::default());
        let func = FuncId(9);
        let target_offset = 40;

        let native_site = {
            let main = cache.main_mut();
            main.prepare_for_smash(4);
            let at = main.frontier();
            main.put4(0);
            // Separate the reserved site from the translation that will
            // land right after it, so the rel32 this test checks for
            // isn't trivially zero.
            for _ in 0..16 {
                main.put1(0x90);
            }
            at
        };

        let lease = cache.try_acquire_lease().unwrap();
        bind_branch(&mut cache, &lease, ArenaKind::Main, native_site, func, target_offset);
        // Unpatched until the target is actually published.
        assert_eq!(
            &cache.main().as_slice()[native_site as usize..native_site as usize + 4],
            &0u32.to_le_bytes()
        );

        let mut fixups = FixupMap::new();
        let mut unwind_regs = UnwindRegMap::new();
        let unit = SourceUnit::new(
            FuncShape {
                id: func,
                num_params: 0,
                num_locals: 0,
                param_defaults: vec![],
                uses_extra_args: false,
                has_var_env: false,
                is_pseudomain: false,
            },
            vec![RawBc {
                offset: target_offset,
                opcode: Opcode::RetC,
                imm: Immediate::None,
            }],
        );
        let mut env = TypeEnv::default();
        translate(
            &mut cache,
            &lease,
            &mut fixups,
            &mut unwind_regs,
            &unit,
            SourceKey::new(func, target_offset),
            &mut env,
            64,
        )
        .unwrap();
        drop(lease);

        assert_ne!(
            &cache.main().as_slice()[native_site as usize..native_site as usize + 4],
            &0u32.to_le_bytes()
        );
    }
}
