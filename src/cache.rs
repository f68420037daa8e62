//! The translation cache: code arenas, per-source-key translation
//! records, the write lease serializing mutation, and the treadmill
//! that reclaims a retired translation's bytes once no request thread
//! can still be executing inside it.
//!
//! Request threads share this cache but never block on each other to
//! read it: dispatching an existing translation or reading the
//! published top-translation pointer is wait-free. Only emitting a new
//! translation or patching an existing one takes the write lease.

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::asm::trampoline::TrampolineArena;
use crate::asm::{CodeBuffer, Reloc};
use crate::error::{JitError, JitResult};
use crate::key::SourceKey;

/// Which arena a translation's bytes live in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ArenaKind {
    Main,
    Cold,
}

/// One `[start, end)` byte range plus which arena it's in. Serializable
/// behind `enable-serde` so an offline dump (see [`crate::dump`]) can be
/// round-tripped through a format other than its own hand-rolled one,
/// e.g. for a `tjdump --json` mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NativeRange {
    pub arena: ArenaKind,
    pub start: u32,
    pub end: u32,
}

/// What kind of entry point a translation is, for dump/debug purposes
/// and for deciding whether the prologue-specific interception path
/// applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslationKind {
    Prologue,
    Tracelet,
}

/// One emitted translation: its native code range(s), the source key
/// it serves, and the retirement epoch it was marked unreachable at (if
/// any -- `None` while still live).
#[derive(Clone, Debug)]
pub struct TranslationRec {
    pub key: SourceKey,
    pub kind: TranslationKind,
    pub main_range: NativeRange,
    pub cold_range: Option<NativeRange>,
    retired_at_epoch: Option<u64>,
}

impl TranslationRec {
    pub fn is_retired(&self) -> bool {
        self.retired_at_epoch.is_some()
    }
}

/// A native-code site whose final jump/call target is a source key's top
/// translation -- recorded against that key so that when a new translation
/// replaces the current one, the site gets re-patched rather than left
/// dangling into retired code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IncomingBranch {
    pub arena: ArenaKind,
    pub site_offset: u32,
    pub reloc: Reloc,
}

/// Per-source-key bookkeeping: every translation ever produced for this
/// key, plus a lock-free pointer to whichever one dispatch should try
/// first.
pub struct SrcRec {
    key: SourceKey,
    translations: Vec<Arc<TranslationRec>>,
    top: AtomicPtr<TranslationRec>,
    limit: u32,
    incoming: Vec<IncomingBranch>,
}

impl SrcRec {
    fn new(key: SourceKey, limit: u32) -> Self {
        Self {
            key,
            translations: Vec::new(),
            top: AtomicPtr::new(std::ptr::null_mut()),
            limit,
            incoming: Vec::new(),
        }
    }

    /// The current top translation, if one has been published. Wait-free:
    /// no lease is taken.
    pub fn top(&self) -> Option<Arc<TranslationRec>> {
        let ptr = self.top.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: every pointer ever stored in `top` was obtained from
        // `Arc::into_raw` on an `Arc` kept alive in `translations`, and
        // is only retired (not freed) while reachable from there.
        let rec = unsafe { Arc::from_raw(ptr) };
        let clone = rec.clone();
        std::mem::forget(rec);
        Some(clone)
    }

    fn publish(&mut self, rec: Arc<TranslationRec>) {
        let raw = Arc::into_raw(rec.clone()) as *mut TranslationRec;
        let old = self.top.swap(raw, Ordering::AcqRel);
        if !old.is_null() {
            // SAFETY: matches the `Arc::into_raw` in a prior `publish`
            // call; reclaiming this pointer's refcount just balances
            // the one taken there. The underlying `TranslationRec` is
            // still kept alive (if at all) by `self.translations`.
            unsafe {
                drop(Arc::from_raw(old));
            }
        }
        self.translations.push(rec);
    }

    pub fn translation_count(&self) -> usize {
        self.translations.len()
    }

    /// Whether this source key has hit its translation cap -- beyond
    /// this, new requests route to a generic interpret-one-block
    /// service request rather than growing the cache further.
    pub fn at_translation_limit(&self) -> bool {
        self.translations.len() as u32 >= self.limit
    }

    /// Record `branch` as pointing at this key's top translation,
    /// replacing any earlier entry recorded at the same site rather than
    /// accumulating a duplicate -- a site only ever needs patching once
    /// per republish, however many times it was last bound there.
    fn record_incoming_branch(&mut self, branch: IncomingBranch) {
        match self
            .incoming
            .iter_mut()
            .find(|b| b.arena == branch.arena && b.site_offset == branch.site_offset)
        {
            Some(existing) => *existing = branch,
            None => self.incoming.push(branch),
        }
    }

    pub fn incoming_branches(&self) -> &[IncomingBranch] {
        &self.incoming
    }
}

/// A retired translation awaiting physical reclamation once no request
/// thread can still be executing inside its byte range.
struct Retirement {
    rec: Arc<TranslationRec>,
    retired_at_epoch: u64,
}

/// The epoch-based treadmill: each request thread bumps a shared
/// counter at every quiescent crossing (request start), and a
/// translation retired at epoch `e` is only physically reclaimed once
/// every thread has been observed past `e`.
#[derive(Default)]
pub struct Treadmill {
    epoch: AtomicU64,
    observed: Mutex<Vec<u64>>,
    retired: Mutex<Vec<Retirement>>,
}

impl Treadmill {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request thread, returning a slot index it should pass
    /// to every later [`Treadmill::cross_quiescent_point`] call.
    pub fn register_thread(&self) -> usize {
        let mut observed = self.observed.lock();
        observed.push(self.epoch.load(Ordering::Relaxed));
        observed.len() - 1
    }

    /// Called at the start of every request: bump the global epoch and
    /// record that this thread has reached a point where it holds no
    /// reference into retired code.
    pub fn cross_quiescent_point(&self, thread_slot: usize) {
        let now = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.observed.lock()[thread_slot] = now;
    }

    fn min_observed_epoch(&self) -> u64 {
        self.observed.lock().iter().copied().min().unwrap_or(0)
    }

    pub fn retire(&self, rec: Arc<TranslationRec>) {
        let at = self.epoch.load(Ordering::Acquire);
        self.retired.lock().push(Retirement { rec, retired_at_epoch: at });
    }

    /// Physically drop every retirement whose epoch has been passed by
    /// every registered thread. Returns how many were reclaimed, for
    /// `jit-transcounters`-style bookkeeping.
    pub fn reclaim(&self) -> usize {
        let floor = self.min_observed_epoch();
        let mut retired = self.retired.lock();
        let before = retired.len();
        retired.retain(|r| r.retired_at_epoch >= floor);
        before - retired.len()
    }
}

/// The three code arenas plus the per-source-key database and the write
/// lease guarding mutation of either.
pub struct CodeCache {
    main: CodeBuffer,
    cold: CodeBuffer,
    trampolines: TrampolineArena,
    by_key: FxHashMap<SourceKey, SrcRec>,
    treadmill: Treadmill,
    lease: Mutex<()>,
    main_budget: u32,
    cold_budget: u32,
    translation_limit: u32,
}

impl CodeCache {
    pub fn new(config: &crate::config::JitConfig) -> Self {
        Self {
            main: CodeBuffer::new(),
            cold: CodeBuffer::new(),
            trampolines: TrampolineArena::new(config.jit_transcounters),
            by_key: FxHashMap::default(),
            treadmill: Treadmill::new(),
            lease: Mutex::new(()),
            main_budget: config.main_arena_bytes,
            cold_budget: config.cold_arena_bytes,
            translation_limit: config.max_translations_per_key,
        }
    }

    /// Try to acquire the write lease without blocking. `None` means the
    /// caller should fall back to interpreting the current tracelet.
    pub fn try_acquire_lease(&self) -> Option<parking_lot::MutexGuard<'_, ()>> {
        self.lease.try_lock()
    }

    pub fn treadmill(&self) -> &Treadmill {
        &self.treadmill
    }

    pub fn trampolines(&mut self) -> &mut TrampolineArena {
        &mut self.trampolines
    }

    /// Look up (without taking the lease) the published top translation
    /// for `key`, if any has been produced.
    pub fn top_translation(&self, key: SourceKey) -> Option<Arc<TranslationRec>> {
        self.by_key.get(&key).and_then(SrcRec::top)
    }

    pub fn translation_count(&self, key: SourceKey) -> usize {
        self.by_key.get(&key).map(SrcRec::translation_count).unwrap_or(0)
    }

    /// Flatten a native range into a synthetic cross-arena offset: main
    /// arena bytes occupy `[0, main_budget)`, cold arena bytes occupy
    /// `[main_budget, main_budget + cold_budget)`. Displacements are
    /// computed against this shared address space rather than real
    /// pointers, since the arenas are only guaranteed mutually reachable
    /// by a 32-bit displacement, not laid out at any fixed real address.
    fn absolute_offset(&self, arena: ArenaKind, offset: u32) -> u32 {
        match arena {
            ArenaKind::Main => offset,
            ArenaKind::Cold => self.main_budget + offset,
        }
    }

    fn arena_buffer_mut(&mut self, arena: ArenaKind) -> &mut CodeBuffer {
        match arena {
            ArenaKind::Main => &mut self.main,
            ArenaKind::Cold => &mut self.cold,
        }
    }

    /// Mutable access to both code arenas at once, for building an
    /// emitter whose tracelet may fall through from main into cold code.
    pub fn arenas_mut(&mut self) -> (&mut CodeBuffer, &mut CodeBuffer) {
        (&mut self.main, &mut self.cold)
    }

    fn patch_branch(&mut self, branch: IncomingBranch, target: NativeRange) {
        let target_abs = self.absolute_offset(target.arena, target.start);
        match branch.reloc {
            Reloc::X86PcRel4 => {
                let site_abs = self.absolute_offset(branch.arena, branch.site_offset);
                let rel = target_abs as i64 - (site_abs as i64 + 4);
                let rel = rel as i32 as u32;
                self.arena_buffer_mut(branch.arena)
                    .patch_at(branch.site_offset, 4, |c| c.put4(rel));
            }
            Reloc::Abs8 => {
                self.arena_buffer_mut(branch.arena)
                    .patch_at(branch.site_offset, 8, |c| c.put8(target_abs as u64));
            }
        }
    }

    /// Record `branch` as pointing at `key`'s translation, patching it
    /// immediately if one is already published. A later republish of
    /// `key` re-patches every site recorded this way (see
    /// [`CodeCache::publish_translation`]), so the caller never has to
    /// track the site itself again.
    pub fn chain_incoming_branch(
        &mut self,
        _lease: &parking_lot::MutexGuard<'_, ()>,
        key: SourceKey,
        branch: IncomingBranch,
    ) {
        if let Some(top) = self.by_key.get(&key).and_then(SrcRec::top) {
            self.patch_branch(branch, top.main_range);
        }
        let rec = self.by_key.entry(key).or_insert_with(|| SrcRec::new(key, self.translation_limit));
        rec.record_incoming_branch(branch);
    }

    /// Record a freshly-emitted translation's byte ranges and publish it
    /// as the new top translation for `key`. Caller must hold the write
    /// lease (enforced by requiring a lease guard, not by an internal
    /// re-lock).
    pub fn publish_translation(
        &mut self,
        _lease: &parking_lot::MutexGuard<'_, ()>,
        key: SourceKey,
        kind: TranslationKind,
        main_range: NativeRange,
        cold_range: Option<NativeRange>,
    ) -> JitResult<Arc<TranslationRec>> {
        let rec = self.by_key.entry(key).or_insert_with(|| SrcRec::new(key, self.translation_limit));
        if rec.at_translation_limit() {
            return Err(JitError::TranslationLimitReached {
                key,
                limit: rec.limit,
            });
        }
        let translation = Arc::new(TranslationRec {
            key,
            kind,
            main_range,
            cold_range,
            retired_at_epoch: None,
        });
        rec.publish(translation.clone());
        let incoming = rec.incoming_branches().to_vec();
        for branch in incoming {
            self.patch_branch(branch, main_range);
        }
        Ok(translation)
    }

    /// Mark every translation for `key` unreachable (e.g. on file
    /// invalidation) and hand them to the treadmill; their bytes are
    /// not actually freed until [`Treadmill::reclaim`] confirms no
    /// thread can still be executing inside them.
    pub fn retire_key(&mut self, _lease: &parking_lot::MutexGuard<'_, ()>, key: SourceKey) {
        if let Some(rec) = self.by_key.remove(&key) {
            for t in rec.translations {
                self.treadmill.retire(t);
            }
        }
    }

    pub fn main_bytes_remaining(&self) -> u32 {
        self.main_budget.saturating_sub(self.main.frontier())
    }

    pub fn cold_bytes_remaining(&self) -> u32 {
        self.cold_budget.saturating_sub(self.cold.frontier())
    }

    pub fn check_budget(&self, arena: &'static str, needed: u32, remaining: u32) -> JitResult<()> {
        if needed > remaining {
            return Err(JitError::CodeCacheFull {
                arena,
                remaining,
                needed,
            });
        }
        Ok(())
    }

    pub fn main_mut(&mut self) -> &mut CodeBuffer {
        &mut self.main
    }

    pub fn cold_mut(&mut self) -> &mut CodeBuffer {
        &mut self.cold
    }

    pub fn main(&self) -> &CodeBuffer {
        &self.main
    }

    pub fn cold(&self) -> &CodeBuffer {
        &self.cold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::key::FuncId;

    fn range(start: u32, end: u32) -> NativeRange {
        NativeRange {
            arena: ArenaKind::Main,
            start,
            end,
        }
    }

    #[test]
    fn publishing_a_translation_makes_it_the_top() {
        let mut cache = CodeCache::new(&JitConfig::default());
        let lease = cache.try_acquire_lease().unwrap();
        let key = SourceKey::entry(FuncId(1));
        let rec = cache
            .publish_translation(&lease, key, TranslationKind::Tracelet, range(0, 10), None)
            .unwrap();
        drop(lease);
        assert_eq!(cache.top_translation(key).unwrap().main_range, rec.main_range);
    }

    #[test]
    fn translation_limit_is_enforced_per_key() {
        let mut config = JitConfig::default();
        config.max_translations_per_key = 1;
        let mut cache = CodeCache::new(&config);
        let lease = cache.try_acquire_lease().unwrap();
        let key = SourceKey::entry(FuncId(2));
        cache
            .publish_translation(&lease, key, TranslationKind::Tracelet, range(0, 10), None)
            .unwrap();
        let err = cache
            .publish_translation(&lease, key, TranslationKind::Tracelet, range(10, 20), None)
            .unwrap_err();
        assert!(matches!(err, JitError::TranslationLimitReached { .. }));
    }

    #[test]
    fn retiring_a_key_clears_its_top_translation() {
        let mut cache = CodeCache::new(&JitConfig::default());
        let lease = cache.try_acquire_lease().unwrap();
        let key = SourceKey::entry(FuncId(3));
        cache
            .publish_translation(&lease, key, TranslationKind::Tracelet, range(0, 10), None)
            .unwrap();
        cache.retire_key(&lease, key);
        assert!(cache.top_translation(key).is_none());
        assert_eq!(cache.treadmill().retired.lock().len(), 1);
    }

    #[test]
    fn treadmill_only_reclaims_once_every_thread_has_crossed_the_epoch() {
        let mill = Treadmill::new();
        let slot_a = mill.register_thread();
        let slot_b = mill.register_thread();
        let rec = Arc::new(TranslationRec {
            key: SourceKey::entry(FuncId(4)),
            kind: TranslationKind::Tracelet,
            main_range: range(0, 1),
            cold_range: None,
            retired_at_epoch: None,
        });
        mill.cross_quiescent_point(slot_a);
        mill.retire(rec);
        assert_eq!(mill.reclaim(), 0);
        mill.cross_quiescent_point(slot_b);
        assert_eq!(mill.reclaim(), 1);
    }

    #[test]
    fn try_acquire_lease_fails_while_already_held() {
        let cache = CodeCache::new(&JitConfig::default());
        let _held = cache.try_acquire_lease().unwrap();
        assert!(cache.try_acquire_lease().is_none());
    }

    fn rel32_site(buf: &mut CodeBuffer) -> u32 {
        buf.prepare_for_smash(4);
        let at = buf.frontier();
        buf.put4(0);
        at
    }

    #[test]
    fn chaining_an_incoming_branch_patches_it_against_an_existing_translation() {
        let mut cache = CodeCache::new(&JitConfig::default());
        let lease = cache.try_acquire_lease().unwrap();
        let key = SourceKey::entry(FuncId(10));
        cache
            .publish_translation(&lease, key, TranslationKind::Tracelet, range(100, 110), None)
            .unwrap();

        let site = rel32_site(cache.main_mut());
        cache.chain_incoming_branch(
            &lease,
            key,
            IncomingBranch {
                arena: ArenaKind::Main,
                site_offset: site,
                reloc: Reloc::X86PcRel4,
            },
        );

        let rel = u32::from_le_bytes(cache.main().as_slice()[site as usize..site as usize + 4].try_into().unwrap());
        assert_eq!(rel as i32, 100 - (site as i32 + 4));
    }

    #[test]
    fn republishing_a_translation_repatches_every_recorded_incoming_branch() {
        let mut cache = CodeCache::new(&JitConfig::default());
        let lease = cache.try_acquire_lease().unwrap();
        let key = SourceKey::entry(FuncId(11));

        let site = rel32_site(cache.main_mut());
        cache.chain_incoming_branch(
            &lease,
            key,
            IncomingBranch {
                arena: ArenaKind::Main,
                site_offset: site,
                reloc: Reloc::X86PcRel4,
            },
        );

        cache
            .publish_translation(&lease, key, TranslationKind::Tracelet, range(200, 210), None)
            .unwrap();

        let rel = u32::from_le_bytes(cache.main().as_slice()[site as usize..site as usize + 4].try_into().unwrap());
        assert_eq!(rel as i32, 200 - (site as i32 + 4));
    }

    #[test]
    fn rechaining_the_same_site_does_not_accumulate_duplicate_incoming_entries() {
        let mut cache = CodeCache::new(&JitConfig::default());
        let lease = cache.try_acquire_lease().unwrap();
        let key = SourceKey::entry(FuncId(12));
        let site = rel32_site(cache.main_mut());
        let branch = IncomingBranch {
            arena: ArenaKind::Main,
            site_offset: site,
            reloc: Reloc::X86PcRel4,
        };

        cache.chain_incoming_branch(&lease, key, branch);
        cache.chain_incoming_branch(&lease, key, branch);
        cache.chain_incoming_branch(&lease, key, branch);

        assert_eq!(cache.by_key.get(&key).unwrap().incoming_branches().len(), 1);
    }
}
