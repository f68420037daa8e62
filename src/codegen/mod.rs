//! Per-opcode code generation: the shared emission sequence every
//! instruction goes through, plus the opcode-specific routines it
//! dispatches to.

pub mod array;
pub mod calls;
pub mod generators;
pub mod globals;
pub mod guards;
pub mod method_dispatch;
pub mod opcodes;
pub mod refcount;
pub mod returns;

use smallvec::SmallVec;

use crate::abi;
use crate::asm::CodeBuffer;
use crate::fixup::{Fixup, FixupMap, UnwindRegEntry, UnwindRegMap};
use crate::instr::{NormalizedInstruction, TranslationPlan};
use crate::loc::Location;
use crate::regalloc::register_set::Gpr;
use crate::regalloc::{RegisterMap, SpillEmitter};
use crate::service::ServiceRequest;
use crate::tracelet::Tracelet;
use crate::types::RuntimeType;
use crate::unit::FuncShape;

/// Which arena a byte sequence should land in. Fast paths go to `Main`;
/// side exits, per-type release stubs, and prologue overflow/interception
/// handling go to `Cold`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arena {
    Main,
    Cold,
}

/// Bundles the mutable pieces code generation threads through one
/// tracelet: the two code arenas, the register allocator, and the two
/// exception-support maps. Implements [`SpillEmitter`] so
/// [`RegisterMap`] can ask it to move bytes without depending on any of
/// these types directly.
pub struct Emitter<'a> {
    pub main: &'a mut CodeBuffer,
    pub cold: &'a mut CodeBuffer,
    pub fixups: &'a mut FixupMap,
    pub unwind_regs: &'a mut UnwindRegMap,
    pub arena: Arena,
}

impl<'a> Emitter<'a> {
    pub fn new(main: &'a mut CodeBuffer, cold: &'a mut CodeBuffer, fixups: &'a mut FixupMap, unwind_regs: &'a mut UnwindRegMap) -> Self {
        Self {
            main,
            cold,
            fixups,
            unwind_regs,
            arena: Arena::Main,
        }
    }

    pub(crate) fn buf(&mut self) -> &mut CodeBuffer {
        match self.arena {
            Arena::Main => self.main,
            Arena::Cold => self.cold,
        }
    }

    /// Run `f` with the write arena switched to cold, restoring the
    /// previous arena on return.
    pub fn in_cold<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let prev = self.arena;
        self.arena = Arena::Cold;
        let r = f(self);
        self.arena = prev;
        r
    }

    pub(crate) fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
        0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8)
    }

    pub(crate) fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
        (md << 6) | ((reg & 7) << 3) | (rm & 7)
    }

    /// `mov reg, [rbp+disp32]`.
    pub(crate) fn mov_load(&mut self, reg: Gpr, disp: i32) {
        self.mov_load_base(reg, abi::FRAME_PTR, disp);
    }

    /// `mov [rbp+disp32], reg`.
    pub(crate) fn mov_store(&mut self, disp: i32, reg: Gpr) {
        self.mov_store_base(disp, abi::FRAME_PTR, reg);
    }

    /// `mov reg, [base+disp32]`, for loads off a base other than the
    /// frame pointer (the thread-local cache base, a pointer just
    /// loaded into a scratch register, ...).
    pub(crate) fn mov_load_base(&mut self, reg: Gpr, base: Gpr, disp: i32) {
        let (reg8, base8) = (reg as u8, base as u8);
        let rex = Self::rex(true, reg8 >= 8, false, base8 >= 8);
        let modrm = Self::modrm(0b10, reg8, base8);
        let buf = self.buf();
        buf.put1(rex);
        buf.put1(0x8B);
        buf.put1(modrm);
        buf.put4(disp as u32);
    }

    /// `mov [base+disp32], reg`.
    pub(crate) fn mov_store_base(&mut self, disp: i32, base: Gpr, reg: Gpr) {
        let (reg8, base8) = (reg as u8, base as u8);
        let rex = Self::rex(true, reg8 >= 8, false, base8 >= 8);
        let modrm = Self::modrm(0b10, reg8, base8);
        let buf = self.buf();
        buf.put1(rex);
        buf.put1(0x89);
        buf.put1(modrm);
        buf.put4(disp as u32);
    }

    /// `mov reg, imm32` (zero-extended into the full 64-bit register --
    /// sufficient for every literal this crate's closed opcode set
    /// produces: small ints, bools, interned string/double ids).
    pub(crate) fn mov_reg_imm32(&mut self, reg: Gpr, imm: u32) {
        let reg8 = reg as u8;
        let rex = Self::rex(false, false, false, reg8 >= 8);
        let buf = self.buf();
        if rex != 0x40 {
            buf.put1(rex);
        }
        buf.put1(0xB8 + (reg8 & 7));
        buf.put4(imm);
    }

    /// `mov dst, src` (register to register).
    pub(crate) fn mov_reg_reg(&mut self, dst: Gpr, src: Gpr) {
        let (dst, src) = (dst as u8, src as u8);
        let rex = Self::rex(true, src >= 8, false, dst >= 8);
        let modrm = Self::modrm(0b11, src, dst);
        let buf = self.buf();
        buf.put1(rex);
        buf.put1(0x89);
        buf.put1(modrm);
    }

    /// `mov [reg+disp32], imm32` (zero-extended into the 8-byte slot;
    /// used for the discriminator word, never the 8-byte data word).
    pub(crate) fn mov_mem_imm32(&mut self, base: Gpr, disp: i32, imm: u32) {
        let base = base as u8;
        let rex = Self::rex(true, false, false, base >= 8);
        let modrm = Self::modrm(0b10, 0, base);
        let buf = self.buf();
        buf.put1(rex);
        buf.put1(0xC7);
        buf.put1(modrm);
        buf.put4(disp as u32);
        buf.put4(imm);
    }

    /// `add/sub dword [reg+disp32], imm8` sign-extended, `op` selects
    /// `/0` (add) or `/5` (sub) via the reg field of the ModRM byte.
    pub(crate) fn add_mem_imm8(&mut self, base: Gpr, disp: i32, op: u8, imm: i8) {
        let base = base as u8;
        let rex = Self::rex(false, false, false, base >= 8);
        let modrm = Self::modrm(0b10, op, base);
        let buf = self.buf();
        if rex != 0x40 {
            buf.put1(rex);
        }
        buf.put1(0x83);
        buf.put1(modrm);
        buf.put4(disp as u32);
        buf.put1(imm as u8);
    }

    /// `cmp dword [reg+disp32], imm32`.
    pub(crate) fn cmp_mem_imm32(&mut self, base: Gpr, disp: i32, imm: u32) {
        let base = base as u8;
        let rex = Self::rex(false, false, false, base >= 8);
        let modrm = Self::modrm(0b10, 7, base);
        let buf = self.buf();
        if rex != 0x40 {
            buf.put1(rex);
        }
        buf.put1(0x81);
        buf.put1(modrm);
        buf.put4(disp as u32);
        buf.put4(imm);
    }

    /// `cmp dst, src` (register to register, 32-bit operand size -- wide
    /// enough for any discriminator or class-identity word this crate
    /// compares).
    pub(crate) fn cmp_reg_reg(&mut self, dst: Gpr, src: Gpr) {
        let (dst8, src8) = (dst as u8, src as u8);
        let rex = Self::rex(false, src8 >= 8, false, dst8 >= 8);
        let modrm = Self::modrm(0b11, src8, dst8);
        let buf = self.buf();
        if rex != 0x40 {
            buf.put1(rex);
        }
        buf.put1(0x39);
        buf.put1(modrm);
    }

    /// `cmp [base+disp32], src` -- compare a memory operand against a
    /// register, the mirror image of [`Emitter::cmp_reg_reg`] for sites
    /// that have the comparison value in a register but the subject
    /// still in memory.
    pub(crate) fn cmp_mem_reg(&mut self, base: Gpr, disp: i32, src: Gpr) {
        let (base8, src8) = (base as u8, src as u8);
        let rex = Self::rex(false, src8 >= 8, false, base8 >= 8);
        let modrm = Self::modrm(0b10, src8, base8);
        let buf = self.buf();
        if rex != 0x40 {
            buf.put1(rex);
        }
        buf.put1(0x39);
        buf.put1(modrm);
        buf.put4(disp as u32);
    }

    /// `setcc al_of(reg); movzx reg, al_of(reg)` -- materialize a
    /// condition code as a 0/1 value in the low byte of `reg`, then
    /// zero-extend it to fill the register, since every boolean this
    /// crate's cells hold is a full-width discriminated value, not a
    /// bare byte.
    pub(crate) fn setcc_zero_extend(&mut self, reg: Gpr, cc: u8) {
        let reg8 = reg as u8;
        let rex = Self::rex(false, false, false, reg8 >= 8);
        {
            let buf = self.buf();
            if rex != 0x40 {
                buf.put1(rex);
            }
            buf.put1(0x0F);
            buf.put1(cc);
            buf.put1(Self::modrm(0b11, 0, reg8));
        }
        let rex = Self::rex(true, reg8 >= 8, false, reg8 >= 8);
        let buf = self.buf();
        buf.put1(rex);
        buf.put1(0x0F);
        buf.put1(0xB6);
        buf.put1(Self::modrm(0b11, reg8, reg8));
    }

    /// `call reg` -- an indirect call through a register (e.g. one loaded
    /// from a trampoline slot).
    pub(crate) fn call_reg(&mut self, reg: Gpr) -> crate::asm::CodeOffset {
        let reg = reg as u8;
        let rex = Self::rex(false, false, false, reg >= 8);
        let modrm = Self::modrm(0b11, 2, reg);
        let buf = self.buf();
        if rex != 0x40 {
            buf.put1(rex);
        }
        buf.put1(0xFF);
        buf.put1(modrm);
        buf.frontier()
    }

    /// `call rel32` -- a direct call with a zeroed placeholder
    /// displacement, for the smashable call sites [`ServiceRequest::BindCall`]
    /// resolves. Reserved 5 bytes wide via [`crate::asm::CodeBuffer::prepare_for_smash`]
    /// so the patch this implies can never straddle two cache lines.
    ///
    /// [`ServiceRequest::BindCall`]: crate::service::ServiceRequest::BindCall
    pub(crate) fn call_rel32_placeholder(&mut self) -> crate::asm::CodeOffset {
        self.buf().prepare_for_smash(5);
        let buf = self.buf();
        buf.put1(0xE8);
        let at = buf.frontier();
        buf.put4(0);
        at
    }

    /// `jmp reg` -- an indirect jump (used to return through a saved
    /// return address, as opposed to [`Emitter::call_reg`] which pushes
    /// a fresh one).
    pub(crate) fn jmp_reg(&mut self, reg: Gpr) {
        let reg = reg as u8;
        let rex = Self::rex(false, false, false, reg >= 8);
        let modrm = Self::modrm(0b11, 4, reg);
        let buf = self.buf();
        if rex != 0x40 {
            buf.put1(rex);
        }
        buf.put1(0xFF);
        buf.put1(modrm);
    }

    /// `jcc rel32` with `cc` the condition-code nibble (`0x84` = je,
    /// `0x85` = jne, ...), leaving a zeroed placeholder displacement the
    /// caller patches once its target is known.
    pub(crate) fn jcc_rel32_placeholder(&mut self, cc: u8) -> crate::asm::CodeOffset {
        self.buf().prepare_for_smash(6);
        let buf = self.buf();
        buf.put1(0x0F);
        buf.put1(cc);
        let at = buf.frontier();
        buf.put4(0);
        at
    }

    /// Patch a `jcc`/`jmp rel32` placeholder (as returned by
    /// [`Emitter::jcc_rel32_placeholder`]) so it targets the current
    /// frontier of whichever arena is presently selected.
    pub(crate) fn patch_short_jump(&mut self, placeholder_end: crate::asm::CodeOffset) {
        let target = self.buf().frontier();
        let at = placeholder_end - 4;
        let rel = target as i64 - placeholder_end as i64;
        self.buf().patch_at(at, 4, |c| c.put4(rel as u32));
    }
}

impl<'a> SpillEmitter for Emitter<'a> {
    fn emit_fill(&mut self, reg: Gpr, loc: &Location, _ty: &RuntimeType) {
        if let Some(off) = abi::memory_offset(loc) {
            self.mov_load(reg, off);
        }
    }

    fn emit_spill(&mut self, reg: Gpr, loc: &Location, _ty: &RuntimeType) {
        if let Some(off) = abi::memory_offset(loc) {
            self.mov_store(off, reg);
        }
    }

    fn emit_reg_move(&mut self, dst: Gpr, src: Gpr) {
        if dst != src {
            self.mov_reg_reg(dst, src);
        }
    }
}

/// Walk a tracelet's instructions in order, running each through the
/// shared emission sequence. `shape` is the enclosing function's layout,
/// needed by instructions (the return sequence) whose emission depends
/// on more than just their own operands.
///
/// If the tracelet stopped short of a block-ending instruction (it ran
/// out of its length budget mid-block rather than reaching one), its
/// `fallthrough` key is the correct continuation and gets its own
/// bind-jump here -- every block-ending instruction already emits its
/// own request, so this only fires for the truncated case.
pub fn emit_tracelet(
    tracelet: &Tracelet,
    shape: &FuncShape,
    regs: &mut RegisterMap,
    emitter: &mut Emitter<'_>,
) -> Vec<ServiceRequest> {
    let mut pending_requests = Vec::new();
    for instr in &tracelet.instrs {
        if let Some(req) = emit_instr(instr, shape, regs, emitter) {
            pending_requests.push(req);
        }
    }
    if !tracelet.failed {
        let ends_in_block_end = tracelet.instrs.last().is_some_and(|i| i.opcode.ends_basic_block());
        if !ends_in_block_end {
            if let Some(fallthrough) = tracelet.fallthrough {
                regs.clean_all(emitter);
                pending_requests.push(ServiceRequest::BindJmp { target: fallthrough.offset });
            }
        }
    }
    pending_requests
}

/// The shared per-instruction emission sequence:
/// 1. emit guards for newly-introduced input requirements;
/// 2. if the plan is `Interp` (or a policy override demands it), sync
///    state and dispatch to the interpreter for this one bytecode;
/// 3. otherwise allocate input registers (unless the translator wants to
///    do that itself), dispatch to the opcode's translate routine, then
///    invalidate dead locations and emit a prediction guard if any;
/// 4. if this instruction ends the basic block and isn't self-
///    terminating, sync outputs and emit a bind-jump.
pub fn emit_instr(
    instr: &NormalizedInstruction,
    shape: &FuncShape,
    regs: &mut RegisterMap,
    emitter: &mut Emitter<'_>,
) -> Option<ServiceRequest> {
    guards::emit_input_guards(instr, regs, emitter);

    if instr.plan.requires_interp() {
        regs.clean_all(emitter);
        return Some(ServiceRequest::Interpret {
            offset: instr.bc_offset,
            count: 1,
        });
    }

    if !instr.hints.manually_alloc_inputs {
        for input in &instr.inputs {
            regs.alloc_input_reg(emitter, &input.loc, &input.ty, None);
        }
    }

    let result = opcodes::translate(instr, shape, regs, emitter);

    if instr.plan.requires_fixup() {
        if let Some(return_off) = result.fixup_return_offset {
            emitter.fixups.record(
                return_off,
                Fixup {
                    bc_offset: instr.bc_offset,
                    stack_depth: instr.inputs.len() as u32,
                },
            );
            let dirty: Vec<UnwindRegEntry> = result
                .dirty_callee_saved
                .into_iter()
                .map(|(reg, loc, ty)| UnwindRegEntry { reg, loc, ty })
                .collect();
            emitter.unwind_regs.record(return_off, dirty);
        }
    }

    if instr.hints.output_predicted {
        guards::emit_prediction_check(instr, regs, emitter);
    }

    if instr.opcode.ends_basic_block() && !instr.opcode.is_self_terminating() {
        regs.clean_all(emitter);
        return Some(ServiceRequest::BindJmp {
            target: instr.bc_offset + 1,
        });
    }

    result.service_request
}

/// What one opcode's translate routine reports back to the shared
/// sequence.
#[derive(Default)]
pub struct TranslateOutcome {
    /// Set when this instruction emitted a fixup-eligible call; the
    /// native offset of its return address.
    pub fixup_return_offset: Option<u32>,
    /// Callee-saved registers left dirty across that call. A call site
    /// rarely leaves more than a couple of callee-saved registers dirty,
    /// so this stays inline rather than heap-allocating for the common
    /// empty or near-empty case.
    pub dirty_callee_saved: SmallVec<[(Gpr, Location, RuntimeType); 4]>,
    /// A service request this opcode itself terminates the tracelet with
    /// (calls, returns); `None` for opcodes that just fall through.
    pub service_request: Option<ServiceRequest>,
}
