//! Translation-cache dump format, for offline inspection by the
//! `tjdump` binary: two binary blobs (main and cold arena bytes) plus a
//! text trampoline index and, unless `jit-no-gdb` suppressed it, a
//! per-translation and per-instruction debug-info section.
//!
//! The on-disk layout is hand-rolled little-endian, matching the byte-
//! level style [`crate::asm::CodeBuffer`] already uses rather than
//! pulling in a general serialization format for one write-once,
//! read-once record.

use std::io::{self, Read, Write};

use crate::cache::{ArenaKind, CodeCache, NativeRange};
use crate::key::{BcOffset, FuncId, SourceKey};

const MAGIC: &[u8; 4] = b"TJDC";
const VERSION: u32 = 1;

/// One emitted translation's identity for debug purposes: which source
/// key it serves, its native range, and whether it's a prologue (as
/// opposed to a tracelet body). Serializable behind `enable-serde` for
/// tooling that wants these records as JSON rather than through
/// [`CacheDump::write_to`]'s binary format.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TranslationDebugRecord {
    pub key: SourceKey,
    pub main_range: NativeRange,
    pub cold_range: Option<NativeRange>,
    pub is_prologue: bool,
}

/// One bytecode instruction's native-offset mapping, for stepping
/// through a disassembly alongside the source it came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstrDebugRecord {
    pub native_offset: u32,
    pub bc_offset: BcOffset,
    pub arena: ArenaKind,
}

/// Accumulates debug records as translations are emitted. Dropped
/// entirely (never populated) when `jit-no-gdb` is set.
#[derive(Default)]
pub struct DebugInfo {
    pub translations: Vec<TranslationDebugRecord>,
    pub instrs: Vec<InstrDebugRecord>,
}

impl DebugInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_translation(&mut self, key: SourceKey, main_range: NativeRange, cold_range: Option<NativeRange>, is_prologue: bool) {
        self.translations.push(TranslationDebugRecord {
            key,
            main_range,
            cold_range,
            is_prologue,
        });
    }

    pub fn record_instr(&mut self, native_offset: u32, bc_offset: BcOffset, arena: ArenaKind) {
        self.instrs.push(InstrDebugRecord {
            native_offset,
            bc_offset,
            arena,
        });
    }
}

/// One trampoline's text-index entry: its offset within the trampoline
/// arena, the far helper address it jumps to, and the helper's
/// (already-demangled, since this crate never sees mangled symbols)
/// name.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrampolineEntry {
    pub offset: u32,
    pub helper_addr: u64,
    pub name: String,
}

/// The full dump: main/cold arena bytes, the trampoline text index, and
/// optional debug info.
pub struct CacheDump {
    pub main_bytes: Vec<u8>,
    pub cold_bytes: Vec<u8>,
    pub trampolines: Vec<TrampolineEntry>,
    pub debug_info: Option<DebugInfo>,
}

impl CacheDump {
    /// Snapshot `cache`'s current contents. `debug_info` is `None` when
    /// `jit-no-gdb` was set at emission time.
    pub fn capture(cache: &CodeCache, debug_info: Option<DebugInfo>) -> Self {
        Self {
            main_bytes: cache.main().as_slice().to_vec(),
            cold_bytes: cache.cold().as_slice().to_vec(),
            trampolines: Vec::new(),
            debug_info,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(MAGIC)?;
        write_u32(w, VERSION)?;

        write_u32(w, self.main_bytes.len() as u32)?;
        w.write_all(&self.main_bytes)?;
        write_u32(w, self.cold_bytes.len() as u32)?;
        w.write_all(&self.cold_bytes)?;

        write_u32(w, self.trampolines.len() as u32)?;
        for t in &self.trampolines {
            write_u32(w, t.offset)?;
            write_u64(w, t.helper_addr)?;
            write_string(w, &t.name)?;
        }

        match &self.debug_info {
            None => w.write_all(&[0])?,
            Some(info) => {
                w.write_all(&[1])?;
                write_u32(w, info.translations.len() as u32)?;
                for t in &info.translations {
                    write_u32(w, t.key.func.0)?;
                    write_u32(w, t.key.offset)?;
                    write_range(w, &t.main_range)?;
                    match &t.cold_range {
                        None => w.write_all(&[0])?,
                        Some(r) => {
                            w.write_all(&[1])?;
                            write_range(w, r)?;
                        }
                    }
                    w.write_all(&[t.is_prologue as u8])?;
                }
                write_u32(w, info.instrs.len() as u32)?;
                for i in &info.instrs {
                    write_u32(w, i.native_offset)?;
                    write_u32(w, i.bc_offset)?;
                    w.write_all(&[arena_tag(i.arena)])?;
                }
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not a translation-cache dump"));
        }
        let version = read_u32(r)?;
        if version != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported dump version {version}"),
            ));
        }

        let main_len = read_u32(r)? as usize;
        let mut main_bytes = vec![0u8; main_len];
        r.read_exact(&mut main_bytes)?;
        let cold_len = read_u32(r)? as usize;
        let mut cold_bytes = vec![0u8; cold_len];
        r.read_exact(&mut cold_bytes)?;

        let trampoline_count = read_u32(r)?;
        let mut trampolines = Vec::with_capacity(trampoline_count as usize);
        for _ in 0..trampoline_count {
            let offset = read_u32(r)?;
            let helper_addr = read_u64(r)?;
            let name = read_string(r)?;
            trampolines.push(TrampolineEntry { offset, helper_addr, name });
        }

        let mut has_debug = [0u8; 1];
        r.read_exact(&mut has_debug)?;
        let debug_info = if has_debug[0] == 0 {
            None
        } else {
            let mut info = DebugInfo::new();
            let translation_count = read_u32(r)?;
            for _ in 0..translation_count {
                let func = FuncId(read_u32(r)?);
                let offset = read_u32(r)?;
                let main_range = read_range(r)?;
                let mut has_cold = [0u8; 1];
                r.read_exact(&mut has_cold)?;
                let cold_range = if has_cold[0] == 0 { None } else { Some(read_range(r)?) };
                let mut prologue = [0u8; 1];
                r.read_exact(&mut prologue)?;
                info.translations.push(TranslationDebugRecord {
                    key: SourceKey::new(func, offset),
                    main_range,
                    cold_range,
                    is_prologue: prologue[0] != 0,
                });
            }
            let instr_count = read_u32(r)?;
            for _ in 0..instr_count {
                let native_offset = read_u32(r)?;
                let bc_offset = read_u32(r)?;
                let mut tag = [0u8; 1];
                r.read_exact(&mut tag)?;
                info.instrs.push(InstrDebugRecord {
                    native_offset,
                    bc_offset,
                    arena: arena_from_tag(tag[0]),
                });
            }
            Some(info)
        };

        Ok(Self {
            main_bytes,
            cold_bytes,
            trampolines,
            debug_info,
        })
    }
}

fn arena_tag(arena: ArenaKind) -> u8 {
    match arena {
        ArenaKind::Main => 0,
        ArenaKind::Cold => 1,
    }
}

fn arena_from_tag(tag: u8) -> ArenaKind {
    if tag == 0 {
        ArenaKind::Main
    } else {
        ArenaKind::Cold
    }
}

fn write_range<W: Write>(w: &mut W, range: &NativeRange) -> io::Result<()> {
    w.write_all(&[arena_tag(range.arena)])?;
    write_u32(w, range.start)?;
    write_u32(w, range.end)
}

fn read_range<R: Read>(r: &mut R) -> io::Result<NativeRange> {
    let mut tag = [0u8; 1];
    r.read_exact(&mut tag)?;
    let start = read_u32(r)?;
    let end = read_u32(r)?;
    Ok(NativeRange {
        arena: arena_from_tag(tag[0]),
        start,
        end,
    })
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// A human-readable rendering of one dump, in the shape `tjdump` prints:
/// one line per translation, then (if present) one line per instruction
/// debug record nested under it.
pub fn render(dump: &CacheDump) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "main: {} bytes, cold: {} bytes, {} trampolines\n",
        dump.main_bytes.len(),
        dump.cold_bytes.len(),
        dump.trampolines.len()
    ));
    for t in &dump.trampolines {
        out.push_str(&format!("  trampoline @{:#x} -> {:#x} {}\n", t.offset, t.helper_addr, t.name));
    }
    match &dump.debug_info {
        None => out.push_str("(no debug info: dumped with jit-no-gdb)\n"),
        Some(info) => {
            for t in &info.translations {
                out.push_str(&format!(
                    "{} [{}] main={:#x}..{:#x}{}\n",
                    t.key,
                    if t.is_prologue { "prologue" } else { "tracelet" },
                    t.main_range.start,
                    t.main_range.end,
                    match &t.cold_range {
                        Some(r) => format!(" cold={:#x}..{:#x}", r.start, r.end),
                        None => String::new(),
                    }
                ));
            }
            for i in &info.instrs {
                out.push_str(&format!(
                    "  {:#x} -> bc+{:#x} ({})\n",
                    i.native_offset,
                    i.bc_offset,
                    match i.arena {
                        ArenaKind::Main => "main",
                        ArenaKind::Cold => "cold",
                    }
                ));
            }
        }
    }
    out
}
