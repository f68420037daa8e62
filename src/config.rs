//! Environment-driven configuration, loaded once and read without locking
//! thereafter.

use once_cell::sync::OnceCell;
use std::env;

/// The toggles this crate recognizes, plus the sizing knobs that bound
/// code growth and tracelet length. `from_env()` reads `JIT_*` variables;
/// anything unset falls back to [`JitConfig::default`].
#[derive(Debug, Clone, PartialEq)]
pub struct JitConfig {
    /// If false, every request interprets; no translation is ever emitted.
    pub enable_jit: bool,
    /// Adds a per-translation execution counter for coverage.
    pub jit_transcounters: bool,
    /// Skip debug-info emission.
    pub jit_no_gdb: bool,
    /// Enable prologue interception on functions that allow renaming.
    pub jit_enable_rename_function: bool,
    /// Enable prologue interception on functions marked dynamically
    /// invokable.
    pub attr_dynamic_invoke: bool,
    /// Route helper calls through the trampoline arena rather than
    /// assuming every helper is 32-bit-displacement reachable.
    pub jit_trampolines: bool,
    /// Emit a cmov rather than a branch when dereferencing a possibly-
    /// boxed value.
    pub jit_cmov_var_deref: bool,
    /// Fail hard (vs. warn) on a return-type-hint violation.
    pub eval_check_return_type_hints: bool,
    /// Fail hard (vs. warn) on a property-type-hint violation.
    pub check_prop_type_hints: bool,
    /// Bytes reserved for the main code arena.
    pub main_arena_bytes: u32,
    /// Bytes reserved for the cold/stub arena.
    pub cold_arena_bytes: u32,
    /// Bytes reserved for the trampoline arena.
    pub trampoline_arena_bytes: u32,
    /// Maximum number of translations kept live per source key before
    /// further requests are routed to a pure-interpret service request.
    pub max_translations_per_key: u32,
    /// Hard cap on the number of `NormalizedInstruction`s a single
    /// tracelet may accumulate before analysis stops.
    pub max_tracelet_len: u32,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enable_jit: true,
            jit_transcounters: false,
            jit_no_gdb: false,
            jit_enable_rename_function: false,
            attr_dynamic_invoke: false,
            jit_trampolines: true,
            jit_cmov_var_deref: false,
            eval_check_return_type_hints: false,
            check_prop_type_hints: false,
            main_arena_bytes: 64 * 1024 * 1024,
            cold_arena_bytes: 16 * 1024 * 1024,
            trampoline_arena_bytes: 1024 * 1024,
            max_translations_per_key: 32,
            max_tracelet_len: 512,
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "on" | "yes"),
        Err(_) => default,
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl JitConfig {
    /// Read `JIT_*` environment variables, falling back to
    /// [`JitConfig::default`] for anything unset or unparseable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            enable_jit: env_bool("JIT_ENABLE_JIT", d.enable_jit),
            jit_transcounters: env_bool("JIT_TRANSCOUNTERS", d.jit_transcounters),
            jit_no_gdb: env_bool("JIT_NO_GDB", d.jit_no_gdb),
            jit_enable_rename_function: env_bool(
                "JIT_ENABLE_RENAME_FUNCTION",
                d.jit_enable_rename_function,
            ),
            attr_dynamic_invoke: env_bool("JIT_ATTR_DYNAMIC_INVOKE", d.attr_dynamic_invoke),
            jit_trampolines: env_bool("JIT_TRAMPOLINES", d.jit_trampolines),
            jit_cmov_var_deref: env_bool("JIT_CMOV_VAR_DEREF", d.jit_cmov_var_deref),
            eval_check_return_type_hints: env_bool(
                "JIT_EVAL_CHECK_RETURN_TYPE_HINTS",
                d.eval_check_return_type_hints,
            ),
            check_prop_type_hints: env_bool(
                "JIT_CHECK_PROP_TYPE_HINTS",
                d.check_prop_type_hints,
            ),
            main_arena_bytes: env_u32("JIT_MAIN_ARENA_BYTES", d.main_arena_bytes),
            cold_arena_bytes: env_u32("JIT_COLD_ARENA_BYTES", d.cold_arena_bytes),
            trampoline_arena_bytes: env_u32(
                "JIT_TRAMPOLINE_ARENA_BYTES",
                d.trampoline_arena_bytes,
            ),
            max_translations_per_key: env_u32(
                "JIT_MAX_TRANSLATIONS_PER_KEY",
                d.max_translations_per_key,
            ),
            max_tracelet_len: env_u32("JIT_MAX_TRACELET_LEN", d.max_tracelet_len),
        }
    }
}

static GLOBAL: OnceCell<JitConfig> = OnceCell::new();

/// The process-wide config, initialized from the environment on first
/// access and never reloaded.
pub fn global() -> &'static JitConfig {
    GLOBAL.get_or_init(JitConfig::from_env)
}

/// Install an explicit config (tests, embedders that don't want
/// environment-variable sniffing). Must be called before [`global`] is
/// first read; returns the config that actually ended up installed.
pub fn set_global(config: JitConfig) -> &'static JitConfig {
    GLOBAL.get_or_init(|| config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_enables_jit_and_trampolines() {
        let c = JitConfig::default();
        assert!(c.enable_jit);
        assert!(c.jit_trampolines);
        assert!(!c.jit_no_gdb);
    }

    #[test]
    fn env_bool_accepts_common_truthy_spellings() {
        assert!(env_bool("JIT_CONFIG_TEST_NONEXISTENT_VAR_XYZ", false) == false);
    }
}
