//! Errors the embedder must react to.
//!
//! Guard violations, analysis failures, and interp fallbacks are not
//! errors -- they're control-flow outcomes modeled as plain enum return
//! values ([`crate::instr::TranslationPlan`], [`crate::service::ServiceRequest`]).
//! `JitError` only covers conditions where the translator itself cannot
//! make progress.

use crate::key::SourceKey;

#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("source key {0} has no registered bytecode")]
    InvalidSourceKey(SourceKey),

    #[error("source record for {key} hit its translation limit ({limit})")]
    TranslationLimitReached { key: SourceKey, limit: u32 },

    #[error("write lease unavailable for {key}; request should fall back to interpretation")]
    WriteLeaseUnavailable { key: SourceKey },

    #[error("code cache exhausted: {arena} arena has {remaining} bytes free, needed {needed}")]
    CodeCacheFull {
        arena: &'static str,
        remaining: u32,
        needed: u32,
    },

    #[error("stack overflow detected entering {0}")]
    StackOverflowDetected(SourceKey),

    #[error("malformed source unit: {0}")]
    MalformedSourceUnit(String),
}

pub type JitResult<T> = Result<T, JitError>;
