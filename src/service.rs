//! Service requests: the vocabulary emitted code uses to hand control
//! back to the dispatcher.
//!
//! A service request is a service-id-plus-arguments record stored at a
//! known location in the cold arena. When reached, emitted code snapshots
//! the virtual-machine stack/frame pointers into the execution context,
//! then returns to the dispatch loop with the service-id in
//! [`crate::abi::SERVICE_ID`].

use crate::key::SourceKey;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceRequest {
    /// Leave the translator entirely.
    Exit,
    /// Resolve the callee and patch the smashable call-site at a
    /// function call.
    BindCall { call_site: u32 },
    /// Lazily resolve an unconditional jump to a bytecode offset within
    /// the current function, patch the site, and install the
    /// translation as a new incoming branch for that source record.
    BindJmp { target: u32 },
    /// Same as `BindJmp`, but reached via a prediction or guard failure
    /// rather than a literal jump bytecode.
    BindSideExit { target: u32 },
    /// Two-phase conditional branch binding: the first time the branch
    /// fires, both sides are resolved; later executions only patch the
    /// side that was reached.
    BindJmpccFirst { taken: u32, not_taken: u32 },
    BindJmpccSecond { target: u32 },
    /// File-inclusion site binding; records a file dependency so
    /// invalidation can unreach the translation.
    BindRequire { path_id: u32 },
    /// The top translation for a source key became unsuitable; produce a
    /// new one and re-enter.
    Retranslate { key: SourceKey },
    /// Interpret `count` bytecodes starting at `offset`.
    Interpret { offset: u32, count: u32 },
    /// The interpreter finished a function; decide where to resume in
    /// the caller.
    PostInterpRet,
    /// Raise a stack-overflow error at the given bytecode offset.
    StackOverflow { at: u32 },
    /// Re-enter the top translation for the current PC.
    Resume { key: SourceKey },
}

impl ServiceRequest {
    /// Whether handling this request requires holding the write lease
    /// (it may patch code or grow the cache) as opposed to being
    /// satisfiable by a read-only lookup.
    pub fn requires_write_lease(&self) -> bool {
        !matches!(
            self,
            Self::Exit | Self::Interpret { .. } | Self::PostInterpRet | Self::Resume { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_requests_need_the_write_lease() {
        assert!(ServiceRequest::BindJmp { target: 0 }.requires_write_lease());
        assert!(ServiceRequest::BindCall { call_site: 0 }.requires_write_lease());
    }

    #[test]
    fn interpret_and_resume_do_not_need_the_write_lease() {
        assert!(!ServiceRequest::Interpret { offset: 0, count: 1 }.requires_write_lease());
        assert!(!ServiceRequest::Resume {
            key: SourceKey::entry(crate::key::FuncId(0))
        }
        .requires_write_lease());
    }
}
