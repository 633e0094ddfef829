//! Error taxonomy for the consumer runtime.
//!
//! Only [`ActivationError`] and a provider failure during a drain pass are
//! session-fatal. [`CompileError`] leaves the session retryable,
//! [`StateError`] changes nothing, and decode failures quarantine a single
//! source and are reported through `DrainStats` instead of failing the call.

use thiserror::Error;

use crate::record::FieldKind;
use crate::session::SessionState;

/// The probe script was rejected. The session stays in Created and the
/// caller may retry with corrected text.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("probe specification is empty")]
    EmptySpec,
    #[error("clause {clause}: {reason}")]
    Syntax { clause: usize, reason: String },
    #[error("clause {clause}: no trace point matches \"{probe}\"")]
    UnknownProbe { clause: usize, probe: String },
    #[error("clause {clause}: \"{field}\" is not a field of {probe}")]
    UnresolvedField {
        clause: usize,
        field: String,
        probe: String,
    },
    #[error("clause {clause}: format has {conversions} conversions but {args} arguments")]
    FormatArity {
        clause: usize,
        conversions: usize,
        args: usize,
    },
    #[error("clause {clause}: conversion expects a {expected} but \"{field}\" is a {found}")]
    FormatKind {
        clause: usize,
        field: String,
        expected: FieldKind,
        found: FieldKind,
    },
    #[error("provider rejected the program: {cause}")]
    Provider { cause: anyhow::Error },
}

/// The provider refused to enable the compiled program. Terminal: the
/// session transitions to Failed.
#[derive(Error, Debug)]
#[error("couldn't enable tracing: {cause}")]
pub struct ActivationError {
    pub cause: anyhow::Error,
}

/// The operation is not valid in the session's current state. Nothing
/// changes; this is purely a caller-contract violation.
#[derive(Error, Debug)]
#[error("{op} is not valid in session state {state}")]
pub struct StateError {
    pub op: &'static str,
    pub state: SessionState,
}

/// Malformed bytes on one source's stream. Fatal for that source only: the
/// scheduler quarantines it and keeps draining the rest.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("record carries unknown program cookie {cookie:#x}")]
    UnknownClause { cookie: u64 },
    #[error("unknown field type tag {tag:#x}")]
    BadTag { tag: u8 },
    #[error("field \"{field}\": layout expects a {expected}, buffer carries a {found}")]
    KindMismatch {
        field: String,
        expected: FieldKind,
        found: FieldKind,
    },
    #[error("frame payload ends inside field \"{field}\"")]
    Truncated { field: String },
    #[error("frame for cookie {cookie:#x} carries {extra} bytes past its declared fields")]
    TrailingBytes { cookie: u64, extra: usize },
}

/// Top-level error returned by session operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Activation(#[from] ActivationError),
    #[error(transparent)]
    State(#[from] StateError),
    /// Unrecoverable provider failure; when raised from a drain pass the
    /// session has transitioned to Failed.
    #[error("provider failed during {op}: {cause}")]
    Provider {
        op: &'static str,
        cause: anyhow::Error,
    },
    /// The record handler returned an error. Scheduler state is intact and
    /// the next drain pass resumes after the record that was delivered.
    #[error("record handler failed on source {source_id}: {cause}")]
    Handler {
        source_id: u32,
        cause: anyhow::Error,
    },
    /// The aggregation walk handler returned an error.
    #[error("walk handler failed for aggregation \"{aggregation}\": {cause}")]
    WalkHandler {
        aggregation: String,
        cause: anyhow::Error,
    },
}
