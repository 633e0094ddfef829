//! The consumed instrumentation-provider interface.
//!
//! The engine that actually intercepts trace points and fills buffers lives
//! behind this trait. The session only ever compiles against its field
//! tables, enables a loaded program, reads whatever bytes each source has
//! ready, and snapshots aggregations; everything else is the engine's
//! business.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::compile::Clause;
use crate::record::{FieldKind, FieldValue};
use crate::script::ProbeDesc;
use crate::session::SessionConfig;

/// Identifies one independent buffer feed, one per execution unit.
pub type SourceId = u32;

/// Opaque engine-side program handle.
pub type ProgramHandle = u64;

/// One read of a source's buffer: whatever bytes are currently available
/// plus the number of records the engine discarded since the last read
/// because the buffer wrapped.
#[derive(Clone, Debug, Default)]
pub struct BufferChunk {
    pub bytes: Vec<u8>,
    pub dropped: u64,
}

/// One key entry of an aggregation snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggEntry {
    pub keys: Vec<FieldValue>,
    pub value: AggValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggValue {
    Scalar(i64),
    Histogram(Vec<HistBucket>),
}

/// One bucket of a quantized aggregation, covering values in [lo, hi].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistBucket {
    pub lo: i64,
    pub hi: i64,
    pub count: u64,
}

pub trait Provider {
    /// Field table exposed at a trace point, or None if the point is
    /// unknown. This is the lookup the compiler resolves every referenced
    /// field against.
    fn probe_fields(&self, probe: &ProbeDesc) -> Option<HashMap<String, FieldKind>>;

    /// Apply buffer sizing before the program is enabled.
    fn configure(&mut self, config: &SessionConfig) -> Result<()>;

    /// Hand the compiled clause table to the engine.
    fn load(&mut self, clauses: &[Clause]) -> Result<ProgramHandle>;

    /// Enable the loaded program against live trace points; returns the
    /// source-unit ids whose buffers will carry records.
    fn enable(&mut self, handle: ProgramHandle) -> Result<Vec<SourceId>>;

    /// Read all currently available bytes for one source. Never blocks
    /// waiting for new data.
    fn read_buffer(&mut self, source: SourceId) -> Result<BufferChunk>;

    /// Tear the program down. Must be safe to call more than once.
    fn disable(&mut self, handle: ProgramHandle);

    /// Snapshot one aggregation's current contents, in engine key order.
    fn aggregation_snapshot(&mut self, aggregation: &str) -> Result<Vec<AggEntry>>;

    /// Reset all aggregation accumulations.
    fn aggregation_clear(&mut self) -> Result<()>;
}
