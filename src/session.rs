//! Consumer session: lifecycle state machine, buffer-drain scheduler, and
//! record dispatch.
//!
//! Everything runs on the single control thread that owns the session. A
//! `drain` call makes exactly one finite pass over the live sources in
//! ascending source-index order; the caller owns the polling cadence and
//! repeats the call for as long as it wants records. Cross-source ordering
//! within one pass is source-index order, not timestamp order.

use std::collections::HashMap;
use std::fmt;

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::compile::{self, CompiledProgram};
use crate::decode::{self, DecodeCursor};
use crate::errors::{ActivationError, CompileError, Error, StateError};
use crate::provider::{AggValue, ProgramHandle, Provider, SourceId};
use crate::record::{FieldValue, TraceRecord};

/// Session lifecycle states. Stopped and Failed are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Compiled,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Compiled => write!(f, "compiled"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Buffer sizing handed to the provider at activation. 4 MiB trace and
/// aggregation buffers are the de facto standard.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub buffer_bytes: u64,
    pub aggregation_buffer_bytes: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            buffer_bytes: 4 << 20,
            aggregation_buffer_bytes: 4 << 20,
        }
    }
}

// Per-source drain state. The scheduler only ever advances its own cursor;
// the engine keeps appending behind it, so reads need no locking.
struct BufferSource {
    id: SourceId,
    dropped: u64,
    cursor: DecodeCursor,
    corrupted: Option<String>,
}

/// What one drain pass did and the session-lifetime counters that go with
/// it. Drop counts are cumulative and never decrease.
#[derive(Clone, Debug, Default)]
pub struct DrainStats {
    /// Records dispatched during this pass.
    pub records: u64,
    /// Cumulative dropped-record count per source for the session lifetime.
    pub per_source_dropped: HashMap<SourceId, u64>,
    /// Sources quarantined after a decode failure, with the reason.
    pub quarantined: HashMap<SourceId, String>,
}

/// A consumer session owning at most one compiled program.
///
/// Not internally thread-safe: a multi-threaded host must serialize access
/// itself.
pub struct Session<P: Provider> {
    provider: P,
    config: SessionConfig,
    state: SessionState,
    program: Option<CompiledProgram>,
    handle: Option<ProgramHandle>,
    sources: Vec<BufferSource>,
    rng: StdRng,
}

impl<P: Provider> Session<P> {
    pub fn new(provider: P) -> Self {
        Self::with_config(provider, SessionConfig::default())
    }

    pub fn with_config(provider: P, config: SessionConfig) -> Self {
        Session {
            provider,
            config,
            state: SessionState::Created,
            program: None,
            handle: None,
            sources: Vec::new(),
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    pub fn program(&self) -> Option<&CompiledProgram> {
        self.program.as_ref()
    }

    /// Compile `text` and load it into the provider.
    ///
    /// Valid in Created only; one program per session. Failures leave the
    /// session in Created and the caller may retry with corrected text.
    pub fn compile(&mut self, text: &str) -> Result<(), Error> {
        if self.state != SessionState::Created {
            return Err(StateError {
                op: "compile",
                state: self.state,
            }
            .into());
        }
        let program = {
            let provider = &self.provider;
            compile::compile(
                text,
                |probe| provider.probe_fields(probe),
                &mut self.rng,
            )?
        };
        let handle = self
            .provider
            .load(program.clauses())
            .map_err(|cause| Error::Compile(CompileError::Provider { cause }))?;
        self.program = Some(program);
        self.handle = Some(handle);
        self.state = SessionState::Compiled;
        Ok(())
    }

    /// Enable the compiled program against live trace points.
    ///
    /// Valid in Compiled only. On provider refusal the session transitions
    /// to Failed and the engine handle is released on that path too.
    pub fn activate(&mut self) -> Result<(), Error> {
        if self.state != SessionState::Compiled {
            return Err(StateError {
                op: "activate",
                state: self.state,
            }
            .into());
        }
        let handle = self.handle.expect("Compiled state always holds a handle");
        if let Err(cause) = self.provider.configure(&self.config) {
            self.release();
            self.state = SessionState::Failed;
            return Err(ActivationError { cause }.into());
        }
        match self.provider.enable(handle) {
            Ok(ids) => {
                self.sources = ids
                    .into_iter()
                    .map(|id| BufferSource {
                        id,
                        dropped: 0,
                        cursor: DecodeCursor::default(),
                        corrupted: None,
                    })
                    .collect();
                // emission order within a drain pass is ascending source index
                self.sources.sort_by_key(|source| source.id);
                self.state = SessionState::Running;
                Ok(())
            }
            Err(cause) => {
                self.release();
                self.state = SessionState::Failed;
                Err(ActivationError { cause }.into())
            }
        }
    }

    /// One finite pass over every live source in ascending index order.
    ///
    /// Records from one source keep their arrival order; a partial trailing
    /// frame is carried to the next pass. Overflow is counted, not raised:
    /// the cumulative per-source totals come back in the stats. A decode
    /// failure quarantines that source only. A handler error propagates
    /// after the failing record's frame was consumed, so the next pass
    /// resumes exactly after it.
    pub fn drain<F>(&mut self, mut handler: F) -> Result<DrainStats, Error>
    where
        F: FnMut(&TraceRecord) -> anyhow::Result<()>,
    {
        if self.state != SessionState::Running {
            return Err(StateError {
                op: "drain",
                state: self.state,
            }
            .into());
        }
        let program = self
            .program
            .as_ref()
            .expect("Running state always holds a program");

        let mut stats = DrainStats::default();
        let mut fatal: Option<Error> = None;
        for source in self.sources.iter_mut() {
            if let Some(reason) = &source.corrupted {
                stats.quarantined.insert(source.id, reason.clone());
                stats.per_source_dropped.insert(source.id, source.dropped);
                continue;
            }
            let chunk = match self.provider.read_buffer(source.id) {
                Ok(chunk) => chunk,
                Err(cause) => {
                    fatal = Some(Error::Provider {
                        op: "read_buffer",
                        cause,
                    });
                    break;
                }
            };
            if chunk.dropped > 0 {
                warn!(
                    "source {} dropped {} records on buffer overflow",
                    source.id, chunk.dropped
                );
                source.dropped += chunk.dropped;
            }

            let mut buf = std::mem::take(&mut source.cursor.pending);
            buf.extend_from_slice(&chunk.bytes);
            let mut offset = 0;
            loop {
                match decode::next_record(program, &buf[offset..]) {
                    Ok(Some((record, used))) => {
                        offset += used;
                        stats.records += 1;
                        if let Err(cause) = handler(&record) {
                            source.cursor.pending = buf[offset..].to_vec();
                            return Err(Error::Handler {
                                source_id: source.id,
                                cause,
                            });
                        }
                    }
                    Ok(None) => {
                        source.cursor.pending = buf[offset..].to_vec();
                        break;
                    }
                    Err(err) => {
                        warn!("source {} stream corrupted: {}", source.id, err);
                        source.corrupted = Some(err.to_string());
                        stats.quarantined.insert(source.id, err.to_string());
                        break;
                    }
                }
            }
            stats.per_source_dropped.insert(source.id, source.dropped);
        }

        if let Some(err) = fatal {
            self.release();
            self.state = SessionState::Failed;
            return Err(err);
        }
        debug!("drain pass dispatched {} records", stats.records);
        Ok(stats)
    }

    /// Snapshot `aggregation` and invoke `handler` once per key entry, in
    /// provider key order. Independent of the drain loop; valid while
    /// Running.
    pub fn walk<F>(&mut self, aggregation: &str, mut handler: F) -> Result<(), Error>
    where
        F: FnMut(&[FieldValue], &AggValue) -> anyhow::Result<()>,
    {
        if self.state != SessionState::Running {
            return Err(StateError {
                op: "walk",
                state: self.state,
            }
            .into());
        }
        let entries = self
            .provider
            .aggregation_snapshot(aggregation)
            .map_err(|cause| Error::Provider {
                op: "aggregation_snapshot",
                cause,
            })?;
        for entry in &entries {
            handler(&entry.keys, &entry.value).map_err(|cause| Error::WalkHandler {
                aggregation: aggregation.to_string(),
                cause,
            })?;
        }
        Ok(())
    }

    /// Reset all provider-side aggregation accumulations.
    pub fn clear_aggregations(&mut self) -> Result<(), Error> {
        if self.state != SessionState::Running {
            return Err(StateError {
                op: "clear_aggregations",
                state: self.state,
            }
            .into());
        }
        self.provider
            .aggregation_clear()
            .map_err(|cause| Error::Provider {
                op: "aggregation_clear",
                cause,
            })
    }

    /// Deactivate and release everything the session holds.
    ///
    /// Valid from Running or Compiled; from any other state it is a no-op,
    /// so calling it twice (or after a failed drain) never raises.
    pub fn stop(&mut self) {
        match self.state {
            SessionState::Running | SessionState::Compiled => {
                self.release();
                self.state = SessionState::Stopped;
            }
            SessionState::Created | SessionState::Stopped | SessionState::Failed => {}
        }
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.provider.disable(handle);
        }
        self.program = None;
        self.sources.clear();
    }
}

impl<P: Provider> Drop for Session<P> {
    fn drop(&mut self) {
        // scoped acquisition: the engine handle never outlives the session
        self.release();
    }
}
