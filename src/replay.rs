//! A deterministic in-memory provider that replays a scripted scenario.
//!
//! Stands in for a live instrumentation engine when exercising the consumer
//! loop: it serves probe field tables, encodes scenario events into the same
//! wire frames an engine would write, meters them out per source and cycle,
//! and answers aggregation snapshots from canned data. Tests drive it
//! programmatically; the CLI loads a JSON scenario.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;

use crate::compile::Clause;
use crate::decode;
use crate::provider::{AggEntry, BufferChunk, ProgramHandle, Provider, SourceId};
use crate::record::{FieldKind, FieldValue};
use crate::script::ProbeDesc;
use crate::session::SessionConfig;

// The JSON scenario format is
// {
//   "probes": [
//     {
//       "probe": "ip:::send",
//       "fields": { "pid": "integer", "execname": "string" }
//     }
//   ],
//   "sources": 2,
//   "events": [
//     {
//       "source": 0,
//       "probe": "ip:::send",
//       "ts": 1000,
//       "values": [ { "string": "bash" }, { "integer": 123 } ],
//       "cycle": 0
//     }
//   ],
//   "drops": [ { "source": 1, "count": 3, "cycle": 0 } ],
//   "aggregations": {
//     "bytes": [ { "keys": [ { "string": "bash" } ], "value": { "scalar": 10 } } ]
//   }
// }
//
// An event's "cycle" defers it until that many reads have happened on its
// source; "clause" pins it to a clause index when several clauses share a
// probe description.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayScenario {
    probes: Vec<ReplayProbe>,
    sources: u32,
    #[serde(default)]
    events: Vec<ReplayEvent>,
    #[serde(default)]
    drops: Vec<ReplayDrop>,
    #[serde(default)]
    aggregations: HashMap<String, Vec<AggEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReplayProbe {
    probe: String,
    fields: HashMap<String, FieldKind>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReplayEvent {
    source: SourceId,
    probe: String,
    ts: u64,
    values: Vec<FieldValue>,
    #[serde(default)]
    cycle: u64,
    #[serde(default)]
    clause: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReplayDrop {
    source: SourceId,
    count: u64,
    #[serde(default)]
    cycle: u64,
}

struct QueuedEvent {
    source: SourceId,
    cookie: u64,
    ts: u64,
    values: Vec<FieldValue>,
    cycle: u64,
}

struct QueuedDrop {
    source: SourceId,
    count: u64,
    cycle: u64,
}

#[derive(Default)]
struct SourceState {
    buf: Vec<u8>,
    dropped: u64,
    reads: u64,
}

#[derive(Default)]
pub struct ReplayProvider {
    fields: HashMap<String, HashMap<String, FieldKind>>,
    source_count: u32,
    scenario_events: Vec<ReplayEvent>,
    scenario_drops: Vec<ReplayDrop>,
    aggregations: HashMap<String, Vec<AggEntry>>,
    clauses: Vec<(u64, String)>,
    next_handle: ProgramHandle,
    loaded: Option<ProgramHandle>,
    enabled: bool,
    states: HashMap<SourceId, SourceState>,
    queued_events: Vec<QueuedEvent>,
    queued_drops: Vec<QueuedDrop>,
    read_limit: HashMap<SourceId, usize>,
    config: Option<SessionConfig>,
    refuse_enable: bool,
    fail_reads: bool,
}

impl ReplayProvider {
    pub fn new(sources: u32) -> Self {
        ReplayProvider {
            source_count: sources,
            ..ReplayProvider::default()
        }
    }

    pub fn from_scenario(scenario: ReplayScenario) -> Result<Self> {
        let mut provider = ReplayProvider::new(scenario.sources);
        for probe in &scenario.probes {
            let desc = ProbeDesc::parse(&probe.probe)?;
            provider.fields.insert(desc.to_string(), probe.fields.clone());
        }
        provider.scenario_events = scenario.events;
        provider.scenario_drops = scenario.drops;
        provider.aggregations = scenario.aggregations;
        Ok(provider)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_scenario(serde_json::from_str(text)?)
    }

    /// Register a trace point and the fields it exposes.
    pub fn add_probe(&mut self, probe: &str, fields: &[(&str, FieldKind)]) -> Result<()> {
        let desc = ProbeDesc::parse(probe)?;
        self.fields.insert(
            desc.to_string(),
            fields
                .iter()
                .map(|(name, kind)| (name.to_string(), *kind))
                .collect(),
        );
        Ok(())
    }

    /// Make `probe` fire once on `source`, immediately visible to the next
    /// read. Requires a loaded program so the frame can carry its cookie.
    pub fn push_event(
        &mut self,
        source: SourceId,
        probe: &str,
        ts: u64,
        values: &[FieldValue],
    ) -> Result<()> {
        let cookie = self
            .resolve_clause(probe, None)
            .ok_or_else(|| anyhow!("no loaded clause matches probe \"{probe}\""))?;
        let state = self
            .states
            .get_mut(&source)
            .ok_or_else(|| anyhow!("unknown source {source}"))?;
        state
            .buf
            .extend_from_slice(&decode::encode_record(cookie, ts, source, values));
        Ok(())
    }

    /// Append raw bytes to a source's buffer, bypassing frame encoding.
    pub fn push_raw(&mut self, source: SourceId, bytes: &[u8]) -> Result<()> {
        let state = self
            .states
            .get_mut(&source)
            .ok_or_else(|| anyhow!("unknown source {source}"))?;
        state.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Report `count` overflow-dropped records on the next read of `source`.
    pub fn push_drop(&mut self, source: SourceId, count: u64) -> Result<()> {
        let state = self
            .states
            .get_mut(&source)
            .ok_or_else(|| anyhow!("unknown source {source}"))?;
        state.dropped += count;
        Ok(())
    }

    /// Cap how many bytes one read of `source` returns; the remainder stays
    /// buffered. Lets tests split frames across drain cycles.
    pub fn set_read_limit(&mut self, source: SourceId, limit: usize) {
        self.read_limit.insert(source, limit);
    }

    pub fn set_aggregation(&mut self, name: &str, entries: Vec<AggEntry>) {
        self.aggregations.insert(name.to_string(), entries);
    }

    /// Refuse the next enable() call, as an engine without privileges or
    /// with the probes already claimed would.
    pub fn refuse_enable(&mut self, refuse: bool) {
        self.refuse_enable = refuse;
    }

    /// Fail every subsequent read_buffer() call.
    pub fn fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    /// True once every queued event, drop, and buffered byte has been
    /// served.
    pub fn exhausted(&self) -> bool {
        self.queued_events.is_empty()
            && self.queued_drops.is_empty()
            && self.states.values().all(|state| state.buf.is_empty())
    }

    pub fn last_config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    fn resolve_clause(&self, probe: &str, clause: Option<usize>) -> Option<u64> {
        match clause {
            Some(index) => self.clauses.get(index).map(|(cookie, _)| *cookie),
            None => self
                .clauses
                .iter()
                .find(|(_, text)| text.as_str() == probe)
                .map(|(cookie, _)| *cookie),
        }
    }

    // Move deferred scenario items whose cycle has come onto the source's
    // live buffer.
    fn promote(&mut self, source: SourceId, reads: u64) {
        let mut events = std::mem::take(&mut self.queued_events);
        events.retain(|event| {
            if event.source == source && event.cycle <= reads {
                let bytes =
                    decode::encode_record(event.cookie, event.ts, event.source, &event.values);
                if let Some(state) = self.states.get_mut(&source) {
                    state.buf.extend_from_slice(&bytes);
                }
                false
            } else {
                true
            }
        });
        self.queued_events = events;

        let mut drops = std::mem::take(&mut self.queued_drops);
        drops.retain(|drop| {
            if drop.source == source && drop.cycle <= reads {
                if let Some(state) = self.states.get_mut(&source) {
                    state.dropped += drop.count;
                }
                false
            } else {
                true
            }
        });
        self.queued_drops = drops;
    }
}

impl Provider for ReplayProvider {
    fn probe_fields(&self, probe: &ProbeDesc) -> Option<HashMap<String, FieldKind>> {
        self.fields.get(&probe.to_string()).cloned()
    }

    fn configure(&mut self, config: &SessionConfig) -> Result<()> {
        self.config = Some(config.clone());
        Ok(())
    }

    fn load(&mut self, clauses: &[Clause]) -> Result<ProgramHandle> {
        self.next_handle += 1;
        self.clauses = clauses
            .iter()
            .map(|clause| (clause.cookie, clause.probe.to_string()))
            .collect();
        self.loaded = Some(self.next_handle);
        Ok(self.next_handle)
    }

    fn enable(&mut self, handle: ProgramHandle) -> Result<Vec<SourceId>> {
        if self.refuse_enable {
            bail!("probes are already enabled by another consumer");
        }
        if self.loaded != Some(handle) {
            bail!("unknown program handle {handle}");
        }
        self.states = (0..self.source_count)
            .map(|id| (id, SourceState::default()))
            .collect();

        // the clause table is known now, so scenario events can be resolved
        let events = std::mem::take(&mut self.scenario_events);
        for event in events {
            if event.source >= self.source_count {
                bail!(
                    "scenario event targets source {} but only {} sources exist",
                    event.source,
                    self.source_count
                );
            }
            let cookie = self
                .resolve_clause(&event.probe, event.clause)
                .ok_or_else(|| anyhow!("scenario event names unmatched probe \"{}\"", event.probe))?;
            self.queued_events.push(QueuedEvent {
                source: event.source,
                cookie,
                ts: event.ts,
                values: event.values,
                cycle: event.cycle,
            });
        }
        let drops = std::mem::take(&mut self.scenario_drops);
        for drop in drops {
            if drop.source >= self.source_count {
                bail!(
                    "scenario drop targets source {} but only {} sources exist",
                    drop.source,
                    self.source_count
                );
            }
            self.queued_drops.push(QueuedDrop {
                source: drop.source,
                count: drop.count,
                cycle: drop.cycle,
            });
        }

        self.enabled = true;
        Ok((0..self.source_count).collect())
    }

    fn read_buffer(&mut self, source: SourceId) -> Result<BufferChunk> {
        if self.fail_reads {
            bail!("trace buffer read failed on source {source}");
        }
        if !self.enabled {
            bail!("program is not enabled");
        }
        let reads = match self.states.get(&source) {
            Some(state) => state.reads,
            None => bail!("unknown source {source}"),
        };
        self.promote(source, reads);

        let limit = self.read_limit.get(&source).copied().unwrap_or(usize::MAX);
        let state = self
            .states
            .get_mut(&source)
            .expect("state existence checked above");
        let take = limit.min(state.buf.len());
        let bytes = state.buf.drain(..take).collect();
        let dropped = std::mem::take(&mut state.dropped);
        state.reads += 1;
        Ok(BufferChunk { bytes, dropped })
    }

    fn disable(&mut self, _handle: ProgramHandle) {
        self.enabled = false;
    }

    fn aggregation_snapshot(&mut self, aggregation: &str) -> Result<Vec<AggEntry>> {
        self.aggregations
            .get(aggregation)
            .cloned()
            .ok_or_else(|| anyhow!("unknown aggregation \"{aggregation}\""))
    }

    fn aggregation_clear(&mut self) -> Result<()> {
        for entries in self.aggregations.values_mut() {
            entries.clear();
        }
        Ok(())
    }
}
