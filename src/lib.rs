//! spigot — a consumer runtime for dynamic tracing.
//!
//! Compiles a probe script into an activatable program, enables it through
//! an instrumentation [`Provider`], and drains the engine's per-source trace
//! buffers into typed records delivered to a caller-supplied handler.
//!
//! The consumer runs on a single control thread. The caller owns the polling
//! cadence: each [`Session::drain`] call makes one finite pass over every
//! buffer source in ascending source-index order and returns, so the host
//! decides threading, timers, and cancellation.
//!
//! # Modules
//!
//! - [`script`] - probe descriptions and clause splitting
//! - [`compile`] - semantic validation and compiled clause layouts
//! - [`decode`] - resumable wire-frame decoding
//! - [`session`] - lifecycle state machine, drain scheduler, dispatch
//! - [`provider`] - the consumed instrumentation-engine interface
//! - [`replay`] - an in-memory provider replaying scripted scenarios
//!
//! # Example
//!
//! ```no_run
//! use spigot::{FieldKind, ReplayProvider, Session};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut provider = ReplayProvider::new(2);
//! provider.add_probe("syscall::read:entry", &[("pid", FieldKind::Integer)])?;
//!
//! let mut session = Session::new(provider);
//! session.compile("syscall::read:entry { printf(\"%d\", pid); }")?;
//! session.activate()?;
//! let stats = session.drain(|record| {
//!     println!("{} fired on cpu {}", record.probe, record.source);
//!     Ok(())
//! })?;
//! println!("{} records, {:?} dropped", stats.records, stats.per_source_dropped);
//! session.stop();
//! # Ok(())
//! # }
//! ```

pub mod compile;
pub mod decode;
pub mod errors;
pub mod provider;
pub mod record;
pub mod replay;
pub mod script;
pub mod session;

// Re-export for convenience
pub use compile::{AggFunc, Clause, CompiledProgram, FormatToken, OutputField};
pub use errors::{ActivationError, CompileError, DecodeError, Error, StateError};
pub use provider::{
    AggEntry, AggValue, BufferChunk, HistBucket, ProgramHandle, Provider, SourceId,
};
pub use record::{FieldKind, FieldValue, TraceRecord};
pub use replay::{ReplayProvider, ReplayScenario};
pub use script::ProbeDesc;
pub use session::{DrainStats, Session, SessionConfig, SessionState};
