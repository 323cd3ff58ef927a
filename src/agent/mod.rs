//! Agents — the units of work the launcher brings up.
//!
//! - `signal` — ready/error/exit signals and the stdout line protocol
//! - `handle` — the spawner/handle contract the scheduler drives
//! - `state` — per-agent state machine (Starting → Ready/Errored → Exited)
//! - `process` — child-process implementation of the contract

pub mod handle;
pub mod process;
pub mod signal;
pub mod state;

pub use handle::{AgentHandle, AgentSpawner, EventSink};
pub use process::{ProcessHandle, ProcessSpawner};
pub use signal::{AgentEvent, AgentSignal, ExitReason, WorkItem};
pub use state::{AgentRecord, AgentState};
