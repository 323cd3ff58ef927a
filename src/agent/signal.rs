//! Signals an agent sends back to the launcher.
//!
//! Agents report `ready` and `error` as NDJSON lines on stdout; the terminal
//! `exit` signal comes from the process itself. Everything the scheduler
//! reacts to arrives as an [`AgentEvent`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one unit of scheduled work (`0..total`).
pub type WorkItem = usize;

/// How an agent process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReason {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one.
    pub signal: Option<i32>,
}

impl ExitReason {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// Used when the child could not be started or waited on.
    pub fn never_ran() -> Self {
        Self::default()
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<i32>| v.map_or_else(|| "none".to_string(), |v| v.to_string());
        write!(f, "code={}, sig={}", show(self.code), show(self.signal))
    }
}

/// One signal from one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentSignal {
    /// The agent finished its own startup. Informational only.
    Ready { detail: Option<String> },
    /// The agent hit a problem; it is expected to exit soon after.
    Error { message: String },
    /// The agent is gone. Emitted exactly once per agent.
    Exited(ExitReason),
}

/// A signal tagged with the work item that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEvent {
    pub index: WorkItem,
    pub signal: AgentSignal,
}

impl AgentEvent {
    pub fn new(index: WorkItem, signal: AgentSignal) -> Self {
        Self { index, signal }
    }
}

/// Messages an agent writes to stdout, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChildMessage {
    Ready {
        #[serde(default)]
        username: Option<String>,
    },
    Error {
        #[serde(default)]
        error: String,
    },
}

/// Parse one stdout line into a signal. Lines that are not protocol
/// messages return `None`.
pub fn parse_line(line: &str) -> Option<AgentSignal> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<ChildMessage>(line).ok()? {
        ChildMessage::Ready { username } => Some(AgentSignal::Ready { detail: username }),
        ChildMessage::Error { error } => Some(AgentSignal::Error { message: error }),
    }
}
