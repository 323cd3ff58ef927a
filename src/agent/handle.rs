//! The contract between the scheduler and whatever runs an agent.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::agent::signal::{AgentEvent, WorkItem};
use crate::error::AgentError;
use crate::scheduler::SchedulerEvent;

/// Where agents deliver their signals. Every agent gets a clone of the same
/// sink, so all signals land in the scheduler's one event queue.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        Self { tx }
    }

    /// Deliver an event. Returns false once the scheduler has gone away.
    pub fn send(&self, event: AgentEvent) -> bool {
        self.tx.send(SchedulerEvent::Agent(event)).is_ok()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Starts agents.
///
/// `start` must not block: it issues the start and returns. Every handle it
/// returns must eventually deliver exactly one `Exited` event to `events`,
/// and may deliver `Ready`/`Error` before that.
pub trait AgentSpawner: Send + Sync {
    fn start(&self, item: WorkItem, events: EventSink) -> Result<Box<dyn AgentHandle>, AgentError>;
}

/// A running agent, owned by the scheduler until its exit is observed.
#[async_trait]
pub trait AgentHandle: Send + Sync + fmt::Debug {
    /// OS process id, when there is one.
    fn pid(&self) -> Option<u32> {
        None
    }

    /// Ask the agent to stop. The `Exited` event still arrives through the
    /// event sink.
    async fn terminate(&mut self);
}
