//! Launch scheduler — brings `total` agents up under a concurrency ceiling.
//!
//! The scheduler is a single event loop. Agent signals and admission timers
//! all arrive on one channel and are handled one at a time, so the queue and
//! counters need no lock and two timers firing together can never admit the
//! same item twice.
//!
//! Admission rule: while `alive < concurrency_limit` and the queue is not
//! empty, pop the lowest pending item and launch it. Every launch schedules a
//! stagger re-check; every exit schedules a settle re-check.

pub mod counters;
pub mod queue;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::agent::{
    AgentEvent, AgentRecord, AgentSignal, AgentSpawner, AgentState, EventSink, ExitReason,
    WorkItem,
};
use crate::config::LauncherConfig;

pub use counters::{LaunchCounters, StatusHandle, StatusSnapshot};
pub use queue::PendingQueue;

/// Scheduling parameters.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub total: usize,
    pub concurrency_limit: usize,
    pub stagger_interval: Duration,
    pub settle_delay: Duration,
    pub shutdown_timeout: Duration,
}

impl From<&LauncherConfig> for SchedulerConfig {
    fn from(config: &LauncherConfig) -> Self {
        Self {
            total: config.total_agents,
            concurrency_limit: config.max_concurrent,
            stagger_interval: config.stagger_interval(),
            settle_delay: config.settle_delay(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

/// Why an admission check was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitTrigger {
    /// Stagger delay after a launch elapsed.
    Stagger,
    /// Settle delay after an exit elapsed.
    Settle,
}

/// Everything the scheduler reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Agent(AgentEvent),
    Admit(AdmitTrigger),
}

/// How `run` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Queue drained and every agent exited.
    Quiescent(StatusSnapshot),
    /// The shutdown future resolved; live agents were terminated.
    Shutdown(StatusSnapshot),
}

/// The launch scheduler. Owns the queue, the counters and every live agent.
pub struct Scheduler {
    config: SchedulerConfig,
    spawner: Arc<dyn AgentSpawner>,
    queue: PendingQueue,
    counters: LaunchCounters,
    agents: BTreeMap<WorkItem, AgentRecord>,
    events_tx: mpsc::UnboundedSender<SchedulerEvent>,
    events_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
    status_tx: watch::Sender<StatusSnapshot>,
    shutting_down: bool,
}

impl Scheduler {
    /// Create a scheduler with `0..total` queued.
    pub fn new(config: SchedulerConfig, spawner: Arc<dyn AgentSpawner>) -> Self {
        let counters = LaunchCounters::new(config.total);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(counters.snapshot());

        Self {
            queue: PendingQueue::new(config.total),
            config,
            spawner,
            counters,
            agents: BTreeMap::new(),
            events_tx,
            events_rx,
            status_tx,
            shutting_down: false,
        }
    }

    /// Read-only view for progress reporting.
    pub fn status(&self) -> StatusHandle {
        StatusHandle::new(self.status_tx.subscribe())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.counters.snapshot()
    }

    /// Items still waiting to launch.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// State of a live agent. `None` once it has exited or if it never ran.
    pub fn agent_state(&self, index: WorkItem) -> Option<AgentState> {
        self.agents.get(&index).map(|record| record.state)
    }

    /// Nothing left to launch and nothing alive.
    pub fn is_quiescent(&self) -> bool {
        self.queue.is_empty() && self.counters.alive() == 0
    }

    /// Drive the scheduler until it is quiescent or `shutdown` resolves.
    pub async fn run<F>(mut self, shutdown: F) -> RunOutcome
    where
        F: Future<Output = ()> + Send,
    {
        info!(
            total = self.config.total,
            max_concurrent = self.config.concurrency_limit,
            stagger = ?self.config.stagger_interval,
            "Launch scheduler started"
        );

        self.admit_more();
        tokio::pin!(shutdown);

        loop {
            if self.is_quiescent() {
                let snapshot = self.snapshot();
                info!(%snapshot, "All agents finished, scheduler idle");
                return RunOutcome::Quiescent(snapshot);
            }

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    self.shutdown().await;
                    return RunOutcome::Shutdown(self.snapshot());
                }
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                }
            }
        }
    }

    /// Process one event.
    pub fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Admit(trigger) => {
                debug!(?trigger, "Admission check");
                self.admit_more();
            }
            SchedulerEvent::Agent(AgentEvent { index, signal }) => match signal {
                AgentSignal::Ready { detail } => self.on_ready(index, detail),
                AgentSignal::Error { message } => self.on_error(index, message),
                AgentSignal::Exited(reason) => self.on_exit(index, reason),
            },
        }
    }

    /// Launch queued items while there is capacity.
    pub fn admit_more(&mut self) {
        if self.shutting_down {
            return;
        }
        while self.counters.alive() < self.config.concurrency_limit {
            let Some(item) = self.queue.pop() else {
                break;
            };
            self.launch(item);
        }
    }

    fn launch(&mut self, item: WorkItem) {
        let sink = EventSink::new(self.events_tx.clone());
        let started = self.spawner.start(item, sink.clone());
        self.counters.record_launch();

        match started {
            Ok(handle) => {
                info!(
                    index = item,
                    pid = ?handle.pid(),
                    launched = self.counters.launched(),
                    total = self.counters.total(),
                    "Launched agent"
                );
                self.agents.insert(item, AgentRecord::new(item, Some(handle)));
            }
            Err(e) => {
                // The slot stays taken until the exit goes through the
                // queue, so the replacement waits out the settle delay.
                error!(index = item, error = %e, "Agent failed to start");
                self.agents.insert(item, AgentRecord::new(item, None));
                sink.send(AgentEvent::new(
                    item,
                    AgentSignal::Exited(ExitReason::never_ran()),
                ));
            }
        }

        self.publish();
        self.schedule_admit(self.config.stagger_interval, AdmitTrigger::Stagger);
    }

    fn on_ready(&mut self, index: WorkItem, detail: Option<String>) {
        let Some(record) = self.agents.get_mut(&index) else {
            debug!(index, "Ready signal from unknown agent");
            return;
        };
        match record.transition_to(AgentState::Ready, detail.clone()) {
            Ok(()) => info!(index, detail = detail.as_deref().unwrap_or(""), "Agent ready"),
            Err(e) => debug!(index, "Ignoring ready signal: {}", e),
        }
    }

    fn on_error(&mut self, index: WorkItem, message: String) {
        warn!(index, error = %message, "Agent reported error");
        let Some(record) = self.agents.get_mut(&index) else {
            return;
        };
        if record.state != AgentState::Errored {
            if let Err(e) = record.transition_to(AgentState::Errored, Some(message)) {
                debug!(index, "Ignoring error signal: {}", e);
            }
        }
    }

    fn on_exit(&mut self, index: WorkItem, reason: ExitReason) {
        let Some(mut record) = self.agents.remove(&index) else {
            debug!(index, "Exit signal from unknown agent");
            return;
        };
        if let Err(e) = record.transition_to(AgentState::Exited, Some(reason.to_string())) {
            debug!(index, "{}", e);
        }
        self.counters.record_exit();
        self.publish();

        info!(
            index,
            code = ?reason.code,
            signal = ?reason.signal,
            uptime_secs = record.uptime().num_seconds(),
            alive = self.counters.alive(),
            finished = self.counters.finished(),
            "Agent exited"
        );

        self.schedule_admit(self.config.settle_delay, AdmitTrigger::Settle);
    }

    /// Post an admission check after `delay`.
    fn schedule_admit(&self, delay: Duration, trigger: AdmitTrigger) {
        if self.shutting_down {
            return;
        }
        let tx = self.events_tx.clone();
        if delay.is_zero() {
            let _ = tx.send(SchedulerEvent::Admit(trigger));
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SchedulerEvent::Admit(trigger));
        });
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.counters.snapshot());
    }

    /// Stop admitting, terminate every live agent and wait for their exits.
    pub async fn shutdown(&mut self) {
        self.shutting_down = true;
        info!(
            alive = self.counters.alive(),
            pending = self.queue.len(),
            "Shutting down, terminating live agents"
        );

        futures::future::join_all(
            self.agents
                .values_mut()
                .filter_map(|record| record.handle.as_mut())
                .map(|handle| handle.terminate()),
        )
        .await;

        let timeout = self.config.shutdown_timeout;
        let drain = async {
            while self.counters.alive() > 0 {
                match self.events_rx.recv().await {
                    Some(event) => self.handle_event(event),
                    None => break,
                }
            }
        };
        if tokio::time::timeout(timeout, drain)
            .await
            .is_err()
        {
            warn!(
                alive = self.counters.alive(),
                "Timed out waiting for agents to exit"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::agent::AgentHandle;
    use crate::error::AgentError;

    /// In-memory spawner: records launches and lets tests emit signals.
    #[derive(Default)]
    struct FakeSpawner {
        sinks: Mutex<Vec<(WorkItem, EventSink)>>,
        failing: HashSet<WorkItem>,
        ignore_terminate: bool,
        alive: Mutex<usize>,
        max_alive: Mutex<usize>,
    }

    impl FakeSpawner {
        fn failing(items: &[WorkItem]) -> Self {
            Self {
                failing: items.iter().copied().collect(),
                ..Self::default()
            }
        }

        /// Agents that never exit when asked to.
        fn stubborn() -> Self {
            Self {
                ignore_terminate: true,
                ..Self::default()
            }
        }

        fn launched(&self) -> Vec<WorkItem> {
            self.sinks.lock().unwrap().iter().map(|(i, _)| *i).collect()
        }

        fn signal(&self, index: WorkItem, signal: AgentSignal) {
            let sinks = self.sinks.lock().unwrap();
            let (_, sink) = sinks.iter().find(|(i, _)| *i == index).unwrap();
            if matches!(signal, AgentSignal::Exited(_)) {
                *self.alive.lock().unwrap() -= 1;
            }
            sink.send(AgentEvent::new(index, signal));
        }

        fn exit(&self, index: WorkItem, code: i32) {
            self.signal(index, AgentSignal::Exited(ExitReason::code(code)));
        }

        fn max_alive(&self) -> usize {
            *self.max_alive.lock().unwrap()
        }
    }

    impl AgentSpawner for FakeSpawner {
        fn start(
            &self,
            item: WorkItem,
            events: EventSink,
        ) -> Result<Box<dyn AgentHandle>, AgentError> {
            if self.failing.contains(&item) {
                return Err(AgentError::SpawnFailed {
                    index: item,
                    reason: "no such file".to_string(),
                });
            }
            self.sinks.lock().unwrap().push((item, events.clone()));
            let mut alive = self.alive.lock().unwrap();
            *alive += 1;
            let mut max = self.max_alive.lock().unwrap();
            *max = (*max).max(*alive);
            Ok(Box::new(FakeHandle {
                index: item,
                sink: events,
                ignore_terminate: self.ignore_terminate,
            }))
        }
    }

    #[derive(Debug)]
    struct FakeHandle {
        index: WorkItem,
        sink: EventSink,
        ignore_terminate: bool,
    }

    #[async_trait]
    impl AgentHandle for FakeHandle {
        async fn terminate(&mut self) {
            if self.ignore_terminate {
                return;
            }
            self.sink.send(AgentEvent::new(
                self.index,
                AgentSignal::Exited(ExitReason {
                    code: None,
                    signal: Some(15),
                }),
            ));
        }
    }

    fn config(total: usize, limit: usize, stagger_ms: u64) -> SchedulerConfig {
        SchedulerConfig {
            total,
            concurrency_limit: limit,
            stagger_interval: Duration::from_millis(stagger_ms),
            settle_delay: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    fn scheduler(
        total: usize,
        limit: usize,
        stagger_ms: u64,
        fake: &Arc<FakeSpawner>,
    ) -> Scheduler {
        let spawner: Arc<dyn AgentSpawner> = fake.clone();
        Scheduler::new(config(total, limit, stagger_ms), spawner)
    }

    fn assert_invariants(snapshot: StatusSnapshot, limit: usize) {
        assert_eq!(snapshot.alive, snapshot.launched - snapshot.finished);
        assert!(snapshot.finished <= snapshot.launched);
        assert!(snapshot.launched <= snapshot.total);
        assert!(snapshot.alive <= limit);
    }

    #[tokio::test(start_paused = true)]
    async fn five_items_two_slots() {
        let fake = Arc::new(FakeSpawner::default());
        let sched = scheduler(5, 2, 0, &fake);
        let mut status = sched.status();
        let run = tokio::spawn(sched.run(std::future::pending()));

        for (launched, exiting) in [(2, 0), (3, 1), (4, 2), (5, 3)] {
            let snap = status.wait_for(|s| s.launched == launched).await.unwrap();
            assert_invariants(snap, 2);
            assert_eq!(snap.alive, 2);
            fake.exit(exiting, 0);
        }
        fake.exit(4, 1);

        let outcome = run.await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Quiescent(StatusSnapshot {
                launched: 5,
                alive: 0,
                finished: 5,
                total: 5,
            })
        );
        assert_eq!(fake.launched(), vec![0, 1, 2, 3, 4]);
        assert_eq!(fake.max_alive(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_total_is_immediately_quiescent() {
        let fake = Arc::new(FakeSpawner::default());
        let sched = scheduler(0, 20, 2000, &fake);
        assert!(sched.is_quiescent());

        let outcome = sched.run(std::future::pending()).await;
        assert_eq!(outcome, RunOutcome::Quiescent(StatusSnapshot::default()));
        assert!(fake.launched().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn spare_capacity_launches_without_waiting() {
        let fake = Arc::new(FakeSpawner::default());
        let sched = scheduler(3, 10, 2000, &fake);
        let mut status = sched.status();
        let started = Instant::now();
        let run = tokio::spawn(sched.run(std::future::pending()));

        let snap = status.wait_for(|s| s.launched == 3).await.unwrap();
        assert_eq!(snap.alive, 3);
        assert!(started.elapsed() < Duration::from_millis(2000));
        assert_eq!(fake.launched(), vec![0, 1, 2]);

        for i in 0..3 {
            fake.exit(i, 0);
        }
        assert!(matches!(run.await.unwrap(), RunOutcome::Quiescent(s) if s.finished == 3));
    }

    #[tokio::test(start_paused = true)]
    async fn error_then_exit_counts_once() {
        let fake = Arc::new(FakeSpawner::default());
        let mut sched = scheduler(1, 1, 0, &fake);
        sched.admit_more();
        assert_eq!(sched.agent_state(0), Some(AgentState::Starting));

        sched.handle_event(SchedulerEvent::Agent(AgentEvent::new(
            0,
            AgentSignal::Error {
                message: "kicked".to_string(),
            },
        )));
        assert_eq!(sched.agent_state(0), Some(AgentState::Errored));
        assert_eq!(sched.snapshot().finished, 0);
        assert_eq!(sched.snapshot().alive, 1);

        let exit = SchedulerEvent::Agent(AgentEvent::new(
            0,
            AgentSignal::Exited(ExitReason::code(1)),
        ));
        sched.handle_event(exit.clone());
        sched.handle_event(exit);

        let snap = sched.snapshot();
        assert_eq!((snap.launched, snap.alive, snap.finished), (1, 0, 1));
        assert_eq!(sched.agent_state(0), None);
        assert!(sched.is_quiescent());
    }

    #[tokio::test(start_paused = true)]
    async fn ready_is_informational() {
        let fake = Arc::new(FakeSpawner::default());
        let mut sched = scheduler(2, 1, 0, &fake);
        sched.admit_more();

        sched.handle_event(SchedulerEvent::Agent(AgentEvent::new(
            0,
            AgentSignal::Ready {
                detail: Some("AFKBot1".to_string()),
            },
        )));
        assert_eq!(sched.agent_state(0), Some(AgentState::Ready));

        sched.handle_event(SchedulerEvent::Admit(AdmitTrigger::Stagger));
        assert_eq!(sched.snapshot().launched, 1);
        assert_eq!(sched.pending(), 1);

        // A ready signal for an item that never launched changes nothing.
        sched.handle_event(SchedulerEvent::Agent(AgentEvent::new(
            1,
            AgentSignal::Ready { detail: None },
        )));
        assert_eq!(sched.agent_state(1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn racing_admission_checks_launch_last_item_once() {
        let fake = Arc::new(FakeSpawner::default());
        let mut sched = scheduler(3, 2, 0, &fake);
        sched.admit_more();
        assert_eq!(fake.launched(), vec![0, 1]);

        sched.handle_event(SchedulerEvent::Agent(AgentEvent::new(
            0,
            AgentSignal::Exited(ExitReason::code(0)),
        )));
        sched.handle_event(SchedulerEvent::Admit(AdmitTrigger::Settle));
        sched.handle_event(SchedulerEvent::Admit(AdmitTrigger::Stagger));

        assert_eq!(fake.launched(), vec![0, 1, 2]);
        let snap = sched.snapshot();
        assert_eq!((snap.launched, snap.alive, snap.finished), (3, 2, 1));
        assert_eq!(sched.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_frees_the_slot() {
        let fake = Arc::new(FakeSpawner::failing(&[1]));
        let mut sched = scheduler(3, 1, 2000, &fake);
        sched.admit_more();
        assert_eq!(fake.launched(), vec![0]);

        sched.handle_event(SchedulerEvent::Agent(AgentEvent::new(
            0,
            AgentSignal::Exited(ExitReason::code(0)),
        )));
        sched.handle_event(SchedulerEvent::Admit(AdmitTrigger::Settle));

        // Item 1 fails to start but holds the slot until its exit is handled.
        assert_eq!(fake.launched(), vec![0]);
        assert_eq!(sched.agent_state(1), Some(AgentState::Starting));
        let snap = sched.snapshot();
        assert_eq!((snap.launched, snap.alive, snap.finished), (2, 1, 1));
        assert_invariants(snap, 1);

        let queued = sched.events_rx.try_recv().unwrap();
        assert_eq!(
            queued,
            SchedulerEvent::Agent(AgentEvent::new(
                1,
                AgentSignal::Exited(ExitReason::never_ran())
            ))
        );
        sched.handle_event(queued);
        assert_eq!(sched.agent_state(1), None);
        assert_eq!(fake.launched(), vec![0]);
        let snap = sched.snapshot();
        assert_eq!((snap.launched, snap.alive, snap.finished), (2, 0, 2));

        // Item 2 only goes once the settle re-check arrives.
        sched.handle_event(SchedulerEvent::Admit(AdmitTrigger::Settle));
        assert_eq!(fake.launched(), vec![0, 2]);
        let snap = sched.snapshot();
        assert_eq!((snap.launched, snap.alive, snap.finished), (3, 1, 2));
        assert_invariants(snap, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_command_does_not_burn_through_the_queue() {
        let fake = Arc::new(FakeSpawner::failing(&[0, 1, 2, 3, 4]));
        let mut sched = scheduler(5, 1, 2000, &fake);
        sched.admit_more();
        let snap = sched.snapshot();
        assert_eq!((snap.launched, snap.alive), (1, 1));
        assert_eq!(sched.pending(), 4);

        // Every failure waits out a settle delay before the next attempt.
        let started = Instant::now();
        let outcome = sched.run(std::future::pending()).await;
        assert_eq!(
            outcome,
            RunOutcome::Quiescent(StatusSnapshot {
                launched: 5,
                alive: 0,
                finished: 5,
                total: 5,
            })
        );
        assert!(started.elapsed() >= Duration::from_millis(4 * 500));
        assert!(fake.launched().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exited_items_are_not_relaunched() {
        let fake = Arc::new(FakeSpawner::default());
        let sched = scheduler(2, 2, 10, &fake);
        let mut status = sched.status();
        let run = tokio::spawn(sched.run(std::future::pending()));

        status.wait_for(|s| s.launched == 2).await.unwrap();
        fake.exit(0, 1);
        fake.exit(1, 1);
        let outcome = run.await.unwrap();

        assert!(matches!(outcome, RunOutcome::Quiescent(s) if s.launched == 2 && s.finished == 2));
        assert_eq!(fake.launched(), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_terminates_live_agents() {
        let fake = Arc::new(FakeSpawner::default());
        let sched = scheduler(5, 2, 0, &fake);
        let mut status = sched.status();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn(sched.run(async move {
            let _ = stop_rx.await;
        }));

        status.wait_for(|s| s.launched == 2).await.unwrap();
        stop_tx.send(()).unwrap();

        let outcome = run.await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Shutdown(StatusSnapshot {
                launched: 2,
                alive: 0,
                finished: 2,
                total: 5,
            })
        );
        assert_eq!(fake.launched(), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_gives_up_after_timeout() {
        let fake = Arc::new(FakeSpawner::stubborn());
        let sched = scheduler(2, 1, 0, &fake);
        let mut status = sched.status();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn(sched.run(async move {
            let _ = stop_rx.await;
        }));

        status.wait_for(|s| s.launched == 1).await.unwrap();
        let stopped_at = Instant::now();
        stop_tx.send(()).unwrap();

        let outcome = run.await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Shutdown(StatusSnapshot {
                launched: 1,
                alive: 1,
                finished: 0,
                total: 2,
            })
        );
        assert!(stopped_at.elapsed() >= Duration::from_secs(5));
        assert_eq!(fake.launched(), vec![0]);
    }
}
