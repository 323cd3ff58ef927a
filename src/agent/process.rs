//! Process-backed agents.
//!
//! Each agent is a child process started from the configured command with
//! `WORKER_INDEX` set. A supervisor task owns the `Child`, turns its stdout
//! protocol lines into signals and reports the exit exactly once.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::handle::{AgentHandle, AgentSpawner, EventSink};
use crate::agent::signal::{parse_line, AgentEvent, AgentSignal, ExitReason, WorkItem};
use crate::config::AgentCommand;
use crate::error::AgentError;

/// Env var carrying the work item index into the child.
pub const WORKER_INDEX_ENV: &str = "WORKER_INDEX";

/// How long to wait for buffered stdout after the child exits.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Spawns one child process per work item.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    command: AgentCommand,
    terminate_timeout: Duration,
}

impl ProcessSpawner {
    pub fn new(command: AgentCommand, terminate_timeout: Duration) -> Self {
        Self {
            command,
            terminate_timeout,
        }
    }

    fn build_command(&self, item: WorkItem) -> Command {
        let mut cmd = Command::new(&self.command.command);
        cmd.args(&self.command.args)
            .envs(&self.command.env)
            .env(WORKER_INDEX_ENV, item.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.command.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl AgentSpawner for ProcessSpawner {
    fn start(&self, item: WorkItem, events: EventSink) -> Result<Box<dyn AgentHandle>, AgentError> {
        let mut child = self
            .build_command(item)
            .spawn()
            .map_err(|e| AgentError::SpawnFailed {
                index: item,
                reason: e.to_string(),
            })?;
        let pid = child.id();

        let stdout = child.stdout.take().ok_or_else(|| AgentError::SpawnFailed {
            index: item,
            reason: "stdout not captured".to_string(),
        })?;

        let sink = events.clone();
        let stdout_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match parse_line(&line) {
                    Some(signal) => {
                        if !sink.send(AgentEvent::new(item, signal)) {
                            break;
                        }
                    }
                    None => debug!(index = item, "stdout: {}", line),
                }
            }
        });

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(index = item, "stderr: {}", line);
                }
            });
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(item, child, stop_rx, stdout_reader, events));

        debug!(index = item, pid = ?pid, "Agent process spawned");

        Ok(Box::new(ProcessHandle {
            index: item,
            pid,
            stop_tx: Some(stop_tx),
            supervisor: Some(supervisor),
            terminate_timeout: self.terminate_timeout,
        }))
    }
}

/// Wait for the child (or a stop request), then report the exit.
async fn supervise(
    index: WorkItem,
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    stdout_reader: JoinHandle<()>,
    events: EventSink,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop_rx => {
            if let Err(e) = child.start_kill() {
                warn!(index, error = %e, "Failed to kill agent process");
            }
            child.wait().await
        }
    };

    let reason = match status {
        Ok(status) => ExitReason::from_status(status),
        Err(e) => {
            warn!(index, error = %e, "Error waiting for agent process");
            ExitReason::never_ran()
        }
    };

    // Ready/error lines written just before exit must land before the exit.
    if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, stdout_reader)
        .await
        .is_err()
    {
        debug!(index, "stdout still open after exit, not waiting further");
    }

    events.send(AgentEvent::new(index, AgentSignal::Exited(reason)));
}

/// Handle to a running agent process.
#[derive(Debug)]
pub struct ProcessHandle {
    index: WorkItem,
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
    terminate_timeout: Duration,
}

#[async_trait]
impl AgentHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn terminate(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(supervisor) = self.supervisor.take() {
            match tokio::time::timeout(self.terminate_timeout, supervisor).await {
                Ok(_) => info!(index = self.index, "Agent process terminated"),
                Err(_) => warn!(index = self.index, "Timeout waiting for agent process to exit"),
            }
        }
    }
}
