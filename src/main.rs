use std::sync::Arc;

use anyhow::Context;

use agent_launcher::agent::{AgentSpawner, ProcessSpawner};
use agent_launcher::config::{CONFIG_PATH_ENV, LauncherConfig};
use agent_launcher::reporter::spawn_progress_reporter;
use agent_launcher::scheduler::{RunOutcome, Scheduler, SchedulerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // Fatal before anything launches: copy config.example.json and edit it.
    let config = LauncherConfig::load().with_context(|| {
        format!("could not load launcher configuration (set {CONFIG_PATH_ENV} or create config.json)")
    })?;

    eprintln!("🚀 Agent Launcher v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agents: {}", config.total_agents);
    eprintln!("   Max concurrent: {}", config.max_concurrent);
    eprintln!(
        "   Stagger: {}ms, settle: {}ms",
        config.stagger_ms, config.settle_ms
    );
    eprintln!("   Command: {} {}\n", config.agent.command, config.agent.args.join(" "));

    let spawner: Arc<dyn AgentSpawner> = Arc::new(ProcessSpawner::new(
        config.agent.clone(),
        config.shutdown_timeout(),
    ));
    let scheduler = Scheduler::new(SchedulerConfig::from(&config), spawner);

    let reporter = config
        .progress_interval()
        .map(|interval| spawn_progress_reporter(scheduler.status(), interval));

    let outcome = scheduler.run(shutdown_signal()).await;

    if let Some(reporter) = reporter {
        reporter.abort();
    }

    match outcome {
        RunOutcome::Quiescent(snapshot) => {
            tracing::info!(%snapshot, "Launcher finished");
        }
        RunOutcome::Shutdown(snapshot) => {
            tracing::info!(%snapshot, "Launcher stopped");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Ctrl+C received, shutting down..."),
        Err(e) => {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
