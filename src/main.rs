use anyhow::{Context, Result};
use flume::{unbounded, Receiver};
use tracing_subscriber::EnvFilter;

use skyposter_backend::agent::AgentEvent;
use skyposter_backend::config::AgentConfig;
use skyposter_backend::runtime::BackendRuntime;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,skyposter=debug,skyposter_backend=debug")
            }),
        )
        .init();

    tracing::info!("Skyposter starting...");

    let config = AgentConfig::load();
    if std::env::args().any(|arg| arg == "--write-config") {
        // Secrets are left out of the written file.
        config.save().context("failed to write config file")?;
        tracing::info!("Wrote {:?}", AgentConfig::config_path());
        return Ok(());
    }

    let (event_tx, event_rx) = unbounded();
    let runtime = BackendRuntime::bootstrap(config, event_tx)
        .context("failed to bootstrap agent runtime")?;

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    if std::env::args().any(|arg| arg == "--stats") {
        let report = rt.block_on(runtime.account_report())?;
        tracing::info!("{}", report);
        return Ok(());
    }

    rt.block_on(async move {
        tokio::spawn(log_events(event_rx));
        runtime.run_until_signal().await
    })?;

    tracing::info!("Skyposter stopped");
    Ok(())
}

async fn log_events(events: Receiver<AgentEvent>) {
    while let Ok(event) = events.recv_async().await {
        match event {
            AgentEvent::Observation(text) => tracing::info!("[agent] {}", text),
            AgentEvent::ActionTaken { action, result } => {
                tracing::info!("[agent:{}] {}", action, result)
            }
            AgentEvent::Error(message) => tracing::error!("[agent] {}", message),
        }
    }
}
