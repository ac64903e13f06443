use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;

use crate::agent::{
    Agent, AgentEvent, AgentServices, NotificationWorker, PublisherWorker, StatsWorker,
    ToneWorker,
};
use crate::config::AgentConfig;
use crate::llm_client::LlmClient;
use crate::news::NewsApiClient;
use crate::social::bluesky::BlueskyClient;
use crate::stats::AccountReport;
use crate::supervisor::{WorkerState, WorkerSupervisor};

pub struct BackendRuntime {
    pub config: AgentConfig,
    pub agent: Arc<Agent>,
    pub supervisor: Arc<WorkerSupervisor>,
}

pub struct BackendRuntimeBuilder {
    config: AgentConfig,
    event_tx: Sender<AgentEvent>,
    services: Option<AgentServices>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: AgentConfig, event_tx: Sender<AgentEvent>) -> Self {
        Self {
            config,
            event_tx,
            services: None,
        }
    }

    /// Use these collaborators instead of the HTTP clients built from config.
    pub fn with_services(mut self, services: AgentServices) -> Self {
        self.services = Some(services);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;
        config
            .validate()
            .context("Invalid configuration, refusing to start")?;

        let services = match self.services {
            Some(services) => services,
            None => build_services(&config),
        };

        let supervisor = Arc::new(WorkerSupervisor::new(config.monitor_interval()));
        let agent = Arc::new(Agent::new(
            &config,
            services,
            supervisor.shutdown_signal(),
            self.event_tx,
        ));

        supervisor.register(
            "publisher",
            Arc::new(PublisherWorker::new(agent.clone())),
            config.publish_interval(),
            config.restart_delay(),
        );
        supervisor.register(
            "notifications",
            Arc::new(NotificationWorker::new(agent.clone())),
            config.notification_interval(),
            config.restart_delay(),
        );
        supervisor.register(
            "tone",
            Arc::new(ToneWorker::new(agent.clone())),
            config.tone_interval(),
            config.restart_delay(),
        );
        supervisor.register(
            "stats",
            Arc::new(StatsWorker::new(agent.clone())),
            config.stats_interval(),
            config.restart_delay(),
        );

        Ok(BackendRuntime {
            config,
            agent,
            supervisor,
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: AgentConfig, event_tx: Sender<AgentEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, event_tx).build()
    }

    /// Log in and start every worker. A rejected login is fatal.
    pub async fn start(&self) -> Result<()> {
        let session = self
            .agent
            .session()
            .authenticate()
            .await
            .context("Initial authentication failed")?;
        tracing::info!(
            "Agent ready as {} ({}), topics {:?}",
            self.config.account_identifier,
            session.account_id,
            self.config.topics
        );

        self.supervisor.run_all();
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown(self.config.shutdown_timeout()).await;
    }

    /// Log in and collect one account statistics report without starting
    /// any worker.
    pub async fn account_report(&self) -> Result<AccountReport> {
        self.agent
            .account_report()
            .await
            .context("Failed to collect account statistics")
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.supervisor.states()
    }

    /// Start, then run until SIGINT/SIGTERM and shut down gracefully.
    pub async fn run_until_signal(&self) -> Result<()> {
        self.start().await?;
        wait_for_signal().await;
        tracing::info!("Shutdown signal received");
        self.shutdown().await;
        Ok(())
    }
}

fn build_services(config: &AgentConfig) -> AgentServices {
    tracing::info!("Social API: {}", config.social_api_url);
    tracing::info!("LLM: {} ({})", config.llm_api_url, config.llm_model);
    if config.news_api_key.is_none() {
        tracing::warn!("No NEWS_API_KEY set, the publisher will have nothing to post");
    }

    AgentServices {
        api: Arc::new(BlueskyClient::new(config.social_api_url.clone())),
        news: Arc::new(NewsApiClient::new(
            config.news_api_url.clone(),
            config.news_api_key.clone(),
        )),
        generator: Arc::new(LlmClient::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
            config.system_prompt.clone(),
        )),
    }
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Could not install SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
