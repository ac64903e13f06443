pub mod notifications;
pub mod publisher;
pub mod stats;
pub mod tone;

use chrono::{DateTime, Utc};
use flume::{Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AgentConfig;
use crate::content::ContentSource;
use crate::dedup::DedupTracker;
use crate::llm_client::TextGenerator;
use crate::news::NewsSource;
use crate::planner::ReplyPlanner;
use crate::posting::PostingPipeline;
use crate::rate_limit::{Backoff, RateLimiter};
use crate::registry::ThreadRegistry;
use crate::session::SessionManager;
use crate::social::SocialApi;
use crate::supervisor::ShutdownSignal;

pub use notifications::NotificationWorker;
pub use publisher::PublisherWorker;
pub use stats::StatsWorker;
pub use tone::{ToneJob, ToneWorker};

/// What the agent reports to whoever is listening (the binary logs these).
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Observation(String),
    ActionTaken { action: String, result: String },
    Error(String),
}

/// Remote collaborators the agent is wired to.
pub struct AgentServices {
    pub api: Arc<dyn SocialApi>,
    pub news: Arc<dyn NewsSource>,
    pub generator: Arc<dyn TextGenerator>,
}

/// Shared conversation state plus the worker cycles that operate on it.
pub struct Agent {
    api: Arc<dyn SocialApi>,
    session: Arc<SessionManager>,
    content: Arc<ContentSource>,
    registry: Arc<ThreadRegistry>,
    dedup: Arc<DedupTracker>,
    planner: ReplyPlanner,
    pipeline: PostingPipeline,
    limiter: Arc<RateLimiter>,
    backoff: Backoff,
    shutdown: ShutdownSignal,
    tone_tx: Sender<ToneJob>,
    tone_rx: Receiver<ToneJob>,
    event_tx: Sender<AgentEvent>,
    articles_per_thread: usize,
    thread_retention: chrono::Duration,
    stats_window: chrono::Duration,
}

impl Agent {
    pub fn new(
        config: &AgentConfig,
        services: AgentServices,
        shutdown: ShutdownSignal,
        event_tx: Sender<AgentEvent>,
    ) -> Self {
        let AgentServices {
            api,
            news,
            generator,
        } = services;

        let session = Arc::new(SessionManager::new(
            api.clone(),
            config.account_identifier.clone(),
            config.account_secret.clone(),
        ));
        let content = Arc::new(ContentSource::new(
            news,
            generator,
            config.topics.clone(),
            config.post_char_limit,
        ));
        let registry = Arc::new(ThreadRegistry::new(config.max_tracked_threads));

        // Without a checkpoint every notification still on the server is fair game.
        let checkpoint = if config.reply_to_backlog {
            None
        } else {
            Some(Utc::now())
        };
        let dedup = Arc::new(DedupTracker::new(config.dedup_capacity, checkpoint));

        let planner = ReplyPlanner::new(registry.clone(), dedup.clone(), content.clone());
        let limiter = Arc::new(RateLimiter::new(&config.rate_limits));
        let backoff = Backoff::from_config(&config.rate_limits);
        let pipeline = PostingPipeline::new(
            api.clone(),
            session.clone(),
            limiter.clone(),
            backoff.clone(),
            shutdown.clone(),
        )
        .with_confirmation(
            config.confirm_attempts,
            Duration::from_millis(config.confirm_delay_ms),
        );
        let (tone_tx, tone_rx) = flume::unbounded();

        Self {
            api,
            session,
            content,
            registry,
            dedup,
            planner,
            pipeline,
            limiter,
            backoff,
            shutdown,
            tone_tx,
            tone_rx,
            event_tx,
            articles_per_thread: config.articles_per_thread.max(1),
            thread_retention: config.thread_retention(),
            stats_window: config.stats_window(),
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    pub fn dedup(&self) -> &Arc<DedupTracker> {
        &self.dedup
    }

    pub fn content(&self) -> &Arc<ContentSource> {
        &self.content
    }

    pub fn pending_tone_jobs(&self) -> usize {
        self.tone_rx.len()
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.event_tx.send(event);
    }

    fn thread_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - self.thread_retention
    }
}
