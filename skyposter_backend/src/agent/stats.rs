use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::{Agent, AgentEvent};
use crate::error::AgentError;
use crate::rate_limit::CallKind;
use crate::social::{FeedPost, Session};
use crate::stats::{analyze_posts, AccountReport};
use crate::supervisor::Worker;

/// Upper bound on author-feed pages read for one report.
const MAX_FEED_PAGES: usize = 20;

impl Agent {
    /// Profile counters plus activity over the configured window.
    pub async fn account_report(&self) -> crate::error::Result<AccountReport> {
        let session = self.session.ensure_authenticated().await?;
        let result = self.collect_report(&session).await;
        if let Err(e) = &result {
            if e.is_auth() {
                self.session.invalidate().await;
            }
        }
        result
    }

    /// Collect a report and publish it as an observation.
    pub async fn report_stats(&self) -> Result<()> {
        if self.shutdown.is_shutting_down() {
            return Ok(());
        }
        let report = self
            .account_report()
            .await
            .context("Failed to collect account statistics")?;
        tracing::info!("Account stats: {}", report);
        self.emit(AgentEvent::Observation(report.to_string()));
        Ok(())
    }

    async fn collect_report(&self, session: &Session) -> crate::error::Result<AccountReport> {
        let profile = self
            .backoff
            .retry("getProfile", || async move {
                self.limiter.acquire(CallKind::ContentLookup).await;
                self.api.get_profile(session, &session.account_id).await
            })
            .await?;

        let since = Utc::now() - self.stats_window;
        let posts = self.recent_posts(session, since).await?;
        Ok(AccountReport {
            profile,
            window_hours: self.stats_window.num_hours(),
            activity: analyze_posts(&posts),
        })
    }

    /// Own posts indexed after `since`, newest first.
    async fn recent_posts(
        &self,
        session: &Session,
        since: DateTime<Utc>,
    ) -> crate::error::Result<Vec<FeedPost>> {
        let mut posts = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_FEED_PAGES {
            if self.shutdown.is_shutting_down() {
                return Err(AgentError::ShuttingDown {
                    operation: "getAuthorFeed".to_string(),
                });
            }

            let page_cursor = cursor.as_deref();
            let page = self
                .backoff
                .retry("getAuthorFeed", move || async move {
                    self.limiter.acquire(CallKind::ContentLookup).await;
                    self.api
                        .get_author_feed(session, &session.account_id, page_cursor)
                        .await
                })
                .await?;

            for post in page.posts {
                if post.indexed_at < since {
                    return Ok(posts);
                }
                posts.push(post);
            }

            match page.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(posts),
            }
        }

        tracing::debug!("Stopped reading the author feed after {} pages", MAX_FEED_PAGES);
        Ok(posts)
    }
}

pub struct StatsWorker {
    agent: Arc<Agent>,
}

impl StatsWorker {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Worker for StatsWorker {
    fn name(&self) -> &str {
        "stats"
    }

    async fn run_once(&self) -> Result<()> {
        self.agent.report_stats().await
    }
}
