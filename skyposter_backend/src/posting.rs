//! Getting one post onto the network and confirmed.
//!
//! `Pending -> Authenticated -> Submitted -> Confirmed | Failed`. A submission
//! that hits an expired token re-authenticates once; transient failures are
//! retried with backoff; confirmation polls for the content id a bounded
//! number of times. A failed post is reported to the caller and never
//! requeued. Failures after submission surface as
//! [`AgentError::Unconfirmed`] so callers can tell "nothing was posted" from
//! "something may have been posted".

use std::sync::Arc;
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::rate_limit::{Backoff, CallKind, RateLimiter};
use crate::session::SessionManager;
use crate::social::{PendingReply, PostRef, Session, SocialApi};
use crate::supervisor::ShutdownSignal;

pub const DEFAULT_CONFIRM_ATTEMPTS: u32 = 5;
pub const DEFAULT_CONFIRM_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostState {
    Pending,
    Authenticated,
    Submitted { post_id: String },
    Confirmed(PostRef),
    Failed(String),
}

impl PostState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PostState::Confirmed(_) | PostState::Failed(_))
    }
}

/// State of a single post as it moves through the pipeline.
#[derive(Debug, Clone)]
pub struct PostAttempt {
    label: String,
    state: PostState,
    reauthenticated: bool,
}

impl PostAttempt {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: PostState::Pending,
            reauthenticated: false,
        }
    }

    pub fn state(&self) -> &PostState {
        &self.state
    }

    pub fn reauthenticated(&self) -> bool {
        self.reauthenticated
    }

    fn advance(&mut self, next: PostState) {
        if self.state.is_terminal() {
            tracing::warn!(
                "Ignoring transition {:?} for {} already in {:?}",
                next,
                self.label,
                self.state
            );
            return;
        }
        tracing::debug!("{}: {:?} -> {:?}", self.label, self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: &AgentError) {
        self.advance(PostState::Failed(err.to_string()));
    }
}

pub struct PostingPipeline {
    api: Arc<dyn SocialApi>,
    session: Arc<SessionManager>,
    limiter: Arc<RateLimiter>,
    backoff: Backoff,
    shutdown: ShutdownSignal,
    confirm_attempts: u32,
    confirm_delay: Duration,
}

impl PostingPipeline {
    pub fn new(
        api: Arc<dyn SocialApi>,
        session: Arc<SessionManager>,
        limiter: Arc<RateLimiter>,
        backoff: Backoff,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            api,
            session,
            limiter,
            backoff,
            shutdown,
            confirm_attempts: DEFAULT_CONFIRM_ATTEMPTS,
            confirm_delay: DEFAULT_CONFIRM_DELAY,
        }
    }

    pub fn with_confirmation(mut self, attempts: u32, delay: Duration) -> Self {
        self.confirm_attempts = attempts.max(1);
        self.confirm_delay = delay;
        self
    }

    /// Publish `text`, optionally as a reply, and return its confirmed address.
    pub async fn publish(&self, text: &str, reply: Option<&PendingReply>) -> Result<PostRef> {
        let label = match reply {
            Some(reply) => format!("reply to {}", reply.parent_id),
            None => "root post".to_string(),
        };
        let mut attempt = PostAttempt::new(label);

        match self.drive(&mut attempt, text, reply).await {
            Ok(post) => {
                tracing::info!("Published {} as {}", attempt.label, post.id);
                Ok(post)
            }
            Err(e) => {
                attempt.fail(&e);
                tracing::warn!("Abandoning {} for this cycle: {}", attempt.label, e);
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        attempt: &mut PostAttempt,
        text: &str,
        reply: Option<&PendingReply>,
    ) -> Result<PostRef> {
        self.ensure_running("createRecord")?;
        let mut session = self.session.ensure_authenticated().await?;
        attempt.advance(PostState::Authenticated);

        let post_id = loop {
            match self.submit(&session, text, reply).await {
                Ok(post_id) => break post_id,
                Err(e) if e.is_auth() && !attempt.reauthenticated => {
                    tracing::warn!("Session rejected while posting ({}), re-authenticating", e);
                    attempt.reauthenticated = true;
                    self.session.invalidate().await;
                    self.ensure_running("createSession")?;
                    session = self.session.authenticate().await?;
                }
                Err(e) => return Err(e),
            }
        };
        attempt.advance(PostState::Submitted {
            post_id: post_id.clone(),
        });

        let content_id = self
            .confirm(&session, &post_id)
            .await
            .map_err(|e| AgentError::Unconfirmed {
                post_id: post_id.clone(),
                reason: e.to_string(),
            })?;
        let post = PostRef::new(post_id, content_id);
        attempt.advance(PostState::Confirmed(post.clone()));
        Ok(post)
    }

    async fn submit(
        &self,
        session: &Session,
        text: &str,
        reply: Option<&PendingReply>,
    ) -> Result<String> {
        self.backoff
            .retry("createRecord", || async move {
                self.ensure_running("createRecord")?;
                self.limiter.acquire(CallKind::PostCreation).await;
                self.api.create_post(session, text, reply).await
            })
            .await
    }

    /// Poll for the content id of a freshly created post.
    async fn confirm(&self, session: &Session, post_id: &str) -> Result<String> {
        for attempt in 1..=self.confirm_attempts {
            self.ensure_running("getPosts")?;
            self.limiter.acquire(CallKind::ContentLookup).await;

            match self.api.resolve_content_id(session, post_id).await {
                Ok(content_id) => return Ok(content_id),
                Err(e @ AgentError::ContentUnavailable { .. }) => {
                    tracing::debug!(
                        "{} not visible yet ({}/{}): {}",
                        post_id,
                        attempt,
                        self.confirm_attempts,
                        e
                    );
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!("Lookup of {} failed transiently: {}", post_id, e);
                }
                Err(e) => return Err(e),
            }

            if attempt < self.confirm_attempts {
                tokio::time::sleep(self.confirm_delay).await;
            }
        }

        Err(AgentError::content_unavailable(format!(
            "post {} not visible after {} lookups",
            post_id, self.confirm_attempts
        )))
    }

    fn ensure_running(&self, operation: &str) -> Result<()> {
        if self.shutdown.is_shutting_down() {
            return Err(AgentError::ShuttingDown {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }
}
