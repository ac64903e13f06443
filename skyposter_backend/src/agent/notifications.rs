use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::tone::ToneJob;
use super::{Agent, AgentEvent};
use crate::error::AgentError;
use crate::planner::{CommentIntent, ReplyDecision};
use crate::rate_limit::CallKind;
use crate::social::{Notification, NotificationCategory, Session};
use crate::supervisor::Worker;

/// Hydration only needs the parent chain, not replies below the comment.
const HYDRATE_REPLY_DEPTH: u32 = 0;

enum Handled {
    Replied,
    QueuedToneChange,
}

/// Where one poll may move the checkpoint to.
#[derive(Debug, Default)]
struct Watermark {
    answered_at: Vec<DateTime<Utc>>,
    oldest_open: Option<DateTime<Utc>>,
}

impl Watermark {
    fn answered(&mut self, at: DateTime<Utc>) {
        self.answered_at.push(at);
    }

    fn open(&mut self, at: DateTime<Utc>) {
        self.oldest_open = Some(self.oldest_open.map_or(at, |current| current.min(at)));
    }

    fn next_checkpoint(&self) -> Option<DateTime<Utc>> {
        self.answered_at
            .iter()
            .copied()
            .filter(|at| self.oldest_open.map_or(true, |open| *at < open))
            .max()
    }
}

impl Agent {
    /// Fetch notifications and answer every new reply or mention.
    ///
    /// All items of one poll are judged against the checkpoint as it stood
    /// when the poll started. Afterwards the checkpoint moves to the newest
    /// answered notification that is older than every item still waiting for
    /// an answer (released for retry or queued for the tone worker). Answered
    /// items above that line are kept out by the dedup tracker.
    pub async fn poll_notifications(&self) -> Result<()> {
        if self.shutdown.is_shutting_down() {
            return Ok(());
        }

        let session = self
            .session
            .ensure_authenticated()
            .await
            .context("Failed to authenticate for notification poll")?;
        let notifications = match self.fetch_notifications(&session).await {
            Ok(notifications) => notifications,
            Err(e) => {
                if e.is_auth() {
                    self.session.invalidate().await;
                }
                return Err(e).context("Failed to list notifications");
            }
        };

        let checkpoint = self.dedup.checkpoint();
        // Items older than this can no longer land in a tracked thread.
        let retry_horizon = self.thread_cutoff();
        let mut watermark = Watermark::default();
        let mut replied = 0usize;

        for notification in notifications {
            if self.shutdown.is_shutting_down() {
                tracing::info!("Shutdown in progress, ending notification poll early");
                break;
            }

            let indexed_at = notification.indexed_at;
            let decision =
                self.planner
                    .evaluate_against(&notification, &session.account_id, checkpoint);
            match decision {
                ReplyDecision::Accept => {}
                ReplyDecision::AlreadyProcessed => {
                    if self.dedup.is_claimed(&notification.id) {
                        watermark.open(indexed_at);
                    } else {
                        watermark.answered(indexed_at);
                    }
                    continue;
                }
                _ => {
                    if notification.category.is_conversational() {
                        tracing::debug!("Skipping {}: {}", notification.id, decision.reason());
                    }
                    continue;
                }
            }

            if !self.dedup.try_claim(&notification.id) {
                tracing::debug!("{} is already being answered elsewhere", notification.id);
                watermark.open(indexed_at);
                continue;
            }

            let comment_id = notification.id.clone();
            match self.handle_comment(&session, notification).await {
                Ok(Handled::Replied) => {
                    self.dedup.confirm(&comment_id);
                    replied += 1;
                    watermark.answered(indexed_at);
                }
                Ok(Handled::QueuedToneChange) => {
                    // The claim stays in place until the tone worker finishes.
                    watermark.open(indexed_at);
                }
                Err(e) if e.was_submitted() => {
                    self.dedup.confirm(&comment_id);
                    replied += 1;
                    watermark.answered(indexed_at);
                    tracing::warn!("Reply to {} went out unconfirmed: {}", comment_id, e);
                    self.emit(AgentEvent::Error(format!(
                        "Reply to {} could not be confirmed: {}",
                        comment_id, e
                    )));
                }
                Err(AgentError::OrphanReply { comment_id, reason }) => {
                    self.dedup.release(&comment_id);
                    tracing::debug!("{} not actionable yet: {}", comment_id, reason);
                    if indexed_at > retry_horizon {
                        watermark.open(indexed_at);
                    }
                }
                Err(e) => {
                    self.dedup.release(&comment_id);
                    tracing::warn!("Failed to answer {}: {}", comment_id, e);
                    self.emit(AgentEvent::Error(format!(
                        "Reply to {} failed: {}",
                        comment_id, e
                    )));
                    if indexed_at > retry_horizon {
                        watermark.open(indexed_at);
                    }
                }
            }
        }

        if let Some(next) = watermark.next_checkpoint() {
            self.dedup.advance_checkpoint(next);
        }
        if replied > 0 {
            tracing::info!("Answered {} comment(s) this poll", replied);
        }
        Ok(())
    }

    async fn fetch_notifications(&self, session: &Session) -> crate::error::Result<Vec<Notification>> {
        self.backoff
            .retry("listNotifications", || async move {
                self.limiter.acquire(CallKind::NotificationFetch).await;
                self.api.list_notifications(session).await
            })
            .await
    }

    async fn handle_comment(
        &self,
        session: &Session,
        notification: Notification,
    ) -> crate::error::Result<Handled> {
        let notification = self.hydrate(session, notification).await;
        let target = self.planner.build_reply_target(&notification)?;

        if let CommentIntent::ToneChange(tone) = CommentIntent::classify(&notification.text) {
            tracing::info!(
                "@{} asked for a {} tone, queueing for the tone worker",
                notification.author_handle,
                tone
            );
            let job = ToneJob {
                notification,
                target,
                tone,
            };
            return match self.tone_tx.send(job) {
                Ok(()) => Ok(Handled::QueuedToneChange),
                Err(flume::SendError(job)) => {
                    tracing::warn!("Tone queue closed, handling tone change inline");
                    self.apply_tone_job(job).await.map(|_| Handled::Replied)
                }
            };
        }

        let text = self
            .planner
            .generate_reply_text(&notification.text, notification.is_mention())
            .await;
        let post = self.pipeline.publish(&text, Some(&target)).await?;

        self.emit(AgentEvent::ActionTaken {
            action: "reply".to_string(),
            result: format!(
                "Answered @{} ({}) with {}",
                notification.author_handle, notification.id, post.id
            ),
        });
        Ok(Handled::Replied)
    }

    /// Fill in missing reply refs for a reply notification from the thread
    /// view. Failures leave the notification unchanged.
    async fn hydrate(&self, session: &Session, mut notification: Notification) -> Notification {
        if notification.category != NotificationCategory::Reply || notification.root.is_some() {
            return notification;
        }

        self.limiter.acquire(CallKind::ContentLookup).await;
        match self
            .api
            .get_thread(session, &notification.id, HYDRATE_REPLY_DEPTH)
            .await
        {
            Ok(view) => {
                if let Some(parent) = view.parent.as_deref() {
                    notification.parent = Some(parent.post.clone());
                    notification.root = Some(view.topmost().post.clone());
                }
            }
            Err(e) => {
                tracing::debug!("Could not load thread for {}: {}", notification.id, e);
            }
        }
        notification
    }
}

pub struct NotificationWorker {
    agent: Arc<Agent>,
}

impl NotificationWorker {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Worker for NotificationWorker {
    fn name(&self) -> &str {
        "notifications"
    }

    async fn run_once(&self) -> Result<()> {
        self.agent.poll_notifications().await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{harness, test_config, Harness};
    use super::*;
    use crate::registry::Thread;
    use crate::social::{PostRef, ThreadView};
    use crate::testing::{article, mention_notification, reply_notification, FakeGenerator, FakeNews};
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    async fn with_thread() -> (Harness, PostRef) {
        let news = FakeNews::with_articles(vec![article("Root story", "AP")]);
        let h = harness(test_config(), news, FakeGenerator::echo("Generated."));
        h.agent.publish_cycle().await.unwrap();
        let root = h.api.posts()[0].post.clone();
        (h, root)
    }

    fn replies(h: &Harness) -> usize {
        h.api.posts().iter().filter(|p| p.reply.is_some()).count()
    }

    #[tokio::test]
    async fn answers_first_level_reply_once() {
        let (h, root) = with_thread().await;
        h.api.set_notifications(vec![reply_notification(
            "at://alice/post/1",
            "did:plc:alice",
            "Nice one",
            &root,
            &root,
            Utc::now(),
        )]);

        h.agent.poll_notifications().await.unwrap();
        h.agent.poll_notifications().await.unwrap();

        let posts = h.api.posts();
        assert_eq!(posts.len(), 2);
        let reply = posts[1].reply.as_ref().unwrap();
        assert_eq!(reply.root(), root);
        assert_eq!(reply.parent(), root);
        assert!(h.agent.dedup().contains("at://alice/post/1"));
    }

    #[tokio::test]
    async fn overlapping_polls_reply_at_most_once() {
        let (h, root) = with_thread().await;
        h.api.set_post_delay(Duration::from_millis(30));
        h.api.set_notifications(vec![reply_notification(
            "at://alice/post/1",
            "did:plc:alice",
            "Hello?",
            &root,
            &root,
            Utc::now(),
        )]);

        let (a, b) = tokio::join!(
            h.agent.poll_notifications(),
            h.agent.poll_notifications()
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(replies(&h), 1);
    }

    #[tokio::test]
    async fn ignores_own_posts_and_non_conversational_items() {
        let (h, root) = with_thread().await;
        let mut own = reply_notification("at://bot/post/9", "did:plc:bot", "me", &root, &root, Utc::now());
        own.author_id = "did:plc:bot".to_string();
        let mut like = reply_notification("at://alice/like/1", "did:plc:alice", "", &root, &root, Utc::now());
        like.category = NotificationCategory::Like;
        h.api.set_notifications(vec![own, like]);

        h.agent.poll_notifications().await.unwrap();
        assert_eq!(replies(&h), 0);
    }

    #[tokio::test]
    async fn second_level_reply_answers_intermediate_post() {
        let (h, root) = with_thread().await;
        let intermediate = PostRef::new("at://alice/post/1", "cid-alice-1");
        h.api.set_notifications(vec![reply_notification(
            "at://carol/post/2",
            "did:plc:carol",
            "Agreed with alice",
            &root,
            &intermediate,
            Utc::now(),
        )]);

        h.agent.poll_notifications().await.unwrap();

        let reply = h.api.posts()[1].reply.clone().unwrap();
        assert_eq!(reply.root(), root);
        assert_eq!(reply.parent(), intermediate);
    }

    #[tokio::test]
    async fn orphan_reply_is_released_for_a_later_poll() {
        let (h, _root) = with_thread().await;
        let foreign = PostRef::new("at://someone/post/1", "cid-x");
        h.api.set_notifications(vec![reply_notification(
            "at://alice/post/5",
            "did:plc:alice",
            "hi",
            &foreign,
            &foreign,
            Utc::now(),
        )]);

        h.agent.poll_notifications().await.unwrap();

        assert_eq!(replies(&h), 0);
        assert!(!h.agent.dedup().contains("at://alice/post/5"));
        assert!(h.agent.dedup().checkpoint().is_none());
    }

    #[tokio::test]
    async fn untracked_mention_gets_self_rooted_reply() {
        let h = harness(test_config(), FakeNews::default(), FakeGenerator::echo("Hi!"));
        let mention = mention_notification("at://alice/post/7", "did:plc:alice", "@bot hey", Utc::now());
        h.api.set_notifications(vec![mention.clone()]);

        h.agent.poll_notifications().await.unwrap();

        let posts = h.api.posts();
        assert_eq!(posts.len(), 1);
        let reply = posts[0].reply.as_ref().unwrap();
        assert_eq!(reply.root(), mention.post_ref());
        assert_eq!(reply.parent(), mention.post_ref());
        assert!(h.generator.prompts().iter().any(|p| p.contains("mentioned you")));
    }

    #[tokio::test]
    async fn checkpoint_skips_older_notifications() {
        let mut config = test_config();
        config.reply_to_backlog = false;
        let news = FakeNews::with_articles(vec![article("Root story", "AP")]);
        let h = harness(config, news, FakeGenerator::echo("Generated."));
        h.agent.publish_cycle().await.unwrap();
        let root = h.api.posts()[0].post.clone();

        h.api.set_notifications(vec![
            reply_notification("old", "did:plc:alice", "old", &root, &root, Utc::now() - ChronoDuration::hours(1)),
            reply_notification("new", "did:plc:alice", "new", &root, &root, Utc::now() + ChronoDuration::seconds(5)),
        ]);

        h.agent.poll_notifications().await.unwrap();

        assert_eq!(replies(&h), 1);
        assert!(h.agent.dedup().contains("new"));
        assert!(!h.agent.dedup().contains("old"));
    }

    #[tokio::test]
    async fn hydrates_reply_refs_from_thread_view() {
        let (h, root) = with_thread().await;
        let mut comment = reply_notification("at://alice/post/3", "did:plc:alice", "hi", &root, &root, Utc::now());
        comment.root = None;
        comment.parent = None;
        h.api.set_notifications(vec![comment]);
        h.api.insert_thread(ThreadView {
            post: PostRef::new("at://alice/post/3", "cid-at://alice/post/3"),
            author_id: "did:plc:alice".to_string(),
            text: "hi".to_string(),
            parent: Some(Box::new(ThreadView {
                post: root.clone(),
                author_id: "did:plc:bot".to_string(),
                text: String::new(),
                parent: None,
                replies: Vec::new(),
            })),
            replies: Vec::new(),
        });

        h.agent.poll_notifications().await.unwrap();

        let reply = h.api.posts()[1].reply.clone().unwrap();
        assert_eq!(reply.root(), root);
        assert_eq!(reply.parent(), root);
    }

    #[tokio::test]
    async fn tone_change_is_left_for_tone_worker() {
        let (h, root) = with_thread().await;
        h.api.set_notifications(vec![reply_notification(
            "at://alice/post/4",
            "did:plc:alice",
            "Please change the tone to formal",
            &root,
            &root,
            Utc::now(),
        )]);

        h.agent.poll_notifications().await.unwrap();

        assert_eq!(replies(&h), 0);
        assert_eq!(h.agent.pending_tone_jobs(), 1);
        assert!(h.agent.dedup().contains("at://alice/post/4"));
    }

    #[tokio::test]
    async fn unconfirmed_reply_counts_as_answered() {
        let (h, root) = with_thread().await;
        h.api.make_posts_never_visible();
        h.api.set_notifications(vec![reply_notification(
            "at://alice/post/1",
            "did:plc:alice",
            "Nice one",
            &root,
            &root,
            Utc::now(),
        )]);

        for _ in 0..3 {
            h.agent.poll_notifications().await.unwrap();
        }

        assert_eq!(replies(&h), 1);
        assert!(h.agent.dedup().contains("at://alice/post/1"));
        assert!(!h.agent.dedup().is_claimed("at://alice/post/1"));
    }

    #[tokio::test]
    async fn older_orphan_in_mixed_batch_is_answered_once_its_root_is_known() {
        let mut config = test_config();
        config.reply_to_backlog = false;
        let news = FakeNews::with_articles(vec![article("Root story", "AP")]);
        let h = harness(config, news, FakeGenerator::echo("Generated."));
        h.agent.publish_cycle().await.unwrap();
        let root = h.api.posts()[0].post.clone();
        let late_root = PostRef::new("at://did:plc:bot/app.bsky.feed.post/late", "cid-late");
        let at = Utc::now() + ChronoDuration::seconds(5);

        // Newest first, as the service returns them.
        h.api.set_notifications(vec![
            reply_notification("newer", "did:plc:alice", "hi", &root, &root, at + ChronoDuration::seconds(1)),
            reply_notification("older", "did:plc:carol", "hey", &late_root, &late_root, at),
        ]);

        h.agent.poll_notifications().await.unwrap();
        assert_eq!(replies(&h), 1);
        assert!(h.agent.dedup().checkpoint().unwrap() < at);

        h.agent.registry().record(Thread::new(late_root.clone(), Utc::now()));
        h.agent.poll_notifications().await.unwrap();

        assert_eq!(replies(&h), 2);
        let answered = h.api.posts()[2].reply.clone().unwrap();
        assert_eq!(answered.root(), late_root);
        assert!(h.agent.dedup().contains("newer"));
        assert!(h.agent.dedup().contains("older"));

        // Everything answered, so the watermark catches up.
        h.agent.poll_notifications().await.unwrap();
        assert_eq!(replies(&h), 2);
        assert_eq!(h.agent.dedup().checkpoint(), Some(at + ChronoDuration::seconds(1)));
    }

    #[test]
    fn watermark_stops_below_oldest_open_item() {
        let base = Utc::now();
        let mut watermark = Watermark::default();
        watermark.answered(base + ChronoDuration::seconds(3));
        watermark.open(base + ChronoDuration::seconds(2));
        watermark.answered(base + ChronoDuration::seconds(1));
        watermark.open(base + ChronoDuration::seconds(4));

        assert_eq!(watermark.next_checkpoint(), Some(base + ChronoDuration::seconds(1)));
        assert_eq!(Watermark::default().next_checkpoint(), None);
    }
}
