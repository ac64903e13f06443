use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use super::{Agent, AgentEvent};
use crate::registry::Thread;
use crate::social::PendingReply;
use crate::supervisor::Worker;

impl Agent {
    /// One publishing round: a root post for the first fresh article, then
    /// each further article chained as a reply to the previous post.
    pub async fn publish_cycle(&self) -> Result<()> {
        let expired = self.registry.expire(self.thread_cutoff());
        if expired > 0 {
            tracing::info!("Stopped tracking {} expired thread(s)", expired);
        }

        let articles = self.content.next_articles(self.articles_per_thread).await;
        let Some((first, rest)) = articles.split_first() else {
            self.emit(AgentEvent::Observation(
                "Nothing new to post this cycle".to_string(),
            ));
            return Ok(());
        };

        let text = self.content.render(first, None).await;
        let root = self
            .pipeline
            .publish(&text, None)
            .await
            .with_context(|| format!("Failed to publish thread root for {:?}", first.title))?;

        self.registry.record(Thread::new(root.clone(), Utc::now()));
        self.emit(AgentEvent::ActionTaken {
            action: "publish".to_string(),
            result: format!("Started thread {} about {:?}", root.id, first.title),
        });

        let mut parent = root.clone();
        for article in rest {
            if self.shutdown.is_shutting_down() {
                tracing::info!("Shutdown in progress, leaving thread {} short", root.id);
                break;
            }

            let text = self.content.render(article, None).await;
            let reply = PendingReply::new(&root, &parent);
            match self.pipeline.publish(&text, Some(&reply)).await {
                Ok(post) => {
                    tracing::debug!("Chained {:?} onto {}", article.title, parent.id);
                    parent = post;
                }
                Err(e) => {
                    // The root is already out; the thread just ends early.
                    self.emit(AgentEvent::Error(format!(
                        "Could not extend thread {} with {:?}: {}",
                        root.id, article.title, e
                    )));
                    break;
                }
            }
        }

        Ok(())
    }
}

pub struct PublisherWorker {
    agent: Arc<Agent>,
}

impl PublisherWorker {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Worker for PublisherWorker {
    fn name(&self) -> &str {
        "publisher"
    }

    async fn run_once(&self) -> Result<()> {
        self.agent.publish_cycle().await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{harness, test_config};
    use super::*;
    use crate::testing::{article, FakeGenerator, FakeNews};

    #[tokio::test]
    async fn three_articles_become_one_chained_thread() {
        let news = FakeNews::with_articles(vec![
            article("First", "AP"),
            article("Second", "BBC"),
            article("Third", "Reuters"),
        ]);
        let h = harness(test_config(), news, FakeGenerator::echo("Generated post."));

        h.agent.publish_cycle().await.unwrap();

        let posts = h.api.posts();
        assert_eq!(posts.len(), 3);
        let root = posts[0].post.clone();
        assert!(posts[0].reply.is_none());
        assert!(posts[0].text.ends_with(" (via AP)"));

        let second = posts[1].reply.as_ref().unwrap();
        assert_eq!(second.root(), root);
        assert_eq!(second.parent(), root);

        let third = posts[2].reply.as_ref().unwrap();
        assert_eq!(third.root(), root);
        assert_eq!(third.parent(), posts[1].post);

        assert_eq!(h.agent.registry().len(), 1);
        assert_eq!(
            h.agent.registry().get(&root.id).unwrap().root_content_id(),
            root.content_id
        );
        assert!(h
            .events
            .try_iter()
            .any(|e| matches!(e, AgentEvent::ActionTaken { ref action, .. } if action == "publish")));
    }

    #[tokio::test]
    async fn failed_root_records_no_thread() {
        let news = FakeNews::with_articles(vec![article("Only", "AP")]);
        let h = harness(test_config(), news, FakeGenerator::echo("Post."));
        h.api.fail_posts_transiently(10);

        assert!(h.agent.publish_cycle().await.is_err());
        assert!(h.agent.registry().is_empty());
    }

    #[tokio::test]
    async fn empty_source_is_not_an_error() {
        let h = harness(test_config(), FakeNews::unreachable(), FakeGenerator::echo("x"));

        h.agent.publish_cycle().await.unwrap();
        assert!(h.api.posts().is_empty());
        assert!(h
            .events
            .try_iter()
            .any(|e| matches!(e, AgentEvent::Observation(_))));
    }

    #[tokio::test]
    async fn published_articles_are_not_repeated() {
        let news = FakeNews::with_articles(vec![article("First", "AP"), article("Second", "BBC")]);
        let mut config = test_config();
        config.articles_per_thread = 1;
        let h = harness(config, news, FakeGenerator::echo("Post."));

        h.agent.publish_cycle().await.unwrap();
        h.agent.publish_cycle().await.unwrap();
        h.agent.publish_cycle().await.unwrap();

        assert_eq!(h.api.posts().len(), 2);
        assert_eq!(h.agent.registry().len(), 2);
    }
}
