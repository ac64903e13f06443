use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use super::{Agent, AgentEvent};
use crate::social::{Notification, PendingReply};
use crate::supervisor::Worker;

/// A "change the tone" comment waiting to be answered.
#[derive(Debug, Clone)]
pub struct ToneJob {
    pub notification: Notification,
    pub target: PendingReply,
    pub tone: String,
}

impl Agent {
    /// Answer every queued tone-change request. A job whose reply was
    /// submitted keeps its comment marked as answered; anything that failed
    /// before submission releases the claim so a later poll picks it up again.
    pub async fn process_tone_queue(&self) -> Result<()> {
        let jobs: Vec<ToneJob> = self.tone_rx.try_iter().collect();
        if jobs.is_empty() {
            return Ok(());
        }

        tracing::info!("Processing {} tone change request(s)", jobs.len());
        for job in jobs {
            let comment_id = job.notification.id.clone();
            if self.shutdown.is_shutting_down() {
                self.dedup.release(&comment_id);
                continue;
            }
            match self.apply_tone_job(job).await {
                Ok(()) => self.dedup.confirm(&comment_id),
                Err(e) if e.was_submitted() => {
                    self.dedup.confirm(&comment_id);
                    tracing::warn!("Tone change reply to {} went out unconfirmed: {}", comment_id, e);
                    self.emit(AgentEvent::Error(format!(
                        "Tone change reply to {} could not be confirmed: {}",
                        comment_id, e
                    )));
                }
                Err(e) => {
                    self.dedup.release(&comment_id);
                    tracing::warn!("Tone change for {} failed: {}", comment_id, e);
                    self.emit(AgentEvent::Error(format!(
                        "Tone change reply to {} failed: {}",
                        comment_id, e
                    )));
                }
            }
        }
        Ok(())
    }

    /// Rewrite the latest post in the requested tone, make that tone stick for
    /// future posts, and reply with the rewrite.
    pub(super) async fn apply_tone_job(&self, job: ToneJob) -> crate::error::Result<()> {
        let text = self
            .planner
            .generate_reply_text(&job.notification.text, job.notification.is_mention())
            .await;
        self.content.set_tone_override(Some(job.tone.clone()));

        let post = self.pipeline.publish(&text, Some(&job.target)).await?;
        self.emit(AgentEvent::ActionTaken {
            action: "tone".to_string(),
            result: format!(
                "Switched to a {} tone for @{}, replied with {}",
                job.tone, job.notification.author_handle, post.id
            ),
        });
        Ok(())
    }
}

pub struct ToneWorker {
    agent: Arc<Agent>,
}

impl ToneWorker {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Worker for ToneWorker {
    fn name(&self) -> &str {
        "tone"
    }

    async fn run_once(&self) -> Result<()> {
        self.agent.process_tone_queue().await
    }
}
