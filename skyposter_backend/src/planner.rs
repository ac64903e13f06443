//! Deciding whether to answer a comment, where the answer goes, and what it says.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::content::{truncate_chars, ContentSource};
use crate::dedup::DedupTracker;
use crate::error::{AgentError, Result};
use crate::registry::ThreadRegistry;
use crate::social::{Notification, PendingReply};

const NEWS_DESCRIPTION_CHARS: usize = 120;
const MAX_TOPIC_CHARS: usize = 60;

const NEWS_TRIGGERS: &[&str] = &[
    "what's new with",
    "whats new with",
    "what's new in",
    "what's new",
    "whats new",
    "any news about",
    "any news on",
    "any news",
    "latest news about",
    "latest news on",
    "latest news",
    "news about",
    "news on",
    "update me on",
    "what's happening with",
    "what's happening in",
    "what's happening",
];

/// Outcome of the reply filter, in the order the checks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDecision {
    Accept,
    SelfAuthored,
    NotConversational,
    BeforeCheckpoint,
    AlreadyProcessed,
}

impl ReplyDecision {
    pub fn is_accept(self) -> bool {
        self == ReplyDecision::Accept
    }

    pub fn reason(self) -> &'static str {
        match self {
            ReplyDecision::Accept => "accepted",
            ReplyDecision::SelfAuthored => "authored by the agent",
            ReplyDecision::NotConversational => "not a reply or mention",
            ReplyDecision::BeforeCheckpoint => "not newer than the checkpoint",
            ReplyDecision::AlreadyProcessed => "already answered",
        }
    }
}

/// What a comment is asking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommentIntent {
    ToneChange(String),
    /// Carries the text after the trigger phrase as a topic fallback.
    NewsRequest(String),
    Conversational,
}

impl CommentIntent {
    pub fn classify(text: &str) -> Self {
        if let Some(tone) = detect_tone_change(text) {
            return CommentIntent::ToneChange(tone);
        }
        if let Some(topic) = detect_news_request(text) {
            return CommentIntent::NewsRequest(topic);
        }
        CommentIntent::Conversational
    }
}

fn detect_tone_change(text: &str) -> Option<String> {
    let patterns = [
        r"(?i)\b(?:change|switch|set)\s+(?:the\s+|your\s+)?tone\s+(?:to\s+)?(?:be\s+)?(?:more\s+)?(?:a\s+|an\s+)?([a-z][a-z\- ]{1,40})",
        r"(?i)\bmake\s+(?:your|the)\s+(?:posts?|writing|tone)\s+(?:sound\s+)?more\s+([a-z][a-z\-]{1,30})",
        r"(?i)\b(?:can|could|would|will)\s+you\s+(?:please\s+)?(?:be|sound|write)\s+more\s+([a-z][a-z\-]{1,30})",
        r"(?i)\b(?:use|try|with)\s+(?:a|an)\s+(?:more\s+)?([a-z][a-z\-]{1,30})\s+tone\b",
    ];

    for pattern in &patterns {
        if let Ok(re) = regex_lite::Regex::new(pattern) {
            if let Some(caps) = re.captures(text) {
                if let Some(tone) = caps.get(1).map(|m| clean_tone(m.as_str())) {
                    if !tone.is_empty() {
                        return Some(tone);
                    }
                }
            }
        }
    }
    None
}

fn clean_tone(raw: &str) -> String {
    raw.split_whitespace()
        .take_while(|word| !matches!(*word, "please" | "and" | "for" | "from" | "tone"))
        .take(3)
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

fn detect_news_request(text: &str) -> Option<String> {
    let lowered = text.to_lowercase().replace('\u{2019}', "'");
    NEWS_TRIGGERS.iter().find_map(|trigger| {
        lowered.find(trigger).map(|idx| {
            let rest = &lowered[idx + trigger.len()..];
            clean_topic(rest)
        })
    })
}

fn clean_topic(raw: &str) -> String {
    let topic = raw
        .split(['?', '!', '.', '\n'])
        .next()
        .unwrap_or_default()
        .trim()
        .trim_start_matches("the ")
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '@' || c.is_whitespace());
    truncate_chars(topic, MAX_TOPIC_CHARS)
}

pub struct ReplyPlanner {
    registry: Arc<ThreadRegistry>,
    dedup: Arc<DedupTracker>,
    content: Arc<ContentSource>,
}

impl ReplyPlanner {
    pub fn new(
        registry: Arc<ThreadRegistry>,
        dedup: Arc<DedupTracker>,
        content: Arc<ContentSource>,
    ) -> Self {
        Self {
            registry,
            dedup,
            content,
        }
    }

    pub fn should_reply(&self, notification: &Notification, self_id: &str) -> bool {
        self.evaluate(notification, self_id).is_accept()
    }

    pub fn evaluate(&self, notification: &Notification, self_id: &str) -> ReplyDecision {
        self.evaluate_against(notification, self_id, self.dedup.checkpoint())
    }

    /// Same checks as [`evaluate`](Self::evaluate) against a checkpoint taken
    /// once at the start of a poll, so every item in a batch sees the same
    /// watermark.
    pub fn evaluate_against(
        &self,
        notification: &Notification,
        self_id: &str,
        checkpoint: Option<DateTime<Utc>>,
    ) -> ReplyDecision {
        if notification.author_id == self_id {
            return ReplyDecision::SelfAuthored;
        }
        if !notification.category.is_conversational() {
            return ReplyDecision::NotConversational;
        }
        if let Some(checkpoint) = checkpoint {
            if notification.indexed_at <= checkpoint {
                return ReplyDecision::BeforeCheckpoint;
            }
        }
        if self.dedup.contains(&notification.id) {
            return ReplyDecision::AlreadyProcessed;
        }
        ReplyDecision::Accept
    }

    /// Where a reply to `notification` attaches.
    ///
    /// Replies inside a thread the agent started keep that thread's root and
    /// answer the post the comment itself replied to. A mention outside any
    /// tracked thread becomes its own root. Anything else is orphaned.
    pub fn build_reply_target(&self, notification: &Notification) -> Result<PendingReply> {
        if let Some(root) = &notification.root {
            if let Some(thread) = self.registry.get(&root.id) {
                let parent = notification
                    .parent
                    .clone()
                    .unwrap_or_else(|| thread.root().clone());
                return Ok(PendingReply::new(thread.root(), &parent));
            }
        }

        if notification.is_mention() {
            let mentioned = notification.post_ref();
            return Ok(PendingReply::new(&mentioned, &mentioned));
        }

        let reason = match &notification.root {
            Some(root) => format!("root {} is not a tracked thread", root.id),
            None => "comment carries no reply root".to_string(),
        };
        Err(AgentError::OrphanReply {
            comment_id: notification.id.clone(),
            reason,
        })
    }

    /// Reply text for a comment. Never fails: every error path degrades to a
    /// static message that still fits the post limit.
    pub async fn generate_reply_text(&self, comment: &str, is_mention: bool) -> String {
        let limit = self.content.char_limit();
        let text = match CommentIntent::classify(comment) {
            CommentIntent::ToneChange(tone) => self.tone_reply(&tone).await,
            CommentIntent::NewsRequest(fallback_topic) => {
                self.news_reply(comment, &fallback_topic).await
            }
            CommentIntent::Conversational => self.conversational_reply(comment, is_mention).await,
        };
        truncate_chars(&text, limit)
    }

    async fn tone_reply(&self, tone: &str) -> String {
        match self.content.rewrite_in_tone(tone).await {
            Some(rewritten) => rewritten,
            None => format!("Noted! Future posts will take a more {} tone.", tone),
        }
    }

    async fn news_reply(&self, comment: &str, fallback_topic: &str) -> String {
        let topic = match self.extract_topic(comment).await {
            Some(topic) => topic,
            None if !fallback_topic.is_empty() => fallback_topic.to_string(),
            None => {
                return "Happy to share news! Which topic are you curious about?".to_string();
            }
        };

        let articles = match self.content.news().search(std::slice::from_ref(&topic)).await {
            Ok(articles) => articles,
            Err(e) => {
                tracing::warn!("News lookup for reply topic {:?} failed: {}", topic, e);
                return format!(
                    "I couldn't reach my news source for \"{}\" right now. Try me again later!",
                    topic
                );
            }
        };

        let Some(first) = articles.first() else {
            return format!("I couldn't find any recent news about \"{}\".", topic);
        };

        let mut text = first.title.clone();
        if !first.description.is_empty() {
            text.push_str(": ");
            text.push_str(&truncate_chars(&first.description, NEWS_DESCRIPTION_CHARS));
        }
        text.push_str(&format!(" (via {})", first.source_name));
        match articles.len() {
            0 | 1 => {}
            2 => text.push_str(" There's one more story on this, reply \"more\" to see it."),
            n => text.push_str(&format!(
                " There are {} more stories on this, reply \"more\" for another.",
                n - 1
            )),
        }
        text
    }

    async fn extract_topic(&self, comment: &str) -> Option<String> {
        let prompt = format!(
            "Which news topic is this message asking about? Answer with the topic only, \
             in at most four words, or NONE if there is no topic.\n\nMessage: {}",
            comment
        );
        match self.content.generator().generate(&prompt).await {
            Ok(raw) => {
                let topic = clean_topic(raw.lines().next().unwrap_or_default());
                if topic.is_empty() || topic.eq_ignore_ascii_case("none") {
                    None
                } else {
                    Some(topic)
                }
            }
            Err(e) => {
                tracing::debug!("Topic extraction failed, using trigger remainder: {}", e);
                None
            }
        }
    }

    async fn conversational_reply(&self, comment: &str, is_mention: bool) -> String {
        let limit = self.content.char_limit();
        let framing = if is_mention {
            "Someone mentioned you in their post"
        } else {
            "Someone replied to one of your posts"
        };
        let prompt = format!(
            "{}:\n\n\"{}\"\n\nWrite a short, friendly reply in under {} characters. \
             Reply with the text only.",
            framing, comment, limit
        );

        match self.content.generator().generate(&prompt).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => fallback_reply(comment, is_mention),
            Err(e) => {
                tracing::warn!("Reply generation failed: {}", e);
                fallback_reply(comment, is_mention)
            }
        }
    }
}

fn fallback_reply(comment: &str, is_mention: bool) -> String {
    if comment.trim_end().ends_with('?') {
        "Good question! I don't have a solid answer yet, but I'll keep an eye out.".to_string()
    } else if is_mention {
        "Thanks for the mention! Glad to be part of the conversation.".to_string()
    } else {
        "Thanks for the reply, appreciate you reading!".to_string()
    }
}
