//! What the agent says: article selection, post rendering, tone rewrites.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::llm_client::TextGenerator;
use crate::news::{Article, NewsSource};

const ELLIPSIS: char = '…';
const RECENT_TITLE_MEMORY: usize = 500;

#[derive(Default)]
struct ContentState {
    /// Body of the most recently rendered post, before attribution
    last_body: Option<String>,
    tone_override: Option<String>,
    recent_titles: HashSet<String>,
    recent_order: VecDeque<String>,
}

impl ContentState {
    fn remember_title(&mut self, title: &str) {
        let key = title_key(title);
        if self.recent_titles.insert(key.clone()) {
            self.recent_order.push_back(key);
        }
        while self.recent_order.len() > RECENT_TITLE_MEMORY {
            if let Some(old) = self.recent_order.pop_front() {
                self.recent_titles.remove(&old);
            }
        }
    }
}

pub struct ContentSource {
    news: Arc<dyn NewsSource>,
    generator: Arc<dyn TextGenerator>,
    topics: Vec<String>,
    char_limit: usize,
    state: Mutex<ContentState>,
}

impl ContentSource {
    pub fn new(
        news: Arc<dyn NewsSource>,
        generator: Arc<dyn TextGenerator>,
        topics: Vec<String>,
        char_limit: usize,
    ) -> Self {
        Self {
            news,
            generator,
            topics,
            char_limit,
            state: Mutex::new(ContentState::default()),
        }
    }

    pub fn char_limit(&self) -> usize {
        self.char_limit
    }

    pub fn news(&self) -> &Arc<dyn NewsSource> {
        &self.news
    }

    pub fn generator(&self) -> &Arc<dyn TextGenerator> {
        &self.generator
    }

    /// Next unpublished article for the configured topics, or `None` when the
    /// source is unreachable or nothing new matches.
    pub async fn next_article(&self) -> Option<Article> {
        self.next_articles(1).await.into_iter().next()
    }

    /// Up to `count` unpublished articles, reserved so a concurrent call does
    /// not pick the same ones.
    pub async fn next_articles(&self, count: usize) -> Vec<Article> {
        let articles = match self.news.search(&self.topics).await {
            Ok(articles) => articles,
            Err(e) => {
                tracing::warn!("News search for {:?} failed: {}", self.topics, e);
                return Vec::new();
            }
        };

        let mut state = self.lock();
        let mut picked = Vec::new();
        for article in articles {
            if picked.len() >= count {
                break;
            }
            if state.recent_titles.contains(&title_key(&article.title)) {
                continue;
            }
            state.remember_title(&article.title);
            picked.push(article);
        }

        if picked.is_empty() {
            tracing::info!("No new articles for topics {:?}", self.topics);
        }
        picked
    }

    /// Turn an article into post text that fits the platform limit.
    ///
    /// The generated body is truncated first; the ` (via {source})` suffix is
    /// then appended only if it still fits. Generation failures fall back to a
    /// static summary built from the article itself.
    pub async fn render(&self, article: &Article, tone_override: Option<&str>) -> String {
        let tone = tone_override
            .map(str::to_string)
            .or_else(|| self.tone_override());
        let prompt = build_post_prompt(article, tone.as_deref());

        let body = match self.generator.generate(&prompt).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                tracing::warn!("Generation returned empty text for {:?}", article.title);
                fallback_body(article)
            }
            Err(e) => {
                tracing::warn!("Generation failed for {:?}: {}", article.title, e);
                fallback_body(article)
            }
        };

        let suffix = attribution_suffix(&article.source_name);
        let text = compose_post(&body, &suffix, self.char_limit);
        self.lock().last_body = Some(body);
        text
    }

    /// Regenerate the most recent post body in another tone. `None` if
    /// nothing has been rendered yet or generation failed.
    pub async fn rewrite_in_tone(&self, tone: &str) -> Option<String> {
        let last_body = self.lock().last_body.clone()?;
        let prompt = format!(
            "Rewrite the following social media post in a {} tone. \
             Keep the facts, keep it under {} characters, reply with the post text only.\n\n{}",
            tone, self.char_limit, last_body
        );

        match self.generator.generate(&prompt).await {
            Ok(text) if !text.trim().is_empty() => {
                let rewritten = truncate_chars(text.trim(), self.char_limit);
                self.lock().last_body = Some(rewritten.clone());
                Some(rewritten)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Tone rewrite ({}) failed: {}", tone, e);
                None
            }
        }
    }

    pub fn last_body(&self) -> Option<String> {
        self.lock().last_body.clone()
    }

    /// Tone applied to future posts until changed again.
    pub fn set_tone_override(&self, tone: Option<String>) {
        self.lock().tone_override = tone;
    }

    pub fn tone_override(&self) -> Option<String> {
        self.lock().tone_override.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContentState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn title_key(title: &str) -> String {
    title.trim().to_lowercase()
}

fn build_post_prompt(article: &Article, tone: Option<&str>) -> String {
    let mut prompt = format!(
        "Write a short social media post about this news story.\n\
         Title: {}\n\
         Summary: {}\n\
         Do not include links, hashtags or the source name. Reply with the post text only.",
        article.title, article.description
    );
    if let Some(tone) = tone {
        prompt.push_str(&format!("\nUse a {} tone.", tone));
    }
    prompt
}

fn fallback_body(article: &Article) -> String {
    if article.description.is_empty() {
        format!("Worth a read: {}", article.title)
    } else {
        format!("{}: {}", article.title, article.description)
    }
}

pub fn attribution_suffix(source_name: &str) -> String {
    format!(" (via {})", source_name)
}

/// Truncate `body` to leave room for `suffix`, then append it. If even the
/// suffix alone cannot fit next to a minimal body, the suffix is dropped and
/// the body gets the whole budget.
pub fn compose_post(body: &str, suffix: &str, limit: usize) -> String {
    const MIN_BODY: usize = 16;

    let suffix_len = suffix.chars().count();
    if suffix_len + MIN_BODY <= limit {
        let mut text = truncate_chars(body, limit - suffix_len);
        text.push_str(suffix);
        text
    } else {
        truncate_chars(body, limit)
    }
}

/// Cut to at most `limit` chars, ending on a word boundary with an ellipsis
/// when something had to go.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    if limit == 0 {
        return String::new();
    }

    let kept: String = text.chars().take(limit - 1).collect();
    let trimmed = match kept.rfind(char::is_whitespace) {
        Some(idx) if idx > kept.len() / 2 => kept[..idx].trim_end(),
        _ => kept.trim_end(),
    };
    format!("{}{}", trimmed, ELLIPSIS)
}
