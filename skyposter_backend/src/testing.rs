//! In-memory collaborators for unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::llm_client::TextGenerator;
use crate::news::{Article, NewsSource};
use crate::social::{
    FeedPage, FeedPost, Notification, NotificationCategory, PendingReply, PostRef, Profile,
    Session, SocialApi, ThreadView,
};

/// Feed pages served by the fake are this small so paging gets exercised.
const FAKE_FEED_PAGE: usize = 2;

pub fn article(title: &str, source: &str) -> Article {
    Article {
        title: title.to_string(),
        description: format!("What happened with {}", title.to_lowercase()),
        source_name: source.to_string(),
        url: None,
    }
}

pub fn reply_notification(
    id: &str,
    author: &str,
    text: &str,
    root: &PostRef,
    parent: &PostRef,
    indexed_at: DateTime<Utc>,
) -> Notification {
    Notification {
        id: id.to_string(),
        content_id: format!("cid-{}", id),
        author_id: author.to_string(),
        author_handle: format!("{}.test", author),
        category: NotificationCategory::Reply,
        indexed_at,
        text: text.to_string(),
        root: Some(root.clone()),
        parent: Some(parent.clone()),
    }
}

pub fn mention_notification(
    id: &str,
    author: &str,
    text: &str,
    indexed_at: DateTime<Utc>,
) -> Notification {
    Notification {
        id: id.to_string(),
        content_id: format!("cid-{}", id),
        author_id: author.to_string(),
        author_handle: format!("{}.test", author),
        category: NotificationCategory::Mention,
        indexed_at,
        text: text.to_string(),
        root: None,
        parent: None,
    }
}

// ========================================================================
// Social API
// ========================================================================

#[derive(Debug, Clone)]
pub struct CreatedPost {
    pub post: PostRef,
    pub text: String,
    pub reply: Option<PendingReply>,
}

#[derive(Default)]
struct FakeSocialState {
    auth_calls: u32,
    reject_logins: bool,
    token_generation: u32,
    expire_next_posts: u32,
    transient_post_failures: u32,
    content_lag: u32,
    lookup_attempts: HashMap<String, u32>,
    never_visible: bool,
    post_delay: Option<Duration>,
    posts: Vec<CreatedPost>,
    notifications: Vec<Notification>,
    threads: HashMap<String, ThreadView>,
    profile: Profile,
    feed: Vec<FeedPost>,
    feed_requests: u32,
}

pub struct FakeSocialApi {
    account_id: String,
    state: Mutex<FakeSocialState>,
}

impl FakeSocialApi {
    pub fn new(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            state: Mutex::new(FakeSocialState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeSocialState> {
        self.state.lock().unwrap()
    }

    pub fn auth_calls(&self) -> u32 {
        self.lock().auth_calls
    }

    pub fn reject_logins(&self, reject: bool) {
        self.lock().reject_logins = reject;
    }

    /// The next `n` post creations fail as if the token had expired.
    pub fn expire_token_for_next_posts(&self, n: u32) {
        self.lock().expire_next_posts = n;
    }

    pub fn fail_posts_transiently(&self, n: u32) {
        self.lock().transient_post_failures = n;
    }

    /// New posts only become resolvable after `n` failed lookups.
    pub fn set_content_lag(&self, n: u32) {
        self.lock().content_lag = n;
    }

    pub fn make_posts_never_visible(&self) {
        self.lock().never_visible = true;
    }

    pub fn set_post_delay(&self, delay: Duration) {
        self.lock().post_delay = Some(delay);
    }

    pub fn set_notifications(&self, notifications: Vec<Notification>) {
        self.lock().notifications = notifications;
    }

    pub fn insert_thread(&self, view: ThreadView) {
        self.lock().threads.insert(view.post.id.clone(), view);
    }

    pub fn set_profile(&self, profile: Profile) {
        self.lock().profile = profile;
    }

    /// Own posts served by the author feed, newest first.
    pub fn set_feed(&self, feed: Vec<FeedPost>) {
        self.lock().feed = feed;
    }

    pub fn feed_requests(&self) -> u32 {
        self.lock().feed_requests
    }

    pub fn posts(&self) -> Vec<CreatedPost> {
        self.lock().posts.clone()
    }

    fn check_token(&self, session: &Session) -> Result<()> {
        let state = self.lock();
        if session.access_token != format!("token-{}", state.token_generation) {
            return Err(AgentError::auth("stale token"));
        }
        Ok(())
    }
}

#[async_trait]
impl SocialApi for FakeSocialApi {
    async fn authenticate(&self, _identifier: &str, _secret: &str) -> Result<Session> {
        let mut state = self.lock();
        state.auth_calls += 1;
        if state.reject_logins {
            return Err(AgentError::auth("invalid identifier or password"));
        }
        state.token_generation += 1;
        Ok(Session {
            access_token: format!("token-{}", state.token_generation),
            account_id: self.account_id.clone(),
        })
    }

    async fn create_post(
        &self,
        session: &Session,
        text: &str,
        reply: Option<&PendingReply>,
    ) -> Result<String> {
        let delay = self.lock().post_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_token(session)?;

        let mut state = self.lock();
        if state.expire_next_posts > 0 {
            state.expire_next_posts -= 1;
            // Invalidate the current token so only a fresh login helps.
            state.token_generation += 1000;
            return Err(AgentError::auth("ExpiredToken"));
        }
        if state.transient_post_failures > 0 {
            state.transient_post_failures -= 1;
            return Err(AgentError::transient("createRecord", "502 bad gateway"));
        }

        let n = state.posts.len() + 1;
        let post = PostRef::new(
            format!("at://{}/app.bsky.feed.post/{}", self.account_id, n),
            format!("bafy-post-{}", n),
        );
        state.posts.push(CreatedPost {
            post: post.clone(),
            text: text.to_string(),
            reply: reply.cloned(),
        });
        Ok(post.id)
    }

    async fn resolve_content_id(&self, session: &Session, post_id: &str) -> Result<String> {
        self.check_token(session)?;
        let mut state = self.lock();
        if state.never_visible {
            return Err(AgentError::content_unavailable("not indexed"));
        }
        let lag = state.content_lag;
        let attempts = state.lookup_attempts.entry(post_id.to_string()).or_insert(0);
        *attempts += 1;
        if *attempts <= lag {
            return Err(AgentError::content_unavailable("not indexed yet"));
        }
        state
            .posts
            .iter()
            .find(|p| p.post.id == post_id)
            .map(|p| p.post.content_id.clone())
            .ok_or_else(|| AgentError::content_unavailable("unknown post"))
    }

    async fn list_notifications(&self, session: &Session) -> Result<Vec<Notification>> {
        self.check_token(session)?;
        Ok(self.lock().notifications.clone())
    }

    async fn get_thread(
        &self,
        session: &Session,
        post_id: &str,
        _depth: u32,
    ) -> Result<ThreadView> {
        self.check_token(session)?;
        self.lock()
            .threads
            .get(post_id)
            .cloned()
            .ok_or_else(|| AgentError::content_unavailable("thread not found"))
    }

    async fn get_profile(&self, session: &Session, _actor: &str) -> Result<Profile> {
        self.check_token(session)?;
        Ok(self.lock().profile.clone())
    }

    async fn get_author_feed(
        &self,
        session: &Session,
        _actor: &str,
        cursor: Option<&str>,
    ) -> Result<FeedPage> {
        self.check_token(session)?;
        let mut state = self.lock();
        state.feed_requests += 1;
        let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let end = (start + FAKE_FEED_PAGE).min(state.feed.len());
        let posts = state.feed.get(start..end).unwrap_or_default().to_vec();
        let cursor = (end < state.feed.len()).then(|| end.to_string());
        Ok(FeedPage { posts, cursor })
    }
}

pub fn feed_post(n: usize, text: &str, likes: u64, reposts: u64, indexed_at: DateTime<Utc>) -> FeedPost {
    FeedPost {
        post: PostRef::new(format!("at://did:plc:bot/app.bsky.feed.post/f{}", n), format!("bafy-f{}", n)),
        text: text.to_string(),
        like_count: likes,
        repost_count: reposts,
        indexed_at,
    }
}

// ========================================================================
// News + Generation
// ========================================================================

#[derive(Default)]
pub struct FakeNews {
    articles: Vec<Article>,
    unreachable: bool,
}

impl FakeNews {
    pub fn with_articles(articles: Vec<Article>) -> Self {
        Self {
            articles,
            ..Self::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl NewsSource for FakeNews {
    async fn search(&self, _topics: &[String]) -> Result<Vec<Article>> {
        if self.unreachable {
            return Err(AgentError::transient("news search", "connection refused"));
        }
        Ok(self.articles.clone())
    }
}

type Responder = Arc<dyn Fn(&str) -> Result<String> + Send + Sync>;

#[derive(Clone)]
pub struct FakeGenerator {
    responder: Responder,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl FakeGenerator {
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn echo(text: &str) -> Self {
        let text = text.to_string();
        Self::with_responder(move |_| Ok(text.clone()))
    }

    pub fn failing() -> Self {
        Self::with_responder(|_| Err(AgentError::generation("model offline")))
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        (self.responder)(prompt)
    }
}
