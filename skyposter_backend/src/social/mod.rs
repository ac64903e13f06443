//! The social network as seen by the agent.
//!
//! The engine only talks to the network through [`SocialApi`]; the Bluesky
//! adapter lives in [`bluesky`] and tests substitute an in-memory fake.

pub mod bluesky;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// An authenticated session: bearer token plus the account it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub account_id: String,
}

/// A post address: the post id (AT URI) together with the content id (CID)
/// of the exact version being referenced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PostRef {
    pub id: String,
    pub content_id: String,
}

impl PostRef {
    pub fn new(id: impl Into<String>, content_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content_id: content_id.into(),
        }
    }
}

/// Everything needed to attach a new post below an existing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReply {
    pub root_id: String,
    pub root_content_id: String,
    pub parent_id: String,
    pub parent_content_id: String,
}

impl PendingReply {
    pub fn new(root: &PostRef, parent: &PostRef) -> Self {
        Self {
            root_id: root.id.clone(),
            root_content_id: root.content_id.clone(),
            parent_id: parent.id.clone(),
            parent_content_id: parent.content_id.clone(),
        }
    }

    pub fn root(&self) -> PostRef {
        PostRef::new(&self.root_id, &self.root_content_id)
    }

    pub fn parent(&self) -> PostRef {
        PostRef::new(&self.parent_id, &self.parent_content_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationCategory {
    Reply,
    Mention,
    Like,
    Repost,
    Follow,
    Quote,
    Other,
}

impl NotificationCategory {
    pub fn from_reason(reason: &str) -> Self {
        match reason {
            "reply" => Self::Reply,
            "mention" => Self::Mention,
            "like" => Self::Like,
            "repost" => Self::Repost,
            "follow" => Self::Follow,
            "quote" => Self::Quote,
            _ => Self::Other,
        }
    }

    pub fn is_conversational(self) -> bool {
        matches!(self, Self::Reply | Self::Mention)
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    /// Id of the post that triggered the notification (the comment itself)
    pub id: String,
    pub content_id: String,
    pub author_id: String,
    pub author_handle: String,
    pub category: NotificationCategory,
    pub indexed_at: DateTime<Utc>,
    pub text: String,
    /// Reply refs carried by the comment record, when it is a reply
    pub root: Option<PostRef>,
    pub parent: Option<PostRef>,
}

impl Notification {
    pub fn post_ref(&self) -> PostRef {
        PostRef::new(&self.id, &self.content_id)
    }

    pub fn is_mention(&self) -> bool {
        self.category == NotificationCategory::Mention
    }
}

/// A post with as much surrounding conversation as the remote returned.
#[derive(Debug, Clone)]
pub struct ThreadView {
    pub post: PostRef,
    pub author_id: String,
    pub text: String,
    pub parent: Option<Box<ThreadView>>,
    pub replies: Vec<ThreadView>,
}

impl ThreadView {
    /// Walk the parent chain to the topmost post that was returned.
    pub fn topmost(&self) -> &ThreadView {
        let mut current = self;
        while let Some(parent) = current.parent.as_deref() {
            current = parent;
        }
        current
    }
}

/// Public counters of an account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub handle: String,
    pub display_name: Option<String>,
    pub followers: u64,
    pub follows: u64,
    pub posts: u64,
}

/// A post from an account's own feed with its engagement counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPost {
    pub post: PostRef,
    pub text: String,
    pub like_count: u64,
    pub repost_count: u64,
    pub indexed_at: DateTime<Utc>,
}

/// One page of an author feed, newest first.
#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub posts: Vec<FeedPost>,
    /// Where the next (older) page starts; `None` on the last page
    pub cursor: Option<String>,
}

#[async_trait]
pub trait SocialApi: Send + Sync {
    async fn authenticate(&self, identifier: &str, secret: &str) -> Result<Session>;

    /// Create a post (or a reply when `reply` is set). Returns the new post id.
    async fn create_post(
        &self,
        session: &Session,
        text: &str,
        reply: Option<&PendingReply>,
    ) -> Result<String>;

    /// Fetch the content id of a post. Fails with `ContentUnavailable` while
    /// the post is not yet visible.
    async fn resolve_content_id(&self, session: &Session, post_id: &str) -> Result<String>;

    async fn list_notifications(&self, session: &Session) -> Result<Vec<Notification>>;

    async fn get_thread(&self, session: &Session, post_id: &str, depth: u32)
        -> Result<ThreadView>;

    async fn get_profile(&self, session: &Session, actor: &str) -> Result<Profile>;

    /// Posts authored by `actor` (reposts excluded), starting at `cursor`.
    async fn get_author_feed(
        &self,
        session: &Session,
        actor: &str,
        cursor: Option<&str>,
    ) -> Result<FeedPage>;
}
