use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    FeedPage, FeedPost, Notification, NotificationCategory, PendingReply, PostRef, Profile,
    Session, SocialApi, ThreadView,
};
use crate::error::{AgentError, Result};
use crate::http_client::build_http_client_with_timeout;

const POST_COLLECTION: &str = "app.bsky.feed.post";
const FEED_PAGE_SIZE: &str = "50";

// ========================================================================
// XRPC Types
// ========================================================================

#[derive(Debug, Serialize)]
struct CreateSessionInput<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionOutput {
    access_jwt: String,
    did: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StrongRef {
    uri: String,
    cid: String,
}

impl From<&PostRef> for StrongRef {
    fn from(post: &PostRef) -> Self {
        Self {
            uri: post.id.clone(),
            cid: post.content_id.clone(),
        }
    }
}

impl From<StrongRef> for PostRef {
    fn from(strong: StrongRef) -> Self {
        PostRef::new(strong.uri, strong.cid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplyRefs {
    root: StrongRef,
    parent: StrongRef,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostRecord {
    #[serde(rename = "$type", default)]
    record_type: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply: Option<ReplyRefs>,
}

#[derive(Debug, Serialize)]
struct CreateRecordInput<'a> {
    repo: &'a str,
    collection: &'a str,
    record: PostRecord,
}

#[derive(Debug, Deserialize)]
struct CreateRecordOutput {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct PostView {
    uri: String,
    cid: String,
    author: ProfileView,
    #[serde(default)]
    record: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GetPostsOutput {
    posts: Vec<PostView>,
}

#[derive(Debug, Deserialize)]
struct ProfileView {
    did: String,
    #[serde(default)]
    handle: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationView {
    uri: String,
    cid: String,
    author: ProfileView,
    reason: String,
    #[serde(default)]
    record: serde_json::Value,
    indexed_at: String,
}

#[derive(Debug, Deserialize)]
struct ListNotificationsOutput {
    notifications: Vec<NotificationView>,
}

#[derive(Debug, Deserialize)]
struct GetPostThreadOutput {
    thread: ThreadNode,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "$type")]
enum ThreadNode {
    #[serde(rename = "app.bsky.feed.defs#threadViewPost")]
    Post {
        post: PostView,
        #[serde(default)]
        parent: Option<Box<ThreadNode>>,
        #[serde(default)]
        replies: Vec<ThreadNode>,
    },
    #[serde(other)]
    Unavailable,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileViewDetailed {
    handle: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    followers_count: u64,
    #[serde(default)]
    follows_count: u64,
    #[serde(default)]
    posts_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedPostView {
    uri: String,
    cid: String,
    #[serde(default)]
    record: serde_json::Value,
    #[serde(default)]
    like_count: u64,
    #[serde(default)]
    repost_count: u64,
    indexed_at: String,
}

#[derive(Debug, Deserialize)]
struct FeedViewPost {
    post: FeedPostView,
    /// Set when the item is a repost rather than the author's own post
    #[serde(default)]
    reason: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GetAuthorFeedOutput {
    feed: Vec<FeedViewPost>,
    #[serde(default)]
    cursor: Option<String>,
}

// ========================================================================
// Bluesky Client
// ========================================================================

pub struct BlueskyClient {
    base_url: String,
    client: Client,
}

impl BlueskyClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: build_http_client_with_timeout(Some(Duration::from_secs(30))),
        }
    }

    fn xrpc(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.base_url, method)
    }

    async fn read_json<T>(operation: &str, response: reqwest::Response) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(match AgentError::from_status(operation, status, body) {
                AgentError::RateLimited { operation, .. } => AgentError::RateLimited {
                    operation,
                    retry_after,
                },
                other => other,
            });
        }

        response.json::<T>().await.map_err(|e| {
            AgentError::transient(operation, format!("failed to decode response: {}", e))
        })
    }
}

#[async_trait]
impl SocialApi for BlueskyClient {
    async fn authenticate(&self, identifier: &str, secret: &str) -> Result<Session> {
        let operation = "createSession";
        let response = self
            .client
            .post(self.xrpc("com.atproto.server.createSession"))
            .json(&CreateSessionInput {
                identifier,
                password: secret,
            })
            .send()
            .await
            .map_err(|e| AgentError::from_transport(operation, e))?;

        // A rejected login comes back as 401 or as 400 AuthenticationRequired.
        let output: CreateSessionOutput = match Self::read_json(operation, response).await {
            Err(AgentError::Rejected { status, body, .. }) => {
                return Err(AgentError::auth(format!(
                    "login for {} refused ({}): {}",
                    identifier, status, body
                )))
            }
            other => other?,
        };

        Ok(Session {
            access_token: output.access_jwt,
            account_id: output.did,
        })
    }

    async fn create_post(
        &self,
        session: &Session,
        text: &str,
        reply: Option<&PendingReply>,
    ) -> Result<String> {
        let operation = "createRecord";
        let record = PostRecord {
            record_type: Some(POST_COLLECTION.to_string()),
            text: text.to_string(),
            created_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            reply: reply.map(|r| ReplyRefs {
                root: StrongRef::from(&r.root()),
                parent: StrongRef::from(&r.parent()),
            }),
        };

        let response = self
            .client
            .post(self.xrpc("com.atproto.repo.createRecord"))
            .bearer_auth(&session.access_token)
            .json(&CreateRecordInput {
                repo: &session.account_id,
                collection: POST_COLLECTION,
                record,
            })
            .send()
            .await
            .map_err(|e| AgentError::from_transport(operation, e))?;

        let output: CreateRecordOutput = Self::read_json(operation, response).await?;
        Ok(output.uri)
    }

    async fn resolve_content_id(&self, session: &Session, post_id: &str) -> Result<String> {
        let operation = "getPosts";
        let response = self
            .client
            .get(self.xrpc("app.bsky.feed.getPosts"))
            .bearer_auth(&session.access_token)
            .query(&[("uris", post_id)])
            .send()
            .await
            .map_err(|e| AgentError::from_transport(operation, e))?;

        let output: GetPostsOutput = Self::read_json(operation, response).await?;
        output
            .posts
            .into_iter()
            .find(|post| post.uri == post_id)
            .map(|post| post.cid)
            .ok_or_else(|| {
                AgentError::content_unavailable(format!("post {} not yet indexed", post_id))
            })
    }

    async fn list_notifications(&self, session: &Session) -> Result<Vec<Notification>> {
        let operation = "listNotifications";
        let response = self
            .client
            .get(self.xrpc("app.bsky.notification.listNotifications"))
            .bearer_auth(&session.access_token)
            .query(&[("limit", "50")])
            .send()
            .await
            .map_err(|e| AgentError::from_transport(operation, e))?;

        let output: ListNotificationsOutput = Self::read_json(operation, response).await?;
        Ok(output
            .notifications
            .into_iter()
            .filter_map(convert_notification)
            .collect())
    }

    async fn get_thread(
        &self,
        session: &Session,
        post_id: &str,
        depth: u32,
    ) -> Result<ThreadView> {
        let operation = "getPostThread";
        let depth = depth.to_string();
        let response = self
            .client
            .get(self.xrpc("app.bsky.feed.getPostThread"))
            .bearer_auth(&session.access_token)
            .query(&[
                ("uri", post_id),
                ("depth", depth.as_str()),
                ("parentHeight", "80"),
            ])
            .send()
            .await
            .map_err(|e| AgentError::from_transport(operation, e))?;

        let output: GetPostThreadOutput = Self::read_json(operation, response).await?;
        convert_thread(output.thread).ok_or_else(|| {
            AgentError::content_unavailable(format!("thread {} is not viewable", post_id))
        })
    }

    async fn get_profile(&self, session: &Session, actor: &str) -> Result<Profile> {
        let operation = "getProfile";
        let response = self
            .client
            .get(self.xrpc("app.bsky.actor.getProfile"))
            .bearer_auth(&session.access_token)
            .query(&[("actor", actor)])
            .send()
            .await
            .map_err(|e| AgentError::from_transport(operation, e))?;

        let output: ProfileViewDetailed = Self::read_json(operation, response).await?;
        Ok(Profile {
            handle: output.handle,
            display_name: output.display_name,
            followers: output.followers_count,
            follows: output.follows_count,
            posts: output.posts_count,
        })
    }

    async fn get_author_feed(
        &self,
        session: &Session,
        actor: &str,
        cursor: Option<&str>,
    ) -> Result<FeedPage> {
        let operation = "getAuthorFeed";
        let mut query = vec![("actor", actor), ("limit", FEED_PAGE_SIZE)];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        let response = self
            .client
            .get(self.xrpc("app.bsky.feed.getAuthorFeed"))
            .bearer_auth(&session.access_token)
            .query(&query)
            .send()
            .await
            .map_err(|e| AgentError::from_transport(operation, e))?;

        let output: GetAuthorFeedOutput = Self::read_json(operation, response).await?;
        Ok(FeedPage {
            posts: output.feed.into_iter().filter_map(convert_feed_item).collect(),
            cursor: output.cursor,
        })
    }
}

fn convert_feed_item(item: FeedViewPost) -> Option<FeedPost> {
    if item.reason.is_some() {
        return None;
    }
    let post = item.post;
    let indexed_at = match DateTime::parse_from_rfc3339(&post.indexed_at) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(e) => {
            tracing::debug!("Skipping feed post {} with bad timestamp: {}", post.uri, e);
            return None;
        }
    };
    let text = post
        .record
        .get("text")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();

    Some(FeedPost {
        post: PostRef::new(post.uri, post.cid),
        text,
        like_count: post.like_count,
        repost_count: post.repost_count,
        indexed_at,
    })
}

fn convert_notification(view: NotificationView) -> Option<Notification> {
    let indexed_at = match DateTime::parse_from_rfc3339(&view.indexed_at) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(e) => {
            tracing::warn!(
                "Skipping notification {} with bad timestamp {:?}: {}",
                view.uri,
                view.indexed_at,
                e
            );
            return None;
        }
    };

    let record: Option<PostRecord> = serde_json::from_value(view.record).ok();
    let (text, reply) = match record {
        Some(record) => (record.text, record.reply),
        None => (String::new(), None),
    };

    Some(Notification {
        id: view.uri,
        content_id: view.cid,
        author_id: view.author.did,
        author_handle: view.author.handle,
        category: NotificationCategory::from_reason(&view.reason),
        indexed_at,
        text,
        root: reply.as_ref().map(|r| PostRef::from(r.root.clone())),
        parent: reply.map(|r| PostRef::from(r.parent)),
    })
}

fn convert_thread(node: ThreadNode) -> Option<ThreadView> {
    match node {
        ThreadNode::Post {
            post,
            parent,
            replies,
        } => {
            let text = post
                .record
                .as_ref()
                .and_then(|r| r.get("text"))
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string();
            Some(ThreadView {
                post: PostRef::new(post.uri, post.cid),
                author_id: post.author.did,
                text,
                parent: parent.and_then(|p| convert_thread(*p)).map(Box::new),
                replies: replies.into_iter().filter_map(convert_thread).collect(),
            })
        }
        ThreadNode::Unavailable => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_reply_notification_with_refs() {
        let raw = serde_json::json!({
            "uri": "at://did:plc:alice/app.bsky.feed.post/3k2",
            "cid": "bafy-comment",
            "author": { "did": "did:plc:alice", "handle": "alice.bsky.social" },
            "reason": "reply",
            "indexedAt": "2024-11-02T10:15:00.000Z",
            "record": {
                "$type": "app.bsky.feed.post",
                "text": "great thread!",
                "createdAt": "2024-11-02T10:14:59.000Z",
                "reply": {
                    "root": { "uri": "at://did:plc:bot/app.bsky.feed.post/root", "cid": "bafy-root" },
                    "parent": { "uri": "at://did:plc:bot/app.bsky.feed.post/root", "cid": "bafy-root" }
                }
            }
        });

        let view: NotificationView = serde_json::from_value(raw).unwrap();
        let notification = convert_notification(view).unwrap();

        assert_eq!(notification.category, NotificationCategory::Reply);
        assert_eq!(notification.author_handle, "alice.bsky.social");
        assert_eq!(notification.text, "great thread!");
        assert_eq!(
            notification.root,
            Some(PostRef::new(
                "at://did:plc:bot/app.bsky.feed.post/root",
                "bafy-root"
            ))
        );
        assert_eq!(notification.parent, notification.root);
    }

    #[test]
    fn like_notification_has_no_text_or_refs() {
        let raw = serde_json::json!({
            "uri": "at://did:plc:bob/app.bsky.feed.like/abc",
            "cid": "bafy-like",
            "author": { "did": "did:plc:bob", "handle": "bob.bsky.social" },
            "reason": "like",
            "indexedAt": "2024-11-02T10:15:00.000Z",
            "record": {
                "$type": "app.bsky.feed.like",
                "subject": { "uri": "at://did:plc:bot/app.bsky.feed.post/root", "cid": "bafy-root" },
                "createdAt": "2024-11-02T10:15:00.000Z"
            }
        });

        let view: NotificationView = serde_json::from_value(raw).unwrap();
        let notification = convert_notification(view).unwrap();
        assert_eq!(notification.category, NotificationCategory::Like);
        assert!(notification.root.is_none());
        assert!(notification.text.is_empty());
    }

    #[test]
    fn converts_thread_parent_chain() {
        let raw = serde_json::json!({
            "thread": {
                "$type": "app.bsky.feed.defs#threadViewPost",
                "post": {
                    "uri": "at://c", "cid": "cid-c",
                    "author": { "did": "did:plc:carol" },
                    "record": { "text": "leaf" }
                },
                "parent": {
                    "$type": "app.bsky.feed.defs#threadViewPost",
                    "post": {
                        "uri": "at://a", "cid": "cid-a",
                        "author": { "did": "did:plc:bot" },
                        "record": { "text": "root" }
                    }
                }
            }
        });

        let output: GetPostThreadOutput = serde_json::from_value(raw).unwrap();
        let thread = convert_thread(output.thread).unwrap();
        assert_eq!(thread.text, "leaf");
        assert_eq!(thread.topmost().post, PostRef::new("at://a", "cid-a"));
    }

    #[test]
    fn author_feed_skips_reposts() {
        let raw = serde_json::json!({
            "cursor": "2024-11-02T09:00:00.000Z",
            "feed": [
                {
                    "post": {
                        "uri": "at://did:plc:bot/app.bsky.feed.post/1", "cid": "bafy-1",
                        "author": { "did": "did:plc:bot" },
                        "record": { "text": "Rover finds water #space" },
                        "likeCount": 4, "repostCount": 1,
                        "indexedAt": "2024-11-02T10:15:00.000Z"
                    }
                },
                {
                    "post": {
                        "uri": "at://did:plc:other/app.bsky.feed.post/9", "cid": "bafy-9",
                        "author": { "did": "did:plc:other" },
                        "record": { "text": "someone else" },
                        "indexedAt": "2024-11-02T10:10:00.000Z"
                    },
                    "reason": { "$type": "app.bsky.feed.defs#reasonRepost" }
                }
            ]
        });

        let output: GetAuthorFeedOutput = serde_json::from_value(raw).unwrap();
        assert_eq!(output.cursor.as_deref(), Some("2024-11-02T09:00:00.000Z"));
        let posts: Vec<FeedPost> = output.feed.into_iter().filter_map(convert_feed_item).collect();

        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].text, "Rover finds water #space");
        assert_eq!(posts[0].like_count, 4);
        assert_eq!(posts[0].repost_count, 1);
    }

    #[test]
    fn profile_counters_default_to_zero() {
        let raw = serde_json::json!({ "did": "did:plc:bot", "handle": "newsbot.bsky.social" });
        let profile: ProfileViewDetailed = serde_json::from_value(raw).unwrap();
        assert_eq!(profile.handle, "newsbot.bsky.social");
        assert_eq!(profile.followers_count, 0);
        assert!(profile.display_name.is_none());
    }
}
