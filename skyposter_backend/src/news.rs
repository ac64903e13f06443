//! News source collaborator (NewsAPI-compatible `/v2/everything`).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::http_client::build_http_client_with_timeout;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub description: String,
    pub source_name: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[async_trait]
pub trait NewsSource: Send + Sync {
    async fn search(&self, topics: &[String]) -> Result<Vec<Article>>;
}

#[derive(Debug, Deserialize)]
struct EverythingResponse {
    #[serde(default)]
    articles: Vec<RawArticle>,
}

#[derive(Debug, Deserialize)]
struct RawArticle {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    source: RawSource,
}

#[derive(Debug, Default, Deserialize)]
struct RawSource {
    #[serde(default)]
    name: Option<String>,
}

pub struct NewsApiClient {
    base_url: String,
    api_key: Option<String>,
    page_size: u32,
    client: Client,
}

impl NewsApiClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            page_size: 10,
            client: build_http_client_with_timeout(Some(Duration::from_secs(20))),
        }
    }
}

#[async_trait]
impl NewsSource for NewsApiClient {
    async fn search(&self, topics: &[String]) -> Result<Vec<Article>> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(AgentError::content_unavailable("news API key is not configured"));
        };
        if topics.is_empty() {
            return Ok(Vec::new());
        }

        let query = build_query(topics);
        let url = format!("{}/v2/everything", self.base_url);
        let page_size = self.page_size.to_string();
        let response = self
            .client
            .get(&url)
            .header("X-Api-Key", api_key)
            .query(&[
                ("q", query.as_str()),
                ("sortBy", "publishedAt"),
                ("language", "en"),
                ("pageSize", page_size.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AgentError::from_transport("news search", e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::from_status("news search", status, body));
        }

        let parsed: EverythingResponse = response.json().await.map_err(|e| {
            AgentError::content_unavailable(format!("unreadable news response: {}", e))
        })?;

        Ok(parsed
            .articles
            .into_iter()
            .filter_map(clean_article)
            .collect())
    }
}

fn build_query(topics: &[String]) -> String {
    topics
        .iter()
        .map(|topic| {
            if topic.contains(' ') {
                format!("\"{}\"", topic)
            } else {
                topic.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// NewsAPI pads results with "[Removed]" placeholders and empty fields.
fn clean_article(raw: RawArticle) -> Option<Article> {
    let title = raw.title?.trim().to_string();
    if title.is_empty() || title == "[Removed]" {
        return None;
    }
    let description = raw
        .description
        .map(|d| d.trim().to_string())
        .filter(|d| d != "[Removed]")
        .unwrap_or_default();
    let source_name = raw
        .source
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "the news".to_string());

    Some(Article {
        title,
        description,
        source_name,
        url: raw.url,
    })
}
