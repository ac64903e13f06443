use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AgentError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Minimum spacing between two post creations
    #[serde(default = "default_post_spacing_ms")]
    pub post_min_spacing_ms: u64,
    #[serde(default = "default_notification_spacing_ms")]
    pub notification_min_spacing_ms: u64,
    /// Content-id lookups and thread fetches
    #[serde(default = "default_lookup_spacing_ms")]
    pub lookup_min_spacing_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
}

fn default_post_spacing_ms() -> u64 {
    2_000
}

fn default_notification_spacing_ms() -> u64 {
    5_000
}

fn default_lookup_spacing_ms() -> u64 {
    250
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_max_retry_attempts() -> u32 {
    4
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            post_min_spacing_ms: default_post_spacing_ms(),
            notification_min_spacing_ms: default_notification_spacing_ms(),
            lookup_min_spacing_ms: default_lookup_spacing_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_retry_attempts: default_max_retry_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Social network account
    #[serde(default = "default_social_url")]
    pub social_api_url: String,
    #[serde(default, alias = "handle")]
    pub account_identifier: String,
    #[serde(default, alias = "app_password")]
    pub account_secret: String,

    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    // News source
    #[serde(default = "default_news_url")]
    pub news_api_url: String,
    #[serde(default)]
    pub news_api_key: Option<String>,
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
    #[serde(default = "default_articles_per_thread")]
    pub articles_per_thread: usize,

    // Scheduling
    #[serde(default = "default_publish_interval")]
    pub publish_interval_secs: u64,
    #[serde(default = "default_notification_interval", alias = "check_interval_seconds")]
    pub notification_interval_secs: u64,
    #[serde(default = "default_tone_interval")]
    pub tone_interval_secs: u64,
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// How often the account statistics report is logged
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
    #[serde(default = "default_stats_window_hours")]
    pub stats_window_hours: u64,

    // Posting
    #[serde(default = "default_post_char_limit")]
    pub post_char_limit: usize,
    #[serde(default = "default_confirm_attempts")]
    pub confirm_attempts: u32,
    #[serde(default = "default_confirm_delay_ms")]
    pub confirm_delay_ms: u64,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    // Conversation state
    #[serde(default = "default_thread_retention_hours")]
    pub thread_retention_hours: u64,
    #[serde(default = "default_max_tracked_threads")]
    pub max_tracked_threads: usize,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Answer notifications that arrived before this process started
    #[serde(default)]
    pub reply_to_backlog: bool,
}

fn default_social_url() -> String {
    "https://bsky.social".to_string()
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_system_prompt() -> String {
    "You are a friendly news bot on a social network. \
     You write short, factual, engaging posts and replies. \
     Never use hashtags and never exceed a few sentences."
        .to_string()
}

fn default_news_url() -> String {
    "https://newsapi.org".to_string()
}

fn default_topics() -> Vec<String> {
    vec![
        "artificial intelligence".to_string(),
        "technology".to_string(),
    ]
}

fn default_articles_per_thread() -> usize {
    3
}

fn default_publish_interval() -> u64 {
    3600
}

fn default_notification_interval() -> u64 {
    60
}

fn default_tone_interval() -> u64 {
    15
}

fn default_restart_delay() -> u64 {
    5
}

fn default_monitor_interval() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_stats_interval() -> u64 {
    6 * 3600
}

fn default_stats_window_hours() -> u64 {
    24
}

fn default_post_char_limit() -> usize {
    300
}

fn default_confirm_attempts() -> u32 {
    5
}

fn default_confirm_delay_ms() -> u64 {
    500
}

fn default_thread_retention_hours() -> u64 {
    48
}

fn default_max_tracked_threads() -> usize {
    200
}

fn default_dedup_capacity() -> usize {
    10_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            social_api_url: default_social_url(),
            account_identifier: String::new(),
            account_secret: String::new(),
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            system_prompt: default_system_prompt(),
            news_api_url: default_news_url(),
            news_api_key: None,
            topics: default_topics(),
            articles_per_thread: default_articles_per_thread(),
            publish_interval_secs: default_publish_interval(),
            notification_interval_secs: default_notification_interval(),
            tone_interval_secs: default_tone_interval(),
            restart_delay_secs: default_restart_delay(),
            monitor_interval_secs: default_monitor_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            stats_interval_secs: default_stats_interval(),
            stats_window_hours: default_stats_window_hours(),
            post_char_limit: default_post_char_limit(),
            confirm_attempts: default_confirm_attempts(),
            confirm_delay_ms: default_confirm_delay_ms(),
            rate_limits: RateLimitConfig::default(),
            thread_retention_hours: default_thread_retention_hours(),
            max_tracked_threads: default_max_tracked_threads(),
            dedup_capacity: default_dedup_capacity(),
            reply_to_backlog: false,
        }
    }
}

impl AgentConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("skyposter_config.toml")
    }

    /// Load config from skyposter_config.toml (next to executable), then let
    /// environment variables override it. Credentials usually only live in the env.
    pub fn load() -> Self {
        let path = Self::config_path();

        let base = match Self::load_from(&path) {
            Ok(config) => {
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Err(e) => {
                if path.exists() {
                    tracing::error!("Failed to parse {:?}: {:#}", path, e);
                } else {
                    tracing::warn!("No config file found, using defaults + env vars");
                }
                Self::default()
            }
        };

        base.with_env_overrides()
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        toml::from_str::<AgentConfig>(&contents)
            .with_context(|| format!("Failed to parse config {:?}", path))
    }

    /// Save config to file (next to executable). Secrets are not written out.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let mut redacted = self.clone();
        redacted.account_secret.clear();
        redacted.llm_api_key = None;
        redacted.news_api_key = None;

        let toml_string = toml::to_string_pretty(&redacted).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Apply environment variables on top of the current values
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("BSKY_SERVICE_URL") {
            self.social_api_url = url;
        }

        if let Ok(identifier) = env::var("BSKY_IDENTIFIER") {
            self.account_identifier = identifier;
        }

        if let Ok(secret) = env::var("BSKY_PASSWORD") {
            self.account_secret = secret;
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            self.llm_api_key = Some(key);
        }

        if let Ok(url) = env::var("NEWS_API_URL") {
            self.news_api_url = url;
        }

        if let Ok(key) = env::var("NEWS_API_KEY") {
            self.news_api_key = Some(key);
        }

        if let Ok(topics) = env::var("AGENT_TOPICS") {
            let parsed = parse_topics(&topics);
            if !parsed.is_empty() {
                self.topics = parsed;
            }
        }

        if let Ok(interval) = env::var("AGENT_PUBLISH_INTERVAL_SECS") {
            if let Ok(seconds) = interval.parse() {
                self.publish_interval_secs = seconds;
            }
        }

        if let Ok(interval) = env::var("AGENT_NOTIFICATION_INTERVAL_SECS") {
            if let Ok(seconds) = interval.parse() {
                self.notification_interval_secs = seconds;
            }
        }

        if let Ok(interval) = env::var("AGENT_STATS_INTERVAL_SECS") {
            if let Ok(seconds) = interval.parse() {
                self.stats_interval_secs = seconds;
            }
        }

        if let Ok(enabled) = env::var("AGENT_REPLY_TO_BACKLOG") {
            self.reply_to_backlog = enabled.eq_ignore_ascii_case("1")
                || enabled.eq_ignore_ascii_case("true")
                || enabled.eq_ignore_ascii_case("yes");
        }

        self
    }

    /// Startup validation. Any error here is fatal to the process.
    pub fn validate(&self) -> std::result::Result<(), AgentError> {
        if self.account_identifier.trim().is_empty() {
            return Err(AgentError::config(
                "account identifier is missing (set BSKY_IDENTIFIER)",
            ));
        }
        if self.account_secret.trim().is_empty() {
            return Err(AgentError::config(
                "account secret is missing (set BSKY_PASSWORD)",
            ));
        }
        if self.publish_interval_secs == 0
            || self.notification_interval_secs == 0
            || self.tone_interval_secs == 0
            || self.stats_interval_secs == 0
        {
            return Err(AgentError::config("worker intervals must be non-zero"));
        }
        if self.stats_window_hours == 0 {
            return Err(AgentError::config("stats_window_hours must be at least 1"));
        }
        let shortest_interval = self
            .notification_interval_secs
            .min(self.publish_interval_secs)
            .min(self.tone_interval_secs)
            .min(self.stats_interval_secs);
        if self.restart_delay_secs >= shortest_interval {
            return Err(AgentError::config(
                "restart_delay_secs must be shorter than every worker interval",
            ));
        }
        if self.post_char_limit < 32 {
            return Err(AgentError::config("post_char_limit is unreasonably small"));
        }
        if self.articles_per_thread == 0 {
            return Err(AgentError::config("articles_per_thread must be at least 1"));
        }
        Ok(())
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }

    pub fn notification_interval(&self) -> Duration {
        Duration::from_secs(self.notification_interval_secs)
    }

    pub fn tone_interval(&self) -> Duration {
        Duration::from_secs(self.tone_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn stats_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.stats_window_hours as i64)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn thread_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.thread_retention_hours as i64)
    }
}

fn parse_topics(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|topic| topic.trim())
        .filter(|topic| !topic.is_empty())
        .map(str::to_string)
        .collect()
}
