//! Account statistics: public profile counters plus what the account's own
//! posts achieved over a recent window.

use chrono::Timelike;
use std::collections::HashMap;
use std::fmt;

use crate::social::{FeedPost, Profile};

pub const TOP_HASHTAGS: usize = 5;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityStats {
    pub total_posts: usize,
    pub total_likes: u64,
    pub total_reposts: u64,
    /// Mean post length in characters, 0 when there are no posts
    pub average_length: f64,
    /// Lowercased hashtags, most used first
    pub top_hashtags: Vec<(String, usize)>,
    /// Posts per UTC hour of day
    pub posts_by_hour: [usize; 24],
}

impl ActivityStats {
    /// Hour with the most posts. Ties go to the earlier hour.
    pub fn busiest_hour(&self) -> Option<usize> {
        let (hour, count) = self
            .posts_by_hour
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(&a.0)))?;
        (*count > 0).then_some(hour)
    }
}

pub fn analyze_posts(posts: &[FeedPost]) -> ActivityStats {
    let mut stats = ActivityStats {
        total_posts: posts.len(),
        ..ActivityStats::default()
    };
    let mut hashtags: HashMap<String, usize> = HashMap::new();
    let mut total_chars = 0usize;

    for post in posts {
        stats.total_likes += post.like_count;
        stats.total_reposts += post.repost_count;
        total_chars += post.text.chars().count();

        for word in post.text.split_whitespace() {
            if word.len() > 1 && word.starts_with('#') {
                *hashtags.entry(word.to_lowercase()).or_default() += 1;
            }
        }
        stats.posts_by_hour[post.indexed_at.hour() as usize] += 1;
    }

    if !posts.is_empty() {
        stats.average_length = total_chars as f64 / posts.len() as f64;
    }

    let mut ranked: Vec<(String, usize)> = hashtags.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(TOP_HASHTAGS);
    stats.top_hashtags = ranked;
    stats
}

#[derive(Debug, Clone)]
pub struct AccountReport {
    pub profile: Profile,
    pub window_hours: i64,
    pub activity: ActivityStats,
}

impl fmt::Display for AccountReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let profile = &self.profile;
        let activity = &self.activity;
        write!(
            f,
            "@{}: {} followers, {} following, {} posts. Last {}h: {} posts, {} likes, {} reposts",
            profile.handle,
            profile.followers,
            profile.follows,
            profile.posts,
            self.window_hours,
            activity.total_posts,
            activity.total_likes,
            activity.total_reposts
        )?;
        if activity.total_posts > 0 {
            write!(f, ", {:.1} chars on average", activity.average_length)?;
        }
        if !activity.top_hashtags.is_empty() {
            let tags: Vec<String> = activity
                .top_hashtags
                .iter()
                .map(|(tag, count)| format!("{} ({})", tag, count))
                .collect();
            write!(f, ", top hashtags {}", tags.join(", "))?;
        }
        if let Some(hour) = activity.busiest_hour() {
            write!(f, ", busiest hour {:02}:00 UTC", hour)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::feed_post;
    use chrono::{TimeZone, Utc};

    #[test]
    fn aggregates_engagement_hashtags_and_hours() {
        let at = |hour| Utc.with_ymd_and_hms(2024, 11, 2, hour, 15, 0).unwrap();
        let posts = vec![
            feed_post(1, "Rover finds water #Space #science", 10, 2, at(14)),
            feed_post(2, "Launch delayed #space", 4, 0, at(14)),
            feed_post(3, "Quiet day", 1, 1, at(9)),
        ];

        let stats = analyze_posts(&posts);

        assert_eq!(stats.total_posts, 3);
        assert_eq!(stats.total_likes, 15);
        assert_eq!(stats.total_reposts, 3);
        assert_eq!(
            stats.top_hashtags,
            vec![("#space".to_string(), 2), ("#science".to_string(), 1)]
        );
        assert_eq!(stats.posts_by_hour[14], 2);
        assert_eq!(stats.posts_by_hour[9], 1);
        assert_eq!(stats.busiest_hour(), Some(14));
        let expected = (33 + 21 + 9) as f64 / 3.0;
        assert!((stats.average_length - expected).abs() < 1e-9);
    }

    #[test]
    fn empty_window_has_no_averages() {
        let stats = analyze_posts(&[]);
        assert_eq!(stats.total_posts, 0);
        assert_eq!(stats.average_length, 0.0);
        assert!(stats.top_hashtags.is_empty());
        assert_eq!(stats.busiest_hour(), None);
    }

    #[test]
    fn keeps_only_the_top_hashtags() {
        let text = "#a #b #c #d #e #f #f";
        let stats = analyze_posts(&[feed_post(1, text, 0, 0, Utc::now())]);
        assert_eq!(stats.top_hashtags.len(), TOP_HASHTAGS);
        assert_eq!(stats.top_hashtags[0], ("#f".to_string(), 2));
    }

    #[test]
    fn report_reads_as_one_line() {
        let report = AccountReport {
            profile: Profile {
                handle: "newsbot.bsky.social".to_string(),
                display_name: None,
                followers: 120,
                follows: 3,
                posts: 88,
            },
            window_hours: 24,
            activity: ActivityStats::default(),
        };

        let line = report.to_string();
        assert!(line.starts_with("@newsbot.bsky.social: 120 followers"));
        assert!(line.contains("Last 24h: 0 posts"));
        assert!(!line.contains("busiest"));
    }
}
