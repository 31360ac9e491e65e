//! RSS/Atom feed poller.
//!
//! Each stored feed has a format template. Template variables come from the
//! entry (`$title`, `$link`, `$description`, `$author`, `$published`, `$id`)
//! and from the feed itself prefixed with `feed_` (`$feed_name`,
//! `$feed_title`, `$feed_link`, `$feed_author`, `$feed_subtitle`). Unknown
//! variables are left in place.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use feed_rs::model::{Entry, Feed};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::db::{Db, RssFeed};
use crate::error::{HttpError, Result};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const DELIVER_LIMIT: usize = 3;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("static regex"));
static VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(?:\$|\{(\w+)\}|(\w+))").expect("static regex"));
// Gitea titles its feeds `Feed of "owner/repo"`.
static FEED_OF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^[Ff]eed\s+of\s+"?(.+?)"?\s*$"#).expect("static regex"));

/// Sends one formatted line to a channel. The router implements this.
#[async_trait::async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, network: &str, channel: &str, message: &str);
}

pub struct RssPoller {
    db: Db,
    deliver: Arc<dyn Deliver>,
    interval: Duration,
    http: reqwest::Client,
}

impl RssPoller {
    pub fn new(db: Db, deliver: Arc<dyn Deliver>, interval_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(HttpError::from)?;
        Ok(Self {
            db,
            deliver,
            interval: Duration::from_secs(interval_secs),
            http,
        })
    }

    pub async fn run(self) {
        loop {
            if let Err(e) = self.poll().await {
                tracing::warn!("RSS poll failed: {e}");
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn poll(&self) -> Result<()> {
        let feeds = self.db.rss_all_feeds().await?;
        if feeds.is_empty() {
            return Ok(());
        }
        tracing::debug!("Polling {} RSS feed(s)", feeds.len());
        for feed in feeds {
            if let Err(e) = self.fetch_and_deliver(&feed).await {
                tracing::warn!("Error polling {}: {e}", feed.url);
            }
        }
        Ok(())
    }

    async fn fetch_and_deliver(&self, feed: &RssFeed) -> Result<()> {
        let response = match self.http.get(&feed.url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!("Failed to fetch {}: {e}", feed.url);
                return Ok(());
            }
        };
        let body = response.bytes().await.map_err(HttpError::from)?;
        let parsed = match feed_rs::parser::parse(&body[..]) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Failed to parse {}: {e}", feed.url);
                return Ok(());
            }
        };
        self.process(feed, &parsed).await
    }

    /// Deliver new entries from an already-parsed document. On the first
    /// poll of a feed only the newest entry is shown and the rest are
    /// marked seen, so joining an established feed does not flood the
    /// channel with history.
    async fn process(&self, feed: &RssFeed, parsed: &Feed) -> Result<()> {
        if parsed.entries.is_empty() {
            return Ok(());
        }

        let seen = self.db.rss_get_seen(feed.id).await?;
        // Documents list newest first; deliver oldest first.
        let new_entries: Vec<(String, &Entry)> = parsed
            .entries
            .iter()
            .rev()
            .filter_map(|entry| {
                let id = entry_id(entry);
                (!seen.contains(&id)).then_some((id, entry))
            })
            .collect();
        if new_entries.is_empty() {
            return Ok(());
        }

        if seen.is_empty() {
            if let Some((_, entry)) = new_entries.last() {
                let message = format_entry(&feed.format, parsed, entry);
                self.deliver
                    .deliver(&feed.network, &feed.channel, &message)
                    .await;
            }
            let ids: Vec<String> = new_entries.into_iter().map(|(id, _)| id).collect();
            let count = ids.len();
            self.db.rss_mark_seen(feed.id, &ids).await?;
            tracing::info!(
                "Initialised feed {} ({count} entries), showed latest",
                feed.url
            );
            return Ok(());
        }

        let total = new_entries.len();
        let mut delivered = Vec::new();
        for (id, entry) in new_entries.into_iter().take(DELIVER_LIMIT) {
            let message = format_entry(&feed.format, parsed, entry);
            self.deliver
                .deliver(&feed.network, &feed.channel, &message)
                .await;
            delivered.push(id);
        }
        self.db.rss_mark_seen(feed.id, &delivered).await?;
        if total > DELIVER_LIMIT {
            tracing::info!(
                "{} had {total} new entries, delivered {DELIVER_LIMIT}",
                feed.url
            );
        }
        Ok(())
    }
}

/// Stable unique ID for an entry.
fn entry_id(entry: &Entry) -> String {
    let raw = if !entry.id.is_empty() {
        entry.id.clone()
    } else {
        entry
            .links
            .first()
            .map(|l| l.href.clone())
            .or_else(|| entry.title.as_ref().map(|t| t.content.clone()))
            .unwrap_or_default()
    };
    format!("sha256:{}", hex::encode(Sha256::digest(raw.as_bytes())))
}

fn format_entry(template: &str, feed: &Feed, entry: &Entry) -> String {
    substitute(template, &build_vars(feed, entry))
}

fn build_vars(feed: &Feed, entry: &Entry) -> HashMap<String, String> {
    let mut vars = HashMap::new();

    let feed_title = feed
        .title
        .as_ref()
        .map(|t| strip_html(&t.content))
        .unwrap_or_default();
    let feed_name = match FEED_OF_RE.captures(&feed_title) {
        Some(caps) => caps[1].to_string(),
        None => feed_title.clone(),
    };
    vars.insert("feed_title".to_string(), feed_title);
    vars.insert("feed_name".to_string(), feed_name);
    vars.insert(
        "feed_link".to_string(),
        feed.links.first().map(|l| l.href.clone()).unwrap_or_default(),
    );
    vars.insert(
        "feed_author".to_string(),
        feed.authors.first().map(|a| a.name.clone()).unwrap_or_default(),
    );
    vars.insert(
        "feed_subtitle".to_string(),
        feed.description
            .as_ref()
            .map(|t| strip_html(&t.content))
            .unwrap_or_default(),
    );

    vars.insert(
        "title".to_string(),
        entry
            .title
            .as_ref()
            .map(|t| strip_html(&t.content))
            .unwrap_or_default(),
    );
    vars.insert(
        "link".to_string(),
        entry.links.first().map(|l| l.href.clone()).unwrap_or_default(),
    );
    vars.insert(
        "description".to_string(),
        entry
            .summary
            .as_ref()
            .map(|t| strip_html(&t.content))
            .unwrap_or_default(),
    );
    vars.insert(
        "author".to_string(),
        entry.authors.first().map(|a| a.name.clone()).unwrap_or_default(),
    );
    vars.insert(
        "published".to_string(),
        entry
            .published
            .or(entry.updated)
            .map(|dt| dt.to_rfc2822())
            .unwrap_or_default(),
    );
    vars.insert("id".to_string(), entry.id.clone());
    vars
}

/// `$var` and `${var}` substitution; `$$` is a literal `$` and unknown
/// variables stay as written.
fn substitute(template: &str, vars: &HashMap<String, String>) -> String {
    VAR_RE
        .replace_all(template, |caps: &regex::Captures| {
            match caps.get(1).or_else(|| caps.get(2)) {
                Some(name) => vars
                    .get(name.as_str())
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string()),
                None => "$".to_string(),
            }
        })
        .into_owned()
}

/// Remove tags, decode common entities, collapse whitespace.
fn strip_html(text: &str) -> String {
    let text = TAG_RE.replace_all(text, "");
    let text = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
