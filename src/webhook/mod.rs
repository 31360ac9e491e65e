//! Webhook ingestion: the HTTP listener and the per-forge payload
//! formatters that turn forge JSON into IRC lines.

pub mod gitea;
pub mod github;
pub mod gitlab;
pub mod server;

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

pub use server::WebhookServer;

/// One rendered output line with an optional URL suffix.
pub type Line = (String, Option<String>);

/// A git hosting platform that emits webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Forge {
    GitHub,
    Gitea,
    GitLab,
}

impl Forge {
    /// Parse a lower-cased URL path segment.
    pub fn from_path(segment: &str) -> Option<Self> {
        match segment {
            "github" => Some(Self::GitHub),
            "gitea" => Some(Self::Gitea),
            "gitlab" => Some(Self::GitLab),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::Gitea => "gitea",
            Self::GitLab => "gitlab",
        }
    }

    /// Repo identity fields from a payload.
    pub fn names(self, payload: &Value) -> RepoNames {
        match self {
            Self::GitHub => github::names(payload),
            Self::Gitea => gitea::names(payload),
            Self::GitLab => gitlab::names(payload),
        }
    }

    /// Branch the event applies to, if any.
    pub fn branch(self, payload: &Value) -> Option<String> {
        match self {
            Self::GitHub => github::branch(payload),
            Self::Gitea => gitea::branch(payload),
            Self::GitLab => gitlab::branch(payload),
        }
    }

    /// Event tags, most specific last; the first is the raw event name.
    pub fn event(self, payload: &Value, headers: &HashMap<String, String>) -> Vec<String> {
        match self {
            Self::GitHub => github::event(payload, headers),
            Self::Gitea => gitea::event(payload, headers),
            Self::GitLab => gitlab::event(payload, headers),
        }
    }

    /// Expand a coarse subscription category into concrete event tags.
    /// Unknown categories pass through unchanged so a target can subscribe
    /// to a raw tag directly.
    pub fn expand_category(self, category: &str) -> Vec<&str> {
        match self {
            Self::GitHub => github::expand_category(category),
            Self::Gitea => gitea::expand_category(category),
            Self::GitLab => gitlab::expand_category(category),
        }
    }

    /// Render an event into zero or more output lines. Malformed payloads
    /// render to nothing.
    pub fn render(self, full_name: &str, event: &str, payload: &Value) -> Vec<Line> {
        match self {
            Self::GitHub => github::render(full_name, event, payload),
            Self::Gitea => gitea::render(full_name, event, payload),
            Self::GitLab => gitlab::render(full_name, event, payload),
        }
    }
}

impl fmt::Display for Forge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Repo identity extracted from a payload. Any of these may match a
/// stored route's `repo` field (case-insensitive).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepoNames {
    pub full_name: Option<String>,
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub organisation: Option<String>,
}

impl RepoNames {
    /// Lower-cased lookup candidates: full name, owner, organisation.
    pub fn candidates(&self) -> Vec<String> {
        [&self.full_name, &self.owner, &self.organisation]
            .into_iter()
            .flatten()
            .map(|s| s.to_lowercase())
            .collect()
    }

    /// Best human-readable name for the repo tag prefix.
    pub fn display(&self, forge: Forge) -> &str {
        self.full_name
            .as_deref()
            .or(self.organisation.as_deref())
            .or(self.repo.as_deref())
            .unwrap_or(forge.as_str())
    }
}

/// Receives validated webhook events from the listener. The router
/// implements this.
#[async_trait::async_trait]
pub trait WebhookSink: Send + Sync {
    async fn deliver(&self, forge: Forge, headers: HashMap<String, String>, payload: Value);
}

/// First 7 characters of a commit hash.
pub(crate) fn short(hash: &str) -> &str {
    hash.get(..7).unwrap_or(hash)
}

/// First line of a commit message, trimmed.
pub(crate) fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("").trim()
}
