//! SQLite persistence: webhook routes, RSS feeds with seen-entry tracking,
//! and the owner account.

use std::collections::HashSet;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::error::DbError;
use crate::webhook::{Forge, RepoNames};

/// Event categories a new route subscribes to.
pub const DEFAULT_EVENTS: &[&str] = &["ping", "code", "pr", "issue", "repo"];

/// Output template for a new RSS feed.
pub const DEFAULT_RSS_FORMAT: &str = "$feed_name: $title <$link>";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS webhook_routes (
    id       INTEGER PRIMARY KEY,
    network  TEXT NOT NULL,
    channel  TEXT NOT NULL,
    repo     TEXT NOT NULL,
    forge    TEXT,
    events   TEXT NOT NULL DEFAULT '["ping","code","pr","issue","repo"]',
    branches TEXT NOT NULL DEFAULT '[]'
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_webhook
    ON webhook_routes(network, channel, repo, forge);

CREATE TABLE IF NOT EXISTS rss_feeds (
    id      INTEGER PRIMARY KEY,
    network TEXT NOT NULL,
    channel TEXT NOT NULL,
    url     TEXT NOT NULL,
    format  TEXT NOT NULL DEFAULT '$feed_name: $title <$link>'
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_rss
    ON rss_feeds(network, channel, url);

CREATE TABLE IF NOT EXISTS rss_seen (
    feed_id  INTEGER NOT NULL REFERENCES rss_feeds(id) ON DELETE CASCADE,
    entry_id TEXT NOT NULL,
    PRIMARY KEY (feed_id, entry_id)
);

CREATE TABLE IF NOT EXISTS owner (
    id       INTEGER PRIMARY KEY CHECK (id = 1),
    nick     TEXT NOT NULL,
    password TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS owner_hostmasks (
    mask TEXT PRIMARY KEY
);
"#;

/// A stored webhook route as shown by `!webhook list`.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRoute {
    pub repo: String,
    pub forge: Option<String>,
    pub events: Vec<String>,
    pub branches: Vec<String>,
}

/// A delivery target matched against an incoming payload.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookTarget {
    pub network: String,
    pub channel: String,
    pub events: Vec<String>,
    pub branches: Vec<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RssFeed {
    pub id: i64,
    pub network: String,
    pub channel: String,
    pub url: String,
    pub format: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Owner {
    pub nick: String,
    pub password: String,
}

#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub async fn connect(path: &str) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory database for tests. A single connection, since every
    /// `:memory:` connection is its own database.
    pub async fn connect_in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), DbError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    // Purge helpers used by reload.

    pub async fn purge_network(&self, network: &str) -> Result<(), DbError> {
        sqlx::query("DELETE FROM webhook_routes WHERE network = ?")
            .bind(network)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM rss_feeds WHERE network = ?")
            .bind(network)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn purge_channel(&self, network: &str, channel: &str) -> Result<(), DbError> {
        sqlx::query("DELETE FROM webhook_routes WHERE network = ? AND channel = ?")
            .bind(network)
            .bind(channel)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM rss_feeds WHERE network = ? AND channel = ?")
            .bind(network)
            .bind(channel)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Webhook routes.

    pub async fn webhook_add(
        &self,
        network: &str,
        channel: &str,
        repo: &str,
        forge: Option<Forge>,
        events: Option<&[String]>,
        branches: Option<&[String]>,
    ) -> Result<(), DbError> {
        let events = match events {
            Some(e) if !e.is_empty() => serde_json::to_string(e)?,
            _ => serde_json::to_string(DEFAULT_EVENTS)?,
        };
        let branches = serde_json::to_string(branches.unwrap_or(&[]))?;
        // Update-then-insert rather than ON CONFLICT: the unique index
        // treats NULL forges as distinct, so upsert would duplicate them.
        let updated = sqlx::query(
            "UPDATE webhook_routes SET events = ?, branches = ? \
             WHERE network = ? AND channel = ? AND repo = ? AND forge IS ?",
        )
        .bind(&events)
        .bind(&branches)
        .bind(network)
        .bind(channel)
        .bind(repo)
        .bind(forge.map(Forge::as_str))
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO webhook_routes(network, channel, repo, forge, events, branches) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(network)
            .bind(channel)
            .bind(repo)
            .bind(forge.map(Forge::as_str))
            .bind(&events)
            .bind(&branches)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn webhook_remove(
        &self,
        network: &str,
        channel: &str,
        repo: &str,
        forge: Option<Forge>,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            "DELETE FROM webhook_routes \
             WHERE network = ? AND channel = ? AND repo = ? AND forge IS ?",
        )
        .bind(network)
        .bind(channel)
        .bind(repo)
        .bind(forge.map(Forge::as_str))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn webhook_list(
        &self,
        network: &str,
        channel: &str,
    ) -> Result<Vec<WebhookRoute>, DbError> {
        let rows = sqlx::query(
            "SELECT repo, forge, events, branches FROM webhook_routes \
             WHERE network = ? AND channel = ? ORDER BY repo, forge",
        )
        .bind(network)
        .bind(channel)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(WebhookRoute {
                    repo: row.get("repo"),
                    forge: row.get("forge"),
                    events: serde_json::from_str(row.get("events"))?,
                    branches: serde_json::from_str(row.get("branches"))?,
                })
            })
            .collect()
    }

    pub async fn webhook_set_events(
        &self,
        network: &str,
        channel: &str,
        repo: &str,
        events: &[String],
        forge: Option<Forge>,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE webhook_routes SET events = ? \
             WHERE network = ? AND channel = ? AND repo = ? AND forge IS ?",
        )
        .bind(serde_json::to_string(events)?)
        .bind(network)
        .bind(channel)
        .bind(repo)
        .bind(forge.map(Forge::as_str))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn webhook_set_branches(
        &self,
        network: &str,
        channel: &str,
        repo: &str,
        branches: &[String],
        forge: Option<Forge>,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE webhook_routes SET branches = ? \
             WHERE network = ? AND channel = ? AND repo = ? AND forge IS ?",
        )
        .bind(serde_json::to_string(branches)?)
        .bind(network)
        .bind(channel)
        .bind(repo)
        .bind(forge.map(Forge::as_str))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Routes matching an incoming payload. Routes with a NULL forge match
    /// any forge; repo matching is case-insensitive against the payload's
    /// full name, owner and organisation.
    pub async fn webhook_targets(
        &self,
        forge: Forge,
        names: &RepoNames,
    ) -> Result<Vec<WebhookTarget>, DbError> {
        let rows = sqlx::query(
            "SELECT network, channel, repo, events, branches FROM webhook_routes \
             WHERE forge IS NULL OR forge = ?",
        )
        .bind(forge.as_str())
        .fetch_all(&self.pool)
        .await?;

        let candidates = names.candidates();
        let mut targets = Vec::new();
        for row in rows {
            let repo: String = row.get("repo");
            if !candidates.contains(&repo.to_lowercase()) {
                continue;
            }
            targets.push(WebhookTarget {
                network: row.get("network"),
                channel: row.get("channel"),
                events: serde_json::from_str(row.get("events"))?,
                branches: serde_json::from_str(row.get("branches"))?,
            });
        }
        Ok(targets)
    }

    // RSS feeds.

    /// Insert a feed. Returns `(id, created)`; `created` is false when the
    /// feed already existed.
    pub async fn rss_add(
        &self,
        network: &str,
        channel: &str,
        url: &str,
    ) -> Result<(i64, bool), DbError> {
        let existing = sqlx::query(
            "SELECT id FROM rss_feeds WHERE network = ? AND channel = ? AND url = ?",
        )
        .bind(network)
        .bind(channel)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = existing {
            return Ok((row.get("id"), false));
        }
        let result = sqlx::query("INSERT INTO rss_feeds(network, channel, url) VALUES (?, ?, ?)")
            .bind(network)
            .bind(channel)
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok((result.last_insert_rowid(), true))
    }

    pub async fn rss_remove(
        &self,
        network: &str,
        channel: &str,
        url: &str,
    ) -> Result<bool, DbError> {
        let result =
            sqlx::query("DELETE FROM rss_feeds WHERE network = ? AND channel = ? AND url = ?")
                .bind(network)
                .bind(channel)
                .bind(url)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn rss_list(&self, network: &str, channel: &str) -> Result<Vec<RssFeed>, DbError> {
        Ok(sqlx::query_as(
            "SELECT id, network, channel, url, format FROM rss_feeds \
             WHERE network = ? AND channel = ? ORDER BY url",
        )
        .bind(network)
        .bind(channel)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn rss_all_feeds(&self) -> Result<Vec<RssFeed>, DbError> {
        Ok(
            sqlx::query_as("SELECT id, network, channel, url, format FROM rss_feeds")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn rss_set_format(
        &self,
        network: &str,
        channel: &str,
        url: &str,
        format: &str,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE rss_feeds SET format = ? WHERE network = ? AND channel = ? AND url = ?",
        )
        .bind(format)
        .bind(network)
        .bind(channel)
        .bind(url)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn rss_get_seen(&self, feed_id: i64) -> Result<HashSet<String>, DbError> {
        let rows = sqlx::query("SELECT entry_id FROM rss_seen WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("entry_id")).collect())
    }

    /// Record entries as seen, keeping only the 500 most recent per feed.
    pub async fn rss_mark_seen(&self, feed_id: i64, entry_ids: &[String]) -> Result<(), DbError> {
        for entry_id in entry_ids {
            sqlx::query("INSERT OR IGNORE INTO rss_seen(feed_id, entry_id) VALUES (?, ?)")
                .bind(feed_id)
                .bind(entry_id)
                .execute(&self.pool)
                .await?;
        }
        sqlx::query(
            "DELETE FROM rss_seen WHERE feed_id = ? AND entry_id NOT IN ( \
                 SELECT entry_id FROM rss_seen WHERE feed_id = ? \
                 ORDER BY rowid DESC LIMIT 500 \
             )",
        )
        .bind(feed_id)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // Owner account.

    pub async fn owner(&self) -> Result<Option<Owner>, DbError> {
        Ok(
            sqlx::query_as("SELECT nick, password FROM owner WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn owner_set(&self, nick: &str, password_hash: &str) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO owner(id, nick, password) VALUES (1, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET nick = excluded.nick, password = excluded.password",
        )
        .bind(nick)
        .bind(password_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn owner_set_password(&self, password_hash: &str) -> Result<(), DbError> {
        sqlx::query("UPDATE owner SET password = ? WHERE id = 1")
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Owner hostmasks.

    pub async fn hostmask_add(&self, mask: &str) -> Result<(), DbError> {
        sqlx::query("INSERT OR IGNORE INTO owner_hostmasks(mask) VALUES (?)")
            .bind(mask)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn hostmask_remove(&self, mask: &str) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM owner_hostmasks WHERE mask = ?")
            .bind(mask)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn hostmask_list(&self) -> Result<Vec<String>, DbError> {
        let rows = sqlx::query("SELECT mask FROM owner_hostmasks ORDER BY mask")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("mask")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(full: &str) -> RepoNames {
        let (owner, repo) = full.split_once('/').unwrap_or((full, ""));
        RepoNames {
            full_name: Some(full.to_string()),
            owner: Some(owner.to_string()),
            repo: Some(repo.to_string()),
            organisation: None,
        }
    }

    #[tokio::test]
    async fn webhook_add_defaults_and_upsert() {
        let db = Db::connect_in_memory().await.unwrap();
        db.webhook_add("net", "#dev", "acme/widgets", None, None, None)
            .await
            .unwrap();

        let routes = db.webhook_list("net", "#dev").await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].events, DEFAULT_EVENTS);
        assert!(routes[0].branches.is_empty());

        // Re-adding the same route replaces events instead of duplicating.
        let events = vec!["code".to_string()];
        db.webhook_add("net", "#dev", "acme/widgets", None, Some(&events), None)
            .await
            .unwrap();
        let routes = db.webhook_list("net", "#dev").await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].events, ["code"]);
    }

    #[tokio::test]
    async fn webhook_remove_distinguishes_forge() {
        let db = Db::connect_in_memory().await.unwrap();
        db.webhook_add("net", "#dev", "acme/widgets", None, None, None)
            .await
            .unwrap();
        db.webhook_add("net", "#dev", "acme/widgets", Some(Forge::GitHub), None, None)
            .await
            .unwrap();

        assert!(db
            .webhook_remove("net", "#dev", "acme/widgets", Some(Forge::GitHub))
            .await
            .unwrap());
        let routes = db.webhook_list("net", "#dev").await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].forge, None);

        assert!(!db
            .webhook_remove("net", "#dev", "acme/widgets", Some(Forge::Gitea))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn targets_match_case_insensitively() {
        let db = Db::connect_in_memory().await.unwrap();
        db.webhook_add("net", "#dev", "Acme/Widgets", None, None, None)
            .await
            .unwrap();
        db.webhook_add("net", "#ops", "acme", Some(Forge::Gitea), None, None)
            .await
            .unwrap();

        let targets = db
            .webhook_targets(Forge::GitHub, &names("acme/widgets"))
            .await
            .unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].channel, "#dev");

        // The second route is forge-specific and matches only gitea.
        let targets = db
            .webhook_targets(Forge::Gitea, &names("ACME/other"))
            .await
            .unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].channel, "#ops");
    }

    #[tokio::test]
    async fn set_events_reports_missing_route() {
        let db = Db::connect_in_memory().await.unwrap();
        let events = vec!["pr".to_string()];
        assert!(!db
            .webhook_set_events("net", "#dev", "nope", &events, None)
            .await
            .unwrap());

        db.webhook_add("net", "#dev", "acme/widgets", None, None, None)
            .await
            .unwrap();
        assert!(db
            .webhook_set_events("net", "#dev", "acme/widgets", &events, None)
            .await
            .unwrap());
        let routes = db.webhook_list("net", "#dev").await.unwrap();
        assert_eq!(routes[0].events, ["pr"]);
    }

    #[tokio::test]
    async fn rss_add_reports_created() {
        let db = Db::connect_in_memory().await.unwrap();
        let (id, created) = db.rss_add("net", "#dev", "https://e.org/f.xml").await.unwrap();
        assert!(created);
        let (same_id, created) = db.rss_add("net", "#dev", "https://e.org/f.xml").await.unwrap();
        assert!(!created);
        assert_eq!(id, same_id);

        let feeds = db.rss_list("net", "#dev").await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].format, DEFAULT_RSS_FORMAT);
    }

    #[tokio::test]
    async fn rss_seen_is_capped() {
        let db = Db::connect_in_memory().await.unwrap();
        let (id, _) = db.rss_add("net", "#dev", "https://e.org/f.xml").await.unwrap();

        let ids: Vec<String> = (0..600).map(|i| format!("entry-{i}")).collect();
        db.rss_mark_seen(id, &ids).await.unwrap();

        let seen = db.rss_get_seen(id).await.unwrap();
        assert_eq!(seen.len(), 500);
        assert!(seen.contains("entry-599"), "newest entries survive the cap");
        assert!(!seen.contains("entry-0"));
    }

    #[tokio::test]
    async fn rss_seen_is_removed_with_feed() {
        let db = Db::connect_in_memory().await.unwrap();
        let (id, _) = db.rss_add("net", "#dev", "https://e.org/f.xml").await.unwrap();
        db.rss_mark_seen(id, &["a".to_string()]).await.unwrap();

        assert!(db.rss_remove("net", "#dev", "https://e.org/f.xml").await.unwrap());
        assert!(db.rss_get_seen(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_channel_leaves_other_channels() {
        let db = Db::connect_in_memory().await.unwrap();
        db.webhook_add("net", "#dev", "a/b", None, None, None).await.unwrap();
        db.webhook_add("net", "#ops", "a/b", None, None, None).await.unwrap();
        db.rss_add("net", "#dev", "u").await.unwrap();

        db.purge_channel("net", "#dev").await.unwrap();
        assert!(db.webhook_list("net", "#dev").await.unwrap().is_empty());
        assert!(db.rss_list("net", "#dev").await.unwrap().is_empty());
        assert_eq!(db.webhook_list("net", "#ops").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn owner_upsert_and_hostmasks() {
        let db = Db::connect_in_memory().await.unwrap();
        assert!(db.owner().await.unwrap().is_none());

        db.owner_set("alice", "hash1").await.unwrap();
        db.owner_set("alice", "hash2").await.unwrap();
        let owner = db.owner().await.unwrap().unwrap();
        assert_eq!(owner.password, "hash2");

        db.hostmask_add("alice!*@home.example").await.unwrap();
        db.hostmask_add("alice!*@home.example").await.unwrap();
        assert_eq!(db.hostmask_list().await.unwrap().len(), 1);
        assert!(db.hostmask_remove("alice!*@home.example").await.unwrap());
        assert!(!db.hostmask_remove("alice!*@home.example").await.unwrap());
    }
}
