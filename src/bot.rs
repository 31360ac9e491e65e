//! The router: owns the IRC engines, reacts to commands, and fans webhook
//! and RSS events out to channels.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::auth::Sessions;
use crate::commands::{self, CommandOutcome};
use crate::config::{Config, NetworkConfig};
use crate::db::{Db, WebhookTarget};
use crate::error::Result;
use crate::irc::format::{color, COLOR_REPO};
use crate::irc::{EventSink, IrcClient};
use crate::rss::Deliver;
use crate::webhook::{Forge, WebhookSink};

/// Time given to the server to process a JOIN before the first message.
const JOIN_GRACE: Duration = Duration::from_secs(2);

struct NetworkEntry {
    client: Arc<IrcClient>,
    task: JoinHandle<()>,
}

pub struct Bot {
    weak: Weak<Bot>,
    config_path: PathBuf,
    config: RwLock<Config>,
    db: Db,
    pub sessions: Sessions,
    networks: Mutex<HashMap<String, NetworkEntry>>,
}

impl Bot {
    pub fn new(config: Config, config_path: PathBuf, db: Db) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config_path,
            config: RwLock::new(config),
            db,
            sessions: Sessions::default(),
            networks: Mutex::new(HashMap::new()),
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Seed the database from the static config and connect every network.
    pub async fn start(&self) -> Result<()> {
        let config = self.config.read().await.clone();
        self.load_static_bindings(&config).await?;

        let mut networks = self.networks.lock().await;
        for net in config.networks {
            let name = net.name.clone();
            if let Some(entry) = self.spawn_network(net, config.bind.clone()) {
                networks.insert(name, entry);
            }
        }
        Ok(())
    }

    /// Disconnect every network, e.g. on shutdown.
    pub async fn stop(&self, reason: &str) {
        let mut networks = self.networks.lock().await;
        for (_, entry) in networks.drain() {
            entry.client.stop(reason).await;
            entry.task.abort();
        }
    }

    /// Webhook and RSS bindings declared in the config file are merged into
    /// the database on every (re)load; runtime additions are kept.
    async fn load_static_bindings(&self, config: &Config) -> Result<()> {
        for net in &config.networks {
            for channel in &net.channels {
                for hook in &channel.webhooks {
                    self.db
                        .webhook_add(
                            &net.name,
                            &channel.name,
                            &hook.repo,
                            None,
                            hook.events.as_deref(),
                            hook.branches.as_deref(),
                        )
                        .await?;
                }
                for url in &channel.rss {
                    self.db.rss_add(&net.name, &channel.name, url).await?;
                }
            }
        }
        Ok(())
    }

    fn spawn_network(&self, config: NetworkConfig, global_bind: Option<String>) -> Option<NetworkEntry> {
        let sink: Arc<dyn EventSink> = self.weak.upgrade()?;
        let client = IrcClient::new(config, global_bind, sink);
        let task = tokio::spawn(Arc::clone(&client).run());
        Some(NetworkEntry { client, task })
    }

    async fn client(&self, network: &str) -> Option<Arc<IrcClient>> {
        self.networks
            .lock()
            .await
            .get(network)
            .map(|entry| Arc::clone(&entry.client))
    }

    // ── Hot reload ──

    /// Re-read the config file and reconcile the running topology:
    /// new networks connect, removed networks disconnect and are purged,
    /// kept networks join and part the channel difference. Returns a
    /// human-readable summary.
    pub async fn reload(&self) -> String {
        let new_config = match Config::load(&self.config_path) {
            Ok(config) => config,
            Err(e) => return format!("Failed to reload config: {e}"),
        };
        if let Err(e) = self.load_static_bindings(&new_config).await {
            return format!("Failed to reload config: {e}");
        }

        let global_bind = new_config.bind.clone();
        let mut new_nets: HashMap<String, NetworkConfig> = new_config
            .networks
            .iter()
            .map(|n| (n.name.clone(), n.clone()))
            .collect();
        *self.config.write().await = new_config;

        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut updated = Vec::new();

        let mut networks = self.networks.lock().await;

        let current: Vec<String> = networks.keys().cloned().collect();
        for name in current {
            if new_nets.contains_key(&name) {
                continue;
            }
            if let Some(entry) = networks.remove(&name) {
                tracing::info!("Reload: disconnecting {name}");
                entry.client.stop("Configuration removed").await;
                if let Err(e) = self.db.purge_network(&name).await {
                    tracing::warn!("Failed to purge {name}: {e}");
                }
                removed.push(name);
            }
        }

        for (name, net) in new_nets.drain() {
            match networks.get(&name) {
                None => {
                    tracing::info!("Reload: connecting new network {name}");
                    if let Some(entry) = self.spawn_network(net, global_bind.clone()) {
                        networks.insert(name.clone(), entry);
                        added.push(name);
                    }
                }
                Some(entry) => {
                    let wanted = net.channel_names();
                    let current = entry.client.desired_channels().await;

                    for channel in wanted.difference(&current) {
                        tracing::info!("Reload: joining {channel} on {name}");
                        entry.client.join(channel).await;
                    }
                    for channel in current.difference(&wanted) {
                        tracing::info!("Reload: parting {channel} on {name}");
                        entry.client.part(channel, "Removed from config").await;
                        if let Err(e) = self.db.purge_channel(&name, channel).await {
                            tracing::warn!("Failed to purge {name}/{channel}: {e}");
                        }
                    }
                    if wanted != current {
                        updated.push(name);
                    }
                }
            }
        }
        drop(networks);

        added.sort();
        removed.sort();
        updated.sort();

        let mut parts = Vec::new();
        if !added.is_empty() {
            parts.push(format!("connected: {}", added.join(", ")));
        }
        if !removed.is_empty() {
            parts.push(format!("disconnected: {}", removed.join(", ")));
        }
        if !updated.is_empty() {
            parts.push(format!("channels updated: {}", updated.join(", ")));
        }
        if parts.is_empty() {
            "Reloaded. no network changes.".to_string()
        } else {
            format!("Reloaded. {}", parts.join("; "))
        }
    }

    // ── Delivery ──

    /// Send a line to a channel, joining it first if needed.
    async fn deliver_irc(&self, network: &str, channel: &str, message: &str) {
        let Some(client) = self.client(network).await else {
            tracing::warn!("No client for network {network}");
            return;
        };
        if !client.in_channel(channel).await {
            tracing::debug!("[{network}] Not in {channel} yet, joining");
            client.join(channel).await;
            tokio::time::sleep(JOIN_GRACE).await;
        }
        client.privmsg(channel, message).await;
    }

    async fn send_replies(&self, network: &str, target: &str, outcome: CommandOutcome) {
        let reload = outcome.reload;
        let is_channel = target.starts_with('#');
        for reply in outcome.replies {
            self.send_reply(network, target, is_channel, &reply).await;
        }
        if reload {
            let summary = self.reload().await;
            self.send_reply(network, target, is_channel, &summary).await;
        }
    }

    async fn send_reply(&self, network: &str, target: &str, is_channel: bool, message: &str) {
        if is_channel {
            self.deliver_irc(network, target, message).await;
        } else if let Some(client) = self.client(network).await {
            client.privmsg(target, message).await;
        }
    }

    // ── Webhook routing ──

    async fn route_webhook(
        &self,
        forge: Forge,
        headers: HashMap<String, String>,
        payload: serde_json::Value,
    ) {
        let names = forge.names(&payload);
        let branch = forge.branch(&payload);
        let events = forge.event(&payload, &headers);
        let primary = events.first().map(String::as_str).unwrap_or("");

        let targets = match self.db.webhook_targets(forge, &names).await {
            Ok(targets) => targets,
            Err(e) => {
                tracing::warn!("[{forge}] Target lookup failed: {e}");
                return;
            }
        };
        if targets.is_empty() {
            tracing::debug!("[{forge}] No targets for {:?}", names.full_name);
            return;
        }

        let full_name = names.full_name.as_deref().unwrap_or_default();
        let outputs = forge.render(full_name, primary, &payload);
        if outputs.is_empty() {
            return;
        }

        let source = color(names.display(forge), COLOR_REPO);
        for target in targets {
            if !target_accepts(forge, &target, branch.as_deref(), &events) {
                continue;
            }
            for (message, url) in &outputs {
                let line = format_line(&source, message, url.as_deref());
                self.deliver_irc(&target.network, &target.channel, &line).await;
            }
        }
    }
}

/// Per-target delivery filter: the branch allow-list (when the payload
/// carries a branch) and the event category subscription.
fn target_accepts(
    forge: Forge,
    target: &WebhookTarget,
    branch: Option<&str>,
    events: &[String],
) -> bool {
    if let Some(branch) = branch {
        if !target.branches.is_empty() && !target.branches.iter().any(|b| b == branch) {
            return false;
        }
    }
    event_allowed(forge, &target.events, events)
}

/// True when any of the payload's event tags falls in one of the target's
/// subscribed categories.
fn event_allowed(forge: Forge, subscribed: &[String], events: &[String]) -> bool {
    let allowed: HashSet<&str> = subscribed
        .iter()
        .flat_map(|category| forge.expand_category(category))
        .collect();
    events.iter().any(|event| allowed.contains(event.as_str()))
}

fn format_line(source: &str, message: &str, url: Option<&str>) -> String {
    match url {
        Some(url) => format!("({source}) {message} - {url}"),
        None => format!("({source}) {message}"),
    }
}

#[async_trait::async_trait]
impl EventSink for Bot {
    async fn on_message(&self, network: &str, target: &str, nick: &str, prefix: &str, text: &str) {
        let Some(client) = self.client(network).await else {
            return;
        };
        let own_nick = client.current_nick().await;

        let outcome = if target.eq_ignore_ascii_case(&own_nick) {
            commands::handle_pm(&self.db, &self.sessions, nick, prefix, text).await
        } else if target.starts_with('#') {
            commands::handle_channel(&self.db, &self.sessions, network, target, nick, prefix, text)
                .await
        } else {
            return;
        };

        match outcome {
            Ok(outcome) => {
                // PM replies go back to the sender, not to our own nick.
                let reply_target = if target.eq_ignore_ascii_case(&own_nick) {
                    nick
                } else {
                    target
                };
                self.send_replies(network, reply_target, outcome).await;
            }
            Err(e) => tracing::warn!("[{network}] Command from {prefix} failed: {e}"),
        }
    }

    async fn on_connected(&self, network: &str) {
        tracing::info!("[{network}] Connected and registered");
    }
}

#[async_trait::async_trait]
impl WebhookSink for Bot {
    async fn deliver(&self, forge: Forge, headers: HashMap<String, String>, payload: serde_json::Value) {
        self.route_webhook(forge, headers, payload).await;
    }
}

#[async_trait::async_trait]
impl Deliver for Bot {
    async fn deliver(&self, network: &str, channel: &str, message: &str) {
        self.deliver_irc(network, channel, message).await;
    }
}
