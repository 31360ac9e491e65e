//! Admin command dispatcher.
//!
//! `identify` and `logout` are PM-only. Everything else that changes state
//! requires an authenticated prefix; in channels, unauthenticated commands
//! are ignored silently so admin commands are not advertised to bystanders.

use crate::auth::{self, Sessions};
use crate::db::Db;
use crate::error::Result;

pub const PREFIX: &str = "!";

/// What the caller should do with a handled command.
#[derive(Debug, Default, PartialEq)]
pub struct CommandOutcome {
    /// Messages to send back to the origin (PM or channel).
    pub replies: Vec<String>,
    /// The command asked for a config reload; the caller reconciles and
    /// reports the result itself.
    pub reload: bool,
}

impl CommandOutcome {
    fn silent() -> Self {
        Self::default()
    }

    fn reply(message: impl Into<String>) -> Self {
        Self {
            replies: vec![message.into()],
            ..Self::default()
        }
    }

    fn replies(messages: Vec<String>) -> Self {
        Self {
            replies: messages,
            ..Self::default()
        }
    }

    fn reload() -> Self {
        Self {
            reload: true,
            ..Self::default()
        }
    }
}

/// Split `!cmd arg arg` into a lower-cased command and its arguments.
fn parse(text: &str) -> Option<(String, Vec<String>)> {
    let rest = text.strip_prefix(PREFIX)?;
    let mut parts = rest.split_whitespace();
    let cmd = parts.next()?.to_lowercase();
    Some((cmd, parts.map(str::to_string).collect()))
}

pub async fn handle_pm(
    db: &Db,
    sessions: &Sessions,
    nick: &str,
    prefix: &str,
    text: &str,
) -> Result<CommandOutcome> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let Some(first) = words.first() else {
        return Ok(CommandOutcome::silent());
    };
    let cmd = first.to_lowercase();

    // identify and logout are plain words in PM, no ! prefix.
    if cmd == "identify" {
        return identify(db, sessions, nick, prefix, &words).await;
    }
    if cmd == "logout" {
        sessions.logout(prefix).await;
        return Ok(CommandOutcome::reply("Logged out."));
    }

    if !auth::is_authenticated(db, sessions, prefix).await? {
        return Ok(CommandOutcome::reply(
            "You are not identified. Use: identify <password>",
        ));
    }

    let args: Vec<String> = words[1..].iter().map(|w| w.to_string()).collect();
    match cmd.as_str() {
        "hostmask" => hostmask(db, &args, prefix).await,
        "passwd" => passwd(db, &args).await,
        "help" | "bothelp" => Ok(pm_help()),
        _ => {
            // Accept both !-prefixed and bare commands in PM.
            let (bare_cmd, bare_args) = match parse(text) {
                Some(parsed) => parsed,
                None => (cmd.trim_start_matches('!').to_string(), args),
            };
            shared(db, &bare_cmd, &bare_args, None).await
        }
    }
}

pub async fn handle_channel(
    db: &Db,
    sessions: &Sessions,
    network: &str,
    channel: &str,
    nick: &str,
    prefix: &str,
    text: &str,
) -> Result<CommandOutcome> {
    let Some((cmd, args)) = parse(text) else {
        return Ok(CommandOutcome::silent());
    };

    if cmd == "identify" || cmd == "logout" {
        return Ok(CommandOutcome::reply(format!(
            "{nick}: please use a private message for that."
        )));
    }

    if !auth::is_authenticated(db, sessions, prefix).await? {
        return Ok(CommandOutcome::silent());
    }

    shared(db, &cmd, &args, Some((network, channel))).await
}

// Commands accepted in both PM and channel.

async fn shared(
    db: &Db,
    cmd: &str,
    args: &[String],
    location: Option<(&str, &str)>,
) -> Result<CommandOutcome> {
    match cmd {
        "reload" => Ok(CommandOutcome::reload()),
        "webhook" => match location {
            Some((network, channel)) => webhook(db, network, channel, args).await,
            None => Ok(CommandOutcome::reply("!webhook must be used in a channel.")),
        },
        "rss" => match location {
            Some((network, channel)) => rss(db, network, channel, args).await,
            None => Ok(CommandOutcome::reply("!rss must be used in a channel.")),
        },
        "help" | "bothelp" => Ok(channel_help()),
        _ => Ok(CommandOutcome::silent()),
    }
}

async fn identify(
    db: &Db,
    sessions: &Sessions,
    nick: &str,
    prefix: &str,
    words: &[&str],
) -> Result<CommandOutcome> {
    if words.len() < 2 {
        return Ok(CommandOutcome::reply(
            "Usage: identify <password>  or  identify <nick> <password>",
        ));
    }
    let Some(owner) = db.owner().await? else {
        return Ok(CommandOutcome::reply(
            "No owner account exists. Run the bot with --setup to create one.",
        ));
    };
    let password = if words.len() == 2 {
        if nick.to_lowercase() != owner.nick.to_lowercase() {
            return Ok(CommandOutcome::reply(
                "Your current nick doesn't match the owner nick. Use: identify <nick> <password>",
            ));
        }
        words[1]
    } else {
        words[2]
    };

    if auth::verify_password(password, &owner.password) {
        sessions.login(prefix).await;
        tracing::info!("Successful identify from {nick} ({prefix})");
        Ok(CommandOutcome::reply("You are now identified."))
    } else {
        tracing::warn!("Failed identify attempt from {nick} ({prefix})");
        Ok(CommandOutcome::reply("Wrong password."))
    }
}

async fn hostmask(db: &Db, args: &[String], current_prefix: &str) -> Result<CommandOutcome> {
    let Some(sub) = args.first() else {
        return Ok(CommandOutcome::reply(
            "hostmask add [mask]  — add mask (omit to use your current host)  |  \
             hostmask remove <mask>  |  \
             hostmask list",
        ));
    };

    match sub.to_lowercase().as_str() {
        "list" => {
            let masks = db.hostmask_list().await?;
            if masks.is_empty() {
                Ok(CommandOutcome::reply("No hostmasks registered."))
            } else {
                Ok(CommandOutcome::replies(
                    masks.into_iter().map(|m| format!("  {m}")).collect(),
                ))
            }
        }
        "add" => {
            let mask = args.get(1).map(String::as_str).unwrap_or(current_prefix);
            db.hostmask_add(mask).await?;
            Ok(CommandOutcome::reply(format!("Hostmask added: {mask}")))
        }
        "remove" => match args.get(1) {
            Some(mask) => {
                db.hostmask_remove(mask).await?;
                Ok(CommandOutcome::reply(format!("Hostmask removed: {mask}")))
            }
            None => Ok(CommandOutcome::reply("Usage: hostmask remove <mask>")),
        },
        _ => Ok(CommandOutcome::reply(
            "Unknown subcommand. Use: hostmask add|remove|list",
        )),
    }
}

async fn passwd(db: &Db, args: &[String]) -> Result<CommandOutcome> {
    let Some(new_password) = args.first() else {
        return Ok(CommandOutcome::reply("Usage: passwd <newpassword>"));
    };
    let hash = auth::hash_password(new_password)?;
    db.owner_set_password(&hash).await?;
    Ok(CommandOutcome::reply("Password updated."))
}

const WEBHOOK_HELP: &str = "!webhook list  |  \
    !webhook add <repo>  |  \
    !webhook remove <repo>  |  \
    !webhook events <repo> [event …]  |  \
    !webhook branches <repo> [branch …]";

async fn webhook(
    db: &Db,
    network: &str,
    channel: &str,
    args: &[String],
) -> Result<CommandOutcome> {
    let Some(sub) = args.first() else {
        return Ok(CommandOutcome::reply(WEBHOOK_HELP));
    };

    match sub.to_lowercase().as_str() {
        "list" => {
            let hooks = db.webhook_list(network, channel).await?;
            if hooks.is_empty() {
                Ok(CommandOutcome::reply(
                    "No webhooks registered for this channel.",
                ))
            } else {
                Ok(CommandOutcome::replies(
                    hooks
                        .into_iter()
                        .map(|h| {
                            let branches = if h.branches.is_empty() {
                                "all".to_string()
                            } else {
                                h.branches.join(", ")
                            };
                            format!(
                                "  {}  events={}  branches={branches}",
                                h.repo,
                                h.events.join(", ")
                            )
                        })
                        .collect(),
                ))
            }
        }
        "add" => match args.get(1) {
            Some(repo) => {
                db.webhook_add(network, channel, repo, None, None, None).await?;
                Ok(CommandOutcome::reply(format!("Webhook added for {repo}")))
            }
            None => Ok(CommandOutcome::reply("Usage: !webhook add <repo>")),
        },
        "remove" => match args.get(1) {
            Some(repo) => {
                db.webhook_remove(network, channel, repo, None).await?;
                Ok(CommandOutcome::reply(format!("Webhook removed for {repo}")))
            }
            None => Ok(CommandOutcome::reply("Usage: !webhook remove <repo>")),
        },
        "events" => {
            let Some(repo) = args.get(1) else {
                return Ok(CommandOutcome::reply("Usage: !webhook events <repo> [event …]"));
            };
            if args.len() == 2 {
                let hooks = db.webhook_list(network, channel).await?;
                match hooks.iter().find(|h| h.repo.eq_ignore_ascii_case(repo)) {
                    Some(hook) => Ok(CommandOutcome::reply(format!(
                        "{repo} events: {}",
                        hook.events.join(", ")
                    ))),
                    None => Ok(CommandOutcome::reply(format!("No webhook found for {repo}"))),
                }
            } else {
                let events: Vec<String> = args[2..].iter().map(|e| e.to_lowercase()).collect();
                if db.webhook_set_events(network, channel, repo, &events, None).await? {
                    Ok(CommandOutcome::reply(format!(
                        "Updated events for {repo}: {}",
                        events.join(", ")
                    )))
                } else {
                    Ok(CommandOutcome::reply(format!("No webhook found for {repo}")))
                }
            }
        }
        "branches" => {
            let Some(repo) = args.get(1) else {
                return Ok(CommandOutcome::reply(
                    "Usage: !webhook branches <repo> [branch …]",
                ));
            };
            if args.len() == 2 {
                let hooks = db.webhook_list(network, channel).await?;
                match hooks.iter().find(|h| h.repo.eq_ignore_ascii_case(repo)) {
                    Some(hook) => {
                        let branches = if hook.branches.is_empty() {
                            "all".to_string()
                        } else {
                            hook.branches.join(", ")
                        };
                        Ok(CommandOutcome::reply(format!("{repo} branches: {branches}")))
                    }
                    None => Ok(CommandOutcome::reply(format!("No webhook found for {repo}"))),
                }
            } else {
                let branches = &args[2..];
                if db
                    .webhook_set_branches(network, channel, repo, branches, None)
                    .await?
                {
                    Ok(CommandOutcome::reply(format!(
                        "Updated branches for {repo}: {}",
                        branches.join(", ")
                    )))
                } else {
                    Ok(CommandOutcome::reply(format!("No webhook found for {repo}")))
                }
            }
        }
        _ => Ok(CommandOutcome::reply(WEBHOOK_HELP)),
    }
}

const RSS_HELP: &str = "!rss list  |  \
    !rss add <url>  |  \
    !rss remove <url>  |  \
    !rss format <url> [template]";

async fn rss(db: &Db, network: &str, channel: &str, args: &[String]) -> Result<CommandOutcome> {
    let Some(sub) = args.first() else {
        return Ok(CommandOutcome::reply(RSS_HELP));
    };

    match sub.to_lowercase().as_str() {
        "list" => {
            let feeds = db.rss_list(network, channel).await?;
            if feeds.is_empty() {
                Ok(CommandOutcome::reply(
                    "No RSS feeds registered for this channel.",
                ))
            } else {
                Ok(CommandOutcome::replies(
                    feeds
                        .into_iter()
                        .map(|f| format!("  {}  format={}", f.url, f.format))
                        .collect(),
                ))
            }
        }
        "add" => match args.get(1) {
            Some(url) => {
                let (_, created) = db.rss_add(network, channel, url).await?;
                if created {
                    Ok(CommandOutcome::reply(format!("RSS feed added: {url}")))
                } else {
                    Ok(CommandOutcome::reply(format!("Already watching: {url}")))
                }
            }
            None => Ok(CommandOutcome::reply("Usage: !rss add <url>")),
        },
        "remove" => match args.get(1) {
            Some(url) => {
                db.rss_remove(network, channel, url).await?;
                Ok(CommandOutcome::reply(format!("RSS feed removed: {url}")))
            }
            None => Ok(CommandOutcome::reply("Usage: !rss remove <url>")),
        },
        "format" => {
            let Some(url) = args.get(1) else {
                return Ok(CommandOutcome::reply("Usage: !rss format <url> [template]"));
            };
            if args.len() == 2 {
                let feeds = db.rss_list(network, channel).await?;
                match feeds.iter().find(|f| &f.url == url) {
                    Some(feed) => Ok(CommandOutcome::reply(format!(
                        "Format for {url}: {}",
                        feed.format
                    ))),
                    None => Ok(CommandOutcome::reply(format!("No feed found for {url}"))),
                }
            } else {
                let template = args[2..].join(" ");
                if db.rss_set_format(network, channel, url, &template).await? {
                    Ok(CommandOutcome::reply(
                        "Format updated. Entry vars: $title $link $description \
                         $author $published $id  |  \
                         Feed vars: $feed_name $feed_title $feed_link $feed_author $feed_subtitle",
                    ))
                } else {
                    Ok(CommandOutcome::reply(format!("No feed found for {url}")))
                }
            }
        }
        _ => Ok(CommandOutcome::reply(RSS_HELP)),
    }
}

fn pm_help() -> CommandOutcome {
    CommandOutcome::replies(
        [
            "── PM commands ──────────────────────────────",
            "  identify <password>          log in (current nick must match owner nick)",
            "  identify <nick> <password>   log in from a different nick",
            "  logout                  end session",
            "  passwd <new>            change password",
            "  hostmask list           show auto-login masks",
            "  hostmask add [mask]     add mask (omit = your current host)",
            "  hostmask remove <mask>  remove a mask",
            "── Channel commands ─────────────────────────",
            "  !webhook list/add/remove/events/branches",
            "  !rss list/add/remove",
        ]
        .into_iter()
        .map(String::from)
        .collect(),
    )
}

fn channel_help() -> CommandOutcome {
    CommandOutcome::reply(
        "!webhook list/add/remove/events/branches  |  \
         !rss list/add/remove/format  |  \
         !reload  |  \
         PM the bot: identify, logout, passwd, hostmask",
    )
}
