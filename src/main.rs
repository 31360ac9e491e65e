use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gitbot::bot::Bot;
use gitbot::config::Config;
use gitbot::db::Db;
use gitbot::error::AuthError;
use gitbot::rss::{Deliver, RssPoller};
use gitbot::webhook::{WebhookServer, WebhookSink};

#[derive(Parser)]
#[command(name = "gitbot", about = "Git webhook and RSS to IRC relay")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "gitbot.toml")]
    config: PathBuf,

    /// Create or reset the owner account, then start the bot.
    #[arg(long)]
    setup: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = Config::load(&cli.config)?;
    let db = Db::connect(&config.database).await?;

    if cli.setup {
        run_setup(&db).await?;
    } else if db.owner().await?.is_none() {
        return Err(AuthError::NoOwner).with_context(|| {
            format!(
                "run with --setup first: gitbot --setup -c {}",
                cli.config.display()
            )
        });
    }

    let bot = Bot::new(config.clone(), cli.config.clone(), db.clone());
    bot.start().await?;

    if config.webhook_server.enabled {
        let sink: Arc<dyn WebhookSink> = bot.clone();
        let server = Arc::new(WebhookServer::new(&config.webhook_server, sink));
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!("Webhook server failed: {e}");
            }
        });
    }

    if config.rss.enabled {
        let deliver: Arc<dyn Deliver> = bot.clone();
        let poller = RssPoller::new(db, deliver, config.rss.interval)?;
        tokio::spawn(poller.run());
    }

    tracing::info!("gitbot started");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    bot.stop("Shutting down").await;
    Ok(())
}

/// Interactive terminal setup for the owner account.
async fn run_setup(db: &Db) -> anyhow::Result<()> {
    if db.owner().await?.is_some() {
        let answer = prompt("An owner account already exists. Reset it? [y/N] ")?;
        if !answer.eq_ignore_ascii_case("y") {
            println!("Setup cancelled.");
            return Ok(());
        }
    }

    println!("── gitbot owner account setup ──────────────────");
    let nick = prompt("Owner nick: ")?;
    if nick.is_empty() {
        anyhow::bail!("Nick cannot be empty.");
    }
    let password = loop {
        let password = prompt("Password: ")?;
        let confirm = prompt("Confirm password: ")?;
        if password.is_empty() {
            println!("Password cannot be empty.");
        } else if password != confirm {
            println!("Passwords do not match, try again.");
        } else {
            break password;
        }
    };

    let hash = gitbot::auth::hash_password(&password)?;
    db.owner_set(&nick, &hash).await?;
    println!("Owner account created for '{nick}'.");
    println!("You can now /msg the bot:  identify <password>");
    Ok(())
}

fn prompt(message: &str) -> io::Result<String> {
    print!("{message}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
