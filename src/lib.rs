//! gitbot relays git forge webhooks (GitHub, Gitea, GitLab) and RSS/Atom
//! feeds onto IRC channels. Topology lives in a TOML file and can be
//! reloaded at runtime; routes and feeds are managed over IRC by an
//! authenticated owner.

pub mod auth;
pub mod bot;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod irc;
pub mod rss;
pub mod webhook;

pub use bot::Bot;
pub use config::Config;
pub use db::Db;
pub use error::{Error, Result};
