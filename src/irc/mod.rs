//! IRC protocol layer: the per-network connection engine and message
//! formatting helpers.

pub mod client;
pub mod format;

pub use client::{EventSink, IrcClient, RECONNECT_DELAY_MAX, RECONNECT_DELAY_MIN};
