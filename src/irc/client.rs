//! Per-network IRC connection engine.
//!
//! Each [`IrcClient`] owns one TCP/TLS socket and runs a reconnect loop
//! with exponential backoff. Inbound events are forwarded to an
//! [`EventSink`] implemented by the router; outbound traffic goes through
//! a per-connection writer task, so `send` never blocks on the socket.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::sync::{Notify, RwLock, mpsc};
use tokio::time::{sleep, timeout};

use crate::config::NetworkConfig;
use crate::error::IrcError;

/// First reconnect delay, in seconds.
pub const RECONNECT_DELAY_MIN: u64 = 5;
/// Reconnect delay ceiling, in seconds.
pub const RECONNECT_DELAY_MAX: u64 = 300;

/// A read with no data for this long is treated as a dead connection.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// Grace period before rejoining a channel we were kicked from.
const KICK_REJOIN_GRACE: Duration = Duration::from_secs(5);
/// Time allowed for QUIT to flush before the socket is closed.
const QUIT_GRACE: Duration = Duration::from_millis(500);
/// Hard IRC line limit, including CRLF.
const MAX_LINE: usize = 512;

/// Events the engine hands to its owner. The router implements this.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// A PRIVMSG arrived. `prefix` is the full `nick!user@host`.
    async fn on_message(&self, network: &str, target: &str, nick: &str, prefix: &str, text: &str);

    /// Registration completed: 001 received, channel joins issued.
    async fn on_connected(&self, network: &str);
}

trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// One IRC network connection, with automatic reconnection.
pub struct IrcClient {
    config: NetworkConfig,
    sink: Arc<dyn EventSink>,
    /// Channels we are currently in, lower-cased.
    channels: RwLock<HashSet<String>>,
    /// Channels we want to be in; joined on every (re)registration.
    desired: RwLock<HashSet<String>>,
    /// Nick currently in use; diverges from the configured one after 433.
    nick: RwLock<String>,
    /// Sender for the active connection's writer task, if connected.
    out: RwLock<Option<mpsc::UnboundedSender<String>>>,
    reconnect_delay: AtomicU64,
    running: AtomicBool,
    stopped: Notify,
}

impl IrcClient {
    /// Create an engine for one network. `global_bind` applies when the
    /// network has no `bind` of its own.
    pub fn new(
        mut config: NetworkConfig,
        global_bind: Option<String>,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        if config.bind.is_none() {
            config.bind = global_bind;
        }
        let desired = config.channel_names();
        let nick = config.nickname.clone();
        Arc::new(Self {
            config,
            sink,
            channels: RwLock::new(HashSet::new()),
            desired: RwLock::new(desired),
            nick: RwLock::new(nick),
            out: RwLock::new(None),
            reconnect_delay: AtomicU64::new(RECONNECT_DELAY_MIN),
            running: AtomicBool::new(true),
            stopped: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The nick currently in use on this network.
    pub async fn current_nick(&self) -> String {
        self.nick.read().await.clone()
    }

    /// Connect-and-read loop. Runs until `stop()`; every transport or
    /// protocol failure falls through to a backoff sleep and a retry.
    pub async fn run(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.connect_once().await {
                tracing::warn!("[{}] Connection error: {}", self.config.name, e);
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let delay = self.reconnect_delay.load(Ordering::SeqCst);
            tracing::info!("[{}] Reconnecting in {}s", self.config.name, delay);
            tokio::select! {
                _ = self.stopped.notified() => break,
                _ = sleep(Duration::from_secs(delay)) => {}
            }
            self.reconnect_delay
                .store(next_delay(delay), Ordering::SeqCst);
        }
        tracing::info!("[{}] Connection loop stopped", self.config.name);
    }

    /// Gracefully disconnect and permanently stop the reconnect loop.
    /// QUIT and its flush grace only apply when a connection exists.
    pub async fn stop(&self, reason: &str) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.out.write().await.take() {
            tracing::debug!("[{}] >> QUIT :{reason}", self.config.name);
            let _ = tx.send(format!("QUIT :{reason}"));
            sleep(QUIT_GRACE).await;
        }
        self.stopped.notify_waiters();
    }

    /// Queue one raw protocol line. A no-op while disconnected.
    pub async fn send(&self, line: &str) {
        let tx = self.out.read().await.clone();
        if let Some(tx) = tx {
            tracing::debug!("[{}] >> {}", self.config.name, line);
            let _ = tx.send(line.to_string());
        }
    }

    /// Send `text` to `target`, fragmented so every emitted line fits the
    /// 512-byte limit including the `PRIVMSG <target> :` prefix and CRLF.
    pub async fn privmsg(&self, target: &str, text: &str) {
        for line in split_privmsg(target, text) {
            self.send(&line).await;
        }
    }

    /// Join a channel now and on every future registration.
    pub async fn join(&self, channel: &str) {
        self.desired.write().await.insert(channel.to_lowercase());
        self.send(&format!("JOIN {channel}")).await;
    }

    /// Part a channel and drop it from the desired set.
    pub async fn part(&self, channel: &str, reason: &str) {
        self.desired.write().await.remove(&channel.to_lowercase());
        self.send(&format!("PART {channel} :{reason}")).await;
    }

    /// Membership query, case-insensitive.
    pub async fn in_channel(&self, channel: &str) -> bool {
        self.channels.read().await.contains(&channel.to_lowercase())
    }

    /// Snapshot of the joined-channel set.
    pub async fn joined_channels(&self) -> HashSet<String> {
        self.channels.read().await.clone()
    }

    /// Snapshot of the channels this client wants to be in.
    pub async fn desired_channels(&self) -> HashSet<String> {
        self.desired.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Connection ──

    async fn connect_once(&self) -> Result<(), IrcError> {
        tracing::info!(
            "[{}] Connecting to {}:{} (tls={})",
            self.config.name,
            self.config.host,
            self.config.port,
            self.config.tls
        );

        let stream = self.open_stream().await?;
        // A stop() that fired while the connect was in flight has no
        // waiter to notify; recheck the flag before registering.
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (read_half, mut write_half) = tokio::io::split(stream);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.out.write().await = Some(tx);
        self.channels.write().await.clear();
        *self.nick.write().await = self.config.nickname.clone();

        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err()
                    || write_half.write_all(b"\r\n").await.is_err()
                {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        if self.config.sasl.is_some() {
            self.send("CAP REQ :sasl").await;
        }
        self.send(&format!("NICK {}", self.config.nickname)).await;
        self.send(&format!(
            "USER {} 0 * :{}",
            self.config.username(),
            self.config.realname()
        ))
        .await;

        let result = self.read_loop(read_half).await;

        *self.out.write().await = None;
        self.channels.write().await.clear();
        result
    }

    async fn open_stream(&self) -> Result<Box<dyn Transport>, IrcError> {
        let tcp = self.open_tcp().await?;
        if !self.config.tls {
            return Ok(Box::new(tcp));
        }
        let mut builder = native_tls::TlsConnector::builder();
        if !self.config.tls_verify {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        let connector = tokio_native_tls::TlsConnector::from(builder.build()?);
        let stream = connector.connect(&self.config.host, tcp).await?;
        Ok(Box::new(stream))
    }

    async fn open_tcp(&self) -> Result<TcpStream, IrcError> {
        let host = self.config.host.as_str();
        let port = self.config.port;
        let mut addrs = lookup_host((host, port)).await?;

        let Some(bind) = &self.config.bind else {
            let addr = addrs.next().ok_or_else(|| IrcError::NoAddress {
                host: host.to_string(),
                port,
            })?;
            return Ok(TcpStream::connect(addr).await?);
        };

        let local: IpAddr = bind.parse().map_err(|_| IrcError::NoAddress {
            host: bind.clone(),
            port: 0,
        })?;
        let addr = addrs
            .find(|a| a.is_ipv4() == local.is_ipv4())
            .ok_or_else(|| IrcError::NoAddress {
                host: host.to_string(),
                port,
            })?;
        let socket = if local.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(SocketAddr::new(local, 0))?;
        Ok(socket.connect(addr).await?)
    }

    /// Line-oriented read loop. Splits on `\n`, tolerates `\r`, decodes
    /// lossily. Returns when the server closes, the idle window elapses,
    /// or `stop()` is called.
    async fn read_loop<R: AsyncRead + Unpin>(&self, read: R) -> Result<(), IrcError> {
        let mut reader = BufReader::new(read);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            // Arm the stop waiter before checking the flag so a stop()
            // landing between the two is never missed.
            let stopped = self.stopped.notified();
            tokio::pin!(stopped);
            stopped.as_mut().enable();
            if !self.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            let n = tokio::select! {
                _ = &mut stopped => return Ok(()),
                res = timeout(IDLE_TIMEOUT, reader.read_until(b'\n', &mut buf)) => match res {
                    Err(_) => {
                        tracing::warn!("[{}] Read timeout, disconnecting", self.config.name);
                        return Ok(());
                    }
                    Ok(read) => read?,
                },
            };
            if n == 0 {
                tracing::info!("[{}] Connection closed by server", self.config.name);
                return Ok(());
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.is_empty() {
                self.handle_line(line).await;
            }
        }
    }

    // ── Protocol handling ──

    async fn handle_line(&self, raw: &str) {
        tracing::debug!("[{}] << {}", self.config.name, raw);

        if raw.starts_with("PING") {
            let token = match raw.split_once(':') {
                Some((_, t)) => t,
                None => raw.split_once(' ').map(|(_, t)| t).unwrap_or(""),
            };
            self.send(&format!("PONG :{token}")).await;
            return;
        }

        let parts: Vec<&str> = raw.split(' ').collect();

        // CAP negotiation for SASL
        if parts.len() >= 3 && parts[1] == "CAP" {
            let sub = parts.get(3).copied().unwrap_or("");
            if (sub == "ACK" || sub == ":ACK") && raw.contains("sasl") {
                self.send("AUTHENTICATE PLAIN").await;
            }
            return;
        }

        if parts.first() == Some(&"AUTHENTICATE") {
            if let Some(sasl) = &self.config.sasl {
                let token = BASE64.encode(format!("\0{}\0{}", sasl.user, sasl.password));
                self.send(&format!("AUTHENTICATE {token}")).await;
            }
            return;
        }

        match parts.get(1).copied().unwrap_or("") {
            // SASL success
            "903" => self.send("CAP END").await,
            // SASL failure: log and register unauthenticated anyway
            "904" | "905" => {
                tracing::error!("[{}] SASL authentication failed", self.config.name);
                self.send("CAP END").await;
            }
            // Welcome: we are registered
            "001" => self.on_welcome().await,
            // Nick in use
            "433" => {
                let new_nick = format!("{}_", self.nick.read().await);
                tracing::warn!("[{}] Nick in use, trying {}", self.config.name, new_nick);
                *self.nick.write().await = new_nick.clone();
                self.send(&format!("NICK {new_nick}")).await;
            }
            "JOIN" if parts.len() >= 3 => {
                let channel = parts[2].trim_start_matches(':').to_lowercase();
                if self.is_own_nick(prefix_nick(parts[0])).await {
                    self.channels.write().await.insert(channel.clone());
                    tracing::info!("[{}] Joined {}", self.config.name, channel);
                }
            }
            "PART" if parts.len() >= 3 => {
                let channel = parts[2].trim_start_matches(':').to_lowercase();
                if self.is_own_nick(prefix_nick(parts[0])).await {
                    self.channels.write().await.remove(&channel);
                    tracing::info!("[{}] Parted {}", self.config.name, channel);
                }
            }
            "KICK" if parts.len() >= 4 => {
                let channel = parts[2].to_lowercase();
                let victim = parts[3].trim_start_matches(':');
                if self.is_own_nick(victim).await {
                    self.channels.write().await.remove(&channel);
                    tracing::warn!(
                        "[{}] Kicked from {}, rejoining in {}s",
                        self.config.name,
                        channel,
                        KICK_REJOIN_GRACE.as_secs()
                    );
                    let tx = self.out.read().await.clone();
                    tokio::spawn(async move {
                        sleep(KICK_REJOIN_GRACE).await;
                        if let Some(tx) = tx {
                            let _ = tx.send(format!("JOIN {channel}"));
                        }
                    });
                }
            }
            "PRIVMSG" if parts.len() >= 4 => {
                let prefix = parts[0].trim_start_matches(':');
                let nick = prefix_nick(parts[0]);
                let target = parts[2];
                let text = parts[3..].join(" ");
                let text = text.strip_prefix(':').unwrap_or(&text);
                self.sink
                    .on_message(&self.config.name, target, nick, prefix, text)
                    .await;
            }
            _ => {}
        }
    }

    async fn on_welcome(&self) {
        self.reconnect_delay
            .store(RECONNECT_DELAY_MIN, Ordering::SeqCst);
        tracing::info!(
            "[{}] Registered as {}",
            self.config.name,
            self.nick.read().await
        );

        if let Some(pw) = &self.config.nickserv_password {
            self.send(&format!("PRIVMSG NickServ :IDENTIFY {pw}")).await;
        }

        let desired: Vec<String> = self.desired.read().await.iter().cloned().collect();
        for channel in desired {
            self.send(&format!("JOIN {channel}")).await;
        }

        self.sink.on_connected(&self.config.name).await;
    }

    async fn is_own_nick(&self, nick: &str) -> bool {
        nick.eq_ignore_ascii_case(&self.nick.read().await)
    }
}

/// Extract the nick from a `:nick!user@host` prefix.
fn prefix_nick(prefix: &str) -> &str {
    prefix
        .trim_start_matches(':')
        .split('!')
        .next()
        .unwrap_or("")
}

/// Double the reconnect delay up to the ceiling.
fn next_delay(current: u64) -> u64 {
    (current.saturating_mul(2)).min(RECONNECT_DELAY_MAX)
}

/// Fragment `text` into PRIVMSG lines that each fit [`MAX_LINE`] bytes
/// including prefix and CRLF. Splits on UTF-8 character boundaries so no
/// fragment is ever mid-codepoint.
fn split_privmsg(target: &str, text: &str) -> Vec<String> {
    let prefix = format!("PRIVMSG {target} :");
    let limit = MAX_LINE.saturating_sub(2 + prefix.len()).max(1);
    let mut out = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut cut = limit.min(rest.len());
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (chunk, tail) = rest.split_at(cut);
        out.push(format!("{prefix}{chunk}"));
        rest = tail;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<(String, String, String, String, String)>>,
        connected: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl EventSink for RecordingSink {
        async fn on_message(
            &self,
            network: &str,
            target: &str,
            nick: &str,
            prefix: &str,
            text: &str,
        ) {
            self.messages.lock().await.push((
                network.to_string(),
                target.to_string(),
                nick.to_string(),
                prefix.to_string(),
                text.to_string(),
            ));
        }

        async fn on_connected(&self, network: &str) {
            self.connected.lock().await.push(network.to_string());
        }
    }

    fn test_config() -> NetworkConfig {
        toml::from_str(
            r##"
            name = "testnet"
            host = "127.0.0.1"
            port = 6667
            nickname = "gitbot"

            [[channel]]
            name = "#dev"
        "##,
        )
        .unwrap()
    }

    async fn wired_client() -> (
        Arc<IrcClient>,
        Arc<RecordingSink>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let sink = Arc::new(RecordingSink::default());
        let client = IrcClient::new(test_config(), None, sink.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        *client.out.write().await = Some(tx);
        (client, sink, rx)
    }

    #[tokio::test]
    async fn ping_is_answered_with_same_token() {
        let (client, _sink, mut rx) = wired_client().await;
        client.handle_line("PING :irc.example.org").await;
        assert_eq!(rx.try_recv().unwrap(), "PONG :irc.example.org");
    }

    #[tokio::test]
    async fn ping_without_colon_uses_trailing_word() {
        let (client, _sink, mut rx) = wired_client().await;
        client.handle_line("PING token123").await;
        assert_eq!(rx.try_recv().unwrap(), "PONG :token123");
    }

    #[tokio::test]
    async fn own_join_tracks_membership() {
        let (client, _sink, _rx) = wired_client().await;
        client
            .handle_line(":gitbot!bot@host JOIN :#Dev")
            .await;
        assert!(client.in_channel("#dev").await);
        assert!(client.in_channel("#DEV").await);
    }

    #[tokio::test]
    async fn other_users_join_is_ignored() {
        let (client, _sink, _rx) = wired_client().await;
        client.handle_line(":alice!a@host JOIN :#dev").await;
        assert!(!client.in_channel("#dev").await);
    }

    #[tokio::test]
    async fn own_part_removes_membership_but_others_does_not() {
        let (client, _sink, _rx) = wired_client().await;
        client.handle_line(":gitbot!bot@host JOIN :#dev").await;
        client.handle_line(":alice!a@host PART #dev :bye").await;
        assert!(client.in_channel("#dev").await);
        client.handle_line(":gitbot!bot@host PART #dev :bye").await;
        assert!(!client.in_channel("#dev").await);
    }

    #[tokio::test(start_paused = true)]
    async fn kick_removes_membership_and_rejoins_after_grace() {
        let (client, _sink, mut rx) = wired_client().await;
        client.handle_line(":gitbot!bot@host JOIN :#dev").await;
        client
            .handle_line(":op!op@host KICK #dev gitbot :begone")
            .await;
        assert!(!client.in_channel("#dev").await);
        // The rejoin arrives only after the grace period (paused clock
        // auto-advances once everything is idle).
        assert_eq!(rx.recv().await.unwrap(), "JOIN #dev");
    }

    #[tokio::test]
    async fn kick_of_other_user_is_ignored() {
        let (client, _sink, _rx) = wired_client().await;
        client.handle_line(":gitbot!bot@host JOIN :#dev").await;
        client
            .handle_line(":op!op@host KICK #dev alice :begone")
            .await;
        assert!(client.in_channel("#dev").await);
    }

    #[tokio::test]
    async fn nick_in_use_retries_with_suffix_and_tracks_it() {
        let (client, _sink, mut rx) = wired_client().await;
        client
            .handle_line(":server 433 * gitbot :Nickname is already in use")
            .await;
        assert_eq!(rx.try_recv().unwrap(), "NICK gitbot_");
        assert_eq!(client.current_nick().await, "gitbot_");
        // Membership tracking follows the new nick.
        client.handle_line(":gitbot_!bot@host JOIN :#dev").await;
        assert!(client.in_channel("#dev").await);
    }

    #[tokio::test]
    async fn welcome_joins_desired_channels_and_resets_backoff() {
        let (client, sink, mut rx) = wired_client().await;
        client.reconnect_delay.store(80, Ordering::SeqCst);
        client.handle_line(":server 001 gitbot :Welcome").await;
        assert_eq!(rx.try_recv().unwrap(), "JOIN #dev");
        assert_eq!(
            client.reconnect_delay.load(Ordering::SeqCst),
            RECONNECT_DELAY_MIN
        );
        assert_eq!(sink.connected.lock().await.as_slice(), ["testnet"]);
    }

    #[tokio::test]
    async fn privmsg_is_forwarded_to_sink() {
        let (client, sink, _rx) = wired_client().await;
        client
            .handle_line(":alice!a@host PRIVMSG #dev :hello there bot")
            .await;
        let messages = sink.messages.lock().await;
        assert_eq!(
            messages.as_slice(),
            [(
                "testnet".to_string(),
                "#dev".to_string(),
                "alice".to_string(),
                "alice!a@host".to_string(),
                "hello there bot".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn sasl_handshake_sends_plain_token() {
        let sink = Arc::new(RecordingSink::default());
        let mut config = test_config();
        config.sasl = Some(crate::config::SaslConfig {
            user: "gitbot".to_string(),
            password: "hunter2".to_string(),
        });
        let client = IrcClient::new(config, None, sink);
        let (tx, mut rx) = mpsc::unbounded_channel();
        *client.out.write().await = Some(tx);

        client.handle_line(":server CAP * ACK :sasl").await;
        assert_eq!(rx.try_recv().unwrap(), "AUTHENTICATE PLAIN");

        client.handle_line("AUTHENTICATE +").await;
        let expected = BASE64.encode("\0gitbot\0hunter2");
        assert_eq!(rx.try_recv().unwrap(), format!("AUTHENTICATE {expected}"));

        client.handle_line(":server 903 gitbot :SASL successful").await;
        assert_eq!(rx.try_recv().unwrap(), "CAP END");
    }

    #[tokio::test]
    async fn sasl_failure_still_ends_cap_negotiation() {
        let (client, _sink, mut rx) = wired_client().await;
        client.handle_line(":server 904 gitbot :SASL failed").await;
        assert_eq!(rx.try_recv().unwrap(), "CAP END");
    }

    #[test]
    fn backoff_doubles_to_ceiling() {
        // Nth retry delay = min(5 * 2^(N-1), 300)
        let mut delay = RECONNECT_DELAY_MIN;
        let mut observed = Vec::new();
        for _ in 0..8 {
            observed.push(delay);
            delay = next_delay(delay);
        }
        assert_eq!(observed, [5, 10, 20, 40, 80, 160, 300, 300]);
    }

    #[test]
    fn privmsg_lines_fit_protocol_limit() {
        let text = "a".repeat(2000);
        let lines = split_privmsg("#channel", &text);
        assert!(lines.len() > 1);
        for line in &lines {
            assert!(line.len() + 2 <= MAX_LINE, "line too long: {}", line.len());
            assert!(line.starts_with("PRIVMSG #channel :"));
        }
        let reassembled: String = lines
            .iter()
            .map(|l| &l["PRIVMSG #channel :".len()..])
            .collect();
        assert_eq!(reassembled, text);
    }

    #[test]
    fn privmsg_split_respects_utf8_boundaries() {
        let text = "é".repeat(1000);
        for line in split_privmsg("#dev", &text) {
            assert!(line.len() + 2 <= MAX_LINE);
            // Would panic on a mid-codepoint split.
            let _ = line.chars().count();
        }
    }

    #[test]
    fn privmsg_short_text_is_single_line() {
        let lines = split_privmsg("#dev", "hello");
        assert_eq!(lines, ["PRIVMSG #dev :hello"]);
    }

    #[tokio::test]
    async fn read_loop_exits_when_stop_won_the_race() {
        let (client, _sink, _rx) = wired_client().await;
        // A stop that completed while the engine was still connecting:
        // the flag is down and the notification fired with no waiter.
        client.running.store(false, Ordering::SeqCst);
        client.stopped.notify_waiters();
        // Reader that never yields a byte; kept open by _writer.
        let (reader, _writer) = tokio::io::duplex(64);
        timeout(Duration::from_secs(1), client.read_loop(reader))
            .await
            .expect("read loop must notice the stop")
            .unwrap();
    }

    #[tokio::test]
    async fn stop_while_disconnected_returns_immediately() {
        let sink = Arc::new(RecordingSink::default());
        let client = IrcClient::new(test_config(), None, sink);
        let start = std::time::Instant::now();
        client.stop("shutting down").await;
        assert!(start.elapsed() < QUIT_GRACE);
        assert!(!client.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_connected_sends_quit() {
        let (client, _sink, mut rx) = wired_client().await;
        client.stop("bye").await;
        assert_eq!(rx.recv().await.unwrap(), "QUIT :bye");
        assert!(client.out.read().await.is_none());
    }

    #[test]
    fn prefix_nick_strips_colon_and_host() {
        assert_eq!(prefix_nick(":alice!a@host"), "alice");
        assert_eq!(prefix_nick("alice!a@host"), "alice");
        assert_eq!(prefix_nick(":alice"), "alice");
    }
}
