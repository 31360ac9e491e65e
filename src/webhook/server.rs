//! Minimal HTTP listener for forge webhooks.
//!
//! Deliberately not a framework: one POST endpoint per forge, two optional
//! verification modes, and nothing else. Verification modes per forge:
//!
//! 1. URL token: append `?secret=<value>` to the webhook URL configured in
//!    the forge. Checked first when present; a mismatch is rejected even if
//!    a valid signature header is also present.
//! 2. Signature header: GitHub and Gitea send an HMAC-SHA256 of the body,
//!    GitLab sends the token itself in `X-Gitlab-Token`.
//!
//! A forge with no configured secret accepts every request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

use super::{Forge, WebhookSink};
use crate::config::WebhookServerConfig;
use crate::error::HttpError;

const MAX_BODY: usize = 10 * 1024 * 1024;
const MAX_LINE_BYTES: u64 = 8 * 1024;
const MAX_HEADERS: usize = 100;
const HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const BODY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WebhookServer {
    host: String,
    port: u16,
    secrets: HashMap<Forge, Vec<u8>>,
    sink: Arc<dyn WebhookSink>,
}

impl WebhookServer {
    pub fn new(config: &WebhookServerConfig, sink: Arc<dyn WebhookSink>) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            secrets: config
                .secrets()
                .into_iter()
                .map(|(forge, s)| (forge, s.into_bytes()))
                .collect(),
            sink,
        }
    }

    /// Bind and serve until cancelled.
    pub async fn run(self: Arc<Self>) -> Result<(), HttpError> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| HttpError::Bind { addr, source })?;
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener. Split out so tests can
    /// bind to an ephemeral port.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), HttpError> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Webhook server listening on {addr}");
        }
        loop {
            // Accept failures (aborted handshakes, fd exhaustion) are
            // transient and must not take the listener down.
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!("Webhook accept failed: {e}");
                    sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.handle(stream).await;
            });
        }
    }

    async fn handle(&self, mut stream: TcpStream) {
        let (read, mut write) = stream.split();
        let mut reader = BufReader::new(read);
        if let Err(e) = self.dispatch(&mut reader, &mut write).await {
            tracing::warn!("Error handling webhook request: {e}");
            let _ = respond(&mut write, 500, "Internal Server Error").await;
        }
        let _ = write.shutdown().await;
    }

    /// Parse one request, verify it and hand it to the sink. Expected
    /// rejections write their own status; only I/O failures bubble up.
    async fn dispatch<R, W>(&self, reader: &mut R, writer: &mut W) -> std::io::Result<()>
    where
        R: AsyncBufReadExt + Unpin,
        W: AsyncWrite + Unpin,
    {
        let request_line = match read_line(reader).await? {
            LineRead::Line(line) => line,
            LineRead::Timeout => return respond(writer, 408, "Request Timeout").await,
            LineRead::TooLong => return respond(writer, 400, "Bad Request").await,
        };
        let mut parts = request_line.split_whitespace();
        let (method, path) = match (parts.next(), parts.next()) {
            (Some(m), Some(p)) => (m.to_string(), p.to_string()),
            _ => return respond(writer, 400, "Bad Request").await,
        };

        let mut headers = HashMap::new();
        let mut header_lines = 0usize;
        loop {
            header_lines += 1;
            if header_lines > MAX_HEADERS {
                return respond(writer, 400, "Bad Request").await;
            }
            let line = match read_line(reader).await? {
                LineRead::Line(line) => line,
                LineRead::Timeout => return respond(writer, 408, "Request Timeout").await,
                LineRead::TooLong => return respond(writer, 400, "Bad Request").await,
            };
            let line = line.trim();
            if line.is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                headers.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        if method != "POST" {
            return respond(writer, 405, "Method Not Allowed").await;
        }

        let (forge, url_secret) = match parse_target(&path) {
            Some(target) => target,
            None => return respond(writer, 404, "Not Found").await,
        };

        let content_length: usize = headers
            .get("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if content_length > MAX_BODY {
            return respond(writer, 413, "Payload Too Large").await;
        }

        let mut body = vec![0u8; content_length];
        match timeout(BODY_TIMEOUT, reader.read_exact(&mut body)).await {
            Ok(read) => {
                read?;
            }
            Err(_) => return respond(writer, 408, "Request Timeout").await,
        }

        if let Some(secret) = self.secrets.get(&forge) {
            let accepted = match &url_secret {
                Some(token) => ct_eq(token.as_bytes(), secret),
                None => verify_signature(forge, &headers, &body, secret),
            };
            if !accepted {
                tracing::warn!("[{forge}] webhook verification failed");
                return respond(writer, 403, "Forbidden").await;
            }
        }

        let content_type = headers.get("Content-Type").map(String::as_str).unwrap_or("");
        let raw: Vec<u8> = if content_type.contains("x-www-form-urlencoded") {
            url::form_urlencoded::parse(&body)
                .find(|(key, _)| key == "payload")
                .map(|(_, value)| value.into_owned().into_bytes())
                .unwrap_or_else(|| b"{}".to_vec())
        } else {
            body
        };

        let payload: serde_json::Value = match serde_json::from_slice(&raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("[{forge}] JSON parse error: {e}");
                return respond(writer, 400, "Bad JSON").await;
            }
        };

        respond(writer, 200, "OK").await?;

        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            sink.deliver(forge, headers, payload).await;
        });
        Ok(())
    }
}

/// Resolve a request path to a forge plus the optional `?secret=` token.
fn parse_target(path: &str) -> Option<(Forge, Option<String>)> {
    let (path, query) = match path.split_once('?') {
        Some((p, q)) => (p, q),
        None => (path, ""),
    };
    let forge = Forge::from_path(&path.trim_matches('/').to_lowercase())?;
    let url_secret = url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "secret")
        .map(|(_, value)| value.into_owned());
    Some((forge, url_secret))
}

/// Signature header check per forge.
fn verify_signature(
    forge: Forge,
    headers: &HashMap<String, String>,
    body: &[u8],
    secret: &[u8],
) -> bool {
    match forge {
        Forge::GitHub => {
            let header = headers
                .get("X-Hub-Signature-256")
                .map(String::as_str)
                .unwrap_or("");
            match header.strip_prefix("sha256=") {
                Some(sig) => ct_eq(sig.as_bytes(), hmac_hex(secret, body).as_bytes()),
                None => false,
            }
        }
        Forge::Gitea => {
            let header = headers
                .get("X-Gitea-Signature")
                .map(String::as_str)
                .unwrap_or("");
            ct_eq(header.as_bytes(), hmac_hex(secret, body).as_bytes())
        }
        Forge::GitLab => {
            let token = headers
                .get("X-Gitlab-Token")
                .map(String::as_str)
                .unwrap_or("");
            ct_eq(token.as_bytes(), secret)
        }
    }
}

fn hmac_hex(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

enum LineRead {
    Line(String),
    Timeout,
    TooLong,
}

/// One request or header line, capped at [`MAX_LINE_BYTES`]. A line that
/// fills the cap without a terminating newline counts as an overflow.
async fn read_line<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> std::io::Result<LineRead> {
    let mut line = String::new();
    let mut limited = (&mut *reader).take(MAX_LINE_BYTES);
    match timeout(HEADER_TIMEOUT, limited.read_line(&mut line)).await {
        Ok(read) => {
            read?;
            if line.len() as u64 >= MAX_LINE_BYTES && !line.ends_with('\n') {
                return Ok(LineRead::TooLong);
            }
            Ok(LineRead::Line(line))
        }
        Err(_) => Ok(LineRead::Timeout),
    }
}

async fn respond<W: AsyncWrite + Unpin>(
    writer: &mut W,
    code: u16,
    message: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {code} {message}\r\n\
         Content-Length: {}\r\n\
         Content-Type: text/plain\r\n\
         Connection: close\r\n\
         \r\n\
         {message}",
        message.len(),
    );
    writer.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hmac_headers(name: &str, value: String) -> HashMap<String, String> {
        HashMap::from([(name.to_string(), value)])
    }

    #[test]
    fn parse_target_strips_slashes_and_case() {
        assert_eq!(parse_target("/github"), Some((Forge::GitHub, None)));
        assert_eq!(parse_target("/GitLab/"), Some((Forge::GitLab, None)));
        assert_eq!(parse_target("/gitea?secret=abc"), Some((Forge::Gitea, Some("abc".to_string()))));
        assert_eq!(parse_target("/bitbucket"), None);
        assert_eq!(parse_target("/github/extra"), None);
    }

    #[test]
    fn parse_target_decodes_secret() {
        assert_eq!(
            parse_target("/github?secret=a%20b&x=1"),
            Some((Forge::GitHub, Some("a b".to_string())))
        );
    }

    #[test]
    fn github_signature_requires_prefix() {
        let secret = b"hunter2";
        let body = b"{}";
        let digest = hmac_hex(secret, body);

        let good = hmac_headers("X-Hub-Signature-256", format!("sha256={digest}"));
        assert!(verify_signature(Forge::GitHub, &good, body, secret));

        let bare = hmac_headers("X-Hub-Signature-256", digest);
        assert!(!verify_signature(Forge::GitHub, &bare, body, secret));

        assert!(!verify_signature(Forge::GitHub, &HashMap::new(), body, secret));
    }

    #[test]
    fn gitea_signature_is_bare_hex() {
        let secret = b"hunter2";
        let body = b"{\"a\":1}";
        let headers = hmac_headers("X-Gitea-Signature", hmac_hex(secret, body));
        assert!(verify_signature(Forge::Gitea, &headers, body, secret));

        let wrong = hmac_headers("X-Gitea-Signature", hmac_hex(b"other", body));
        assert!(!verify_signature(Forge::Gitea, &wrong, body, secret));
    }

    #[test]
    fn gitlab_compares_token_directly() {
        let headers = hmac_headers("X-Gitlab-Token", "hunter2".to_string());
        assert!(verify_signature(Forge::GitLab, &headers, b"", b"hunter2"));
        assert!(!verify_signature(Forge::GitLab, &headers, b"", b"hunter3"));
    }

    #[test]
    fn hmac_hex_is_stable() {
        // Known vector so signature tests elsewhere can rely on it.
        assert_eq!(hmac_hex(b"key", b"body").len(), 64);
        assert_eq!(hmac_hex(b"key", b"body"), hmac_hex(b"key", b"body"));
    }

    struct NullSink;

    #[async_trait::async_trait]
    impl WebhookSink for NullSink {
        async fn deliver(
            &self,
            _forge: Forge,
            _headers: HashMap<String, String>,
            _payload: serde_json::Value,
        ) {
        }
    }

    async fn dispatch_raw(request: &str) -> String {
        let server = WebhookServer::new(&WebhookServerConfig::default(), Arc::new(NullSink));
        let mut reader = BufReader::new(request.as_bytes());
        let mut out = Vec::new();
        server.dispatch(&mut reader, &mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn capped_request_still_succeeds() {
        let response = dispatch_raw("POST /github HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    }

    #[tokio::test]
    async fn oversized_request_line_is_rejected() {
        let request = format!("POST /{} HTTP/1.1\r\n\r\n", "a".repeat(9000));
        let response = dispatch_raw(&request).await;
        assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    }

    #[tokio::test]
    async fn oversized_header_line_is_rejected() {
        let request = format!(
            "POST /github HTTP/1.1\r\nX-Junk: {}\r\n\r\n",
            "b".repeat(9000)
        );
        let response = dispatch_raw(&request).await;
        assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    }

    #[tokio::test]
    async fn excessive_header_count_is_rejected() {
        let mut request = String::from("POST /github HTTP/1.1\r\n");
        for i in 0..200 {
            request.push_str(&format!("X-Filler-{i}: v\r\n"));
        }
        request.push_str("\r\n");
        let response = dispatch_raw(&request).await;
        assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    }
}
