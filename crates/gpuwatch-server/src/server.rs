//! [`GpuWatchServer`] – HTTP + WebSocket listener.
//!
//! Listens on `0.0.0.0:5000` (configurable via [`GpuWatchServer::with_addr`]).
//!
//! * `GET /api/health`, `GET /api/config` → JSON reports.
//! * WebSocket upgrade on [`WS_PATH`] → subscriber registered with the
//!   [`BroadcastGate`].
//! * Anything else → `404` JSON.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use gpuwatch_broadcast::{BroadcastGate, Subscriber};
use gpuwatch_types::{GpuWatchError, ProviderKind};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::ws::WsSubscriber;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 5000;

/// Path clients upgrade on to receive telemetry.
pub const WS_PATH: &str = "/ws/gpu";

/// Largest request head peeked or read.
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// How long a client may take to send its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

const PEEK_RETRY: Duration = Duration::from_millis(5);

/// Resolved settings echoed by the reporting endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub poll_interval_ms: u64,
    pub max_broadcast_hz: u32,
    pub provider: ProviderKind,
    pub enable_system_metrics: bool,
}

struct Context {
    gate: Arc<BroadcastGate>,
    info: ServiceInfo,
}

// ---------------------------------------------------------------------------
// GpuWatchServer
// ---------------------------------------------------------------------------

/// HTTP + WebSocket server bridging the [`BroadcastGate`] to clients.
pub struct GpuWatchServer {
    gate: Arc<BroadcastGate>,
    info: ServiceInfo,
    addr: SocketAddr,
}

impl GpuWatchServer {
    /// Create a server on `0.0.0.0:`[`DEFAULT_PORT`].
    pub fn new(gate: Arc<BroadcastGate>, info: ServiceInfo) -> Self {
        Self {
            gate,
            info,
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
        }
    }

    /// Override the listening address (builder-style).
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Return the configured address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bind the configured address and serve until `shutdown` flips.
    ///
    /// # Errors
    ///
    /// Returns [`GpuWatchError::Io`] if the listener cannot bind.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), GpuWatchError> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| GpuWatchError::Io(format!("bind error on {}: {e}", self.addr)))?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound `listener`.
    ///
    /// Stops accepting when `shutdown` changes or its sender is dropped.
    /// Open WebSocket connections observe the same signal and close.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), GpuWatchError> {
        if let Ok(local) = listener.local_addr() {
            info!(addr = %local, path = WS_PATH, "gpuwatch listening");
        }
        let ctx = Arc::new(Context {
            gate: self.gate,
            info: self.info,
        });

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = Arc::clone(&ctx);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, ctx, shutdown).await {
                                warn!(peer = %peer, error = %e, "client error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept error"),
                }
            }
        }

        info!("gpuwatch listener stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<Context>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), GpuWatchError> {
    // Peek so the WebSocket handshaker still sees the full request.
    let preview = peek_head(&stream, peer).await?;
    let request = parse_request_line(&preview);

    if is_websocket_upgrade(&preview) {
        return match request {
            Some((_, path)) if path == WS_PATH => handle_ws(stream, peer, ctx, shutdown).await,
            _ => write_json(&mut stream, "404 Not Found", &json!({"error": "not found"})).await,
        };
    }

    let head = read_head(&mut stream).await?;
    match parse_request_line(&head) {
        Some(("GET", "/api/health")) => {
            let body = health_body(&ctx).await;
            write_json(&mut stream, "200 OK", &body).await
        }
        Some(("GET", "/api/config")) => {
            let body = serde_json::to_value(&ctx.info)?;
            write_json(&mut stream, "200 OK", &body).await
        }
        Some(("OPTIONS", _)) => write_preflight(&mut stream).await,
        _ => write_json(&mut stream, "404 Not Found", &json!({"error": "not found"})).await,
    }
}

// ---------------------------------------------------------------------------
// WebSocket: register, then watch for disconnect
// ---------------------------------------------------------------------------

async fn handle_ws(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<Context>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), GpuWatchError> {
    let subscriber = Arc::new(WsSubscriber::new(stream, peer));
    let id = ctx.gate.add(Arc::clone(&subscriber) as Arc<dyn Subscriber>).await?;
    debug!(peer = %peer, subscriber = %id, "websocket subscribed");

    if let Some(mut inbound) = subscriber.take_inbound().await {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                msg = inbound.next() => match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(peer = %peer, error = %e, "websocket read error");
                        break;
                    }
                    // Client frames carry no meaning; they only prove liveness.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    ctx.gate.remove(id).await;
    subscriber.close().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Plain HTTP
// ---------------------------------------------------------------------------

async fn health_body(ctx: &Context) -> Value {
    let active = ctx.gate.active_count().await;
    json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "pollIntervalMs": ctx.info.poll_interval_ms,
        "provider": ctx.info.provider,
        "activeSubscribers": active,
    })
}

/// Peek until the request head is complete, the peek buffer is full, the
/// peer closes, or [`HEAD_TIMEOUT`] passes.  Nothing is consumed.
async fn peek_head(stream: &TcpStream, peer: SocketAddr) -> Result<String, GpuWatchError> {
    let mut buf = vec![0u8; MAX_HEAD_BYTES];
    let deadline = Instant::now() + HEAD_TIMEOUT;
    loop {
        let n = stream
            .peek(&mut buf)
            .await
            .map_err(|e| GpuWatchError::Io(format!("peek error from {peer}: {e}")))?;
        let complete = n == 0 || n == buf.len() || buf[..n].windows(4).any(|w| w == b"\r\n\r\n");
        if complete || Instant::now() >= deadline {
            return Ok(String::from_utf8_lossy(&buf[..n]).into_owned());
        }
        // peek returns the same bytes until more arrive.
        sleep(PEEK_RETRY).await;
    }
}

/// Read until the end of the request head (or [`MAX_HEAD_BYTES`]).
async fn read_head(stream: &mut TcpStream) -> Result<String, GpuWatchError> {
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while head.len() < MAX_HEAD_BYTES && !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| GpuWatchError::Io(format!("HTTP read error: {e}")))?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

async fn write_json(
    stream: &mut TcpStream,
    status: &str,
    body: &Value,
) -> Result<(), GpuWatchError> {
    let body = body.to_string();
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    );
    write_all(stream, response.as_bytes()).await
}

async fn write_preflight(stream: &mut TcpStream) -> Result<(), GpuWatchError> {
    let response = "HTTP/1.1 204 No Content\r\n\
                    Access-Control-Allow-Origin: *\r\n\
                    Access-Control-Allow-Methods: *\r\n\
                    Access-Control-Allow-Headers: *\r\n\
                    Content-Length: 0\r\n\
                    Connection: close\r\n\
                    \r\n";
    write_all(stream, response.as_bytes()).await
}

async fn write_all(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), GpuWatchError> {
    stream
        .write_all(bytes)
        .await
        .map_err(|e| GpuWatchError::Io(format!("HTTP write error: {e}")))?;
    let _ = stream.shutdown().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Request head parsing
// ---------------------------------------------------------------------------

/// Extract `(method, path)` from the request line, without the query string.
pub(crate) fn parse_request_line(head: &str) -> Option<(&str, &str)> {
    let mut parts = head.lines().next()?.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let path = target.split('?').next().unwrap_or(target);
    Some((method, path))
}

pub(crate) fn is_websocket_upgrade(head: &str) -> bool {
    head.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;

    fn info() -> ServiceInfo {
        ServiceInfo {
            poll_interval_ms: 750,
            max_broadcast_hz: 10,
            provider: ProviderKind::NvidiaSmi,
            enable_system_metrics: false,
        }
    }

    /// Start a server on an ephemeral port.
    async fn start(gate: Arc<BroadcastGate>) -> (SocketAddr, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, shutdown) = watch::channel(false);
        tokio::spawn(GpuWatchServer::new(gate, info()).serve(listener, shutdown));
        (addr, stop)
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    fn body_of(response: &str) -> Value {
        let body = response.split("\r\n\r\n").nth(1).unwrap_or_default();
        serde_json::from_str(body).unwrap()
    }

    async fn wait_for_count(gate: &BroadcastGate, expected: usize) {
        for _ in 0..100 {
            if gate.active_count().await == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("subscriber count never reached {expected}");
    }

    // ── Constructor ──────────────────────────────────────────────────────────

    #[test]
    fn default_addr_uses_port_5000() {
        let server = GpuWatchServer::new(Arc::new(BroadcastGate::new(5)), info());
        assert_eq!(server.addr().port(), DEFAULT_PORT);
    }

    #[test]
    fn with_addr_overrides_default() {
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let server = GpuWatchServer::new(Arc::new(BroadcastGate::new(5)), info()).with_addr(addr);
        assert_eq!(server.addr(), addr);
    }

    // ── Request parsing ──────────────────────────────────────────────────────

    #[test]
    fn request_line_strips_query() {
        assert_eq!(
            parse_request_line("GET /api/health?x=1 HTTP/1.1\r\nHost: a\r\n"),
            Some(("GET", "/api/health"))
        );
        assert_eq!(parse_request_line(""), None);
        assert_eq!(parse_request_line("GARBAGE"), None);
    }

    #[test]
    fn upgrade_detection_is_case_insensitive() {
        assert!(is_websocket_upgrade("GET /ws/gpu HTTP/1.1\r\nUpgrade: WebSocket\r\n"));
        assert!(!is_websocket_upgrade("GET /api/health HTTP/1.1\r\nHost: a\r\n"));
    }

    // ── HTTP endpoints ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn health_reports_provider_and_interval() {
        let (addr, _stop) = start(Arc::new(BroadcastGate::new(5))).await;
        let response = http_get(addr, "/api/health").await;

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Access-Control-Allow-Origin: *"));
        let body = body_of(&response);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["pollIntervalMs"], 750);
        assert_eq!(body["provider"], "nvidia_smi");
        assert_eq!(body["activeSubscribers"], 0);
    }

    #[tokio::test]
    async fn config_echoes_service_info() {
        let (addr, _stop) = start(Arc::new(BroadcastGate::new(5))).await;
        let body = body_of(&http_get(addr, "/api/config").await);

        assert_eq!(body["pollIntervalMs"], 750);
        assert_eq!(body["maxBroadcastHz"], 10);
        assert_eq!(body["provider"], "nvidia_smi");
        assert_eq!(body["enableSystemMetrics"], false);
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let (addr, _stop) = start(Arc::new(BroadcastGate::new(5))).await;
        let response = http_get(addr, "/nope").await;
        assert!(response.starts_with("HTTP/1.1 404"));
    }

    // ── WebSocket streaming ──────────────────────────────────────────────────

    #[tokio::test]
    async fn websocket_client_receives_broadcasts_and_is_removed_on_close() {
        let gate = Arc::new(BroadcastGate::new(30));
        let (addr, _stop) = start(Arc::clone(&gate)).await;

        let (mut client, _) = connect_async(format!("ws://{addr}{WS_PATH}")).await.unwrap();
        wait_for_count(&gate, 1).await;

        gate.publish(&json!({"a": 1})).await.unwrap();
        let msg = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("message within timeout")
            .expect("stream open")
            .unwrap();
        assert_eq!(msg.into_text().unwrap().as_str(), r#"{"a":1}"#);

        // Inbound frames are ignored.
        client.send(Message::Text("hello".to_string().into())).await.unwrap();

        client.close(None).await.unwrap();
        wait_for_count(&gate, 0).await;
    }

    #[tokio::test]
    async fn upgrade_split_across_segments_is_accepted() {
        let gate = Arc::new(BroadcastGate::new(30));
        let (addr, _stop) = start(Arc::clone(&gate)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /ws/gpu HTTP/1.1\r\nHost: localhost\r\n")
            .await
            .unwrap();
        stream.flush().await.unwrap();
        sleep(Duration::from_millis(50)).await;
        stream
            .write_all(
                b"Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\
                  \r\n",
            )
            .await
            .unwrap();

        let mut response = [0u8; 12];
        timeout(Duration::from_secs(2), stream.read_exact(&mut response))
            .await
            .expect("response within timeout")
            .unwrap();
        assert_eq!(&response, b"HTTP/1.1 101");
        wait_for_count(&gate, 1).await;
    }

    #[tokio::test]
    async fn websocket_on_other_path_is_rejected() {
        let gate = Arc::new(BroadcastGate::new(30));
        let (addr, _stop) = start(Arc::clone(&gate)).await;

        let result = connect_async(format!("ws://{addr}/ws/other")).await;
        assert!(result.is_err());
        assert_eq!(gate.active_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_closes_open_websockets() {
        let gate = Arc::new(BroadcastGate::new(30));
        let (addr, stop) = start(Arc::clone(&gate)).await;

        let (_client, _) = connect_async(format!("ws://{addr}{WS_PATH}")).await.unwrap();
        wait_for_count(&gate, 1).await;

        stop.send(true).unwrap();
        wait_for_count(&gate, 0).await;
    }
}
