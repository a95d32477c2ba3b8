//! [`WsSubscriber`] – a WebSocket client as a broadcast [`Subscriber`].

use std::net::SocketAddr;

use async_trait::async_trait;
use futures_util::SinkExt;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use gpuwatch_broadcast::Subscriber;
use gpuwatch_types::GpuWatchError;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
/// Inbound half of an accepted WebSocket.
pub type WsInbound = SplitStream<WebSocketStream<TcpStream>>;

/// A raw TCP connection that becomes a WebSocket when accepted.
///
/// The handshake runs inside [`Subscriber::accept`]; afterwards the outbound
/// half is used for broadcasts and the inbound half is handed to the
/// connection's receive loop via [`WsSubscriber::take_inbound`].
pub struct WsSubscriber {
    peer: SocketAddr,
    pending: Mutex<Option<TcpStream>>,
    sink: Mutex<Option<WsSink>>,
    inbound: Mutex<Option<WsInbound>>,
}

impl WsSubscriber {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            peer,
            pending: Mutex::new(Some(stream)),
            sink: Mutex::new(None),
            inbound: Mutex::new(None),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Take the inbound half.  `None` before a successful handshake or on a
    /// second call.
    pub async fn take_inbound(&self) -> Option<WsInbound> {
        self.inbound.lock().await.take()
    }
}

#[async_trait]
impl Subscriber for WsSubscriber {
    async fn accept(&self) -> Result<(), GpuWatchError> {
        let stream = self.pending.lock().await.take().ok_or_else(|| {
            GpuWatchError::Subscriber(format!("{} already accepted", self.peer))
        })?;
        let ws_stream = accept_async(stream).await.map_err(|e| {
            GpuWatchError::Subscriber(format!("WS handshake from {}: {e}", self.peer))
        })?;

        let (tx, rx) = ws_stream.split();
        *self.sink.lock().await = Some(tx);
        *self.inbound.lock().await = Some(rx);
        Ok(())
    }

    async fn send_text(&self, payload: &str) -> Result<(), GpuWatchError> {
        let mut sink = self.sink.lock().await;
        let Some(tx) = sink.as_mut() else {
            return Err(GpuWatchError::Subscriber(format!("{} is not connected", self.peer)));
        };
        tx.send(Message::Text(payload.to_string().into()))
            .await
            .map_err(|e| GpuWatchError::Subscriber(format!("send to {}: {e}", self.peer)))
    }

    async fn close(&self) {
        if let Some(mut tx) = self.sink.lock().await.take() {
            let _ = tx.close().await;
        }
    }
}
