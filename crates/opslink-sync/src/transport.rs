use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::TransportError;

/// Factory for event-connection links. The connection manager owns the one
/// live link exclusively; each reconnect attempt dials a fresh one.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn dial(&self) -> Result<Box<dyn TransportLink>, TransportError>;
}

/// A single established connection carrying text frames in both directions.
#[async_trait]
pub trait TransportLink: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;
    /// `None` means the peer closed or the link failed.
    async fn recv(&mut self) -> Option<String>;
    async fn close(&mut self);
}

/// WebSocket implementation over tokio-tungstenite.
pub struct WsTransport {
    url: Url,
}

impl WsTransport {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url).map_err(|err| TransportError::Dial(err.to_string()))?;
        Ok(Self::new(url))
    }
}

#[async_trait]
impl EventTransport for WsTransport {
    async fn dial(&self) -> Result<Box<dyn TransportLink>, TransportError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| TransportError::Dial(err.to_string()))?;
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportLink for WsLink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn recv(&mut self) -> Option<String> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Binary(bytes)) => {
                    if let Ok(text) = String::from_utf8(bytes) {
                        return Some(text);
                    }
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                // Ping/pong are handled by the protocol layer underneath.
                _ => {}
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// In-process transport for deterministic tests. Every `dial` hands the
/// listening side a [`PairEnd`] so a test can script the server role,
/// including across reconnects.
pub struct PairTransport {
    dials: mpsc::UnboundedSender<PairEnd>,
    refuse: Arc<AtomicBool>,
}

/// Server half of one dialed pair link.
pub struct PairEnd {
    /// Frames pushed here arrive at the client link's `recv`.
    pub tx: mpsc::UnboundedSender<String>,
    /// Frames the client link sent.
    pub rx: mpsc::UnboundedReceiver<String>,
}

impl PairTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PairEnd>) {
        let (dials, accepted) = mpsc::unbounded_channel();
        (
            Self {
                dials,
                refuse: Arc::new(AtomicBool::new(false)),
            },
            accepted,
        )
    }

    /// Make subsequent dials fail, simulating an unreachable backend.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventTransport for PairTransport {
    async fn dial(&self) -> Result<Box<dyn TransportLink>, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Dial("connection refused".into()));
        }
        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        self.dials
            .send(PairEnd {
                tx: to_client_tx,
                rx: to_server_rx,
            })
            .map_err(|_| TransportError::Dial("no listener".into()))?;
        Ok(Box::new(PairLink {
            tx: to_server_tx,
            rx: to_client_rx,
            closed: false,
        }))
    }
}

struct PairLink {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
    closed: bool,
}

#[async_trait]
impl TransportLink for PairLink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.tx.send(text).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<String> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.closed = true;
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_links_carry_frames_both_ways() {
        let (transport, mut accepted) = PairTransport::new();
        let mut link = transport.dial().await.unwrap();
        let mut end = accepted.recv().await.unwrap();

        link.send("hello".into()).await.unwrap();
        assert_eq!(end.rx.recv().await.as_deref(), Some("hello"));

        end.tx.send("world".into()).unwrap();
        assert_eq!(link.recv().await.as_deref(), Some("world"));
    }

    #[tokio::test]
    async fn refused_dial_errors() {
        let (transport, _accepted) = PairTransport::new();
        transport.set_refuse(true);
        assert!(matches!(
            transport.dial().await.err(),
            Some(TransportError::Dial(_))
        ));
    }

    #[tokio::test]
    async fn closed_link_stops_sending() {
        let (transport, mut accepted) = PairTransport::new();
        let mut link = transport.dial().await.unwrap();
        let _end = accepted.recv().await.unwrap();
        link.close().await;
        assert_eq!(link.send("late".into()).await, Err(TransportError::Closed));
        assert!(link.recv().await.is_none());
    }
}
