//! Transport seam for the channel connection
//!
//! The connection layer is written against [`ChannelTransport`] so the relay
//! link can be a real WebSocket in production and an in-memory pair in
//! tests. A link is a pair of bounded pipes; the transport owns the pump
//! tasks behind them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, warn};

use crate::channel::protocol::Envelope;
use crate::error::TransportError;

const LINK_BUFFER: usize = 64;

/// Something received on an established link.
#[derive(Debug)]
pub enum LinkEvent {
    /// A decoded frame from the relay.
    Message(Envelope),
    /// The relay invalidated our credential mid-session. The connection
    /// performs a clean disconnect and does not reconnect.
    AuthRevoked { reason: String },
}

/// An established bidirectional link to the relay.
///
/// `inbound` yielding `None` means the link was lost and the connection
/// layer should reconnect.
pub struct TransportLink {
    pub outbound: mpsc::Sender<Envelope>,
    pub inbound: mpsc::Receiver<LinkEvent>,
}

/// Dial-out capability injected into [`ChannelConnection`].
///
/// [`ChannelConnection`]: crate::channel::ChannelConnection
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn connect(&self, url: &str, auth_token: &str) -> Result<TransportLink, TransportError>;
}

/// Production transport over `tokio-tungstenite`.
///
/// The bearer token rides in the `Authorization` header of the upgrade
/// request; a 401/403 upgrade response maps to
/// [`TransportError::AuthRejected`].
pub struct WebSocketTransport;

#[async_trait]
impl ChannelTransport for WebSocketTransport {
    async fn connect(&self, url: &str, auth_token: &str) -> Result<TransportLink, TransportError> {
        if auth_token.is_empty() {
            return Err(TransportError::AuthRejected("missing bearer token".into()));
        }

        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let header = HeaderValue::from_str(&format!("Bearer {auth_token}"))
            .map_err(|e| TransportError::AuthRejected(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let (ws, _response) = connect_async(request).await.map_err(|e| match &e {
            WsError::Http(response) if response.status().as_u16() == 401 || response.status().as_u16() == 403 => {
                TransportError::AuthRejected(format!("relay returned {}", response.status()))
            }
            _ => TransportError::Connect(e.to_string()),
        })?;

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<LinkEvent>(LINK_BUFFER);

        // Outbound pump: serialize frames onto the socket until the
        // connection drops its sender.
        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(topic = %envelope.topic, error = %e, "dropping unserializable frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            debug!("websocket outbound pump ended");
        });

        // Inbound pump: decode frames; a policy close is treated as auth
        // revocation, anything else ends the link.
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                        Ok(envelope) => {
                            if in_tx.send(LinkEvent::Message(envelope)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "ignoring undecodable frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .as_ref()
                            .map(|f| f.reason.to_string())
                            .unwrap_or_default();
                        if reason.to_ascii_lowercase().contains("auth") {
                            let _ = in_tx.send(LinkEvent::AuthRevoked { reason }).await;
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "websocket read error, link lost");
                        break;
                    }
                }
            }
            debug!("websocket inbound pump ended");
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// In-memory transport: the test stands in for the relay.
///
/// Established links expose their relay side through this handle so tests
/// can inspect outbound frames, push inbound ones, sever the link, or
/// revoke authentication.
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    expected_token: String,
    /// Force this many upcoming connect attempts to fail transiently.
    reject_connects: AtomicU32,
    connect_count: AtomicU32,
    /// Every frame any link sent to the "relay", in arrival order.
    received: Mutex<Vec<Envelope>>,
    /// Relay-side senders for established links, oldest first.
    links: Mutex<Vec<mpsc::Sender<LinkEvent>>>,
}

impl InMemoryTransport {
    pub fn new(expected_token: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                expected_token: expected_token.into(),
                reject_connects: AtomicU32::new(0),
                connect_count: AtomicU32::new(0),
                received: Mutex::new(Vec::new()),
                links: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fail the next `n` connect attempts with a transient error.
    pub fn reject_next_connects(&self, n: u32) {
        self.inner.reject_connects.store(n, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u32 {
        self.inner.connect_count.load(Ordering::SeqCst)
    }

    /// Frames the relay has received so far.
    pub fn received(&self) -> Vec<Envelope> {
        self.inner.received.lock().unwrap().clone()
    }

    pub fn received_on(&self, topic: &str) -> Vec<Envelope> {
        self.received()
            .into_iter()
            .filter(|e| e.topic == topic)
            .collect()
    }

    /// Deliver a frame to the most recent live link.
    pub async fn push(&self, envelope: Envelope) {
        let sender = self.inner.links.lock().unwrap().last().cloned();
        if let Some(sender) = sender {
            let _ = sender.send(LinkEvent::Message(envelope)).await;
        }
    }

    /// Revoke authentication on the most recent live link.
    pub async fn revoke_auth(&self, reason: &str) {
        let sender = self.inner.links.lock().unwrap().last().cloned();
        if let Some(sender) = sender {
            let _ = sender
                .send(LinkEvent::AuthRevoked {
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Sever every live link, simulating network loss.
    pub fn drop_links(&self) {
        self.inner.links.lock().unwrap().clear();
    }
}

#[async_trait]
impl ChannelTransport for InMemoryTransport {
    async fn connect(&self, _url: &str, auth_token: &str) -> Result<TransportLink, TransportError> {
        self.inner.connect_count.fetch_add(1, Ordering::SeqCst);

        if auth_token != self.inner.expected_token {
            return Err(TransportError::AuthRejected("bad token".into()));
        }

        let remaining = self.inner.reject_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner
                .reject_connects
                .store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Connect("simulated connect failure".into()));
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<LinkEvent>(LINK_BUFFER);

        let received = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                received.received.lock().unwrap().push(envelope);
            }
        });

        self.inner.links.lock().unwrap().push(in_tx);

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
