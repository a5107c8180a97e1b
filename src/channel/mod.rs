//! Persistent channel connection
//!
//! One authenticated, auto-reconnecting bidirectional link per client
//! process:
//! - `subscribe` returns an RAII [`Subscription`]; dropping it is the only
//!   way to unregister
//! - `publish` is fire-and-forget and never blocks; while disconnected it
//!   logs a warning and drops (durable callers route through the offline
//!   queue instead)
//! - reconnects run exponential backoff with jitter on their own task;
//!   exhausting the budget lands the handle in a terminal disconnected
//!   state that requires a fresh `connect`
//! - lifecycle events fan out on a broadcast channel for dependents

pub mod protocol;
pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::ChannelConfig;
use crate::error::{ChannelError, TransportError};
use protocol::Envelope;
use transport::{ChannelTransport, LinkEvent, TransportLink};

const EVENT_BUFFER: usize = 64;

/// Coarse link state, observable through [`ChannelConnection::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal until an explicit `connect` builds a new handle.
    Disconnected,
}

/// Lifecycle events consumable by dependents for UI/ops signaling.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected,
    Error(String),
}

type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

struct ChannelShared {
    config: ChannelConfig,
    transport: Arc<dyn ChannelTransport>,
    auth_token: String,
    subscriptions: Mutex<HashMap<u64, (String, Handler)>>,
    next_sub_id: AtomicU64,
    outbound: mpsc::Sender<Envelope>,
    state_tx: watch::Sender<LinkState>,
    events_tx: broadcast::Sender<ChannelEvent>,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle to the process-wide channel connection.
pub struct ChannelConnection {
    shared: Arc<ChannelShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// A registered (topic, handler) pair. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    shared: Weak<ChannelShared>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subscriptions.lock().unwrap().remove(&self.id);
        }
    }
}

impl ChannelConnection {
    /// Connect to the relay, retrying transient failures with backoff.
    ///
    /// Fails with [`ChannelError::Authentication`] on a rejected token
    /// (never retried) and [`ChannelError::Connection`] once the attempt
    /// budget is spent.
    pub async fn connect(
        transport: Arc<dyn ChannelTransport>,
        config: ChannelConfig,
        auth_token: &str,
    ) -> Result<Self, ChannelError> {
        let (outbound, out_rx) = mpsc::channel(config.outbound_buffer);
        let (state_tx, _) = watch::channel(LinkState::Connecting);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(ChannelShared {
            config,
            transport,
            auth_token: auth_token.to_string(),
            subscriptions: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(0),
            outbound,
            state_tx,
            events_tx,
            shutdown_tx,
        });

        let mut establish_shutdown = shutdown_rx.clone();
        let link = establish(&shared, &mut establish_shutdown).await?;
        shared.state_tx.send_replace(LinkState::Connected);
        let _ = shared.events_tx.send(ChannelEvent::Connected);
        info!(url = %shared.config.url, "channel connected");

        let task = tokio::spawn(run_loop(Arc::clone(&shared), link, out_rx, shutdown_rx));

        Ok(Self {
            shared,
            task: Mutex::new(Some(task)),
        })
    }

    /// Register a handler for a topic. The returned [`Subscription`] must
    /// be held; dropping it unregisters the handler.
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn subscribe(
        &self,
        topic: &str,
        handler: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.shared.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.shared
            .subscriptions
            .lock()
            .unwrap()
            .insert(id, (topic.to_string(), Arc::new(handler)));
        debug!(topic, sub_id = id, "subscribed");
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Fire-and-forget publish. Never blocks the caller; while disconnected
    /// the frame is dropped with a logged warning.
    pub fn publish(&self, topic: &str, payload: Value) {
        if !self.is_connected() {
            warn!(topic, "publish while channel disconnected, frame dropped");
            return;
        }
        let envelope = Envelope::new(topic, payload);
        if let Err(e) = self.shared.outbound.try_send(envelope) {
            warn!(topic, error = %e, "outbound buffer rejected frame");
        }
    }

    /// Deliver a frame with backpressure, failing instead of dropping.
    ///
    /// Queue replay uses this path: it waits for outbound buffer space and
    /// returns [`ChannelError::NotConnected`] when the link is down, so the
    /// operation stays queued for a later drain rather than vanishing.
    pub async fn send(&self, topic: &str, payload: Value) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        self.shared
            .outbound
            .send(Envelope::new(topic, payload))
            .await
            .map_err(|_| ChannelError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.state_tx.borrow() == LinkState::Connected
    }

    /// Watch the coarse link state.
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribe to connection lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Stop the connection and release all subscriptions.
    pub async fn disconnect(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("channel disconnected");
    }
}

async fn run_loop(
    shared: Arc<ChannelShared>,
    mut link: TransportLink,
    mut out_rx: mpsc::Receiver<Envelope>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!("channel shutdown requested");
                break;
            }
            maybe = out_rx.recv() => match maybe {
                Some(envelope) => {
                    if let Err(rejected) = link.outbound.send(envelope).await {
                        warn!("link lost while sending, frame held for resend");
                        shared.state_tx.send_replace(LinkState::Reconnecting);
                        let _ = shared.events_tx.send(ChannelEvent::Disconnected);
                        if !reconnect(&shared, &mut link, &mut shutdown_rx).await {
                            break;
                        }
                        if link.outbound.send(rejected.0).await.is_err() {
                            warn!("frame lost across consecutive link failures");
                        }
                    }
                }
                None => break,
            },
            event = link.inbound.recv() => match event {
                Some(LinkEvent::Message(envelope)) => dispatch(&shared, &envelope),
                Some(LinkEvent::AuthRevoked { reason }) => {
                    warn!(reason, "authentication revoked by relay, disconnecting");
                    let _ = shared
                        .events_tx
                        .send(ChannelEvent::Error(format!("authentication revoked: {reason}")));
                    break;
                }
                None => {
                    info!("channel link lost, reconnecting");
                    shared.state_tx.send_replace(LinkState::Reconnecting);
                    let _ = shared.events_tx.send(ChannelEvent::Disconnected);
                    if !reconnect(&shared, &mut link, &mut shutdown_rx).await {
                        break;
                    }
                }
            }
        }
    }

    shared.state_tx.send_replace(LinkState::Disconnected);
    let _ = shared.events_tx.send(ChannelEvent::Disconnected);
    shared.subscriptions.lock().unwrap().clear();
    debug!("channel run loop ended");
}

async fn reconnect(
    shared: &Arc<ChannelShared>,
    link: &mut TransportLink,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    match establish(shared, shutdown_rx).await {
        Ok(new_link) => {
            *link = new_link;
            shared.state_tx.send_replace(LinkState::Connected);
            let _ = shared.events_tx.send(ChannelEvent::Connected);
            info!("channel reconnected");
            true
        }
        Err(e) => {
            error!(error = %e, "channel reconnect budget exhausted");
            let _ = shared.events_tx.send(ChannelEvent::Error(e.to_string()));
            false
        }
    }
}

async fn establish(
    shared: &ChannelShared,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<TransportLink, ChannelError> {
    let mut attempt: u32 = 0;
    loop {
        match shared
            .transport
            .connect(&shared.config.url, &shared.auth_token)
            .await
        {
            Ok(link) => return Ok(link),
            Err(TransportError::AuthRejected(reason)) => {
                return Err(ChannelError::Authentication(reason));
            }
            Err(TransportError::Connect(reason)) => {
                attempt += 1;
                if attempt >= shared.config.max_reconnect_attempts {
                    return Err(ChannelError::Connection { attempts: attempt });
                }
                let delay = backoff_delay(&shared.config, attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason,
                    "channel connect failed, backing off"
                );
                let _ = shared
                    .events_tx
                    .send(ChannelEvent::Reconnecting { attempt });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {
                        return Err(ChannelError::Connection { attempts: attempt });
                    }
                }
            }
        }
    }
}

/// Exponential backoff capped at the configured ceiling, with jitter so a
/// fleet of clients does not reconnect in lockstep.
fn backoff_delay(config: &ChannelConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = config
        .base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(config.max_delay_ms);
    let jitter = rand::thread_rng().gen_range(0..=config.base_delay_ms / 2);
    Duration::from_millis(base.saturating_add(jitter))
}

fn dispatch(shared: &ChannelShared, envelope: &Envelope) {
    let handlers: Vec<Handler> = {
        let subscriptions = shared.subscriptions.lock().unwrap();
        subscriptions
            .values()
            .filter(|(topic, _)| topic == &envelope.topic)
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    };
    if handlers.is_empty() {
        trace!(topic = %envelope.topic, "no subscriber for frame");
        return;
    }
    for handler in handlers {
        handler(envelope);
    }
}
