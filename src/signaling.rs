//! Signaling channels over a generic pub/sub bus.
//!
//! Every user listens on exactly one inbound channel, `signaling:<userId>`.
//! To signal a peer we publish on the peer's channel, which the bus requires
//! us to subscribe first. Each peer gets its own send queue, drained by a
//! worker task that keeps the confirmed subscription for the lifetime of the
//! manager since a single call can send dozens of candidates. Callers never
//! wait on the bus.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::errors::{BusError, CallError};
use crate::peer::types::{PeerInfo, Signal, SignalKind, SignalMessage};

/// Callback invoked by the bus for every payload on a subscribed channel.
pub type InboundHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Pub/sub transport contract.
#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Subscribe to `channel`, resolving once the bus confirms.
    ///
    /// `handler` is `None` for send-only subscriptions.
    async fn subscribe(
        &self,
        channel: &str,
        handler: Option<InboundHandler>,
    ) -> Result<(), BusError>;

    async fn publish(&self, channel: &str, payload: Value) -> Result<(), BusError>;

    async fn unsubscribe(&self, channel: &str);
}

/// Source of the signed-in user's identity.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<PeerInfo>;
}

pub fn channel_name(user_id: &str) -> String {
    format!("signaling:{user_id}")
}

enum Outbound {
    Publish { kind: SignalKind, payload: Value },
    Flush(oneshot::Sender<()>),
}

/// Per-peer send queue worker.
///
/// Subscribes to the peer's channel on first use and keeps the confirmed
/// subscription until the manager stops. Messages go out strictly in the order
/// they were queued; a message whose subscription fails or times out is
/// dropped and the next one retries the subscription.
struct OutboundChannel {
    bus: Arc<dyn SignalBus>,
    peer_id: String,
    channel: String,
    subscribe_timeout: Duration,
    confirmed_at: Option<DateTime<Utc>>,
}

impl OutboundChannel {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Publish { kind, payload } => self.publish(kind, payload).await,
                Outbound::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        if let Some(confirmed_at) = self.confirmed_at {
            self.bus.unsubscribe(&self.channel).await;
            debug!(peer_id = %self.peer_id, %confirmed_at, "Outbound channel closed");
        }
    }

    async fn publish(&mut self, kind: SignalKind, payload: Value) {
        if let Err(e) = self.confirm().await {
            warn!(peer_id = %self.peer_id, ?kind, error = %e, "Signal dropped");
            return;
        }
        match self.bus.publish(&self.channel, payload).await {
            Ok(()) => debug!(peer_id = %self.peer_id, ?kind, "Signal sent"),
            Err(e) => warn!(peer_id = %self.peer_id, ?kind, error = %e, "Publish failed"),
        }
    }

    async fn confirm(&mut self) -> Result<(), CallError> {
        if self.confirmed_at.is_some() {
            return Ok(());
        }
        match timeout(self.subscribe_timeout, self.bus.subscribe(&self.channel, None)).await {
            Ok(Ok(())) => {
                debug!(channel = %self.channel, "Outbound channel confirmed");
                self.confirmed_at = Some(Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!(
                    channel = %self.channel,
                    timeout_ms = self.subscribe_timeout.as_millis() as u64,
                    "Outbound subscription timed out"
                );
                self.bus.unsubscribe(&self.channel).await;
                Err(CallError::ChannelSubscriptionTimeout {
                    channel: self.channel.clone(),
                })
            }
        }
    }
}

struct OutboundQueue {
    channel: String,
    tx: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

/// A pending subscription to the local user's own channel.
///
/// Confirmation runs detached from the manager; report the channel back with
/// [`ChannelManager::listening`].
pub struct InboundSubscription {
    bus: Arc<dyn SignalBus>,
    channel: String,
    handler: InboundHandler,
    subscribe_timeout: Duration,
}

impl InboundSubscription {
    pub async fn confirm(&self) -> Result<String, CallError> {
        match timeout(
            self.subscribe_timeout,
            self.bus.subscribe(&self.channel, Some(self.handler.clone())),
        )
        .await
        {
            Ok(Ok(())) => Ok(self.channel.clone()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                self.bus.unsubscribe(&self.channel).await;
                Err(CallError::ChannelSubscriptionTimeout {
                    channel: self.channel.clone(),
                })
            }
        }
    }

    /// Undo a confirmed subscription nobody is going to use.
    pub async fn cancel(&self) {
        self.bus.unsubscribe(&self.channel).await;
    }
}

pub struct ChannelManager {
    bus: Arc<dyn SignalBus>,
    identity: Arc<dyn IdentityProvider>,
    subscribe_timeout: Duration,
    outbound: HashMap<String, OutboundQueue>,
    inbound: Option<String>,
}

impl ChannelManager {
    pub fn new(
        bus: Arc<dyn SignalBus>,
        identity: Arc<dyn IdentityProvider>,
        subscribe_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            identity,
            subscribe_timeout,
            outbound: HashMap::new(),
            inbound: None,
        }
    }

    pub fn local_user(&self) -> Option<PeerInfo> {
        self.identity.current_user()
    }

    /// Prepare the subscription to the local user's inbound channel.
    pub fn subscription(&self, handler: InboundHandler) -> Result<InboundSubscription, CallError> {
        let me = self.local_user().ok_or(CallError::NotAuthenticated)?;
        Ok(InboundSubscription {
            bus: self.bus.clone(),
            channel: channel_name(&me.id),
            handler,
            subscribe_timeout: self.subscribe_timeout,
        })
    }

    /// Record the confirmed inbound channel.
    pub fn listening(&mut self, channel: String) {
        info!(channel = %channel, "Listening for signals");
        self.inbound = Some(channel);
    }

    pub fn is_listening(&self) -> bool {
        self.inbound.is_some()
    }

    /// Drop the inbound subscription and every outbound channel.
    ///
    /// Queued signals get one subscription timeout to go out.
    pub async fn stop(&mut self) {
        if let Some(channel) = self.inbound.take() {
            self.bus.unsubscribe(&channel).await;
        }
        for (peer_id, queue) in self.outbound.drain() {
            let OutboundQueue { channel, tx, mut task } = queue;
            drop(tx);
            if timeout(self.subscribe_timeout, &mut task).await.is_err() {
                warn!(peer_id = %peer_id, "Outbound queue did not drain in time");
                task.abort();
                self.bus.unsubscribe(&channel).await;
            }
        }
        debug!("Signaling channels closed");
    }

    /// Queue `signal` for the peer's inbound channel. Never waits on the bus.
    pub fn send_to(&mut self, peer_id: &str, signal: Signal) -> Result<(), CallError> {
        let me = self.local_user().ok_or(CallError::NotAuthenticated)?;
        let kind = signal.kind();
        let payload = serde_json::to_value(signal.into_message(&me))?;

        let queue = self
            .outbound
            .entry(peer_id.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let worker = OutboundChannel {
                    bus: self.bus.clone(),
                    peer_id: peer_id.to_string(),
                    channel: channel_name(peer_id),
                    subscribe_timeout: self.subscribe_timeout,
                    confirmed_at: None,
                };
                OutboundQueue {
                    channel: worker.channel.clone(),
                    tx,
                    task: tokio::spawn(worker.run(rx)),
                }
            });
        queue
            .tx
            .send(Outbound::Publish { kind, payload })
            .map_err(|_| CallError::Bus(BusError::Disconnected))
    }

    /// Resolves once everything queued so far has been handed to the bus.
    pub fn flushed(&self) -> impl Future<Output = ()> + Send + 'static {
        let waits: Vec<oneshot::Receiver<()>> = self
            .outbound
            .values()
            .filter_map(|queue| {
                let (tx, rx) = oneshot::channel();
                queue.tx.send(Outbound::Flush(tx)).ok().map(|_| rx)
            })
            .collect();
        async move {
            for rx in waits {
                let _ = rx.await;
            }
        }
    }
}

/// Decode an inbound payload, dropping anything that isn't a signal envelope.
pub fn decode_inbound(payload: Value) -> Option<SignalMessage> {
    match serde_json::from_value::<SignalMessage>(payload) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!(error = %e, "Dropping malformed signal");
            None
        }
    }
}
