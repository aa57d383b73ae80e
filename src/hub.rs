//! Broadcast hub: live event fan-out to workcenter terminals.
//!
//! The hub owns the subscriber registry. Each subscriber is one long-lived
//! stream connection, registered under a channel (the workcenter key) and
//! written to through an mpsc handle the transport layer drains into the
//! socket. A per-subscriber heartbeat task detects dead peers; subscribers
//! whose connection has outlived the staleness window are reclaimed by the
//! reaper. Nothing here is persisted and nothing is replayed — a terminal
//! connecting after a broadcast never sees it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{ConnectedEvent, HeartbeatEvent};
use crate::sse;

/// Newtype for subscriber connection IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Interval between keep-alive pings on each subscriber stream.
    pub heartbeat_interval: std::time::Duration,
    /// Outbound frame buffer per subscriber. A full buffer drops the frame;
    /// there is no backpressure on broadcasters.
    pub channel_capacity: usize,
    /// Connections older than this are considered stale and reclaimed.
    pub stale_after: chrono::Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: std::time::Duration::from_secs(10),
            channel_capacity: 32,
            stale_after: chrono::Duration::days(3),
        }
    }
}

/// One registered stream connection.
struct Subscriber {
    client_id: ClientId,
    channel: String,
    connected_at: DateTime<Utc>,
    sender: mpsc::Sender<String>,
    heartbeat: JoinHandle<()>,
}

/// Diagnostic snapshot of one subscriber.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    #[serde(rename = "clientId")]
    pub client_id: ClientId,
    pub channel: String,
    #[serde(rename = "connectedAt")]
    pub connected_at: DateTime<Utc>,
}

/// The broadcast hub. Owns the subscriber registry; constructed once and
/// injected into whatever handles connections — never ambient state.
pub struct BroadcastHub {
    config: HubConfig,
    // Vec keeps registration order, which is the delivery order within one
    // broadcast call.
    subscribers: RwLock<Vec<Subscriber>>,
}

impl BroadcastHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a new subscriber on a channel.
    ///
    /// Returns the allocated client ID and the receiving end of the stream;
    /// the transport layer drains the receiver into the socket. The first
    /// frame on the stream is the connected event, followed by heartbeat
    /// pings every `heartbeat_interval`. A failed heartbeat write means the
    /// peer is gone: the subscriber is deregistered and the stream closed.
    pub async fn connect(self: Arc<Self>, channel: &str) -> (ClientId, mpsc::Receiver<String>) {
        let client_id = ClientId::new();
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity);

        let heartbeat = {
            let hub = Arc::clone(&self);
            let sender = sender.clone();
            let interval = self.config.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // first tick completes immediately
                loop {
                    ticker.tick().await;
                    let frame = sse::frame(&HeartbeatEvent::ping());
                    if sender.send(frame).await.is_err() {
                        debug!(client_id = %client_id, "heartbeat write failed, reclaiming subscriber");
                        hub.disconnect_reactive(client_id).await;
                        break;
                    }
                }
            })
        };

        let mut subs = self.subscribers.write().await;
        subs.push(Subscriber {
            client_id,
            channel: channel.to_string(),
            connected_at: Utc::now(),
            sender: sender.clone(),
            heartbeat,
        });

        // Pushed while still holding the write lock so no broadcast can
        // slip in ahead of the connected event.
        let connected = ConnectedEvent {
            connected: true,
            client_id: client_id.to_string(),
            channel: channel.to_string(),
        };
        let _ = sender.send(sse::frame(&connected)).await;
        drop(subs);

        info!(client_id = %client_id, channel, "subscriber connected");
        (client_id, receiver)
    }

    /// Remove a subscriber whose peer closed the connection. Idempotent —
    /// the transport may race the heartbeat task here.
    pub async fn disconnect_reactive(&self, client_id: ClientId) {
        if let Some(sub) = self.remove(client_id).await {
            sub.heartbeat.abort();
            info!(client_id = %client_id, channel = %sub.channel, "subscriber disconnected");
        }
    }

    /// Administrative removal. Returns false when no such client exists —
    /// a NotFound condition, not an error.
    pub async fn disconnect_explicit(&self, client_id: ClientId) -> bool {
        match self.remove(client_id).await {
            Some(sub) => {
                sub.heartbeat.abort();
                info!(client_id = %client_id, channel = %sub.channel, "subscriber removed");
                true
            }
            None => false,
        }
    }

    async fn remove(&self, client_id: ClientId) -> Option<Subscriber> {
        let mut subs = self.subscribers.write().await;
        let pos = subs.iter().position(|s| s.client_id == client_id)?;
        Some(subs.remove(pos))
    }

    /// Write a payload to every subscriber currently registered on the
    /// channel, in registration order. Returns the delivered count.
    ///
    /// Delivery is fire-and-forget: a failed write is logged and the dead
    /// subscriber left for the next heartbeat failure to reclaim.
    pub async fn broadcast<T: Serialize>(&self, channel: &str, payload: &T) -> usize {
        let frame = sse::frame(payload);
        let subs = self.subscribers.read().await;
        let mut delivered = 0;

        for sub in subs.iter().filter(|s| s.channel == channel) {
            match sub.sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        client_id = %sub.client_id,
                        channel,
                        "broadcast write dropped: {err}"
                    );
                }
            }
        }

        debug!(channel, delivered, "broadcast");
        delivered
    }

    /// Reclaim subscribers on a channel whose connection is older than
    /// `max_age`. Returns the number reclaimed.
    pub async fn reap_stale(&self, channel: &str, max_age: chrono::Duration) -> usize {
        let now = Utc::now();
        let mut subs = self.subscribers.write().await;
        let mut reaped = 0;

        let mut i = 0;
        while i < subs.len() {
            if subs[i].channel == channel && now - subs[i].connected_at > max_age {
                let sub = subs.remove(i);
                sub.heartbeat.abort();
                info!(
                    client_id = %sub.client_id,
                    channel = %sub.channel,
                    connected_at = %sub.connected_at,
                    "reaped stale subscriber"
                );
                reaped += 1;
            } else {
                i += 1;
            }
        }
        reaped
    }

    /// Diagnostic snapshot of every live subscriber. No side effects.
    pub async fn list_clients(&self) -> Vec<ClientInfo> {
        let subs = self.subscribers.read().await;
        subs.iter()
            .map(|s| ClientInfo {
                client_id: s.client_id,
                channel: s.channel.clone(),
                connected_at: s.connected_at,
            })
            .collect()
    }

    /// Background reaper over all channels, ticking at half the staleness
    /// window. Runs until the shutdown signal flips.
    pub fn spawn_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let stale_after = self.config.stale_after;
        let tick = stale_after
            .to_std()
            .map(|d| d / 2)
            .unwrap_or(std::time::Duration::from_secs(60))
            .max(std::time::Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.reap_all(stale_after).await;
                    }
                }
            }
        });
    }

    async fn reap_all(&self, max_age: chrono::Duration) {
        let channels: Vec<String> = {
            let subs = self.subscribers.read().await;
            let mut channels: Vec<String> = subs.iter().map(|s| s.channel.clone()).collect();
            channels.sort();
            channels.dedup();
            channels
        };
        for channel in channels {
            self.reap_stale(&channel, max_age).await;
        }
    }
}
