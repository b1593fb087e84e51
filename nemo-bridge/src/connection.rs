//! Broker connections (ingest side, display side).
//!
//! rumqttc reconnects by itself on the next `poll` after an error; this
//! module decides *when* that next poll happens (exponential backoff held as
//! plain data in `Backoff`), re-issues every subscription on each ConnAck
//! and publishes the link state on a `watch` channel for the other tasks.

use crate::config::{MqttConf, ReconnectConf};
use crate::error::BridgeError;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, Publish, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn is_connected(self) -> bool {
        self == LinkState::Connected
    }
}

/// Doubling reconnect delay, capped. A connection that stayed up for at
/// least `stable_after` resets the delay to `initial`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    stable_after: Duration,
    next: Duration,
    connected_since: Option<Instant>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, stable_after: Duration) -> Self {
        Self {
            initial,
            max,
            stable_after,
            next: initial,
            connected_since: None,
        }
    }

    pub fn from_config(cfg: &ReconnectConf) -> Self {
        Self::new(cfg.initial(), cfg.max(), cfg.stable_after())
    }

    pub fn on_connected(&mut self, now: Instant) {
        self.connected_since = Some(now);
    }

    /// Delay before the next attempt.
    pub fn on_failure(&mut self, now: Instant) -> Duration {
        if let Some(since) = self.connected_since.take() {
            if now.saturating_duration_since(since) >= self.stable_after {
                self.next = self.initial;
            }
        }
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    pub fn peek(&self) -> Duration {
        self.next
    }
}

/// Connection state machine, independent of the network.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: LinkState,
    backoff: Backoff,
    subscriptions: Vec<String>,
}

impl ConnectionMachine {
    pub fn new(subscriptions: Vec<String>, backoff: Backoff) -> Self {
        Self {
            state: LinkState::Disconnected,
            backoff,
            subscriptions,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn connecting(&mut self) {
        self.state = LinkState::Connecting;
    }

    /// Returns the subscriptions to re-issue; sessions are not assumed to
    /// survive on the broker.
    pub fn connected(&mut self, now: Instant) -> &[String] {
        self.state = LinkState::Connected;
        self.backoff.on_connected(now);
        &self.subscriptions
    }

    /// Returns how long to wait before reconnecting.
    pub fn failed(&mut self, now: Instant) -> Duration {
        self.state = LinkState::Disconnected;
        self.backoff.on_failure(now)
    }
}

/// Shared view of one connection, read by the heartbeat.
#[derive(Debug, Clone)]
pub struct LinkHealth {
    state: watch::Receiver<LinkState>,
    reconnects: Arc<AtomicU32>,
}

impl LinkHealth {
    pub fn new(state: watch::Receiver<LinkState>, reconnects: Arc<AtomicU32>) -> Self {
        Self { state, reconnects }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }
}

pub fn mqtt_options(conf: &MqttConf, last_will: Option<LastWill>) -> MqttOptions {
    let mut opts = MqttOptions::new(&conf.client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs));
    opts.set_clean_session(true);
    if let Some(user) = &conf.username {
        opts.set_credentials(user, conf.password.clone().unwrap_or_default());
    }
    if let Some(will) = last_will {
        opts.set_last_will(will);
    }
    opts
}

pub struct Connection {
    name: &'static str,
    client: AsyncClient,
    eventloop: EventLoop,
    machine: ConnectionMachine,
    state_tx: watch::Sender<LinkState>,
    reconnects: Arc<AtomicU32>,
    inbound: Option<mpsc::Sender<Publish>>,
    connect_timeout: Duration,
}

impl Connection {
    pub fn new(
        name: &'static str,
        options: MqttOptions,
        subscriptions: Vec<String>,
        backoff: Backoff,
        connect_timeout: Duration,
    ) -> Self {
        let (client, eventloop) = AsyncClient::new(options, 64);
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        Self {
            name,
            client,
            eventloop,
            machine: ConnectionMachine::new(subscriptions, backoff),
            state_tx,
            reconnects: Arc::new(AtomicU32::new(0)),
            inbound: None,
            connect_timeout,
        }
    }

    /// Incoming publishes are forwarded to this bounded queue.
    pub fn with_inbound(mut self, tx: mpsc::Sender<Publish>) -> Self {
        self.inbound = Some(tx);
        self
    }

    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    pub fn health(&self) -> LinkHealth {
        LinkHealth::new(self.state_tx.subscribe(), self.reconnects.clone())
    }

    fn set_state(&self, state: LinkState) {
        self.state_tx.send_replace(state);
    }

    async fn poll(&mut self) -> Result<Event, BridgeError> {
        if self.machine.state().is_connected() {
            Ok(self.eventloop.poll().await?)
        } else {
            match tokio::time::timeout(self.connect_timeout, self.eventloop.poll()).await {
                Ok(event) => Ok(event?),
                Err(_) => Err(BridgeError::Timeout("connect")),
            }
        }
    }

    /// Drives the connection until shutdown, then disconnects cleanly.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let name = self.name;
        self.machine.connecting();
        self.set_state(LinkState::Connecting);

        loop {
            let polled = tokio::select! {
                _ = shutdown.changed() => break,
                polled = self.poll() => polled,
            };

            match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    let subscriptions = self.machine.connected(Instant::now()).to_vec();
                    self.set_state(LinkState::Connected);
                    info!(connection = name, "broker connection established");
                    for topic in subscriptions {
                        if let Err(e) = self.client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                            error!(connection = name, %topic, error = %e, "subscribe failed");
                        } else {
                            debug!(connection = name, %topic, "subscribed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if let Some(tx) = &self.inbound {
                        if tx.send(publish).await.is_err() {
                            warn!(connection = name, "inbound queue closed");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let delay = self.machine.failed(Instant::now());
                    self.set_state(LinkState::Disconnected);
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    warn!(connection = name, error = %e, retry_in = ?delay, "broker connection lost");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.machine.connecting();
                    self.set_state(LinkState::Connecting);
                }
            }
        }

        self.disconnect().await;
    }

    /// Sends DISCONNECT after whatever is already queued (e.g. an offline
    /// heartbeat) and polls until it has gone out.
    async fn disconnect(&mut self) {
        if !self.machine.state().is_connected() {
            self.set_state(LinkState::Disconnected);
            return;
        }
        if let Err(e) = self.client.try_disconnect() {
            warn!(connection = self.name, error = %e, "disconnect request failed");
            return;
        }
        let limit = self.connect_timeout;
        let eventloop = &mut self.eventloop;
        let drain = async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(limit, drain).await.is_err() {
            warn!(connection = self.name, "graceful disconnect timed out");
        }
        self.machine.failed(Instant::now());
        self.set_state(LinkState::Disconnected);
        info!(connection = self.name, "disconnected");
    }
}
