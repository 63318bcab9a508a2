//! # Network Broker
//!
//! TCP-facing router bound to a contiguous port triple:
//!
//! - `base`: control channel, identity-framed `CONNECT`/`DISCONNECT`
//!   announcements (informational today, the admission extension point).
//! - `base+1`: broadcast channel, fan-out of every accepted event to
//!   receivers filtered by topic prefix at the transport layer.
//! - `base+2`: collect channel, many-to-one publish traffic from clients.
//!
//! Per-connection reader tasks pump frames into a channel consumed by one
//! reactor task; the reactor re-broadcasts collect traffic verbatim and
//! injects it into bridged [`LocalBus`] instances.

use std::collections::{HashMap, HashSet};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::LocalBus;
use crate::config::BrokerConfig;
use crate::error::BusError;
use crate::event::Event;
use crate::topic::wildcard_match;
use crate::wire::{self, ControlMessage};
use crate::{RESERVED_TOPICS, TOPIC_CLOSE, TOPIC_PULSE};

/// Depth of the reader-to-reactor input channel.
const INPUT_CHANNEL_CAPACITY: usize = 1024;

/// Frames funneled into the reactor.
enum BrokerInput {
    /// Identity-framed message on the control channel.
    Control { identity: String, body: Vec<u8> },
    /// `(topic, serialized-event)` publish frame on the collect channel.
    Collect { topic: Vec<u8>, body: Vec<u8> },
}

/// A connected broadcast receiver: its write half plus the topic prefixes
/// it registered interest in (updated by its own reader task).
struct BroadcastPeer {
    peer_id: u64,
    writer: OwnedWriteHalf,
    prefixes: Arc<RwLock<HashSet<String>>>,
}

impl BroadcastPeer {
    fn wants(&self, frame_topic: &str) -> bool {
        self.prefixes
            .read()
            .map(|prefixes| prefixes.iter().any(|p| frame_topic.starts_with(p.as_str())))
            .unwrap_or(false)
    }
}

/// A standing relay into a local bus.
#[derive(Clone)]
struct BridgeRule {
    bus: Arc<LocalBus>,
    topic_filters: Vec<String>,
}

impl BridgeRule {
    fn matches(&self, frame_topic: &str) -> bool {
        self.topic_filters
            .iter()
            .any(|f| f == frame_topic || wildcard_match(frame_topic, f))
    }
}

/// Idle signaling between the reactor's empty-poll branch and `flush`.
#[derive(Default)]
struct IdleFlag {
    set: AtomicBool,
    notify: Notify,
}

impl IdleFlag {
    fn set(&self) {
        self.set.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn clear(&self) {
        self.set.store(false, Ordering::Release);
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.set.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// State shared by the reactor, the accept loops, and the facade.
struct Shared {
    running: AtomicBool,
    torn_down: AtomicBool,
    shutdown: Notify,
    idle: IdleFlag,
    subscribers: tokio::sync::Mutex<Vec<BroadcastPeer>>,
    /// Control-channel identities, informational for now.
    clients: Mutex<HashMap<String, bool>>,
    bridges: tokio::sync::Mutex<Vec<BridgeRule>>,
    /// Per-connection reader tasks, cleaned up on close.
    connection_tasks: Mutex<Vec<JoinHandle<()>>>,
    next_peer_id: AtomicU64,
}

impl Shared {
    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn track_task(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.connection_tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
    }

    /// Fan a frame out to every subscriber whose prefix filter matches.
    /// Dead peers are dropped on write failure.
    async fn broadcast(&self, frame_topic: &str, body: &[u8]) {
        let mut peers = self.subscribers.lock().await;
        let mut dead = Vec::new();
        for peer in peers.iter_mut() {
            if !peer.wants(frame_topic) {
                continue;
            }
            if let Err(error) = wire::write_frame(&mut peer.writer, frame_topic.as_bytes(), body).await
            {
                debug!(peer_id = peer.peer_id, %error, "dropping broadcast subscriber");
                dead.push(peer.peer_id);
            }
        }
        if !dead.is_empty() {
            peers.retain(|p| !dead.contains(&p.peer_id));
        }
    }

    async fn broadcast_event(&self, event: &Event) {
        match serde_json::to_vec(event) {
            Ok(body) => self.broadcast(&event.topic, &body).await,
            Err(error) => warn!(topic = %event.topic, %error, "failed to serialize event"),
        }
    }

    /// Collect-channel frame: re-broadcast verbatim, then bridge into any
    /// forwarded local bus whose filters match. Reserved topics never
    /// cross a bridge.
    async fn handle_collect(&self, topic_bytes: Vec<u8>, body: Vec<u8>) {
        let frame_topic = String::from_utf8_lossy(&topic_bytes).into_owned();
        self.broadcast(&frame_topic, &body).await;

        if RESERVED_TOPICS.contains(&frame_topic.as_str()) {
            return;
        }
        let bridges: Vec<BridgeRule> = self.bridges.lock().await.clone();
        for rule in bridges.iter().filter(|r| r.matches(&frame_topic)) {
            match serde_json::from_slice::<Event>(&body) {
                Ok(event) => {
                    rule.bus.publish(event).await;
                }
                Err(error) => {
                    warn!(topic = %frame_topic, %error, "dropping undecodable bridged frame");
                }
            }
        }
    }

    /// Control-channel frame: identity bookkeeping only, for now.
    fn handle_control(&self, identity: String, body: Vec<u8>) {
        match ControlMessage::from_bytes(&body) {
            Ok(ControlMessage::Connect { client_id }) => {
                debug!(%identity, %client_id, "client connected");
                if let Ok(mut clients) = self.clients.lock() {
                    clients.insert(client_id, true);
                }
            }
            Ok(ControlMessage::Disconnect { client_id }) => {
                debug!(%identity, %client_id, "client disconnected");
                if let Ok(mut clients) = self.clients.lock() {
                    clients.insert(client_id, false);
                }
            }
            Ok(other) => debug!(%identity, ?other, "unexpected control message"),
            Err(error) => warn!(%identity, %error, "dropping undecodable control frame"),
        }
    }
}

/// Networked event broker.
pub struct Broker {
    host: String,
    base_port: u16,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    close_guard: tokio::sync::Mutex<()>,
}

impl Broker {
    /// Bind the port triple and start the broker.
    ///
    /// All three ports must bind; failure on any one is fatal to startup.
    pub async fn bind(host: &str, base_port: u16, config: BrokerConfig) -> Result<Self, BusError> {
        let control = TcpListener::bind((host, base_port))
            .await
            .map_err(|source| BusError::Bind {
                channel: "control",
                port: base_port,
                source,
            })?;
        let broadcast = TcpListener::bind((host, base_port + 1))
            .await
            .map_err(|source| BusError::Bind {
                channel: "broadcast",
                port: base_port + 1,
                source,
            })?;
        let collect = TcpListener::bind((host, base_port + 2))
            .await
            .map_err(|source| BusError::Bind {
                channel: "collect",
                port: base_port + 2,
                source,
            })?;

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            torn_down: AtomicBool::new(false),
            shutdown: Notify::new(),
            idle: IdleFlag::default(),
            subscribers: tokio::sync::Mutex::new(Vec::new()),
            clients: Mutex::new(HashMap::new()),
            bridges: tokio::sync::Mutex::new(Vec::new()),
            connection_tasks: Mutex::new(Vec::new()),
            next_peer_id: AtomicU64::new(0),
        });

        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);

        let tasks = vec![
            tokio::spawn(Self::accept_control(
                control,
                input_tx.clone(),
                Arc::clone(&shared),
            )),
            tokio::spawn(Self::accept_broadcast(broadcast, Arc::clone(&shared))),
            tokio::spawn(Self::accept_collect(collect, input_tx, Arc::clone(&shared))),
            tokio::spawn(Self::reactor(Arc::clone(&shared), input_rx, config)),
        ];

        debug!(host, base_port, "broker bound on port triple");
        Ok(Self {
            host: host.to_string(),
            base_port,
            shared,
            tasks: Mutex::new(tasks),
            close_guard: tokio::sync::Mutex::new(()),
        })
    }

    /// Host the broker is bound on.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Base port of the triple.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.base_port
    }

    /// Whether the broker is still serving.
    #[must_use]
    pub fn running(&self) -> bool {
        self.shared.running()
    }

    /// Identities that announced themselves on the control channel, with
    /// their last known connected state.
    #[must_use]
    pub fn clients(&self) -> HashMap<String, bool> {
        self.shared
            .clients
            .lock()
            .map(|clients| clients.clone())
            .unwrap_or_default()
    }

    async fn accept_control(
        listener: TcpListener,
        input_tx: mpsc::Sender<BrokerInput>,
        shared: Arc<Shared>,
    ) {
        loop {
            // Registered before the running check: notify_waiters only
            // wakes enabled waiters, so enable-then-check leaves no window
            // where a shutdown signal is lost while parked on accept.
            let mut closing = pin!(shared.shutdown.notified());
            closing.as_mut().enable();
            if !shared.running() {
                break;
            }
            let stream = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(error) => {
                        warn!(%error, "control accept failed");
                        continue;
                    }
                },
                () = &mut closing => break,
            };
            let tx = input_tx.clone();
            let conn_shared = Arc::clone(&shared);
            let task = tokio::spawn(async move {
                let mut stream = stream;
                loop {
                    if !conn_shared.running() {
                        break;
                    }
                    let frame = tokio::select! {
                        frame = wire::read_frame(&mut stream) => frame,
                        () = conn_shared.shutdown.notified() => break,
                    };
                    match frame {
                        Ok((identity, body)) => {
                            let identity = String::from_utf8_lossy(&identity).into_owned();
                            if tx.send(BrokerInput::Control { identity, body }).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
            shared.track_task(task);
        }
    }

    async fn accept_broadcast(listener: TcpListener, shared: Arc<Shared>) {
        loop {
            let mut closing = pin!(shared.shutdown.notified());
            closing.as_mut().enable();
            if !shared.running() {
                break;
            }
            let stream = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(error) => {
                        warn!(%error, "broadcast accept failed");
                        continue;
                    }
                },
                () = &mut closing => break,
            };

            let peer_id = shared.next_peer_id.fetch_add(1, Ordering::AcqRel);
            let prefixes = Arc::new(RwLock::new(HashSet::new()));
            let (read_half, write_half) = stream.into_split();
            shared.subscribers.lock().await.push(BroadcastPeer {
                peer_id,
                writer: write_half,
                prefixes: Arc::clone(&prefixes),
            });

            // The receiver's upstream direction carries subscription
            // filter updates.
            let conn_shared = Arc::clone(&shared);
            let task = tokio::spawn(async move {
                let mut read_half = read_half;
                loop {
                    if !conn_shared.running() {
                        break;
                    }
                    let frame = tokio::select! {
                        frame = wire::read_frame(&mut read_half) => frame,
                        () = conn_shared.shutdown.notified() => break,
                    };
                    match frame {
                        Ok((_, body)) => match ControlMessage::from_bytes(&body) {
                            Ok(ControlMessage::Subscribe { topics }) => {
                                debug!(peer_id, ?topics, "subscription update");
                                if let Ok(mut set) = prefixes.write() {
                                    set.extend(topics);
                                }
                            }
                            Ok(other) => debug!(peer_id, ?other, "unexpected subscriber message"),
                            Err(error) => {
                                warn!(peer_id, %error, "dropping undecodable subscriber frame");
                            }
                        },
                        Err(_) => break,
                    }
                }
                // Receiver gone; forget its write half.
                conn_shared
                    .subscribers
                    .lock()
                    .await
                    .retain(|p| p.peer_id != peer_id);
            });
            shared.track_task(task);
        }
    }

    async fn accept_collect(
        listener: TcpListener,
        input_tx: mpsc::Sender<BrokerInput>,
        shared: Arc<Shared>,
    ) {
        loop {
            let mut closing = pin!(shared.shutdown.notified());
            closing.as_mut().enable();
            if !shared.running() {
                break;
            }
            let stream = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(error) => {
                        warn!(%error, "collect accept failed");
                        continue;
                    }
                },
                () = &mut closing => break,
            };
            let tx = input_tx.clone();
            let conn_shared = Arc::clone(&shared);
            let task = tokio::spawn(async move {
                let mut stream = stream;
                loop {
                    if !conn_shared.running() {
                        break;
                    }
                    let frame = tokio::select! {
                        frame = wire::read_frame(&mut stream) => frame,
                        () = conn_shared.shutdown.notified() => break,
                    };
                    match frame {
                        Ok((topic, body)) => {
                            if tx.send(BrokerInput::Collect { topic, body }).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
            shared.track_task(task);
        }
    }

    /// The single reactor loop: inputs, heartbeat pulses, and the bounded
    /// poll whose empty windows set the idle flag.
    async fn reactor(shared: Arc<Shared>, mut inputs: mpsc::Receiver<BrokerInput>, config: BrokerConfig) {
        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while shared.running() {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(BrokerInput::Collect { topic, body }) => {
                        shared.handle_collect(topic, body).await;
                    }
                    Some(BrokerInput::Control { identity, body }) => {
                        shared.handle_control(identity, body);
                    }
                    None => break,
                },
                _ = heartbeat.tick() => {
                    shared.broadcast_event(&Event::signal(TOPIC_PULSE)).await;
                }
                () = tokio::time::sleep(config.poll_timeout) => {
                    // Empty poll window: everything collected so far has
                    // been processed.
                    shared.idle.set();
                }
                () = shared.shutdown.notified() => break,
            }
        }
    }

    /// Wait until the reactor observes an empty poll window.
    ///
    /// A development and testing barrier: all traffic collected before the
    /// call has been re-broadcast when it returns. Best-effort idleness
    /// detection, not a delivery guarantee.
    pub async fn flush(&self) {
        if !self.running() {
            return;
        }
        self.shared.idle.clear();
        self.shared.idle.wait().await;
    }

    /// Register a local bus as a forwarding target: collect traffic
    /// matching the filters (default: everything) is decoded and published
    /// into it. Reserved topics are excluded at this hop like any other.
    pub async fn forward(&self, bus: &Arc<LocalBus>, topic_filters: Option<Vec<String>>) {
        let rule = BridgeRule {
            bus: Arc::clone(bus),
            topic_filters: topic_filters.unwrap_or_else(|| vec![crate::topic::WILDCARD.to_string()]),
        };
        self.shared.bridges.lock().await.push(rule);
    }

    /// Remove a forwarding target registered with [`forward`](Self::forward).
    pub async fn deforward(&self, bus: &Arc<LocalBus>) {
        self.shared
            .bridges
            .lock()
            .await
            .retain(|rule| !Arc::ptr_eq(&rule.bus, bus));
    }

    /// Graceful shutdown: broadcast the reserved close event so connected
    /// clients can react, stop the reactor, then release all sockets.
    /// Idempotent and safe to call from overlapping callers.
    pub async fn close(&self) {
        let _guard = self.close_guard.lock().await;
        if self.shared.torn_down.load(Ordering::Acquire) {
            return;
        }
        self.shared.broadcast_event(&Event::signal(TOPIC_CLOSE)).await;
        self.teardown().await;
    }

    /// Abrupt termination: no closing broadcast.
    ///
    /// Connected clients only find out through heartbeat loss. Failure
    /// injection for liveness tests.
    pub async fn abort(&self) {
        let _guard = self.close_guard.lock().await;
        if self.shared.torn_down.load(Ordering::Acquire) {
            return;
        }
        self.teardown().await;
    }

    async fn teardown(&self) {
        if self.shared.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.running.store(false, Ordering::Release);
        self.shared.shutdown.notify_waiters();

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut tasks| tasks.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            let _ = task.await;
        }

        // Per-connection readers that were parked on a quiet socket.
        let connection_tasks: Vec<JoinHandle<()>> = self
            .shared
            .connection_tasks
            .lock()
            .map(|mut tasks| tasks.drain(..).collect())
            .unwrap_or_default();
        for task in connection_tasks {
            task.abort();
            let _ = task.await;
        }

        let mut subscribers = self.shared.subscribers.lock().await;
        for peer in subscribers.iter_mut() {
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut peer.writer).await;
        }
        subscribers.clear();
        debug!(base_port = self.base_port, "broker closed");
    }
}
