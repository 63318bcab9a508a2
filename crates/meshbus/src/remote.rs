//! # Remote Entrypoint
//!
//! Distributed client of a [`Broker`](crate::Broker). Owns three sockets
//! against the broker's port triple (control, subscribe, publish), a
//! single-threaded reactor that dispatches incoming frames, and a heartbeat
//! monitor that detects brokers dying without a graceful closing broadcast.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec;
use crate::config::HeartbeatConfig;
use crate::error::BusError;
use crate::event::Event;
use crate::handler::{self, wrap_raw, wrap_typed, DispatchMode, DynHandler, Registration};
use crate::topic::{self, subscription_prefix};
use crate::wire::{self, ControlMessage};
use crate::{RECEIVED_WINDOW, TOPIC_CLOSE, TOPIC_PULSE};

/// Bounded reactor poll timeout on the subscribe channel.
const POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Depth of the reader-to-reactor frame channel.
const FRAME_CHANNEL_CAPACITY: usize = 1024;

type DisruptionCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Tables {
    exact: HashMap<String, Registration>,
    wildcard: HashMap<String, Registration>,
}

/// State shared between the facade, the reactor, and the monitor.
struct Shared {
    id: String,
    running: AtomicBool,
    torn_down: AtomicBool,
    connected: AtomicBool,
    shutdown: Notify,
    tables: RwLock<Tables>,
    received: Mutex<VecDeque<String>>,
    /// Heartbeats seen since the monitor's last window.
    pulses: AtomicU64,
    control: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    sub_writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    publisher: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    on_disruption: Mutex<Option<DisruptionCallback>>,
}

impl Shared {
    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn record(&self, event_id: &str) {
        let Ok(mut window) = self.received.lock() else {
            return;
        };
        if window.len() == RECEIVED_WINDOW {
            window.pop_front();
        }
        window.push_back(event_id.to_string());
    }

    fn matched(&self, event_topic: &str) -> Vec<Registration> {
        let Ok(tables) = self.tables.read() else {
            return Vec::new();
        };
        let mut matched: Vec<Registration> = tables
            .exact
            .get(event_topic)
            .cloned()
            .into_iter()
            .collect();
        for pattern in topic::wildcard_search(event_topic, tables.wildcard.keys()) {
            if let Some(registration) = tables.wildcard.get(&pattern) {
                matched.push(registration.clone());
            }
        }
        matched
    }

    /// Dispatch one received frame's event, joining inline handlers.
    async fn dispatch(&self, event: Event) {
        let matched = self.matched(&event.topic);
        let mut inline = Vec::new();
        for registration in matched {
            let fut = handler::run_isolated(registration.handler, event.clone());
            match registration.mode {
                DispatchMode::Inline => inline.push(fut),
                DispatchMode::FireAndForget => {
                    tokio::spawn(fut);
                }
            }
        }
        future::join_all(inline).await;
    }

    /// Stop admitting work and release the sockets. Idempotent; never
    /// awaits the tasks that may be calling it.
    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);
        self.shutdown.notify_waiters();

        if self.connected.swap(false, Ordering::AcqRel) {
            if let Some(mut control) = self.control.lock().await.take() {
                let goodbye = ControlMessage::Disconnect {
                    client_id: self.id.clone(),
                };
                if let Ok(body) = goodbye.to_bytes() {
                    let _ = wire::write_frame(&mut control, self.id.as_bytes(), &body).await;
                }
                let _ = tokio::io::AsyncWriteExt::shutdown(&mut control).await;
            }
        }
        for slot in [&self.sub_writer, &self.publisher] {
            if let Some(mut writer) = slot.lock().await.take() {
                let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
            }
        }
        debug!(client_id = %self.id, "remote entrypoint torn down");
    }
}

/// Consumer-facing facade over a networked broker.
pub struct RemoteEntryPoint {
    shared: Arc<Shared>,
    config: HeartbeatConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    close_guard: tokio::sync::Mutex<()>,
}

impl RemoteEntryPoint {
    /// Create an unconnected entrypoint with a fresh client id.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4().to_string(),
                running: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                shutdown: Notify::new(),
                tables: RwLock::new(Tables::default()),
                received: Mutex::new(VecDeque::with_capacity(RECEIVED_WINDOW)),
                pulses: AtomicU64::new(0),
                control: tokio::sync::Mutex::new(None),
                sub_writer: tokio::sync::Mutex::new(None),
                publisher: tokio::sync::Mutex::new(None),
                on_disruption: Mutex::new(None),
            }),
            config,
            tasks: Mutex::new(Vec::new()),
            reader: Mutex::new(None),
            close_guard: tokio::sync::Mutex::new(()),
        }
    }

    /// This client's id, sent on the control channel.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Whether the entrypoint is connected to a broker.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Recently delivered event ids, oldest first.
    #[must_use]
    pub fn received(&self) -> Vec<String> {
        self.shared
            .received
            .lock()
            .map(|window| window.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether an event id was recently delivered to this entrypoint.
    #[must_use]
    pub fn has_received(&self, event_id: &str) -> bool {
        self.shared
            .received
            .lock()
            .map(|window| window.iter().any(|id| id == event_id))
            .unwrap_or(false)
    }

    /// Install a callback invoked once if broker liveness is lost.
    pub fn on_disruption(&self, callback: impl FnOnce() + Send + 'static) {
        if let Ok(mut slot) = self.shared.on_disruption.lock() {
            *slot = Some(Box::new(callback));
        }
    }

    /// Connect to the broker's port triple at `host:base_port`.
    ///
    /// Installs the reserved close/pulse handlers, subscribes for every
    /// handler registered so far, announces itself on the control channel,
    /// and starts the reactor and the heartbeat monitor.
    pub async fn connect(&self, host: &str, base_port: u16) -> Result<(), BusError> {
        if self.shared.running() {
            warn!(client_id = %self.id(), "connect on an already-connected entrypoint ignored");
            return Ok(());
        }

        let control = TcpStream::connect((host, base_port)).await?;
        let subscribe = TcpStream::connect((host, base_port + 1)).await?;
        let publish = TcpStream::connect((host, base_port + 2)).await?;

        self.install_default_handlers();

        let (_control_read, mut control_write) = control.into_split();
        let (subscribe_read, mut subscribe_write) = subscribe.into_split();
        let (_publish_read, publish_write) = publish.into_split();

        // Transport-level filters: every registered pattern plus the
        // reserved signaling topics.
        let mut prefixes: Vec<String> = {
            let tables = self.shared.tables.read().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::Other, "subscription table poisoned")
            })?;
            tables
                .exact
                .keys()
                .chain(tables.wildcard.keys())
                .map(|p| subscription_prefix(p))
                .collect()
        };
        prefixes.push(TOPIC_CLOSE.to_string());
        prefixes.push(TOPIC_PULSE.to_string());
        let subscribe_msg = ControlMessage::Subscribe { topics: prefixes };
        wire::write_frame(
            &mut subscribe_write,
            b"",
            &subscribe_msg.to_bytes().map_err(BusError::Envelope)?,
        )
        .await?;

        // CONNECT announcement, identity-framed.
        let hello = ControlMessage::Connect {
            client_id: self.id().to_string(),
        };
        wire::write_frame(
            &mut control_write,
            self.id().as_bytes(),
            &hello.to_bytes().map_err(BusError::Envelope)?,
        )
        .await?;

        *self.shared.control.lock().await = Some(control_write);
        *self.shared.sub_writer.lock().await = Some(subscribe_write);
        *self.shared.publisher.lock().await = Some(publish_write);
        self.shared.running.store(true, Ordering::Release);
        self.shared.connected.store(true, Ordering::Release);

        // Reader pump: frames flow through a channel so the reactor's
        // bounded poll never cancels a read mid-frame.
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let reader = tokio::spawn(async move {
            let mut subscribe_read = subscribe_read;
            loop {
                match wire::read_frame(&mut subscribe_read).await {
                    Ok(frame) => {
                        if frame_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        debug!(%error, "subscribe channel reader stopped");
                        break;
                    }
                }
            }
        });
        *self.reader.lock().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::Other, "task table poisoned")
        })? = Some(reader);

        let reactor = tokio::spawn(Self::reactor(Arc::clone(&self.shared), frame_rx));
        let monitor = tokio::spawn(Self::monitor(Arc::clone(&self.shared), self.config.clone()));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(reactor);
            tasks.push(monitor);
        }

        debug!(client_id = %self.id(), host, base_port, "connected to broker");
        Ok(())
    }

    /// Reserved-topic handlers: pulse counting and close logging. The
    /// shutdown reaction to a close broadcast lives in the reactor itself.
    fn install_default_handlers(&self) {
        let Ok(mut tables) = self.shared.tables.write() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        tables.exact.insert(
            TOPIC_PULSE.to_string(),
            Registration::new(
                TOPIC_PULSE,
                wrap_raw(move |_| {
                    shared.pulses.fetch_add(1, Ordering::AcqRel);
                    async { Ok(()) }
                }),
                DispatchMode::Inline,
            ),
        );
        tables.exact.entry(TOPIC_CLOSE.to_string()).or_insert_with(|| {
            Registration::new(
                TOPIC_CLOSE,
                wrap_raw(|_| async {
                    debug!("broker announced shutdown");
                    Ok(())
                }),
                DispatchMode::Inline,
            )
        });
    }

    async fn reactor(shared: Arc<Shared>, mut frames: mpsc::Receiver<(Vec<u8>, Vec<u8>)>) {
        while shared.running() {
            let frame = tokio::select! {
                frame = frames.recv() => frame,
                () = tokio::time::sleep(POLL_TIMEOUT) => continue,
                () = shared.shutdown.notified() => break,
            };
            let Some((topic_bytes, body)) = frame else {
                // Reader pump gone: broken socket. Liveness loss is the
                // heartbeat monitor's call, not ours.
                debug!("subscribe channel drained; reactor idle until close");
                break;
            };

            let frame_topic = String::from_utf8_lossy(&topic_bytes).into_owned();
            let event: Event = match serde_json::from_slice(&body) {
                Ok(event) => event,
                Err(error) => {
                    warn!(topic = %frame_topic, %error, "dropping undecodable frame");
                    continue;
                }
            };

            shared.dispatch(event).await;

            if frame_topic == TOPIC_CLOSE {
                shared.teardown().await;
                break;
            }
        }
    }

    /// Heartbeat monitor: one window per `pulse_ttl`; consecutive empty
    /// windows past `pulse_limit` mean the broker died without a closing
    /// broadcast.
    async fn monitor(shared: Arc<Shared>, config: HeartbeatConfig) {
        let mut timer = tokio::time::interval(config.pulse_ttl);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await;

        let mut misses = 0u32;
        while shared.running() {
            tokio::select! {
                _ = timer.tick() => {}
                () = shared.shutdown.notified() => break,
            }
            if !shared.running() {
                break;
            }

            let pulses = shared.pulses.swap(0, Ordering::AcqRel);
            if pulses > 0 {
                misses = 0;
                continue;
            }
            misses += 1;
            if misses > config.pulse_limit {
                warn!(client_id = %shared.id, misses, "broker liveness lost; disconnecting");
                let callback = shared.on_disruption.lock().ok().and_then(|mut cb| cb.take());
                if let Some(callback) = callback {
                    callback();
                }
                shared.teardown().await;
                break;
            }
        }
    }

    fn store(&self, registration: Registration) -> Result<(), BusError> {
        topic::validate_pattern(&registration.pattern)?;
        let Ok(mut tables) = self.shared.tables.write() else {
            return Ok(());
        };
        let table = if topic::is_wildcard(&registration.pattern) {
            &mut tables.wildcard
        } else {
            &mut tables.exact
        };
        table.insert(registration.pattern.clone(), registration);
        Ok(())
    }

    /// Push a transport-level subscription update. Local write only; no
    /// network round-trip is awaited.
    async fn subscribe_pattern(&self, pattern: &str) {
        let mut guard = self.shared.sub_writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return;
        };
        let update = ControlMessage::Subscribe {
            topics: vec![subscription_prefix(pattern)],
        };
        match update.to_bytes() {
            Ok(body) => {
                if let Err(error) = wire::write_frame(writer, b"", &body).await {
                    warn!(pattern, %error, "subscription update failed");
                }
            }
            Err(error) => warn!(pattern, %error, "subscription update failed"),
        }
    }

    /// Wrap a handler so delivery is recorded before it runs, independent
    /// of handler outcome.
    fn instrument(&self, inner: DynHandler) -> DynHandler {
        let shared = Arc::clone(&self.shared);
        Arc::new(move |event: Event| {
            shared.record(&event.id);
            inner(event)
        })
    }

    /// Register a typed handler for an exact topic.
    pub async fn on<T, F, Fut>(&self, event_topic: &str, handler: F) -> Result<(), BusError>
    where
        T: DeserializeOwned + Any + Send,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_with_mode::<T, F, Fut>(event_topic, DispatchMode::Inline, handler)
            .await
    }

    /// Register a typed handler with an explicit dispatch mode.
    pub async fn on_with_mode<T, F, Fut>(
        &self,
        event_topic: &str,
        mode: DispatchMode,
        handler: F,
    ) -> Result<(), BusError>
    where
        T: DeserializeOwned + Any + Send,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapped = self.instrument(wrap_typed::<T, _, _>(handler));
        self.store(Registration::new(event_topic, wrapped, mode))?;
        self.subscribe_pattern(event_topic).await;
        Ok(())
    }

    /// Register a raw-envelope handler (wildcard patterns included).
    pub async fn on_event<F, Fut>(&self, pattern: &str, handler: F) -> Result<(), BusError>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapped = self.instrument(wrap_raw(handler));
        self.store(Registration::new(pattern, wrapped, DispatchMode::Inline))?;
        self.subscribe_pattern(pattern).await;
        Ok(())
    }

    /// Encode `data` and publish it to the broker under `event_topic`.
    ///
    /// Returns the emitted event, or `None` (with a warning) when not
    /// connected or when the send fails - only codec trouble is an error.
    pub async fn emit<T>(&self, event_topic: &str, data: &T) -> Result<Option<Event>, BusError>
    where
        T: Serialize + Any,
    {
        let payload = codec::encode(data)?;
        self.send(Event::new(event_topic, payload)).await
    }

    /// Publish with a caller-supplied event id (bridging keeps the original
    /// id so consumers can deduplicate across hops).
    pub async fn emit_with_id<T>(
        &self,
        event_topic: &str,
        data: &T,
        id: String,
    ) -> Result<Option<Event>, BusError>
    where
        T: Serialize + Any,
    {
        let payload = codec::encode(data)?;
        self.send(Event::with_id(event_topic, payload, id)).await
    }

    /// Publish a payload-free event.
    pub async fn emit_empty(&self, event_topic: &str) -> Result<Option<Event>, BusError> {
        self.send(Event::signal(event_topic)).await
    }

    /// Re-publish an already-encoded event verbatim (bridge path).
    pub(crate) async fn relay(&self, event: &Event) -> Result<Option<Event>, BusError> {
        self.send(event.clone()).await
    }

    async fn send(&self, event: Event) -> Result<Option<Event>, BusError> {
        if !self.connected() {
            warn!(topic = %event.topic, "emit while disconnected dropped");
            return Ok(None);
        }
        let mut guard = self.shared.publisher.lock().await;
        let Some(writer) = guard.as_mut() else {
            warn!(topic = %event.topic, "emit while disconnected dropped");
            return Ok(None);
        };
        match wire::write_event(writer, &event).await {
            Ok(()) => Ok(Some(event)),
            Err(error) => {
                warn!(topic = %event.topic, %error, "publish send failed");
                Ok(None)
            }
        }
    }

    /// Disconnect and release all resources.
    ///
    /// Idempotent and safe to call from overlapping callers: the first
    /// caller performs the teardown, later callers find it done.
    pub async fn close(&self) {
        let _guard = self.close_guard.lock().await;
        // Stop admitting new work, let in-flight iterations finish, then
        // release the sockets.
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
        self.shared.teardown().await;
        // The reader pump may be parked on a socket the peer never closes.
        let reader = self.reader.lock().ok().and_then(|mut slot| slot.take());
        if let Some(reader) = reader {
            reader.abort();
            let _ = reader.await;
        }
    }
}
