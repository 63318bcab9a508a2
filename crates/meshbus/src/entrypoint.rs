//! # Local Entrypoint
//!
//! Per-consumer facade over a [`LocalBus`]. The entrypoint owns its id, its
//! pending registrations, and a bounded window of recently delivered event
//! ids; the bus keeps the authoritative routing tables.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::bus::LocalBus;
use crate::codec;
use crate::error::BusError;
use crate::event::Event;
use crate::handler::{wrap_raw, wrap_typed, DispatchMode, DynHandler, Registration};
use crate::registry::Registry;
use crate::RECEIVED_WINDOW;

/// Record an event id in the bounded received window.
fn record(received: &Mutex<VecDeque<String>>, id: &str) {
    let Ok(mut window) = received.lock() else {
        return;
    };
    if window.len() == RECEIVED_WINDOW {
        window.pop_front();
    }
    window.push_back(id.to_string());
}

/// Consumer-facing facade binding handlers to a local bus.
pub struct LocalEntryPoint {
    id: String,
    bus: RwLock<Option<Arc<LocalBus>>>,
    registrations: RwLock<HashMap<String, Registration>>,
    received: Arc<Mutex<VecDeque<String>>>,
}

impl LocalEntryPoint {
    /// Create an unconnected entrypoint with a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            bus: RwLock::new(None),
            registrations: RwLock::new(HashMap::new()),
            received: Arc::new(Mutex::new(VecDeque::with_capacity(RECEIVED_WINDOW))),
        }
    }

    /// This entrypoint's id (the bus keys its subscriptions by it).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Recently delivered event ids, oldest first.
    #[must_use]
    pub fn received(&self) -> Vec<String> {
        self.received
            .lock()
            .map(|window| window.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether an event id was recently delivered to this entrypoint.
    #[must_use]
    pub fn has_received(&self, event_id: &str) -> bool {
        self.received
            .lock()
            .map(|window| window.iter().any(|id| id == event_id))
            .unwrap_or(false)
    }

    /// Wrap a handler so delivery is recorded before it runs.
    ///
    /// Bookkeeping is independent of handler outcome: a failing handler
    /// still counts as delivered.
    fn instrument(&self, inner: DynHandler) -> DynHandler {
        let received = Arc::clone(&self.received);
        Arc::new(move |event: Event| {
            record(&received, &event.id);
            inner(event)
        })
    }

    fn store_and_sync(&self, registration: Registration) -> Result<(), BusError> {
        if let Ok(mut registrations) = self.registrations.write() {
            registrations.insert(registration.pattern.clone(), registration.clone());
        }
        let bus = self.bus.read().ok().and_then(|b| b.clone());
        if let Some(bus) = bus {
            bus.register(&self.id, registration)?;
        }
        Ok(())
    }

    /// Attach to a bus, registering every handler declared so far.
    pub fn connect(&self, bus: &Arc<LocalBus>) -> Result<(), BusError> {
        if let Ok(mut slot) = self.bus.write() {
            *slot = Some(Arc::clone(bus));
        }
        let registrations: Vec<Registration> = self
            .registrations
            .read()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();
        for registration in registrations {
            bus.register(&self.id, registration)?;
        }
        Ok(())
    }

    /// Register a typed handler for an exact topic.
    pub fn on<T, F, Fut>(&self, event_topic: &str, handler: F) -> Result<(), BusError>
    where
        T: DeserializeOwned + Any + Send,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_with_mode::<T, F, Fut>(event_topic, DispatchMode::Inline, handler)
    }

    /// Register a typed handler with an explicit dispatch mode.
    pub fn on_with_mode<T, F, Fut>(
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
        self.store_and_sync(Registration::new(event_topic, wrapped, mode))
    }

    /// Register a raw-envelope handler (wildcard patterns included).
    pub fn on_event<F, Fut>(&self, pattern: &str, handler: F) -> Result<(), BusError>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_event_with_mode(pattern, DispatchMode::Inline, handler)
    }

    /// Register a raw-envelope handler with an explicit dispatch mode.
    pub fn on_event_with_mode<F, Fut>(
        &self,
        pattern: &str,
        mode: DispatchMode,
        handler: F,
    ) -> Result<(), BusError>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapped = self.instrument(wrap_raw(handler));
        self.store_and_sync(Registration::new(pattern, wrapped, mode))
    }

    /// Bulk-register every handler declared under a registry namespace.
    pub fn use_registry(&self, registry: &Registry, namespace: &str) -> Result<(), BusError> {
        for spec in registry.get_handlers(namespace)? {
            let wrapped = self.instrument(spec.handler);
            self.store_and_sync(Registration::new(spec.topic, wrapped, spec.mode))?;
        }
        Ok(())
    }

    /// Encode `data` and publish it under `event_topic`.
    ///
    /// Returns the emitted event, or `None` (with a warning) when the
    /// entrypoint is not connected - misuse is not fatal. Codec failures
    /// are returned to the caller as the "not sent" signal.
    pub async fn emit<T>(&self, event_topic: &str, data: &T) -> Result<Option<Event>, BusError>
    where
        T: Serialize + Any,
    {
        let payload = codec::encode(data)?;
        self.emit_encoded(Event::new(event_topic, payload)).await
    }

    /// Publish a payload-free event.
    pub async fn emit_empty(&self, event_topic: &str) -> Result<Option<Event>, BusError> {
        self.emit_encoded(Event::signal(event_topic)).await
    }

    async fn emit_encoded(&self, event: Event) -> Result<Option<Event>, BusError> {
        let bus = self.bus.read().ok().and_then(|b| b.clone());
        let Some(bus) = bus else {
            warn!(topic = %event.topic, "emit before connect dropped");
            return Ok(None);
        };
        bus.publish(event.clone()).await;
        Ok(Some(event))
    }

    /// Detach from the bus, removing every owned registration.
    pub async fn close(&self) {
        let bus = self.bus.write().ok().and_then(|mut slot| slot.take());
        if let Some(bus) = bus {
            bus.unregister(&self.id);
        }
    }
}

impl Default for LocalEntryPoint {
    fn default() -> Self {
        Self::new()
    }
}
