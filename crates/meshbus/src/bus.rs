//! # Local Bus
//!
//! In-process router. The bus owns the subscription tables and is their
//! single source of truth; entrypoints hold only their own id and a handle
//! to the bus. Routing is the union of an exact-topic key lookup and the
//! wildcard matcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use futures::future;
use tracing::{debug, warn};

use crate::config::HeartbeatConfig;
use crate::error::BusError;
use crate::event::Event;
use crate::handler::{self, DispatchMode, DynHandler, Registration};
use crate::remote::RemoteEntryPoint;
use crate::topic::{self, WILDCARD};
use crate::TOPIC_CLOSE;

/// Subscription tables, keyed `pattern -> entrypoint_id -> registration`.
#[derive(Default)]
struct Tables {
    exact: HashMap<String, HashMap<String, Registration>>,
    wildcard: HashMap<String, HashMap<String, Registration>>,
}

/// In-process event router.
pub struct LocalBus {
    tables: RwLock<Tables>,
    running: AtomicBool,
    /// Relay entrypoints created by `forward`, keyed by `host:port`.
    forwards: tokio::sync::Mutex<HashMap<String, Arc<RemoteEntryPoint>>>,
    close_guard: tokio::sync::Mutex<()>,
}

impl LocalBus {
    /// Create a new bus.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tables: RwLock::new(Tables::default()),
            running: AtomicBool::new(true),
            forwards: tokio::sync::Mutex::new(HashMap::new()),
            close_guard: tokio::sync::Mutex::new(()),
        })
    }

    /// Whether the bus still accepts traffic.
    #[must_use]
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Store a registration owned by an entrypoint.
    ///
    /// Routes into the exact or wildcard table based on the pattern.
    /// Re-registering the same `(entrypoint_id, pattern)` key replaces the
    /// prior registration.
    pub fn register(&self, entrypoint_id: &str, registration: Registration) -> Result<(), BusError> {
        topic::validate_pattern(&registration.pattern)?;
        let Ok(mut tables) = self.tables.write() else {
            return Ok(());
        };
        let table = if topic::is_wildcard(&registration.pattern) {
            &mut tables.wildcard
        } else {
            &mut tables.exact
        };
        table
            .entry(registration.pattern.clone())
            .or_default()
            .insert(entrypoint_id.to_string(), registration);
        Ok(())
    }

    /// Remove every registration owned by an entrypoint.
    pub fn unregister(&self, entrypoint_id: &str) {
        let Ok(mut tables) = self.tables.write() else {
            return;
        };
        let tables = &mut *tables;
        for table in [&mut tables.exact, &mut tables.wildcard] {
            table.retain(|_, subs| {
                subs.remove(entrypoint_id);
                !subs.is_empty()
            });
        }
    }

    /// Registrations matching a topic: exact hits plus wildcard hits.
    fn matched(&self, event_topic: &str) -> Vec<Registration> {
        let Ok(tables) = self.tables.read() else {
            return Vec::new();
        };
        let mut matched: Vec<Registration> = tables
            .exact
            .get(event_topic)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default();
        for pattern in topic::wildcard_search(event_topic, tables.wildcard.keys()) {
            if let Some(subs) = tables.wildcard.get(&pattern) {
                matched.extend(subs.values().cloned());
            }
        }
        matched
    }

    /// Route an event to every matching registration.
    ///
    /// Inline handlers are started together and joined before this call
    /// returns; fire-and-forget handlers run detached. Handler failures are
    /// logged at the dispatch boundary and reach neither the publisher nor
    /// sibling handlers.
    ///
    /// Returns the number of matched registrations.
    pub async fn publish(&self, event: Event) -> usize {
        if !self.running() {
            warn!(topic = %event.topic, "publish on closed bus dropped");
            return 0;
        }

        let matched = self.matched(&event.topic);
        debug!(
            topic = %event.topic,
            event_id = %event.id,
            receivers = matched.len(),
            "event published"
        );

        let mut inline = Vec::new();
        for registration in matched.iter() {
            let fut = handler::run_isolated(registration.handler.clone(), event.clone());
            match registration.mode {
                DispatchMode::Inline => inline.push(fut),
                DispatchMode::FireAndForget => {
                    tokio::spawn(fut);
                }
            }
        }
        future::join_all(inline).await;
        matched.len()
    }

    /// Relay a filtered topic set onto a remote broker.
    ///
    /// Creates a remote entrypoint connected to `host:base_port` and
    /// registers one relay per filter (default: everything) under the
    /// entrypoint id `host:base_port`. Relayed events keep their original
    /// id, so consumers across the bridge can deduplicate.
    pub async fn forward(
        &self,
        host: &str,
        base_port: u16,
        topic_filters: Option<Vec<String>>,
    ) -> Result<(), BusError> {
        let remote = RemoteEntryPoint::new(HeartbeatConfig::default());
        remote.connect(host, base_port).await?;
        let remote = Arc::new(remote);

        let key = format!("{host}:{base_port}");
        let filters = topic_filters.unwrap_or_else(|| vec![WILDCARD.to_string()]);
        for pattern in filters {
            let relay = Arc::clone(&remote);
            let handler: DynHandler = Arc::new(move |event: Event| {
                let relay = Arc::clone(&relay);
                Box::pin(async move {
                    relay.relay(&event).await?;
                    anyhow::Ok(())
                })
            });
            let registration = Registration::new(pattern, handler, DispatchMode::Inline);
            if let Err(error) = self.register(&key, registration) {
                // Partial failure leaves no trace: drop the filters
                // registered so far and release the connected relay.
                self.unregister(&key);
                remote.close().await;
                return Err(error);
            }
        }

        self.forwards.lock().await.insert(key, remote);
        Ok(())
    }

    /// Remove a forwarding rule created by [`forward`](Self::forward).
    pub async fn deforward(&self, host: &str, base_port: u16) {
        let key = format!("{host}:{base_port}");
        self.unregister(&key);
        if let Some(remote) = self.forwards.lock().await.remove(&key) {
            remote.close().await;
        }
    }

    /// Shut the bus down.
    ///
    /// Emits the reserved close signal first so cleanup-on-close handlers
    /// run, then marks the bus non-operational and closes owned relays.
    /// Idempotent and safe to call from overlapping callers.
    pub async fn close(&self) {
        let _guard = self.close_guard.lock().await;
        if !self.running() {
            return;
        }
        self.publish(Event::signal(TOPIC_CLOSE)).await;
        self.running.store(false, Ordering::Release);

        let mut forwards = self.forwards.lock().await;
        for (_, remote) in forwards.drain() {
            remote.close().await;
        }
    }
}
