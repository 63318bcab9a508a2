//! # Handler Registry
//!
//! Lets code declare handlers against named namespaces before any bus
//! exists. The registry is an explicit value constructed by the application
//! and passed by reference into
//! [`LocalEntryPoint::use_registry`](crate::LocalEntryPoint::use_registry) -
//! namespaces are plain map keys, not ambient global state.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;

use serde::de::DeserializeOwned;

use crate::error::BusError;
use crate::event::Event;
use crate::handler::{wrap_raw, wrap_typed, DispatchMode, DynHandler};

/// A declared handler waiting to be bound to an entrypoint.
#[derive(Clone)]
pub struct HandlerSpec {
    /// Exact topic or trailing-wildcard pattern.
    pub topic: String,
    /// The erased callback (payload decoding already baked in).
    pub handler: DynHandler,
    /// Inline or detached dispatch.
    pub mode: DispatchMode,
}

/// Namespaced collection of handler declarations.
///
/// Within a namespace, declarations are keyed by topic and the last
/// declaration for a topic wins.
#[derive(Default)]
pub struct Registry {
    namespaces: HashMap<String, HashMap<String, HandlerSpec>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a typed handler under a namespace.
    pub fn on<T, F, Fut>(&mut self, namespace: &str, topic: &str, handler: F)
    where
        T: DeserializeOwned + Any + Send,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert(namespace, topic, wrap_typed::<T, _, _>(handler), DispatchMode::Inline);
    }

    /// Declare a raw-envelope handler under a namespace.
    pub fn on_event<F, Fut>(&mut self, namespace: &str, topic: &str, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert(namespace, topic, wrap_raw(handler), DispatchMode::Inline);
    }

    fn insert(&mut self, namespace: &str, topic: &str, handler: DynHandler, mode: DispatchMode) {
        self.namespaces.entry(namespace.to_string()).or_default().insert(
            topic.to_string(),
            HandlerSpec {
                topic: topic.to_string(),
                handler,
                mode,
            },
        );
    }

    /// Hand out the declarations for a namespace.
    pub fn get_handlers(&self, namespace: &str) -> Result<Vec<HandlerSpec>, BusError> {
        self.namespaces
            .get(namespace)
            .map(|ns| ns.values().cloned().collect())
            .ok_or_else(|| BusError::UnknownNamespace(namespace.to_string()))
    }
}
