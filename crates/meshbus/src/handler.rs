//! # Handler Registrations
//!
//! Subscriber callbacks are stored type-erased: a typed callback is wrapped
//! into a closure that decodes the event payload as the declared type before
//! invoking it. Whether a handler is awaited inline with its siblings or
//! detached is declared at registration time through [`DispatchMode`] -
//! never inferred from the callback at runtime.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::codec;
use crate::event::Event;

/// Future returned by an invoked handler.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Type-erased subscriber callback.
pub type DynHandler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// How a matched handler participates in a publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Joined with all sibling inline dispatches before publish returns.
    #[default]
    Inline,
    /// Runs detached; publish does not wait on it.
    FireAndForget,
}

/// A handler bound to a topic pattern.
///
/// Buses key registrations by `(entrypoint_id, pattern)`; re-registering
/// the same key replaces the prior registration.
#[derive(Clone)]
pub struct Registration {
    /// Exact topic or trailing-wildcard pattern.
    pub pattern: String,
    /// The erased callback.
    pub handler: DynHandler,
    /// Inline or detached dispatch.
    pub mode: DispatchMode,
}

impl Registration {
    /// Create a registration.
    #[must_use]
    pub fn new(pattern: impl Into<String>, handler: DynHandler, mode: DispatchMode) -> Self {
        Self {
            pattern: pattern.into(),
            handler,
            mode,
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("pattern", &self.pattern)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Wrap a typed callback: the payload is decoded as `T` before invocation.
///
/// A decode failure becomes the handler's own error and is absorbed at the
/// dispatch boundary like any other handler failure.
pub fn wrap_typed<T, F, Fut>(handler: F) -> DynHandler
where
    T: DeserializeOwned + Any + Send,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event: Event| match codec::decode::<T>(event.payload.as_deref()) {
        Ok(value) => handler(value).boxed(),
        Err(e) => future::ready(Err(anyhow::Error::new(e))).boxed(),
    })
}

/// Wrap a callback that receives the whole envelope.
///
/// Wildcard and reserved-topic handlers cannot declare a payload type, so
/// they get the raw [`Event`].
pub fn wrap_raw<F, Fut>(handler: F) -> DynHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event: Event| handler(event).boxed())
}

/// Run a handler with failure isolation.
///
/// Any error is logged here and goes no further: not to the publisher, not
/// to sibling handlers, not to the reactor loop.
pub(crate) async fn run_isolated(handler: DynHandler, event: Event) {
    let topic = event.topic.clone();
    let id = event.id.clone();
    if let Err(error) = handler(event).await {
        warn!(topic = %topic, event_id = %id, %error, "handler failed");
    }
}
