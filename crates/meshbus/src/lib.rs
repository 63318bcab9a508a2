//! # Meshbus - Topic-Based Event Distribution
//!
//! Two cooperating planes for typed event exchange:
//!
//! - **Local plane:** [`LocalBus`] routes events between [`LocalEntryPoint`]s
//!   living in the same process.
//! - **Networked plane:** a [`Broker`] relays events between
//!   [`RemoteEntryPoint`]s over three TCP channels (control, broadcast,
//!   collect).
//!
//! The planes bridge into each other: a `LocalBus` can `forward` a filtered
//! topic set onto a remote broker, and a `Broker` can `forward` incoming
//! traffic into a `LocalBus`, producing arbitrary bus topologies from the
//! same two primitives.
//!
//! ## Topics
//!
//! Topics are dot-delimited strings (`"orders.created"`). A subscription
//! pattern may end in a single trailing `*` segment, which matches any
//! remaining segments (`"orders.*"` matches `"orders.created.v2"`).
//!
//! ## Delivery model
//!
//! Best-effort, at-most-once per hop. Handler failures are isolated: an
//! error inside one subscriber's callback is logged at the dispatch boundary
//! and never reaches the publisher or sibling handlers. Liveness loss of a
//! broker is detected through a reserved heartbeat topic rather than through
//! delivery errors.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod broker;
pub mod bus;
pub mod codec;
pub mod config;
pub mod entrypoint;
pub mod error;
pub mod event;
pub mod handler;
pub mod registry;
pub mod remote;
pub mod topic;
pub mod wire;

// Re-export main types
pub use broker::Broker;
pub use bus::LocalBus;
pub use config::{BrokerConfig, HeartbeatConfig};
pub use entrypoint::LocalEntryPoint;
pub use error::{BusError, CodecError};
pub use event::Event;
pub use handler::{DispatchMode, DynHandler, Registration};
pub use registry::Registry;
pub use remote::RemoteEntryPoint;

/// Reserved topic broadcast by a bus or broker before it shuts down.
pub const TOPIC_CLOSE: &str = "meshbus.eventbus.close";

/// Reserved topic pulsed periodically by a broker for liveness detection.
pub const TOPIC_PULSE: &str = "meshbus.eventbus.pulse";

/// Topics excluded from wildcard routing and bridging.
///
/// Internal signaling must never propagate as user data, even to a `*`
/// subscriber, and the exclusion applies independently at every bridge hop.
pub const RESERVED_TOPICS: [&str; 2] = [TOPIC_CLOSE, TOPIC_PULSE];

/// How many recently-delivered event ids an entrypoint remembers.
pub const RECEIVED_WINDOW: usize = 10;
