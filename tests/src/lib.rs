//! # Meshbus Test Suite
//!
//! Unified integration crate exercising both event planes together:
//!
//! ```text
//! tests/src/integration/
//! ├── local_flows.rs        # Multi-entrypoint choreography on one LocalBus
//! ├── distributed_flows.rs  # Broker + remote entrypoints over TCP
//! ├── bridging.rs           # forward/deforward across the plane boundary
//! └── heartbeat.rs          # Liveness pulses and disruption detection
//! ```
//!
//! Per-module unit tests live next to the code in the `meshbus` crate; this
//! crate covers the flows that only exist when the pieces are wired up.
//!
//! ```bash
//! cargo test -p meshbus-tests
//! cargo test -p meshbus-tests integration::bridging::
//! ```

#![allow(dead_code)]

pub mod integration;
