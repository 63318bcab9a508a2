//! # Timing Configuration
//!
//! Knobs for the broker reactor and the client-side liveness monitor.

use std::time::Duration;

/// Broker timing configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Bounded reactor poll timeout. An input window this long with no
    /// traffic counts as an empty poll and sets the idle flag that
    /// [`Broker::flush`](crate::Broker::flush) waits on.
    pub poll_timeout: Duration,

    /// Interval between reserved heartbeat pulses on the broadcast channel.
    pub heartbeat_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

impl BrokerConfig {
    /// Testing config with faster timing.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            poll_timeout: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(250),
        }
    }
}

/// Client-side liveness monitor configuration.
///
/// The monitor fires every `pulse_ttl`; a window with no heartbeat pulse
/// from the broker counts as a miss, and more than `pulse_limit`
/// consecutive misses marks the connection disrupted.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Check interval.
    pub pulse_ttl: Duration,

    /// Tolerated consecutive empty windows.
    pub pulse_limit: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            pulse_ttl: Duration::from_secs(2),
            pulse_limit: 3,
        }
    }
}

impl HeartbeatConfig {
    /// Testing config with faster timing.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            pulse_ttl: Duration::from_millis(500),
            pulse_limit: 3,
        }
    }
}
