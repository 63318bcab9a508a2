//! # Integration Flows
//!
//! Each module binds real sockets on loopback; port triples are unique per
//! test so the suite can run in parallel.

use std::time::Duration;

pub mod bridging;
pub mod distributed_flows;
pub mod local_flows;

/// Upper bound for any "eventually" assertion in this suite.
pub const SETTLE: Duration = Duration::from_secs(5);

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_until<F>(condition: F, deadline: Duration) -> bool
where
    F: Fn() -> bool,
{
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Install a test-friendly subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("meshbus=debug")),
        )
        .with_test_writer()
        .try_init();
}
