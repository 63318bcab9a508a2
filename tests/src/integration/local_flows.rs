//! # Local Choreography
//!
//! Multi-entrypoint flows on a single in-process bus: event chains,
//! wildcard aggregation, registry-driven wiring, and close-signal cleanup.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};

    use meshbus::{DispatchMode, LocalBus, LocalEntryPoint, Registry};

    use crate::integration::{init_tracing, wait_until, SETTLE};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Order {
        item: String,
        quantity: u32,
    }

    /// A consumer reacts to a producer's event by emitting a derived event,
    /// which a third entrypoint picks up. Chained re-emission is the basic
    /// choreography primitive.
    #[tokio::test]
    async fn test_event_chain_across_entrypoints() {
        init_tracing();
        let bus = LocalBus::new();

        let producer = LocalEntryPoint::new();
        let validator = LocalEntryPoint::new();
        let auditor = LocalEntryPoint::new();

        producer.connect(&bus).unwrap();
        auditor
            .on::<Order, _, _>("orders.validated", |order| async move {
                assert_eq!(order.item, "widget");
                Ok(())
            })
            .unwrap();
        auditor.connect(&bus).unwrap();

        // The validator re-emits on its own entrypoint; handlers capture an
        // Arc'd entrypoint for that.
        let relay = Arc::new(LocalEntryPoint::new());
        relay.connect(&bus).unwrap();
        let relay_handle = Arc::clone(&relay);
        validator
            .on::<Order, _, _>("orders.created", move |order| {
                let relay = Arc::clone(&relay_handle);
                async move {
                    relay.emit("orders.validated", &order).await?;
                    Ok(())
                }
            })
            .unwrap();
        validator.connect(&bus).unwrap();

        producer
            .emit(
                "orders.created",
                &Order {
                    item: "widget".into(),
                    quantity: 3,
                },
            )
            .await
            .unwrap()
            .expect("connected");

        assert!(
            wait_until(|| auditor.received().len() == 1, SETTLE).await,
            "derived event should reach the auditor"
        );
        bus.close().await;
    }

    /// A wildcard subscriber sees every event under its prefix while exact
    /// subscribers see only their own topic.
    #[tokio::test]
    async fn test_wildcard_aggregation() {
        init_tracing();
        let bus = LocalBus::new();

        let all_orders = Arc::new(AtomicUsize::new(0));
        let created_only = Arc::new(AtomicUsize::new(0));

        let aggregator = LocalEntryPoint::new();
        let counter = Arc::clone(&all_orders);
        aggregator
            .on_event("orders.*", move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        aggregator.connect(&bus).unwrap();

        let narrow = LocalEntryPoint::new();
        let counter = Arc::clone(&created_only);
        narrow
            .on_event("orders.created", move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        narrow.connect(&bus).unwrap();

        let producer = LocalEntryPoint::new();
        producer.connect(&bus).unwrap();
        producer.emit_empty("orders.created").await.unwrap();
        producer.emit_empty("orders.updated").await.unwrap();
        producer.emit_empty("orders.cancelled").await.unwrap();
        producer.emit_empty("inventory.low").await.unwrap();

        assert_eq!(all_orders.load(Ordering::SeqCst), 3);
        assert_eq!(created_only.load(Ordering::SeqCst), 1);
        bus.close().await;
    }

    /// Fire-and-forget handlers run detached from the publish call, so a
    /// slow consumer never stalls the producer.
    #[tokio::test]
    async fn test_fire_and_forget_does_not_block_publish() {
        init_tracing();
        let bus = LocalBus::new();

        let finished = Arc::new(AtomicBool::new(false));
        let slow = LocalEntryPoint::new();
        let flag = Arc::clone(&finished);
        slow.on_event_with_mode("jobs.run", DispatchMode::FireAndForget, move |_| {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
        slow.connect(&bus).unwrap();

        let producer = LocalEntryPoint::new();
        producer.connect(&bus).unwrap();

        let start = tokio::time::Instant::now();
        producer.emit_empty("jobs.run").await.unwrap();
        assert!(
            start.elapsed() < std::time::Duration::from_millis(100),
            "publish should return before the detached handler finishes"
        );
        assert!(
            wait_until(|| finished.load(Ordering::SeqCst), SETTLE).await,
            "detached handler should still complete"
        );
        bus.close().await;
    }

    /// A registry namespace wires the same handler set onto several
    /// entrypoints.
    #[tokio::test]
    async fn test_registry_namespace_shared_by_entrypoints() {
        init_tracing();
        let hits = Arc::new(AtomicUsize::new(0));

        let mut registry = Registry::new();
        let counter = Arc::clone(&hits);
        registry.on::<Order, _, _>("workers", "orders.created", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let bus = LocalBus::new();
        let worker_a = LocalEntryPoint::new();
        let worker_b = LocalEntryPoint::new();
        worker_a.use_registry(&registry, "workers").unwrap();
        worker_b.use_registry(&registry, "workers").unwrap();
        worker_a.connect(&bus).unwrap();
        worker_b.connect(&bus).unwrap();

        let producer = LocalEntryPoint::new();
        producer.connect(&bus).unwrap();
        producer
            .emit(
                "orders.created",
                &Order {
                    item: "widget".into(),
                    quantity: 1,
                },
            )
            .await
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        bus.close().await;
    }

    /// Closing the bus runs close-signal handlers before traffic stops.
    #[tokio::test]
    async fn test_close_signal_runs_cleanup_handlers() {
        init_tracing();
        let bus = LocalBus::new();
        let cleaned = Arc::new(AtomicBool::new(false));

        let entry = LocalEntryPoint::new();
        let flag = Arc::clone(&cleaned);
        entry
            .on_event(meshbus::TOPIC_CLOSE, move |_| {
                let flag = Arc::clone(&flag);
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        entry.connect(&bus).unwrap();

        bus.close().await;
        assert!(cleaned.load(Ordering::SeqCst));
        assert!(!bus.running());

        // Traffic after close is dropped.
        let producer = LocalEntryPoint::new();
        producer.connect(&bus).unwrap();
        producer.emit_empty("late").await.unwrap();
    }
}
