//! # Distributed Flows
//!
//! Broker plus remote entrypoints over real loopback sockets: typed
//! delivery, wildcard filters, late subscriptions, control bookkeeping,
//! and close propagation.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};

    use meshbus::{Broker, BrokerConfig, HeartbeatConfig, RemoteEntryPoint};

    use crate::integration::{init_tracing, wait_until, SETTLE};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Reading {
        sensor: String,
        value: f64,
    }

    async fn broker_on(port: u16) -> Broker {
        Broker::bind("127.0.0.1", port, BrokerConfig::testing())
            .await
            .expect("port triple free")
    }

    #[tokio::test]
    async fn test_typed_delivery_across_the_network() {
        init_tracing();
        let broker = broker_on(19000).await;

        let consumer = RemoteEntryPoint::new(HeartbeatConfig::testing());
        consumer
            .on::<Reading, _, _>("sensors.temp", |reading| async move {
                assert_eq!(reading.sensor, "t-1");
                assert!((reading.value - 21.5).abs() < f64::EPSILON);
                Ok(())
            })
            .await
            .unwrap();
        consumer.connect("127.0.0.1", 19000).await.unwrap();
        broker.flush().await;

        let producer = RemoteEntryPoint::new(HeartbeatConfig::testing());
        producer.connect("127.0.0.1", 19000).await.unwrap();

        let event = producer
            .emit(
                "sensors.temp",
                &Reading {
                    sensor: "t-1".into(),
                    value: 21.5,
                },
            )
            .await
            .unwrap()
            .expect("connected");

        assert!(
            wait_until(|| consumer.has_received(&event.id), SETTLE).await,
            "event should cross the broker"
        );

        producer.close().await;
        consumer.close().await;
        broker.close().await;
    }

    #[tokio::test]
    async fn test_wildcard_subscription_over_the_network() {
        init_tracing();
        let broker = broker_on(19010).await;

        let hits = Arc::new(AtomicUsize::new(0));
        let consumer = RemoteEntryPoint::new(HeartbeatConfig::testing());
        let counter = Arc::clone(&hits);
        consumer
            .on_event("sensors.*", move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();
        consumer.connect("127.0.0.1", 19010).await.unwrap();
        broker.flush().await;

        let producer = RemoteEntryPoint::new(HeartbeatConfig::testing());
        producer.connect("127.0.0.1", 19010).await.unwrap();
        producer.emit_empty("sensors.temp").await.unwrap();
        producer.emit_empty("sensors.humidity").await.unwrap();
        producer.emit_empty("actuators.valve").await.unwrap();

        broker.flush().await;
        assert!(
            wait_until(|| hits.load(Ordering::SeqCst) == 2, SETTLE).await,
            "only the sensors.* traffic should arrive"
        );

        producer.close().await;
        consumer.close().await;
        broker.close().await;
    }

    /// Handlers registered after `connect` push a live subscription update
    /// and start receiving without a reconnect.
    #[tokio::test]
    async fn test_late_subscription_update() {
        init_tracing();
        let broker = broker_on(19020).await;

        let consumer = RemoteEntryPoint::new(HeartbeatConfig::testing());
        consumer.connect("127.0.0.1", 19020).await.unwrap();
        consumer
            .on_event("late.topic", |_| async { Ok(()) })
            .await
            .unwrap();

        // Give the broker a beat to apply the filter update.
        broker.flush().await;

        let producer = RemoteEntryPoint::new(HeartbeatConfig::testing());
        producer.connect("127.0.0.1", 19020).await.unwrap();
        let event = producer
            .emit_empty("late.topic")
            .await
            .unwrap()
            .expect("connected");

        assert!(wait_until(|| consumer.has_received(&event.id), SETTLE).await);

        producer.close().await;
        consumer.close().await;
        broker.close().await;
    }

    /// The control channel tracks announced identities through their
    /// connect and disconnect lifecycle.
    #[tokio::test]
    async fn test_control_channel_bookkeeping() {
        init_tracing();
        let broker = broker_on(19030).await;

        let client = RemoteEntryPoint::new(HeartbeatConfig::testing());
        client.connect("127.0.0.1", 19030).await.unwrap();
        let client_id = client.id().to_string();

        assert!(
            wait_until(|| broker.clients().get(&client_id) == Some(&true), SETTLE).await,
            "connect announcement should be recorded"
        );

        client.close().await;
        assert!(
            wait_until(|| broker.clients().get(&client_id) == Some(&false), SETTLE).await,
            "disconnect announcement should be recorded"
        );
        broker.close().await;
    }

    /// A graceful broker close broadcasts the reserved close event; clients
    /// shut themselves down in response.
    #[tokio::test]
    async fn test_broker_close_propagates_to_clients() {
        init_tracing();
        let broker = broker_on(19040).await;

        let client = RemoteEntryPoint::new(HeartbeatConfig::testing());
        client
            .on_event("anything", |_| async { Ok(()) })
            .await
            .unwrap();
        client.connect("127.0.0.1", 19040).await.unwrap();
        assert!(client.connected());

        broker.close().await;
        assert!(
            wait_until(|| !client.connected(), SETTLE).await,
            "close broadcast should disconnect the client"
        );
        client.close().await;
    }

    /// Emitting on a closed connection is reported as not-sent, not a
    /// panic or an error.
    #[tokio::test]
    async fn test_emit_after_close_is_dropped() {
        init_tracing();
        let broker = broker_on(19050).await;

        let client = RemoteEntryPoint::new(HeartbeatConfig::testing());
        client.connect("127.0.0.1", 19050).await.unwrap();
        client.close().await;

        let sent = client.emit_empty("late").await.unwrap();
        assert!(sent.is_none());
        broker.close().await;
    }
}
